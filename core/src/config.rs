use directories::BaseDirs;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;
use url::Url;

/// Backend the client talks to when nothing else is configured.
pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000";

/// Resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: Url,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            // The literal is known-good.
            base_url: Url::parse(DEFAULT_BASE_URL).expect("default base url"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("configuration invalid: {0}")]
    Invalid(String),
}

impl ClientConfig {
    /// Resolve the configuration: `SMARTOPS_SERVER` wins, then the first
    /// `smartops.yaml` found among the usual locations, then the default.
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(value) = std::env::var("SMARTOPS_SERVER") {
            let base_url = Url::parse(value.trim())
                .map_err(|err| ConfigError::Invalid(format!("SMARTOPS_SERVER: {err}")))?;
            return Ok(Self { base_url });
        }
        let Some(path) = locate_config_file() else {
            return Ok(Self::default());
        };
        let contents = fs::read_to_string(&path).map_err(|err| {
            ConfigError::Invalid(format!("failed to read {}: {err}", path.display()))
        })?;
        let file: ConfigFile = serde_yaml::from_str(&contents)
            .map_err(|err| ConfigError::Invalid(format!("invalid smartops.yaml: {err}")))?;
        resolve(file)
    }
}

fn resolve(file: ConfigFile) -> Result<ClientConfig, ConfigError> {
    let Some(server) = file.server else {
        return Ok(ClientConfig::default());
    };
    let raw = server
        .base_url
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_owned());
    let base_url = Url::parse(raw.trim())
        .map_err(|err| ConfigError::Invalid(format!("invalid base_url '{raw}': {err}")))?;
    Ok(ClientConfig { base_url })
}

fn locate_config_file() -> Option<PathBuf> {
    config_candidates().into_iter().find(|path| path.exists())
}

fn config_candidates() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(base) = BaseDirs::new() {
        let config_dir = base.config_dir().join("smartops");
        paths.push(config_dir.join("smartops.yaml"));
        paths.push(config_dir.join("smartops.yml"));
        let home_dir = base.home_dir();
        paths.push(home_dir.join(".smartops").join("smartops.yaml"));
        paths.push(home_dir.join(".smartops").join("smartops.yml"));
    } else {
        paths.push(PathBuf::from("smartops.yaml"));
        paths.push(PathBuf::from("smartops.yml"));
    }
    paths
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    server: Option<ServerSection>,
}

#[derive(Debug, Default, Deserialize)]
struct ServerSection {
    #[serde(default)]
    base_url: Option<String>,
}
