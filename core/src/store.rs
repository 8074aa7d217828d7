use anyhow::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Snapshot names used by the client. Each holds one serializable value,
/// loaded at startup and rewritten on every mutation.
pub const SESSION_SNAPSHOT: &str = "session";
pub const API_KEYS_SNAPSHOT: &str = "api_keys";
pub const CHAT_HISTORY_SNAPSHOT: &str = "chat_history";
pub const ANALYZE_HISTORY_SNAPSHOT: &str = "analyze_history";
pub const TASKS_SNAPSHOT: &str = "tasks";

/// File-backed key-value store for client snapshots. The core treats it as
/// an opaque collaborator: one JSON document per fixed snapshot name.
#[derive(Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: PathBuf) -> Self {
        fs::create_dir_all(&root).ok();
        Self { root }
    }

    /// A throwaway store under the system temp directory.
    pub fn in_memory() -> Self {
        let mut path = std::env::temp_dir();
        path.push(format!("smartops-{}", Uuid::new_v4()));
        Self::new(path)
    }

    /// Default persistent location for snapshots.
    pub fn default_root() -> PathBuf {
        directories::BaseDirs::new()
            .map(|base| base.data_local_dir().join("smartops"))
            .unwrap_or_else(|| PathBuf::from(".smartops"))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.json"))
    }

    pub fn load<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        let contents = fs::read_to_string(self.path_for(name)).ok()?;
        serde_json::from_str(&contents).ok()
    }

    pub fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let serialized = serde_json::to_vec_pretty(value)?;
        fs::write(self.path_for(name), serialized)?;
        Ok(())
    }
}
