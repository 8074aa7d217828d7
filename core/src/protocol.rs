//! Wire types for the SmartOps backend API.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Supported AI providers, selectable per request.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Deepseek,
    Tongyi,
}

impl Provider {
    /// Header carrying this provider's API key on outbound requests.
    pub fn key_header(&self) -> &'static str {
        match self {
            Self::Deepseek => "x-deepseek-key",
            Self::Tongyi => "x-tongyi-key",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deepseek => "deepseek",
            Self::Tongyi => "tongyi",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "deepseek" => Ok(Self::Deepseek),
            "tongyi" => Ok(Self::Tongyi),
            other => Err(format!("unknown provider '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// One turn of the conversation. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
}

/// Error body shape used by the backend for non-success statuses.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorBody {
    #[serde(default)]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatRequest {
    pub model: Provider,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatReply {
    pub reply: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnalyzeReply {
    pub result: String,
}

/// Task lifecycle states. Transitions are monotonic; `completed` and
/// `failed` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    /// The backend reports in-flight work as `running`.
    #[serde(alias = "running")]
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Chat,
    Analyze,
    Generic,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Analyze => "analyze",
            Self::Generic => "generic",
        }
    }
}

/// Prior-result sequence threaded into a follow-up submission.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskContext {
    pub history: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskRequest {
    pub task_type: TaskKind,
    pub provider: Provider,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<TaskContext>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskReply {
    pub status: TaskStatus,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub structured: BTreeMap<String, String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

/// One observation of a task's server-side state, as returned by the status
/// endpoint and delivered by the polling loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default, alias = "model")]
    pub provider: Option<Provider>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub structured: BTreeMap<String, String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default, alias = "model")]
    pub provider: Option<Provider>,
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub structured: BTreeMap<String, String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigValue {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConfigUpdate {
    pub model: Provider,
    pub api_key: String,
}
