use crate::error::{ClientError, ClientResult};
use crate::protocol::Provider;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Credential state for the active operator session. Exactly one session
/// exists per client instance; it is persisted externally and restored at
/// startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub token: Option<String>,
    pub username: Option<String>,
}

impl Session {
    pub fn is_authenticated(&self) -> bool {
        self.token.as_deref().map(|t| !t.is_empty()).unwrap_or(false)
    }
}

/// Session-scoped provider API keys, attached to outbound requests as
/// dedicated headers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderKeys {
    #[serde(default)]
    pub deepseek: String,
    #[serde(default)]
    pub tongyi: String,
}

impl ProviderKeys {
    pub fn get(&self, provider: Provider) -> &str {
        match provider {
            Provider::Deepseek => &self.deepseek,
            Provider::Tongyi => &self.tongyi,
        }
    }

    pub fn set(&mut self, provider: Provider, value: impl Into<String>) {
        match provider {
            Provider::Deepseek => self.deepseek = value.into(),
            Provider::Tongyi => self.tongyi = value.into(),
        }
    }
}

#[derive(Default)]
struct SessionInner {
    session: Session,
    keys: ProviderKeys,
}

/// Shared handle to the session read by every outbound request. Mutations
/// (login, logout, key updates) become visible to subsequently issued
/// requests; requests already in flight keep the values they were built with.
#[derive(Clone, Default)]
pub struct SessionHandle {
    inner: Arc<RwLock<SessionInner>>,
}

impl SessionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn restore(session: Session, keys: ProviderKeys) -> Self {
        Self {
            inner: Arc::new(RwLock::new(SessionInner { session, keys })),
        }
    }

    pub fn snapshot(&self) -> Session {
        self.inner.read().session.clone()
    }

    /// The bearer token, if one is held. An empty stored token counts as
    /// absent so it is never sent as a literal empty header value.
    pub fn token(&self) -> Option<String> {
        self.inner
            .read()
            .session
            .token
            .clone()
            .filter(|t| !t.is_empty())
    }

    pub fn username(&self) -> Option<String> {
        self.inner.read().session.username.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.read().session.is_authenticated()
    }

    /// Precondition check for authenticated operations.
    pub fn require_token(&self) -> ClientResult<String> {
        self.token().ok_or(ClientError::AuthRequired)
    }

    pub fn establish(&self, username: &str, token: String) {
        let mut inner = self.inner.write();
        inner.session.token = Some(token);
        inner.session.username = Some(username.to_owned());
    }

    /// Drops the token, username and cached provider keys.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.session = Session::default();
        inner.keys = ProviderKeys::default();
    }

    pub fn keys(&self) -> ProviderKeys {
        self.inner.read().keys.clone()
    }

    pub fn set_keys(&self, keys: ProviderKeys) {
        self.inner.write().keys = keys;
    }
}
