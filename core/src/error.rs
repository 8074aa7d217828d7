use thiserror::Error;

/// Failures surfaced by the client core.
///
/// Transport failures (DNS, refused connections, timeouts) are kept distinct
/// from application failures (a reachable server answering with a non-success
/// status), and a missing token is a precondition failure rather than a
/// network error.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not authenticated: log in before issuing requests")]
    AuthRequired,

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("server rejected the request ({status}): {detail}")]
    Application { status: u16, detail: String },

    #[error("response body missing or broken mid-stream")]
    StreamUnavailable,

    #[error("a streamed reply is already in progress for this conversation")]
    StreamBusy,

    #[error("invalid endpoint url: {0}")]
    Url(#[from] url::ParseError),

    #[error("unexpected response payload: {0}")]
    UnexpectedResponse(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Transport(err.to_string())
    }
}

impl ClientError {
    /// True when the failure came from the network rather than the server.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

/// Result alias for client core operations.
pub type ClientResult<T> = Result<T, ClientError>;
