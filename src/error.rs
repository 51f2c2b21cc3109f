//! Crate-wide error type.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Lock poisoning or schema problems that are not a plain SQLite error.
    #[error("database state: {0}")]
    DatabaseState(String),

    /// The server answered with a non-success status.
    #[error("{message} (HTTP {status})")]
    Http {
        status: u16,
        message: String,
        retry_after_secs: Option<u64>,
    },

    /// The request never produced a response (connect failure, timeout, ...).
    #[error("{0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("credential store: {0}")]
    Credential(String),

    #[error("websocket: {0}")]
    WebSocket(String),

    #[error("{0} not found")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether a failed delivery is worth retrying later.
    ///
    /// Transport failures, 5xx, 408, 425 and 429 are retryable. Any other
    /// 4xx means the server rejected the request itself and retrying the
    /// same body will not change that.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transport(_) => true,
            Error::Http { status, .. } => {
                *status >= 500 || matches!(*status, 408 | 425 | 429)
            }
            _ => false,
        }
    }

    /// Server-side throttling. Does not count against the attempt budget.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, Error::Http { status: 429, .. })
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Error::Http {
                retry_after_secs, ..
            } => *retry_after_secs,
            _ => None,
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(err.to_string())
    }
}
