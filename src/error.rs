//! Typed error taxonomy for the chat service.
//!
//! Every fallible operation in the core pipeline returns [`ChatError`].
//! The four variants map directly to the HTTP boundary:
//!
//! | Variant | Status | Meaning |
//! |---------|--------|---------|
//! | `Validation` | 400 | Bad input, rejected before any external call |
//! | `Authorization` | 403 | Resource not owned by the requesting user |
//! | `Upstream` | 502 | Embedding/completion/vector-store failure |
//! | `Internal` | 500 | Everything else |
//!
//! Authorization errors carry no detail at all: whether the resource exists
//! under another owner must not be observable.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("{0}")]
    Validation(String),

    #[error("not authorized")]
    Authorization,

    #[error("upstream provider error: {0}")]
    Upstream(#[source] anyhow::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ChatError {
    pub fn validation(msg: impl Into<String>) -> Self {
        ChatError::Validation(msg.into())
    }

    pub fn upstream(err: impl Into<anyhow::Error>) -> Self {
        ChatError::Upstream(err.into())
    }

    /// Message suitable for sending to a client. Upstream and internal
    /// detail is exposed only when `verbose` is set.
    pub fn client_message(&self, verbose: bool) -> String {
        match self {
            ChatError::Validation(msg) => msg.clone(),
            ChatError::Authorization => "not authorized".to_string(),
            ChatError::Upstream(err) if verbose => format!("upstream provider error: {err:#}"),
            ChatError::Upstream(_) => "upstream provider error".to_string(),
            ChatError::Internal(err) if verbose => format!("internal error: {err:#}"),
            ChatError::Internal(_) => "internal error".to_string(),
        }
    }
}

impl From<sqlx::Error> for ChatError {
    fn from(err: sqlx::Error) -> Self {
        ChatError::Internal(err.into())
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
