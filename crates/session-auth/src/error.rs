//! Error types for auth endpoint and storage operations

/// Errors from auth endpoint calls and credential persistence.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("auth endpoint returned {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("invalid token response: {0}")]
    Decode(String),

    #[error("credential storage error: {0}")]
    Storage(String),
}

impl Error {
    /// HTTP status for `Rejected`, `None` for transport/decode/storage failures.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Rejected { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
