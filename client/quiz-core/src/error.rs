//! Error types shared by the persistence gateway and the portal client.

use thiserror::Error;

/// Errors raised while reading or writing quiz sessions and portal data.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Transport failure (connect, timeout, body read).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Backend answered with a non-success status.
    #[error("Backend returned {status}: {body}")]
    Status { status: u16, body: String },

    /// Remote call attempted without a bearer token.
    #[error("Not authenticated")]
    Unauthenticated,

    /// Session or record not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Payload parsed but failed validation at the boundary.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Local buffered record could not be parsed.
    #[error("Corrupt buffered session {0}")]
    CorruptRecord(String),

    /// A second active session was about to be created for the same quiz.
    #[error("Active session already exists for quiz {0}")]
    DuplicateActive(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GatewayError {
    /// True for failures worth retrying (transport and 5xx).
    pub fn is_transient(&self) -> bool {
        match self {
            GatewayError::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            GatewayError::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;
