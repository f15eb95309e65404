use thiserror::Error;

/// Failures raised while speaking the farm protocol on one connection.
///
/// None of these are fatal to a coordinator or a listener: they end the single
/// exchange (or session) they happened on.
#[derive(Debug, Error)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed by peer")]
    UnexpectedEof,

    #[error("expected '{expected}', got '{got}'")]
    UnexpectedResponse { expected: String, got: String },

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("integrity check failed for '{0}'")]
    Integrity(String),
}

impl WireError {
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn unexpected(expected: &str, got: &str) -> Self {
        Self::UnexpectedResponse {
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }
}

pub type WireResult<T> = Result<T, WireError>;
