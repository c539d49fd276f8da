use thiserror::Error;
use uuid::Uuid;

/// Reasons an `Auth` signature is rejected.
///
/// Only logged locally; the peer never learns which check failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("invalid signature data")]
    InvalidData,

    #[error("signature expired, check system time if problem persists")]
    Expired,

    #[error("password mismatch")]
    PasswordMismatch,
}

/// Errors produced by the drill protocol layer.
#[derive(Debug, Error)]
pub enum DrillError {
    /// Fewer bytes are buffered than the frame declares. Not fatal: wait for more data.
    #[error("incomplete frame")]
    Incomplete,

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("out of bounds read")]
    OutOfBounds,

    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("socket is closed")]
    Closed,

    #[error("timeout")]
    Timeout,

    #[error("no connection to node {0}")]
    NoRoute(Uuid),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl DrillError {
    /// Whether more bytes may turn this decode failure into a success.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, DrillError::Incomplete)
    }
}

pub type DrillResult<T> = Result<T, DrillError>;
