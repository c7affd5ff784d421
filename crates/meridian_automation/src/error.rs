//! Error types for the automation layer.

use meridian_protocol::{ErrorCode, ToolError};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AutomationError>;

/// Automation errors.
#[derive(Debug, Error)]
pub enum AutomationError {
    /// Failed to spawn or talk to a supervised subprocess
    #[error("Process error: {0}")]
    Process(String),

    /// Device missing or in the wrong state
    #[error("Device precondition failed: {0}")]
    Precondition(String),

    /// Device or session not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// HTTP request to the runner failed
    #[error("Runner request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket failure on the inspector session
    #[error("Inspector socket error: {0}")]
    Socket(String),

    /// Command outlived its deadline
    #[error("Deadline exceeded: {0}")]
    Timeout(String),

    /// Session closed with requests still pending
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Malformed output from an external tool
    #[error("Invalid output: {0}")]
    InvalidOutput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AutomationError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Process(_) | Self::Http(_) | Self::Socket(_) => ErrorCode::ServiceUnavailable,
            Self::Precondition(_) => ErrorCode::FailedPrecondition,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::Timeout(_) => ErrorCode::DeadlineExceeded,
            Self::Cancelled(_) => ErrorCode::Cancelled,
            Self::InvalidOutput(_) => ErrorCode::Internal,
            Self::Io(_) => ErrorCode::Internal,
        }
    }
}

impl From<AutomationError> for ToolError {
    fn from(err: AutomationError) -> Self {
        ToolError::new(err.code(), err.to_string())
    }
}
