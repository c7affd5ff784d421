//! Stable error taxonomy shared by every Meridian server component.
//!
//! Tool failures are reported inside the tool result envelope, not as
//! JSON-RPC errors: the call succeeded at the protocol layer, the tool did
//! not. Each failure carries one of the stable codes below plus a free-form
//! message, optional details, and an optional retry hint.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Result alias for tool executors.
pub type ToolResult<T> = std::result::Result<T, ToolError>;

/// Stable, cross-component error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidArgument,
    NotFound,
    FailedPrecondition,
    PermissionDenied,
    Unauthenticated,
    ResourceExhausted,
    DeadlineExceeded,
    Cancelled,
    AlreadyExists,
    ServiceUnavailable,
    Internal,
}

impl ErrorCode {
    /// Wire representation of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::NotFound => "NOT_FOUND",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::Cancelled => "CANCELLED",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            Self::Internal => "INTERNAL",
        }
    }

    /// Whether an operation failing with this code is worth retrying.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::ResourceExhausted | Self::ServiceUnavailable | Self::DeadlineExceeded
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tool-level error with a stable code.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct ToolError {
    pub code: ErrorCode,
    pub message: String,
    pub details: Option<Value>,
    /// Suggested wait before retrying, in seconds.
    pub retry_after: Option<u64>,
}

impl ToolError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            retry_after: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after = Some(secs);
        self
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub fn failed_precondition(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::FailedPrecondition, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::PermissionDenied, message)
    }

    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ResourceExhausted, message)
    }

    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DeadlineExceeded, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Cancelled, message)
    }

    pub fn already_exists(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::AlreadyExists, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ServiceUnavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    /// Structured payload for the tool result envelope.
    pub fn to_payload(&self) -> Value {
        let mut obj = serde_json::Map::new();
        obj.insert("code".into(), Value::String(self.code.as_str().to_string()));
        obj.insert("message".into(), Value::String(self.message.clone()));
        if let Some(ref details) = self.details {
            obj.insert("details".into(), details.clone());
        }
        if let Some(secs) = self.retry_after {
            obj.insert("retryAfter".into(), Value::Number(secs.into()));
        }
        Value::Object(obj)
    }
}

impl From<serde_json::Error> for ToolError {
    fn from(err: serde_json::Error) -> Self {
        ToolError::invalid_argument(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_strings() {
        assert_eq!(ErrorCode::InvalidArgument.as_str(), "INVALID_ARGUMENT");
        assert_eq!(ErrorCode::ServiceUnavailable.as_str(), "SERVICE_UNAVAILABLE");
        assert_eq!(ErrorCode::DeadlineExceeded.as_str(), "DEADLINE_EXCEEDED");
    }

    #[test]
    fn test_retryable_classes() {
        assert!(ErrorCode::ServiceUnavailable.is_retryable());
        assert!(ErrorCode::ResourceExhausted.is_retryable());
        assert!(!ErrorCode::InvalidArgument.is_retryable());
        assert!(!ErrorCode::PermissionDenied.is_retryable());
    }

    #[test]
    fn test_payload_shape() {
        let err = ToolError::resource_exhausted("rate limit exceeded")
            .with_retry_after(30)
            .with_details(serde_json::json!({"tenant": "acme"}));

        let payload = err.to_payload();
        assert_eq!(payload["code"], "RESOURCE_EXHAUSTED");
        assert_eq!(payload["retryAfter"], 30);
        assert_eq!(payload["details"]["tenant"], "acme");
    }

    #[test]
    fn test_display_includes_code() {
        let err = ToolError::not_found("no such connection: replica");
        assert_eq!(err.to_string(), "NOT_FOUND: no such connection: replica");
    }
}
