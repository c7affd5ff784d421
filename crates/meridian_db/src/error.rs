//! Error types for the database layer.

use meridian_protocol::{ErrorCode, ToolError};
use thiserror::Error;

/// Database operation result type.
pub type Result<T> = std::result::Result<T, DbError>;

/// Database errors.
#[derive(Error, Debug)]
pub enum DbError {
    /// Driver error (connection, query, decode)
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// IO error (migration files, sockets)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Named connection or row does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Connection id already registered
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Bad SQL, parameters, or connection string
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Checksum drift, unbooted state, or other precondition failure
    #[error("Failed precondition: {0}")]
    FailedPrecondition(String),

    /// Circuit breaker is open for this pool
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// Pool acquire timed out or a budget was exceeded
    #[error("Resource exhausted: {0}")]
    Exhausted(String),

    /// Statement exceeded its deadline
    #[error("Deadline exceeded: {0}")]
    Timeout(String),

    /// Operation cancelled by the caller
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl DbError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::FailedPrecondition(msg.into())
    }

    /// Whether retrying the same operation could plausibly succeed.
    ///
    /// Constraint violations and syntax errors are never transient; network
    /// failures, pool churn, and server-advisory restarts are.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Sqlx(err) => sqlx_error_is_transient(err),
            Self::Io(_) | Self::Unavailable(_) | Self::Timeout(_) => true,
            _ => false,
        }
    }

    /// Stable error code for the wire.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Sqlx(err) => sqlx_error_code(err),
            Self::Io(_) => ErrorCode::ServiceUnavailable,
            Self::NotFound(_) => ErrorCode::NotFound,
            Self::AlreadyExists(_) => ErrorCode::AlreadyExists,
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            Self::FailedPrecondition(_) => ErrorCode::FailedPrecondition,
            Self::Unavailable(_) => ErrorCode::ServiceUnavailable,
            Self::Exhausted(_) => ErrorCode::ResourceExhausted,
            Self::Timeout(_) => ErrorCode::DeadlineExceeded,
            Self::Cancelled(_) => ErrorCode::Cancelled,
        }
    }
}

fn sqlx_error_is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::Protocol(_) | sqlx::Error::PoolClosed => true,
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => {
            let Some(code) = db.code() else {
                return false;
            };
            // SQLSTATE classes: 08 connection, 53 insufficient resources,
            // 57P01..57P03 server-advisory shutdown/restart.
            code.starts_with("08")
                || code.starts_with("53")
                || code.starts_with("57P")
        }
        _ => false,
    }
}

fn sqlx_error_code(err: &sqlx::Error) -> ErrorCode {
    match err {
        sqlx::Error::PoolTimedOut => ErrorCode::ResourceExhausted,
        sqlx::Error::RowNotFound => ErrorCode::NotFound,
        sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::Protocol(_) => {
            ErrorCode::ServiceUnavailable
        }
        sqlx::Error::Database(db) => {
            let Some(code) = db.code() else {
                return ErrorCode::Internal;
            };
            if code.starts_with("23") {
                // Constraint violations surface immediately; unique ones as conflicts.
                if code.as_ref() == "23505" {
                    ErrorCode::AlreadyExists
                } else {
                    ErrorCode::FailedPrecondition
                }
            } else if code.starts_with("42") {
                ErrorCode::InvalidArgument
            } else if code.as_ref() == "57014" {
                ErrorCode::Cancelled
            } else if code.starts_with("08") || code.starts_with("53") || code.starts_with("57P") {
                ErrorCode::ServiceUnavailable
            } else if code.starts_with("28") {
                ErrorCode::Unauthenticated
            } else {
                ErrorCode::Internal
            }
        }
        _ => ErrorCode::Internal,
    }
}

impl From<DbError> for ToolError {
    fn from(err: DbError) -> Self {
        let code = err.code();
        let mut tool_err = ToolError::new(code, err.to_string());
        // Attach the statement position when the driver reports one.
        if let DbError::Sqlx(sqlx::Error::Database(db)) = &err {
            if let Some(pg) = db.try_downcast_ref::<sqlx::postgres::PgDatabaseError>() {
                if let Some(sqlx::postgres::PgErrorPosition::Original(pos)) = pg.position() {
                    tool_err = tool_err.with_details(serde_json::json!({ "position": pos }));
                }
            }
        }
        tool_err
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classes() {
        assert!(DbError::Sqlx(sqlx::Error::PoolTimedOut).is_transient());
        assert!(DbError::Unavailable("breaker open".into()).is_transient());
        assert!(!DbError::invalid("bad sql").is_transient());
        assert!(!DbError::not_found("missing").is_transient());
    }

    #[test]
    fn test_code_mapping() {
        assert_eq!(
            DbError::Exhausted("acquire timeout".into()).code(),
            ErrorCode::ResourceExhausted
        );
        assert_eq!(
            DbError::Unavailable("open".into()).code(),
            ErrorCode::ServiceUnavailable
        );
        assert_eq!(
            DbError::Timeout("statement".into()).code(),
            ErrorCode::DeadlineExceeded
        );
        assert_eq!(
            DbError::precondition("checksum drift").code(),
            ErrorCode::FailedPrecondition
        );
    }
}
