//! Error types for pathdb.
//!
//! This module defines all error types using `thiserror`. Every failure kind is a
//! distinct variant so callers can branch on it (for example to decide whether to
//! retry at a higher level) instead of parsing messages.

use serde::Serialize;
use thiserror::Error;

/// SQLite primary result code for `SQLITE_BUSY`.
const SQLITE_BUSY: i64 = 5;
/// SQLite primary result code for `SQLITE_LOCKED`.
const SQLITE_LOCKED: i64 = 6;

/// Classification of an engine failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Expected to resolve on retry (resource busy, lock contention, I/O hiccup).
    Transient,
    /// Retrying cannot help (constraint violation, syntax error, type mismatch).
    Fatal,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum DbError {
    #[error("Failed to open database '{path}': {message}")]
    Open { path: String, message: String },

    #[error(
        "Connection pool exhausted: no handle for '{path}' within {waited_ms}ms (capacity {max_connections})"
    )]
    PoolExhausted {
        path: String,
        waited_ms: u64,
        max_connections: usize,
    },

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Handle for '{path}' is not leased from this pool")]
    NotOwned { path: String },

    #[error("Database error ({class}): {message}")]
    Engine {
        class: FailureClass,
        /// SQLite result code, e.g. "5" for SQLITE_BUSY or "2067" for a unique violation
        code: Option<String>,
        message: String,
    },

    #[error("Operation failed after {attempts} attempt(s): {last_error}")]
    OperationFailed {
        attempts: u32,
        last_error: Box<DbError>,
    },

    #[error("No active transaction")]
    NoActiveTransaction,

    #[error("Transaction aborted: the enclosing transaction was rolled back")]
    TransactionAborted,

    #[error("transaction failed: {transaction_error}; rollback also failed: {rollback_error}")]
    TransactionRollbackFailed {
        transaction_error: Box<DbError>,
        rollback_error: Box<DbError>,
    },

    #[error("Handle for '{path}' is closed")]
    HandleClosed { path: String },

    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Invalid configuration: {message}")]
    Config { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create an open error for a database path.
    pub fn open(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Open {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Create a pool exhausted error.
    pub fn pool_exhausted(path: impl Into<String>, waited_ms: u64, max_connections: usize) -> Self {
        Self::PoolExhausted {
            path: path.into(),
            waited_ms,
            max_connections,
        }
    }

    /// Create a not-owned error.
    pub fn not_owned(path: impl Into<String>) -> Self {
        Self::NotOwned { path: path.into() }
    }

    /// Create a transient engine error (resource busy, lock contention).
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Engine {
            class: FailureClass::Transient,
            code: None,
            message: message.into(),
        }
    }

    /// Create a fatal engine error (constraint violation, syntax error).
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Engine {
            class: FailureClass::Fatal,
            code: None,
            message: message.into(),
        }
    }

    /// Create an engine error from a SQLite result code, classifying it.
    pub fn engine(code: Option<String>, message: impl Into<String>) -> Self {
        let message = message.into();
        let class = classify_sqlite(code.as_deref(), &message);
        Self::Engine {
            class,
            code,
            message,
        }
    }

    /// Wrap the last error of a retried operation.
    pub fn operation_failed(attempts: u32, last_error: DbError) -> Self {
        Self::OperationFailed {
            attempts,
            last_error: Box::new(last_error),
        }
    }

    /// Create a rollback failure error.
    pub fn rollback_failed(transaction_error: DbError, rollback_error: DbError) -> Self {
        Self::TransactionRollbackFailed {
            transaction_error: Box::new(transaction_error),
            rollback_error: Box::new(rollback_error),
        }
    }

    /// Create a handle closed error.
    pub fn handle_closed(path: impl Into<String>) -> Self {
        Self::HandleClosed { path: path.into() }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms,
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Classification used by the retry executor.
    ///
    /// Only engine errors can be transient; every other kind is fatal to the
    /// operation that produced it.
    pub fn failure_class(&self) -> FailureClass {
        match self {
            Self::Engine { class, .. } => *class,
            _ => FailureClass::Fatal,
        }
    }

    /// Check if this error is a transient engine failure.
    pub fn is_transient(&self) -> bool {
        self.failure_class() == FailureClass::Transient
    }

    /// Check if retrying at a higher layer may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::PoolExhausted { .. } | Self::Timeout { .. } => true,
            Self::Engine { class, .. } => *class == FailureClass::Transient,
            Self::OperationFailed { last_error, .. } => last_error.is_transient(),
            _ => false,
        }
    }

    /// Number of attempts made, for errors produced by the retry executor.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::OperationFailed { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }

    /// The innermost error, unwrapping retry annotations.
    pub fn root_cause(&self) -> &DbError {
        match self {
            Self::OperationFailed { last_error, .. } => last_error.root_cause(),
            other => other,
        }
    }

    /// Extract a structured error code for machine-readable handling.
    pub fn error_code(&self) -> String {
        match self {
            Self::Open { .. } => "OPEN_ERROR".to_string(),
            Self::PoolExhausted { .. } => "POOL_EXHAUSTED".to_string(),
            Self::PoolClosed => "POOL_CLOSED".to_string(),
            Self::NotOwned { .. } => "NOT_OWNED".to_string(),
            Self::Engine {
                code: Some(code), ..
            } => format!("SQLITE_{}", code),
            Self::Engine { class, .. } => match class {
                FailureClass::Transient => "TRANSIENT_FAILURE".to_string(),
                FailureClass::Fatal => "FATAL_FAILURE".to_string(),
            },
            Self::OperationFailed { .. } => "OPERATION_FAILED".to_string(),
            Self::NoActiveTransaction => "NO_ACTIVE_TRANSACTION".to_string(),
            Self::TransactionAborted => "TRANSACTION_ABORTED".to_string(),
            Self::TransactionRollbackFailed { .. } => "TRANSACTION_ROLLBACK_FAILED".to_string(),
            Self::HandleClosed { .. } => "HANDLE_CLOSED".to_string(),
            Self::Timeout { .. } => "TIMEOUT".to_string(),
            Self::InvalidInput { .. } => "INVALID_INPUT".to_string(),
            Self::Config { .. } => "CONFIG_ERROR".to_string(),
            Self::Internal { .. } => "INTERNAL_ERROR".to_string(),
        }
    }
}

/// Classify a SQLite failure by result code, falling back to the message text.
///
/// Extended result codes carry the primary code in their low byte, so
/// `SQLITE_BUSY_SNAPSHOT` (517) classifies like `SQLITE_BUSY` (5).
pub fn classify_sqlite(code: Option<&str>, message: &str) -> FailureClass {
    if let Some(primary) = code
        .and_then(|c| c.trim().parse::<i64>().ok())
        .map(|c| c & 0xff)
    {
        return if primary == SQLITE_BUSY || primary == SQLITE_LOCKED {
            FailureClass::Transient
        } else {
            FailureClass::Fatal
        };
    }

    let lower = message.to_lowercase();
    if lower.contains("database is locked")
        || lower.contains("database table is locked")
        || lower.contains("busy")
    {
        FailureClass::Transient
    } else {
        FailureClass::Fatal
    }
}

/// Convert sqlx errors to DbError, classifying engine failures.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.to_string());
                DbError::engine(code, db_err.message())
            }
            sqlx::Error::PoolTimedOut => DbError::transient("engine pool acquire timed out"),
            sqlx::Error::Io(io_err) => DbError::transient(format!("I/O error: {}", io_err)),
            sqlx::Error::WorkerCrashed => DbError::transient("database worker crashed"),
            sqlx::Error::PoolClosed => DbError::PoolClosed,
            sqlx::Error::RowNotFound => DbError::fatal("No rows returned"),
            sqlx::Error::ColumnNotFound(col) => {
                DbError::fatal(format!("Column not found: {}", col))
            }
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::fatal(format!("Failed to decode column {}: {}", index, source))
            }
            sqlx::Error::Decode(source) => DbError::fatal(format!("Decode error: {}", source)),
            sqlx::Error::Configuration(msg) => DbError::config(msg.to_string()),
            _ => DbError::fatal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DbError::open("/tmp/a.db", "permission denied");
        assert!(err.to_string().contains("/tmp/a.db"));
        assert!(err.to_string().contains("permission denied"));
    }

    #[test]
    fn test_classify_busy_and_locked_codes() {
        assert_eq!(classify_sqlite(Some("5"), ""), FailureClass::Transient);
        assert_eq!(classify_sqlite(Some("6"), ""), FailureClass::Transient);
        // SQLITE_BUSY_SNAPSHOT
        assert_eq!(classify_sqlite(Some("517"), ""), FailureClass::Transient);
        // SQLITE_LOCKED_SHAREDCACHE
        assert_eq!(classify_sqlite(Some("262"), ""), FailureClass::Transient);
    }

    #[test]
    fn test_classify_fatal_codes() {
        // SQLITE_CONSTRAINT_UNIQUE
        assert_eq!(classify_sqlite(Some("2067"), ""), FailureClass::Fatal);
        // SQLITE_ERROR (syntax)
        assert_eq!(classify_sqlite(Some("1"), ""), FailureClass::Fatal);
        // SQLITE_MISMATCH
        assert_eq!(classify_sqlite(Some("20"), ""), FailureClass::Fatal);
    }

    #[test]
    fn test_classify_by_message_without_code() {
        assert_eq!(
            classify_sqlite(None, "database is locked"),
            FailureClass::Transient
        );
        assert_eq!(
            classify_sqlite(None, "near \"SELEC\": syntax error"),
            FailureClass::Fatal
        );
    }

    #[test]
    fn test_only_engine_errors_are_transient() {
        assert!(DbError::transient("busy").is_transient());
        assert!(!DbError::fatal("constraint").is_transient());
        assert!(!DbError::pool_exhausted("x", 0, 1).is_transient());
        assert!(!DbError::PoolClosed.is_transient());
        assert!(!DbError::timeout("scope", 10).is_transient());
    }

    #[test]
    fn test_error_retryable() {
        assert!(DbError::pool_exhausted("x", 10, 1).is_retryable());
        assert!(DbError::timeout("query", 30).is_retryable());
        assert!(DbError::operation_failed(3, DbError::transient("busy")).is_retryable());
        assert!(!DbError::operation_failed(1, DbError::fatal("syntax")).is_retryable());
        assert!(!DbError::not_owned("x").is_retryable());
        assert!(!DbError::TransactionAborted.is_retryable());
    }

    #[test]
    fn test_operation_failed_attempts_and_root_cause() {
        let err = DbError::operation_failed(3, DbError::transient("database is locked"));
        assert_eq!(err.attempts(), Some(3));
        assert!(matches!(err.root_cause(), DbError::Engine { .. }));
        assert!(err.to_string().contains("3 attempt(s)"));
        assert_eq!(DbError::PoolClosed.attempts(), None);
    }

    #[test]
    fn test_engine_constructor_classifies() {
        let err = DbError::engine(Some("5".to_string()), "database is locked");
        assert_eq!(err.failure_class(), FailureClass::Transient);
        assert_eq!(err.error_code(), "SQLITE_5");

        let err = DbError::engine(Some("2067".to_string()), "UNIQUE constraint failed");
        assert_eq!(err.failure_class(), FailureClass::Fatal);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(DbError::PoolClosed.error_code(), "POOL_CLOSED");
        assert_eq!(DbError::not_owned("x").error_code(), "NOT_OWNED");
        assert_eq!(
            DbError::NoActiveTransaction.error_code(),
            "NO_ACTIVE_TRANSACTION"
        );
        assert_eq!(
            DbError::TransactionAborted.error_code(),
            "TRANSACTION_ABORTED"
        );
        assert_eq!(DbError::transient("x").error_code(), "TRANSIENT_FAILURE");
        assert_eq!(DbError::fatal("x").error_code(), "FATAL_FAILURE");
    }

    #[test]
    fn test_rollback_failed_mentions_both_errors() {
        let err = DbError::rollback_failed(DbError::fatal("constraint"), DbError::transient("busy"));
        assert_eq!(err.error_code(), "TRANSACTION_ROLLBACK_FAILED");
        assert!(err.to_string().contains("constraint"));
        assert!(err.to_string().contains("busy"));
    }

    #[test]
    fn test_sqlx_row_not_found_is_fatal() {
        let err: DbError = sqlx::Error::RowNotFound.into();
        assert_eq!(err.failure_class(), FailureClass::Fatal);
    }

    #[test]
    fn test_sqlx_pool_timeout_is_transient() {
        let err: DbError = sqlx::Error::PoolTimedOut.into();
        assert!(err.is_transient());
    }
}
