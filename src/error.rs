//! Error types for the execution engines.
//!
//! This module defines all error types using `thiserror` for ergonomic error handling.
//! Backend failures keep the backend's state/error code so callers can log and act on them.

use thiserror::Error;

/// MySQL client error: server has gone away.
pub const CR_SERVER_GONE_ERROR: u32 = 2006;

/// MySQL client error: lost connection to server during query.
pub const CR_SERVER_LOST: u32 = 2013;

/// SQLSTATE reported for named-parameter binding mismatches.
pub const SQLSTATE_INVALID_PARAMETER_NUMBER: &str = "HY093";

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{}", format_connection(message, sql_state.as_deref(), *code))]
    Connection {
        message: String,
        /// e.g., "HY000" for general errors
        sql_state: Option<String>,
        /// Backend error number (MySQL error code) when known
        code: Option<u32>,
        /// Connection dropped; a fresh connection is likely to succeed
        transient: bool,
    },

    #[error("Transaction error: {message}")]
    Transaction { message: String },

    #[error("Unsupported operation: {operation} is not supported by {backend}")]
    Unsupported {
        operation: String,
        backend: String,
    },

    #[error("Invalid request: {message}")]
    Precondition { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

fn format_connection(message: &str, sql_state: Option<&str>, code: Option<u32>) -> String {
    match (sql_state, code) {
        (Some(state), Some(code)) => {
            format!("Fail to execute request : SQLSTATE[{state}][{code}] {message}")
        }
        (Some(state), None) => format!("Fail to execute request : SQLSTATE[{state}] {message}"),
        (None, Some(code)) => format!("Connection failed: [{code}] {message}"),
        (None, None) => format!("Connection failed: {message}"),
    }
}

impl EngineError {
    /// Create a non-transient connection error without backend codes.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            sql_state: None,
            code: None,
            transient: false,
        }
    }

    /// Create a connection error carrying the backend's state and error code.
    pub fn backend(message: impl Into<String>, sql_state: Option<String>, code: Option<u32>) -> Self {
        let transient = matches!(code, Some(CR_SERVER_GONE_ERROR | CR_SERVER_LOST));
        Self::Connection {
            message: message.into(),
            sql_state,
            code,
            transient,
        }
    }

    /// Create a connection error for a dropped connection.
    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            sql_state: Some("HY000".to_string()),
            code: Some(CR_SERVER_GONE_ERROR),
            transient: true,
        }
    }

    /// Create a named-parameter binding error.
    pub fn binding(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            sql_state: Some(SQLSTATE_INVALID_PARAMETER_NUMBER.to_string()),
            code: None,
            transient: false,
        }
    }

    /// Create a transaction state error.
    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }

    /// Create an unsupported operation error.
    pub fn unsupported(operation: impl Into<String>, backend: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
            backend: backend.into(),
        }
    }

    /// Create a precondition error for a structurally invalid request.
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::Precondition {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// True for the "server gone away" class of failures.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { transient: true, .. })
    }

    /// SQLSTATE carried by a backend error, if any.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Connection { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }

    /// Backend error number carried by a backend error, if any.
    pub fn code(&self) -> Option<u32> {
        match self {
            Self::Connection { code, .. } => *code,
            _ => None,
        }
    }
}

/// Convert sqlx errors to EngineError.
impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let sql_state = db_err.code().map(|c| c.to_string());
                let number = db_err
                    .try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
                    .map(|e| u32::from(e.number()));
                EngineError::backend(db_err.message(), sql_state, number)
            }
            sqlx::Error::Io(io_err) => transport_failure(format!("I/O error: {io_err}")),
            sqlx::Error::Protocol(msg) => EngineError::connection(format!("Protocol error: {msg}")),
            sqlx::Error::Tls(tls_err) => EngineError::connection(format!("TLS error: {tls_err}")),
            sqlx::Error::Configuration(msg) => {
                EngineError::connection(format!("Invalid configuration: {msg}"))
            }
            sqlx::Error::ColumnDecode { index, source } => {
                EngineError::internal(format!("Failed to decode column {index}: {source}"))
            }
            sqlx::Error::Decode(source) => EngineError::internal(format!("Decode error: {source}")),
            sqlx::Error::WorkerCrashed => transport_failure("Database worker crashed"),
            _ => EngineError::connection(format!("Database error: {err}")),
        }
    }
}

/// Transient failure below the protocol; no server error number applies.
fn transport_failure(message: impl Into<String>) -> EngineError {
    EngineError::Connection {
        message: message.into(),
        sql_state: None,
        code: None,
        transient: true,
    }
}

/// Convert Redis client errors to EngineError.
impl From<redis::RedisError> for EngineError {
    fn from(err: redis::RedisError) -> Self {
        let transient = err.is_io_error() || err.is_connection_dropped() || err.is_timeout();
        EngineError::Connection {
            message: err.to_string(),
            sql_state: None,
            code: err.code().and_then(|c| c.parse().ok()),
            transient,
        }
    }
}

/// Result type alias for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;
