//! Error types for the PostgreSQL client.

use std::collections::HashMap;
use std::fmt;
use std::io;

use thiserror::Error;

/// Result type for PostgreSQL operations.
pub type PgResult<T> = std::result::Result<T, PgError>;

/// Errors that can occur during PostgreSQL operations.
#[derive(Error, Debug)]
pub enum PgError {
    /// I/O error during communication.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Socket or TLS establishment failure, or an unexpected disconnect.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Connection is closed or no longer usable.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// The server rejected the supplied credentials.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Malformed or out-of-sequence server message.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server returned an ErrorResponse.
    #[error("{0}")]
    Server(ServerError),

    /// Type conversion error.
    #[error("Type error: {0}")]
    Type(String),

    /// Statement not found in the connection's cache.
    #[error("Unknown prepared statement: {0}")]
    StatementNotFound(String),

    /// A statement with this name is already prepared with different SQL.
    #[error("Prepared statement \"{name}\" already exists with different SQL")]
    DuplicateStatement { name: String },

    /// A transaction was started on a connection that is already in one.
    #[error("Transaction already in progress on this connection")]
    NestedTransaction,

    /// No pooled connection became available in time.
    #[error("Connection pool exhausted")]
    PoolExhausted,

    /// The pool has been closed.
    #[error("Connection pool is closed")]
    PoolClosed,

    /// Timeout waiting for a response or notification.
    #[error("Operation timed out")]
    Timeout,

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl PgError {
    /// Whether this error leaves the connection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PgError::Io(_) | PgError::Connection(_) | PgError::ConnectionClosed | PgError::Protocol(_)
        )
    }

    /// The SQLSTATE code for server errors.
    pub fn code(&self) -> Option<&str> {
        match self {
            PgError::Server(e) => Some(&e.code),
            _ => None,
        }
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        PgError::Protocol(msg.into())
    }
}

/// A decoded ErrorResponse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

impl ServerError {
    /// Build from the tagged fields of an ErrorResponse or NoticeResponse.
    pub fn from_fields(fields: &HashMap<u8, String>) -> Self {
        Self {
            // 'V' is the non-localized severity; fall back to 'S' for old servers
            severity: fields
                .get(&b'V')
                .or_else(|| fields.get(&b'S'))
                .cloned()
                .unwrap_or_default(),
            code: fields.get(&b'C').cloned().unwrap_or_default(),
            message: fields.get(&b'M').cloned().unwrap_or_default(),
            detail: fields.get(&b'D').cloned(),
            hint: fields.get(&b'H').cloned(),
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.severity, self.message, self.code)?;
        if let Some(d) = &self.detail {
            write!(f, "\nDetail: {}", d)?;
        }
        if let Some(h) = &self.hint {
            write!(f, "\nHint: {}", h)?;
        }
        Ok(())
    }
}
