//! Error types for pgasync.
//!
//! Every failure surfaces as the `Err` of the operation that produced it;
//! nothing is retried.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::pg::types::Oid;
use crate::value::Kind;

/// Result type for pgasync operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// An accessor was called for a kind the value cannot be viewed as.
    #[error("type mismatch: requested {requested}, value is {actual}")]
    TypeMismatch { requested: Kind, actual: Kind },

    /// An array holds an element whose kind differs from the declared one.
    #[error("array element {index} is {found}, array holds {expected}")]
    ArrayElementMismatch {
        index: usize,
        expected: Kind,
        found: Kind,
    },

    /// Array shape is invalid (bad dimensions, non-scalar element kind).
    #[error("invalid array: {0}")]
    InvalidArray(String),

    /// No encoding is registered for this wire type.
    #[error("no encoding registered for type oid {0}")]
    UnknownType(Oid),

    /// A payload could not be encoded or decoded.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// A prepared statement was executed with a gap at this ordinal.
    #[error("parameter {0} is not bound")]
    UnboundParameter(usize),

    #[error("column not found: {0}")]
    ColumnNotFound(String),

    /// The server rejected the statement.
    #[error(transparent)]
    Server(#[from] ServerError),

    /// The socket failed or the protocol stream became unusable.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// The data source has been closed.
    #[error("data source is closed")]
    Closed,

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation timed out")]
    Timeout,

    /// A bridged operation was dropped before it produced an outcome.
    #[error("operation canceled before completion")]
    Canceled,

    /// begin/commit/rollback called in the wrong state.
    #[error("transaction state error: {0}")]
    TransactionState(&'static str),
}

impl Error {
    /// True when the error means the underlying connection cannot be reused.
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, Error::ConnectionLost(_))
    }

    /// SQLSTATE code of a server error.
    pub fn code(&self) -> Option<&str> {
        match self {
            Error::Server(e) => Some(&e.code),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::ConnectionLost(e.to_string())
    }
}

/// An ErrorResponse from the server, with its fields kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<u32>,
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

impl std::error::Error for ServerError {}
