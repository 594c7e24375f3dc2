//! Error types for rowstore

use std::fmt;
use std::io;

use crate::value::{Id, ValueKind};

/// Result type alias for rowstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for database operations
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(io::Error),

    /// Parse error (journal or query text)
    Parse(String),

    /// Journal record too large (max 1 MB)
    ValueTooLarge(usize),

    /// Database full (max 1 GB)
    DatabaseFull(u64),

    /// Row not found
    NotFound {
        /// Table name
        table: String,
        /// Row identifier
        id: Id,
    },

    /// Database is closed
    Closed,

    /// Write rejected by a constraint
    Conflict(Conflict),

    /// Schema is inconsistent or a name does not resolve
    Schema(String),

    /// Query could not be planned or bound
    Query(String),
}

/// Constraint violations reported by a write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Conflict {
    /// Insert of an id that already exists
    DuplicateId {
        /// Table name
        table: String,
        /// Row identifier
        id: Id,
    },
    /// Update or delete of a row that does not exist
    MissingRow {
        /// Table name
        table: String,
        /// Row identifier
        id: Id,
    },
    /// Value does not match the declared column kind
    TypeMismatch {
        /// Table name
        table: String,
        /// Column name
        column: String,
        /// Declared kind
        expected: ValueKind,
    },
    /// Null written to a non-nullable column
    NullValue {
        /// Table name
        table: String,
        /// Column name
        column: String,
    },
    /// Reference column points at a row that does not exist
    DanglingReference {
        /// Table name
        table: String,
        /// Column name
        column: String,
        /// Referenced identifier
        target: Id,
    },
    /// Delete of a row that other rows still reference
    StillReferenced {
        /// Table name
        table: String,
        /// Row identifier
        id: Id,
        /// Referencing table
        by: String,
    },
    /// Shared identifier differs from the referenced row
    SharedId {
        /// Table name
        table: String,
        /// Supplied identifier
        id: Id,
        /// Identifier of the referenced row
        expected: Id,
    },
    /// Row has the wrong number of values for its table
    Arity {
        /// Table name
        table: String,
        /// Column count
        expected: usize,
        /// Supplied value count
        actual: usize,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Parse(msg) => write!(f, "Parse error: {}", msg),
            Error::ValueTooLarge(size) => write!(f, "Value too large: {} bytes (max 1 MB)", size),
            Error::DatabaseFull(size) => write!(f, "Database full: {} bytes (max 1 GB)", size),
            Error::NotFound { table, id } => write!(f, "Row not found: {}#{}", table, id),
            Error::Closed => write!(f, "Database is closed"),
            Error::Conflict(c) => write!(f, "Constraint violation: {}", c),
            Error::Schema(msg) => write!(f, "Schema error: {}", msg),
            Error::Query(msg) => write!(f, "Query error: {}", msg),
        }
    }
}

impl fmt::Display for Conflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Conflict::DuplicateId { table, id } => write!(f, "duplicate id {}#{}", table, id),
            Conflict::MissingRow { table, id } => write!(f, "no row {}#{}", table, id),
            Conflict::TypeMismatch {
                table,
                column,
                expected,
            } => write!(f, "{}.{} expects {:?}", table, column, expected),
            Conflict::NullValue { table, column } => write!(f, "{}.{} is not nullable", table, column),
            Conflict::DanglingReference {
                table,
                column,
                target,
            } => write!(f, "{}.{} references missing row {}", table, column, target),
            Conflict::StillReferenced { table, id, by } => {
                write!(f, "{}#{} is still referenced by {}", table, id, by)
            }
            Conflict::SharedId {
                table,
                id,
                expected,
            } => write!(f, "{}#{} must share id {}", table, id, expected),
            Conflict::Arity {
                table,
                expected,
                actual,
            } => write!(f, "{} expects {} values, got {}", table, expected, actual),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<Conflict> for Error {
    fn from(conflict: Conflict) -> Self {
        Error::Conflict(conflict)
    }
}

impl From<nom::Err<nom::error::Error<&[u8]>>> for Error {
    fn from(err: nom::Err<nom::error::Error<&[u8]>>) -> Self {
        Error::Parse(format!("{:?}", err))
    }
}

impl From<nom::Err<nom::error::Error<&str>>> for Error {
    fn from(err: nom::Err<nom::error::Error<&str>>) -> Self {
        Error::Parse(format!("{:?}", err))
    }
}
