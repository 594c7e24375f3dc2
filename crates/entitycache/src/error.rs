//! Error types for entitycache

use std::fmt;

use crate::entity::EntityKey;

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to the caller of a session or coordinator
#[derive(Debug)]
pub enum Error {
    /// Entity has no state in the store
    NotFound(EntityKey),

    /// Write rejected by the store; the unit of work is aborted
    StoreConflict(rowstore::Conflict),

    /// Any other store failure (I/O, closed store, bad query text)
    Store(rowstore::Error),

    /// Entity type is not part of the metamodel
    UnknownEntity(String),

    /// Entity type has no such column or relation
    UnknownAttribute {
        /// Entity type
        entity: String,
        /// Attribute name
        attribute: String,
    },

    /// Operation needs a persistent instance of this session
    NotManaged(String),

    /// Another instance with the same key is already associated with the session
    DuplicateInstance(EntityKey),

    /// Identifier could not be determined at persist time
    MissingId(String),

    /// `unique_result` found more than one row
    NonUniqueResult(usize),

    /// Identifiers are immutable once assigned
    ImmutableId(EntityKey),

    /// Invalid configuration
    Config(String),

    /// Unit of work was aborted by an earlier failure or already ended
    SessionClosed,
}

/// Failures of the cache layer
///
/// These never escape the coordinator: they are logged and the access
/// degrades to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Region provider failed
    Unavailable {
        /// Region name
        region: String,
        /// Provider message
        reason: String,
    },

    /// Cached state disagrees with the metamodel
    InvariantViolation {
        /// Region name
        region: String,
        /// What was inconsistent
        reason: String,
    },

    /// Key is held by an exclusive soft lock
    Locked {
        /// Region name
        region: String,
    },
}

impl CacheError {
    /// Region the failure was reported for
    pub fn region(&self) -> &str {
        match self {
            CacheError::Unavailable { region, .. }
            | CacheError::InvariantViolation { region, .. }
            | CacheError::Locked { region } => region,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound(key) => write!(f, "Entity not found: {}", key),
            Error::StoreConflict(c) => write!(f, "Store rejected write: {}", c),
            Error::Store(e) => write!(f, "Store error: {}", e),
            Error::UnknownEntity(name) => write!(f, "Unknown entity type: {}", name),
            Error::UnknownAttribute { entity, attribute } => {
                write!(f, "{} has no attribute `{}`", entity, attribute)
            }
            Error::NotManaged(what) => write!(f, "Instance is not managed: {}", what),
            Error::DuplicateInstance(key) => {
                write!(f, "A different instance of {} is already managed", key)
            }
            Error::MissingId(what) => write!(f, "Missing identifier: {}", what),
            Error::NonUniqueResult(n) => write!(f, "Query returned {} rows, expected at most one", n),
            Error::ImmutableId(key) => write!(f, "Identifier of {} cannot change", key),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::SessionClosed => write!(f, "Session is closed"),
        }
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::Unavailable { region, reason } => {
                write!(f, "Region {} unavailable: {}", region, reason)
            }
            CacheError::InvariantViolation { region, reason } => {
                write!(f, "Invariant violated in region {}: {}", region, reason)
            }
            CacheError::Locked { region } => write!(f, "Key is locked in region {}", region),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl std::error::Error for CacheError {}

impl From<rowstore::Error> for Error {
    fn from(err: rowstore::Error) -> Self {
        match err {
            rowstore::Error::Conflict(conflict) => Error::StoreConflict(conflict),
            rowstore::Error::NotFound { table, id } => Error::NotFound(EntityKey::new(table, id)),
            other => Error::Store(other),
        }
    }
}
