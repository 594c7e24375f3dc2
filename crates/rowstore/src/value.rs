//! Column values

use std::fmt;

/// Row identifier
pub type Id = u64;

/// A single column value
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Boolean
    Bool(bool),
    /// Signed integer, also used for reference columns
    Int(i64),
    /// UTF-8 text
    Text(String),
    /// Milliseconds since the Unix epoch
    Timestamp(i64),
}

/// Declared kind of a scalar column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// Boolean
    Bool,
    /// Signed integer
    Int,
    /// UTF-8 text
    Text,
    /// Milliseconds since the Unix epoch
    Timestamp,
}

impl Value {
    /// Kind of a non-null value
    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(ValueKind::Bool),
            Value::Int(_) => Some(ValueKind::Int),
            Value::Text(_) => Some(ValueKind::Text),
            Value::Timestamp(_) => Some(ValueKind::Timestamp),
        }
    }

    /// Is this NULL?
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Interpret the value as a row identifier (reference columns)
    pub fn as_id(&self) -> Option<Id> {
        match self {
            Value::Int(v) if *v >= 0 => Some(*v as Id),
            _ => None,
        }
    }

    /// Borrow text content
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Reference value for a row identifier
    pub fn from_id(id: Id) -> Self {
        Value::Int(id as i64)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Text(s) => write!(f, "{:?}", s),
            Value::Timestamp(ms) => write!(f, "@{}", ms),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}
