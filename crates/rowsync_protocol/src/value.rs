//! Column values carried by sync rows.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A single column value.
///
/// Values serialize untagged so that JSON batch parts stay readable:
/// `null`, `true`, `42`, `1.5`, `"text"`, `[1, 2, 3]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum SyncValue {
    /// SQL NULL.
    #[default]
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit signed integer.
    Integer(i64),
    /// 64-bit float.
    Real(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl SyncValue {
    /// Returns true if the value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, SyncValue::Null)
    }

    /// Returns the integer value, if this is an integer.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            SyncValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the text value, if this is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SyncValue::Text(v) => Some(v),
            _ => None,
        }
    }

    /// Returns the float value, widening integers.
    pub fn as_real(&self) -> Option<f64> {
        match self {
            SyncValue::Real(v) => Some(*v),
            SyncValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Returns the boolean value, if this is a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            SyncValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the bytes, if this is a byte string.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            SyncValue::Bytes(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for SyncValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncValue::Null => write!(f, "NULL"),
            SyncValue::Bool(v) => write!(f, "{v}"),
            SyncValue::Integer(v) => write!(f, "{v}"),
            SyncValue::Real(v) => write!(f, "{v}"),
            SyncValue::Text(v) => write!(f, "'{v}'"),
            SyncValue::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

impl From<i64> for SyncValue {
    fn from(v: i64) -> Self {
        SyncValue::Integer(v)
    }
}

impl From<i32> for SyncValue {
    fn from(v: i32) -> Self {
        SyncValue::Integer(i64::from(v))
    }
}

impl From<f64> for SyncValue {
    fn from(v: f64) -> Self {
        SyncValue::Real(v)
    }
}

impl From<bool> for SyncValue {
    fn from(v: bool) -> Self {
        SyncValue::Bool(v)
    }
}

impl From<&str> for SyncValue {
    fn from(v: &str) -> Self {
        SyncValue::Text(v.to_string())
    }
}

impl From<String> for SyncValue {
    fn from(v: String) -> Self {
        SyncValue::Text(v)
    }
}

impl From<Vec<u8>> for SyncValue {
    fn from(v: Vec<u8>) -> Self {
        SyncValue::Bytes(v)
    }
}

impl<T: Into<SyncValue>> From<Option<T>> for SyncValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(SyncValue::Null, Into::into)
    }
}
