//! Error types for the reference store.

use rowsync_engine::{StoreError, StoreErrorKind};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Native code for a generic failure.
pub const CODE_ERROR: i32 = 1;
/// Native code for a lost optimistic commit.
pub const CODE_BUSY: i32 = 5;
/// Native code for a database held by another process.
pub const CODE_LOCKED: i32 = 6;
/// Native code for an I/O failure.
pub const CODE_IOERR: i32 = 10;
/// Native code for a corrupted database file.
pub const CODE_CORRUPT: i32 = 11;
/// Native code for a foreign key violation.
pub const CODE_FOREIGN_KEY: i32 = 787;
/// Native code for a not-null violation.
pub const CODE_NOT_NULL: i32 = 1299;

/// Result type for store operations.
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Errors raised by the reference store.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The database file could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The database file is corrupted.
    #[error("database corrupted: {0}")]
    Corrupted(String),

    /// The database directory is locked by another process.
    #[error("database is locked: {}", .0.display())]
    Locked(PathBuf),

    /// A table does not exist.
    #[error("no such table: {0}")]
    NoSuchTable(String),

    /// A column does not exist.
    #[error("no such column: {table}.{column}")]
    NoSuchColumn {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// An object already exists.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// A row does not fit the table.
    #[error("schema mismatch: {0}")]
    Schema(String),

    /// A constraint was violated.
    #[error("constraint failed: {message}")]
    Constraint {
        /// Native constraint code.
        code: i32,
        /// Violation detail.
        message: String,
    },

    /// Another transaction committed first.
    #[error("database is busy: a concurrent transaction committed first")]
    Busy,

    /// A failure injected by a test.
    #[error("injected failure: {0}")]
    Injected(StoreError),
}

impl MemoryError {
    pub(crate) fn foreign_key(message: impl Into<String>) -> Self {
        Self::Constraint {
            code: CODE_FOREIGN_KEY,
            message: message.into(),
        }
    }

    pub(crate) fn not_null(message: impl Into<String>) -> Self {
        Self::Constraint {
            code: CODE_NOT_NULL,
            message: message.into(),
        }
    }

    /// Returns the native error code.
    pub fn code(&self) -> i32 {
        match self {
            Self::Io(_) => CODE_IOERR,
            Self::Serialization(_) | Self::Corrupted(_) => CODE_CORRUPT,
            Self::Locked(_) => CODE_LOCKED,
            Self::Busy => CODE_BUSY,
            Self::Constraint { code, .. } => *code,
            Self::Injected(e) => e.code,
            Self::NoSuchTable(_)
            | Self::NoSuchColumn { .. }
            | Self::AlreadyExists(_)
            | Self::Schema(_) => CODE_ERROR,
        }
    }
}

impl From<MemoryError> for StoreError {
    fn from(err: MemoryError) -> Self {
        let kind = match &err {
            MemoryError::Injected(e) => return e.clone(),
            MemoryError::Io(_) | MemoryError::Serialization(_) | MemoryError::Corrupted(_) => {
                StoreErrorKind::Other
            }
            MemoryError::Locked(_) | MemoryError::Busy => StoreErrorKind::Busy,
            MemoryError::NoSuchTable(_) => StoreErrorKind::NotFound,
            MemoryError::NoSuchColumn { .. }
            | MemoryError::AlreadyExists(_)
            | MemoryError::Schema(_) => StoreErrorKind::Schema,
            MemoryError::Constraint { .. } => StoreErrorKind::Constraint,
        };
        StoreError::new(kind, err.code(), err.to_string())
    }
}
