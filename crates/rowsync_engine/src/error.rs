//! Error types for the sync engine.

use crate::progress::SyncStage;
use rowsync_protocol::ProtocolError;
use std::fmt;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type for provider operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Classification of a provider error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreErrorKind {
    /// Connection lost or unusable.
    Connection,
    /// Store busy or a concurrent commit won; the operation can be retried.
    Busy,
    /// Constraint violation (foreign key, not null, unique).
    Constraint,
    /// Object does not exist.
    NotFound,
    /// Schema object mismatch.
    Schema,
    /// Anything else.
    Other,
}

/// An error raised by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreError {
    /// Error classification.
    pub kind: StoreErrorKind,
    /// Native error code of the underlying store.
    pub code: i32,
    /// Error message.
    pub message: String,
}

impl StoreError {
    /// Creates a store error.
    pub fn new(kind: StoreErrorKind, code: i32, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
        }
    }

    /// Creates a connection error.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Connection, 0, message)
    }

    /// Creates a not-found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::NotFound, 0, message)
    }

    /// Creates a schema error.
    pub fn schema(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Schema, 0, message)
    }

    /// Returns true if the error aborts change application.
    pub fn is_fatal(&self) -> bool {
        self.kind == StoreErrorKind::Connection
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({}): {}", self.kind, self.code, self.message)
    }
}

impl std::error::Error for StoreError {}

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// The scope has no resolved schema.
    #[error("scope {scope_name} has no schema")]
    MissingSchema {
        /// Scope name.
        scope_name: String,
    },

    /// A table named in the setup does not exist.
    #[error("table {table} does not exist")]
    MissingTable {
        /// Table name.
        table: String,
    },

    /// A column named in the setup does not exist.
    #[error("column {column} does not exist in table {table}")]
    MissingColumn {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// A table has no primary key.
    #[error("table {table} has no primary key")]
    MissingPrimaryKey {
        /// Table name.
        table: String,
    },

    /// The requested scope does not match.
    #[error("invalid scope: expected {expected}, got {actual}")]
    InvalidScope {
        /// Scope name expected by the callee.
        expected: String,
        /// Scope name supplied by the caller.
        actual: String,
    },

    /// The requested setup conflicts with the stored one.
    #[error("conflicting setup for scope {scope_name}: {reason}")]
    ConflictingSetup {
        /// Scope name.
        scope_name: String,
        /// Why the setups conflict.
        reason: String,
    },

    /// The provider cannot act as a server.
    #[error("provider {provider} cannot act as a server")]
    UnsupportedServerRole {
        /// Provider name.
        provider: String,
    },

    /// Snapshot options are missing.
    #[error("snapshot configuration error: {0}")]
    SnapshotConfig(String),

    /// Provider error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Batch or envelope serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] ProtocolError),

    /// Batch file I/O failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the session can be retried.
        retryable: bool,
    },

    /// Server rejected the request.
    #[error("server error: {0}")]
    Server(String),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// Failure wrapped with the stage it happened in.
    #[error("{stage} failed: {source}")]
    Stage {
        /// Failing stage.
        stage: SyncStage,
        /// Underlying error.
        #[source]
        source: Box<SyncError>,
    },
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Creates a conflicting setup error.
    pub fn conflicting_setup(scope_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConflictingSetup {
            scope_name: scope_name.into(),
            reason: reason.into(),
        }
    }

    /// Wraps the error with a stage. Already-wrapped errors keep their stage.
    pub fn in_stage(self, stage: SyncStage) -> Self {
        match self {
            SyncError::Stage { .. } => self,
            other => SyncError::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }

    /// Returns the stage the error was raised in, if recorded.
    pub fn stage(&self) -> Option<SyncStage> {
        match self {
            SyncError::Stage { stage, source } => source.stage().or(Some(*stage)),
            _ => None,
        }
    }

    /// Returns the error without its stage wrapper.
    pub fn root(&self) -> &SyncError {
        match self {
            SyncError::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// Returns the underlying store error, if any.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self.root() {
            SyncError::Store(e) => Some(e),
            _ => None,
        }
    }

    /// Returns the provider's native error code, if any.
    pub fn native_code(&self) -> Option<i32> {
        self.store_error().map(|e| e.code)
    }

    /// Returns true if the error is a cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), SyncError::Cancelled)
    }

    /// Returns true if the transport reported the failure as transient.
    ///
    /// Store errors are classified by the provider, see
    /// [`SyncProvider::should_retry`](crate::SyncProvider::should_retry).
    pub fn is_retryable(&self) -> bool {
        matches!(self.root(), SyncError::Transport { retryable: true, .. })
    }
}

/// Extension for attaching a stage to results.
pub trait StageExt<T> {
    /// Wraps an error with the stage.
    fn in_stage(self, stage: SyncStage) -> SyncResult<T>;
}

impl<T, E: Into<SyncError>> StageExt<T> for Result<T, E> {
    fn in_stage(self, stage: SyncStage) -> SyncResult<T> {
        self.map_err(|e| e.into().in_stage(stage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(SyncError::transport_retryable("connection lost").is_retryable());
        assert!(!SyncError::transport_fatal("invalid certificate").is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(SyncError::transport_retryable("reset")
            .in_stage(SyncStage::ChangesApplying)
            .is_retryable());
    }

    #[test]
    fn stage_is_recorded_once() {
        let err = SyncError::Cancelled
            .in_stage(SyncStage::ChangesSelecting)
            .in_stage(SyncStage::EndSession);
        assert_eq!(err.stage(), Some(SyncStage::ChangesSelecting));
        assert!(err.is_cancelled());
        assert!(err.to_string().contains("ChangesSelecting"));
    }

    #[test]
    fn native_code_survives_wrapping() {
        let store = StoreError::new(StoreErrorKind::Constraint, 787, "FOREIGN KEY constraint failed");
        let err = SyncError::from(store).in_stage(SyncStage::ChangesApplying);
        assert_eq!(err.native_code(), Some(787));
        assert_eq!(err.store_error().map(|e| e.kind), Some(StoreErrorKind::Constraint));
    }

    #[test]
    fn only_connection_errors_are_fatal() {
        assert!(StoreError::connection("gone").is_fatal());
        assert!(!StoreError::new(StoreErrorKind::Busy, 5, "locked").is_fatal());
        assert!(!StoreError::not_found("t").is_fatal());
    }

    #[test]
    fn error_display() {
        let err = SyncError::MissingColumn {
            table: "customer".into(),
            column: "email".into(),
        };
        assert_eq!(err.to_string(), "column email does not exist in table customer");
    }
}
