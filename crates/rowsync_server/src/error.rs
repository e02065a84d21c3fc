//! Error types for the sync server.

use rowsync_engine::SyncError;
use rowsync_protocol::ProtocolError;
use thiserror::Error;
use uuid::Uuid;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur in the sync server.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The request refers to a session the server does not hold.
    #[error("unknown session: {0}")]
    UnknownSession(Uuid),

    /// The session registry is full.
    #[error("too many sessions: limit is {0}")]
    TooManySessions(usize),

    /// The client uploaded more parts than allowed.
    #[error("upload too large: more than {max} parts")]
    UploadTooLarge {
        /// Configured limit.
        max: u32,
    },

    /// The orchestrator failed.
    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Envelope encoding failed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Returns true if this is a client error (4xx).
    pub fn is_client_error(&self) -> bool {
        match self {
            ServerError::InvalidRequest(_)
            | ServerError::UnknownSession(_)
            | ServerError::UploadTooLarge { .. }
            | ServerError::Protocol(_) => true,
            ServerError::Sync(e) => matches!(
                e.root(),
                SyncError::InvalidScope { .. }
                    | SyncError::ConflictingSetup { .. }
                    | SyncError::Serialization(_)
            ),
            _ => false,
        }
    }

    /// Returns true if this is a server error (5xx).
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }

    /// Returns true if the client may retry the session as is.
    ///
    /// Store errors are classified separately by the provider.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServerError::TooManySessions(_) => true,
            ServerError::Sync(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Returns the name of the failing stage, `"Server"` when none was
    /// recorded.
    pub fn stage_name(&self) -> String {
        match self {
            ServerError::Sync(e) => e
                .stage()
                .map_or_else(|| "Server".to_string(), |s| s.to_string()),
            _ => "Server".to_string(),
        }
    }
}
