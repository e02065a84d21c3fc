//! Server configuration.

use rowsync_engine::SyncOptions;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the sync server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum sessions with an upload or download in flight.
    pub max_sessions: usize,
    /// Idle time after which a session and its batches are dropped.
    pub session_timeout: Duration,
    /// Maximum parts a client may upload in one session.
    pub max_upload_parts: u32,
    /// Options of the server orchestrator.
    pub sync_options: SyncOptions,
}

impl ServerConfig {
    /// Creates a new server configuration.
    pub fn new(bind_addr: SocketAddr, sync_options: SyncOptions) -> Self {
        Self {
            bind_addr,
            max_sessions: 1000,
            session_timeout: Duration::from_secs(300),
            max_upload_parts: 10_000,
            sync_options,
        }
    }

    /// Sets the maximum concurrent sessions.
    pub fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Sets the session idle timeout.
    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Sets the maximum parts per upload.
    pub fn with_max_upload_parts(mut self, max: u32) -> Self {
        self.max_upload_parts = max;
        self
    }

    /// Replaces the orchestrator options.
    pub fn with_sync_options(mut self, options: SyncOptions) -> Self {
        self.sync_options = options;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(
            SocketAddr::from(([127, 0, 0, 1], 8080)),
            SyncOptions::new(PathBuf::from("rowsync").join("server_batches")),
        )
    }
}
