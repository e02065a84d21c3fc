//! Scope metadata records.
//!
//! A scope is one named synchronization unit. Each side persists its own
//! view of it:
//!
//! - [`ClientScope`] on clients, including the last remote timestamp seen
//! - [`ServerScope`] on the server, the source of truth for setup and schema
//! - [`ServerHistoryScope`] on the server, one row per client that synced

use crate::schema::{SyncSchema, SyncSetup};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Returns the current wall time in unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Client-side scope record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientScope {
    /// Stable identifier, generated once.
    pub id: Uuid,
    /// Scope name.
    pub name: String,
    /// Setup this client was provisioned with.
    pub setup: Option<SyncSetup>,
    /// Schema this client was provisioned with.
    pub schema: Option<SyncSchema>,
    /// True until the first successful change application.
    pub is_new_scope: bool,
    /// Local logical timestamp of the last successful sync.
    pub last_sync_timestamp: u64,
    /// Server logical timestamp seen at the last successful sync.
    pub last_server_sync_timestamp: u64,
    /// Floor used by the last metadata cleanup.
    #[serde(default)]
    pub last_cleanup_timestamp: u64,
    /// Wall time of the last sync (unix millis), informational only.
    pub last_sync: Option<u64>,
    /// Duration of the last sync in milliseconds.
    pub last_sync_duration_ms: u64,
}

impl ClientScope {
    /// Creates a new, never-synced client scope.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            setup: None,
            schema: None,
            is_new_scope: true,
            last_sync_timestamp: 0,
            last_server_sync_timestamp: 0,
            last_cleanup_timestamp: 0,
            last_sync: None,
            last_sync_duration_ms: 0,
        }
    }

    /// Returns true if the scope has a resolved schema.
    pub fn has_schema(&self) -> bool {
        self.schema.as_ref().is_some_and(|s| !s.is_empty())
    }
}

/// Server-side scope record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerScope {
    /// Stable identifier, generated once. Clients stamp rows applied from
    /// this server with it.
    pub id: Uuid,
    /// Scope name.
    pub name: String,
    /// Setup (source of truth).
    pub setup: Option<SyncSetup>,
    /// Resolved schema (source of truth).
    pub schema: Option<SyncSchema>,
    /// Local logical timestamp of the last session served.
    pub last_sync_timestamp: u64,
    /// Floor used by the last metadata cleanup.
    pub last_cleanup_timestamp: u64,
    /// Wall time of the last session served (unix millis).
    pub last_sync: Option<u64>,
    /// Duration of the last session served in milliseconds.
    pub last_sync_duration_ms: u64,
}

impl ServerScope {
    /// Creates a new server scope with no setup.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            setup: None,
            schema: None,
            last_sync_timestamp: 0,
            last_cleanup_timestamp: 0,
            last_sync: None,
            last_sync_duration_ms: 0,
        }
    }

    /// Returns true if the scope has a resolved schema.
    pub fn has_schema(&self) -> bool {
        self.schema.as_ref().is_some_and(|s| !s.is_empty())
    }
}

/// One row of the server's append-only sync history, keyed by client id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerHistoryScope {
    /// Client scope identifier.
    pub id: Uuid,
    /// Scope name.
    pub name: String,
    /// Server logical timestamp handed to this client at its last sync.
    pub last_sync_timestamp: u64,
    /// Wall time of that sync (unix millis).
    pub last_sync: Option<u64>,
    /// Duration of that sync in milliseconds.
    pub last_sync_duration_ms: u64,
}

impl ServerHistoryScope {
    /// Creates a history entry for a client.
    pub fn new(id: Uuid, name: impl Into<String>, last_sync_timestamp: u64) -> Self {
        Self {
            id,
            name: name.into(),
            last_sync_timestamp,
            last_sync: Some(now_millis()),
            last_sync_duration_ms: 0,
        }
    }
}
