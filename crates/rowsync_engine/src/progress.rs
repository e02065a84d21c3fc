//! Session stages and progress notifications.

use std::fmt;

/// A stage of a sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncStage {
    /// Session started.
    BeginSession,
    /// Scope records are being loaded or created.
    ScopeLoading,
    /// Setup changes are being applied to the store.
    Migrating,
    /// Tracking objects are being created.
    Provisioning,
    /// Tracking objects are being removed.
    Deprovisioning,
    /// Changed rows are being selected.
    ChangesSelecting,
    /// Incoming rows are being applied.
    ChangesApplying,
    /// A snapshot is being written.
    SnapshotCreating,
    /// A snapshot is being applied.
    SnapshotApplying,
    /// Tombstones are being purged.
    MetadataCleaning,
    /// Session finished.
    EndSession,
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Which side of the protocol is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncSide {
    /// The client (local orchestrator).
    Client,
    /// The server (remote orchestrator).
    Server,
}

impl SyncSide {
    /// Returns true on the server side.
    pub fn is_server(&self) -> bool {
        matches!(self, SyncSide::Server)
    }
}

/// Progress notification emitted at each stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressArgs {
    /// Stage reached.
    pub stage: SyncStage,
    /// Side emitting the notification.
    pub side: SyncSide,
    /// Human-readable detail.
    pub message: String,
}

impl ProgressArgs {
    /// Creates a progress notification.
    pub fn new(stage: SyncStage, side: SyncSide, message: impl Into<String>) -> Self {
        Self {
            stage,
            side,
            message: message.into(),
        }
    }
}
