//! Orchestrators: the per-side sequences of a sync session.
//!
//! - [`LocalOrchestrator`] runs on clients
//! - [`RemoteOrchestrator`] runs on the server
//!
//! Both share a [`BaseOrchestrator`] holding the provider, options, hooks
//! and cancellation token. Every public operation accepts an optional
//! caller-owned connection; when one is given the operation neither commits
//! nor rolls it back.

mod base;
mod local;
mod remote;

pub use base::BaseOrchestrator;
pub use local::{ClientApply, LocalOrchestrator};
pub use remote::RemoteOrchestrator;

use rowsync_protocol::{
    BatchInfo, ConflictResolutionPolicy, DatabaseChangesApplied, DatabaseChangesSelected,
};

/// Changes selected on a client.
#[derive(Debug, Clone)]
pub struct ClientChanges {
    /// Local logical timestamp read before selecting.
    pub timestamp: u64,
    /// Selected rows. Empty for new scopes.
    pub batch: BatchInfo,
    /// Counts of selected rows.
    pub changes_selected: DatabaseChangesSelected,
}

/// Outcome of the server's apply-then-select step.
#[derive(Debug, Clone)]
pub struct ServerChanges {
    /// Server logical timestamp the client stores as its remote timestamp.
    pub remote_client_timestamp: u64,
    /// Rows selected for the client.
    pub batch: BatchInfo,
    /// Counts of rows selected for the client.
    pub changes_selected: DatabaseChangesSelected,
    /// Counts of client rows applied on the server.
    pub changes_applied: DatabaseChangesApplied,
    /// Policy the server applied.
    pub policy: ConflictResolutionPolicy,
}

/// Estimated counts of pending changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstimatedChanges {
    /// Logical timestamp read before counting.
    pub timestamp: u64,
    /// Estimated counts.
    pub changes_selected: DatabaseChangesSelected,
}
