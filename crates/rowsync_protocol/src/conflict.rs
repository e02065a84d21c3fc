//! Conflict classification and resolution.

use crate::row::SyncRow;
use serde::{Deserialize, Serialize};

/// Policy for automatic conflict resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConflictResolutionPolicy {
    /// The server's row is kept.
    #[default]
    ServerWins,
    /// The client's row is kept.
    ClientWins,
}

impl ConflictResolutionPolicy {
    /// Converts to a code.
    pub fn to_code(&self) -> u8 {
        match self {
            ConflictResolutionPolicy::ServerWins => 1,
            ConflictResolutionPolicy::ClientWins => 2,
        }
    }

    /// Converts from a code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(ConflictResolutionPolicy::ServerWins),
            2 => Some(ConflictResolutionPolicy::ClientWins),
            _ => None,
        }
    }

    /// Maps the policy onto a resolution.
    pub fn resolution(&self) -> ConflictResolution {
        match self {
            ConflictResolutionPolicy::ServerWins => ConflictResolution::ServerWins,
            ConflictResolutionPolicy::ClientWins => ConflictResolution::ClientWins,
        }
    }
}

impl std::str::FromStr for ConflictResolutionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "serverwins" => Ok(ConflictResolutionPolicy::ServerWins),
            "clientwins" => Ok(ConflictResolutionPolicy::ClientWins),
            other => Err(format!("unknown conflict policy: {other}")),
        }
    }
}

/// Kind of conflict between an incoming row and the local row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictType {
    /// Both sides updated the row.
    RemoteUpdateLocalUpdate,
    /// Remote updated a row deleted locally.
    RemoteUpdateLocalDelete,
    /// Remote deleted a row updated locally.
    RemoteDeleteLocalUpdate,
    /// Both sides deleted the row.
    RemoteDeleteLocalDelete,
}

impl ConflictType {
    /// Classifies a conflict from the incoming and local deletion states.
    pub fn classify(remote_deleted: bool, local_deleted: bool) -> Self {
        match (remote_deleted, local_deleted) {
            (false, false) => ConflictType::RemoteUpdateLocalUpdate,
            (false, true) => ConflictType::RemoteUpdateLocalDelete,
            (true, false) => ConflictType::RemoteDeleteLocalUpdate,
            (true, true) => ConflictType::RemoteDeleteLocalDelete,
        }
    }

    /// Returns true if one side deleted and the other updated.
    pub fn is_delete_update(&self) -> bool {
        matches!(
            self,
            ConflictType::RemoteUpdateLocalDelete | ConflictType::RemoteDeleteLocalUpdate
        )
    }
}

/// A detected conflict, handed to the conflict interceptor.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConflict {
    /// Table name.
    pub table_name: String,
    /// Conflict kind.
    pub conflict_type: ConflictType,
    /// Current local row, if it still exists.
    pub local_row: Option<SyncRow>,
    /// Incoming row.
    pub remote_row: SyncRow,
}

impl SyncConflict {
    /// Creates a conflict.
    pub fn new(
        table_name: impl Into<String>,
        local_row: Option<SyncRow>,
        remote_row: SyncRow,
    ) -> Self {
        let local_deleted = local_row.as_ref().map_or(true, SyncRow::is_deleted);
        Self {
            table_name: table_name.into(),
            conflict_type: ConflictType::classify(remote_row.is_deleted(), local_deleted),
            local_row,
            remote_row,
        }
    }
}

/// Outcome chosen for a conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum ConflictResolution {
    /// Keep the server's row.
    ServerWins,
    /// Keep the client's row.
    ClientWins,
    /// Write this merged row locally and send it back to the peer.
    MergeRow(SyncRow),
}

impl ConflictResolution {
    /// Returns true if the local row should be replaced by the incoming one,
    /// given which side is applying.
    pub fn applies_incoming(&self, applying_on_server: bool) -> bool {
        match self {
            ConflictResolution::ServerWins => !applying_on_server,
            ConflictResolution::ClientWins => applying_on_server,
            ConflictResolution::MergeRow(_) => false,
        }
    }
}
