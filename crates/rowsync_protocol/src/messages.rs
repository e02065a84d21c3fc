//! Protocol messages exchanged over HTTP.
//!
//! Every request carries a [`SessionContext`]. Uploads are sent one part per
//! [`SendChangesRequest`]; downloads are paginated with
//! [`GetMoreChangesRequest`]. Messages are encoded as CBOR.

use crate::changes::{DatabaseChangesApplied, DatabaseChangesSelected};
use crate::conflict::ConflictResolutionPolicy;
use crate::error::ProtocolResult;
use crate::schema::{SyncSchema, SyncSetup};
use crate::scope::{ClientScope, ServerScope};
use crate::serializer::{from_cbor, to_cbor, JSON_SERIALIZER_KEY};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of synchronization session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SyncType {
    /// Upload local changes, then download remote changes.
    #[default]
    Normal,
    /// Discard local changes, reset tables and download everything.
    Reinitialize,
    /// Upload local changes, then reset tables and download everything.
    ReinitializeWithUpload,
}

impl SyncType {
    /// Returns true for both reinitialize variants.
    pub fn is_reinitialize(&self) -> bool {
        !matches!(self, SyncType::Normal)
    }

    /// Returns true if local changes are uploaded.
    pub fn uploads(&self) -> bool {
        !matches!(self, SyncType::Reinitialize)
    }
}

impl std::str::FromStr for SyncType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "normal" => Ok(SyncType::Normal),
            "reinitialize" => Ok(SyncType::Reinitialize),
            "reinitializewithupload" => Ok(SyncType::ReinitializeWithUpload),
            other => Err(format!("unknown sync type: {other}")),
        }
    }
}

/// Per-session context sent with every request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionContext {
    /// Session identifier, generated by the client.
    pub session_id: Uuid,
    /// Scope name.
    pub scope_name: String,
    /// Client scope identifier.
    pub client_scope_id: Uuid,
    /// Sync type.
    pub sync_type: SyncType,
    /// Serializer key used for part payloads.
    pub serializer: String,
    /// Part size threshold in kilobytes.
    pub batch_size_kb: u64,
}

impl SessionContext {
    /// Creates a context for a new session.
    pub fn new(scope_name: impl Into<String>, client_scope_id: Uuid, sync_type: SyncType) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            scope_name: scope_name.into(),
            client_scope_id,
            sync_type,
            serializer: JSON_SERIALIZER_KEY.to_string(),
            batch_size_kb: 5000,
        }
    }

    /// Sets the serializer key.
    pub fn with_serializer(mut self, serializer: impl Into<String>) -> Self {
        self.serializer = serializer.into();
        self
    }

    /// Sets the part size threshold.
    pub fn with_batch_size_kb(mut self, batch_size_kb: u64) -> Self {
        self.batch_size_kb = batch_size_kb;
        self
    }
}

/// Asks the server for its scope, provisioning it if needed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsureScopeRequest {
    /// Session context.
    pub context: SessionContext,
    /// Setup proposed by the client, if any.
    pub setup: Option<SyncSetup>,
}

/// Server scope returned by [`EnsureScopeRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsureScopeResponse {
    /// Session context.
    pub context: SessionContext,
    /// Server scope (setup and schema).
    pub server_scope: ServerScope,
}

/// One uploaded part of the client's batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendChangesRequest {
    /// Session context.
    pub context: SessionContext,
    /// Client scope as of the start of the session.
    pub client_scope: ClientScope,
    /// Part index.
    pub batch_index: u32,
    /// True for the final part.
    pub is_last_batch: bool,
    /// Serialized part content, `None` when the client has nothing to send.
    pub changes: Option<Vec<u8>>,
}

/// Step reached by the server when answering a change request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerStep {
    /// A non-final upload part was stored.
    PartAcknowledged,
    /// Changes were applied and a download batch was selected.
    ChangesSelected,
    /// A page of an existing download batch.
    MoreChanges,
}

/// Server answer to an upload part or a page request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendChangesResponse {
    /// Session context.
    pub context: SessionContext,
    /// Server step.
    pub server_step: ServerStep,
    /// Index of the part in `changes`.
    pub batch_index: u32,
    /// Number of parts in the download batch.
    pub batch_count: u32,
    /// True if `changes` is the final part.
    pub is_last_batch: bool,
    /// Server logical timestamp the client stores as its remote timestamp.
    pub remote_client_timestamp: u64,
    /// Serialized part content.
    pub changes: Option<Vec<u8>>,
    /// Changes selected by the server for this client.
    pub changes_selected: DatabaseChangesSelected,
    /// Changes applied on the server from the upload.
    pub changes_applied: DatabaseChangesApplied,
    /// Conflict policy used by the server.
    pub policy: ConflictResolutionPolicy,
    /// Timestamp bounding the download batch.
    pub timestamp: u64,
    /// Schema of the download batch.
    pub schema: Option<SyncSchema>,
}

impl SendChangesResponse {
    /// Creates an acknowledgement for a non-final upload part.
    pub fn acknowledge(context: SessionContext, batch_index: u32) -> Self {
        Self {
            context,
            server_step: ServerStep::PartAcknowledged,
            batch_index,
            batch_count: 0,
            is_last_batch: false,
            remote_client_timestamp: 0,
            changes: None,
            changes_selected: DatabaseChangesSelected::default(),
            changes_applied: DatabaseChangesApplied::default(),
            policy: ConflictResolutionPolicy::default(),
            timestamp: 0,
            schema: None,
        }
    }
}

/// Requests one page of the pending download batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetMoreChangesRequest {
    /// Session context.
    pub context: SessionContext,
    /// Part index requested.
    pub batch_index_requested: u32,
}

/// Asks how many rows the server would send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimateChangesRequest {
    /// Session context.
    pub context: SessionContext,
    /// Client scope.
    pub client_scope: ClientScope,
}

/// Estimated counts returned by [`EstimateChangesRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimateChangesResponse {
    /// Session context.
    pub context: SessionContext,
    /// Current server logical timestamp.
    pub remote_client_timestamp: u64,
    /// Estimated counts.
    pub changes_selected: DatabaseChangesSelected,
}

/// Asks for the scope's snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSnapshotRequest {
    /// Session context.
    pub context: SessionContext,
}

/// Snapshot summary. Parts are fetched with [`GetMoreChangesRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotResponse {
    /// Session context.
    pub context: SessionContext,
    /// False when no snapshot exists.
    pub has_snapshot: bool,
    /// Logical timestamp the snapshot was taken at.
    pub timestamp: u64,
    /// Number of parts.
    pub batch_count: u32,
    /// Rows in the snapshot.
    pub changes_selected: DatabaseChangesSelected,
    /// Schema of the snapshot batch.
    pub schema: Option<SyncSchema>,
}

/// Error returned by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Stage that failed.
    pub stage: String,
    /// Error message.
    pub message: String,
    /// True if the client may retry the session.
    pub retryable: bool,
}

impl ErrorResponse {
    /// Creates an error response.
    pub fn new(stage: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            stage: stage.into(),
            message: message.into(),
            retryable,
        }
    }
}

/// A sync protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Scope request.
    EnsureScopeRequest(EnsureScopeRequest),
    /// Scope response.
    EnsureScopeResponse(EnsureScopeResponse),
    /// Upload part.
    SendChangesRequest(SendChangesRequest),
    /// Upload acknowledgement or download page.
    SendChangesResponse(SendChangesResponse),
    /// Download page request.
    GetMoreChangesRequest(GetMoreChangesRequest),
    /// Estimate request.
    EstimateChangesRequest(EstimateChangesRequest),
    /// Estimate response.
    EstimateChangesResponse(EstimateChangesResponse),
    /// Snapshot request.
    GetSnapshotRequest(GetSnapshotRequest),
    /// Snapshot response.
    SnapshotResponse(SnapshotResponse),
    /// Error.
    Error(ErrorResponse),
}

impl SyncMessage {
    /// Returns the message type code.
    pub fn type_code(&self) -> u8 {
        match self {
            SyncMessage::EnsureScopeRequest(_) => 1,
            SyncMessage::EnsureScopeResponse(_) => 2,
            SyncMessage::SendChangesRequest(_) => 3,
            SyncMessage::SendChangesResponse(_) => 4,
            SyncMessage::GetMoreChangesRequest(_) => 5,
            SyncMessage::EstimateChangesRequest(_) => 6,
            SyncMessage::EstimateChangesResponse(_) => 7,
            SyncMessage::GetSnapshotRequest(_) => 8,
            SyncMessage::SnapshotResponse(_) => 9,
            SyncMessage::Error(_) => 255,
        }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }

    /// Returns the session context, if the message carries one.
    pub fn context(&self) -> Option<&SessionContext> {
        match self {
            SyncMessage::EnsureScopeRequest(m) => Some(&m.context),
            SyncMessage::EnsureScopeResponse(m) => Some(&m.context),
            SyncMessage::SendChangesRequest(m) => Some(&m.context),
            SyncMessage::SendChangesResponse(m) => Some(&m.context),
            SyncMessage::GetMoreChangesRequest(m) => Some(&m.context),
            SyncMessage::EstimateChangesRequest(m) => Some(&m.context),
            SyncMessage::EstimateChangesResponse(m) => Some(&m.context),
            SyncMessage::GetSnapshotRequest(m) => Some(&m.context),
            SyncMessage::SnapshotResponse(m) => Some(&m.context),
            SyncMessage::Error(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{BatchPartContent, SyncRow, TableChanges};
    use crate::serializer::{BatchSerializer, JsonSerializer};

    fn context() -> SessionContext {
        SessionContext::new("default", Uuid::new_v4(), SyncType::Normal)
    }

    #[test]
    fn send_changes_carries_part_bytes() {
        let mut table = TableChanges::new("customer", vec!["id".into()]);
        table.rows.push(SyncRow::upsert(vec![7.into()]));
        let part = JsonSerializer
            .serialize_part(&BatchPartContent::single(table))
            .unwrap();

        let msg = SyncMessage::SendChangesRequest(SendChangesRequest {
            context: context(),
            client_scope: ClientScope::new("default"),
            batch_index: 0,
            is_last_batch: true,
            changes: Some(part.clone()),
        });
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        match decoded {
            SyncMessage::SendChangesRequest(req) => {
                assert!(req.is_last_batch);
                let content = JsonSerializer
                    .deserialize_part(req.changes.as_deref().unwrap())
                    .unwrap();
                assert_eq!(content.rows_count(), 1);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn acknowledgement_is_not_last() {
        let ack = SendChangesResponse::acknowledge(context(), 3);
        assert_eq!(ack.server_step, ServerStep::PartAcknowledged);
        assert_eq!(ack.batch_index, 3);
        assert!(!ack.is_last_batch);
        assert!(ack.changes.is_none());
    }

    #[test]
    fn type_codes_and_context() {
        let ctx = context();
        let msg = SyncMessage::GetMoreChangesRequest(GetMoreChangesRequest {
            context: ctx.clone(),
            batch_index_requested: 1,
        });
        assert_eq!(msg.type_code(), 5);
        assert_eq!(msg.context(), Some(&ctx));

        let err = SyncMessage::Error(ErrorResponse::new("ChangesApplying", "boom", false));
        assert_eq!(err.type_code(), 255);
        assert!(err.context().is_none());
    }

    #[test]
    fn sync_type_flags() {
        assert!(SyncType::Normal.uploads());
        assert!(!SyncType::Normal.is_reinitialize());
        assert!(!SyncType::Reinitialize.uploads());
        assert!(SyncType::ReinitializeWithUpload.uploads());
        assert!(SyncType::ReinitializeWithUpload.is_reinitialize());
        assert_eq!(
            "reinitialize-with-upload".parse::<SyncType>(),
            Ok(SyncType::ReinitializeWithUpload)
        );
    }

    #[test]
    fn decode_garbage_fails() {
        assert!(SyncMessage::decode(&[0x01, 0x02, 0x03]).is_err());
    }
}
