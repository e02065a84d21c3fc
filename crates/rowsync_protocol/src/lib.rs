//! # rowsync Protocol
//!
//! Shared data model for rowsync.
//!
//! This crate provides:
//! - `SyncValue`, `SyncRow` and `TableChanges` for changed rows
//! - `SyncSetup` and `SyncSchema` describing what a scope syncs
//! - `ClientScope`, `ServerScope` and `ServerHistoryScope` records
//! - `BatchInfo` manifests and part serializers (JSON, CBOR)
//! - Conflict policy and resolution types
//! - HTTP envelopes (`SyncMessage`) with CBOR encoding
//!
//! This is a pure protocol crate with no store access.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batch;
mod changes;
mod conflict;
mod error;
mod messages;
mod row;
mod schema;
mod scope;
mod serializer;
mod value;

pub use batch::{BatchInfo, BatchPartInfo, BatchPartTableInfo, SUMMARY_FILE_NAME};
pub use changes::{
    DatabaseChangesApplied, DatabaseChangesSelected, TableChangesApplied, TableChangesSelected,
};
pub use conflict::{ConflictResolution, ConflictResolutionPolicy, ConflictType, SyncConflict};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    EnsureScopeRequest, EnsureScopeResponse, ErrorResponse, EstimateChangesRequest,
    EstimateChangesResponse, GetMoreChangesRequest, GetSnapshotRequest, SendChangesRequest,
    SendChangesResponse, ServerStep, SessionContext, SnapshotResponse, SyncMessage, SyncType,
};
pub use row::{BatchPartContent, RowState, SyncRow, TableChanges};
pub use schema::{
    ColumnType, SetupTable, SyncColumn, SyncDirection, SyncRelation, SyncSchema, SyncSetup,
    SyncTable,
};
pub use scope::{now_millis, ClientScope, ServerHistoryScope, ServerScope};
pub use serializer::{
    from_cbor, serializer_for, to_cbor, BatchSerializer, CborSerializer, JsonSerializer,
    CBOR_SERIALIZER_KEY, JSON_SERIALIZER_KEY,
};
pub use value::SyncValue;
