//! # rowsync Engine
//!
//! Bidirectional, scope-based synchronization between a central server
//! database and many client databases.
//!
//! This crate provides:
//! - Provider capability traits adapting a store to the sync core
//! - Scope metadata, dependency ordering and schema resolution
//! - Timestamp-bounded change detection with per-row tracking
//! - Size-bounded batch files with a JSON manifest
//! - Conflict-aware apply with policies and interception hooks
//! - Local and remote orchestrators, in-process and HTTP transports
//! - A `SyncAgent` state machine with retry and cancellation
//!
//! ## Architecture
//!
//! A session is **upload, then apply-and-select on the server, then
//! download**:
//! 1. The client selects rows changed since its last sync
//! 2. The server applies them in one transaction
//! 3. In a second transaction the server selects rows changed since the
//!    client's last download, excluding what the client just sent
//! 4. The client applies the server's rows and advances its timestamps
//!
//! ## Key Invariants
//!
//! - Timestamps never decrease across sessions
//! - Rows applied from a peer are never sent back to that peer
//! - Parents are applied before children, deletes children first
//! - A batch is consumed only once its manifest is written

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod agent;
mod applier;
mod batch;
mod cancel;
mod config;
mod delta;
mod error;
mod http;
mod interceptor;
mod metadata;
mod orchestrator;
mod progress;
mod provider;
mod schema;
mod scope_store;
mod sorter;
mod transport;

pub use agent::{AgentStats, SyncAgent, SyncState, SyncSummary};
pub use applier::{apply_changes, ApplyRequest};
pub use batch::{
    load_part, read_batch, read_part_bytes, remove_batch, rows_for_table, write_batch,
    BatchWriter, TableRows,
};
pub use cancel::CancellationToken;
pub use config::{RetryConfig, SyncOptions};
pub use delta::{estimate_changes, outgoing_tables, select_changes, DeltaFilter, SelectedRows};
pub use error::{StageExt, StoreError, StoreErrorKind, StoreResult, SyncError, SyncResult};
pub use http::{
    HttpClient, HttpTransport, LoopbackClient, LoopbackServer, ENSURE_SCOPE_PATH, ESTIMATE_PATH,
    GET_MORE_CHANGES_PATH, SEND_CHANGES_PATH, SNAPSHOT_PATH,
};
pub use interceptor::{
    ConflictAction, ConflictingSetupAction, ConflictingSetupArgs, Interceptors,
    RowApplyingAction, RowApplyingArgs, TableProvisioningAction, TableProvisioningArgs,
};
pub use metadata::{delete_metadata, DatabaseMetadatasCleaned, TableMetadatasCleaned};
pub use orchestrator::{
    BaseOrchestrator, ClientApply, ClientChanges, EstimatedChanges, LocalOrchestrator,
    RemoteOrchestrator, ServerChanges,
};
pub use progress::{ProgressArgs, SyncSide, SyncStage};
pub use provider::{
    run_in_transaction, ScopeStoreBuilder, ScopeTable, StoreConnection, SyncProvider,
    SyncProvision, TableBuilder, TrackingRow, TrackingTableBuilder,
};
pub use schema::resolve_schema;
pub use scope_store::{EnsureOutcome, ScopeStore};
pub use sorter::{dependency_order, sort_tables};
pub use transport::{InProcessTransport, SyncTransport};
