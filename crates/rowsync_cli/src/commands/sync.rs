//! Sync command implementation.
//!
//! The server database is opened in process and driven through the HTTP
//! envelope protocol over a loopback client, so a session here exercises
//! the same upload and paging path as a networked one.

use super::{database_options, open_database};
use rowsync_engine::{HttpTransport, LoopbackClient, SyncAgent, SyncSummary};
use rowsync_protocol::{ConflictResolutionPolicy, SyncType};
use rowsync_server::{ServerConfig, SyncServer};
use serde::Serialize;
use std::path::PathBuf;

/// Arguments of a sync session.
#[derive(Debug, Clone)]
pub struct SyncArgs {
    /// Client database directory.
    pub client: PathBuf,
    /// Server database directory.
    pub server: PathBuf,
    /// Scope name.
    pub scope: String,
    /// Session type.
    pub sync_type: SyncType,
    /// Conflict policy applied by the server, if not the default.
    pub policy: Option<ConflictResolutionPolicy>,
    /// Part size threshold for both sides.
    pub batch_size_kb: Option<u64>,
    /// Client batch serializer.
    pub serializer: String,
}

/// Session report.
#[derive(Debug, Serialize)]
pub struct SyncReport {
    /// Session id.
    pub session_id: String,
    /// Session type.
    pub sync_type: String,
    /// Duration in milliseconds.
    pub duration_ms: u128,
    /// Rows applied on the server.
    pub uploaded: u64,
    /// Rows applied locally, snapshot included.
    pub downloaded: u64,
    /// Conflicts resolved on either side.
    pub conflicts: u64,
    /// Rows that failed to apply.
    pub failed: u64,
    /// Rows applied from a snapshot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_rows: Option<u64>,
    /// Tombstones purged after the apply.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tombstones_purged: Option<u64>,
}

impl From<&SyncSummary> for SyncReport {
    fn from(summary: &SyncSummary) -> Self {
        Self {
            session_id: summary.session_id.to_string(),
            sync_type: format!("{:?}", summary.sync_type),
            duration_ms: summary.duration.as_millis(),
            uploaded: summary.total_changes_uploaded(),
            downloaded: summary.total_changes_downloaded(),
            conflicts: summary.total_resolved_conflicts(),
            failed: summary.total_failed(),
            snapshot_rows: summary.snapshot_applied.as_ref().map(|s| s.total_applied()),
            tombstones_purged: summary.metadata_cleaned.as_ref().map(|m| m.rows_cleaned()),
        }
    }
}

/// Runs one session and returns its report.
pub fn sync(args: &SyncArgs) -> Result<SyncReport, Box<dyn std::error::Error>> {
    let mut server_options = database_options(&args.server);
    let mut client_options = database_options(&args.client).with_serializer(args.serializer.clone());
    if let Some(policy) = args.policy {
        server_options = server_options.with_conflict_resolution_policy(policy);
    }
    if let Some(batch_size_kb) = args.batch_size_kb {
        server_options = server_options.with_batch_size_kb(batch_size_kb);
        client_options = client_options.with_batch_size_kb(batch_size_kb);
    }

    let server = SyncServer::new(
        open_database(&args.server)?,
        ServerConfig::default().with_sync_options(server_options),
    )?;
    let transport = HttpTransport::new(
        "loopback://server",
        LoopbackClient::new(server),
        client_options.batch_directory.clone(),
    );
    let agent = SyncAgent::new(
        open_database(&args.client)?,
        transport,
        client_options,
        args.scope.clone(),
    );

    let summary = agent.synchronize_with_retry(args.sync_type)?;
    Ok(SyncReport::from(&summary))
}

/// Runs the sync command.
pub fn run(args: &SyncArgs, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let report = sync(args)?;

    match format {
        "json" => println!("{}", serde_json::to_string_pretty(&report)?),
        _ => {
            println!("✓ Sync complete ({})", report.sync_type);
            println!("  Session:    {}", report.session_id);
            println!("  Duration:   {} ms", report.duration_ms);
            println!("  Uploaded:   {}", report.uploaded);
            println!("  Downloaded: {}", report.downloaded);
            println!("  Conflicts:  {}", report.conflicts);
            if report.failed > 0 {
                println!("  Failed:     {}", report.failed);
            }
            if let Some(rows) = report.snapshot_rows {
                println!("  Snapshot:   {} rows", rows);
            }
            if let Some(rows) = report.tombstones_purged {
                println!("  Purged:     {} tombstones", rows);
            }
        }
    }

    Ok(())
}
