//! Sync agent state machine.
//!
//! A [`SyncAgent`] drives one client scope against a [`SyncTransport`]:
//! it runs the local orchestrator's steps around the server's
//! apply-then-select step and tracks its own state and statistics.

use crate::batch::remove_batch;
use crate::config::SyncOptions;
use crate::error::{StageExt, SyncError, SyncResult};
use crate::interceptor::Interceptors;
use crate::metadata::DatabaseMetadatasCleaned;
use crate::orchestrator::{ClientApply, ClientChanges, EstimatedChanges, LocalOrchestrator};
use crate::progress::SyncStage;
use crate::provider::SyncProvider;
use crate::transport::SyncTransport;
use parking_lot::RwLock;
use rowsync_protocol::{
    now_millis, ClientScope, DatabaseChangesApplied, DatabaseChangesSelected,
    ServerScope, SessionContext, SyncSetup, SyncType,
};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// The current state of the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Agent is idle, not syncing.
    Idle,
    /// A session is running the given stage.
    Running(SyncStage),
    /// Agent has completed a session.
    Synced,
    /// The last session failed.
    Error,
    /// Agent is waiting before retrying.
    RetryWait,
}

impl SyncState {
    /// Returns true while a session is running.
    pub fn is_active(&self) -> bool {
        matches!(self, SyncState::Running(_) | SyncState::RetryWait)
    }

    /// Returns true if a new session can start.
    pub fn can_start_sync(&self) -> bool {
        matches!(self, SyncState::Idle | SyncState::Synced | SyncState::Error)
    }
}

/// Statistics accumulated across sessions.
#[derive(Debug, Clone, Default)]
pub struct AgentStats {
    /// Sessions completed successfully.
    pub sessions_completed: u64,
    /// Sessions that failed.
    pub sessions_failed: u64,
    /// Rows applied on the server from this client.
    pub rows_uploaded: u64,
    /// Rows applied locally from the server.
    pub rows_downloaded: u64,
    /// Conflicts resolved on either side.
    pub conflicts_resolved: u64,
    /// Retries.
    pub retries: u64,
    /// Last successful session time.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Result of a session.
#[derive(Debug, Clone)]
pub struct SyncSummary {
    /// Session identifier.
    pub session_id: Uuid,
    /// Sync type.
    pub sync_type: SyncType,
    /// Wall-clock start, in milliseconds since the epoch.
    pub started_at: u64,
    /// Session duration.
    pub duration: Duration,
    /// Rows selected locally and uploaded.
    pub client_changes_selected: DatabaseChangesSelected,
    /// Uploaded rows applied on the server.
    pub server_changes_applied: DatabaseChangesApplied,
    /// Rows selected by the server for this client.
    pub server_changes_selected: DatabaseChangesSelected,
    /// Downloaded rows applied locally.
    pub client_changes_applied: DatabaseChangesApplied,
    /// Snapshot rows applied before the delta, if a snapshot was used.
    pub snapshot_applied: Option<DatabaseChangesApplied>,
    /// Tombstones purged after the apply.
    pub metadata_cleaned: Option<DatabaseMetadatasCleaned>,
}

impl SyncSummary {
    /// Rows applied on the server.
    pub fn total_changes_uploaded(&self) -> u64 {
        self.server_changes_applied.total_applied()
    }

    /// Rows applied locally, snapshot included.
    pub fn total_changes_downloaded(&self) -> u64 {
        self.client_changes_applied.total_applied()
            + self
                .snapshot_applied
                .as_ref()
                .map_or(0, DatabaseChangesApplied::total_applied)
    }

    /// Conflicts resolved on both sides.
    pub fn total_resolved_conflicts(&self) -> u64 {
        self.server_changes_applied.total_resolved_conflicts()
            + self.client_changes_applied.total_resolved_conflicts()
    }

    /// Rows that failed to apply on both sides.
    pub fn total_failed(&self) -> u64 {
        self.server_changes_applied.total_failed() + self.client_changes_applied.total_failed()
    }
}

/// Drives sync sessions for one client scope.
pub struct SyncAgent<P: SyncProvider, T: SyncTransport> {
    local: LocalOrchestrator<P>,
    transport: T,
    setup: Option<SyncSetup>,
    state: RwLock<SyncState>,
    stats: RwLock<AgentStats>,
}

impl<P: SyncProvider, T: SyncTransport> SyncAgent<P, T> {
    /// Creates an agent for a scope.
    pub fn new(
        provider: P,
        transport: T,
        options: SyncOptions,
        scope_name: impl Into<String>,
    ) -> Self {
        Self {
            local: LocalOrchestrator::new(provider, options, scope_name),
            transport,
            setup: None,
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(AgentStats::default()),
        }
    }

    /// Sets the setup proposed to the server.
    pub fn with_setup(mut self, setup: SyncSetup) -> Self {
        self.setup = Some(setup);
        self
    }

    /// Sets the client-side hooks.
    pub fn with_interceptors(mut self, interceptors: Interceptors) -> Self {
        self.local = self.local.with_interceptors(interceptors);
        self
    }

    /// Returns the local orchestrator.
    pub fn local(&self) -> &LocalOrchestrator<P> {
        &self.local
    }

    /// Returns the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the cumulative stats.
    pub fn stats(&self) -> AgentStats {
        self.stats.read().clone()
    }

    /// Requests cancellation of the running session.
    pub fn cancel(&self) {
        self.local.base().cancellation_token().cancel();
    }

    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    fn enter(&self, stage: SyncStage) -> SyncResult<()> {
        self.set_state(SyncState::Running(stage));
        self.local.base().cancellation_token().check().in_stage(stage)
    }

    fn begin(&self) -> SyncResult<()> {
        let mut state = self.state.write();
        if !state.can_start_sync() {
            return Err(SyncError::InvalidStateTransition {
                from: format!("{:?}", *state),
                to: "Running".into(),
            });
        }
        *state = SyncState::Running(SyncStage::BeginSession);
        Ok(())
    }

    fn handle_error(&self, error: &SyncError) {
        self.set_state(SyncState::Error);
        let mut stats = self.stats.write();
        stats.sessions_failed += 1;
        stats.last_error = Some(error.to_string());
        tracing::warn!(scope = %self.local.scope_name(), error = %error, "sync session failed");
    }

    /// Runs one session.
    pub fn synchronize(&self, sync_type: SyncType) -> SyncResult<SyncSummary> {
        self.begin()?;
        self.local.base().cancellation_token().reset();

        let session_id = Uuid::new_v4();
        let result = self.run_session(session_id, sync_type);

        if self.local.options().clean_folder {
            self.clean_folder(session_id);
        }

        match result {
            Ok(summary) => {
                self.set_state(SyncState::Synced);
                let mut stats = self.stats.write();
                stats.sessions_completed += 1;
                stats.rows_uploaded += summary.total_changes_uploaded();
                stats.rows_downloaded += summary.total_changes_downloaded();
                stats.conflicts_resolved += summary.total_resolved_conflicts();
                stats.last_sync_time = Some(Instant::now());
                stats.last_error = None;
                Ok(summary)
            }
            Err(e) => {
                self.handle_error(&e);
                Err(e)
            }
        }
    }

    /// Runs a session, retrying it on transient failures.
    ///
    /// Transport errors flagged as retryable and store errors the provider
    /// approves with [`SyncProvider::should_retry`] are retried.
    pub fn synchronize_with_retry(&self, sync_type: SyncType) -> SyncResult<SyncSummary> {
        let retry_config = &self.local.options().retry;
        let attempts = retry_config.max_attempts.max(1);

        let mut attempt = 0;
        loop {
            if attempt > 0 {
                self.set_state(SyncState::RetryWait);
                let delay = retry_config.delay_for_attempt(attempt);
                tracing::debug!(attempt, ?delay, "retrying sync session");
                std::thread::sleep(delay);
                // Leave RetryWait so the next attempt may start.
                self.set_state(SyncState::Error);

                self.stats.write().retries += 1;
            }

            match self.synchronize(sync_type) {
                Ok(summary) => return Ok(summary),
                Err(e) => {
                    if self.should_retry(&e) && attempt + 1 < attempts {
                        attempt += 1;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    fn should_retry(&self, error: &SyncError) -> bool {
        if error.is_cancelled() {
            return false;
        }
        error.is_retryable()
            || error
                .store_error()
                .is_some_and(|e| self.local.provider().should_retry(e))
    }

    /// Estimates the rows the next session would download.
    pub fn get_estimated_changes_count(&self) -> SyncResult<EstimatedChanges> {
        let scope = self.local.ensure_scope(None)?;
        let ctx = self.context(&scope, SyncType::Normal, Uuid::new_v4());
        self.transport.get_estimated_changes_count(&ctx, &scope)
    }

    fn context(&self, scope: &ClientScope, sync_type: SyncType, session_id: Uuid) -> SessionContext {
        let options = self.local.options();
        let mut ctx = SessionContext::new(self.local.scope_name(), scope.id, sync_type)
            .with_serializer(options.serializer.clone())
            .with_batch_size_kb(options.batch_size_kb);
        ctx.session_id = session_id;
        ctx
    }

    fn run_session(&self, session_id: Uuid, sync_type: SyncType) -> SyncResult<SyncSummary> {
        let started = Instant::now();
        let started_at = now_millis();
        let scope_name = self.local.scope_name().to_string();
        tracing::info!(scope = %scope_name, session = %session_id, ?sync_type, "sync session started");
        self.local
            .base()
            .report(SyncStage::BeginSession, format!("{sync_type:?}"));

        // The client scope is loaded first so the session carries its id;
        // it is provisioned or migrated only after the server answers.
        self.enter(SyncStage::ScopeLoading)?;
        let mut scope = self.local.ensure_scope(None)?;
        let ctx = self.context(&scope, sync_type, session_id);
        let proposed = self.setup.as_ref().or(scope.setup.as_ref());
        let server_scope = self
            .transport
            .ensure_scope(&ctx, proposed)
            .in_stage(SyncStage::ScopeLoading)?;
        scope = self.align_setup(scope, &server_scope)?;

        if sync_type == SyncType::Reinitialize {
            scope.is_new_scope = true;
            scope.last_server_sync_timestamp = 0;
        }

        let mut snapshot_applied = None;
        if scope.is_new_scope && sync_type != SyncType::ReinitializeWithUpload {
            self.enter(SyncStage::SnapshotApplying)?;
            if let Some(snapshot) = self
                .transport
                .get_snapshot(&ctx)
                .in_stage(SyncStage::SnapshotApplying)?
            {
                let (updated, applied) =
                    self.local
                        .apply_snapshot(&scope, &snapshot, server_scope.id, None)?;
                scope = updated;
                snapshot_applied = Some(applied);
            }
        }

        self.enter(SyncStage::ChangesSelecting)?;
        let client_changes: Option<ClientChanges> = if sync_type.uploads() {
            Some(
                self.local
                    .get_changes(&scope, &format!("client_changes_{session_id}"), None)?,
            )
        } else {
            None
        };
        let client_timestamp = match &client_changes {
            Some(changes) => changes.timestamp,
            None => self.local.local_timestamp(None)?,
        };

        let server_changes = self
            .transport
            .apply_then_get_changes(&ctx, &scope, client_changes.as_ref().map(|c| &c.batch))
            .in_stage(SyncStage::ChangesApplying)?;

        self.enter(SyncStage::ChangesApplying)?;
        let (mut scope, client_changes_applied, metadata_cleaned) = self.local.apply_changes(
            &scope,
            ClientApply {
                batch: &server_changes.batch,
                policy: server_changes.policy,
                server_scope_id: server_scope.id,
                client_timestamp,
                remote_timestamp: server_changes.remote_client_timestamp,
                reset_tables: sync_type.is_reinitialize() && snapshot_applied.is_none(),
            },
            None,
        )?;

        self.enter(SyncStage::EndSession)?;
        let duration = started.elapsed();
        scope.last_sync_duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.local.save_scope(&scope, None)?;

        let summary = SyncSummary {
            session_id,
            sync_type,
            started_at,
            duration,
            client_changes_selected: client_changes
                .map(|c| c.changes_selected)
                .unwrap_or_default(),
            server_changes_applied: server_changes.changes_applied,
            server_changes_selected: server_changes.changes_selected,
            client_changes_applied,
            snapshot_applied,
            metadata_cleaned,
        };
        self.local.base().report(
            SyncStage::EndSession,
            format!(
                "uploaded {}, downloaded {}, conflicts {}",
                summary.total_changes_uploaded(),
                summary.total_changes_downloaded(),
                summary.total_resolved_conflicts()
            ),
        );
        tracing::info!(
            scope = %scope_name,
            session = %session_id,
            uploaded = summary.total_changes_uploaded(),
            downloaded = summary.total_changes_downloaded(),
            conflicts = summary.total_resolved_conflicts(),
            failed = summary.total_failed(),
            ?duration,
            "sync session complete"
        );
        Ok(summary)
    }

    /// Provisions a first-time client with the server's setup, or migrates
    /// it when the server's setup changed.
    fn align_setup(&self, scope: ClientScope, server: &ServerScope) -> SyncResult<ClientScope> {
        let (Some(setup), Some(schema)) = (&server.setup, &server.schema) else {
            return Err(SyncError::MissingSchema {
                scope_name: server.name.clone(),
            }
            .in_stage(SyncStage::ScopeLoading));
        };

        match &scope.setup {
            None => {
                self.enter(SyncStage::Provisioning)?;
                self.local.adopt_setup(&scope, setup, schema, None)
            }
            Some(current) if current != setup || scope.schema.as_ref() != Some(schema) => {
                self.enter(SyncStage::Migrating)?;
                self.local.migrate(&scope, setup, schema, None)
            }
            Some(_) => Ok(scope),
        }
    }

    /// Deletes the batch directories created for a session.
    ///
    /// Snapshot directories are shared and never named after a session, so
    /// they are left alone.
    fn clean_folder(&self, session_id: Uuid) {
        let suffix = format!("_{session_id}");
        let root = &self.local.options().batch_directory;
        let Ok(entries) = std::fs::read_dir(root) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            if !name.to_string_lossy().ends_with(&suffix) {
                continue;
            }
            if let Err(e) = remove_batch(&entry.path()) {
                tracing::warn!(batch = %entry.path().display(), error = %e, "batch cleanup failed");
            }
        }
    }
}

impl<P: SyncProvider, T: SyncTransport> std::fmt::Debug for SyncAgent<P, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncAgent")
            .field("scope", &self.local.scope_name())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_state_checks() {
        assert!(SyncState::Idle.can_start_sync());
        assert!(SyncState::Synced.can_start_sync());
        assert!(SyncState::Error.can_start_sync());
        assert!(!SyncState::Running(SyncStage::ChangesApplying).can_start_sync());
        assert!(!SyncState::RetryWait.can_start_sync());

        assert!(SyncState::Running(SyncStage::BeginSession).is_active());
        assert!(!SyncState::Synced.is_active());
    }

    #[test]
    fn summary_totals() {
        use rowsync_protocol::{RowState, TableChangesApplied};

        let mut server = DatabaseChangesApplied::default();
        let mut upserts = TableChangesApplied::new("customer", RowState::Upsert);
        upserts.applied = 3;
        upserts.resolved_conflicts = 1;
        server.push(upserts);

        let mut client = DatabaseChangesApplied::default();
        let mut deletes = TableChangesApplied::new("customer", RowState::Deleted);
        deletes.applied = 2;
        deletes.failed = 1;
        client.push(deletes);

        let mut snapshot = DatabaseChangesApplied::default();
        let mut rows = TableChangesApplied::new("customer", RowState::Upsert);
        rows.applied = 10;
        snapshot.push(rows);

        let summary = SyncSummary {
            session_id: Uuid::new_v4(),
            sync_type: SyncType::Normal,
            started_at: 0,
            duration: Duration::ZERO,
            client_changes_selected: DatabaseChangesSelected::default(),
            server_changes_applied: server,
            server_changes_selected: DatabaseChangesSelected::default(),
            client_changes_applied: client,
            snapshot_applied: Some(snapshot),
            metadata_cleaned: None,
        };

        assert_eq!(summary.total_changes_uploaded(), 3);
        assert_eq!(summary.total_changes_downloaded(), 12);
        assert_eq!(summary.total_resolved_conflicts(), 1);
        assert_eq!(summary.total_failed(), 1);
    }
}
