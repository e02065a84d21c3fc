//! Server-side orchestrator.

use super::base::{ApplyArgs, BaseOrchestrator};
use super::{EstimatedChanges, ServerChanges};
use crate::batch::read_batch;
use crate::cancel::CancellationToken;
use crate::config::SyncOptions;
use crate::delta::DeltaFilter;
use crate::error::{SyncError, SyncResult};
use crate::interceptor::Interceptors;
use crate::metadata::DatabaseMetadatasCleaned;
use crate::progress::{SyncSide, SyncStage};
use crate::provider::{SyncProvider, SyncProvision};
use crate::schema::resolve_schema;
use rowsync_protocol::{
    now_millis, BatchInfo, ClientScope, DatabaseChangesApplied, ServerHistoryScope, ServerScope,
    SessionContext, SyncSchema, SyncSetup, SyncType,
};
use std::collections::HashMap;
use std::path::PathBuf;

/// Server-side orchestrator, shared by every client session.
///
/// Setups registered with [`RemoteOrchestrator::with_setup`] take precedence
/// over setups sent by clients.
#[derive(Debug)]
pub struct RemoteOrchestrator<P: SyncProvider> {
    base: BaseOrchestrator<P>,
    setups: HashMap<String, SyncSetup>,
}

impl<P: SyncProvider> RemoteOrchestrator<P> {
    /// Creates a server orchestrator.
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedServerRole` if the provider is client-only.
    pub fn new(provider: P, options: SyncOptions) -> SyncResult<Self> {
        if !provider.can_act_as_server() {
            return Err(SyncError::UnsupportedServerRole {
                provider: provider.name().to_string(),
            });
        }
        Ok(Self {
            base: BaseOrchestrator::new(provider, options, SyncSide::Server),
            setups: HashMap::new(),
        })
    }

    /// Registers the setup served for a scope.
    pub fn with_setup(mut self, scope_name: impl Into<String>, setup: SyncSetup) -> Self {
        self.setups.insert(scope_name.into(), setup);
        self
    }

    /// Sets the hooks.
    pub fn with_interceptors(mut self, interceptors: Interceptors) -> Self {
        self.base.set_interceptors(interceptors);
        self
    }

    /// Sets the cancellation token.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.base.set_cancellation_token(token);
        self
    }

    /// Returns the shared orchestrator state.
    pub fn base(&self) -> &BaseOrchestrator<P> {
        &self.base
    }

    /// Returns the provider.
    pub fn provider(&self) -> &P {
        self.base.provider()
    }

    /// Returns the options.
    pub fn options(&self) -> &SyncOptions {
        self.base.options()
    }

    /// Returns the setup registered for a scope.
    pub fn setup(&self, scope_name: &str) -> Option<&SyncSetup> {
        self.setups.get(scope_name)
    }

    /// Loads or creates the server scope, provisioning or migrating the
    /// store when its setup is new or changed.
    pub fn ensure_scope(
        &self,
        ctx: &SessionContext,
        client_setup: Option<&SyncSetup>,
        conn: Option<&mut P::Connection>,
    ) -> SyncResult<ServerScope> {
        let setup = self.setups.get(&ctx.scope_name).or(client_setup);

        self.base.run(SyncStage::ScopeLoading, conn, |c| {
            self.base
                .report(SyncStage::ScopeLoading, ctx.scope_name.clone());

            let outcome = self.base.scope_store().ensure_server_scope(
                c,
                &ctx.scope_name,
                setup,
                false,
                self.base.interceptors(),
                |c, s| resolve_schema(self.provider(), c, s),
            )?;

            let scope = outcome.scope;
            if let (Some(setup), Some(schema)) = (&scope.setup, &scope.schema) {
                if outcome.should_provision {
                    self.base
                        .provision_in(c, schema, setup, SyncProvision::server())?;
                } else if let (Some(old_setup), Some(old_schema)) =
                    (&outcome.previous_setup, &outcome.previous_schema)
                {
                    self.base
                        .migrate_in(c, old_setup, old_schema, setup, schema)?;
                }
            }
            Ok(scope)
        })
    }

    /// Loads a server scope.
    pub fn load_server_scope(
        &self,
        scope_name: &str,
        conn: Option<&mut P::Connection>,
    ) -> SyncResult<Option<ServerScope>> {
        self.base.run(SyncStage::ScopeLoading, conn, |c| {
            self.base.scope_store().load_server_scope(c, scope_name)
        })
    }

    fn scope_parts(scope: &ServerScope) -> SyncResult<(&SyncSchema, &SyncSetup)> {
        match (&scope.schema, &scope.setup) {
            (Some(schema), Some(setup)) if !schema.is_empty() => Ok((schema, setup)),
            _ => Err(SyncError::MissingSchema {
                scope_name: scope.name.clone(),
            }),
        }
    }

    fn require_scope(&self, conn: &mut P::Connection, scope_name: &str) -> SyncResult<ServerScope> {
        self.base
            .scope_store()
            .load_server_scope(conn, scope_name)?
            .ok_or_else(|| SyncError::MissingSchema {
                scope_name: scope_name.to_string(),
            })
    }

    /// Selection filter for a client: new and reinitializing clients get
    /// every live row, others get what changed since their last sync minus
    /// their own uploads.
    fn download_filter(ctx: &SessionContext, client_scope: &ClientScope) -> DeltaFilter {
        let since = if ctx.sync_type == SyncType::ReinitializeWithUpload {
            0
        } else {
            client_scope.last_server_sync_timestamp
        };
        if client_scope.is_new_scope || ctx.sync_type.is_reinitialize() {
            DeltaFilter::full(since)
        } else {
            DeltaFilter::new(since, Some(client_scope.id))
        }
    }

    /// Applies a client's upload, then selects the changes to send back.
    ///
    /// The upload is applied in one transaction; selection, the history
    /// record and the server scope update run in a second one. Applied rows
    /// carry the client's id so they are not echoed back.
    pub fn apply_then_get_changes(
        &self,
        ctx: &SessionContext,
        client_scope: &ClientScope,
        batch: Option<&BatchInfo>,
        mut conn: Option<&mut P::Connection>,
    ) -> SyncResult<ServerChanges> {
        if ctx.scope_name != client_scope.name {
            return Err(SyncError::InvalidScope {
                expected: ctx.scope_name.clone(),
                actual: client_scope.name.clone(),
            }
            .in_stage(SyncStage::ScopeLoading));
        }

        let started = now_millis();
        let policy = self.options().conflict_resolution_policy;

        let (server_scope, changes_applied) =
            self.base
                .run(SyncStage::ChangesApplying, conn.as_deref_mut(), |c| {
                    let server_scope = self.require_scope(c, &ctx.scope_name)?;
                    let (schema, setup) = Self::scope_parts(&server_scope)?;

                    let applied = match batch.filter(|b| !b.is_empty()) {
                        Some(batch) => self.base.apply(
                            c,
                            ApplyArgs {
                                schema,
                                setup,
                                batch,
                                sender_scope_id: client_scope.id,
                                bound_timestamp: client_scope.last_server_sync_timestamp,
                                policy,
                                is_new: false,
                                reset_tables: false,
                            },
                        )?,
                        None => DatabaseChangesApplied::default(),
                    };
                    Ok((server_scope, applied))
                })?;

        let filter = Self::download_filter(ctx, client_scope);
        let directory_name = format!("server_changes_{}", ctx.session_id);

        self.base.run(SyncStage::ChangesSelecting, conn, |c| {
            let (schema, setup) = Self::scope_parts(&server_scope)?;
            let store = self.base.scope_store();
            let timestamp = store.local_timestamp(c)?;

            let (batch, changes_selected) = self.base.select_into_batch(
                c,
                schema,
                setup,
                filter,
                &self.options().batch_directory,
                &directory_name,
                timestamp,
            )?;

            let finished = now_millis();
            let mut history = store
                .load_history_scope(c, client_scope.id)?
                .unwrap_or_else(|| {
                    ServerHistoryScope::new(client_scope.id, &ctx.scope_name, timestamp)
                });
            history.last_sync_timestamp = timestamp;
            history.last_sync = Some(finished);
            history.last_sync_duration_ms = finished.saturating_sub(started);
            store.save_history_scope(c, &history)?;

            let mut scope = server_scope.clone();
            scope.last_sync_timestamp = timestamp;
            scope.last_sync = Some(finished);
            scope.last_sync_duration_ms = history.last_sync_duration_ms;
            store.save_server_scope(c, &scope)?;

            tracing::info!(
                scope = %ctx.scope_name,
                client = %client_scope.id,
                applied = changes_applied.total_applied(),
                conflicts = changes_applied.total_resolved_conflicts(),
                selected = changes_selected.total_changes(),
                timestamp,
                "server session step complete"
            );

            Ok(ServerChanges {
                remote_client_timestamp: timestamp,
                batch,
                changes_selected,
                changes_applied,
                policy,
            })
        })
    }

    /// Counts the rows the client would receive, without writing a batch.
    pub fn get_estimated_changes_count(
        &self,
        ctx: &SessionContext,
        client_scope: &ClientScope,
        conn: Option<&mut P::Connection>,
    ) -> SyncResult<EstimatedChanges> {
        self.base.run(SyncStage::ChangesSelecting, conn, |c| {
            let server_scope = self.require_scope(c, &ctx.scope_name)?;
            let (schema, setup) = Self::scope_parts(&server_scope)?;
            let timestamp = self.base.scope_store().local_timestamp(c)?;
            let filter = Self::download_filter(ctx, client_scope);
            let changes_selected = self.base.estimate_in(c, schema, setup, filter)?;
            Ok(EstimatedChanges {
                timestamp,
                changes_selected,
            })
        })
    }

    fn snapshots_root(&self) -> SyncResult<&PathBuf> {
        self.options().snapshots_directory.as_ref().ok_or_else(|| {
            SyncError::SnapshotConfig("snapshots directory is not configured".to_string())
        })
    }

    /// Writes every live row of the scope to `snapshots_directory/<scope>`,
    /// replacing any previous snapshot.
    pub fn create_snapshot(
        &self,
        scope_name: &str,
        conn: Option<&mut P::Connection>,
    ) -> SyncResult<BatchInfo> {
        let root = self
            .snapshots_root()
            .map_err(|e| e.in_stage(SyncStage::SnapshotCreating))?;
        if self.options().batch_size_kb == 0 {
            return Err(
                SyncError::SnapshotConfig("batch size must be greater than 0".to_string())
                    .in_stage(SyncStage::SnapshotCreating),
            );
        }

        self.base.run(SyncStage::SnapshotCreating, conn, |c| {
            self.base
                .report(SyncStage::SnapshotCreating, scope_name.to_string());
            let server_scope = self.require_scope(c, scope_name)?;
            let (schema, setup) = Self::scope_parts(&server_scope)?;
            let timestamp = self.base.scope_store().local_timestamp(c)?;

            let (batch, selected) = self.base.select_into_batch(
                c,
                schema,
                setup,
                DeltaFilter::full(0),
                root,
                scope_name,
                timestamp,
            )?;
            tracing::info!(
                scope = scope_name,
                rows = selected.total_upserts(),
                parts = batch.parts.len(),
                timestamp,
                "snapshot created"
            );
            Ok(batch)
        })
    }

    /// Loads the snapshot of a scope, if one was created.
    pub fn get_snapshot(&self, scope_name: &str) -> SyncResult<Option<BatchInfo>> {
        let Some(root) = &self.options().snapshots_directory else {
            return Ok(None);
        };
        let directory = root.join(scope_name);
        if !BatchInfo::summary_path_in(&directory).exists() {
            return Ok(None);
        }
        read_batch(&directory)
            .map(Some)
            .map_err(|e| e.in_stage(SyncStage::SnapshotApplying))
    }

    /// Purges tombstones every known client of the scope has already
    /// received.
    ///
    /// The floor is the oldest `last_sync_timestamp` across the scope's
    /// history; with no history nothing is purged.
    pub fn delete_metadata(
        &self,
        scope_name: &str,
        conn: Option<&mut P::Connection>,
    ) -> SyncResult<DatabaseMetadatasCleaned> {
        self.base.run(SyncStage::MetadataCleaning, conn, |c| {
            let store = self.base.scope_store();
            let mut server_scope = self.require_scope(c, scope_name)?;
            let floor = store
                .list_history_scopes(c, scope_name)?
                .iter()
                .map(|h| h.last_sync_timestamp)
                .min()
                .unwrap_or(0);

            let (schema, setup) = Self::scope_parts(&server_scope)?;
            let cleaned = self.base.delete_metadata_in(c, schema, setup, floor)?;

            if floor > 0 {
                server_scope.last_cleanup_timestamp = floor;
                store.save_server_scope(c, &server_scope)?;
            }
            Ok(cleaned)
        })
    }

    /// Creates the server's tracking objects for a stored scope.
    pub fn provision(
        &self,
        scope_name: &str,
        provision: SyncProvision,
        conn: Option<&mut P::Connection>,
    ) -> SyncResult<()> {
        self.base.run(SyncStage::Provisioning, conn, |c| {
            let scope = self.require_scope(c, scope_name)?;
            let (schema, setup) = Self::scope_parts(&scope)?;
            self.base.provision_in(c, schema, setup, provision)
        })
    }

    /// Moves a stored scope to a new setup and saves it.
    pub fn migrate(
        &self,
        scope_name: &str,
        new_setup: &SyncSetup,
        conn: Option<&mut P::Connection>,
    ) -> SyncResult<ServerScope> {
        self.base.run(SyncStage::Migrating, conn, |c| {
            let mut scope = self.require_scope(c, scope_name)?;
            let new_schema = resolve_schema(self.provider(), c, new_setup)?;
            {
                let (old_schema, old_setup) = Self::scope_parts(&scope)?;
                self.base
                    .migrate_in(c, old_setup, old_schema, new_setup, &new_schema)?;
            }
            scope.setup = Some(new_setup.clone());
            scope.schema = Some(new_schema);
            self.base.scope_store().save_server_scope(c, &scope)?;
            tracing::info!(scope = scope_name, "server scope migrated");
            Ok(scope)
        })
    }

    /// Drops the server's tracking objects for a scope.
    pub fn deprovision(
        &self,
        scope_name: &str,
        provision: SyncProvision,
        mut conn: Option<&mut P::Connection>,
    ) -> SyncResult<()> {
        let scope = self
            .load_server_scope(scope_name, conn.as_deref_mut())?
            .ok_or_else(|| {
                SyncError::MissingSchema {
                    scope_name: scope_name.to_string(),
                }
                .in_stage(SyncStage::Deprovisioning)
            })?;
        let (schema, setup) =
            Self::scope_parts(&scope).map_err(|e| e.in_stage(SyncStage::Deprovisioning))?;
        self.base.deprovision(schema, setup, provision, conn)
    }
}
