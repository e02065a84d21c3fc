//! Client-side orchestrator.

use super::base::{ApplyArgs, BaseOrchestrator};
use super::{ClientChanges, EstimatedChanges};
use crate::batch::write_batch;
use crate::cancel::CancellationToken;
use crate::config::SyncOptions;
use crate::delta::DeltaFilter;
use crate::error::{SyncError, SyncResult};
use crate::interceptor::Interceptors;
use crate::metadata::DatabaseMetadatasCleaned;
use crate::progress::{SyncSide, SyncStage};
use crate::provider::{SyncProvider, SyncProvision};
use rowsync_protocol::{
    now_millis, BatchInfo, ClientScope, ConflictResolutionPolicy, DatabaseChangesApplied,
    SyncSchema, SyncSetup,
};
use uuid::Uuid;

/// Parameters of [`LocalOrchestrator::apply_changes`].
#[derive(Debug, Clone, Copy)]
pub struct ClientApply<'a> {
    /// Batch downloaded from the server.
    pub batch: &'a BatchInfo,
    /// Policy the server applied.
    pub policy: ConflictResolutionPolicy,
    /// Server scope id, stamped on applied rows.
    pub server_scope_id: Uuid,
    /// Local timestamp read before changes were selected.
    pub client_timestamp: u64,
    /// Server timestamp returned with the batch.
    pub remote_timestamp: u64,
    /// Delete every local row before applying.
    pub reset_tables: bool,
}

/// Client-side orchestrator for one scope.
#[derive(Debug)]
pub struct LocalOrchestrator<P: SyncProvider> {
    base: BaseOrchestrator<P>,
    scope_name: String,
}

impl<P: SyncProvider> LocalOrchestrator<P> {
    /// Creates a client orchestrator.
    pub fn new(provider: P, options: SyncOptions, scope_name: impl Into<String>) -> Self {
        Self {
            base: BaseOrchestrator::new(provider, options, SyncSide::Client),
            scope_name: scope_name.into(),
        }
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

    /// Returns the scope name.
    pub fn scope_name(&self) -> &str {
        &self.scope_name
    }

    /// Returns the provider.
    pub fn provider(&self) -> &P {
        self.base.provider()
    }

    /// Returns the options.
    pub fn options(&self) -> &SyncOptions {
        self.base.options()
    }

    /// Loads the client scope, creating it on first use.
    pub fn ensure_scope(&self, conn: Option<&mut P::Connection>) -> SyncResult<ClientScope> {
        self.base.run(SyncStage::ScopeLoading, conn, |c| {
            self.base.report(SyncStage::ScopeLoading, self.scope_name.clone());
            self.base
                .scope_store()
                .ensure_client_scope(c, &self.scope_name)
        })
    }

    /// Saves the client scope.
    pub fn save_scope(&self, scope: &ClientScope, conn: Option<&mut P::Connection>) -> SyncResult<()> {
        self.base.run(SyncStage::ScopeLoading, conn, |c| {
            self.base.scope_store().save_client_scope(c, scope)
        })
    }

    /// Returns the local logical timestamp.
    pub fn local_timestamp(&self, conn: Option<&mut P::Connection>) -> SyncResult<u64> {
        self.base.local_timestamp(conn)
    }

    fn scope_parts<'s>(&self, scope: &'s ClientScope) -> SyncResult<(&'s SyncSchema, &'s SyncSetup)> {
        match (&scope.schema, &scope.setup) {
            (Some(schema), Some(setup)) if !schema.is_empty() => Ok((schema, setup)),
            _ => Err(SyncError::MissingSchema {
                scope_name: scope.name.clone(),
            }),
        }
    }

    /// Selects local changes made since the last sync into a batch.
    ///
    /// The timestamp is read before selecting. New scopes send nothing.
    pub fn get_changes(
        &self,
        scope: &ClientScope,
        directory_name: &str,
        conn: Option<&mut P::Connection>,
    ) -> SyncResult<ClientChanges> {
        self.base.run(SyncStage::ChangesSelecting, conn, |c| {
            let (schema, setup) = self.scope_parts(scope)?;
            let timestamp = self.base.scope_store().local_timestamp(c)?;
            let root = &self.options().batch_directory;

            if scope.is_new_scope {
                let batch = write_batch(
                    root,
                    directory_name,
                    schema.clone(),
                    self.options().batch_size_kb,
                    &self.options().serializer,
                    Vec::new(),
                    timestamp,
                )?;
                return Ok(ClientChanges {
                    timestamp,
                    batch,
                    changes_selected: Default::default(),
                });
            }

            let filter = DeltaFilter::new(scope.last_sync_timestamp, None);
            let (batch, changes_selected) = self
                .base
                .select_into_batch(c, schema, setup, filter, root, directory_name, timestamp)?;
            Ok(ClientChanges {
                timestamp,
                batch,
                changes_selected,
            })
        })
    }

    /// Counts local changes made since the last sync.
    pub fn get_estimated_changes_count(
        &self,
        scope: &ClientScope,
        conn: Option<&mut P::Connection>,
    ) -> SyncResult<EstimatedChanges> {
        self.base.run(SyncStage::ChangesSelecting, conn, |c| {
            let (schema, setup) = self.scope_parts(scope)?;
            let timestamp = self.base.scope_store().local_timestamp(c)?;
            let changes_selected = if scope.is_new_scope {
                Default::default()
            } else {
                let filter = DeltaFilter::new(scope.last_sync_timestamp, None);
                self.base.estimate_in(c, schema, setup, filter)?
            };
            Ok(EstimatedChanges {
                timestamp,
                changes_selected,
            })
        })
    }

    /// Applies a downloaded batch, then records the new timestamps on the
    /// scope and saves it.
    ///
    /// Local writes up to `client_timestamp` were uploaded in this session
    /// and already reconciled by the server, so only later writes can
    /// conflict. Deletes are skipped only for a scope that starts empty,
    /// that is one with no snapshot applied.
    ///
    /// With `clean_metadatas` set and rows applied, tombstones older than
    /// the previous sync are purged in the same transaction.
    pub fn apply_changes(
        &self,
        scope: &ClientScope,
        apply: ClientApply<'_>,
        conn: Option<&mut P::Connection>,
    ) -> SyncResult<(ClientScope, DatabaseChangesApplied, Option<DatabaseMetadatasCleaned>)> {
        self.base.run(SyncStage::ChangesApplying, conn, |c| {
            let (schema, setup) = self.scope_parts(scope)?;
            let applied = self.base.apply(
                c,
                ApplyArgs {
                    schema,
                    setup,
                    batch: apply.batch,
                    sender_scope_id: apply.server_scope_id,
                    bound_timestamp: apply.client_timestamp,
                    policy: apply.policy,
                    is_new: scope.is_new_scope && scope.last_server_sync_timestamp == 0,
                    reset_tables: apply.reset_tables,
                },
            )?;

            let cleaned = if self.options().clean_metadatas && applied.total_applied() > 0 {
                Some(
                    self.base
                        .delete_metadata_in(c, schema, setup, scope.last_sync_timestamp)?,
                )
            } else {
                None
            };

            let mut updated = scope.clone();
            if let Some(cleaned) = &cleaned {
                updated.last_cleanup_timestamp = cleaned.timestamp;
            }
            updated.last_sync_timestamp = scope.last_sync_timestamp.max(apply.client_timestamp);
            updated.last_server_sync_timestamp = apply.remote_timestamp;
            updated.is_new_scope = false;
            updated.last_sync = Some(now_millis());
            self.base.scope_store().save_client_scope(c, &updated)?;

            Ok((updated, applied, cleaned))
        })
    }

    /// Applies a server snapshot with the server winning every conflict.
    ///
    /// Tables are reset first. The scope stays new so the following delta is
    /// selected in full mode, starting at the snapshot timestamp.
    pub fn apply_snapshot(
        &self,
        scope: &ClientScope,
        batch: &BatchInfo,
        server_scope_id: Uuid,
        conn: Option<&mut P::Connection>,
    ) -> SyncResult<(ClientScope, DatabaseChangesApplied)> {
        self.base.run(SyncStage::SnapshotApplying, conn, |c| {
            self.base.report(
                SyncStage::SnapshotApplying,
                format!("snapshot of {} rows at {}", batch.rows_count, batch.timestamp),
            );
            let (schema, setup) = self.scope_parts(scope)?;
            let applied = self.base.apply(
                c,
                ApplyArgs {
                    schema,
                    setup,
                    batch,
                    sender_scope_id: server_scope_id,
                    bound_timestamp: scope.last_sync_timestamp,
                    policy: ConflictResolutionPolicy::ServerWins,
                    is_new: true,
                    reset_tables: true,
                },
            )?;

            let mut updated = scope.clone();
            updated.is_new_scope = true;
            updated.last_server_sync_timestamp = batch.timestamp;
            self.base.scope_store().save_client_scope(c, &updated)?;
            Ok((updated, applied))
        })
    }

    /// Creates the client's tracking objects for the scope.
    pub fn provision(
        &self,
        scope: &ClientScope,
        provision: SyncProvision,
        conn: Option<&mut P::Connection>,
    ) -> SyncResult<()> {
        let (schema, setup) = self
            .scope_parts(scope)
            .map_err(|e| e.in_stage(SyncStage::Provisioning))?;
        self.base.provision(schema, setup, provision, conn)
    }

    /// Drops the client's tracking objects for the scope.
    pub fn deprovision(
        &self,
        scope: &ClientScope,
        provision: SyncProvision,
        conn: Option<&mut P::Connection>,
    ) -> SyncResult<()> {
        let (schema, setup) = self
            .scope_parts(scope)
            .map_err(|e| e.in_stage(SyncStage::Deprovisioning))?;
        self.base.deprovision(schema, setup, provision, conn)
    }

    /// Migrates the client from its current setup to the server's and saves
    /// the updated scope.
    pub fn migrate(
        &self,
        scope: &ClientScope,
        new_setup: &SyncSetup,
        new_schema: &SyncSchema,
        conn: Option<&mut P::Connection>,
    ) -> SyncResult<ClientScope> {
        self.base.run(SyncStage::Migrating, conn, |c| {
            let (old_schema, old_setup) = self.scope_parts(scope)?;
            self.base
                .migrate_in(c, old_setup, old_schema, new_setup, new_schema)?;

            let mut updated = scope.clone();
            updated.setup = Some(new_setup.clone());
            updated.schema = Some(new_schema.clone());
            self.base.scope_store().save_client_scope(c, &updated)?;
            Ok(updated)
        })
    }

    /// Adopts a server setup on a scope that has none, provisioning it.
    pub fn adopt_setup(
        &self,
        scope: &ClientScope,
        setup: &SyncSetup,
        schema: &SyncSchema,
        conn: Option<&mut P::Connection>,
    ) -> SyncResult<ClientScope> {
        self.base.run(SyncStage::Provisioning, conn, |c| {
            self.base
                .provision_in(c, schema, setup, SyncProvision::client())?;

            let mut updated = scope.clone();
            updated.setup = Some(setup.clone());
            updated.schema = Some(schema.clone());
            self.base.scope_store().save_client_scope(c, &updated)?;
            Ok(updated)
        })
    }

    /// Purges tombstones older than the scope's last sync and records the
    /// floor on the saved scope.
    pub fn delete_metadata(
        &self,
        scope: &ClientScope,
        conn: Option<&mut P::Connection>,
    ) -> SyncResult<DatabaseMetadatasCleaned> {
        self.base.run(SyncStage::MetadataCleaning, conn, |c| {
            let (schema, setup) = self.scope_parts(scope)?;
            let cleaned = self
                .base
                .delete_metadata_in(c, schema, setup, scope.last_sync_timestamp)?;

            let mut updated = scope.clone();
            updated.last_cleanup_timestamp = cleaned.timestamp;
            self.base.scope_store().save_client_scope(c, &updated)?;
            Ok(cleaned)
        })
    }
}
