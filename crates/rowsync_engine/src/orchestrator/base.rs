//! Operations shared by both sides.

use crate::applier::{apply_changes, ApplyRequest};
use crate::batch::BatchWriter;
use crate::cancel::CancellationToken;
use crate::config::SyncOptions;
use crate::delta::{estimate_changes, outgoing_tables, select_changes, DeltaFilter};
use crate::error::{StageExt, SyncError, SyncResult};
use crate::interceptor::{Interceptors, TableProvisioningAction, TableProvisioningArgs};
use crate::metadata::{delete_metadata, DatabaseMetadatasCleaned};
use crate::progress::{ProgressArgs, SyncSide, SyncStage};
use crate::provider::{run_in_transaction, ScopeTable, SyncProvider, SyncProvision};
use crate::schema::resolve_schema;
use crate::scope_store::ScopeStore;
use rowsync_protocol::{
    BatchInfo, ConflictResolutionPolicy, DatabaseChangesApplied, DatabaseChangesSelected,
    SyncSchema, SyncSetup, SyncTable, TableChangesSelected,
};
use std::path::Path;
use uuid::Uuid;

/// Provider, options, hooks and cancellation shared by an orchestrator.
pub struct BaseOrchestrator<P: SyncProvider> {
    provider: P,
    options: SyncOptions,
    interceptors: Interceptors,
    cancellation: CancellationToken,
    side: SyncSide,
}

/// Parameters of [`BaseOrchestrator::apply`].
pub(crate) struct ApplyArgs<'a> {
    pub schema: &'a SyncSchema,
    pub setup: &'a SyncSetup,
    pub batch: &'a BatchInfo,
    pub sender_scope_id: Uuid,
    pub bound_timestamp: u64,
    pub policy: ConflictResolutionPolicy,
    pub is_new: bool,
    pub reset_tables: bool,
}

impl<P: SyncProvider> BaseOrchestrator<P> {
    /// Creates a base orchestrator.
    pub fn new(provider: P, options: SyncOptions, side: SyncSide) -> Self {
        Self {
            provider,
            options,
            interceptors: Interceptors::default(),
            cancellation: CancellationToken::new(),
            side,
        }
    }

    /// Returns the provider.
    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Returns the options.
    pub fn options(&self) -> &SyncOptions {
        &self.options
    }

    /// Returns the hooks.
    pub fn interceptors(&self) -> &Interceptors {
        &self.interceptors
    }

    /// Replaces the hooks.
    pub fn set_interceptors(&mut self, interceptors: Interceptors) {
        self.interceptors = interceptors;
    }

    /// Returns the cancellation token.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Replaces the cancellation token.
    pub fn set_cancellation_token(&mut self, token: CancellationToken) {
        self.cancellation = token;
    }

    /// Returns the side this orchestrator runs on.
    pub fn side(&self) -> SyncSide {
        self.side
    }

    /// Emits a progress notification.
    pub(crate) fn report(&self, stage: SyncStage, message: impl Into<String>) {
        let args = ProgressArgs::new(stage, self.side, message);
        tracing::debug!(side = ?args.side, stage = %args.stage, "{}", args.message);
        self.interceptors.progress(&args);
    }

    pub(crate) fn scope_store(&self) -> ScopeStore<'_, P::Connection> {
        ScopeStore::new(
            self.provider
                .scope_store_builder(&self.options.scope_info_table_name),
        )
    }

    /// Checks cancellation, then runs `f` in the caller's connection or a
    /// new transaction. Failures are tagged with `stage`.
    pub(crate) fn run<T, F>(
        &self,
        stage: SyncStage,
        conn: Option<&mut P::Connection>,
        f: F,
    ) -> SyncResult<T>
    where
        F: FnOnce(&mut P::Connection) -> SyncResult<T>,
    {
        self.cancellation.check().in_stage(stage)?;
        run_in_transaction(&self.provider, conn, f).in_stage(stage)
    }

    /// Returns the local logical timestamp.
    pub fn local_timestamp(&self, conn: Option<&mut P::Connection>) -> SyncResult<u64> {
        self.run(SyncStage::ChangesSelecting, conn, |c| {
            self.scope_store().local_timestamp(c)
        })
    }

    /// Resolves a setup into a schema against the store.
    pub fn get_schema(
        &self,
        setup: &SyncSetup,
        conn: Option<&mut P::Connection>,
    ) -> SyncResult<SyncSchema> {
        self.run(SyncStage::Provisioning, conn, |c| {
            resolve_schema(&self.provider, c, setup)
        })
    }

    /// Creates the requested objects for every table of the schema.
    pub fn provision(
        &self,
        schema: &SyncSchema,
        setup: &SyncSetup,
        provision: SyncProvision,
        conn: Option<&mut P::Connection>,
    ) -> SyncResult<()> {
        self.run(SyncStage::Provisioning, conn, |c| {
            self.provision_in(c, schema, setup, provision)
        })
    }

    pub(crate) fn provision_in(
        &self,
        conn: &mut P::Connection,
        schema: &SyncSchema,
        setup: &SyncSetup,
        provision: SyncProvision,
    ) -> SyncResult<()> {
        self.report(SyncStage::Provisioning, format!("{provision:?}"));

        let store = self.scope_store();
        for (flag, table) in [
            (SyncProvision::CLIENT_SCOPE, ScopeTable::Client),
            (SyncProvision::SERVER_SCOPE, ScopeTable::Server),
            (SyncProvision::SERVER_HISTORY_SCOPE, ScopeTable::ServerHistory),
        ] {
            if provision.contains(flag) {
                store.ensure_table(conn, table)?;
            }
        }

        for table in &schema.tables {
            self.cancellation.check()?;
            self.provision_table(conn, table, setup, provision)?;
        }
        Ok(())
    }

    fn provision_table(
        &self,
        conn: &mut P::Connection,
        table: &SyncTable,
        setup: &SyncSetup,
        provision: SyncProvision,
    ) -> SyncResult<()> {
        let args = TableProvisioningArgs {
            table,
            provision,
            side: self.side,
        };
        if self.interceptors.table_provisioning(&args) == TableProvisioningAction::Cancel {
            tracing::debug!(table = %table.name, "provisioning cancelled by hook");
            return Ok(());
        }

        let builder = self.provider.table_builder(table, setup);
        if !builder.exists(conn)? {
            if !provision.contains(SyncProvision::TABLE) {
                return Err(SyncError::MissingTable {
                    table: table.name.clone(),
                });
            }
            builder.create(conn)?;
            tracing::debug!(table = %table.name, "table created");
        }

        let tracking = self.provider.tracking_table_builder(table, setup);
        if provision.contains(SyncProvision::TRACKING_TABLE) && !tracking.exists(conn)? {
            tracking.create(conn)?;
            let tracked = tracking.update_untracked_rows(conn)?;
            tracing::debug!(
                table = %table.name,
                tracking = %tracking.tracking_table_name(),
                tracked,
                "tracking table created"
            );
        }

        if provision.contains(SyncProvision::TRIGGERS) && !tracking.triggers_exist(conn)? {
            tracking.create_triggers(conn)?;
        }
        Ok(())
    }

    /// Drops the requested objects, children first.
    pub fn deprovision(
        &self,
        schema: &SyncSchema,
        setup: &SyncSetup,
        provision: SyncProvision,
        conn: Option<&mut P::Connection>,
    ) -> SyncResult<()> {
        self.run(SyncStage::Deprovisioning, conn, |c| {
            self.report(SyncStage::Deprovisioning, format!("{provision:?}"));

            for table in schema.tables.iter().rev() {
                self.cancellation.check()?;
                let tracking = self.provider.tracking_table_builder(table, setup);
                if provision.contains(SyncProvision::TRIGGERS) && tracking.triggers_exist(c)? {
                    tracking.drop_triggers(c)?;
                }
                if provision.contains(SyncProvision::TRACKING_TABLE) && tracking.exists(c)? {
                    tracking.drop_tracking(c)?;
                }
                let builder = self.provider.table_builder(table, setup);
                if provision.contains(SyncProvision::TABLE) && builder.exists(c)? {
                    builder.drop_table(c)?;
                }
            }

            let store = self.scope_store();
            for (flag, table) in [
                (SyncProvision::CLIENT_SCOPE, ScopeTable::Client),
                (SyncProvision::SERVER_SCOPE, ScopeTable::Server),
                (SyncProvision::SERVER_HISTORY_SCOPE, ScopeTable::ServerHistory),
            ] {
                if provision.contains(flag) {
                    store.drop_table(c, table)?;
                }
            }
            Ok(())
        })
    }

    /// Brings tracking objects from one setup to another.
    ///
    /// Added tables are provisioned, removed tables lose their triggers and
    /// tracking table, renamed tracking tables are renamed in place. Column
    /// changes alter base tables on clients only; triggers are regenerated
    /// on both sides.
    pub fn migrate(
        &self,
        old_setup: &SyncSetup,
        old_schema: &SyncSchema,
        new_setup: &SyncSetup,
        new_schema: &SyncSchema,
        conn: Option<&mut P::Connection>,
    ) -> SyncResult<()> {
        self.run(SyncStage::Migrating, conn, |c| {
            self.migrate_in(c, old_setup, old_schema, new_setup, new_schema)
        })
    }

    pub(crate) fn migrate_in(
        &self,
        conn: &mut P::Connection,
        old_setup: &SyncSetup,
        old_schema: &SyncSchema,
        new_setup: &SyncSetup,
        new_schema: &SyncSchema,
    ) -> SyncResult<()> {
        self.report(SyncStage::Migrating, "migrating setup");
        let is_client = !self.side.is_server();

        for old_table in old_schema.tables.iter().rev() {
            if new_schema.table(&old_table.name).is_some() {
                continue;
            }
            let tracking = self.provider.tracking_table_builder(old_table, old_setup);
            if tracking.triggers_exist(conn)? {
                tracking.drop_triggers(conn)?;
            }
            if tracking.exists(conn)? {
                tracking.drop_tracking(conn)?;
            }
            tracing::info!(table = %old_table.name, "table removed from scope");
        }

        let table_flags = if is_client {
            SyncProvision::TABLE | SyncProvision::TRACKING_TABLE | SyncProvision::TRIGGERS
        } else {
            SyncProvision::TRACKING_TABLE | SyncProvision::TRIGGERS
        };

        for new_table in &new_schema.tables {
            self.cancellation.check()?;

            let Some(old_table) = old_schema.table(&new_table.name) else {
                self.provision_table(conn, new_table, new_setup, table_flags)?;
                tracing::info!(table = %new_table.name, "table added to scope");
                continue;
            };

            let old_tracking = self.provider.tracking_table_builder(old_table, old_setup);
            let new_tracking = self.provider.tracking_table_builder(new_table, new_setup);

            let renamed = old_setup.tracking_table_name(&old_table.name)
                != new_setup.tracking_table_name(&new_table.name);
            let columns_changed = old_table.columns != new_table.columns;
            let regenerate = renamed || columns_changed || !old_setup.same_affixes(new_setup);

            if regenerate && old_tracking.triggers_exist(conn)? {
                old_tracking.drop_triggers(conn)?;
            }

            if renamed && old_tracking.exists(conn)? {
                new_tracking.rename_from(conn, &old_tracking.tracking_table_name())?;
                tracing::info!(
                    from = %old_tracking.tracking_table_name(),
                    to = %new_tracking.tracking_table_name(),
                    "tracking table renamed"
                );
            }

            if columns_changed && is_client {
                let builder = self.provider.table_builder(new_table, new_setup);
                for column in &new_table.columns {
                    if old_table.column_index(&column.name).is_none() {
                        builder.add_column(conn, column)?;
                    }
                }
                for column in &old_table.columns {
                    if new_table.column_index(&column.name).is_none() {
                        builder.drop_column(conn, &column.name)?;
                    }
                }
            }

            if regenerate && !new_tracking.triggers_exist(conn)? {
                new_tracking.create_triggers(conn)?;
            }
        }
        Ok(())
    }

    /// Selects changed rows into a batch under `root/directory_name`.
    pub(crate) fn select_into_batch(
        &self,
        conn: &mut P::Connection,
        schema: &SyncSchema,
        setup: &SyncSetup,
        filter: DeltaFilter,
        root: &Path,
        directory_name: &str,
        timestamp: u64,
    ) -> SyncResult<(BatchInfo, DatabaseChangesSelected)> {
        self.report(SyncStage::ChangesSelecting, format!("selecting since {}", filter.since));

        let mut writer = BatchWriter::create(
            root,
            directory_name,
            schema.clone(),
            self.options.batch_size_kb,
            &self.options.serializer,
        )?;
        let mut selected = DatabaseChangesSelected::default();

        for table in outgoing_tables(schema, self.side) {
            self.cancellation.check()?;

            let builder = self.provider.table_builder(table, setup);
            let tracking = self.provider.tracking_table_builder(table, setup);
            let mut counts = TableChangesSelected::new(&table.name);

            writer.begin_table(&table.name, table.column_names())?;
            for row in select_changes(conn, table, builder.as_ref(), tracking.as_ref(), filter)? {
                let row = row?;
                counts.record(row.state);
                writer.write_row(row)?;
            }
            writer.end_table()?;
            selected.push(counts);
        }

        let batch = writer.finish(timestamp)?;
        tracing::info!(
            side = ?self.side,
            upserts = selected.total_upserts(),
            deletes = selected.total_deletes(),
            parts = batch.parts.len(),
            "changes selected"
        );
        Ok((batch, selected))
    }

    pub(crate) fn estimate_in(
        &self,
        conn: &mut P::Connection,
        schema: &SyncSchema,
        setup: &SyncSetup,
        filter: DeltaFilter,
    ) -> SyncResult<DatabaseChangesSelected> {
        let mut selected = DatabaseChangesSelected::default();
        for table in outgoing_tables(schema, self.side) {
            self.cancellation.check()?;
            let tracking = self.provider.tracking_table_builder(table, setup);
            selected.push(estimate_changes(conn, table, tracking.as_ref(), filter)?);
        }
        Ok(selected)
    }

    pub(crate) fn apply(
        &self,
        conn: &mut P::Connection,
        args: ApplyArgs<'_>,
    ) -> SyncResult<DatabaseChangesApplied> {
        self.report(
            SyncStage::ChangesApplying,
            format!("applying {} rows", args.batch.rows_count),
        );
        let request = ApplyRequest {
            schema: args.schema,
            setup: args.setup,
            batch: args.batch,
            sender_scope_id: args.sender_scope_id,
            bound_timestamp: args.bound_timestamp,
            side: self.side,
            policy: args.policy,
            is_new: args.is_new,
            reset_tables: args.reset_tables,
            disable_constraints: self.options.disable_constraints_on_apply_changes,
            interceptors: &self.interceptors,
            cancellation: &self.cancellation,
        };
        apply_changes(&self.provider, conn, &request)
    }

    pub(crate) fn delete_metadata_in(
        &self,
        conn: &mut P::Connection,
        schema: &SyncSchema,
        setup: &SyncSetup,
        floor: u64,
    ) -> SyncResult<DatabaseMetadatasCleaned> {
        self.report(SyncStage::MetadataCleaning, format!("floor {floor}"));
        delete_metadata(&self.provider, conn, schema, setup, floor)
    }
}

impl<P: SyncProvider> std::fmt::Debug for BaseOrchestrator<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseOrchestrator")
            .field("provider", &self.provider.name())
            .field("side", &self.side)
            .field("options", &self.options)
            .finish()
    }
}
