//! Conflict-aware application of a batch.
//!
//! Deletes are applied child-first, then upserts parent-first. Every row
//! written on behalf of a peer is stamped with that peer's scope id so it is
//! never selected back to it. Row-level store failures are counted, not
//! raised, unless the store reports them as fatal.

use crate::batch::rows_for_table;
use crate::cancel::CancellationToken;
use crate::error::{StoreError, StoreResult, SyncResult};
use crate::interceptor::{Interceptors, RowApplyingAction, RowApplyingArgs};
use crate::progress::SyncSide;
use crate::provider::{SyncProvider, TableBuilder, TrackingTableBuilder};
use rowsync_protocol::{
    BatchInfo, ConflictResolution, ConflictResolutionPolicy, DatabaseChangesApplied, RowState,
    SyncConflict, SyncRow, SyncSchema, SyncSetup, SyncTable, SyncValue, TableChangesApplied,
};
use uuid::Uuid;

/// Rows between two cancellation checks.
const CANCEL_CHECK_INTERVAL: usize = 500;

/// Everything [`apply_changes`] needs to know about one application.
#[derive(Debug)]
pub struct ApplyRequest<'a> {
    /// Schema of the receiving scope.
    pub schema: &'a SyncSchema,
    /// Setup of the receiving scope.
    pub setup: &'a SyncSetup,
    /// Batch to apply.
    pub batch: &'a BatchInfo,
    /// Peer that produced the batch.
    pub sender_scope_id: Uuid,
    /// Local rows written after this timestamp, by someone other than the
    /// sender, are in conflict.
    pub bound_timestamp: u64,
    /// Side applying.
    pub side: SyncSide,
    /// Policy for update/update conflicts.
    pub policy: ConflictResolutionPolicy,
    /// Receiver has never synced; deletes are skipped.
    pub is_new: bool,
    /// Delete every row of every table first.
    pub reset_tables: bool,
    /// Disable constraints around each table.
    pub disable_constraints: bool,
    /// Hooks.
    pub interceptors: &'a Interceptors,
    /// Cancellation token.
    pub cancellation: &'a CancellationToken,
}

#[derive(Debug, Clone, Copy)]
struct RowOutcome {
    applied: bool,
    conflict: bool,
}

impl RowOutcome {
    const APPLIED: RowOutcome = RowOutcome {
        applied: true,
        conflict: false,
    };

    fn resolved(applied: bool) -> Self {
        Self {
            applied,
            conflict: true,
        }
    }
}

/// Applies a batch within the caller's connection.
pub fn apply_changes<P>(
    provider: &P,
    conn: &mut P::Connection,
    request: &ApplyRequest<'_>,
) -> SyncResult<DatabaseChangesApplied>
where
    P: SyncProvider + ?Sized,
{
    let mut result = DatabaseChangesApplied::default();

    if request.reset_tables {
        for table in request.schema.tables.iter().rev() {
            request.cancellation.check()?;
            provider.table_builder(table, request.setup).reset(conn)?;
            tracing::debug!(table = %table.name, "table reset");
        }
    }

    if request.batch.is_empty() {
        return Ok(result);
    }

    if !request.is_new {
        for table in request.schema.tables.iter().rev() {
            let counters = apply_table(provider, conn, request, table, RowState::Deleted)?;
            result.push(counters);
        }
    }

    for table in &request.schema.tables {
        let counters = apply_table(provider, conn, request, table, RowState::Upsert)?;
        result.push(counters);
    }

    tracing::debug!(
        side = ?request.side,
        applied = result.total_applied(),
        conflicts = result.total_resolved_conflicts(),
        failed = result.total_failed(),
        "changes applied"
    );
    Ok(result)
}

fn apply_table<P>(
    provider: &P,
    conn: &mut P::Connection,
    request: &ApplyRequest<'_>,
    table: &SyncTable,
    state: RowState,
) -> SyncResult<TableChangesApplied>
where
    P: SyncProvider + ?Sized,
{
    request.cancellation.check()?;
    let mut counters = TableChangesApplied::new(&table.name, state);

    if request.batch.parts_for_table(&table.name).next().is_none() {
        return Ok(counters);
    }

    let builder = provider.table_builder(table, request.setup);
    let tracking = provider.tracking_table_builder(table, request.setup);

    if request.disable_constraints {
        builder.disable_constraints(conn)?;
    }

    let applied = apply_rows(
        conn,
        request,
        table,
        state,
        builder.as_ref(),
        tracking.as_ref(),
        &mut counters,
    );

    if request.disable_constraints {
        if let Err(e) = builder.enable_constraints(conn) {
            if applied.is_ok() {
                return Err(e.into());
            }
            tracing::warn!(table = %table.name, error = %e, "failed to re-enable constraints");
        }
    }

    applied.map(|()| counters)
}

fn apply_rows<C>(
    conn: &mut C,
    request: &ApplyRequest<'_>,
    table: &SyncTable,
    state: RowState,
    builder: &dyn TableBuilder<C>,
    tracking: &dyn TrackingTableBuilder<C>,
    counters: &mut TableChangesApplied,
) -> SyncResult<()> {
    let columns = table.column_names();

    for (n, row) in rows_for_table(request.batch, &table.name)?.enumerate() {
        if n > 0 && n % CANCEL_CHECK_INTERVAL == 0 {
            request.cancellation.check()?;
        }

        let mut row = row?;
        if row.state != state {
            continue;
        }

        let action = request.interceptors.row_applying(&mut RowApplyingArgs {
            table_name: &table.name,
            columns: &columns,
            side: request.side,
            row: &mut row,
        });
        if action == RowApplyingAction::Skip {
            continue;
        }

        match apply_row(conn, request, table, builder, tracking, row) {
            Ok(outcome) => {
                if outcome.applied {
                    counters.applied += 1;
                }
                if outcome.conflict {
                    counters.resolved_conflicts += 1;
                }
            }
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                tracing::debug!(table = %table.name, error = %e, "row failed to apply");
                counters.failed += 1;
            }
        }
    }
    Ok(())
}

fn apply_row<C>(
    conn: &mut C,
    request: &ApplyRequest<'_>,
    table: &SyncTable,
    builder: &dyn TableBuilder<C>,
    tracking: &dyn TrackingTableBuilder<C>,
    row: SyncRow,
) -> StoreResult<RowOutcome> {
    let primary_key = table.primary_key_values(&row);
    let sender = Some(request.sender_scope_id);

    let local = tracking.tracking_row(conn, &primary_key)?;
    let in_conflict = local.as_ref().is_some_and(|t| {
        t.update_timestamp > request.bound_timestamp && t.update_scope_id != sender
    });
    let local_tombstone = local.as_ref().is_some_and(|t| t.is_tombstone);

    if row.is_deleted() {
        if local_tombstone {
            return Ok(RowOutcome::APPLIED);
        }
        let deleted = builder.delete_row(conn, &primary_key)?;
        if deleted {
            tracking.update_scope_id(conn, &primary_key, sender)?;
        }
        if in_conflict {
            tracing::debug!(table = %table.name, "remote delete wins over local update");
            return Ok(RowOutcome::resolved(true));
        }
        return Ok(RowOutcome::APPLIED);
    }

    if in_conflict && local_tombstone {
        tracing::debug!(table = %table.name, "local delete wins over remote update");
        return Ok(RowOutcome::resolved(false));
    }

    if in_conflict {
        let local_values = builder.select_row(conn, &primary_key)?;
        let conflict = SyncConflict::new(
            &table.name,
            local_values.map(SyncRow::upsert),
            row.clone(),
        );
        let resolution = request
            .interceptors
            .conflict(&conflict, request.side)
            .resolve(request.policy);
        tracing::debug!(table = %table.name, ?resolution, side = ?request.side, "conflict resolved");

        return match resolution {
            ConflictResolution::MergeRow(merged) => {
                write_row(builder, conn, table, &merged.values)?;
                tracking.update_scope_id(conn, &primary_key, None)?;
                Ok(RowOutcome::resolved(true))
            }
            resolution if resolution.applies_incoming(request.side.is_server()) => {
                write_row(builder, conn, table, &row.values)?;
                tracking.update_scope_id(conn, &primary_key, sender)?;
                Ok(RowOutcome::resolved(true))
            }
            _ => Ok(RowOutcome::resolved(false)),
        };
    }

    write_row(builder, conn, table, &row.values)?;
    tracking.update_scope_id(conn, &primary_key, sender)?;
    Ok(RowOutcome::APPLIED)
}

fn write_row<C>(
    builder: &dyn TableBuilder<C>,
    conn: &mut C,
    table: &SyncTable,
    values: &[SyncValue],
) -> StoreResult<()> {
    if values.len() != table.columns.len() {
        return Err(StoreError::schema(format!(
            "row for {} has {} values, expected {}",
            table.name,
            values.len(),
            table.columns.len()
        )));
    }
    builder.upsert_row(conn, values)
}
