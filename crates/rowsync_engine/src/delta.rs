//! Timestamp-bounded change detection.
//!
//! Rows are selected from tracking metadata, not from the base tables:
//! a tracking row newer than the bound, and not produced by the peer we
//! are sending to, yields one changed row.

use crate::error::{SyncError, SyncResult};
use crate::progress::SyncSide;
use crate::provider::{TableBuilder, TrackingRow, TrackingTableBuilder};
use rowsync_protocol::{RowState, SyncRow, SyncSchema, SyncTable, TableChangesSelected};
use uuid::Uuid;

/// Parameters of a selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaFilter {
    /// Rows with `update_timestamp > since` are selected.
    pub since: u64,
    /// Peer to exclude. `None` selects only local writes.
    pub exclude_scope_id: Option<Uuid>,
    /// Select every row newer than `since`, ignoring origin. Tombstones
    /// are kept only when `since > 0`, i.e. on top of a snapshot.
    pub full_reinitialize: bool,
}

impl DeltaFilter {
    /// Creates an incremental filter.
    pub fn new(since: u64, exclude_scope_id: Option<Uuid>) -> Self {
        Self {
            since,
            exclude_scope_id,
            full_reinitialize: false,
        }
    }

    /// Creates a full-reinitialize filter.
    ///
    /// With `since == 0` the receiver starts empty and tombstones are
    /// useless. A non-zero `since` is a snapshot timestamp, and rows deleted
    /// after the snapshot must reach the receiver.
    pub fn full(since: u64) -> Self {
        Self {
            since,
            exclude_scope_id: None,
            full_reinitialize: true,
        }
    }

    /// Returns true if the tracking row qualifies.
    pub fn qualifies(&self, tracking: &TrackingRow) -> bool {
        if tracking.update_timestamp <= self.since {
            return false;
        }
        if self.full_reinitialize {
            return self.since > 0 || !tracking.is_tombstone;
        }
        match self.exclude_scope_id {
            Some(peer) => tracking.update_scope_id != Some(peer),
            None => tracking.update_scope_id.is_none(),
        }
    }
}

/// Returns the tables a side sends, in dependency order.
///
/// Clients only send tables that allow upload; the server only sends
/// tables that allow download.
pub fn outgoing_tables(schema: &SyncSchema, side: SyncSide) -> impl Iterator<Item = &SyncTable> {
    schema.tables.iter().filter(move |t| match side {
        SyncSide::Client => t.direction.allows_upload(),
        SyncSide::Server => t.direction.allows_download(),
    })
}

/// Lazily reads the changed rows of one table.
///
/// Tracking rows are filtered up front; base rows are read one at a time
/// as the iterator advances.
pub struct SelectedRows<'a, C> {
    conn: &'a mut C,
    table: &'a SyncTable,
    builder: &'a dyn TableBuilder<C>,
    pending: std::vec::IntoIter<TrackingRow>,
}

impl<'a, C> Iterator for SelectedRows<'a, C> {
    type Item = SyncResult<SyncRow>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let tracking = self.pending.next()?;
            if tracking.is_tombstone {
                return Some(Ok(self.table.tombstone_row(&tracking.primary_key)));
            }

            match self.builder.select_row(&mut *self.conn, &tracking.primary_key) {
                Ok(Some(values)) => return Some(Ok(SyncRow::upsert(values))),
                Ok(None) => {
                    tracing::debug!(
                        table = %self.table.name,
                        "tracked row vanished without tombstone, skipped"
                    );
                    continue;
                }
                Err(e) => return Some(Err(SyncError::from(e))),
            }
        }
    }
}

/// Selects the changed rows of a table.
pub fn select_changes<'a, C>(
    conn: &'a mut C,
    table: &'a SyncTable,
    builder: &'a dyn TableBuilder<C>,
    tracking: &dyn TrackingTableBuilder<C>,
    filter: DeltaFilter,
) -> SyncResult<SelectedRows<'a, C>> {
    let mut rows = tracking.tracking_rows(conn, Some(filter.since))?;
    rows.retain(|t| filter.qualifies(t));
    rows.sort_by_key(|t| t.update_timestamp);

    Ok(SelectedRows {
        conn,
        table,
        builder,
        pending: rows.into_iter(),
    })
}

/// Counts the rows [`select_changes`] would return, without reading them.
pub fn estimate_changes<C>(
    conn: &mut C,
    table: &SyncTable,
    tracking: &dyn TrackingTableBuilder<C>,
    filter: DeltaFilter,
) -> SyncResult<TableChangesSelected> {
    let mut counts = TableChangesSelected::new(&table.name);
    for row in tracking.tracking_rows(conn, Some(filter.since))? {
        if filter.qualifies(&row) {
            counts.record(if row.is_tombstone {
                RowState::Deleted
            } else {
                RowState::Upsert
            });
        }
    }
    Ok(counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracking(ts: u64, scope: Option<Uuid>, tombstone: bool) -> TrackingRow {
        TrackingRow {
            primary_key: vec![1.into()],
            update_timestamp: ts,
            create_timestamp: 1,
            update_scope_id: scope,
            is_tombstone: tombstone,
        }
    }

    #[test]
    fn timestamp_bound_is_exclusive() {
        let filter = DeltaFilter::new(10, Some(Uuid::new_v4()));
        assert!(!filter.qualifies(&tracking(10, None, false)));
        assert!(filter.qualifies(&tracking(11, None, false)));
    }

    #[test]
    fn peer_rows_are_excluded() {
        let peer = Uuid::new_v4();
        let other = Uuid::new_v4();
        let filter = DeltaFilter::new(0, Some(peer));

        assert!(!filter.qualifies(&tracking(5, Some(peer), false)));
        assert!(filter.qualifies(&tracking(5, Some(other), false)));
        assert!(filter.qualifies(&tracking(5, None, true)));
    }

    #[test]
    fn client_selects_only_local_writes() {
        let filter = DeltaFilter::new(0, None);
        assert!(filter.qualifies(&tracking(5, None, false)));
        assert!(!filter.qualifies(&tracking(5, Some(Uuid::new_v4()), false)));
    }

    #[test]
    fn full_mode_from_scratch_skips_tombstones() {
        let filter = DeltaFilter::full(0);
        assert!(filter.qualifies(&tracking(5, Some(Uuid::new_v4()), false)));
        assert!(!filter.qualifies(&tracking(5, None, true)));
    }

    #[test]
    fn full_mode_after_snapshot_keeps_tombstones() {
        let filter = DeltaFilter::full(3);
        assert!(filter.qualifies(&tracking(5, Some(Uuid::new_v4()), false)));
        assert!(filter.qualifies(&tracking(5, None, true)));
        assert!(filter.qualifies(&tracking(5, Some(Uuid::new_v4()), true)));
        assert!(!filter.qualifies(&tracking(3, None, true)));
    }
}
