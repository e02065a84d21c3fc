//! Tombstone cleanup.

use crate::error::SyncResult;
use crate::provider::SyncProvider;
use rowsync_protocol::{SyncSchema, SyncSetup};

/// Tombstones purged from one tracking table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMetadatasCleaned {
    /// Base table name.
    pub table_name: String,
    /// Tracking table name.
    pub tracking_table_name: String,
    /// Tombstones purged.
    pub rows_cleaned: u64,
}

/// Result of a metadata cleanup.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DatabaseMetadatasCleaned {
    /// Floor used: tombstones strictly older were purged.
    pub timestamp: u64,
    /// Per-table counts. Tables with nothing purged are omitted.
    pub tables: Vec<TableMetadatasCleaned>,
}

impl DatabaseMetadatasCleaned {
    /// Total tombstones purged.
    pub fn rows_cleaned(&self) -> u64 {
        self.tables.iter().map(|t| t.rows_cleaned).sum()
    }
}

/// Purges tombstones with `update_timestamp < floor` from every tracking
/// table of the schema. A floor of 0 purges nothing.
pub fn delete_metadata<P>(
    provider: &P,
    conn: &mut P::Connection,
    schema: &SyncSchema,
    setup: &SyncSetup,
    floor: u64,
) -> SyncResult<DatabaseMetadatasCleaned>
where
    P: SyncProvider + ?Sized,
{
    let mut cleaned = DatabaseMetadatasCleaned {
        timestamp: floor,
        tables: Vec::new(),
    };
    if floor == 0 {
        return Ok(cleaned);
    }

    for table in &schema.tables {
        let tracking = provider.tracking_table_builder(table, setup);
        if !tracking.exists(conn)? {
            continue;
        }
        let rows_cleaned = tracking.delete_metadata(conn, floor)?;
        if rows_cleaned > 0 {
            cleaned.tables.push(TableMetadatasCleaned {
                table_name: table.name.clone(),
                tracking_table_name: tracking.tracking_table_name(),
                rows_cleaned,
            });
        }
    }

    tracing::info!(floor, rows = cleaned.rows_cleaned(), "metadata cleaned");
    Ok(cleaned)
}
