//! Provider capability set.
//!
//! A provider adapts one database engine to the sync core. The core never
//! branches on which provider it is talking to; everything it needs goes
//! through the builders returned here.
//!
//! # Implementors
//!
//! - `rowsync_memory::MemoryProvider` - reference in-memory provider

use crate::error::{StoreError, StoreErrorKind, StoreResult, SyncResult};
use rowsync_protocol::{
    ClientScope, ServerHistoryScope, ServerScope, SyncColumn, SyncRelation, SyncSetup, SyncTable,
    SyncValue,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::BitOr;
use uuid::Uuid;

/// A transaction on the underlying store.
///
/// A connection is opened by [`SyncProvider::create_connection`] and ends
/// with exactly one of `commit` or `rollback`.
pub trait StoreConnection: Send {
    /// Commits the transaction.
    fn commit(self) -> StoreResult<()>;

    /// Rolls the transaction back.
    fn rollback(self) -> StoreResult<()>;
}

/// Shadow metadata kept for every tracked row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingRow {
    /// Primary key values.
    pub primary_key: Vec<SyncValue>,
    /// Logical timestamp of the last write.
    pub update_timestamp: u64,
    /// Logical timestamp of the first write.
    pub create_timestamp: u64,
    /// Peer that produced the last write; `None` for local writes.
    pub update_scope_id: Option<Uuid>,
    /// True once the row was deleted.
    pub is_tombstone: bool,
}

/// Scope tables managed by a [`ScopeStoreBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeTable {
    /// Client scopes.
    Client,
    /// Server scopes.
    Server,
    /// Server history (one row per client).
    ServerHistory,
}

/// Set of objects to provision or deprovision.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SyncProvision(u8);

impl SyncProvision {
    /// Nothing.
    pub const NONE: SyncProvision = SyncProvision(0);
    /// Base tables.
    pub const TABLE: SyncProvision = SyncProvision(1);
    /// Tracking tables.
    pub const TRACKING_TABLE: SyncProvision = SyncProvision(1 << 1);
    /// Change-capture triggers.
    pub const TRIGGERS: SyncProvision = SyncProvision(1 << 2);
    /// Client scope table.
    pub const CLIENT_SCOPE: SyncProvision = SyncProvision(1 << 3);
    /// Server scope table.
    pub const SERVER_SCOPE: SyncProvision = SyncProvision(1 << 4);
    /// Server history table.
    pub const SERVER_HISTORY_SCOPE: SyncProvision = SyncProvision(1 << 5);

    /// Returns true if every flag in `other` is set.
    pub fn contains(self, other: SyncProvision) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns true if no flag is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Returns the raw bits.
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Provisioning used by clients.
    pub fn client() -> Self {
        Self::TABLE | Self::TRACKING_TABLE | Self::TRIGGERS | Self::CLIENT_SCOPE
    }

    /// Provisioning used by servers. Base tables already exist.
    pub fn server() -> Self {
        Self::TRACKING_TABLE | Self::TRIGGERS | Self::SERVER_SCOPE | Self::SERVER_HISTORY_SCOPE
    }
}

impl BitOr for SyncProvision {
    type Output = SyncProvision;

    fn bitor(self, rhs: SyncProvision) -> SyncProvision {
        SyncProvision(self.0 | rhs.0)
    }
}

impl fmt::Debug for SyncProvision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (Self::TABLE, "TABLE"),
            (Self::TRACKING_TABLE, "TRACKING_TABLE"),
            (Self::TRIGGERS, "TRIGGERS"),
            (Self::CLIENT_SCOPE, "CLIENT_SCOPE"),
            (Self::SERVER_SCOPE, "SERVER_SCOPE"),
            (Self::SERVER_HISTORY_SCOPE, "SERVER_HISTORY_SCOPE"),
        ];
        let set: Vec<&str> = names
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        write!(f, "SyncProvision({})", set.join(" | "))
    }
}

/// Base table operations for one table.
pub trait TableBuilder<C> {
    /// Returns true if the table exists.
    fn exists(&self, conn: &mut C) -> StoreResult<bool>;

    /// Creates the table from the schema definition.
    fn create(&self, conn: &mut C) -> StoreResult<()>;

    /// Drops the table.
    fn drop_table(&self, conn: &mut C) -> StoreResult<()>;

    /// Adds a column.
    fn add_column(&self, conn: &mut C, column: &SyncColumn) -> StoreResult<()>;

    /// Drops a column.
    fn drop_column(&self, conn: &mut C, column: &str) -> StoreResult<()>;

    /// Discovers the table's columns, in declaration order.
    fn columns(&self, conn: &mut C) -> StoreResult<Vec<SyncColumn>>;

    /// Discovers the primary key columns, in key order.
    fn primary_keys(&self, conn: &mut C) -> StoreResult<Vec<String>>;

    /// Discovers the foreign keys declared on the table.
    fn relations(&self, conn: &mut C) -> StoreResult<Vec<SyncRelation>>;

    /// Disables constraint checks on the table.
    fn disable_constraints(&self, conn: &mut C) -> StoreResult<()>;

    /// Re-enables constraint checks on the table.
    fn enable_constraints(&self, conn: &mut C) -> StoreResult<()>;

    /// Deletes every row and its tracking metadata, without tombstones.
    fn reset(&self, conn: &mut C) -> StoreResult<()>;

    /// Reads a row by primary key, values in schema column order.
    fn select_row(&self, conn: &mut C, primary_key: &[SyncValue])
        -> StoreResult<Option<Vec<SyncValue>>>;

    /// Inserts or updates a row, values in schema column order.
    fn upsert_row(&self, conn: &mut C, values: &[SyncValue]) -> StoreResult<()>;

    /// Deletes a row. Returns false if it did not exist.
    fn delete_row(&self, conn: &mut C, primary_key: &[SyncValue]) -> StoreResult<bool>;
}

/// Tracking table and trigger operations for one table.
pub trait TrackingTableBuilder<C> {
    /// Returns the tracking table name.
    fn tracking_table_name(&self) -> String;

    /// Returns true if the tracking table exists.
    fn exists(&self, conn: &mut C) -> StoreResult<bool>;

    /// Creates the tracking table.
    fn create(&self, conn: &mut C) -> StoreResult<()>;

    /// Drops the tracking table.
    fn drop_tracking(&self, conn: &mut C) -> StoreResult<()>;

    /// Renames a tracking table created under other affixes.
    fn rename_from(&self, conn: &mut C, old_name: &str) -> StoreResult<()>;

    /// Returns true if the change-capture triggers exist.
    fn triggers_exist(&self, conn: &mut C) -> StoreResult<bool>;

    /// Creates the change-capture triggers.
    fn create_triggers(&self, conn: &mut C) -> StoreResult<()>;

    /// Drops the change-capture triggers.
    fn drop_triggers(&self, conn: &mut C) -> StoreResult<()>;

    /// Creates tracking rows for base rows that have none. Returns the count.
    fn update_untracked_rows(&self, conn: &mut C) -> StoreResult<u64>;

    /// Returns tracking rows with `update_timestamp > since`, or all of them.
    fn tracking_rows(&self, conn: &mut C, since: Option<u64>) -> StoreResult<Vec<TrackingRow>>;

    /// Returns the tracking row for a primary key.
    fn tracking_row(&self, conn: &mut C, primary_key: &[SyncValue])
        -> StoreResult<Option<TrackingRow>>;

    /// Stamps the peer that produced the last write.
    fn update_scope_id(
        &self,
        conn: &mut C,
        primary_key: &[SyncValue],
        scope_id: Option<Uuid>,
    ) -> StoreResult<()>;

    /// Purges tombstones with `update_timestamp < floor`. Returns the count.
    fn delete_metadata(&self, conn: &mut C, floor: u64) -> StoreResult<u64>;
}

/// Scope table operations.
pub trait ScopeStoreBuilder<C> {
    /// Returns true if the scope table exists.
    fn exists(&self, conn: &mut C, table: ScopeTable) -> StoreResult<bool>;

    /// Creates the scope table.
    fn create(&self, conn: &mut C, table: ScopeTable) -> StoreResult<()>;

    /// Drops the scope table.
    fn drop_table(&self, conn: &mut C, table: ScopeTable) -> StoreResult<()>;

    /// Returns the current logical timestamp of the database.
    fn local_timestamp(&self, conn: &mut C) -> StoreResult<u64>;

    /// Loads a client scope by name.
    fn load_client_scope(&self, conn: &mut C, name: &str) -> StoreResult<Option<ClientScope>>;

    /// Inserts or replaces a client scope.
    fn save_client_scope(&self, conn: &mut C, scope: &ClientScope) -> StoreResult<()>;

    /// Lists client scopes.
    fn list_client_scopes(&self, conn: &mut C) -> StoreResult<Vec<ClientScope>>;

    /// Loads a server scope by name.
    fn load_server_scope(&self, conn: &mut C, name: &str) -> StoreResult<Option<ServerScope>>;

    /// Inserts or replaces a server scope.
    fn save_server_scope(&self, conn: &mut C, scope: &ServerScope) -> StoreResult<()>;

    /// Lists server scopes.
    fn list_server_scopes(&self, conn: &mut C) -> StoreResult<Vec<ServerScope>>;

    /// Loads a history entry by client scope id.
    fn load_history_scope(&self, conn: &mut C, id: Uuid)
        -> StoreResult<Option<ServerHistoryScope>>;

    /// Inserts or replaces a history entry.
    fn save_history_scope(&self, conn: &mut C, scope: &ServerHistoryScope) -> StoreResult<()>;

    /// Lists history entries for a scope name.
    fn list_history_scopes(&self, conn: &mut C, name: &str) -> StoreResult<Vec<ServerHistoryScope>>;
}

/// A database engine adapted to the sync core.
pub trait SyncProvider: Send + Sync {
    /// Transaction type.
    type Connection: StoreConnection;

    /// Provider name, for logs.
    fn name(&self) -> &str;

    /// Opens a connection with a transaction started.
    fn create_connection(&self) -> StoreResult<Self::Connection>;

    /// Returns the base table builder for a table.
    fn table_builder<'a>(
        &'a self,
        table: &'a SyncTable,
        setup: &'a SyncSetup,
    ) -> Box<dyn TableBuilder<Self::Connection> + 'a>;

    /// Returns the tracking table builder for a table.
    fn tracking_table_builder<'a>(
        &'a self,
        table: &'a SyncTable,
        setup: &'a SyncSetup,
    ) -> Box<dyn TrackingTableBuilder<Self::Connection> + 'a>;

    /// Returns the scope store builder.
    fn scope_store_builder<'a>(
        &'a self,
        scope_info_table: &'a str,
    ) -> Box<dyn ScopeStoreBuilder<Self::Connection> + 'a>;

    /// Returns false for providers that can only be clients.
    fn can_act_as_server(&self) -> bool {
        true
    }

    /// Returns true if a session failing with this error may be retried.
    fn should_retry(&self, error: &StoreError) -> bool {
        matches!(error.kind, StoreErrorKind::Connection | StoreErrorKind::Busy)
    }
}

/// Runs `f` in the caller's transaction, or in a new one.
///
/// A transaction opened here is committed on success and rolled back on
/// failure. A caller-supplied transaction is left open either way.
pub fn run_in_transaction<P, T, F>(
    provider: &P,
    conn: Option<&mut P::Connection>,
    f: F,
) -> SyncResult<T>
where
    P: SyncProvider + ?Sized,
    F: FnOnce(&mut P::Connection) -> SyncResult<T>,
{
    if let Some(conn) = conn {
        return f(conn);
    }

    let mut conn = provider.create_connection()?;
    match f(&mut conn) {
        Ok(value) => {
            conn.commit()?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback) = conn.rollback() {
                tracing::warn!(provider = provider.name(), error = %rollback, "rollback failed");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provision_flags() {
        let flags = SyncProvision::TABLE | SyncProvision::TRIGGERS;
        assert!(flags.contains(SyncProvision::TABLE));
        assert!(flags.contains(SyncProvision::TRIGGERS));
        assert!(!flags.contains(SyncProvision::TRACKING_TABLE));
        assert!(SyncProvision::NONE.is_empty());

        assert!(SyncProvision::client().contains(SyncProvision::CLIENT_SCOPE));
        assert!(!SyncProvision::server().contains(SyncProvision::TABLE));
        assert_eq!(
            format!("{flags:?}"),
            "SyncProvision(TABLE | TRIGGERS)"
        );
    }
}
