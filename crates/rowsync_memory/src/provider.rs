//! The reference provider and its transactions.

use crate::builders::{MemoryScopeStoreBuilder, MemoryTableBuilder, MemoryTrackingBuilder};
use crate::error::{MemoryError, MemoryResult};
use crate::file::DatabaseFile;
use crate::state::{row_key, DatabaseState, TableData};
use parking_lot::{Mutex, RwLock};
use rowsync_engine::{
    ScopeStoreBuilder, StoreConnection, StoreError, StoreResult, SyncProvider, TableBuilder,
    TrackingRow, TrackingTableBuilder,
};
use rowsync_protocol::{SyncRelation, SyncSetup, SyncTable, SyncValue};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug)]
struct Shared {
    name: String,
    state: RwLock<DatabaseState>,
    file: Option<DatabaseFile>,
    client_only: bool,
    fail_next_write: Mutex<Option<StoreError>>,
    fail_next_commit: Mutex<Option<StoreError>>,
}

/// An in-memory relational store implementing the provider capability set.
///
/// Cloning is cheap; clones share the same database.
///
/// # Transactions
///
/// A connection works on a private copy of the database. Commit publishes
/// the copy unless another write transaction committed since the copy was
/// taken, in which case it fails with a retryable `Busy` error.
///
/// # Example
///
/// ```rust
/// use rowsync_memory::MemoryProvider;
/// use rowsync_protocol::{ColumnType, SyncColumn, SyncTable};
///
/// let db = MemoryProvider::new("server");
/// db.create_table(&SyncTable::new(
///     "customer",
///     vec![SyncColumn::new("id", ColumnType::Integer)],
///     vec!["id".into()],
/// ))
/// .unwrap();
/// db.upsert("customer", vec![1.into()]).unwrap();
/// assert_eq!(db.rows("customer").unwrap().len(), 1);
/// ```
#[derive(Debug, Clone)]
pub struct MemoryProvider {
    shared: Arc<Shared>,
}

/// Row and tracking counts of a database, for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSummary {
    /// Logical timestamp.
    pub timestamp: u64,
    /// `(table, rows)` for every base table.
    pub tables: Vec<(String, usize)>,
    /// `(tracking table, rows, tombstones)` for every tracking table.
    pub tracking: Vec<(String, usize, usize)>,
    /// Scope info table names.
    pub scope_tables: Vec<String>,
}

impl MemoryProvider {
    /// Creates an empty in-memory database.
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name.into(), DatabaseState::default(), None, false)
    }

    /// Creates an empty database that refuses the server role.
    pub fn client_only(name: impl Into<String>) -> Self {
        Self::build(name.into(), DatabaseState::default(), None, true)
    }

    /// Opens a database persisted in a directory, creating it if needed.
    ///
    /// The directory stays locked until every clone is dropped.
    pub fn open(name: impl Into<String>, path: &Path) -> MemoryResult<Self> {
        let file = DatabaseFile::open(path)?;
        let state = file.load()?.unwrap_or_default();
        tracing::debug!(path = %path.display(), timestamp = state.timestamp, "database opened");
        Ok(Self::build(name.into(), state, Some(file), false))
    }

    fn build(name: String, state: DatabaseState, file: Option<DatabaseFile>, client_only: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                name,
                state: RwLock::new(state),
                file,
                client_only,
                fail_next_write: Mutex::new(None),
                fail_next_commit: Mutex::new(None),
            }),
        }
    }

    /// Makes the next row write through a builder fail with `error`.
    pub fn fail_next_write(&self, error: StoreError) {
        *self.shared.fail_next_write.lock() = Some(error);
    }

    /// Makes the next commit of a write transaction fail with `error`.
    pub fn fail_next_commit(&self, error: StoreError) {
        *self.shared.fail_next_commit.lock() = Some(error);
    }

    /// Runs `f` in a transaction and commits it.
    fn write<T>(&self, f: impl FnOnce(&mut DatabaseState) -> MemoryResult<T>) -> MemoryResult<T> {
        let mut conn = self.begin();
        let value = f(conn.state_mut())?;
        conn.publish()?;
        Ok(value)
    }

    fn begin(&self) -> MemoryConnection {
        let state = self.shared.state.read().clone();
        MemoryConnection {
            shared: Arc::clone(&self.shared),
            base_version: state.version,
            state,
            dirty: false,
        }
    }

    /// Creates a base table with no rows.
    pub fn create_table(&self, table: &SyncTable) -> MemoryResult<()> {
        self.write(|state| {
            if state.tables.contains_key(&table.name) {
                return Err(MemoryError::AlreadyExists(format!("table {}", table.name)));
            }
            state.tables.insert(
                table.name.clone(),
                TableData::new(table.columns.clone(), table.primary_keys.clone()),
            );
            Ok(())
        })
    }

    /// Declares a foreign key on the relation's child table.
    pub fn add_relation(&self, relation: SyncRelation) -> MemoryResult<()> {
        self.write(|state| {
            state.table(&relation.parent_table)?;
            state.table_mut(&relation.child_table)?.relations.push(relation);
            Ok(())
        })
    }

    /// Inserts or replaces a row, values in declaration order.
    pub fn upsert(&self, table: &str, values: Vec<SyncValue>) -> MemoryResult<()> {
        self.write(|state| state.write_row(table, values))
    }

    /// Deletes a row. Returns false if it did not exist.
    pub fn delete(&self, table: &str, primary_key: &[SyncValue]) -> MemoryResult<bool> {
        self.write(|state| state.remove_row(table, primary_key))
    }

    /// Returns a row by primary key, values in declaration order.
    pub fn row(&self, table: &str, primary_key: &[SyncValue]) -> MemoryResult<Option<Vec<SyncValue>>> {
        let key = row_key(primary_key)?;
        Ok(self.shared.state.read().table(table)?.rows.get(&key).cloned())
    }

    /// Returns every row of a table in primary key order.
    pub fn rows(&self, table: &str) -> MemoryResult<Vec<Vec<SyncValue>>> {
        Ok(self
            .shared
            .state
            .read()
            .table(table)?
            .rows
            .values()
            .cloned()
            .collect())
    }

    /// Returns every row of a tracking table.
    pub fn tracking_rows(&self, tracking_table: &str) -> MemoryResult<Vec<TrackingRow>> {
        Ok(self
            .shared
            .state
            .read()
            .tracking(tracking_table)?
            .rows
            .values()
            .cloned()
            .collect())
    }

    /// Returns the logical timestamp.
    pub fn timestamp(&self) -> u64 {
        self.shared.state.read().timestamp
    }

    /// Moves the logical timestamp forward to at least `timestamp`.
    pub fn advance_timestamp(&self, timestamp: u64) -> MemoryResult<()> {
        self.write(|state| {
            state.timestamp = state.timestamp.max(timestamp);
            Ok(())
        })
    }

    /// Returns row counts for inspection.
    pub fn summary(&self) -> DatabaseSummary {
        let state = self.shared.state.read();
        DatabaseSummary {
            timestamp: state.timestamp,
            tables: state
                .tables
                .iter()
                .map(|(name, t)| (name.clone(), t.rows.len()))
                .collect(),
            tracking: state
                .tracking
                .iter()
                .map(|(name, t)| {
                    let tombstones = t.rows.values().filter(|r| r.is_tombstone).count();
                    (name.clone(), t.rows.len(), tombstones)
                })
                .collect(),
            scope_tables: state.scopes.keys().cloned().collect(),
        }
    }

    /// Returns the database directory, if persisted.
    pub fn path(&self) -> Option<&Path> {
        self.shared.file.as_ref().map(DatabaseFile::path)
    }
}

impl SyncProvider for MemoryProvider {
    type Connection = MemoryConnection;

    fn name(&self) -> &str {
        &self.shared.name
    }

    fn create_connection(&self) -> StoreResult<MemoryConnection> {
        Ok(self.begin())
    }

    fn table_builder<'a>(
        &'a self,
        table: &'a SyncTable,
        _setup: &'a SyncSetup,
    ) -> Box<dyn TableBuilder<MemoryConnection> + 'a> {
        Box::new(MemoryTableBuilder::new(table))
    }

    fn tracking_table_builder<'a>(
        &'a self,
        table: &'a SyncTable,
        setup: &'a SyncSetup,
    ) -> Box<dyn TrackingTableBuilder<MemoryConnection> + 'a> {
        Box::new(MemoryTrackingBuilder::new(table, setup))
    }

    fn scope_store_builder<'a>(
        &'a self,
        scope_info_table: &'a str,
    ) -> Box<dyn ScopeStoreBuilder<MemoryConnection> + 'a> {
        Box::new(MemoryScopeStoreBuilder::new(scope_info_table))
    }

    fn can_act_as_server(&self) -> bool {
        !self.shared.client_only
    }
}

/// A transaction on a [`MemoryProvider`].
#[derive(Debug)]
pub struct MemoryConnection {
    shared: Arc<Shared>,
    base_version: u64,
    state: DatabaseState,
    dirty: bool,
}

impl MemoryConnection {
    pub(crate) fn state(&self) -> &DatabaseState {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut DatabaseState {
        self.dirty = true;
        &mut self.state
    }

    /// Takes the injected row write failure, if any.
    pub(crate) fn injected_write_failure(&self) -> MemoryResult<()> {
        match self.shared.fail_next_write.lock().take() {
            Some(e) => Err(MemoryError::Injected(e)),
            None => Ok(()),
        }
    }

    fn publish(self) -> MemoryResult<()> {
        if let Some(e) = self.shared.fail_next_commit.lock().take() {
            return Err(MemoryError::Injected(e));
        }
        if !self.dirty {
            return Ok(());
        }

        let mut current = self.shared.state.write();
        if current.version != self.base_version {
            tracing::debug!(
                provider = %self.shared.name,
                base = self.base_version,
                current = current.version,
                "commit lost to a concurrent transaction"
            );
            return Err(MemoryError::Busy);
        }

        let mut next = self.state;
        next.version = self.base_version + 1;
        if let Some(file) = &self.shared.file {
            file.save(&next)?;
        }
        *current = next;
        Ok(())
    }
}

impl StoreConnection for MemoryConnection {
    fn commit(self) -> StoreResult<()> {
        Ok(self.publish()?)
    }

    fn rollback(self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowsync_engine::StoreErrorKind;
    use rowsync_protocol::{ColumnType, SyncColumn};
    use tempfile::tempdir;

    fn customer() -> SyncTable {
        SyncTable::new(
            "customer",
            vec![
                SyncColumn::new("id", ColumnType::Integer),
                SyncColumn::nullable("name", ColumnType::Text),
            ],
            vec!["id".into()],
        )
    }

    #[test]
    fn public_writes_commit() {
        let db = MemoryProvider::new("db");
        db.create_table(&customer()).unwrap();
        db.upsert("customer", vec![1.into(), "Ann".into()]).unwrap();

        assert_eq!(
            db.row("customer", &[1.into()]).unwrap(),
            Some(vec![1.into(), "Ann".into()])
        );
        assert!(db.delete("customer", &[1.into()]).unwrap());
        assert!(db.rows("customer").unwrap().is_empty());
        assert!(matches!(
            db.create_table(&customer()),
            Err(MemoryError::AlreadyExists(_))
        ));
    }

    #[test]
    fn concurrent_commit_is_busy() {
        let db = MemoryProvider::new("db");
        db.create_table(&customer()).unwrap();

        let mut first = db.create_connection().unwrap();
        let mut second = db.create_connection().unwrap();
        first
            .state_mut()
            .write_row("customer", vec![1.into(), SyncValue::Null])
            .unwrap();
        second
            .state_mut()
            .write_row("customer", vec![2.into(), SyncValue::Null])
            .unwrap();

        first.commit().unwrap();
        let err = second.commit().unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::Busy);
        assert!(db.should_retry(&err));
        assert_eq!(db.rows("customer").unwrap().len(), 1);
    }

    #[test]
    fn read_only_transactions_never_conflict() {
        let db = MemoryProvider::new("db");
        db.create_table(&customer()).unwrap();

        let reader = db.create_connection().unwrap();
        db.upsert("customer", vec![1.into(), SyncValue::Null]).unwrap();
        reader.commit().unwrap();
    }

    #[test]
    fn rollback_discards_writes() {
        let db = MemoryProvider::new("db");
        db.create_table(&customer()).unwrap();

        let mut conn = db.create_connection().unwrap();
        conn.state_mut()
            .write_row("customer", vec![1.into(), SyncValue::Null])
            .unwrap();
        conn.rollback().unwrap();

        assert!(db.rows("customer").unwrap().is_empty());
        assert_eq!(db.timestamp(), 0);
    }

    #[test]
    fn injected_commit_failure() {
        let db = MemoryProvider::new("db");
        db.create_table(&customer()).unwrap();
        db.fail_next_commit(StoreError::connection("socket closed"));

        let err = db.upsert("customer", vec![1.into(), SyncValue::Null]).unwrap_err();
        assert!(matches!(err, MemoryError::Injected(_)));
        db.upsert("customer", vec![1.into(), SyncValue::Null]).unwrap();
    }

    #[test]
    fn client_only_refuses_server_role() {
        assert!(MemoryProvider::new("a").can_act_as_server());
        assert!(!MemoryProvider::client_only("b").can_act_as_server());
    }

    #[test]
    fn persisted_database_reopens() {
        let dir = tempdir().unwrap();
        {
            let db = MemoryProvider::open("db", dir.path()).unwrap();
            db.create_table(&customer()).unwrap();
            db.upsert("customer", vec![1.into(), "Ann".into()]).unwrap();
            assert!(matches!(
                MemoryProvider::open("db", dir.path()),
                Err(MemoryError::Locked(_))
            ));
        }

        let db = MemoryProvider::open("db", dir.path()).unwrap();
        assert_eq!(db.rows("customer").unwrap().len(), 1);
        assert_eq!(db.timestamp(), 1);
        assert_eq!(db.path(), Some(dir.path()));
    }

    #[test]
    fn summary_counts() {
        let db = MemoryProvider::new("db");
        db.create_table(&customer()).unwrap();
        db.upsert("customer", vec![1.into(), SyncValue::Null]).unwrap();
        db.advance_timestamp(100).unwrap();

        let summary = db.summary();
        assert_eq!(summary.timestamp, 100);
        assert_eq!(summary.tables, vec![("customer".to_string(), 1)]);
        assert!(summary.tracking.is_empty());
    }
}
