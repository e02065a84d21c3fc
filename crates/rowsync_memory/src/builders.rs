//! Capability builders over a [`MemoryConnection`].

use crate::error::{MemoryError, MemoryResult};
use crate::provider::MemoryConnection;
use crate::state::{row_key, DatabaseState, TableData, TrackingData, TriggerData};
use rowsync_engine::{ScopeStoreBuilder, ScopeTable, StoreResult, TableBuilder, TrackingRow, TrackingTableBuilder};
use rowsync_protocol::{
    ClientScope, ServerHistoryScope, ServerScope, SyncColumn, SyncRelation, SyncSetup, SyncTable,
    SyncValue,
};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Base table operations. Values cross this boundary in the order of the
/// schema table, which may be a subset of the stored columns.
pub(crate) struct MemoryTableBuilder<'a> {
    table: &'a SyncTable,
}

impl<'a> MemoryTableBuilder<'a> {
    pub(crate) fn new(table: &'a SyncTable) -> Self {
        Self { table }
    }

    fn stored<'s>(&self, state: &'s DatabaseState) -> MemoryResult<&'s TableData> {
        state.table(&self.table.name)
    }

    /// Maps schema positions to stored positions.
    fn positions(&self, stored: &TableData) -> MemoryResult<Vec<usize>> {
        self.table
            .columns
            .iter()
            .map(|c| {
                stored.column_index(&c.name).ok_or_else(|| MemoryError::NoSuchColumn {
                    table: self.table.name.clone(),
                    column: c.name.clone(),
                })
            })
            .collect()
    }

    fn upsert(&self, conn: &mut MemoryConnection, values: &[SyncValue]) -> MemoryResult<()> {
        conn.injected_write_failure()?;
        let stored = self.stored(conn.state())?;
        let positions = self.positions(stored)?;
        if positions.len() != values.len() {
            return Err(MemoryError::Schema(format!(
                "{} expects {} values, got {}",
                self.table.name,
                positions.len(),
                values.len()
            )));
        }

        let mut primary_key = vec![SyncValue::Null; self.table.primary_keys.len()];
        for (slot, name) in self.table.primary_keys.iter().enumerate() {
            if let Some(i) = self.table.column_index(name) {
                primary_key[slot] = values[i].clone();
            }
        }
        let mut row = stored
            .rows
            .get(&row_key(&primary_key)?)
            .cloned()
            .unwrap_or_else(|| vec![SyncValue::Null; stored.columns.len()]);
        for (position, value) in positions.into_iter().zip(values) {
            row[position] = value.clone();
        }

        conn.state_mut().write_row(&self.table.name, row)
    }
}

impl TableBuilder<MemoryConnection> for MemoryTableBuilder<'_> {
    fn exists(&self, conn: &mut MemoryConnection) -> StoreResult<bool> {
        Ok(conn.state().tables.contains_key(&self.table.name))
    }

    fn create(&self, conn: &mut MemoryConnection) -> StoreResult<()> {
        let state = conn.state_mut();
        if state.tables.contains_key(&self.table.name) {
            return Err(MemoryError::AlreadyExists(format!("table {}", self.table.name)).into());
        }
        state.tables.insert(
            self.table.name.clone(),
            TableData::new(self.table.columns.clone(), self.table.primary_keys.clone()),
        );
        Ok(())
    }

    fn drop_table(&self, conn: &mut MemoryConnection) -> StoreResult<()> {
        conn.state_mut().tables.remove(&self.table.name);
        Ok(())
    }

    fn add_column(&self, conn: &mut MemoryConnection, column: &SyncColumn) -> StoreResult<()> {
        let table = conn.state_mut().table_mut(&self.table.name)?;
        if table.column_index(&column.name).is_some() {
            return Err(MemoryError::AlreadyExists(format!(
                "column {}.{}",
                self.table.name, column.name
            ))
            .into());
        }
        // Existing rows get NULL, so the column must accept it.
        table.columns.push(SyncColumn::nullable(&column.name, column.data_type));
        for row in table.rows.values_mut() {
            row.push(SyncValue::Null);
        }
        Ok(())
    }

    fn drop_column(&self, conn: &mut MemoryConnection, column: &str) -> StoreResult<()> {
        let table = conn.state_mut().table_mut(&self.table.name)?;
        let index = table.column_index(column).ok_or_else(|| MemoryError::NoSuchColumn {
            table: self.table.name.clone(),
            column: column.to_string(),
        })?;
        if table.primary_keys.iter().any(|pk| pk == column) {
            return Err(MemoryError::Schema(format!("cannot drop primary key column {column}")).into());
        }
        table.columns.remove(index);
        for row in table.rows.values_mut() {
            row.remove(index);
        }
        Ok(())
    }

    fn columns(&self, conn: &mut MemoryConnection) -> StoreResult<Vec<SyncColumn>> {
        Ok(self.stored(conn.state())?.columns.clone())
    }

    fn primary_keys(&self, conn: &mut MemoryConnection) -> StoreResult<Vec<String>> {
        Ok(self.stored(conn.state())?.primary_keys.clone())
    }

    fn relations(&self, conn: &mut MemoryConnection) -> StoreResult<Vec<SyncRelation>> {
        Ok(self.stored(conn.state())?.relations.clone())
    }

    fn disable_constraints(&self, conn: &mut MemoryConnection) -> StoreResult<()> {
        conn.state_mut().table_mut(&self.table.name)?.constraints_disabled = true;
        Ok(())
    }

    fn enable_constraints(&self, conn: &mut MemoryConnection) -> StoreResult<()> {
        conn.state_mut().table_mut(&self.table.name)?.constraints_disabled = false;
        Ok(())
    }

    fn reset(&self, conn: &mut MemoryConnection) -> StoreResult<()> {
        Ok(conn.state_mut().reset_table(&self.table.name)?)
    }

    fn select_row(
        &self,
        conn: &mut MemoryConnection,
        primary_key: &[SyncValue],
    ) -> StoreResult<Option<Vec<SyncValue>>> {
        let stored = self.stored(conn.state())?;
        let positions = self.positions(stored)?;
        let Some(row) = stored.rows.get(&row_key(primary_key)?) else {
            return Ok(None);
        };
        Ok(Some(positions.into_iter().map(|i| row[i].clone()).collect()))
    }

    fn upsert_row(&self, conn: &mut MemoryConnection, values: &[SyncValue]) -> StoreResult<()> {
        Ok(self.upsert(conn, values)?)
    }

    fn delete_row(&self, conn: &mut MemoryConnection, primary_key: &[SyncValue]) -> StoreResult<bool> {
        conn.injected_write_failure()?;
        Ok(conn.state_mut().remove_row(&self.table.name, primary_key)?)
    }
}

/// Tracking table and trigger operations.
pub(crate) struct MemoryTrackingBuilder<'a> {
    table: &'a SyncTable,
    setup: &'a SyncSetup,
}

impl<'a> MemoryTrackingBuilder<'a> {
    pub(crate) fn new(table: &'a SyncTable, setup: &'a SyncSetup) -> Self {
        Self { table, setup }
    }

    fn name(&self) -> String {
        self.setup.tracking_table_name(&self.table.name)
    }

    fn trigger_name(&self) -> String {
        self.setup.trigger_name(&self.table.name)
    }
}

impl TrackingTableBuilder<MemoryConnection> for MemoryTrackingBuilder<'_> {
    fn tracking_table_name(&self) -> String {
        self.name()
    }

    fn exists(&self, conn: &mut MemoryConnection) -> StoreResult<bool> {
        Ok(conn.state().tracking.contains_key(&self.name()))
    }

    fn create(&self, conn: &mut MemoryConnection) -> StoreResult<()> {
        let name = self.name();
        let state = conn.state_mut();
        if state.tracking.contains_key(&name) {
            return Err(MemoryError::AlreadyExists(format!("tracking table {name}")).into());
        }
        state.tracking.insert(
            name,
            TrackingData {
                table_name: self.table.name.clone(),
                rows: BTreeMap::new(),
            },
        );
        Ok(())
    }

    fn drop_tracking(&self, conn: &mut MemoryConnection) -> StoreResult<()> {
        conn.state_mut().tracking.remove(&self.name());
        Ok(())
    }

    fn rename_from(&self, conn: &mut MemoryConnection, old_name: &str) -> StoreResult<()> {
        let name = self.name();
        let state = conn.state_mut();
        let data = state
            .tracking
            .remove(old_name)
            .ok_or_else(|| MemoryError::NoSuchTable(old_name.to_string()))?;
        state.tracking.insert(name.clone(), data);
        for trigger in state.triggers.values_mut() {
            if trigger.tracking_table == old_name {
                trigger.tracking_table = name.clone();
            }
        }
        Ok(())
    }

    fn triggers_exist(&self, conn: &mut MemoryConnection) -> StoreResult<bool> {
        Ok(conn.state().triggers.contains_key(&self.trigger_name()))
    }

    fn create_triggers(&self, conn: &mut MemoryConnection) -> StoreResult<()> {
        let name = self.trigger_name();
        let tracking_table = self.name();
        let state = conn.state_mut();
        state.table(&self.table.name)?;
        state.triggers.insert(
            name,
            TriggerData {
                table_name: self.table.name.clone(),
                tracking_table,
            },
        );
        Ok(())
    }

    fn drop_triggers(&self, conn: &mut MemoryConnection) -> StoreResult<()> {
        conn.state_mut().triggers.remove(&self.trigger_name());
        Ok(())
    }

    fn update_untracked_rows(&self, conn: &mut MemoryConnection) -> StoreResult<u64> {
        let name = self.name();
        let state = conn.state_mut();
        let table = state.table(&self.table.name)?;
        let tracked = state.tracking(&name)?;

        let mut untracked = Vec::new();
        for (key, row) in &table.rows {
            if !tracked.rows.contains_key(key) {
                untracked.push((key.clone(), table.primary_key_of(&self.table.name, row)?));
            }
        }

        let count = untracked.len() as u64;
        for (key, primary_key) in untracked {
            let timestamp = state.tick();
            state.tracking_mut(&name)?.rows.insert(
                key,
                TrackingRow {
                    primary_key,
                    update_timestamp: timestamp,
                    create_timestamp: timestamp,
                    update_scope_id: None,
                    is_tombstone: false,
                },
            );
        }
        Ok(count)
    }

    fn tracking_rows(&self, conn: &mut MemoryConnection, since: Option<u64>) -> StoreResult<Vec<TrackingRow>> {
        let tracking = conn.state().tracking(&self.name())?;
        Ok(tracking
            .rows
            .values()
            .filter(|r| since.map_or(true, |s| r.update_timestamp > s))
            .cloned()
            .collect())
    }

    fn tracking_row(
        &self,
        conn: &mut MemoryConnection,
        primary_key: &[SyncValue],
    ) -> StoreResult<Option<TrackingRow>> {
        let key = row_key(primary_key)?;
        Ok(conn.state().tracking(&self.name())?.rows.get(&key).cloned())
    }

    fn update_scope_id(
        &self,
        conn: &mut MemoryConnection,
        primary_key: &[SyncValue],
        scope_id: Option<Uuid>,
    ) -> StoreResult<()> {
        let key = row_key(primary_key)?;
        let name = self.name();
        if let Some(row) = conn.state_mut().tracking_mut(&name)?.rows.get_mut(&key) {
            row.update_scope_id = scope_id;
        }
        Ok(())
    }

    fn delete_metadata(&self, conn: &mut MemoryConnection, floor: u64) -> StoreResult<u64> {
        let name = self.name();
        let tracking = conn.state_mut().tracking_mut(&name)?;
        let before = tracking.rows.len();
        tracking
            .rows
            .retain(|_, r| !(r.is_tombstone && r.update_timestamp < floor));
        Ok((before - tracking.rows.len()) as u64)
    }
}

/// Scope table operations.
pub(crate) struct MemoryScopeStoreBuilder<'a> {
    scope_info: &'a str,
}

impl<'a> MemoryScopeStoreBuilder<'a> {
    pub(crate) fn new(scope_info: &'a str) -> Self {
        Self { scope_info }
    }

    fn table_name(&self, table: ScopeTable) -> String {
        match table {
            ScopeTable::Client => self.scope_info.to_string(),
            ScopeTable::Server => format!("{}_server", self.scope_info),
            ScopeTable::ServerHistory => format!("{}_history", self.scope_info),
        }
    }

    fn missing(&self, table: ScopeTable) -> MemoryError {
        MemoryError::NoSuchTable(self.table_name(table))
    }

    fn clients<'s>(&self, state: &'s DatabaseState) -> MemoryResult<&'s BTreeMap<String, ClientScope>> {
        state
            .scopes
            .get(self.scope_info)
            .and_then(|s| s.client.as_ref())
            .ok_or_else(|| self.missing(ScopeTable::Client))
    }

    fn servers<'s>(&self, state: &'s DatabaseState) -> MemoryResult<&'s BTreeMap<String, ServerScope>> {
        state
            .scopes
            .get(self.scope_info)
            .and_then(|s| s.server.as_ref())
            .ok_or_else(|| self.missing(ScopeTable::Server))
    }

    fn histories<'s>(
        &self,
        state: &'s DatabaseState,
    ) -> MemoryResult<&'s BTreeMap<String, ServerHistoryScope>> {
        state
            .scopes
            .get(self.scope_info)
            .and_then(|s| s.history.as_ref())
            .ok_or_else(|| self.missing(ScopeTable::ServerHistory))
    }
}

impl ScopeStoreBuilder<MemoryConnection> for MemoryScopeStoreBuilder<'_> {
    fn exists(&self, conn: &mut MemoryConnection, table: ScopeTable) -> StoreResult<bool> {
        let Some(tables) = conn.state().scopes.get(self.scope_info) else {
            return Ok(false);
        };
        Ok(match table {
            ScopeTable::Client => tables.client.is_some(),
            ScopeTable::Server => tables.server.is_some(),
            ScopeTable::ServerHistory => tables.history.is_some(),
        })
    }

    fn create(&self, conn: &mut MemoryConnection, table: ScopeTable) -> StoreResult<()> {
        let tables = conn.state_mut().scope_tables_mut(self.scope_info);
        match table {
            ScopeTable::Client => {
                tables.client.get_or_insert_with(BTreeMap::new);
            }
            ScopeTable::Server => {
                tables.server.get_or_insert_with(BTreeMap::new);
            }
            ScopeTable::ServerHistory => {
                tables.history.get_or_insert_with(BTreeMap::new);
            }
        }
        Ok(())
    }

    fn drop_table(&self, conn: &mut MemoryConnection, table: ScopeTable) -> StoreResult<()> {
        let state = conn.state_mut();
        let Some(tables) = state.scopes.get_mut(self.scope_info) else {
            return Ok(());
        };
        match table {
            ScopeTable::Client => tables.client = None,
            ScopeTable::Server => tables.server = None,
            ScopeTable::ServerHistory => tables.history = None,
        }
        if tables.client.is_none() && tables.server.is_none() && tables.history.is_none() {
            state.scopes.remove(self.scope_info);
        }
        Ok(())
    }

    fn local_timestamp(&self, conn: &mut MemoryConnection) -> StoreResult<u64> {
        Ok(conn.state().timestamp)
    }

    fn load_client_scope(&self, conn: &mut MemoryConnection, name: &str) -> StoreResult<Option<ClientScope>> {
        Ok(self.clients(conn.state())?.get(name).cloned())
    }

    fn save_client_scope(&self, conn: &mut MemoryConnection, scope: &ClientScope) -> StoreResult<()> {
        let missing = self.missing(ScopeTable::Client);
        let clients = conn
            .state_mut()
            .scope_tables_mut(self.scope_info)
            .client
            .as_mut()
            .ok_or(missing)?;
        clients.insert(scope.name.clone(), scope.clone());
        Ok(())
    }

    fn list_client_scopes(&self, conn: &mut MemoryConnection) -> StoreResult<Vec<ClientScope>> {
        Ok(self.clients(conn.state())?.values().cloned().collect())
    }

    fn load_server_scope(&self, conn: &mut MemoryConnection, name: &str) -> StoreResult<Option<ServerScope>> {
        Ok(self.servers(conn.state())?.get(name).cloned())
    }

    fn save_server_scope(&self, conn: &mut MemoryConnection, scope: &ServerScope) -> StoreResult<()> {
        let missing = self.missing(ScopeTable::Server);
        let servers = conn
            .state_mut()
            .scope_tables_mut(self.scope_info)
            .server
            .as_mut()
            .ok_or(missing)?;
        servers.insert(scope.name.clone(), scope.clone());
        Ok(())
    }

    fn list_server_scopes(&self, conn: &mut MemoryConnection) -> StoreResult<Vec<ServerScope>> {
        Ok(self.servers(conn.state())?.values().cloned().collect())
    }

    fn load_history_scope(
        &self,
        conn: &mut MemoryConnection,
        id: Uuid,
    ) -> StoreResult<Option<ServerHistoryScope>> {
        Ok(self.histories(conn.state())?.get(&id.to_string()).cloned())
    }

    fn save_history_scope(&self, conn: &mut MemoryConnection, scope: &ServerHistoryScope) -> StoreResult<()> {
        let missing = self.missing(ScopeTable::ServerHistory);
        let histories = conn
            .state_mut()
            .scope_tables_mut(self.scope_info)
            .history
            .as_mut()
            .ok_or(missing)?;
        histories.insert(scope.id.to_string(), scope.clone());
        Ok(())
    }

    fn list_history_scopes(&self, conn: &mut MemoryConnection, name: &str) -> StoreResult<Vec<ServerHistoryScope>> {
        Ok(self
            .histories(conn.state())?
            .values()
            .filter(|h| h.name == name)
            .cloned()
            .collect())
    }
}
