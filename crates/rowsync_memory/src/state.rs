//! Database contents and write rules.
//!
//! Every write goes through [`DatabaseState::write_row`] or
//! [`DatabaseState::remove_row`], which enforce constraints and fire the
//! change-capture triggers registered on the table.

use crate::error::{MemoryError, MemoryResult};
use rowsync_engine::TrackingRow;
use rowsync_protocol::{
    ClientScope, ServerHistoryScope, ServerScope, SyncColumn, SyncRelation, SyncValue,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A base table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TableData {
    /// Columns in declaration order.
    pub columns: Vec<SyncColumn>,
    /// Primary key column names.
    pub primary_keys: Vec<String>,
    /// Foreign keys declared on this table.
    pub relations: Vec<SyncRelation>,
    /// Rows keyed by encoded primary key, values in column order.
    pub rows: BTreeMap<String, Vec<SyncValue>>,
    /// Foreign key checks are skipped while set.
    #[serde(default)]
    pub constraints_disabled: bool,
}

impl TableData {
    /// Creates an empty table.
    pub fn new(columns: Vec<SyncColumn>, primary_keys: Vec<String>) -> Self {
        Self {
            columns,
            primary_keys,
            ..Self::default()
        }
    }

    /// Returns the index of a column.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    fn indexes(&self, table: &str, names: &[String]) -> MemoryResult<Vec<usize>> {
        names
            .iter()
            .map(|name| {
                self.column_index(name).ok_or_else(|| MemoryError::NoSuchColumn {
                    table: table.to_string(),
                    column: name.clone(),
                })
            })
            .collect()
    }

    /// Extracts the primary key of a full row.
    pub fn primary_key_of(&self, table: &str, row: &[SyncValue]) -> MemoryResult<Vec<SyncValue>> {
        Ok(self
            .indexes(table, &self.primary_keys)?
            .into_iter()
            .map(|i| row[i].clone())
            .collect())
    }

    fn has_row_matching(&self, indexes: &[usize], values: &[SyncValue]) -> bool {
        self.rows
            .values()
            .any(|row| indexes.iter().zip(values).all(|(i, v)| &row[*i] == v))
    }
}

/// A tracking table.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrackingData {
    /// Base table the rows shadow.
    pub table_name: String,
    /// Tracking rows keyed by encoded primary key.
    pub rows: BTreeMap<String, TrackingRow>,
}

/// A change-capture trigger set on one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerData {
    /// Base table.
    pub table_name: String,
    /// Tracking table written by the trigger.
    pub tracking_table: String,
}

/// The three scope tables of one scope info table name.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScopeTables {
    /// Client scopes by name.
    pub client: Option<BTreeMap<String, ClientScope>>,
    /// Server scopes by name.
    pub server: Option<BTreeMap<String, ServerScope>>,
    /// History entries by client scope id.
    pub history: Option<BTreeMap<String, ServerHistoryScope>>,
}

/// Everything a reference database holds.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DatabaseState {
    /// Bumped by every committed write transaction.
    pub version: u64,
    /// Logical timestamp, bumped by every row write.
    pub timestamp: u64,
    /// Base tables by name.
    pub tables: BTreeMap<String, TableData>,
    /// Tracking tables by name.
    pub tracking: BTreeMap<String, TrackingData>,
    /// Triggers by name.
    pub triggers: BTreeMap<String, TriggerData>,
    /// Scope tables by scope info table name.
    pub scopes: BTreeMap<String, ScopeTables>,
}

/// Encodes primary key values as a map key.
pub fn row_key(primary_key: &[SyncValue]) -> MemoryResult<String> {
    Ok(serde_json::to_string(primary_key)?)
}

impl DatabaseState {
    /// Returns a table.
    pub fn table(&self, name: &str) -> MemoryResult<&TableData> {
        self.tables
            .get(name)
            .ok_or_else(|| MemoryError::NoSuchTable(name.to_string()))
    }

    /// Returns a table for update.
    pub fn table_mut(&mut self, name: &str) -> MemoryResult<&mut TableData> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| MemoryError::NoSuchTable(name.to_string()))
    }

    /// Returns a tracking table.
    pub fn tracking(&self, name: &str) -> MemoryResult<&TrackingData> {
        self.tracking
            .get(name)
            .ok_or_else(|| MemoryError::NoSuchTable(name.to_string()))
    }

    /// Returns a tracking table for update.
    pub fn tracking_mut(&mut self, name: &str) -> MemoryResult<&mut TrackingData> {
        self.tracking
            .get_mut(name)
            .ok_or_else(|| MemoryError::NoSuchTable(name.to_string()))
    }

    /// Advances the logical timestamp and returns the new value.
    pub fn tick(&mut self) -> u64 {
        self.timestamp += 1;
        self.timestamp
    }

    /// Inserts or replaces a full row, values in declaration order.
    pub fn write_row(&mut self, table_name: &str, row: Vec<SyncValue>) -> MemoryResult<()> {
        let table = self.table(table_name)?;
        if row.len() != table.columns.len() {
            return Err(MemoryError::Schema(format!(
                "{table_name} has {} columns, got {} values",
                table.columns.len(),
                row.len()
            )));
        }
        if let Some(column) = table
            .columns
            .iter()
            .zip(&row)
            .find(|(c, v)| !c.nullable && v.is_null())
            .map(|(c, _)| c)
        {
            return Err(MemoryError::not_null(format!(
                "{table_name}.{}",
                column.name
            )));
        }
        if !table.constraints_disabled {
            self.check_parents(table_name, table, &row)?;
        }

        let primary_key = table.primary_key_of(table_name, &row)?;
        if primary_key.iter().any(SyncValue::is_null) {
            return Err(MemoryError::not_null(format!("{table_name} primary key")));
        }
        let key = row_key(&primary_key)?;

        self.table_mut(table_name)?.rows.insert(key.clone(), row);
        self.fire_triggers(table_name, &key, &primary_key, false);
        Ok(())
    }

    /// Deletes a row by primary key. Returns false if it did not exist.
    pub fn remove_row(&mut self, table_name: &str, primary_key: &[SyncValue]) -> MemoryResult<bool> {
        let key = row_key(primary_key)?;
        let table = self.table(table_name)?;
        let Some(row) = table.rows.get(&key) else {
            return Ok(false);
        };
        self.check_children(table_name, table, row)?;

        self.table_mut(table_name)?.rows.remove(&key);
        self.fire_triggers(table_name, &key, primary_key, true);
        Ok(true)
    }

    fn check_parents(&self, table_name: &str, table: &TableData, row: &[SyncValue]) -> MemoryResult<()> {
        for relation in &table.relations {
            let values: Vec<SyncValue> = table
                .indexes(table_name, &relation.child_columns)?
                .into_iter()
                .map(|i| row[i].clone())
                .collect();
            if values.iter().any(SyncValue::is_null) {
                continue;
            }

            let parent = self.table(&relation.parent_table)?;
            let parent_indexes = parent.indexes(&relation.parent_table, &relation.parent_columns)?;
            if !parent.has_row_matching(&parent_indexes, &values) {
                return Err(MemoryError::foreign_key(format!(
                    "{} references a missing {} row",
                    relation.name, relation.parent_table
                )));
            }
        }
        Ok(())
    }

    fn check_children(&self, table_name: &str, table: &TableData, row: &[SyncValue]) -> MemoryResult<()> {
        for (child_name, child) in &self.tables {
            if child.constraints_disabled {
                continue;
            }
            for relation in child.relations.iter().filter(|r| r.parent_table == table_name) {
                let values: Vec<SyncValue> = table
                    .indexes(table_name, &relation.parent_columns)?
                    .into_iter()
                    .map(|i| row[i].clone())
                    .collect();
                let child_indexes = child.indexes(child_name, &relation.child_columns)?;
                if child.has_row_matching(&child_indexes, &values) {
                    return Err(MemoryError::foreign_key(format!(
                        "{} rows still reference this {table_name} row",
                        relation.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Records a write in every tracking table with a trigger on the table.
    fn fire_triggers(&mut self, table_name: &str, key: &str, primary_key: &[SyncValue], tombstone: bool) {
        let timestamp = self.tick();
        let targets: Vec<String> = self
            .triggers
            .values()
            .filter(|t| t.table_name == table_name)
            .map(|t| t.tracking_table.clone())
            .collect();

        for name in targets {
            let Some(tracking) = self.tracking.get_mut(&name) else {
                continue;
            };
            tracking
                .rows
                .entry(key.to_string())
                .and_modify(|row| {
                    row.update_timestamp = timestamp;
                    row.update_scope_id = None;
                    row.is_tombstone = tombstone;
                })
                .or_insert_with(|| TrackingRow {
                    primary_key: primary_key.to_vec(),
                    update_timestamp: timestamp,
                    create_timestamp: timestamp,
                    update_scope_id: None,
                    is_tombstone: tombstone,
                });
        }
    }

    /// Deletes every row of a table and the tracking rows shadowing it.
    /// No trigger fires.
    pub fn reset_table(&mut self, table_name: &str) -> MemoryResult<()> {
        self.table_mut(table_name)?.rows.clear();
        for tracking in self.tracking.values_mut() {
            if tracking.table_name == table_name {
                tracking.rows.clear();
            }
        }
        Ok(())
    }

    /// Returns the scope tables of a scope info table name, creating the
    /// entry if needed.
    pub fn scope_tables_mut(&mut self, scope_info: &str) -> &mut ScopeTables {
        self.scopes.entry(scope_info.to_string()).or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CODE_FOREIGN_KEY, CODE_NOT_NULL};
    use rowsync_protocol::ColumnType;

    fn state() -> DatabaseState {
        let mut state = DatabaseState::default();
        state.tables.insert(
            "category".into(),
            TableData::new(
                vec![
                    SyncColumn::new("id", ColumnType::Integer),
                    SyncColumn::nullable("name", ColumnType::Text),
                ],
                vec!["id".into()],
            ),
        );
        let mut product = TableData::new(
            vec![
                SyncColumn::new("id", ColumnType::Integer),
                SyncColumn::nullable("category_id", ColumnType::Integer),
            ],
            vec!["id".into()],
        );
        product.relations.push(SyncRelation::new(
            "fk_product_category",
            "product",
            "category_id",
            "category",
            "id",
        ));
        state.tables.insert("product".into(), product);
        state
    }

    fn track(state: &mut DatabaseState, table: &str) {
        let tracking = format!("{table}_tracking");
        state.tracking.insert(
            tracking.clone(),
            TrackingData {
                table_name: table.into(),
                rows: BTreeMap::new(),
            },
        );
        state.triggers.insert(
            table.into(),
            TriggerData {
                table_name: table.into(),
                tracking_table: tracking,
            },
        );
    }

    fn code(err: MemoryError) -> i32 {
        err.code()
    }

    #[test]
    fn foreign_keys_enforced() {
        let mut state = state();
        let err = state
            .write_row("product", vec![1.into(), 7.into()])
            .unwrap_err();
        assert_eq!(code(err), CODE_FOREIGN_KEY);

        state.write_row("category", vec![7.into(), "tools".into()]).unwrap();
        state.write_row("product", vec![1.into(), 7.into()]).unwrap();

        let err = state.remove_row("category", &[7.into()]).unwrap_err();
        assert_eq!(code(err), CODE_FOREIGN_KEY);

        assert!(state.remove_row("product", &[1.into()]).unwrap());
        assert!(state.remove_row("category", &[7.into()]).unwrap());
    }

    #[test]
    fn disabled_constraints_skip_checks() {
        let mut state = state();
        state.table_mut("product").unwrap().constraints_disabled = true;
        state.write_row("product", vec![1.into(), 7.into()]).unwrap();
    }

    #[test]
    fn null_primary_key_rejected() {
        let mut state = state();
        let err = state
            .write_row("category", vec![SyncValue::Null, "x".into()])
            .unwrap_err();
        assert_eq!(code(err), CODE_NOT_NULL);
    }

    #[test]
    fn triggers_track_writes() {
        let mut state = state();
        track(&mut state, "category");

        state.write_row("category", vec![1.into(), "a".into()]).unwrap();
        state.write_row("category", vec![1.into(), "b".into()]).unwrap();
        let key = row_key(&[1.into()]).unwrap();
        let row = state.tracking["category_tracking"].rows[&key].clone();
        assert_eq!(row.create_timestamp, 1);
        assert_eq!(row.update_timestamp, 2);
        assert!(!row.is_tombstone);

        state.remove_row("category", &[1.into()]).unwrap();
        let row = state.tracking["category_tracking"].rows[&key].clone();
        assert_eq!(row.update_timestamp, 3);
        assert!(row.is_tombstone);
        assert_eq!(state.timestamp, 3);
    }

    #[test]
    fn delete_missing_row_is_noop() {
        let mut state = state();
        track(&mut state, "category");
        assert!(!state.remove_row("category", &[9.into()]).unwrap());
        assert!(state.tracking["category_tracking"].rows.is_empty());
        assert_eq!(state.timestamp, 0);
    }

    #[test]
    fn reset_clears_rows_and_tracking() {
        let mut state = state();
        track(&mut state, "category");
        state.write_row("category", vec![1.into(), "a".into()]).unwrap();
        state.reset_table("category").unwrap();

        assert!(state.tables["category"].rows.is_empty());
        assert!(state.tracking["category_tracking"].rows.is_empty());
    }
}
