//! Sync setup (what the user asks to sync) and resolved schema.

use crate::row::SyncRow;
use crate::value::SyncValue;
use serde::{Deserialize, Serialize};

/// Direction in which a table's changes flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SyncDirection {
    /// Changes flow both ways.
    #[default]
    Bidirectional,
    /// Server changes flow to clients; client changes are never uploaded.
    DownloadOnly,
    /// Client changes flow to the server; server changes are never downloaded.
    UploadOnly,
}

impl SyncDirection {
    /// Returns true if clients upload changes for this table.
    pub fn allows_upload(&self) -> bool {
        !matches!(self, SyncDirection::DownloadOnly)
    }

    /// Returns true if clients download changes for this table.
    pub fn allows_download(&self) -> bool {
        !matches!(self, SyncDirection::UploadOnly)
    }
}

/// A table requested for synchronization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupTable {
    /// Table name.
    pub name: String,
    /// Columns to sync. Empty means every column.
    #[serde(default)]
    pub columns: Vec<String>,
    /// Sync direction.
    #[serde(default)]
    pub direction: SyncDirection,
}

impl SetupTable {
    /// Creates a setup entry syncing every column in both directions.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            direction: SyncDirection::Bidirectional,
        }
    }

    /// Restricts the synced columns.
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the sync direction.
    pub fn with_direction(mut self, direction: SyncDirection) -> Self {
        self.direction = direction;
        self
    }
}

/// The user-facing description of a scope: which tables and columns to sync,
/// and how tracking objects are named.
///
/// Equality is structural; two setups that differ in any field are a
/// conflicting setup for the same scope name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSetup {
    /// Tables to sync.
    pub tables: Vec<SetupTable>,
    /// Tracking table name prefix.
    #[serde(default)]
    pub tracking_tables_prefix: String,
    /// Tracking table name suffix.
    #[serde(default = "default_tracking_suffix")]
    pub tracking_tables_suffix: String,
    /// Trigger name prefix.
    #[serde(default)]
    pub triggers_prefix: String,
    /// Trigger name suffix.
    #[serde(default)]
    pub triggers_suffix: String,
    /// Stored procedure name prefix.
    #[serde(default)]
    pub stored_procedures_prefix: String,
    /// Stored procedure name suffix.
    #[serde(default)]
    pub stored_procedures_suffix: String,
}

fn default_tracking_suffix() -> String {
    "_tracking".to_string()
}

impl SyncSetup {
    /// Creates a setup syncing the given tables with default naming.
    pub fn new<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tables: tables.into_iter().map(|t| SetupTable::new(t)).collect(),
            ..Self::default()
        }
    }

    /// Replaces (or adds) a table entry.
    pub fn with_table(mut self, table: SetupTable) -> Self {
        match self.tables.iter_mut().find(|t| t.name == table.name) {
            Some(existing) => *existing = table,
            None => self.tables.push(table),
        }
        self
    }

    /// Sets the tracking table affixes.
    pub fn with_tracking_affixes(
        mut self,
        prefix: impl Into<String>,
        suffix: impl Into<String>,
    ) -> Self {
        self.tracking_tables_prefix = prefix.into();
        self.tracking_tables_suffix = suffix.into();
        self
    }

    /// Sets the trigger affixes.
    pub fn with_trigger_affixes(mut self, prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        self.triggers_prefix = prefix.into();
        self.triggers_suffix = suffix.into();
        self
    }

    /// Returns true if the setup names at least one table.
    pub fn has_tables(&self) -> bool {
        !self.tables.is_empty()
    }

    /// Returns the setup entry for a table.
    pub fn table(&self, name: &str) -> Option<&SetupTable> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Returns true if tracking table and trigger affixes match.
    pub fn same_affixes(&self, other: &SyncSetup) -> bool {
        self.tracking_tables_prefix == other.tracking_tables_prefix
            && self.tracking_tables_suffix == other.tracking_tables_suffix
            && self.triggers_prefix == other.triggers_prefix
            && self.triggers_suffix == other.triggers_suffix
    }

    /// Returns the tracking table name for a base table.
    pub fn tracking_table_name(&self, table: &str) -> String {
        format!(
            "{}{}{}",
            self.tracking_tables_prefix, table, self.tracking_tables_suffix
        )
    }

    /// Returns the trigger base name for a base table.
    pub fn trigger_name(&self, table: &str) -> String {
        format!("{}{}{}", self.triggers_prefix, table, self.triggers_suffix)
    }
}

impl Default for SyncSetup {
    fn default() -> Self {
        Self {
            tables: Vec::new(),
            tracking_tables_prefix: String::new(),
            tracking_tables_suffix: default_tracking_suffix(),
            triggers_prefix: String::new(),
            triggers_suffix: String::new(),
            stored_procedures_prefix: String::new(),
            stored_procedures_suffix: String::new(),
        }
    }
}

/// Column data type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    /// Integer.
    Integer,
    /// Float.
    Real,
    /// Text.
    Text,
    /// Raw bytes.
    Bytes,
    /// Boolean.
    Bool,
}

/// A resolved column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncColumn {
    /// Column name.
    pub name: String,
    /// Data type.
    pub data_type: ColumnType,
    /// Whether the column accepts nulls.
    pub nullable: bool,
}

impl SyncColumn {
    /// Creates a non-nullable column.
    pub fn new(name: impl Into<String>, data_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: false,
        }
    }

    /// Creates a nullable column.
    pub fn nullable(name: impl Into<String>, data_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
        }
    }
}

/// A foreign key from a child table to a parent table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRelation {
    /// Constraint name.
    pub name: String,
    /// Referencing table.
    pub child_table: String,
    /// Referencing columns.
    pub child_columns: Vec<String>,
    /// Referenced table.
    pub parent_table: String,
    /// Referenced columns.
    pub parent_columns: Vec<String>,
}

impl SyncRelation {
    /// Creates a single-column relation.
    pub fn new(
        name: impl Into<String>,
        child_table: impl Into<String>,
        child_column: impl Into<String>,
        parent_table: impl Into<String>,
        parent_column: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            child_table: child_table.into(),
            child_columns: vec![child_column.into()],
            parent_table: parent_table.into(),
            parent_columns: vec![parent_column.into()],
        }
    }
}

/// A resolved table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTable {
    /// Table name.
    pub name: String,
    /// Synced columns, in value order.
    pub columns: Vec<SyncColumn>,
    /// Primary key column names, in key order.
    pub primary_keys: Vec<String>,
    /// Sync direction.
    #[serde(default)]
    pub direction: SyncDirection,
}

impl SyncTable {
    /// Creates a table definition.
    pub fn new(name: impl Into<String>, columns: Vec<SyncColumn>, primary_keys: Vec<String>) -> Self {
        Self {
            name: name.into(),
            columns,
            primary_keys,
            direction: SyncDirection::Bidirectional,
        }
    }

    /// Creates a table stub carrying only a name, used for schema discovery.
    pub fn named(name: impl Into<String>) -> Self {
        Self::new(name, Vec::new(), Vec::new())
    }

    /// Returns the column names in value order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Returns the index of a column.
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Returns the value indexes of the primary key columns.
    pub fn primary_key_indexes(&self) -> Vec<usize> {
        self.primary_keys
            .iter()
            .filter_map(|pk| self.column_index(pk))
            .collect()
    }

    /// Extracts the primary key values from a row.
    pub fn primary_key_values(&self, row: &SyncRow) -> Vec<SyncValue> {
        self.primary_key_indexes()
            .into_iter()
            .map(|i| row.values.get(i).cloned().unwrap_or_default())
            .collect()
    }

    /// Builds a tombstone row from primary key values.
    pub fn tombstone_row(&self, primary_key: &[SyncValue]) -> SyncRow {
        let mut values = vec![SyncValue::Null; self.columns.len()];
        for (slot, value) in self.primary_key_indexes().into_iter().zip(primary_key) {
            values[slot] = value.clone();
        }
        SyncRow::deleted(values)
    }
}

/// The resolved schema of a scope.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SyncSchema {
    /// Tables, ordered parent-first.
    pub tables: Vec<SyncTable>,
    /// Relations between the tables.
    pub relations: Vec<SyncRelation>,
}

impl SyncSchema {
    /// Creates a schema.
    pub fn new(tables: Vec<SyncTable>, relations: Vec<SyncRelation>) -> Self {
        Self { tables, relations }
    }

    /// Returns true if the schema has no tables.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Returns a table by name.
    pub fn table(&self, name: &str) -> Option<&SyncTable> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Returns the relations whose child is the given table.
    pub fn relations_from<'a>(&'a self, child: &'a str) -> impl Iterator<Item = &'a SyncRelation> + 'a {
        self.relations.iter().filter(move |r| r.child_table == child)
    }
}
