//! Rows and per-table change sets.

use crate::value::SyncValue;
use serde::{Deserialize, Serialize};

/// State of a changed row.
///
/// Inserts and updates are not distinguished downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RowState {
    /// Row was inserted or updated.
    Upsert,
    /// Row was deleted (tombstone).
    Deleted,
}

/// A changed row.
///
/// `values` are ordered by the owning table's column order. A deleted row
/// only carries its primary-key values; every other slot is `Null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRow {
    /// Row state.
    #[serde(rename = "s")]
    pub state: RowState,
    /// Column values.
    #[serde(rename = "v")]
    pub values: Vec<SyncValue>,
}

impl SyncRow {
    /// Creates an upsert row.
    pub fn upsert(values: Vec<SyncValue>) -> Self {
        Self {
            state: RowState::Upsert,
            values,
        }
    }

    /// Creates a deleted row.
    pub fn deleted(values: Vec<SyncValue>) -> Self {
        Self {
            state: RowState::Deleted,
            values,
        }
    }

    /// Returns true if this row is a tombstone.
    pub fn is_deleted(&self) -> bool {
        self.state == RowState::Deleted
    }

    /// Returns the value at the given column index.
    pub fn get(&self, index: usize) -> Option<&SyncValue> {
        self.values.get(index)
    }
}

/// Changed rows for a single table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableChanges {
    /// Table name.
    #[serde(rename = "n")]
    pub table_name: String,
    /// Column names, in value order.
    #[serde(rename = "c")]
    pub columns: Vec<String>,
    /// Rows.
    #[serde(rename = "r")]
    pub rows: Vec<SyncRow>,
}

impl TableChanges {
    /// Creates an empty change set for a table.
    pub fn new(table_name: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            table_name: table_name.into(),
            columns,
            rows: Vec::new(),
        }
    }

    /// Returns the number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if there are no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// The document stored in one batch part file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BatchPartContent {
    /// Per-table changes contained in this part.
    #[serde(rename = "t")]
    pub tables: Vec<TableChanges>,
}

impl BatchPartContent {
    /// Creates a part holding a single table's changes.
    pub fn single(table: TableChanges) -> Self {
        Self {
            tables: vec![table],
        }
    }

    /// Returns the total number of rows across all tables.
    pub fn rows_count(&self) -> usize {
        self.tables.iter().map(TableChanges::len).sum()
    }

    /// Returns the changes for the given table.
    pub fn table(&self, name: &str) -> Option<&TableChanges> {
        self.tables.iter().find(|t| t.table_name == name)
    }
}
