//! Observational counters for selected and applied changes.

use crate::row::RowState;
use serde::{Deserialize, Serialize};

/// Changes selected for one table.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TableChangesSelected {
    /// Table name.
    pub table_name: String,
    /// Upserted rows selected.
    pub upserts: u64,
    /// Deleted rows selected.
    pub deletes: u64,
}

impl TableChangesSelected {
    /// Creates an empty counter for a table.
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            upserts: 0,
            deletes: 0,
        }
    }

    /// Counts one row of the given state.
    pub fn record(&mut self, state: RowState) {
        match state {
            RowState::Upsert => self.upserts += 1,
            RowState::Deleted => self.deletes += 1,
        }
    }

    /// Returns upserts plus deletes.
    pub fn total(&self) -> u64 {
        self.upserts + self.deletes
    }
}

/// Changes selected for a whole database.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DatabaseChangesSelected {
    /// Per-table counters. Tables with no changes are omitted.
    pub tables: Vec<TableChangesSelected>,
}

impl DatabaseChangesSelected {
    /// Adds a table counter, skipping empty ones.
    pub fn push(&mut self, table: TableChangesSelected) {
        if table.total() > 0 {
            self.tables.push(table);
        }
    }

    /// Returns the counter for a table.
    pub fn table(&self, name: &str) -> Option<&TableChangesSelected> {
        self.tables.iter().find(|t| t.table_name == name)
    }

    /// Total upserts.
    pub fn total_upserts(&self) -> u64 {
        self.tables.iter().map(|t| t.upserts).sum()
    }

    /// Total deletes.
    pub fn total_deletes(&self) -> u64 {
        self.tables.iter().map(|t| t.deletes).sum()
    }

    /// Total changes.
    pub fn total_changes(&self) -> u64 {
        self.total_upserts() + self.total_deletes()
    }
}

/// Changes applied for one table and one row state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableChangesApplied {
    /// Table name.
    pub table_name: String,
    /// Row state these counters refer to.
    pub state: RowState,
    /// Rows applied successfully.
    pub applied: u64,
    /// Conflicts resolved while applying.
    pub resolved_conflicts: u64,
    /// Rows that failed to apply.
    pub failed: u64,
}

impl TableChangesApplied {
    /// Creates an empty counter.
    pub fn new(table_name: impl Into<String>, state: RowState) -> Self {
        Self {
            table_name: table_name.into(),
            state,
            applied: 0,
            resolved_conflicts: 0,
            failed: 0,
        }
    }

    /// Returns true if nothing was counted.
    pub fn is_empty(&self) -> bool {
        self.applied == 0 && self.resolved_conflicts == 0 && self.failed == 0
    }
}

/// Changes applied to a whole database.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DatabaseChangesApplied {
    /// Per-table, per-state counters. Empty counters are omitted.
    pub tables: Vec<TableChangesApplied>,
}

impl DatabaseChangesApplied {
    /// Adds a counter, skipping empty ones.
    pub fn push(&mut self, table: TableChangesApplied) {
        if !table.is_empty() {
            self.tables.push(table);
        }
    }

    /// Returns the counter for a table and state.
    pub fn table(&self, name: &str, state: RowState) -> Option<&TableChangesApplied> {
        self.tables
            .iter()
            .find(|t| t.table_name == name && t.state == state)
    }

    /// Total rows applied.
    pub fn total_applied(&self) -> u64 {
        self.tables.iter().map(|t| t.applied).sum()
    }

    /// Total conflicts resolved.
    pub fn total_resolved_conflicts(&self) -> u64 {
        self.tables.iter().map(|t| t.resolved_conflicts).sum()
    }

    /// Total rows failed.
    pub fn total_failed(&self) -> u64 {
        self.tables.iter().map(|t| t.failed).sum()
    }

    /// Merges another set of counters into this one.
    pub fn merge(&mut self, other: DatabaseChangesApplied) {
        for table in other.tables {
            match self
                .tables
                .iter_mut()
                .find(|t| t.table_name == table.table_name && t.state == table.state)
            {
                Some(existing) => {
                    existing.applied += table.applied;
                    existing.resolved_conflicts += table.resolved_conflicts;
                    existing.failed += table.failed;
                }
                None => self.tables.push(table),
            }
        }
    }
}
