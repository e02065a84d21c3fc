//! Provision command implementation.
//!
//! Reads a JSON file such as:
//!
//! ```json
//! {
//!   "tables": [{ "name": "customer", "columns": [...], "primary_keys": ["id"] }],
//!   "relations": [],
//!   "rows": { "customer": [[1, "Ann"]] },
//!   "setup": { "tables": [{ "name": "customer" }] }
//! }
//! ```
//!
//! Missing tables are created, rows are upserted, then the scope is loaded
//! or created with the setup and the server tracking objects provisioned.

use super::{database_options, open_database};
use rowsync_engine::RemoteOrchestrator;
use rowsync_protocol::{SessionContext, SyncRelation, SyncSetup, SyncTable, SyncType, SyncValue};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use tracing::info;
use uuid::Uuid;

/// Contents of a provision file.
#[derive(Debug, Deserialize)]
pub struct ProvisionFile {
    /// Tables to create when missing.
    #[serde(default)]
    pub tables: Vec<SyncTable>,
    /// Relations declared on newly created tables.
    #[serde(default)]
    pub relations: Vec<SyncRelation>,
    /// Rows to upsert, per table, values in declaration order.
    #[serde(default)]
    pub rows: BTreeMap<String, Vec<Vec<SyncValue>>>,
    /// Setup of the scope.
    pub setup: SyncSetup,
}

/// Runs the provision command.
pub fn run(path: &Path, scope: &str, file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let spec: ProvisionFile = serde_json::from_slice(&fs::read(file)?)?;
    let db = open_database(path)?;

    let existing: HashSet<String> = db.summary().tables.into_iter().map(|(t, _)| t).collect();
    let mut created = HashSet::new();
    for table in &spec.tables {
        if !existing.contains(&table.name) {
            db.create_table(table)?;
            created.insert(table.name.clone());
        }
    }
    for relation in spec.relations {
        if created.contains(&relation.child_table) {
            db.add_relation(relation)?;
        }
    }

    let mut upserted = 0;
    for (table, rows) in spec.rows {
        for values in rows {
            db.upsert(&table, values)?;
            upserted += 1;
        }
    }

    let orchestrator = RemoteOrchestrator::new(db, database_options(path))?;
    let ctx = SessionContext::new(scope, Uuid::new_v4(), SyncType::Normal);
    let server_scope = orchestrator.ensure_scope(&ctx, Some(&spec.setup), None)?;
    info!(scope, tables = created.len(), rows = upserted, "database provisioned");

    let synced = server_scope.schema.as_ref().map_or(0, |s| s.tables.len());
    println!("✓ Scope '{}' provisioned", server_scope.name);
    println!("  Path: {:?}", path);
    println!("  Tables created: {}", created.len());
    println!("  Rows upserted:  {}", upserted);
    println!("  Synced tables:  {}", synced);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_file() {
        let spec: ProvisionFile = serde_json::from_str(
            r#"{ "setup": { "tables": [{ "name": "customer" }] } }"#,
        )
        .unwrap();
        assert!(spec.tables.is_empty());
        assert!(spec.rows.is_empty());
        assert!(spec.setup.table("customer").is_some());
    }
}
