//! Inspect command implementation.

use super::{database_options, open_database};
use rowsync_engine::{run_in_transaction, ScopeStore, SyncProvider};
use serde::Serialize;
use std::path::Path;

/// Database inspection result.
#[derive(Debug, Serialize)]
pub struct InspectResult {
    /// Database path.
    pub path: String,
    /// Logical timestamp.
    pub timestamp: u64,
    /// Base tables.
    pub tables: Vec<TableStats>,
    /// Tracking tables.
    pub tracking: Vec<TrackingStats>,
    /// Client scopes stored in this database.
    pub client_scopes: Vec<ScopeStats>,
    /// Server scopes stored in this database.
    pub server_scopes: Vec<ScopeStats>,
}

/// Statistics for a base table.
#[derive(Debug, Serialize)]
pub struct TableStats {
    /// Table name.
    pub name: String,
    /// Number of rows.
    pub rows: usize,
}

/// Statistics for a tracking table.
#[derive(Debug, Serialize)]
pub struct TrackingStats {
    /// Tracking table name.
    pub name: String,
    /// Number of tracking rows.
    pub rows: usize,
    /// Number of tombstones.
    pub tombstones: usize,
}

/// Summary of a scope record.
#[derive(Debug, Serialize)]
pub struct ScopeStats {
    /// Scope name.
    pub name: String,
    /// Scope id.
    pub id: String,
    /// Number of synced tables.
    pub tables: usize,
    /// Last sync timestamp.
    pub last_sync_timestamp: u64,
    /// Clients recorded in the history (server scopes only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub known_clients: Option<usize>,
}

/// Runs the inspect command.
pub fn run(path: &Path, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if !path.join("database.json").exists() {
        return Err(format!("No database found at {:?}", path).into());
    }

    let db = open_database(path)?;
    let summary = db.summary();
    let options = database_options(path);
    let store = ScopeStore::new(db.scope_store_builder(&options.scope_info_table_name));

    let (client_scopes, server_scopes) = run_in_transaction(&db, None, |c| {
        let clients = store
            .list_client_scopes(c)?
            .into_iter()
            .map(|s| ScopeStats {
                name: s.name,
                id: s.id.to_string(),
                tables: s.schema.map_or(0, |schema| schema.tables.len()),
                last_sync_timestamp: s.last_sync_timestamp,
                known_clients: None,
            })
            .collect::<Vec<_>>();

        let mut servers = Vec::new();
        for s in store.list_server_scopes(c)? {
            let known = store.list_history_scopes(c, &s.name)?.len();
            servers.push(ScopeStats {
                name: s.name,
                id: s.id.to_string(),
                tables: s.schema.map_or(0, |schema| schema.tables.len()),
                last_sync_timestamp: s.last_sync_timestamp,
                known_clients: Some(known),
            });
        }
        Ok((clients, servers))
    })?;

    let result = InspectResult {
        path: path.display().to_string(),
        timestamp: summary.timestamp,
        tables: summary
            .tables
            .into_iter()
            .map(|(name, rows)| TableStats { name, rows })
            .collect(),
        tracking: summary
            .tracking
            .into_iter()
            .map(|(name, rows, tombstones)| TrackingStats {
                name,
                rows,
                tombstones,
            })
            .collect(),
        client_scopes,
        server_scopes,
    };

    match format {
        "json" => {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        _ => {
            print_text_output(&result);
        }
    }

    Ok(())
}

fn print_text_output(result: &InspectResult) {
    println!("rowsync Database Inspection");
    println!("===========================");
    println!();
    println!("Path:      {}", result.path);
    println!("Timestamp: {}", result.timestamp);
    println!();
    println!("Tables:");
    for table in &result.tables {
        println!("  {:<24} {} rows", table.name, table.rows);
    }

    if !result.tracking.is_empty() {
        println!();
        println!("Tracking:");
        for tracking in &result.tracking {
            println!(
                "  {:<24} {} rows, {} tombstones",
                tracking.name, tracking.rows, tracking.tombstones
            );
        }
    }

    for (title, scopes) in [
        ("Client scopes", &result.client_scopes),
        ("Server scopes", &result.server_scopes),
    ] {
        if scopes.is_empty() {
            continue;
        }
        println!();
        println!("{title}:");
        for scope in scopes {
            print!(
                "  [{}] {} tables, last sync at {}",
                scope.name, scope.tables, scope.last_sync_timestamp
            );
            match scope.known_clients {
                Some(known) => println!(", {known} clients"),
                None => println!(),
            }
        }
    }
}
