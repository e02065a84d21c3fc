//! Cleanup command implementation.

use super::{database_options, open_database};
use rowsync_engine::{DatabaseMetadatasCleaned, LocalOrchestrator, RemoteOrchestrator};
use std::path::Path;

/// Runs the cleanup command.
///
/// On a server the floor is the oldest timestamp any client has received;
/// on a client it is the client's last sync.
pub fn run(path: &Path, scope: &str, server: bool) -> Result<(), Box<dyn std::error::Error>> {
    let db = open_database(path)?;
    let options = database_options(path);

    let cleaned = if server {
        RemoteOrchestrator::new(db, options)?.delete_metadata(scope, None)?
    } else {
        let local = LocalOrchestrator::new(db, options, scope);
        let client_scope = local.ensure_scope(None)?;
        local.delete_metadata(&client_scope, None)?
    };

    print_result(&cleaned);
    Ok(())
}

fn print_result(cleaned: &DatabaseMetadatasCleaned) {
    println!("✓ Tombstones purged: {}", cleaned.rows_cleaned());
    println!("  Floor: {}", cleaned.timestamp);
    for table in &cleaned.tables {
        println!(
            "  {} ({}): {}",
            table.table_name, table.tracking_table_name, table.rows_cleaned
        );
    }
}
