//! Snapshot command implementation.

use super::{database_options, open_database};
use rowsync_engine::RemoteOrchestrator;
use std::path::Path;

/// Runs the snapshot command.
pub fn run(path: &Path, scope: &str) -> Result<(), Box<dyn std::error::Error>> {
    let orchestrator = RemoteOrchestrator::new(open_database(path)?, database_options(path))?;
    let batch = orchestrator.create_snapshot(scope, None)?;

    println!("✓ Snapshot of '{}' written", scope);
    println!("  Path:      {:?}", batch.directory_path());
    println!("  Timestamp: {}", batch.timestamp);
    println!("  Parts:     {}", batch.parts.len());
    println!("  Rows:      {}", batch.rows_count);

    Ok(())
}
