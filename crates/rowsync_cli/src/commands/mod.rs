//! CLI command implementations.

pub mod cleanup;
pub mod inspect;
pub mod inspect_batch;
pub mod provision;
pub mod snapshot;
pub mod sync;

use rowsync_engine::SyncOptions;
use rowsync_memory::MemoryProvider;
use std::path::Path;

/// Opens (or creates) a reference database directory, named after it.
pub fn open_database(path: &Path) -> Result<MemoryProvider, Box<dyn std::error::Error>> {
    let name = path
        .file_name()
        .map_or_else(|| "database".to_string(), |n| n.to_string_lossy().into_owned());
    Ok(MemoryProvider::open(name, path)?)
}

/// Options keeping batches and snapshots next to the database.
pub fn database_options(path: &Path) -> SyncOptions {
    SyncOptions::new(path.join("batches")).with_snapshots_directory(path.join("snapshots"))
}
