//! Directory persistence for reference databases.
//!
//! A database directory holds:
//! - `LOCK`: held exclusively while a provider has the database open
//! - `database.json`: the last committed state
//!
//! Commits write `database.json.tmp`, sync it, then rename it over the
//! previous state.

use crate::error::{MemoryError, MemoryResult};
use crate::state::DatabaseState;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const STATE_FILE: &str = "database.json";
const STATE_TEMP: &str = "database.json.tmp";

/// An open database directory.
#[derive(Debug)]
pub struct DatabaseFile {
    path: PathBuf,
    _lock_file: File,
}

impl DatabaseFile {
    /// Opens or creates a database directory and locks it.
    ///
    /// # Errors
    ///
    /// Returns `Locked` if another provider holds the directory.
    pub fn open(path: &Path) -> MemoryResult<Self> {
        if !path.exists() {
            fs::create_dir_all(path)?;
        }
        if !path.is_dir() {
            return Err(MemoryError::Corrupted(format!(
                "not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(MemoryError::Locked(path.to_path_buf()));
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the database directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the last committed state. `None` for a new database.
    pub fn load(&self) -> MemoryResult<Option<DatabaseState>> {
        let state_path = self.path.join(STATE_FILE);
        if !state_path.exists() {
            return Ok(None);
        }

        let mut data = Vec::new();
        File::open(&state_path)?.read_to_end(&mut data)?;
        if data.is_empty() {
            return Ok(None);
        }

        let state = serde_json::from_slice(&data)
            .map_err(|e| MemoryError::Corrupted(format!("{}: {e}", state_path.display())))?;
        Ok(Some(state))
    }

    /// Saves a state atomically.
    pub fn save(&self, state: &DatabaseState) -> MemoryResult<()> {
        let temp_path = self.path.join(STATE_TEMP);
        let data = serde_json::to_vec_pretty(state)?;

        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, self.path.join(STATE_FILE))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn new_directory_has_no_state() {
        let dir = tempdir().unwrap();
        let file = DatabaseFile::open(&dir.path().join("db")).unwrap();
        assert!(file.load().unwrap().is_none());
        assert!(file.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn save_then_load() {
        let dir = tempdir().unwrap();
        let file = DatabaseFile::open(dir.path()).unwrap();

        let state = DatabaseState {
            version: 3,
            timestamp: 42,
            ..DatabaseState::default()
        };
        file.save(&state).unwrap();
        assert!(!dir.path().join(STATE_TEMP).exists());

        assert_eq!(file.load().unwrap(), Some(state));
    }

    #[test]
    fn second_open_is_locked() {
        let dir = tempdir().unwrap();
        let _first = DatabaseFile::open(dir.path()).unwrap();
        let second = DatabaseFile::open(dir.path());
        assert!(matches!(second, Err(MemoryError::Locked(_))));
    }

    #[test]
    fn lock_released_on_drop() {
        let dir = tempdir().unwrap();
        drop(DatabaseFile::open(dir.path()).unwrap());
        assert!(DatabaseFile::open(dir.path()).is_ok());
    }

    #[test]
    fn garbage_state_is_corrupted() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(STATE_FILE), b"{ not json").unwrap();
        let file = DatabaseFile::open(dir.path()).unwrap();
        assert!(matches!(file.load(), Err(MemoryError::Corrupted(_))));
    }
}
