//! Batch manifests.
//!
//! A batch is one change-transfer unit split into ordered part files. The
//! manifest ([`BatchInfo`]) is stored next to the parts as
//! [`SUMMARY_FILE_NAME`] and is only written once every part is sealed.

use crate::schema::SyncSchema;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// File name of the batch manifest.
pub const SUMMARY_FILE_NAME: &str = "summary.json";

/// Row count of one table inside a part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPartTableInfo {
    /// Table name.
    pub table_name: String,
    /// Number of rows for this table in the part.
    pub rows_count: u64,
}

/// One sealed part file of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPartInfo {
    /// File name, relative to the batch directory.
    pub file_name: String,
    /// Sequence index (monotonic inside a batch).
    pub index: u32,
    /// True for the final part of the batch.
    pub is_last_batch: bool,
    /// Tables stored in this part.
    pub tables: Vec<BatchPartTableInfo>,
    /// Total rows in this part.
    pub rows_count: u64,
}

impl BatchPartInfo {
    /// Returns true if the part holds rows for the given table.
    pub fn contains_table(&self, table: &str) -> bool {
        self.tables.iter().any(|t| t.table_name == table)
    }
}

/// Manifest of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchInfo {
    /// Directory holding the batch, relative to its root.
    pub directory_name: String,
    /// Root directory. Not persisted; set when the manifest is written or read.
    #[serde(skip)]
    pub directory_root: PathBuf,
    /// Schema of the tables in this batch.
    pub schema: SyncSchema,
    /// Sealed parts, ordered by index.
    pub parts: Vec<BatchPartInfo>,
    /// Total rows across all parts.
    pub rows_count: u64,
    /// Logical timestamp bounding the batch.
    pub timestamp: u64,
    /// Key of the serializer used for part files.
    pub serializer: String,
}

impl BatchInfo {
    /// Creates an empty manifest.
    pub fn new(
        directory_root: impl Into<PathBuf>,
        directory_name: impl Into<String>,
        schema: SyncSchema,
        serializer: impl Into<String>,
    ) -> Self {
        Self {
            directory_name: directory_name.into(),
            directory_root: directory_root.into(),
            schema,
            parts: Vec::new(),
            rows_count: 0,
            timestamp: 0,
            serializer: serializer.into(),
        }
    }

    /// Returns the full batch directory path.
    pub fn directory_path(&self) -> PathBuf {
        self.directory_root.join(&self.directory_name)
    }

    /// Returns the full path of a part file.
    pub fn part_path(&self, part: &BatchPartInfo) -> PathBuf {
        self.directory_path().join(&part.file_name)
    }

    /// Returns the manifest path.
    pub fn summary_path(&self) -> PathBuf {
        self.directory_path().join(SUMMARY_FILE_NAME)
    }

    /// Returns true if the batch has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows_count == 0
    }

    /// Returns the parts holding rows for a table, in index order.
    pub fn parts_for_table<'a>(&'a self, table: &'a str) -> impl Iterator<Item = &'a BatchPartInfo> + 'a {
        self.parts.iter().filter(move |p| p.contains_table(table))
    }

    /// Returns the per-table row totals across all parts, in schema order.
    pub fn table_rows(&self) -> Vec<BatchPartTableInfo> {
        let mut totals: Vec<BatchPartTableInfo> = Vec::new();
        for part in &self.parts {
            for table in &part.tables {
                match totals.iter_mut().find(|t| t.table_name == table.table_name) {
                    Some(total) => total.rows_count += table.rows_count,
                    None => totals.push(table.clone()),
                }
            }
        }
        totals
    }

    /// Orders parts by index, then marks the highest-index part as last.
    pub fn ensure_last_batch(&mut self) {
        self.parts.sort_by_key(|p| p.index);
        let count = self.parts.len();
        for (i, part) in self.parts.iter_mut().enumerate() {
            part.is_last_batch = i + 1 == count;
        }
    }

    /// Recomputes `rows_count` from the parts.
    pub fn recount(&mut self) {
        self.rows_count = self.parts.iter().map(|p| p.rows_count).sum();
    }

    /// Checks the manifest invariants: part sums match, exactly one last
    /// part which has the highest index, and no empty parts.
    pub fn is_consistent(&self) -> bool {
        let sum: u64 = self.parts.iter().map(|p| p.rows_count).sum();
        if sum != self.rows_count {
            return false;
        }
        if self.parts.iter().any(|p| p.rows_count == 0) {
            return false;
        }
        if self.parts.is_empty() {
            return true;
        }
        let last_count = self.parts.iter().filter(|p| p.is_last_batch).count();
        let max_index = self.parts.iter().map(|p| p.index).max();
        let last_index = self.parts.iter().find(|p| p.is_last_batch).map(|p| p.index);
        last_count == 1 && last_index == max_index
    }

    /// Returns the manifest path for a batch directory.
    pub fn summary_path_in(directory: &Path) -> PathBuf {
        directory.join(SUMMARY_FILE_NAME)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn part(index: u32, rows: u64, table: &str) -> BatchPartInfo {
        BatchPartInfo {
            file_name: format!("{index:04}_{table}.json"),
            index,
            is_last_batch: false,
            tables: vec![BatchPartTableInfo {
                table_name: table.into(),
                rows_count: rows,
            }],
            rows_count: rows,
        }
    }

    #[test]
    fn last_batch_is_highest_index() {
        let mut info = BatchInfo::new("/tmp", "b", SyncSchema::default(), "json");
        info.parts = vec![part(2, 5, "b"), part(0, 3, "a"), part(1, 1, "a")];
        info.recount();
        info.ensure_last_batch();

        assert_eq!(info.rows_count, 9);
        assert_eq!(info.parts[2].index, 2);
        assert!(info.parts[2].is_last_batch);
        assert!(info.is_consistent());
    }

    #[test]
    fn inconsistent_manifests() {
        let mut info = BatchInfo::new("/tmp", "b", SyncSchema::default(), "json");
        info.parts = vec![part(0, 3, "a"), part(1, 0, "a")];
        info.recount();
        info.ensure_last_batch();
        assert!(!info.is_consistent(), "empty part must be rejected");

        info.parts = vec![part(0, 3, "a")];
        info.recount();
        assert!(!info.is_consistent(), "missing last flag must be rejected");

        info.ensure_last_batch();
        info.rows_count = 4;
        assert!(!info.is_consistent(), "row sum mismatch must be rejected");
    }

    #[test]
    fn table_totals() {
        let mut info = BatchInfo::new("/tmp", "b", SyncSchema::default(), "json");
        info.parts = vec![part(0, 3, "a"), part(1, 2, "a"), part(2, 7, "b")];
        let totals = info.table_rows();
        assert_eq!(totals.len(), 2);
        assert_eq!(totals[0].rows_count, 5);
        assert_eq!(totals[1].rows_count, 7);
        assert_eq!(info.parts_for_table("a").count(), 2);
    }

    #[test]
    fn manifest_does_not_persist_root() {
        let info = BatchInfo::new("/var/batches", "abc", SyncSchema::default(), "json");
        let json = serde_json::to_string(&info).unwrap();
        let decoded: BatchInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.directory_root, PathBuf::new());
        assert_eq!(decoded.directory_name, "abc");
        assert_eq!(info.summary_path(), PathBuf::from("/var/batches/abc/summary.json"));
    }
}
