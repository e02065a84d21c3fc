//! Batch files on disk.
//!
//! A batch directory holds ordered part files plus a `summary.json`
//! manifest. The manifest is written last, so a directory without one is an
//! incomplete batch.
//!
//! ```text
//! <root>/<directory_name>/
//! ├── 0000_customer_1a2b3c4d.json
//! ├── 0001_product_5e6f7a8b.json
//! └── summary.json
//! ```

use crate::error::{SyncError, SyncResult};
use rowsync_protocol::{
    serializer_for, BatchInfo, BatchPartContent, BatchPartInfo, BatchPartTableInfo,
    BatchSerializer, ProtocolError, SyncRow, SyncSchema, TableChanges,
};
use std::fs;
use std::path::Path;
use uuid::Uuid;

struct OpenPart {
    file_name: String,
    index: u32,
    changes: TableChanges,
    size: usize,
}

/// Writes a batch part by part.
///
/// Parts are sized by the serialized size of their rows: a row that would
/// push the current part past the threshold seals it first.
pub struct BatchWriter {
    info: BatchInfo,
    serializer: Box<dyn BatchSerializer>,
    threshold: usize,
    next_index: u32,
    current: Option<OpenPart>,
}

impl BatchWriter {
    /// Prepares a batch under `root/directory_name`, replacing any existing
    /// directory of that name.
    pub fn create(
        root: &Path,
        directory_name: &str,
        schema: SyncSchema,
        batch_size_kb: u64,
        serializer: &str,
    ) -> SyncResult<Self> {
        let serializer = serializer_for(serializer)?;
        let info = BatchInfo::new(root, directory_name, schema, serializer.key());

        let dir = info.directory_path();
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;

        Ok(Self {
            info,
            serializer,
            threshold: usize::try_from(batch_size_kb.saturating_mul(1024)).unwrap_or(usize::MAX),
            next_index: 0,
            current: None,
        })
    }

    /// Returns the manifest built so far.
    pub fn info(&self) -> &BatchInfo {
        &self.info
    }

    /// Starts the rows of a table. Seals the previous table's part.
    pub fn begin_table(&mut self, table_name: &str, columns: Vec<String>) -> SyncResult<()> {
        self.end_table()?;
        self.open_part(TableChanges::new(table_name, columns))
    }

    fn open_part(&mut self, changes: TableChanges) -> SyncResult<()> {
        let index = self.next_index;
        self.next_index += 1;

        let file_name = part_file_name(index, &changes.table_name, self.serializer.extension());
        fs::File::create(self.info.directory_path().join(&file_name))?;

        let size = self
            .serializer
            .serialize_part(&BatchPartContent::single(changes.clone()))?
            .len();
        self.current = Some(OpenPart {
            file_name,
            index,
            changes,
            size,
        });
        Ok(())
    }

    /// Adds a row to the current table.
    pub fn write_row(&mut self, row: SyncRow) -> SyncResult<()> {
        let row_size = self.serializer.row_size(&row)? + 1;

        let overflow = match &self.current {
            Some(part) => {
                self.threshold > 0
                    && !part.changes.rows.is_empty()
                    && part.size + row_size > self.threshold
            }
            None => {
                return Err(ProtocolError::invalid_structure("row written outside of a table").into())
            }
        };

        if overflow {
            if let Some(part) = self.current.take() {
                let next = TableChanges::new(&part.changes.table_name, part.changes.columns.clone());
                self.seal(part)?;
                self.open_part(next)?;
            }
        }

        if let Some(part) = self.current.as_mut() {
            part.size += row_size;
            part.changes.rows.push(row);
        }
        Ok(())
    }

    /// Seals the current table's part.
    pub fn end_table(&mut self) -> SyncResult<()> {
        match self.current.take() {
            Some(part) => self.seal(part),
            None => Ok(()),
        }
    }

    fn seal(&mut self, part: OpenPart) -> SyncResult<()> {
        let rows_count = part.changes.rows.len() as u64;
        let table_name = part.changes.table_name.clone();
        let bytes = self
            .serializer
            .serialize_part(&BatchPartContent::single(part.changes))?;
        fs::write(self.info.directory_path().join(&part.file_name), bytes)?;

        self.info.parts.push(BatchPartInfo {
            file_name: part.file_name,
            index: part.index,
            is_last_batch: false,
            tables: vec![BatchPartTableInfo {
                table_name,
                rows_count,
            }],
            rows_count,
        });
        Ok(())
    }

    /// Stores an already-serialized part, as received from a peer.
    pub fn write_raw_part(&mut self, bytes: &[u8]) -> SyncResult<()> {
        self.end_table()?;

        let content = self.serializer.deserialize_part(bytes)?;
        let index = self.next_index;
        self.next_index += 1;

        let label = content
            .tables
            .first()
            .map_or("empty", |t| t.table_name.as_str());
        let file_name = part_file_name(index, label, self.serializer.extension());
        fs::write(self.info.directory_path().join(&file_name), bytes)?;

        let tables: Vec<BatchPartTableInfo> = content
            .tables
            .iter()
            .map(|t| BatchPartTableInfo {
                table_name: t.table_name.clone(),
                rows_count: t.rows.len() as u64,
            })
            .collect();
        self.info.parts.push(BatchPartInfo {
            file_name,
            index,
            is_last_batch: false,
            tables,
            rows_count: content.rows_count() as u64,
        });
        Ok(())
    }

    /// Seals the batch and writes its manifest.
    pub fn finish(mut self, timestamp: u64) -> SyncResult<BatchInfo> {
        self.end_table()?;

        let dir = self.info.directory_path();
        let (kept, empty): (Vec<_>, Vec<_>) =
            self.info.parts.drain(..).partition(|p| p.rows_count > 0);
        for part in &empty {
            let path = dir.join(&part.file_name);
            if path.exists() {
                fs::remove_file(path)?;
            }
        }
        self.info.parts = kept;

        self.info.ensure_last_batch();
        self.info.recount();
        self.info.timestamp = timestamp;

        write_summary(&self.info)?;
        tracing::debug!(
            batch = %self.info.directory_name,
            parts = self.info.parts.len(),
            rows = self.info.rows_count,
            "batch written"
        );
        Ok(self.info)
    }
}

fn part_file_name(index: u32, table: &str, extension: &str) -> String {
    let simple = Uuid::new_v4().simple().to_string();
    format!("{index:04}_{table}_{}.{extension}", &simple[..8])
}

fn write_summary(info: &BatchInfo) -> SyncResult<()> {
    let path = info.summary_path();
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_vec_pretty(info).map_err(ProtocolError::from)?;
    fs::write(&tmp, json)?;
    fs::rename(&tmp, &path)?;
    Ok(())
}

/// Writes a whole table set as one batch.
pub fn write_batch(
    root: &Path,
    directory_name: &str,
    schema: SyncSchema,
    batch_size_kb: u64,
    serializer: &str,
    tables: Vec<TableChanges>,
    timestamp: u64,
) -> SyncResult<BatchInfo> {
    let mut writer = BatchWriter::create(root, directory_name, schema, batch_size_kb, serializer)?;
    for table in tables {
        writer.begin_table(&table.table_name, table.columns)?;
        for row in table.rows {
            writer.write_row(row)?;
        }
        writer.end_table()?;
    }
    writer.finish(timestamp)
}

/// Reads the manifest of a batch directory.
pub fn read_batch(directory: &Path) -> SyncResult<BatchInfo> {
    let bytes = fs::read(BatchInfo::summary_path_in(directory))?;
    let mut info: BatchInfo = serde_json::from_slice(&bytes).map_err(ProtocolError::from)?;
    info.directory_root = directory
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    Ok(info)
}

/// Returns the raw bytes of a part.
pub fn read_part_bytes(info: &BatchInfo, part: &BatchPartInfo) -> SyncResult<Vec<u8>> {
    Ok(fs::read(info.part_path(part))?)
}

/// Loads and deserializes a part.
pub fn load_part(info: &BatchInfo, part: &BatchPartInfo) -> SyncResult<BatchPartContent> {
    let serializer = serializer_for(&info.serializer)?;
    let bytes = read_part_bytes(info, part)?;
    Ok(serializer.deserialize_part(&bytes)?)
}

/// Deletes a batch directory. Missing directories are ignored.
pub fn remove_batch(directory: &Path) -> SyncResult<()> {
    match fs::remove_dir_all(directory) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SyncError::Io(e)),
    }
}

/// Iterates the rows of one table across every part that holds it, in part
/// order. Parts are loaded one at a time.
pub struct TableRows<'a> {
    info: &'a BatchInfo,
    serializer: Box<dyn BatchSerializer>,
    table_name: String,
    parts: std::vec::IntoIter<&'a BatchPartInfo>,
    current: std::vec::IntoIter<SyncRow>,
}

impl Iterator for TableRows<'_> {
    type Item = SyncResult<SyncRow>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(row) = self.current.next() {
                return Some(Ok(row));
            }

            let part = self.parts.next()?;
            let content = match read_part_bytes(self.info, part)
                .and_then(|bytes| Ok(self.serializer.deserialize_part(&bytes)?))
            {
                Ok(content) => content,
                Err(e) => return Some(Err(e)),
            };

            self.current = content
                .tables
                .into_iter()
                .filter(|t| t.table_name == self.table_name)
                .flat_map(|t| t.rows)
                .collect::<Vec<_>>()
                .into_iter();
        }
    }
}

/// Returns a lazy iterator over the rows of a table in a batch.
pub fn rows_for_table<'a>(info: &'a BatchInfo, table_name: &str) -> SyncResult<TableRows<'a>> {
    let mut parts: Vec<&'a BatchPartInfo> = info
        .parts
        .iter()
        .filter(|p| p.contains_table(table_name))
        .collect();
    parts.sort_by_key(|p| p.index);

    Ok(TableRows {
        info,
        serializer: serializer_for(&info.serializer)?,
        table_name: table_name.to_string(),
        parts: parts.into_iter(),
        current: Vec::new().into_iter(),
    })
}
