//! Inspect-batch command implementation.

use rowsync_engine::{read_batch, rows_for_table};
use rowsync_protocol::{BatchInfo, RowState};
use serde::Serialize;
use std::path::Path;

/// Per-table view of a batch.
#[derive(Debug, Serialize)]
pub struct BatchTableReport {
    /// Table name.
    pub name: String,
    /// Upserted rows.
    pub upserts: u64,
    /// Tombstones.
    pub deletes: u64,
    /// Rendered rows, when requested.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rows: Vec<String>,
}

/// Reads every table of the batch, counting states and optionally
/// rendering the rows.
pub fn describe(
    info: &BatchInfo,
    with_rows: bool,
) -> Result<Vec<BatchTableReport>, Box<dyn std::error::Error>> {
    let mut reports = Vec::new();
    for table in &info.schema.tables {
        let mut report = BatchTableReport {
            name: table.name.clone(),
            upserts: 0,
            deletes: 0,
            rows: Vec::new(),
        };
        for row in rows_for_table(info, &table.name)? {
            let row = row?;
            match row.state {
                RowState::Upsert => report.upserts += 1,
                RowState::Deleted => report.deletes += 1,
            }
            if with_rows {
                let values: Vec<String> = row.values.iter().map(ToString::to_string).collect();
                report
                    .rows
                    .push(format!("{:?} ({})", row.state, values.join(", ")));
            }
        }
        if report.upserts + report.deletes > 0 {
            reports.push(report);
        }
    }
    Ok(reports)
}

/// Runs the inspect-batch command.
pub fn run(directory: &Path, with_rows: bool, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let info = read_batch(directory)?;
    let tables = describe(&info, with_rows)?;

    match format {
        "json" => {
            let output = serde_json::json!({
                "manifest": info,
                "tables": tables,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        _ => {
            println!("Batch {:?}", info.directory_path());
            println!("  Serializer: {}", info.serializer);
            println!("  Timestamp:  {}", info.timestamp);
            println!("  Rows:       {}", info.rows_count);
            println!("  Parts:");
            for part in &info.parts {
                let last = if part.is_last_batch { " (last)" } else { "" };
                println!(
                    "    #{} {} {} rows{}",
                    part.index, part.file_name, part.rows_count, last
                );
            }
            for table in &tables {
                println!(
                    "  {}: {} upserts, {} deletes",
                    table.name, table.upserts, table.deletes
                );
                for row in &table.rows {
                    println!("    {}", row);
                }
            }
        }
    }

    Ok(())
}
