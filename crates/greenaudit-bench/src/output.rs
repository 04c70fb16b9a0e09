//! Results table (CSV) and summary (JSON) persistence.

use std::fs;
use std::path::Path;

use greenaudit_core::{ResultRecord, Result};
use serde::Serialize;
use tracing::debug;

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Write every record, header first. Checkpoints and the final file share
/// this schema, and an empty table still gets its header.
pub fn write_results(path: &Path, records: &[ResultRecord]) -> Result<()> {
    ensure_parent(path)?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)?;
    writer.write_record(ResultRecord::COLUMNS)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer.flush()?;
    debug!(path = %path.display(), rows = records.len(), "results written");
    Ok(())
}

pub fn read_results(path: &Path) -> Result<Vec<ResultRecord>> {
    let mut reader = csv::Reader::from_path(path)?;
    let records = reader
        .deserialize()
        .collect::<std::result::Result<Vec<ResultRecord>, _>>()?;
    Ok(records)
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    ensure_parent(path)?;
    fs::write(path, serde_json::to_string_pretty(value)?)?;
    debug!(path = %path.display(), "json written");
    Ok(())
}
