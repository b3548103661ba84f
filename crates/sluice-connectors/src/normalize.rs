//! Normalization stage: cached CSV into the per-document JSON output.
//!
//! The output is a JSON array of objects, one per cached row, with columns in
//! header order and values typed by the cached schema. Null cells are
//! omitted from their object.

use std::io::Write;
use std::path::Path;

use arrow::json::ArrayWriter;
use sluice_core::Result;
use tracing::info;

use crate::cache::{persist_atomically, read_cache};

/// Whether the normalize step should run for a document.
pub fn needs_normalize(output_path: &Path, reprocess: bool) -> bool {
    reprocess || !output_path.is_file()
}

/// Convert the CSV at `cache_path` into a JSON array at `output_path`.
///
/// Returns the number of records written.
pub fn normalize_document(cache_path: &Path, output_path: &Path) -> Result<usize> {
    let batches = read_cache(cache_path)?;

    let rows: usize = batches.iter().map(|b| b.num_rows()).sum();
    let mut writer = ArrayWriter::new(Vec::new());
    for batch in &batches {
        writer.write(batch).map_err(std::io::Error::other)?;
    }
    writer.finish().map_err(std::io::Error::other)?;
    let body = writer.into_inner();

    persist_atomically(output_path, |out| out.write_all(&body))?;
    info!(
        "Normalized {} rows from {} into {}",
        rows,
        cache_path.display(),
        output_path.display()
    );
    Ok(rows)
}
