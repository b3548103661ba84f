//! Local CSV cache of fetched data files.
//!
//! A cached document is a CSV file with a header row next to a schema
//! sidecar (`<stem>.schema.arrow`, an Arrow IPC file without batches). The
//! sidecar lets the cache be read back with the source column types instead
//! of guessing them, so `"00501"` stays a string.
//!
//! Nulls are written as `\N`, which keeps them apart from empty strings.
//! Columns CSV cannot carry are cached as text: nested values (lists,
//! structs, maps) as JSON, anything else in its display form.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{new_empty_array, Array, ArrayRef, StringArray};
use arrow::csv::reader::Format;
use arrow::csv::{ReaderBuilder, WriterBuilder};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef, TimeUnit};
use arrow::error::ArrowError;
use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;
use arrow::json::ArrayWriter;
use arrow::record_batch::RecordBatch;
use arrow::util::display::{ArrayFormatter, FormatOptions};
use regex::Regex;
use serde_json::{Map, Value};
use sluice_core::Result;
use tempfile::NamedTempFile;
use tracing::debug;

/// Cell written for a null value.
pub const NULL_MARKER: &str = "\\N";

/// Path of the schema sidecar for a cache file.
pub fn schema_path(cache_path: &Path) -> PathBuf {
    cache_path.with_extension("schema.arrow")
}

/// Write `batches` to `cache_path` with its schema sidecar.
///
/// The sidecar is written first; a cache file on disk therefore always has
/// its schema next to it. Both files go through [`persist_atomically`].
pub fn write_cache(cache_path: &Path, batches: &[RecordBatch]) -> std::io::Result<()> {
    let batches = batches
        .iter()
        .map(to_cache_batch)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(std::io::Error::other)?;

    if let Some(first) = batches.first() {
        let schema = first.schema();
        persist_atomically(&schema_path(cache_path), |file| {
            let mut writer = FileWriter::try_new(file, &schema).map_err(std::io::Error::other)?;
            writer.finish().map_err(std::io::Error::other)
        })?;
    }

    persist_atomically(cache_path, |file| {
        let mut writer = WriterBuilder::new()
            .with_header(true)
            .with_null(NULL_MARKER.to_string())
            .build(file);
        for batch in &batches {
            writer.write(batch).map_err(std::io::Error::other)?;
        }
        Ok(())
    })
}

/// Read a cache file back into record batches.
///
/// Without a sidecar (a cache file placed by hand) column types are
/// inferred and empty cells read as null.
pub fn read_cache(cache_path: &Path) -> Result<Vec<RecordBatch>> {
    let mut file = File::open(cache_path)?;
    if file.metadata()?.len() == 0 {
        return Ok(Vec::new());
    }

    let (schema, format) = match read_schema(&schema_path(cache_path))? {
        Some(schema) => {
            let null_regex = Regex::new(&format!("^{}$", regex::escape(NULL_MARKER)))
                .map_err(std::io::Error::other)?;
            let format = Format::default()
                .with_header(true)
                .with_null_regex(null_regex);
            (schema, format)
        }
        None => {
            let format = Format::default().with_header(true);
            let (schema, _) = format
                .infer_schema(&mut file, None)
                .map_err(std::io::Error::other)?;
            file.seek(SeekFrom::Start(0))?;
            debug!(
                "No schema sidecar for {}, inferred {} columns",
                cache_path.display(),
                schema.fields().len()
            );
            (Arc::new(schema), format)
        }
    };

    let reader = ReaderBuilder::new(schema)
        .with_format(format)
        .build(file)
        .map_err(std::io::Error::other)?;
    let batches = reader
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(std::io::Error::other)?;
    Ok(batches)
}

fn read_schema(path: &Path) -> std::io::Result<Option<SchemaRef>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let reader = FileReader::try_new(file, None).map_err(std::io::Error::other)?;
    Ok(Some(reader.schema()))
}

/// Write `path` through a uniquely named sibling file and an atomic rename.
///
/// Concurrent writers of the same path each produce a complete file; the
/// last rename wins.
pub(crate) fn persist_atomically<F>(path: &Path, write: F) -> std::io::Result<()>
where
    F: FnOnce(&mut File) -> std::io::Result<()>,
{
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut tmp = NamedTempFile::new_in(parent)?;
    write(tmp.as_file_mut())?;
    tmp.as_file_mut().flush()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Whether the CSV reader parses `data_type` back from what the writer
/// produces.
fn csv_round_trips(data_type: &DataType) -> bool {
    match data_type {
        DataType::Null
        | DataType::Boolean
        | DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64
        | DataType::Float32
        | DataType::Float64
        | DataType::Decimal128(_, _)
        | DataType::Decimal256(_, _)
        | DataType::Date32
        | DataType::Date64
        | DataType::Timestamp(_, _)
        | DataType::Utf8 => true,
        DataType::Time32(unit) => matches!(unit, TimeUnit::Second | TimeUnit::Millisecond),
        DataType::Time64(unit) => matches!(unit, TimeUnit::Microsecond | TimeUnit::Nanosecond),
        DataType::Dictionary(_, value) => value.as_ref() == &DataType::Utf8,
        _ => false,
    }
}

/// Replace columns CSV cannot carry with Utf8 text columns.
fn to_cache_batch(batch: &RecordBatch) -> std::result::Result<RecordBatch, ArrowError> {
    let schema = batch.schema();
    if schema.fields().iter().all(|f| csv_round_trips(f.data_type())) {
        return Ok(batch.clone());
    }

    let mut fields = Vec::with_capacity(batch.num_columns());
    let mut columns = Vec::with_capacity(batch.num_columns());
    for (field, column) in schema.fields().iter().zip(batch.columns()) {
        if csv_round_trips(field.data_type()) {
            fields.push(field.as_ref().clone());
            columns.push(Arc::clone(column));
            continue;
        }
        let text = if field.data_type().is_nested() {
            json_text(column).or_else(|_| display_text(column))?
        } else {
            display_text(column)?
        };
        debug!(
            "Caching column '{}' of type {} as text",
            field.name(),
            field.data_type()
        );
        fields.push(
            Field::new(field.name(), DataType::Utf8, true).with_metadata(field.metadata().clone()),
        );
        columns.push(text);
    }
    RecordBatch::try_new(Arc::new(Schema::new(fields)), columns)
}

/// Each value as compact JSON, e.g. `[1,2]` or `{"a":1}`.
fn json_text(column: &ArrayRef) -> std::result::Result<ArrayRef, ArrowError> {
    if column.is_empty() {
        return Ok(new_empty_array(&DataType::Utf8));
    }
    let schema = Arc::new(Schema::new(vec![Field::new(
        "v",
        column.data_type().clone(),
        true,
    )]));
    let batch = RecordBatch::try_new(schema, vec![Arc::clone(column)])?;
    let mut writer = ArrayWriter::new(Vec::new());
    writer.write(&batch)?;
    writer.finish()?;
    let rows: Vec<Map<String, Value>> = serde_json::from_slice(&writer.into_inner())
        .map_err(|e| ArrowError::JsonError(e.to_string()))?;
    let text: StringArray = rows
        .iter()
        .map(|row| row.get("v").map(Value::to_string))
        .collect();
    Ok(Arc::new(text))
}

fn display_text(column: &ArrayRef) -> std::result::Result<ArrayRef, ArrowError> {
    let formatter = ArrayFormatter::try_new(column.as_ref(), &FormatOptions::default())?;
    let text = (0..column.len())
        .map(|i| {
            column
                .is_valid(i)
                .then(|| formatter.value(i).try_to_string())
                .transpose()
        })
        .collect::<std::result::Result<StringArray, _>>()?;
    Ok(Arc::new(text))
}
