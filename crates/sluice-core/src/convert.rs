//! Record conversion: heterogeneous JSON objects into one Arrow `RecordBatch`.
//!
//! Upstream stages produce one object per record and the key sets drift from
//! document to document. Conversion is an explicit schema-union step:
//! the column set is the union of all keys in first-seen order, missing keys
//! become nulls, and each column gets a single nullable Arrow type.

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use serde_json::Value;
use tracing::debug;

use crate::error::{IngestError, Result};

/// Arrow type chosen for a column from the values observed in it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnKind {
    Boolean,
    Int64,
    Float64,
    Utf8,
}

impl ColumnKind {
    fn data_type(self) -> DataType {
        match self {
            ColumnKind::Boolean => DataType::Boolean,
            ColumnKind::Int64 => DataType::Int64,
            ColumnKind::Float64 => DataType::Float64,
            ColumnKind::Utf8 => DataType::Utf8,
        }
    }

    /// Narrowest kind holding every non-null value. Mixed or nested values
    /// fall back to text; an all-null column is text as well.
    fn infer<'a>(values: impl Iterator<Item = &'a Value>) -> Self {
        let mut kind: Option<ColumnKind> = None;
        for value in values {
            let this = match value {
                Value::Bool(_) => ColumnKind::Boolean,
                Value::Number(n) if n.is_i64() => ColumnKind::Int64,
                Value::Number(_) => ColumnKind::Float64,
                _ => return ColumnKind::Utf8,
            };
            kind = Some(match (kind, this) {
                (None, k) => k,
                (Some(a), b) if a == b => a,
                (Some(ColumnKind::Int64), ColumnKind::Float64)
                | (Some(ColumnKind::Float64), ColumnKind::Int64) => ColumnKind::Float64,
                _ => return ColumnKind::Utf8,
            });
        }
        kind.unwrap_or(ColumnKind::Utf8)
    }
}

/// Converts batches of record dictionaries into a single table.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordConverter {
    drop_empty_cols: bool,
}

impl RecordConverter {
    pub fn new(drop_empty_cols: bool) -> Self {
        Self { drop_empty_cols }
    }

    /// Convert `records` into one `RecordBatch`.
    ///
    /// Output is a pure function of the input sequence: same records in the
    /// same order give the same column order, types and rows.
    pub fn convert(&self, records: &[Value]) -> Result<RecordBatch> {
        let objects = records
            .iter()
            .enumerate()
            .map(|(index, record)| {
                record
                    .as_object()
                    .ok_or_else(|| IngestError::InvalidRecordShape {
                        index,
                        found: value_kind(record).to_string(),
                    })
            })
            .collect::<Result<Vec<_>>>()?;

        // Union of keys, first-seen order.
        let mut columns: Vec<&str> = Vec::new();
        let mut positions: HashMap<&str, usize> = HashMap::new();
        for object in &objects {
            for key in object.keys() {
                if !positions.contains_key(key.as_str()) {
                    positions.insert(key.as_str(), columns.len());
                    columns.push(key.as_str());
                }
            }
        }

        let mut fields = Vec::with_capacity(columns.len());
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(columns.len());
        let mut dropped = 0usize;

        for name in &columns {
            let cells: Vec<Option<&Value>> = objects
                .iter()
                .map(|object| object.get(*name).filter(|v| !v.is_null()))
                .collect();

            // Emptiness is judged over the whole batch, after the union.
            if self.drop_empty_cols && cells.iter().all(Option::is_none) {
                dropped += 1;
                continue;
            }

            let kind = ColumnKind::infer(cells.iter().flatten().copied());
            fields.push(Field::new(*name, kind.data_type(), true));
            arrays.push(build_array(kind, &cells));
        }

        debug!(
            "Converted {} records into {} columns ({} empty columns dropped)",
            objects.len(),
            fields.len(),
            dropped
        );

        let schema = Arc::new(Schema::new(fields));
        let options = RecordBatchOptions::new().with_row_count(Some(objects.len()));
        RecordBatch::try_new_with_options(schema, arrays, &options)
            .map_err(|e| IngestError::Config(format!("failed to assemble record batch: {}", e)))
    }
}

fn build_array(kind: ColumnKind, cells: &[Option<&Value>]) -> ArrayRef {
    match kind {
        ColumnKind::Boolean => Arc::new(BooleanArray::from(
            cells
                .iter()
                .map(|c| c.and_then(Value::as_bool))
                .collect::<Vec<_>>(),
        )),
        ColumnKind::Int64 => Arc::new(Int64Array::from(
            cells
                .iter()
                .map(|c| c.and_then(Value::as_i64))
                .collect::<Vec<_>>(),
        )),
        ColumnKind::Float64 => Arc::new(Float64Array::from(
            cells
                .iter()
                .map(|c| c.and_then(Value::as_f64))
                .collect::<Vec<_>>(),
        )),
        ColumnKind::Utf8 => Arc::new(StringArray::from(
            cells
                .iter()
                .map(|c| {
                    c.map(|v| match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                })
                .collect::<Vec<_>>(),
        )),
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
