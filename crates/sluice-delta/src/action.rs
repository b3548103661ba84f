//! Transaction log actions and the table schema representation.
//!
//! Each commit file `_delta_log/<version>.json` holds one JSON action per
//! line, externally tagged: `{"add": {...}}`, `{"remove": {...}}`, etc.
//! Action kinds this crate does not use are skipped during replay.

use std::collections::HashMap;

use arrow::datatypes::{DataType, Schema, TimeUnit};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{DeltaError, DeltaResult};

pub const LOG_DIR: &str = "_delta_log";

/// File name of the commit for `version`.
pub fn commit_file_name(version: i64) -> String {
    format!("{:020}.json", version)
}

/// Parse a commit file name back into its version.
pub fn parse_commit_version(file_name: &str) -> Option<i64> {
    let stem = file_name.strip_suffix(".json")?;
    if stem.len() != 20 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Protocol {
    pub min_reader_version: i32,
    pub min_writer_version: i32,
    /// Table features a reader must support; only present at reader version 3.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reader_features: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub writer_features: Option<Vec<String>>,
}

impl Default for Protocol {
    fn default() -> Self {
        Self {
            min_reader_version: 1,
            min_writer_version: 2,
            reader_features: None,
            writer_features: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Format {
    pub provider: String,
    #[serde(default)]
    pub options: HashMap<String, String>,
}

impl Default for Format {
    fn default() -> Self {
        Self {
            provider: "parquet".to_string(),
            options: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub format: Format,
    pub schema_string: String,
    #[serde(default)]
    pub partition_columns: Vec<String>,
    /// Milliseconds since the Unix epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_time: Option<i64>,
    #[serde(default)]
    pub configuration: HashMap<String, Option<String>>,
}

impl Metadata {
    pub fn schema(&self) -> DeltaResult<StructType> {
        Ok(serde_json::from_str(&self.schema_string)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Add {
    /// Path relative to the table root.
    pub path: String,
    #[serde(default)]
    pub partition_values: HashMap<String, Option<String>>,
    pub size: i64,
    /// Milliseconds since the Unix epoch.
    pub modification_time: i64,
    #[serde(default)]
    pub data_change: bool,
    /// JSON-encoded file statistics, e.g. `{"numRecords": 3}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<String>,
}

impl Add {
    /// Row count recorded in the file statistics, if any.
    pub fn num_records(&self) -> Option<i64> {
        let stats: Value = serde_json::from_str(self.stats.as_deref()?).ok()?;
        stats.get("numRecords")?.as_i64()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Remove {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<i64>,
    #[serde(default)]
    pub data_change: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    Protocol(Protocol),
    MetaData(Metadata),
    Add(Add),
    Remove(Remove),
    CommitInfo(Map<String, Value>),
}

impl Action {
    /// Parse one log line. Returns `Ok(None)` for action kinds not modelled
    /// here (`txn`, `cdc`, `domainMetadata`, ...).
    pub fn from_line(line: &str) -> DeltaResult<Option<Self>> {
        let value: Map<String, Value> = serde_json::from_str(line)?;
        let Some(kind) = value.keys().next().cloned() else {
            return Err(DeltaError::InvalidLog(format!("empty action: {}", line)));
        };
        match kind.as_str() {
            "protocol" | "metaData" | "add" | "remove" | "commitInfo" => {
                Ok(Some(serde_json::from_value(Value::Object(value))?))
            }
            other => {
                debug!("Skipping unsupported log action '{}'", other);
                Ok(None)
            }
        }
    }

    /// Parse one checkpoint row, given as a JSON object keyed by action
    /// column. Null columns are absent; columns other than `protocol`,
    /// `metaData`, `add` and `remove` are ignored.
    pub fn from_checkpoint_row(mut row: Map<String, Value>) -> DeltaResult<Vec<Self>> {
        let mut actions = Vec::new();
        for kind in ["protocol", "metaData", "add", "remove"] {
            match row.remove(kind) {
                None | Some(Value::Null) => {}
                Some(value) => {
                    let mut tagged = Map::new();
                    tagged.insert(kind.to_string(), value);
                    actions.push(serde_json::from_value(Value::Object(tagged))?);
                }
            }
        }
        Ok(actions)
    }

    /// Serialize a commit as newline-delimited JSON.
    pub fn to_commit(actions: &[Action]) -> DeltaResult<Vec<u8>> {
        let mut buf = Vec::new();
        for action in actions {
            serde_json::to_writer(&mut buf, action)?;
            buf.push(b'\n');
        }
        Ok(buf)
    }
}

/// Table schema as stored in `metaData.schemaString`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructType {
    #[serde(rename = "type")]
    pub type_name: String,
    pub fields: Vec<StructField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructField {
    pub name: String,
    /// A primitive type name (`"string"`, `"long"`, ...) or a nested type object.
    #[serde(rename = "type")]
    pub data_type: Value,
    pub nullable: bool,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl StructType {
    /// Map an Arrow schema onto table primitive types.
    pub fn try_from_arrow(schema: &Schema) -> DeltaResult<Self> {
        let fields = schema
            .fields()
            .iter()
            .map(|field| {
                Ok(StructField {
                    name: field.name().clone(),
                    data_type: Value::String(primitive_name(field.data_type())?.to_string()),
                    nullable: field.is_nullable(),
                    metadata: Map::new(),
                })
            })
            .collect::<DeltaResult<Vec<_>>>()?;
        Ok(Self {
            type_name: "struct".to_string(),
            fields,
        })
    }

    /// Whether two schemas hold the same named columns with the same types,
    /// ignoring column order and nullability.
    pub fn same_columns(&self, other: &StructType) -> bool {
        let key = |s: &StructType| {
            let mut cols: Vec<(String, String)> = s
                .fields
                .iter()
                .map(|f| (f.name.clone(), f.data_type.to_string()))
                .collect();
            cols.sort();
            cols
        };
        key(self) == key(other)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.fields.iter().map(|f| f.name.as_str()).collect()
    }
}

fn primitive_name(data_type: &DataType) -> DeltaResult<&'static str> {
    Ok(match data_type {
        DataType::Utf8 | DataType::LargeUtf8 => "string",
        DataType::Int64 => "long",
        DataType::Int32 => "integer",
        DataType::Int16 => "short",
        DataType::Int8 => "byte",
        DataType::Float64 => "double",
        DataType::Float32 => "float",
        DataType::Boolean => "boolean",
        DataType::Binary | DataType::LargeBinary => "binary",
        DataType::Date32 => "date",
        DataType::Timestamp(TimeUnit::Microsecond, Some(_)) => "timestamp",
        DataType::Timestamp(TimeUnit::Microsecond, None) => "timestamp_ntz",
        other => return Err(DeltaError::UnsupportedType(other.to_string())),
    })
}
