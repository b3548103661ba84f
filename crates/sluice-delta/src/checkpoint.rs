//! Log checkpoints: Parquet snapshots of the replayed table state.
//!
//! A checkpoint at version `v` holds the `protocol`, `metaData` and active
//! `add` actions of the table as of `v`, one action per row in a struct
//! column named after the action. Readers start from the newest checkpoint
//! at or below the requested version and replay the JSON commits after it,
//! so commits older than a checkpoint may be cleaned up.
//!
//! `_delta_log/_last_checkpoint` points at the newest checkpoint and lets a
//! reader of the latest version skip listing older log entries.

use std::sync::Arc;

use arrow::datatypes::{DataType, Field, Fields, Schema, SchemaRef};
use arrow::json::{ArrayWriter, ReaderBuilder};
use arrow::record_batch::RecordBatch;
use futures::TryStreamExt;
use object_store::path::Path as ObjectPath;
use object_store::{PutPayload, ObjectStore};
use parquet::arrow::async_reader::{ParquetObjectReader, ParquetRecordBatchStreamBuilder};
use parquet::arrow::{ArrowWriter, ProjectionMask};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sluice_core::StorageOptions;
use tracing::{debug, info, warn};

use crate::action::Action;
use crate::error::DeltaResult;
use crate::store::TableStore;
use crate::table::{DeltaTable, LoadOptions};

pub const LAST_CHECKPOINT: &str = "_last_checkpoint";

/// Columns of a checkpoint file that replay uses.
const ACTION_COLUMNS: [&str; 4] = ["protocol", "metaData", "add", "remove"];

/// Parsed statistics columns some writers add; replay reads `stats` instead.
const SKIPPED_CHILDREN: [&str; 2] = ["stats_parsed", "partitionValues_parsed"];

/// Contents of `_delta_log/_last_checkpoint`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastCheckpoint {
    pub version: i64,
    /// Number of actions in the checkpoint.
    pub size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parts: Option<u32>,
}

/// File name of a single-part checkpoint.
pub fn checkpoint_file_name(version: i64) -> String {
    format!("{:020}.checkpoint.parquet", version)
}

/// Part `part` (1-based) of a checkpoint split into `parts` files.
pub fn checkpoint_part_file_name(version: i64, part: u32, parts: u32) -> String {
    format!("{:020}.checkpoint.{:010}.{:010}.parquet", version, part, parts)
}

/// A checkpoint file name split into its version and, for multi-part
/// checkpoints, `(part, parts)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointFile {
    pub version: i64,
    pub part: u32,
    pub parts: u32,
}

/// Parse a checkpoint file name. UUID-named checkpoints are not recognised.
pub fn parse_checkpoint_file(file_name: &str) -> Option<CheckpointFile> {
    let stem = file_name.strip_suffix(".parquet")?;
    let (version, rest) = stem.split_once(".checkpoint")?;
    if version.len() != 20 || !version.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let version = version.parse().ok()?;
    if rest.is_empty() {
        return Some(CheckpointFile {
            version,
            part: 1,
            parts: 1,
        });
    }
    let (part, parts) = rest.strip_prefix('.')?.split_once('.')?;
    let part: u32 = part.parse().ok()?;
    let parts: u32 = parts.parse().ok()?;
    (part >= 1 && part <= parts).then_some(CheckpointFile {
        version,
        part,
        parts,
    })
}

/// Read `_last_checkpoint`, if present and readable.
///
/// A malformed pointer is logged and ignored; the caller falls back to a
/// full listing.
pub(crate) async fn read_last_checkpoint(store: &TableStore) -> DeltaResult<Option<LastCheckpoint>> {
    let path = store.log_file(LAST_CHECKPOINT);
    let bytes = match store.store().get(&path).await {
        Ok(result) => result.bytes().await?,
        Err(object_store::Error::NotFound { .. }) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_slice(&bytes) {
        Ok(last) => Ok(Some(last)),
        Err(e) => {
            warn!("Ignoring unreadable {} in {}: {}", LAST_CHECKPOINT, store.uri(), e);
            Ok(None)
        }
    }
}

/// Read every action stored in the given checkpoint part files.
pub(crate) async fn read_checkpoint(
    store: &TableStore,
    parts: &[ObjectPath],
) -> DeltaResult<Vec<Action>> {
    let object_store = store.store();
    let mut actions = Vec::new();
    for part in parts {
        for batch in read_action_columns(Arc::clone(&object_store), part).await? {
            for row in batch_to_rows(&batch)? {
                actions.extend(Action::from_checkpoint_row(row)?);
            }
        }
    }
    debug!("Read {} actions from {} checkpoint part(s)", actions.len(), parts.len());
    Ok(actions)
}

async fn read_action_columns(
    store: Arc<dyn ObjectStore>,
    path: &ObjectPath,
) -> DeltaResult<Vec<RecordBatch>> {
    let meta = store.head(path).await?;
    let reader = ParquetObjectReader::new(store, meta);
    let builder = ParquetRecordBatchStreamBuilder::new(reader).await?;

    let leaves: Vec<usize> = builder
        .parquet_schema()
        .columns()
        .iter()
        .enumerate()
        .filter(|(_, column)| {
            let parts = column.path().parts();
            let wanted = parts
                .first()
                .is_some_and(|root| ACTION_COLUMNS.contains(&root.as_str()));
            let skipped = parts
                .get(1)
                .is_some_and(|child| SKIPPED_CHILDREN.contains(&child.as_str()));
            wanted && !skipped
        })
        .map(|(index, _)| index)
        .collect();
    if leaves.is_empty() {
        return Ok(Vec::new());
    }

    let mask = ProjectionMask::leaves(builder.parquet_schema(), leaves);
    let stream = builder.with_projection(mask).build()?;
    Ok(stream.try_collect::<Vec<_>>().await?)
}

fn batch_to_rows(batch: &RecordBatch) -> DeltaResult<Vec<Map<String, Value>>> {
    if batch.num_rows() == 0 {
        return Ok(Vec::new());
    }
    let mut writer = ArrayWriter::new(Vec::new());
    writer.write(batch)?;
    writer.finish()?;
    Ok(serde_json::from_slice(&writer.into_inner())?)
}

/// Write a checkpoint of the table at `uri` as of `version` (latest if
/// `None`) and point `_last_checkpoint` at it. Returns the checkpointed
/// version.
pub async fn create_checkpoint(
    uri: &str,
    storage_options: &StorageOptions,
    version: Option<i64>,
) -> DeltaResult<i64> {
    let store = TableStore::open(uri, storage_options)?;
    let table = DeltaTable::load(
        store.clone(),
        LoadOptions {
            version,
            without_files: false,
        },
    )
    .await?;
    write_checkpoint(&store, &table).await
}

pub(crate) async fn write_checkpoint(store: &TableStore, table: &DeltaTable) -> DeltaResult<i64> {
    let mut actions = Vec::with_capacity(table.add_actions().len() + 2);
    actions.push(Action::Protocol(table.protocol().cloned().unwrap_or_default()));
    actions.push(Action::MetaData(table.metadata().clone()));
    actions.extend(table.add_actions().iter().cloned().map(Action::Add));

    let batch = actions_to_batch(&actions)?;
    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), None)?;
    writer.write(&batch)?;
    writer.close()?;

    let version = table.version();
    let object_store = store.store();
    object_store
        .put(
            &store.log_file(&checkpoint_file_name(version)),
            PutPayload::from(buf),
        )
        .await?;

    let newer = read_last_checkpoint(store)
        .await?
        .is_some_and(|last| last.version > version);
    if !newer {
        let last = LastCheckpoint {
            version,
            size: actions.len() as i64,
            parts: None,
        };
        object_store
            .put(
                &store.log_file(LAST_CHECKPOINT),
                PutPayload::from(serde_json::to_vec(&last)?),
            )
            .await?;
    }

    info!(
        "Wrote checkpoint for {} at version {} ({} actions)",
        store.uri(),
        version,
        actions.len()
    );
    Ok(version)
}

fn actions_to_batch(actions: &[Action]) -> DeltaResult<RecordBatch> {
    let mut lines = Vec::new();
    for action in actions {
        serde_json::to_writer(&mut lines, action)?;
        lines.push(b'\n');
    }
    let schema = checkpoint_schema();
    let mut reader = ReaderBuilder::new(Arc::clone(&schema))
        .with_batch_size(actions.len().max(1))
        .build(lines.as_slice())?;
    match reader.next() {
        Some(batch) => Ok(batch?),
        None => Ok(RecordBatch::new_empty(schema)),
    }
}

fn checkpoint_schema() -> SchemaRef {
    let string = |name: &str| Field::new(name, DataType::Utf8, true);
    let long = |name: &str| Field::new(name, DataType::Int64, true);
    let string_list =
        |name: &str| Field::new_list(name, Field::new("element", DataType::Utf8, true), true);
    let string_map = |name: &str| {
        Field::new_map(
            name,
            "key_value",
            Field::new("key", DataType::Utf8, false),
            Field::new("value", DataType::Utf8, true),
            false,
            true,
        )
    };

    let protocol = Fields::from(vec![
        Field::new("minReaderVersion", DataType::Int32, true),
        Field::new("minWriterVersion", DataType::Int32, true),
        string_list("readerFeatures"),
        string_list("writerFeatures"),
    ]);
    let format = Fields::from(vec![string("provider"), string_map("options")]);
    let metadata = Fields::from(vec![
        string("id"),
        string("name"),
        string("description"),
        Field::new_struct("format", format, true),
        string("schemaString"),
        string_list("partitionColumns"),
        long("createdTime"),
        string_map("configuration"),
    ]);
    let add = Fields::from(vec![
        string("path"),
        string_map("partitionValues"),
        long("size"),
        long("modificationTime"),
        Field::new("dataChange", DataType::Boolean, true),
        string("stats"),
    ]);
    let remove = Fields::from(vec![
        string("path"),
        long("deletionTimestamp"),
        Field::new("dataChange", DataType::Boolean, true),
    ]);

    Arc::new(Schema::new(vec![
        Field::new_struct("protocol", protocol, true),
        Field::new_struct("metaData", metadata, true),
        Field::new_struct("add", add, true),
        Field::new_struct("remove", remove, true),
    ]))
}
