//! Table writes: one Parquet data file plus one log commit per call.
//!
//! The commit is written with `PutMode::Create`, so when two writers race for
//! the same version exactly one wins and the other gets
//! [`DeltaError::CommitConflict`]. A losing writer leaves an unreferenced
//! data file behind, which readers never see.

use arrow::record_batch::RecordBatch;
use chrono::Utc;
use object_store::{PutMode, PutOptions, PutPayload};
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use serde_json::{json, Map, Value};
use sluice_core::{StorageOptions, WriteMode};
use tracing::info;
use uuid::Uuid;

use crate::action::{commit_file_name, Action, Add, Metadata, Protocol, Remove, StructType};
use crate::error::{DeltaError, DeltaResult};
use crate::store::TableStore;
use crate::table::{DeltaTable, LoadOptions};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    pub mode: WriteMode,
    /// Allow `overwrite` to replace the table schema.
    pub overwrite_schema: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// A new version was committed.
    Committed { version: i64, rows: usize },
    /// Mode `ignore` against an existing table; nothing was written.
    Skipped,
}

/// Write `batch` to the table at `uri`, creating the table if needed.
pub async fn write_table(
    uri: &str,
    storage_options: &StorageOptions,
    batch: &RecordBatch,
    options: WriteOptions,
) -> DeltaResult<WriteOutcome> {
    let store = TableStore::open(uri, storage_options)?;
    write_to_store(store, batch, options).await
}

/// Same as [`write_table`] for an already constructed store.
pub async fn write_to_store(
    store: TableStore,
    batch: &RecordBatch,
    options: WriteOptions,
) -> DeltaResult<WriteOutcome> {
    let existing = match DeltaTable::load(store.clone(), LoadOptions::default()).await {
        Ok(table) => Some(table),
        Err(DeltaError::TableNotFound(_)) => None,
        Err(e) => return Err(e),
    };

    let schema = StructType::try_from_arrow(batch.schema().as_ref())?;
    let now = Utc::now().timestamp_millis();
    let mut actions = Vec::new();

    let version = match &existing {
        None => {
            actions.push(Action::Protocol(Protocol::default()));
            actions.push(Action::MetaData(new_metadata(&schema, now)?));
            0
        }
        Some(table) => {
            let current = table.schema()?;
            match options.mode {
                WriteMode::Ignore => {
                    info!("Table {} exists, ignoring write", store.uri());
                    return Ok(WriteOutcome::Skipped);
                }
                WriteMode::Error => {
                    if table.count_rows().await? > 0 {
                        return Err(DeltaError::TableAlreadyExists(store.uri().to_string()));
                    }
                    ensure_same_columns(&current, &schema)?;
                }
                WriteMode::Append => ensure_same_columns(&current, &schema)?,
                WriteMode::Overwrite => {
                    if !current.same_columns(&schema) {
                        if !options.overwrite_schema {
                            return Err(DeltaError::SchemaMismatch(format!(
                                "overwrite would change columns {:?} -> {:?}; set overwrite_schema",
                                current.column_names(),
                                schema.column_names()
                            )));
                        }
                        let mut metadata = table.metadata().clone();
                        metadata.schema_string = serde_json::to_string(&schema)?;
                        actions.push(Action::MetaData(metadata));
                    }
                    actions.extend(table.add_actions().iter().map(|add| {
                        Action::Remove(Remove {
                            path: add.path.clone(),
                            deletion_timestamp: Some(now),
                            data_change: true,
                        })
                    }));
                }
            }
            table.version() + 1
        }
    };

    if batch.num_rows() > 0 {
        actions.push(Action::Add(write_data_file(&store, batch, now).await?));
    }
    actions.push(Action::CommitInfo(commit_info(options, now)));

    commit(&store, version, &actions).await?;

    info!(
        "Committed version {} of {} ({} rows, mode={})",
        version,
        store.uri(),
        batch.num_rows(),
        options.mode
    );
    Ok(WriteOutcome::Committed {
        version,
        rows: batch.num_rows(),
    })
}

fn ensure_same_columns(current: &StructType, incoming: &StructType) -> DeltaResult<()> {
    if current.same_columns(incoming) {
        Ok(())
    } else {
        Err(DeltaError::SchemaMismatch(format!(
            "table has columns {:?}, batch has {:?}",
            current.column_names(),
            incoming.column_names()
        )))
    }
}

fn new_metadata(schema: &StructType, now: i64) -> DeltaResult<Metadata> {
    Ok(Metadata {
        id: Uuid::new_v4().to_string(),
        name: None,
        description: None,
        format: Default::default(),
        schema_string: serde_json::to_string(schema)?,
        partition_columns: Vec::new(),
        created_time: Some(now),
        configuration: Default::default(),
    })
}

fn commit_info(options: WriteOptions, now: i64) -> Map<String, Value> {
    let mut info = Map::new();
    info.insert("timestamp".to_string(), json!(now));
    info.insert("operation".to_string(), json!("WRITE"));
    info.insert(
        "operationParameters".to_string(),
        json!({ "mode": options.mode.as_str() }),
    );
    info.insert(
        "clientVersion".to_string(),
        json!(concat!("sluice-", env!("CARGO_PKG_VERSION"))),
    );
    info
}

async fn write_data_file(store: &TableStore, batch: &RecordBatch, now: i64) -> DeltaResult<Add> {
    let mut buf = Vec::new();
    let props = WriterProperties::builder()
        .set_compression(parquet::basic::Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(&mut buf, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;

    let relative = format!("part-00000-{}-c000.snappy.parquet", Uuid::new_v4());
    let size = buf.len() as i64;
    store
        .store()
        .put(&store.object_path(&relative)?, PutPayload::from(buf))
        .await?;

    Ok(Add {
        path: relative,
        partition_values: Default::default(),
        size,
        modification_time: now,
        data_change: true,
        stats: Some(json!({ "numRecords": batch.num_rows() }).to_string()),
    })
}

async fn commit(store: &TableStore, version: i64, actions: &[Action]) -> DeltaResult<()> {
    let path = store.log_file(&commit_file_name(version));
    let opts = PutOptions {
        mode: PutMode::Create,
        ..Default::default()
    };
    match store
        .store()
        .put_opts(&path, PutPayload::from(Action::to_commit(actions)?), opts)
        .await
    {
        Ok(_) => Ok(()),
        Err(object_store::Error::AlreadyExists { .. }) => Err(DeltaError::CommitConflict(version)),
        Err(e) => Err(e.into()),
    }
}
