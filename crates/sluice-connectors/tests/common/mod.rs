#![allow(dead_code)]

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use sluice_connectors::IsolatedWriter;
use sluice_core::{ProcessorConfig, ReadConfig, StorageOptions};
use sluice_delta::action::{commit_file_name, Action, Add, Metadata, Protocol, StructType, LOG_DIR};
use sluice_delta::{read_data_file, DeltaTable, LoadOptions};
use tempfile::TempDir;

pub fn writer() -> IsolatedWriter {
    IsolatedWriter::new(env!("CARGO_BIN_EXE_sluice-delta-writer"))
}

pub fn configs(dir: &TempDir) -> (ReadConfig, ProcessorConfig) {
    (
        ReadConfig {
            download_dir: dir.path().join("downloads"),
            ..Default::default()
        },
        ProcessorConfig {
            output_dir: dir.path().join("output"),
            ..Default::default()
        },
    )
}

pub fn uri(dir: &TempDir, name: &str) -> String {
    dir.path().join(name).to_string_lossy().into_owned()
}

/// Batch with an Int64 column and a Utf8 column.
pub fn int_str_batch(int_col: &str, ints: &[i64], str_col: &str, strs: &[&str]) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![
        Field::new(int_col, DataType::Int64, true),
        Field::new(str_col, DataType::Utf8, true),
    ]));
    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from(ints.to_vec())),
        Arc::new(StringArray::from(strs.to_vec())),
    ];
    RecordBatch::try_new(schema, columns).unwrap()
}

pub fn write_parquet(path: &Path, batch: &RecordBatch) -> i64 {
    let file = File::create(path).unwrap();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None).unwrap();
    writer.write(batch).unwrap();
    writer.close().unwrap();
    std::fs::metadata(path).unwrap().len() as i64
}

/// Create a table at `root` whose version 0 adds one `<name>.parquet` file
/// per partition. Partitions may have different columns.
pub fn seed_partitioned_table(root: &Path, partitions: &[(&str, RecordBatch)]) {
    std::fs::create_dir_all(root.join(LOG_DIR)).unwrap();
    let now = chrono::Utc::now().timestamp_millis();

    let merged = Schema::try_merge(
        partitions
            .iter()
            .map(|(_, batch)| batch.schema().as_ref().clone()),
    )
    .unwrap();
    let schema = StructType::try_from_arrow(&merged).unwrap();

    let mut actions = vec![
        Action::Protocol(Protocol::default()),
        Action::MetaData(Metadata {
            id: "seeded".to_string(),
            name: None,
            description: None,
            format: Default::default(),
            schema_string: serde_json::to_string(&schema).unwrap(),
            partition_columns: Vec::new(),
            created_time: Some(now),
            configuration: Default::default(),
        }),
    ];
    for (name, batch) in partitions {
        let file_name = format!("{}.parquet", name);
        let size = write_parquet(&root.join(&file_name), batch);
        actions.push(Action::Add(Add {
            path: file_name,
            partition_values: Default::default(),
            size,
            modification_time: now,
            data_change: true,
            stats: None,
        }));
    }

    std::fs::write(
        root.join(LOG_DIR).join(commit_file_name(0)),
        Action::to_commit(&actions).unwrap(),
    )
    .unwrap();
}

/// Every row of the latest snapshot, in log order.
pub async fn read_table(uri: &str) -> (DeltaTable, Vec<RecordBatch>) {
    let table = DeltaTable::open(uri, &StorageOptions::new(), LoadOptions::default())
        .await
        .unwrap();
    let mut batches = Vec::new();
    for add in table.add_actions() {
        let path = table.object_path(&add.path).unwrap();
        batches.extend(read_data_file(table.object_store(), &path).await.unwrap());
    }
    (table, batches)
}
