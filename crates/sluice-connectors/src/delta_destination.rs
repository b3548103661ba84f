//! Delta table destination with process-isolated writes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sluice_core::{IngestError, RecordConverter, Result, StorageOptions, WriteMode};
use sluice_delta::TableStore;
use tracing::{info, warn};

use crate::isolated::IsolatedWriter;
use crate::{DestinationConnector, IngestDoc};

/// How records are written to the destination table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaTableWriteConfig {
    /// Drop columns that are null in every row of the batch.
    #[serde(default)]
    pub drop_empty_cols: bool,
    /// Allow `overwrite` to replace the table schema.
    #[serde(default)]
    pub overwrite_schema: bool,
    #[serde(default)]
    pub mode: WriteMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DestinationState {
    Uninitialized,
    Initialized,
    Writing,
    Written,
    Failed,
}

#[derive(Debug)]
pub struct DeltaTableDestinationConnector {
    table_uri: String,
    storage_options: StorageOptions,
    write_config: DeltaTableWriteConfig,
    writer: IsolatedWriter,
    state: DestinationState,
}

impl DeltaTableDestinationConnector {
    pub fn new(
        table_uri: impl Into<String>,
        storage_options: StorageOptions,
        write_config: DeltaTableWriteConfig,
        writer: IsolatedWriter,
    ) -> Self {
        Self {
            table_uri: table_uri.into(),
            storage_options,
            write_config,
            writer,
            state: DestinationState::Uninitialized,
        }
    }

    pub fn state(&self) -> DestinationState {
        self.state
    }

    pub fn table_uri(&self) -> &str {
        &self.table_uri
    }

    async fn write_records(&self, records: &[Value]) -> Result<()> {
        let converter = RecordConverter::new(self.write_config.drop_empty_cols);
        let batch = converter.convert(records)?;
        if batch.num_rows() == 0 || batch.num_columns() == 0 {
            warn!("No records to write to {}", self.table_uri);
            return Ok(());
        }

        let columns: Vec<String> = batch
            .schema()
            .fields()
            .iter()
            .map(|f| format!("{}: {}", f.name(), f.data_type()))
            .collect();
        info!(
            "writing {} rows to destination table at {} (mode={}) columns: [{}]",
            batch.num_rows(),
            self.table_uri,
            self.write_config.mode,
            columns.join(", ")
        );

        self.writer
            .run(
                &batch,
                &self.table_uri,
                &self.storage_options,
                self.write_config.mode,
                self.write_config.overwrite_schema,
            )
            .await
    }
}

#[async_trait]
impl DestinationConnector for DeltaTableDestinationConnector {
    async fn check_connection(&self) -> Result<()> {
        TableStore::open(&self.table_uri, &self.storage_options)
            .map_err(|e| IngestError::Config(format!("invalid destination {}: {}", self.table_uri, e)))?;
        self.writer.check()
    }

    async fn initialize(&mut self) -> Result<()> {
        self.check_connection().await?;
        self.state = DestinationState::Initialized;
        Ok(())
    }

    async fn write_dict(&mut self, records: Vec<Value>) -> Result<()> {
        if self.state == DestinationState::Uninitialized {
            return Err(IngestError::NotInitialized(format!(
                "destination {}",
                self.table_uri
            )));
        }

        self.state = DestinationState::Writing;
        let result = self.write_records(&records).await;
        self.state = match result {
            Ok(()) => DestinationState::Written,
            Err(_) => DestinationState::Failed,
        };
        result
    }

    async fn write(&mut self, docs: &[Box<dyn IngestDoc>]) -> Result<()> {
        let mut records: Vec<Value> = Vec::new();
        for doc in docs {
            let path = doc.output_path();
            let bytes = std::fs::read(path)?;
            let content: Vec<Value> = serde_json::from_slice(&bytes).map_err(|e| {
                IngestError::DestinationWrite(format!(
                    "{} is not a JSON array of records: {}",
                    path.display(),
                    e
                ))
            })?;
            info!(
                "converting {} rows from content in {}",
                content.len(),
                path.display()
            );
            records.extend(content);
        }
        self.write_dict(records).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn connector(writer: IsolatedWriter) -> DeltaTableDestinationConnector {
        DeltaTableDestinationConnector::new(
            "/tmp/sluice-dest",
            StorageOptions::new(),
            DeltaTableWriteConfig::default(),
            writer,
        )
    }

    #[test]
    fn test_write_config_from_json() {
        let config: DeltaTableWriteConfig =
            serde_json::from_str(r#"{"mode": "overwrite", "overwrite_schema": true}"#).unwrap();
        assert_eq!(config.mode, WriteMode::Overwrite);
        assert!(config.overwrite_schema);
        assert!(!config.drop_empty_cols);

        let config: DeltaTableWriteConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, DeltaTableWriteConfig::default());
        assert_eq!(config.mode, WriteMode::Error);
    }

    #[tokio::test]
    async fn test_write_before_initialize() {
        let mut dest = connector(IsolatedWriter::new("/nonexistent/writer"));
        let err = dest.write_dict(vec![json!({"a": 1})]).await.unwrap_err();
        assert!(matches!(err, IngestError::NotInitialized(_)));
        assert_eq!(dest.state(), DestinationState::Uninitialized);
    }

    #[tokio::test]
    async fn test_initialize_requires_writer_program() {
        let mut dest = connector(IsolatedWriter::new("/nonexistent/writer"));
        assert!(dest.initialize().await.is_err());
        assert_eq!(dest.state(), DestinationState::Uninitialized);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_state_transitions() {
        let mut dest = connector(IsolatedWriter::new("/bin/false"));
        dest.initialize().await.unwrap();
        assert_eq!(dest.state(), DestinationState::Initialized);

        // Shape errors fail the attempt before any process is started.
        let err = dest.write_dict(vec![json!([1, 2])]).await.unwrap_err();
        assert!(matches!(err, IngestError::InvalidRecordShape { .. }));
        assert_eq!(dest.state(), DestinationState::Failed);

        // An empty batch is a no-op and starts a fresh attempt.
        dest.write_dict(Vec::new()).await.unwrap();
        assert_eq!(dest.state(), DestinationState::Written);

        let err = dest.write_dict(vec![json!({"a": 1})]).await.unwrap_err();
        assert!(matches!(err, IngestError::DestinationWrite(_)));
        assert_eq!(dest.state(), DestinationState::Failed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_write_rejects_malformed_output() {
        let dir = tempfile::TempDir::new().unwrap();
        let read_config = sluice_core::ReadConfig {
            download_dir: dir.path().join("d"),
            ..Default::default()
        };
        let processor_config = sluice_core::ProcessorConfig {
            output_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let store: std::sync::Arc<dyn object_store::ObjectStore> =
            std::sync::Arc::new(object_store::memory::InMemory::new());
        let doc = crate::DeltaTableIngestDoc::new(
            "memory:///t/part-0.parquet",
            object_store::path::Path::from("t/part-0.parquet"),
            std::sync::Arc::new(crate::ObjectStoreSource::new(
                store,
                crate::FingerprintStrategy::Checksum,
            )),
            &read_config,
            &processor_config,
        );
        std::fs::write(doc.output_path(), r#"{"a": 1}"#).unwrap();

        let mut dest = connector(IsolatedWriter::new("/bin/true"));
        dest.initialize().await.unwrap();
        let docs: Vec<Box<dyn IngestDoc>> = vec![Box::new(doc)];
        let err = dest.write(&docs).await.unwrap_err();
        assert!(matches!(err, IngestError::DestinationWrite(_)));
    }
}
