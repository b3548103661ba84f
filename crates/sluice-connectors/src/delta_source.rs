//! Delta table source: one ingest document per data file of a snapshot.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use object_store::path::Path as ObjectPath;
use serde::{Deserialize, Serialize};
use sluice_core::{IngestError, ProcessorConfig, ReadConfig, Result, SourceLocator, SourceMetadata};
use sluice_delta::{DeltaTable, LoadOptions};
use tracing::{debug, info, warn};

use crate::cache::{schema_path, write_cache};
use crate::resolver::{FingerprintStrategy, ObjectStoreSource, RecordSource};
use crate::{FetchOutcome, IngestDoc, SourceConnector};

/// Source configuration for a Delta table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaTableConfig {
    #[serde(flatten)]
    pub locator: SourceLocator,
    /// Open the snapshot without tracking data files.
    #[serde(default)]
    pub without_files: bool,
}

impl DeltaTableConfig {
    pub fn new(locator: SourceLocator) -> Self {
        Self {
            locator,
            without_files: false,
        }
    }

    fn load_options(&self, without_files: bool) -> LoadOptions {
        LoadOptions {
            version: self.locator.version(),
            without_files,
        }
    }
}

// ---------------------------------------------------------------------------
// Source connector
// ---------------------------------------------------------------------------

pub struct DeltaTableSourceConnector {
    config: DeltaTableConfig,
    read_config: ReadConfig,
    processor_config: ProcessorConfig,
    table: Option<Arc<DeltaTable>>,
    source: Option<Arc<dyn RecordSource>>,
}

impl DeltaTableSourceConnector {
    pub fn new(
        config: DeltaTableConfig,
        read_config: ReadConfig,
        processor_config: ProcessorConfig,
    ) -> Self {
        Self {
            config,
            read_config,
            processor_config,
            table: None,
            source: None,
        }
    }

    pub fn config(&self) -> &DeltaTableConfig {
        &self.config
    }

    /// The snapshot captured by `initialize`.
    pub fn table(&self) -> Option<&Arc<DeltaTable>> {
        self.table.as_ref()
    }

    fn uri(&self) -> &str {
        self.config.locator.table_uri()
    }

    async fn open(&self, without_files: bool) -> Result<DeltaTable> {
        DeltaTable::open(
            self.uri(),
            self.config.locator.storage_options(),
            self.config.load_options(without_files),
        )
        .await
        .map_err(|e| IngestError::unavailable(self.uri(), e))
    }
}

impl std::fmt::Debug for DeltaTableSourceConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeltaTableSourceConnector")
            .field("config", &self.config)
            .field("initialized", &self.table.is_some())
            .finish()
    }
}

#[async_trait]
impl SourceConnector for DeltaTableSourceConnector {
    async fn check_connection(&self) -> Result<()> {
        let table = self.open(true).await?;
        debug!("Connection check ok: {} at version {}", table.uri(), table.version());
        Ok(())
    }

    async fn initialize(&mut self) -> Result<()> {
        let table = self.open(self.config.without_files).await?;
        let rows = table
            .count_rows()
            .await
            .map_err(|e| IngestError::unavailable(self.uri(), e))?;
        if rows == 0 {
            return Err(IngestError::EmptySource(self.uri().to_string()));
        }
        info!("processing {} rows of data from {}", rows, self.uri());

        let scheme = sluice_delta::store::table_url(self.uri())
            .map_err(|e| IngestError::unavailable(self.uri(), e))?
            .scheme()
            .to_string();
        let strategy = FingerprintStrategy::for_scheme(&scheme);
        debug!("Using {:?} fingerprints for scheme '{}'", strategy, scheme);

        self.source = Some(Arc::new(ObjectStoreSource::new(
            table.object_store(),
            strategy,
        )));
        self.table = Some(Arc::new(table));
        Ok(())
    }

    fn get_ingest_docs(&self) -> Result<Vec<Box<dyn IngestDoc>>> {
        let (Some(table), Some(source)) = (&self.table, &self.source) else {
            return Err(IngestError::NotInitialized("delta table".to_string()));
        };

        let created = table.created_time();
        let docs = table
            .add_actions()
            .iter()
            .map(|add| {
                let location = table
                    .object_path(&add.path)
                    .map_err(|e| IngestError::unavailable(self.uri(), e))?;
                let doc = DeltaTableIngestDoc::new(
                    table.table_store().full_uri(&add.path),
                    location,
                    Arc::clone(source),
                    &self.read_config,
                    &self.processor_config,
                )
                .with_dates(
                    created,
                    DateTime::from_timestamp_millis(add.modification_time),
                );
                Ok(Box::new(doc) as Box<dyn IngestDoc>)
            })
            .collect::<Result<Vec<_>>>()?;

        for (doc_id, count) in shared_doc_ids(&docs) {
            warn!(
                "{} data files in {} share document id '{}' and one cache file; \
                 only the first fetched is kept unless re_download is set",
                count,
                self.uri(),
                doc_id
            );
        }

        info!("Found {} documents in {}", docs.len(), self.uri());
        Ok(docs)
    }

    fn cleanup(&self) -> Result<()> {
        if self.read_config.preserve_downloads || self.read_config.download_only {
            return Ok(());
        }
        remove_dir_if_empty(&self.read_config.download_dir)
    }
}

/// Document ids used by more than one document, with their counts.
fn shared_doc_ids(docs: &[Box<dyn IngestDoc>]) -> Vec<(&str, usize)> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for doc in docs {
        *counts.entry(doc.doc_id()).or_default() += 1;
    }
    counts.into_iter().filter(|(_, count)| *count > 1).collect()
}

fn remove_dir_if_empty(dir: &Path) -> Result<()> {
    let mut entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if entries.next().is_none() {
        debug!("Removing empty directory {}", dir.display());
        std::fs::remove_dir(dir)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Ingest document
// ---------------------------------------------------------------------------

/// One data file of a Delta snapshot.
#[derive(Debug)]
pub struct DeltaTableIngestDoc {
    doc_id: String,
    uri: String,
    location: ObjectPath,
    cache_path: PathBuf,
    output_path: PathBuf,
    date_created: Option<DateTime<Utc>>,
    date_modified: Option<DateTime<Utc>>,
    read_config: ReadConfig,
    source: Arc<dyn RecordSource>,
    metadata: Option<SourceMetadata>,
}

impl DeltaTableIngestDoc {
    /// `uri` names the data file; `location` is its path inside the store
    /// that `source` reads from.
    pub fn new(
        uri: impl Into<String>,
        location: ObjectPath,
        source: Arc<dyn RecordSource>,
        read_config: &ReadConfig,
        processor_config: &ProcessorConfig,
    ) -> Self {
        let uri = uri.into();
        let doc_id = uri_file_stem(&uri);
        Self {
            cache_path: read_config.download_dir.join(format!("{}.csv", doc_id)),
            output_path: processor_config.output_dir.join(format!("{}.json", doc_id)),
            doc_id,
            uri,
            location,
            date_created: None,
            date_modified: None,
            read_config: read_config.clone(),
            source,
            metadata: None,
        }
    }

    pub fn with_dates(
        mut self,
        created: Option<DateTime<Utc>>,
        modified: Option<DateTime<Utc>>,
    ) -> Self {
        self.date_created = created;
        self.date_modified = modified;
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    fn create_dirs(&self) -> std::io::Result<()> {
        for path in [&self.cache_path, &self.output_path] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(())
    }
}

/// File stem of the last path segment: `s3://b/t/part-0.parquet` -> `part-0`.
fn uri_file_stem(uri: &str) -> String {
    let basename = uri.trim_end_matches('/').rsplit('/').next().unwrap_or(uri);
    Path::new(basename)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| basename.to_string())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl IngestDoc for DeltaTableIngestDoc {
    fn doc_id(&self) -> &str {
        &self.doc_id
    }

    fn cache_path(&self) -> &Path {
        &self.cache_path
    }

    fn output_path(&self) -> &Path {
        &self.output_path
    }

    fn source_metadata(&self) -> Option<&SourceMetadata> {
        self.metadata.as_ref()
    }

    async fn resolve_metadata(&self) -> Result<SourceMetadata> {
        let fingerprint = self.source.resolve(&self.location).await?;
        Ok(SourceMetadata {
            date_created: self.date_created,
            date_modified: self.date_modified,
            version: fingerprint.version,
            source_url: self.uri.clone(),
            exists: fingerprint.exists,
        })
    }

    async fn fetch(&mut self) -> Result<FetchOutcome> {
        if !self.read_config.re_download && self.cache_path.is_file() {
            debug!("File exists: {}, skipping download", self.cache_path.display());
            return Ok(FetchOutcome::Skipped);
        }

        self.metadata = Some(self.resolve_metadata().await?);
        self.create_dirs().map_err(|e| {
            IngestError::SourceConnection(format!(
                "failed to create directories for {}: {}",
                self.doc_id, e
            ))
        })?;

        let batches = self.source.read(&self.location).await?;
        let rows = batches.iter().map(|b| b.num_rows()).sum();
        info!("writing {} rows to {}", rows, self.cache_path.display());

        write_cache(&self.cache_path, &batches).map_err(|e| {
            IngestError::SourceConnection(format!(
                "failed to write {}: {}",
                self.cache_path.display(),
                e
            ))
        })?;
        Ok(FetchOutcome::Fetched { rows })
    }

    fn cleanup_file(&self) -> Result<()> {
        if self.read_config.preserve_downloads || self.read_config.download_only {
            debug!("Keeping {}", self.cache_path.display());
            return Ok(());
        }
        remove_if_exists(&self.cache_path)?;
        remove_if_exists(&schema_path(&self.cache_path))
    }

    fn cleanup_output(&self) -> Result<()> {
        remove_if_exists(&self.output_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};
    use arrow::record_batch::RecordBatch;
    use arrow::datatypes::{DataType, Field, Schema};
    use sluice_core::{StorageOptions, WriteMode};
    use sluice_delta::{write_table, WriteOptions};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn batch(ids: &[i64]) -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, true),
            Field::new("name", DataType::Utf8, true),
        ]));
        let names: Vec<String> = ids.iter().map(|i| format!("row-{}", i)).collect();
        RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(ids.to_vec())),
                Arc::new(StringArray::from(names)),
            ],
        )
        .unwrap()
    }

    async fn append(uri: &str, batch: &RecordBatch) {
        let options = WriteOptions {
            mode: WriteMode::Append,
            overwrite_schema: false,
        };
        write_table(uri, &StorageOptions::new(), batch, options)
            .await
            .unwrap();
    }

    struct Fixture {
        _dir: TempDir,
        table_uri: String,
        read_config: ReadConfig,
        processor_config: ProcessorConfig,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let table_uri = dir.path().join("table").to_string_lossy().into_owned();
        let read_config = ReadConfig {
            download_dir: dir.path().join("downloads"),
            ..Default::default()
        };
        let processor_config = ProcessorConfig {
            output_dir: dir.path().join("output"),
            ..Default::default()
        };
        Fixture {
            _dir: dir,
            table_uri,
            read_config,
            processor_config,
        }
    }

    fn connector(fx: &Fixture) -> DeltaTableSourceConnector {
        DeltaTableSourceConnector::new(
            DeltaTableConfig::new(SourceLocator::new(fx.table_uri.clone())),
            fx.read_config.clone(),
            fx.processor_config.clone(),
        )
    }

    #[test]
    fn test_uri_file_stem() {
        assert_eq!(uri_file_stem("s3://bucket/t/part-0.parquet"), "part-0");
        assert_eq!(
            uri_file_stem("/tmp/t/part-00000-abc-c000.snappy.parquet"),
            "part-00000-abc-c000.snappy"
        );
        assert_eq!(uri_file_stem("part-1"), "part-1");
    }

    #[test]
    fn test_config_accepts_storage_options_string() {
        let config: DeltaTableConfig = serde_json::from_str(
            r#"{"table_uri": "s3://bucket/t", "version": 3, "storage_options": "AWS_REGION=us-east-1, AWS_ALLOW_HTTP=true"}"#,
        )
        .unwrap();
        assert_eq!(config.locator.table_uri(), "s3://bucket/t");
        assert_eq!(config.locator.version(), Some(3));
        assert_eq!(
            config.locator.storage_options().get("AWS_REGION"),
            Some("us-east-1")
        );
        assert!(!config.without_files);
    }

    #[tokio::test]
    async fn test_initialize_missing_table_is_unavailable() {
        let fx = fixture();
        let mut source = connector(&fx);
        let err = source.initialize().await.unwrap_err();
        assert!(matches!(err, IngestError::SourceUnavailable { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_initialize_empty_table() {
        let fx = fixture();
        append(&fx.table_uri, &batch(&[])).await;

        let mut source = connector(&fx);
        let err = source.initialize().await.unwrap_err();
        assert!(matches!(err, IngestError::EmptySource(_)));
    }

    #[tokio::test]
    async fn test_without_files_reports_empty() {
        let fx = fixture();
        append(&fx.table_uri, &batch(&[1, 2])).await;

        let mut config = DeltaTableConfig::new(SourceLocator::new(fx.table_uri.clone()));
        config.without_files = true;
        let mut source =
            DeltaTableSourceConnector::new(config, fx.read_config.clone(), fx.processor_config.clone());
        assert!(source.check_connection().await.is_ok());
        let err = source.initialize().await.unwrap_err();
        assert!(matches!(err, IngestError::EmptySource(_)));
    }

    #[tokio::test]
    async fn test_get_ingest_docs_requires_initialize() {
        let fx = fixture();
        append(&fx.table_uri, &batch(&[1])).await;

        let source = connector(&fx);
        let err = source.get_ingest_docs().unwrap_err();
        assert!(matches!(err, IngestError::NotInitialized(_)));
    }

    #[tokio::test]
    async fn test_one_doc_per_data_file() {
        let fx = fixture();
        append(&fx.table_uri, &batch(&[1, 2])).await;
        append(&fx.table_uri, &batch(&[3])).await;

        let mut source = connector(&fx);
        source.initialize().await.unwrap();

        let docs = source.get_ingest_docs().unwrap();
        assert_eq!(docs.len(), 2);
        assert_ne!(docs[0].doc_id(), docs[1].doc_id());
        for doc in &docs {
            assert!(doc.cache_path().starts_with(&fx.read_config.download_dir));
            assert!(doc.output_path().starts_with(&fx.processor_config.output_dir));
            assert!(doc.source_metadata().is_none());
        }

        // Enumeration is deterministic and does not touch the filesystem.
        let again: Vec<String> = source
            .get_ingest_docs()
            .unwrap()
            .iter()
            .map(|d| d.doc_id().to_string())
            .collect();
        let first: Vec<String> = docs.iter().map(|d| d.doc_id().to_string()).collect();
        assert_eq!(first, again);
        assert!(!fx.read_config.download_dir.exists());
    }

    #[tokio::test]
    async fn test_version_pins_snapshot() {
        let fx = fixture();
        append(&fx.table_uri, &batch(&[1])).await;
        append(&fx.table_uri, &batch(&[2])).await;

        let locator = SourceLocator::new(fx.table_uri.clone()).with_version(0);
        let mut source = DeltaTableSourceConnector::new(
            DeltaTableConfig::new(locator),
            fx.read_config.clone(),
            fx.processor_config.clone(),
        );
        source.initialize().await.unwrap();
        assert_eq!(source.get_ingest_docs().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_writes_cache_and_metadata() {
        let fx = fixture();
        append(&fx.table_uri, &batch(&[1, 2, 3])).await;

        let mut source = connector(&fx);
        source.initialize().await.unwrap();
        let mut docs = source.get_ingest_docs().unwrap();
        let doc = &mut docs[0];

        assert_eq!(doc.fetch().await.unwrap(), FetchOutcome::Fetched { rows: 3 });
        let csv = std::fs::read_to_string(doc.cache_path()).unwrap();
        assert_eq!(csv.lines().next(), Some("id,name"));
        assert_eq!(csv.lines().count(), 4);
        assert!(doc.output_path().parent().unwrap().is_dir());

        let metadata = doc.source_metadata().unwrap().clone();
        assert!(metadata.exists);
        assert!(metadata.version.is_some());
        assert!(metadata.date_created.is_some());
        assert!(metadata.date_modified.is_some());
        assert!(metadata.source_url.ends_with(".parquet"));

        // Second fetch is a cache hit.
        assert_eq!(doc.fetch().await.unwrap(), FetchOutcome::Skipped);
    }

    #[tokio::test]
    async fn test_cleanup_removes_files_and_empty_dir() {
        let fx = fixture();
        append(&fx.table_uri, &batch(&[1])).await;

        let mut source = connector(&fx);
        source.initialize().await.unwrap();
        let mut docs = source.get_ingest_docs().unwrap();
        docs[0].fetch().await.unwrap();
        std::fs::write(docs[0].output_path(), "[]").unwrap();

        docs[0].cleanup_file().unwrap();
        docs[0].cleanup_output().unwrap();
        assert!(!docs[0].cache_path().exists());
        assert!(!docs[0].output_path().exists());

        source.cleanup().unwrap();
        assert!(!fx.read_config.download_dir.exists());
    }

    #[tokio::test]
    async fn test_cleanup_keeps_preserved_downloads() {
        let mut fx = fixture();
        fx.read_config.preserve_downloads = true;
        append(&fx.table_uri, &batch(&[1])).await;

        let mut source = connector(&fx);
        source.initialize().await.unwrap();
        let mut docs = source.get_ingest_docs().unwrap();
        docs[0].fetch().await.unwrap();

        docs[0].cleanup_file().unwrap();
        source.cleanup().unwrap();
        assert!(docs[0].cache_path().is_file());
    }

    // -----------------------------------------------------------------------
    // Stub sources
    // -----------------------------------------------------------------------

    /// Panics on any remote call.
    #[derive(Debug)]
    struct UnreachableSource;

    #[async_trait]
    impl RecordSource for UnreachableSource {
        async fn resolve(&self, path: &ObjectPath) -> Result<crate::Fingerprint> {
            panic!("unexpected resolve of {}", path);
        }

        async fn read(&self, path: &ObjectPath) -> Result<Vec<RecordBatch>> {
            panic!("unexpected read of {}", path);
        }
    }

    /// Counts calls and serves a fixed batch.
    #[derive(Debug, Default)]
    struct CountingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RecordSource for CountingSource {
        async fn resolve(&self, _path: &ObjectPath) -> Result<crate::Fingerprint> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(crate::Fingerprint {
                version: Some("v1".to_string()),
                exists: true,
            })
        }

        async fn read(&self, _path: &ObjectPath) -> Result<Vec<RecordBatch>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![batch(&[7, 8])])
        }
    }

    #[tokio::test]
    async fn test_cache_hit_performs_no_remote_io() {
        let fx = fixture();
        let mut doc = DeltaTableIngestDoc::new(
            "memory:///t/part-0.parquet",
            ObjectPath::from("t/part-0.parquet"),
            Arc::new(UnreachableSource),
            &fx.read_config,
            &fx.processor_config,
        );
        std::fs::create_dir_all(&fx.read_config.download_dir).unwrap();
        std::fs::write(doc.cache_path(), "id\n1\n").unwrap();

        assert_eq!(doc.fetch().await.unwrap(), FetchOutcome::Skipped);
        assert!(doc.source_metadata().is_none());
        assert_eq!(std::fs::read_to_string(doc.cache_path()).unwrap(), "id\n1\n");
    }

    #[tokio::test]
    async fn test_re_download_ignores_cache() {
        let mut fx = fixture();
        fx.read_config.re_download = true;
        let counting = Arc::new(CountingSource::default());
        let mut doc = DeltaTableIngestDoc::new(
            "memory:///t/part-0.parquet",
            ObjectPath::from("t/part-0.parquet"),
            Arc::clone(&counting) as Arc<dyn RecordSource>,
            &fx.read_config,
            &fx.processor_config,
        );
        std::fs::create_dir_all(&fx.read_config.download_dir).unwrap();
        std::fs::write(doc.cache_path(), "stale\n").unwrap();

        assert_eq!(doc.fetch().await.unwrap(), FetchOutcome::Fetched { rows: 2 });
        assert_eq!(counting.calls.load(Ordering::SeqCst), 2);
        let csv = std::fs::read_to_string(doc.cache_path()).unwrap();
        assert!(csv.starts_with("id,name\n7,row-7\n"));
        assert_eq!(doc.source_metadata().unwrap().version.as_deref(), Some("v1"));
    }

    #[tokio::test]
    async fn test_fetch_read_failure_is_retryable() {
        let fx = fixture();
        let store: Arc<dyn object_store::ObjectStore> =
            Arc::new(object_store::memory::InMemory::new());
        let mut doc = DeltaTableIngestDoc::new(
            "memory:///t/gone.parquet",
            ObjectPath::from("t/gone.parquet"),
            Arc::new(ObjectStoreSource::new(store, FingerprintStrategy::Checksum)),
            &fx.read_config,
            &fx.processor_config,
        );

        let err = doc.fetch().await.unwrap_err();
        assert!(matches!(err, IngestError::SourceConnectionNetwork(_)));
        assert!(!doc.cache_path().exists());
        let metadata = doc.source_metadata().unwrap();
        assert!(!metadata.exists);
    }

    /// Serves a fixed batch for every path.
    #[derive(Debug)]
    struct StaticSource(RecordBatch);

    #[async_trait]
    impl RecordSource for StaticSource {
        async fn resolve(&self, _path: &ObjectPath) -> Result<crate::Fingerprint> {
            Ok(crate::Fingerprint {
                version: Some("static".to_string()),
                exists: true,
            })
        }

        async fn read(&self, _path: &ObjectPath) -> Result<Vec<RecordBatch>> {
            Ok(vec![self.0.clone()])
        }
    }

    fn static_doc(fx: &Fixture, uri: &str, source: Arc<dyn RecordSource>) -> DeltaTableIngestDoc {
        DeltaTableIngestDoc::new(
            uri,
            ObjectPath::from("t/part-0.parquet"),
            source,
            &fx.read_config,
            &fx.processor_config,
        )
    }

    fn read_output(path: &Path) -> serde_json::Value {
        serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_fetched_strings_keep_their_values() {
        let fx = fixture();
        let schema = Arc::new(Schema::new(vec![
            Field::new("a", DataType::Int64, true),
            Field::new("zip", DataType::Utf8, true),
        ]));
        let zips = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![1, 2, 3, 4])),
                Arc::new(StringArray::from(vec![
                    Some("00501"),
                    Some("02134"),
                    Some(""),
                    None,
                ])),
            ],
        )
        .unwrap();
        append(&fx.table_uri, &zips).await;

        let mut source = connector(&fx);
        source.initialize().await.unwrap();
        let mut docs = source.get_ingest_docs().unwrap();
        docs[0].fetch().await.unwrap();
        crate::normalize::normalize_document(docs[0].cache_path(), docs[0].output_path())
            .unwrap();

        assert_eq!(
            read_output(docs[0].output_path()),
            serde_json::json!([
                {"a": 1, "zip": "00501"},
                {"a": 2, "zip": "02134"},
                {"a": 3, "zip": ""},
                {"a": 4}
            ])
        );

        docs[0].cleanup_file().unwrap();
        assert!(!schema_path(docs[0].cache_path()).exists());
    }

    #[tokio::test]
    async fn test_fetch_caches_list_columns_as_json() {
        use arrow::array::{Int32Array, ListArray};
        use arrow::datatypes::Int32Type;

        let fx = fixture();
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int32, true),
            Field::new(
                "tags",
                DataType::List(Arc::new(Field::new("item", DataType::Int32, true))),
                true,
            ),
        ]));
        let tags = ListArray::from_iter_primitive::<Int32Type, _, _>(vec![
            Some(vec![Some(1), Some(2)]),
            None,
        ]);
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(Int32Array::from(vec![1, 2])), Arc::new(tags)],
        )
        .unwrap();

        let mut doc = static_doc(&fx, "memory:///t/part-0.parquet", Arc::new(StaticSource(batch)));
        assert_eq!(doc.fetch().await.unwrap(), FetchOutcome::Fetched { rows: 2 });
        crate::normalize::normalize_document(doc.cache_path(), doc.output_path()).unwrap();
        assert_eq!(
            read_output(doc.output_path()),
            serde_json::json!([{"id": 1, "tags": "[1,2]"}, {"id": 2}])
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_fetches_of_one_document_leave_complete_cache() {
        let mut fx = fixture();
        fx.read_config.re_download = true;
        let ids: Vec<i64> = (0..20_000).collect();
        let source: Arc<dyn RecordSource> = Arc::new(StaticSource(batch(&ids)));

        let first = static_doc(&fx, "memory:///t/part-0.parquet", Arc::clone(&source));
        let second = static_doc(&fx, "memory:///t/part-0.parquet", Arc::clone(&source));
        assert_eq!(first.cache_path(), second.cache_path());
        let cache_path = first.cache_path().to_path_buf();

        let handles: Vec<_> = [first, second]
            .into_iter()
            .map(|mut doc| tokio::spawn(async move { doc.fetch().await }))
            .collect();
        for handle in handles {
            assert_eq!(
                handle.await.unwrap().unwrap(),
                FetchOutcome::Fetched { rows: 20_000 }
            );
        }

        let csv = std::fs::read_to_string(&cache_path).unwrap();
        assert_eq!(csv.lines().count(), 20_001);
        assert_eq!(csv.lines().last(), Some("19999,row-19999"));
        let batches = crate::cache::read_cache(&cache_path).unwrap();
        assert_eq!(batches.iter().map(|b| b.num_rows()).sum::<usize>(), 20_000);

        // Only the cache and its schema sidecar; no temporary files remain.
        let mut names: Vec<String> = std::fs::read_dir(&fx.read_config.download_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        assert_eq!(names, vec!["part-0.csv", "part-0.schema.arrow"]);
    }

    #[test]
    fn test_shared_doc_ids_reported() {
        let fx = fixture();
        let doc = |uri: &str| {
            Box::new(DeltaTableIngestDoc::new(
                uri,
                ObjectPath::from(uri.trim_start_matches("memory:///")),
                Arc::new(UnreachableSource),
                &fx.read_config,
                &fx.processor_config,
            )) as Box<dyn IngestDoc>
        };
        let docs = vec![
            doc("memory:///t/date=1/part-0.parquet"),
            doc("memory:///t/date=2/part-0.parquet"),
            doc("memory:///t/date=2/part-1.parquet"),
        ];
        assert_eq!(docs[0].cache_path(), docs[1].cache_path());
        assert_eq!(shared_doc_ids(&docs), vec![("part-0", 2)]);
        assert!(shared_doc_ids(&docs[1..]).is_empty());
    }
}
