//! Table snapshots: replay of the transaction log up to a version.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use parquet::arrow::async_reader::{ParquetObjectReader, ParquetRecordBatchStreamBuilder};
use sluice_core::StorageOptions;
use tracing::{debug, info, warn};

use crate::action::{commit_file_name, parse_commit_version, Action, Add, Metadata, Protocol, StructType};
use crate::checkpoint::{parse_checkpoint_file, read_last_checkpoint, LAST_CHECKPOINT};
use crate::error::{DeltaError, DeltaResult};
use crate::store::TableStore;

/// Options controlling how a snapshot is loaded.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Snapshot version; `None` loads the latest commit.
    pub version: Option<i64>,
    /// Skip tracking data files. Metadata is still available but the
    /// snapshot enumerates no files.
    pub without_files: bool,
}

/// A table snapshot at a fixed version.
///
/// Read-only once loaded; share it behind an `Arc` across workers.
#[derive(Debug, Clone)]
pub struct DeltaTable {
    store: TableStore,
    version: i64,
    protocol: Option<Protocol>,
    metadata: Metadata,
    files: Vec<Add>,
    without_files: bool,
}

impl DeltaTable {
    /// Open `uri` with the given storage options.
    pub async fn open(
        uri: &str,
        options: &StorageOptions,
        load: LoadOptions,
    ) -> DeltaResult<Self> {
        let store = TableStore::open(uri, options)?;
        Self::load(store, load).await
    }

    /// Replay the log found in `store`.
    ///
    /// Starts from the newest complete checkpoint at or below the target
    /// version, then applies the JSON commits after it. Without a usable
    /// checkpoint the commits must be contiguous from version 0.
    pub async fn load(store: TableStore, load: LoadOptions) -> DeltaResult<Self> {
        let listing = match load.version {
            None => list_from_last_checkpoint(&store).await?,
            Some(_) => None,
        };
        let listing = match listing {
            Some(listing) => listing,
            None => LogListing::list(&store, None).await?,
        };
        let latest = match listing.latest() {
            Some(v) => v,
            None => return Err(DeltaError::TableNotFound(store.uri().to_string())),
        };

        let target = load.version.unwrap_or(latest);
        if target < 0 || target > latest {
            return Err(DeltaError::VersionNotFound {
                version: target,
                latest,
            });
        }

        let mut replay = Replay::new(load.without_files);
        let mut next = 0;
        if let Some((version, parts)) = listing.checkpoint_at_or_before(target) {
            debug!("Replaying {} from checkpoint {}", store.uri(), version);
            for action in crate::checkpoint::read_checkpoint(&store, parts).await? {
                replay.apply(action);
            }
            next = version + 1;
        }

        for version in next..=target {
            if !listing.has_commit(version) {
                return Err(DeltaError::InvalidLog(format!(
                    "missing commit {} and no checkpoint covers it",
                    version
                )));
            }
            for action in read_commit(&store, version).await? {
                replay.apply(action);
            }
        }

        let metadata = replay.metadata.take().ok_or_else(|| {
            DeltaError::InvalidLog(format!("no metaData action up to version {}", target))
        })?;
        let protocol = replay.protocol.take();
        ensure_readable(protocol.as_ref(), &metadata)?;
        let files = replay.into_files();

        debug!(
            "Loaded table {} at version {} ({} files)",
            store.uri(),
            target,
            files.len()
        );

        Ok(Self {
            store,
            version: target,
            protocol,
            metadata,
            files,
            without_files: load.without_files,
        })
    }

    pub fn uri(&self) -> &str {
        self.store.uri()
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn protocol(&self) -> Option<&Protocol> {
        self.protocol.as_ref()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn schema(&self) -> DeltaResult<StructType> {
        self.metadata.schema()
    }

    pub fn table_store(&self) -> &TableStore {
        &self.store
    }

    pub fn object_store(&self) -> Arc<dyn ObjectStore> {
        self.store.store()
    }

    /// When the table was created, from `metaData.createdTime`.
    pub fn created_time(&self) -> Option<DateTime<Utc>> {
        self.metadata
            .created_time
            .and_then(DateTime::from_timestamp_millis)
    }

    /// Active `add` actions in log order.
    pub fn add_actions(&self) -> &[Add] {
        &self.files
    }

    /// Fully qualified URIs of the active data files, in log order.
    pub fn file_uris(&self) -> Vec<String> {
        self.files
            .iter()
            .map(|add| self.store.full_uri(&add.path))
            .collect()
    }

    /// Object path of a data file, from its (URL-encoded) log path.
    pub fn object_path(&self, relative: &str) -> DeltaResult<ObjectPath> {
        self.store.object_path(relative)
    }

    /// Total rows across active data files.
    ///
    /// Uses `numRecords` statistics where the log carries them and reads the
    /// Parquet footer otherwise. A snapshot loaded `without_files` reports 0.
    pub async fn count_rows(&self) -> DeltaResult<u64> {
        if self.without_files {
            return Ok(0);
        }
        let mut total = 0u64;
        for add in &self.files {
            let rows = match add.num_records() {
                Some(n) => n.max(0) as u64,
                None => self.footer_rows(&add.path).await?,
            };
            total += rows;
        }
        info!(
            "Table {} version {}: {} rows in {} files",
            self.uri(),
            self.version,
            total,
            self.files.len()
        );
        Ok(total)
    }

    async fn footer_rows(&self, relative: &str) -> DeltaResult<u64> {
        let store = self.object_store();
        let meta = store.head(&self.object_path(relative)?).await?;
        let reader = ParquetObjectReader::new(store, meta);
        let builder = ParquetRecordBatchStreamBuilder::new(reader).await?;
        Ok(builder.metadata().file_metadata().num_rows().max(0) as u64)
    }
}

/// Reader features this crate honours. Anything else changes how data files
/// must be read (deletion vectors, column mapping with physical names, ...).
const READER_FEATURES: [&str; 2] = ["timestampNtz", "vacuumProtocolCheck"];

fn ensure_readable(protocol: Option<&Protocol>, metadata: &Metadata) -> DeltaResult<()> {
    let Some(protocol) = protocol else {
        return Ok(());
    };
    let column_mapping = metadata
        .configuration
        .get("delta.columnMapping.mode")
        .cloned()
        .flatten()
        .filter(|mode| mode != "none");

    match protocol.min_reader_version {
        v if v <= 1 => Ok(()),
        2 => match column_mapping {
            None => Ok(()),
            Some(mode) => Err(DeltaError::UnsupportedProtocol(format!(
                "column mapping mode '{}'",
                mode
            ))),
        },
        3 => {
            let unsupported: Vec<&str> = protocol
                .reader_features
                .iter()
                .flatten()
                .map(String::as_str)
                .filter(|feature| {
                    !READER_FEATURES.contains(feature)
                        && !(*feature == "columnMapping" && column_mapping.is_none())
                })
                .collect();
            if unsupported.is_empty() {
                Ok(())
            } else {
                Err(DeltaError::UnsupportedProtocol(format!(
                    "reader features {:?}",
                    unsupported
                )))
            }
        }
        v => Err(DeltaError::UnsupportedProtocol(format!(
            "reader version {}",
            v
        ))),
    }
}

/// Snapshot state accumulated while replaying actions in log order.
struct Replay {
    without_files: bool,
    protocol: Option<Protocol>,
    metadata: Option<Metadata>,
    /// Active files in order of their latest add; removed slots are `None`.
    files: Vec<Option<Add>>,
    index: HashMap<String, usize>,
}

impl Replay {
    fn new(without_files: bool) -> Self {
        Self {
            without_files,
            protocol: None,
            metadata: None,
            files: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn apply(&mut self, action: Action) {
        match action {
            Action::Protocol(p) => self.protocol = Some(p),
            Action::MetaData(m) => self.metadata = Some(m),
            Action::Add(add) if !self.without_files => {
                if let Some(i) = self.index.insert(add.path.clone(), self.files.len()) {
                    self.files[i] = None;
                }
                self.files.push(Some(add));
            }
            Action::Remove(remove) if !self.without_files => {
                if let Some(i) = self.index.remove(&remove.path) {
                    self.files[i] = None;
                }
            }
            _ => {}
        }
    }

    fn into_files(self) -> Vec<Add> {
        self.files.into_iter().flatten().collect()
    }
}

/// Commits and complete checkpoints found under `_delta_log/`.
#[derive(Debug, Default)]
struct LogListing {
    commits: BTreeSet<i64>,
    /// Complete checkpoints by version, part files in part order.
    checkpoints: BTreeMap<i64, Vec<ObjectPath>>,
}

impl LogListing {
    /// List the log, starting after `offset` when given.
    async fn list(store: &TableStore, offset: Option<&ObjectPath>) -> DeltaResult<Self> {
        let log_dir = store.log_dir();
        let object_store = store.store();
        let mut entries = match offset {
            Some(offset) => object_store.list_with_offset(Some(&log_dir), offset),
            None => object_store.list(Some(&log_dir)),
        };

        let mut listing = Self::default();
        // (version, parts) -> part number -> path
        let mut parts: BTreeMap<(i64, u32), BTreeMap<u32, ObjectPath>> = BTreeMap::new();
        while let Some(item) = entries.next().await {
            let meta = match item {
                Ok(meta) => meta,
                Err(object_store::Error::NotFound { .. }) => break,
                Err(e) => return Err(e.into()),
            };
            let Some(name) = meta.location.filename() else {
                continue;
            };
            if let Some(version) = parse_commit_version(name) {
                listing.commits.insert(version);
            } else if let Some(file) = parse_checkpoint_file(name) {
                parts
                    .entry((file.version, file.parts))
                    .or_default()
                    .insert(file.part, meta.location.clone());
            }
        }

        for ((version, count), found) in parts {
            if found.len() == count as usize {
                listing
                    .checkpoints
                    .entry(version)
                    .or_insert_with(|| found.into_values().collect());
            } else {
                debug!(
                    "Ignoring incomplete checkpoint {} ({} of {} parts)",
                    version,
                    found.len(),
                    count
                );
            }
        }
        Ok(listing)
    }

    fn latest(&self) -> Option<i64> {
        let commit = self.commits.last().copied();
        let checkpoint = self.checkpoints.keys().next_back().copied();
        commit.max(checkpoint)
    }

    fn has_commit(&self, version: i64) -> bool {
        self.commits.contains(&version)
    }

    fn checkpoint_at_or_before(&self, version: i64) -> Option<(i64, &[ObjectPath])> {
        self.checkpoints
            .range(..=version)
            .next_back()
            .map(|(v, parts)| (*v, parts.as_slice()))
    }
}

/// Listing of the log from the checkpoint named in `_last_checkpoint`, or
/// `None` when there is no pointer or it does not lead to a complete
/// checkpoint.
async fn list_from_last_checkpoint(store: &TableStore) -> DeltaResult<Option<LogListing>> {
    let Some(last) = read_last_checkpoint(store).await? else {
        return Ok(None);
    };
    // Entries sorting after the bare zero-padded version: its checkpoint
    // files and every later commit.
    let offset = store.log_file(&format!("{:020}", last.version));
    let listing = LogListing::list(store, Some(&offset)).await?;
    if listing.checkpoints.contains_key(&last.version) {
        Ok(Some(listing))
    } else {
        warn!(
            "{} in {} names version {} but no complete checkpoint was found",
            LAST_CHECKPOINT,
            store.uri(),
            last.version
        );
        Ok(None)
    }
}

async fn read_commit(store: &TableStore, version: i64) -> DeltaResult<Vec<Action>> {
    let path = store.log_file(&commit_file_name(version));
    let bytes = store.store().get(&path).await?.bytes().await?;
    let text = std::str::from_utf8(&bytes).map_err(|e| {
        DeltaError::InvalidLog(format!("commit {} is not valid UTF-8: {}", version, e))
    })?;

    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(Action::from_line)
        .filter_map(|parsed| parsed.transpose())
        .collect()
}

/// Read every record batch of a data file.
pub async fn read_data_file(
    store: Arc<dyn ObjectStore>,
    path: &ObjectPath,
) -> DeltaResult<Vec<arrow::record_batch::RecordBatch>> {
    let meta = store.head(path).await?;
    let reader = ParquetObjectReader::new(store, meta);
    let stream = ParquetRecordBatchStreamBuilder::new(reader).await?.build()?;
    Ok(stream.try_collect::<Vec<_>>().await?)
}
