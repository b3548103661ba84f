//! Remote record access: fingerprinting and reading data files.
//!
//! Documents talk to storage only through [`RecordSource`], so the fetch
//! lifecycle can be exercised against a stub that records (or forbids) any
//! remote call.

use std::fmt;
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use sha2::{Digest, Sha256};
use sluice_core::{IngestError, Result};
use tracing::debug;

/// Change-detection signal for one remote object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fingerprint {
    /// Stable for unchanged content, different after a change. Format is
    /// backend specific.
    pub version: Option<String>,
    pub exists: bool,
}

/// Read access to the data files of a source.
#[async_trait]
pub trait RecordSource: Send + Sync + fmt::Debug {
    /// Compute the content fingerprint and existence of `path`.
    async fn resolve(&self, path: &ObjectPath) -> Result<Fingerprint>;

    /// Read every record batch stored at `path`.
    async fn read(&self, path: &ObjectPath) -> Result<Vec<RecordBatch>>;
}

/// How a backend fingerprints content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FingerprintStrategy {
    /// SHA-256 of the object bytes. Used where reads are cheap (local disk,
    /// memory).
    Checksum,
    /// The provider's entity tag or object version from a HEAD request.
    VersionTag,
}

impl FingerprintStrategy {
    /// Pick the strategy for a table URL scheme.
    pub fn for_scheme(scheme: &str) -> Self {
        match scheme {
            "file" | "memory" => FingerprintStrategy::Checksum,
            _ => FingerprintStrategy::VersionTag,
        }
    }
}

/// [`RecordSource`] backed by an `object_store` backend holding Parquet files.
#[derive(Debug, Clone)]
pub struct ObjectStoreSource {
    store: Arc<dyn ObjectStore>,
    strategy: FingerprintStrategy,
}

impl ObjectStoreSource {
    pub fn new(store: Arc<dyn ObjectStore>, strategy: FingerprintStrategy) -> Self {
        Self { store, strategy }
    }

    pub fn strategy(&self) -> FingerprintStrategy {
        self.strategy
    }
}

#[async_trait]
impl RecordSource for ObjectStoreSource {
    async fn resolve(&self, path: &ObjectPath) -> Result<Fingerprint> {
        let meta = match self.store.head(path).await {
            Ok(meta) => meta,
            Err(object_store::Error::NotFound { .. }) => {
                return Ok(Fingerprint {
                    version: None,
                    exists: false,
                })
            }
            Err(e) => {
                return Err(IngestError::SourceConnectionNetwork(format!(
                    "failed to stat {}: {}",
                    path, e
                )))
            }
        };

        let version = match self.strategy {
            FingerprintStrategy::Checksum => {
                let bytes = self
                    .store
                    .get(path)
                    .await
                    .map_err(|e| {
                        IngestError::SourceConnectionNetwork(format!("failed to read {}: {}", path, e))
                    })?
                    .bytes()
                    .await
                    .map_err(|e| {
                        IngestError::SourceConnectionNetwork(format!("failed to read {}: {}", path, e))
                    })?;
                hex::encode(Sha256::digest(&bytes))
            }
            // Some providers return neither tag; size plus mtime still
            // changes on every rewrite.
            FingerprintStrategy::VersionTag => meta
                .e_tag
                .clone()
                .or_else(|| meta.version.clone())
                .unwrap_or_else(|| {
                    format!("{}-{}", meta.size, meta.last_modified.timestamp_millis())
                }),
        };

        debug!("Fingerprint for {}: {}", path, version);
        Ok(Fingerprint {
            version: Some(version),
            exists: true,
        })
    }

    async fn read(&self, path: &ObjectPath) -> Result<Vec<RecordBatch>> {
        sluice_delta::read_data_file(Arc::clone(&self.store), path)
            .await
            .map_err(|e| {
                IngestError::SourceConnectionNetwork(format!("failed to read {}: {}", path, e))
            })
    }
}
