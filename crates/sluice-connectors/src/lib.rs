//! Sluice Connectors - source and destination adapters
//!
//! This crate provides the document lifecycle around Delta-style tables:
//! - `DeltaTableSourceConnector`: one ingest document per data file of a snapshot
//! - `DeltaTableDestinationConnector`: process-isolated table writes
//! - `Runner`: fetch, normalize, write and clean up a whole source

pub mod cache;
pub mod delta_destination;
pub mod delta_source;
pub mod isolated;
pub mod normalize;
pub mod resolver;
pub mod runner;

pub use delta_destination::{DeltaTableDestinationConnector, DeltaTableWriteConfig, DestinationState};
pub use delta_source::{DeltaTableConfig, DeltaTableIngestDoc, DeltaTableSourceConnector};
pub use isolated::{IsolatedWriter, WriteRequest};
pub use resolver::{Fingerprint, FingerprintStrategy, ObjectStoreSource, RecordSource};
pub use runner::{RunSummary, Runner};

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;
use sluice_core::{Result, SourceMetadata};

/// Result of [`IngestDoc::fetch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The cache file was already present; nothing remote was touched.
    Skipped,
    /// The remote content was read and cached.
    Fetched { rows: usize },
}

/// One fetchable unit of a source, with its own cache and output files.
#[async_trait]
pub trait IngestDoc: Send + Sync + fmt::Debug {
    /// Stable identity derived from the remote path, never from content.
    fn doc_id(&self) -> &str;

    /// Local cache file written by [`IngestDoc::fetch`].
    fn cache_path(&self) -> &Path;

    /// Normalized per-document output read back by destinations.
    fn output_path(&self) -> &Path;

    /// Provenance from the most recent fetch, if any.
    fn source_metadata(&self) -> Option<&SourceMetadata>;

    /// Compute fresh provenance for the remote record.
    async fn resolve_metadata(&self) -> Result<SourceMetadata>;

    /// Fetch the remote record into the cache, or skip on a cache hit.
    async fn fetch(&mut self) -> Result<FetchOutcome>;

    /// Remove the cache file unless downloads are preserved.
    fn cleanup_file(&self) -> Result<()>;

    /// Remove the output file once a destination consumed it.
    fn cleanup_output(&self) -> Result<()>;
}

/// Enumerates the ingest documents of a logical source.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Liveness check with no side effects.
    async fn check_connection(&self) -> Result<()>;

    /// Open the source and validate it holds data.
    async fn initialize(&mut self) -> Result<()>;

    /// One document per record path of the snapshot taken by `initialize`.
    fn get_ingest_docs(&self) -> Result<Vec<Box<dyn IngestDoc>>>;

    /// Remove empty local directories left by the run.
    fn cleanup(&self) -> Result<()>;
}

/// Durable sink for converted records.
#[async_trait]
pub trait DestinationConnector: Send + Sync {
    async fn check_connection(&self) -> Result<()>;

    async fn initialize(&mut self) -> Result<()>;

    /// Convert `records` and write them as one all-or-nothing attempt.
    async fn write_dict(&mut self, records: Vec<Value>) -> Result<()>;

    /// Read back each document's output and write the union.
    async fn write(&mut self, docs: &[Box<dyn IngestDoc>]) -> Result<()>;
}
