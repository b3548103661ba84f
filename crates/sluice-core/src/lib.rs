//! Sluice Core - shared building blocks for ingest connectors
//!
//! Error taxonomy, pipeline configuration, provenance metadata, storage
//! options and the record converter used by every destination.

pub mod config;
pub mod convert;
pub mod error;
pub mod metadata;
pub mod storage;

pub use config::{ProcessorConfig, ReadConfig, WriteMode};
pub use convert::RecordConverter;
pub use error::{IngestError, Result};
pub use metadata::{SourceLocator, SourceMetadata};
pub use storage::StorageOptions;
