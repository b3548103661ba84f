//! Typed errors for the table format crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeltaError {
    /// No transaction log exists under the table URI.
    #[error("table not found: {0}")]
    TableNotFound(String),

    /// The requested snapshot version is not in the log.
    #[error("version {version} not found (latest is {latest})")]
    VersionNotFound { version: i64, latest: i64 },

    /// The log exists but cannot be replayed.
    #[error("invalid transaction log: {0}")]
    InvalidLog(String),

    /// Write mode `error` against a table that already holds data.
    #[error("table already exists with data: {0}")]
    TableAlreadyExists(String),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    /// Another writer committed the same version first.
    #[error("commit conflict: version {0} was already committed")]
    CommitConflict(i64),

    /// The table needs reader features this crate does not implement.
    #[error("unsupported table protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("unsupported data type: {0}")]
    UnsupportedType(String),

    #[error("invalid table URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type DeltaResult<T> = std::result::Result<T, DeltaError>;
