//! Error taxonomy shared by every connector.
//!
//! Backend errors (object store, parquet, io) are folded into one of these
//! variants at the connector boundary so callers only ever match on
//! [`IngestError`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    /// The source could not be opened at the requested version.
    #[error("source unavailable at {uri}: {reason}")]
    SourceUnavailable { uri: String, reason: String },

    /// The source opened but holds zero addressable records.
    #[error("no data found at {0}")]
    EmptySource(String),

    /// An operation that needs an initialized connector was called too early.
    #[error("{0} was never initialized")]
    NotInitialized(String),

    /// Local or otherwise non-network failure while fetching a document.
    #[error("source connection error: {0}")]
    SourceConnection(String),

    /// Network failure while reading remote content.
    #[error("source connection network error: {0}")]
    SourceConnectionNetwork(String),

    /// A record in a batch was not a key/value mapping.
    #[error("record {index} is not an object (found {found})")]
    InvalidRecordShape { index: usize, found: String },

    /// The isolated write failed or exited abnormally.
    #[error("destination write error: {0}")]
    DestinationWrite(String),

    /// Invalid or missing configuration.
    #[error("config error: {0}")]
    Config(String),

    /// Local filesystem failure outside of a fetch (normalization, cleanup).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl IngestError {
    /// Connection errors may be retried by an outer policy; everything else
    /// is fatal for the enclosing operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IngestError::SourceConnection(_) | IngestError::SourceConnectionNetwork(_)
        )
    }

    pub fn unavailable(uri: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        IngestError::SourceUnavailable {
            uri: uri.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T, E = IngestError> = std::result::Result<T, E>;
