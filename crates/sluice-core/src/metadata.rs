//! Provenance types: where a record set lives and what it looked like when fetched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::StorageOptions;

/// Identifies a logical source: a table URI, an optional version to pin the
/// snapshot, and backend options. Fields are private so a locator cannot be
/// altered after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocator {
    table_uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    version: Option<i64>,
    #[serde(default)]
    storage_options: StorageOptions,
}

impl SourceLocator {
    pub fn new(table_uri: impl Into<String>) -> Self {
        Self {
            table_uri: table_uri.into(),
            version: None,
            storage_options: StorageOptions::default(),
        }
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_storage_options(mut self, options: StorageOptions) -> Self {
        self.storage_options = options;
        self
    }

    pub fn table_uri(&self) -> &str {
        &self.table_uri
    }

    pub fn version(&self) -> Option<i64> {
        self.version
    }

    pub fn storage_options(&self) -> &StorageOptions {
        &self.storage_options
    }
}

/// Snapshot of a remote record's provenance taken during one fetch.
///
/// A later fetch produces a fresh value; nothing mutates an existing one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub date_created: Option<DateTime<Utc>>,
    pub date_modified: Option<DateTime<Utc>>,
    /// Content fingerprint: a checksum or a provider version tag. Only
    /// equality is meaningful.
    pub version: Option<String>,
    pub source_url: String,
    pub exists: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locator_builder() {
        let opts: StorageOptions = "AWS_REGION=eu-west-1".parse().unwrap();
        let locator = SourceLocator::new("s3://bucket/table")
            .with_version(3)
            .with_storage_options(opts.clone());
        assert_eq!(locator.table_uri(), "s3://bucket/table");
        assert_eq!(locator.version(), Some(3));
        assert_eq!(locator.storage_options(), &opts);
    }

    #[test]
    fn test_locator_deserialize_with_string_options() {
        let locator: SourceLocator = serde_json::from_str(
            r#"{"table_uri": "/data/t", "storage_options": "a=1,b=2"}"#,
        )
        .unwrap();
        assert_eq!(locator.version(), None);
        assert_eq!(locator.storage_options().get("b"), Some("2"));
    }

    #[test]
    fn test_metadata_serialization() {
        let meta = SourceMetadata {
            date_created: None,
            date_modified: Some(DateTime::from_timestamp_millis(1_700_000_000_000).unwrap()),
            version: Some("etag-1".to_string()),
            source_url: "s3://bucket/table/part-0.parquet".to_string(),
            exists: true,
        };
        let json = serde_json::to_string(&meta).unwrap();
        let parsed: SourceMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, meta);
    }
}
