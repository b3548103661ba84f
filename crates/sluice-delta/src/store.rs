//! Object-store construction for table URIs.
//!
//! Accepts URLs (`s3://`, `gs://`, `az://`, `file://`, `memory://`) and plain
//! local paths. Storage options are handed to the backend builder unchanged.

use std::path::Path;
use std::sync::Arc;

use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use sluice_core::StorageOptions;
use url::Url;

use crate::action::LOG_DIR;
use crate::error::{DeltaError, DeltaResult};

/// An object store rooted at a table directory.
#[derive(Debug, Clone)]
pub struct TableStore {
    uri: String,
    store: Arc<dyn ObjectStore>,
    root: ObjectPath,
}

impl TableStore {
    /// Build the backend for `uri`.
    pub fn open(uri: &str, options: &StorageOptions) -> DeltaResult<Self> {
        let url = table_url(uri)?;
        let (store, root) = object_store::parse_url_opts(&url, options.iter())?;
        Ok(Self {
            uri: uri.trim_end_matches('/').to_string(),
            store: Arc::from(store),
            root,
        })
    }

    /// Wrap an existing store, rooted at `root`. Used when the caller already
    /// holds a backend (e.g. an in-memory store).
    pub fn from_parts(uri: &str, store: Arc<dyn ObjectStore>, root: ObjectPath) -> Self {
        Self {
            uri: uri.trim_end_matches('/').to_string(),
            store,
            root,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn store(&self) -> Arc<dyn ObjectStore> {
        Arc::clone(&self.store)
    }

    pub fn root(&self) -> &ObjectPath {
        &self.root
    }

    /// Object path for a table-relative path as it appears in the log, such
    /// as `part-0.parquet` or `date=2024-01-01%2000%253A00/part-0.parquet`.
    ///
    /// Log paths are URL-encoded and are decoded exactly once.
    pub fn object_path(&self, relative: &str) -> DeltaResult<ObjectPath> {
        let decoded = ObjectPath::from_url_path(relative.trim_start_matches('/')).map_err(|e| {
            DeltaError::InvalidLog(format!("invalid data file path '{}': {}", relative, e))
        })?;
        Ok(self.root.parts().chain(decoded.parts()).collect())
    }

    /// The `_delta_log/` directory.
    pub fn log_dir(&self) -> ObjectPath {
        self.root.child(LOG_DIR)
    }

    /// A file inside `_delta_log/`.
    pub fn log_file(&self, name: &str) -> ObjectPath {
        self.log_dir().child(name)
    }

    /// Fully qualified URI for a table-relative path.
    pub fn full_uri(&self, relative: &str) -> String {
        format!("{}/{}", self.uri, relative.trim_start_matches('/'))
    }
}

/// Turn a table URI or local path into a URL understood by `object_store`.
pub fn table_url(uri: &str) -> DeltaResult<Url> {
    let invalid = |reason: String| DeltaError::InvalidUri {
        uri: uri.to_string(),
        reason,
    };

    if uri.trim().is_empty() {
        return Err(invalid("empty URI".to_string()));
    }

    if uri.contains("://") {
        return Url::parse(uri).map_err(|e| invalid(e.to_string()));
    }

    let path = Path::new(uri);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|e| invalid(format!("cannot resolve relative path: {}", e)))?
            .join(path)
    };
    Url::from_directory_path(&absolute)
        .map_err(|_| invalid("cannot convert local path to URL".to_string()))
}
