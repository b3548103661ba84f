//! Storage options passed opaquely to the object-store backend.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::IngestError;

/// String-to-string options for the storage backend (credentials, region,
/// endpoint, ...).
///
/// Values often carry secrets, so `Debug` output only lists the keys.
/// Deserializes from either a map or a `key1=val1,key2=val2` string.
#[derive(Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct StorageOptions(BTreeMap<String, String>);

impl StorageOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Debug for StorageOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.0.keys().map(|k| (k, "***")))
            .finish()
    }
}

impl FromStr for StorageOptions {
    type Err = IngestError;

    /// Parse `key1=val1,key2=val2`. Keys and values are trimmed; the value
    /// keeps everything after the first `=`. An empty string yields no options.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut options = BTreeMap::new();
        if s.trim().is_empty() {
            return Ok(Self(options));
        }
        for entry in s.split(',') {
            let (key, value) = entry.split_once('=').ok_or_else(|| {
                IngestError::Config(format!(
                    "malformed storage option '{}': expected key=value",
                    entry.trim()
                ))
            })?;
            let key = key.trim();
            if key.is_empty() {
                return Err(IngestError::Config(format!(
                    "malformed storage option '{}': empty key",
                    entry.trim()
                )));
            }
            options.insert(key.to_string(), value.trim().to_string());
        }
        Ok(Self(options))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for StorageOptions {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl<'de> Deserialize<'de> for StorageOptions {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Map(BTreeMap<String, String>),
            Delimited(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Map(map) => Ok(Self(map)),
            Raw::Delimited(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}
