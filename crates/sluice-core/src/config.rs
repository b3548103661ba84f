//! Pipeline configuration: where documents are cached and written, and how
//! destination writes behave.

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Settings governing the download (cache) side of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadConfig {
    /// Root directory for cached source files.
    pub download_dir: PathBuf,
    /// Fetch again even if a cache file is present.
    pub re_download: bool,
    /// Keep cache files after processing.
    pub preserve_downloads: bool,
    /// Stop after fetching; implies cache files are kept.
    pub download_only: bool,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            download_dir: PathBuf::from("./downloads"),
            re_download: false,
            preserve_downloads: false,
            download_only: false,
        }
    }
}

impl ReadConfig {
    /// Build from environment variables:
    ///   SLUICE_DOWNLOAD_DIR, SLUICE_RE_DOWNLOAD, SLUICE_PRESERVE_DOWNLOADS,
    ///   SLUICE_DOWNLOAD_ONLY
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            download_dir: std::env::var("SLUICE_DOWNLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.download_dir),
            re_download: env_flag("SLUICE_RE_DOWNLOAD")?,
            preserve_downloads: env_flag("SLUICE_PRESERVE_DOWNLOADS")?,
            download_only: env_flag("SLUICE_DOWNLOAD_ONLY")?,
        })
    }
}

/// Settings governing the processing (output) side of a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Root directory for normalized per-document output.
    pub output_dir: PathBuf,
    /// Upper bound on documents processed concurrently.
    pub num_processes: usize,
    /// Rebuild outputs even if they already exist.
    pub reprocess: bool,
    pub verbose: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./structured-output"),
            num_processes: 2,
            reprocess: false,
            verbose: false,
        }
    }
}

impl ProcessorConfig {
    /// Build from environment variables:
    ///   SLUICE_OUTPUT_DIR, SLUICE_NUM_PROCESSES, SLUICE_REPROCESS, SLUICE_VERBOSE
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let num_processes: usize = std::env::var("SLUICE_NUM_PROCESSES")
            .unwrap_or_else(|_| defaults.num_processes.to_string())
            .parse()
            .context("Invalid SLUICE_NUM_PROCESSES")?;
        anyhow::ensure!(num_processes > 0, "SLUICE_NUM_PROCESSES must be at least 1");

        Ok(Self {
            output_dir: std::env::var("SLUICE_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            num_processes,
            reprocess: env_flag("SLUICE_REPROCESS")?,
            verbose: env_flag("SLUICE_VERBOSE")?,
        })
    }
}

fn env_flag(key: &str) -> Result<bool> {
    match std::env::var(key) {
        Err(_) => Ok(false),
        Ok(v) => match v.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" | "" => Ok(false),
            other => anyhow::bail!("Invalid {}: '{}' is not a boolean", key, other),
        },
    }
}

/// How a destination write treats existing table contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Fail if the destination already holds data.
    #[default]
    Error,
    Append,
    Overwrite,
    /// Do nothing if the destination already exists.
    Ignore,
}

impl WriteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteMode::Error => "error",
            WriteMode::Append => "append",
            WriteMode::Overwrite => "overwrite",
            WriteMode::Ignore => "ignore",
        }
    }
}

impl std::fmt::Display for WriteMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WriteMode {
    type Err = crate::error::IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(WriteMode::Error),
            "append" => Ok(WriteMode::Append),
            "overwrite" => Ok(WriteMode::Overwrite),
            "ignore" => Ok(WriteMode::Ignore),
            other => Err(crate::error::IngestError::Config(format!(
                "unknown write mode '{}': expected error, append, overwrite or ignore",
                other
            ))),
        }
    }
}
