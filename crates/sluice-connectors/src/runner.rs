//! Drives one source through fetch, normalize, write and cleanup.

use std::path::PathBuf;

use futures::stream::{self, StreamExt};
use sluice_core::{IngestError, ProcessorConfig, ReadConfig, Result};
use tracing::{debug, error, info};

use crate::normalize::{needs_normalize, normalize_document};
use crate::{DestinationConnector, FetchOutcome, IngestDoc, SourceConnector};

/// Counts reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub documents: usize,
    pub fetched: usize,
    pub skipped: usize,
    pub normalized: usize,
    pub written: bool,
}

pub struct Runner {
    read_config: ReadConfig,
    processor_config: ProcessorConfig,
}

impl Runner {
    pub fn new(read_config: ReadConfig, processor_config: ProcessorConfig) -> Self {
        Self {
            read_config,
            processor_config,
        }
    }

    pub async fn run(
        &self,
        source: &mut dyn SourceConnector,
        mut destination: Option<&mut dyn DestinationConnector>,
    ) -> Result<RunSummary> {
        source.check_connection().await?;
        source.initialize().await?;
        if let Some(dest) = destination.as_deref_mut() {
            dest.initialize().await?;
        }

        let docs = source.get_ingest_docs()?;
        let mut summary = RunSummary {
            documents: docs.len(),
            ..Default::default()
        };

        let docs = self.fetch_all(docs, &mut summary).await?;
        info!(
            "Fetched {} documents ({} cached)",
            summary.fetched, summary.skipped
        );

        if self.read_config.download_only {
            info!("Download only, stopping after fetch");
            return Ok(summary);
        }

        summary.normalized = self.normalize_all(&docs).await?;

        if let Some(dest) = destination {
            dest.write(&docs).await?;
            summary.written = true;
            for doc in &docs {
                doc.cleanup_output()?;
            }
        }

        for doc in &docs {
            doc.cleanup_file()?;
        }
        source.cleanup()?;

        info!("Run complete: {:?}", summary);
        Ok(summary)
    }

    async fn fetch_all(
        &self,
        docs: Vec<Box<dyn IngestDoc>>,
        summary: &mut RunSummary,
    ) -> Result<Vec<Box<dyn IngestDoc>>> {
        let workers = self.processor_config.num_processes.max(1);
        let results: Vec<_> = stream::iter(docs.into_iter().map(|mut doc| {
            tokio::spawn(async move {
                let outcome = doc.fetch().await;
                (doc, outcome)
            })
        }))
        .buffered(workers)
        .collect()
        .await;

        let mut fetched = Vec::with_capacity(results.len());
        let mut first_error = None;
        for joined in results {
            let (doc, outcome) = joined.map_err(|e| {
                IngestError::SourceConnection(format!("fetch task failed: {}", e))
            })?;
            match outcome {
                Ok(FetchOutcome::Skipped) => summary.skipped += 1,
                Ok(FetchOutcome::Fetched { rows }) => {
                    debug!("Fetched {} ({} rows)", doc.doc_id(), rows);
                    summary.fetched += 1;
                }
                Err(e) => {
                    error!("Failed to fetch {}: {}", doc.doc_id(), e);
                    first_error.get_or_insert(e);
                }
            }
            fetched.push(doc);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(fetched),
        }
    }

    async fn normalize_all(&self, docs: &[Box<dyn IngestDoc>]) -> Result<usize> {
        let reprocess = self.processor_config.reprocess;
        let jobs: Vec<(PathBuf, PathBuf)> = docs
            .iter()
            .filter(|doc| {
                let pending = needs_normalize(doc.output_path(), reprocess);
                if !pending {
                    debug!("Output exists for {}, skipping", doc.doc_id());
                }
                pending
            })
            .map(|doc| (doc.cache_path().to_path_buf(), doc.output_path().to_path_buf()))
            .collect();

        let workers = self.processor_config.num_processes.max(1);
        let results: Vec<_> = stream::iter(jobs.into_iter().map(|(cache, output)| {
            tokio::task::spawn_blocking(move || normalize_document(&cache, &output))
        }))
        .buffered(workers)
        .collect()
        .await;

        let mut normalized = 0;
        for joined in results {
            joined.map_err(|e| std::io::Error::other(format!("normalize task failed: {}", e)))??;
            normalized += 1;
        }
        Ok(normalized)
    }
}
