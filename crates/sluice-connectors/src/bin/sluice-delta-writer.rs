//! sluice-delta-writer - performs one table write requested on stdin.
//!
//! Exits 0 once the write is committed (or skipped in `ignore` mode) and
//! non-zero on any error. Logs go to stderr.

use anyhow::{Context, Result};
use sluice_connectors::isolated::{execute_request, WriteRequest};
use sluice_delta::WriteOutcome;
use tokio::io::AsyncReadExt;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut input = Vec::new();
    tokio::io::stdin()
        .read_to_end(&mut input)
        .await
        .context("failed to read write request from stdin")?;
    let request: WriteRequest =
        serde_json::from_slice(&input).context("invalid write request")?;

    match execute_request(&request).await? {
        WriteOutcome::Committed { version, rows } => info!(
            "Committed {} rows as version {} of {}",
            rows, version, request.table_uri
        ),
        WriteOutcome::Skipped => info!("Table {} exists, nothing written", request.table_uri),
    }
    Ok(())
}
