//! Out-of-process table writes.
//!
//! The table writer runs as a child process (`sluice-delta-writer`). The
//! parent stages the batch as an Arrow IPC file, sends a [`WriteRequest`] on
//! the child's stdin and waits for it to exit. The exit status is the only
//! success signal: a child that committed and then died by a signal is still
//! reported as a failed write.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use anyhow::Context;
use arrow::ipc::reader::FileReader;
use arrow::ipc::writer::FileWriter;
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};
use sluice_core::{IngestError, Result, StorageOptions, WriteMode};
use sluice_delta::{write_table, WriteOptions, WriteOutcome};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// File name of the writer binary.
pub const WRITER_BIN: &str = "sluice-delta-writer";

/// Environment variable overriding the writer binary location.
pub const WRITER_ENV: &str = "SLUICE_DELTA_WRITER";

/// Instructions passed to the writer process on stdin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRequest {
    pub table_uri: String,
    #[serde(default)]
    pub storage_options: StorageOptions,
    /// Arrow IPC file holding the batch to write.
    pub batch_path: PathBuf,
    #[serde(default)]
    pub mode: WriteMode,
    #[serde(default)]
    pub overwrite_schema: bool,
}

impl WriteRequest {
    fn write_options(&self) -> WriteOptions {
        WriteOptions {
            mode: self.mode,
            overwrite_schema: self.overwrite_schema,
        }
    }
}

/// Perform `request` in the current process. This is the body of the
/// writer binary.
pub async fn execute_request(request: &WriteRequest) -> anyhow::Result<WriteOutcome> {
    let batch = read_staged_batch(&request.batch_path)?;
    debug!(
        "Writing {} rows from {} to {}",
        batch.num_rows(),
        request.batch_path.display(),
        request.table_uri
    );
    let outcome = write_table(
        &request.table_uri,
        &request.storage_options,
        &batch,
        request.write_options(),
    )
    .await
    .with_context(|| format!("write to {} failed", request.table_uri))?;
    Ok(outcome)
}

fn read_staged_batch(path: &Path) -> anyhow::Result<RecordBatch> {
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let reader = FileReader::try_new(file, None)?;
    let schema = reader.schema();
    let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(arrow::compute::concat_batches(&schema, &batches)?)
}

fn stage_batch(batch: &RecordBatch) -> std::io::Result<tempfile::NamedTempFile> {
    let mut staged = tempfile::Builder::new()
        .prefix("sluice-batch-")
        .suffix(".arrow")
        .tempfile()?;
    {
        let mut writer = FileWriter::try_new(staged.as_file_mut(), &batch.schema())
            .map_err(std::io::Error::other)?;
        writer.write(batch).map_err(std::io::Error::other)?;
        writer.finish().map_err(std::io::Error::other)?;
    }
    Ok(staged)
}

/// Runs table writes in a child process.
#[derive(Debug, Clone)]
pub struct IsolatedWriter {
    program: PathBuf,
}

impl IsolatedWriter {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Find the writer binary: `SLUICE_DELTA_WRITER` if set, otherwise next
    /// to the current executable.
    pub fn locate() -> Result<Self> {
        if let Ok(program) = std::env::var(WRITER_ENV) {
            return Ok(Self::new(program));
        }
        let exe = std::env::current_exe().map_err(|e| {
            IngestError::Config(format!("cannot locate current executable: {}", e))
        })?;
        let dir = exe.parent().ok_or_else(|| {
            IngestError::Config(format!("{} has no parent directory", exe.display()))
        })?;
        Ok(Self::new(
            dir.join(format!("{}{}", WRITER_BIN, std::env::consts::EXE_SUFFIX)),
        ))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Fail unless the writer binary exists.
    pub fn check(&self) -> Result<()> {
        if self.program.is_file() {
            Ok(())
        } else {
            Err(IngestError::Config(format!(
                "writer program not found at {}",
                self.program.display()
            )))
        }
    }

    /// Write `batch` into `table_uri` and wait for the child to exit.
    pub async fn run(
        &self,
        batch: &RecordBatch,
        table_uri: &str,
        storage_options: &StorageOptions,
        mode: WriteMode,
        overwrite_schema: bool,
    ) -> Result<()> {
        let staged = stage_batch(batch).map_err(|e| {
            IngestError::DestinationWrite(format!("failed to stage batch: {}", e))
        })?;
        let request = WriteRequest {
            table_uri: table_uri.to_string(),
            storage_options: storage_options.clone(),
            batch_path: staged.path().to_path_buf(),
            mode,
            overwrite_schema,
        };
        let payload = serde_json::to_vec(&request).map_err(|e| {
            IngestError::DestinationWrite(format!("failed to encode write request: {}", e))
        })?;

        let mut child = Command::new(&self.program)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                IngestError::DestinationWrite(format!(
                    "failed to spawn {}: {}",
                    self.program.display(),
                    e
                ))
            })?;
        info!(
            "Started writer process {:?} for {}",
            child.id(),
            table_uri
        );

        let sent = match child.stdin.take() {
            Some(mut stdin) => {
                let result = stdin.write_all(&payload).await;
                drop(stdin);
                result
            }
            None => Err(std::io::Error::other("child stdin unavailable")),
        };

        let status = child.wait().await.map_err(|e| {
            IngestError::DestinationWrite(format!("failed waiting for writer: {}", e))
        })?;
        drop(staged);

        if !status.success() {
            let exit = describe_exit(status);
            warn!("Writer process for {} {}", table_uri, exit);
            return Err(IngestError::DestinationWrite(format!(
                "writer for {} {}",
                table_uri, exit
            )));
        }
        if let Err(e) = sent {
            warn!("Writer exited cleanly but the request was not fully sent: {}", e);
            return Err(IngestError::DestinationWrite(format!(
                "failed to send write request: {}",
                e
            )));
        }
        info!("Writer process for {} exited successfully", table_uri);
        Ok(())
    }
}

fn describe_exit(status: ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("was terminated by signal {}", signal);
        }
    }
    match status.code() {
        Some(code) => format!("exited with status {}", code),
        None => "exited abnormally".to_string(),
    }
}
