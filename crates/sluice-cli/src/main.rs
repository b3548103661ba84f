//! Sluice CLI - run ingestion pipelines from the command line

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use sluice_connectors::{
    DeltaTableConfig, DeltaTableDestinationConnector, DeltaTableSourceConnector,
    DeltaTableWriteConfig, DestinationConnector, IsolatedWriter, Runner,
};
use sluice_core::{ProcessorConfig, ReadConfig, SourceLocator, StorageOptions, WriteMode};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "sluice")]
#[command(about = "Fetch, normalize and write tabular documents")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true, env = "SLUICE_VERBOSE")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest the data files of a Delta table
    DeltaTable {
        #[command(flatten)]
        source: SourceArgs,

        #[command(flatten)]
        read: ReadArgs,

        #[command(flatten)]
        processor: ProcessorArgs,

        #[command(flatten)]
        destination: DestinationArgs,
    },
}

#[derive(Args)]
struct SourceArgs {
    /// URI of the source table (local path, s3://, gs://, az://)
    #[arg(long, env = "SLUICE_TABLE_URI")]
    table_uri: String,

    /// Table version to read; latest if omitted
    #[arg(long)]
    table_version: Option<i64>,

    /// Backend options as key=value pairs, comma separated
    #[arg(long, value_parser = parse_storage_options)]
    storage_options: Option<StorageOptions>,

    /// Load the snapshot without tracking data files
    #[arg(long)]
    without_files: bool,
}

#[derive(Args)]
struct ReadArgs {
    /// Directory for cached source files
    #[arg(long)]
    download_dir: Option<PathBuf>,

    /// Fetch documents even when a cached copy exists
    #[arg(long)]
    re_download: bool,

    /// Keep cached files after the run
    #[arg(long)]
    preserve_downloads: bool,

    /// Stop after fetching
    #[arg(long)]
    download_only: bool,
}

#[derive(Args)]
struct ProcessorArgs {
    /// Directory for normalized per-document output
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Documents processed concurrently
    #[arg(long)]
    num_processes: Option<usize>,

    /// Rebuild outputs that already exist
    #[arg(long)]
    reprocess: bool,
}

#[derive(Args)]
struct DestinationArgs {
    /// URI of the destination table; outputs are left on disk if omitted
    #[arg(long)]
    dest_table_uri: Option<String>,

    /// Destination backend options as key=value pairs, comma separated
    #[arg(long, value_parser = parse_storage_options)]
    dest_storage_options: Option<StorageOptions>,

    /// error | append | overwrite | ignore
    #[arg(long, default_value = "error", value_parser = parse_write_mode)]
    mode: WriteMode,

    /// Drop columns that are empty in every record
    #[arg(long)]
    drop_empty_cols: bool,

    /// Allow overwrite to change the table schema
    #[arg(long)]
    overwrite_schema: bool,

    /// Path to the sluice-delta-writer binary
    #[arg(long, env = "SLUICE_DELTA_WRITER")]
    writer_program: Option<PathBuf>,
}

fn parse_storage_options(s: &str) -> Result<StorageOptions, String> {
    s.parse().map_err(|e: sluice_core::IngestError| e.to_string())
}

fn parse_write_mode(s: &str) -> Result<WriteMode, String> {
    s.parse().map_err(|e: sluice_core::IngestError| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::DeltaTable {
            source,
            read,
            processor,
            destination,
        } => run_delta_table(cli.verbose, source, read, processor, destination).await?,
    }

    Ok(())
}

async fn run_delta_table(
    verbose: bool,
    source: SourceArgs,
    read: ReadArgs,
    processor: ProcessorArgs,
    destination: DestinationArgs,
) -> Result<()> {
    let mut read_config = ReadConfig::from_env()?;
    if let Some(dir) = read.download_dir {
        read_config.download_dir = dir;
    }
    read_config.re_download |= read.re_download;
    read_config.preserve_downloads |= read.preserve_downloads;
    read_config.download_only |= read.download_only;

    let mut processor_config = ProcessorConfig::from_env()?;
    if let Some(dir) = processor.output_dir {
        processor_config.output_dir = dir;
    }
    if let Some(n) = processor.num_processes {
        anyhow::ensure!(n > 0, "--num-processes must be at least 1");
        processor_config.num_processes = n;
    }
    processor_config.reprocess |= processor.reprocess;
    processor_config.verbose |= verbose;

    let mut locator = SourceLocator::new(&source.table_uri)
        .with_storage_options(source.storage_options.unwrap_or_default());
    if let Some(version) = source.table_version {
        locator = locator.with_version(version);
    }
    let config = DeltaTableConfig {
        locator,
        without_files: source.without_files,
    };
    info!(
        "Ingesting {} into {}",
        source.table_uri,
        processor_config.output_dir.display()
    );

    let mut source_connector =
        DeltaTableSourceConnector::new(config, read_config.clone(), processor_config.clone());

    let mut dest_connector = match destination.dest_table_uri {
        Some(uri) => {
            let writer = match destination.writer_program {
                Some(program) => IsolatedWriter::new(program),
                None => IsolatedWriter::locate()?,
            };
            let write_config = DeltaTableWriteConfig {
                drop_empty_cols: destination.drop_empty_cols,
                overwrite_schema: destination.overwrite_schema,
                mode: destination.mode,
            };
            Some(DeltaTableDestinationConnector::new(
                uri,
                destination.dest_storage_options.unwrap_or_default(),
                write_config,
                writer,
            ))
        }
        None => None,
    };

    let runner = Runner::new(read_config, processor_config);
    let summary = runner
        .run(
            &mut source_connector,
            dest_connector
                .as_mut()
                .map(|d| d as &mut dyn DestinationConnector),
        )
        .await
        .with_context(|| format!("ingest of {} failed", source.table_uri))?;

    println!(
        "{}",
        serde_json::json!({
            "documents": summary.documents,
            "fetched": summary.fetched,
            "skipped": summary.skipped,
            "normalized": summary.normalized,
            "written": summary.written,
        })
    );
    Ok(())
}
