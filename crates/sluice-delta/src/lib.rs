//! Sluice Delta - transaction-log tables over object storage
//!
//! A table is a directory of Parquet data files plus a `_delta_log/` of
//! numbered JSON commits. This crate provides:
//! - snapshot loading and time travel (`DeltaTable`), from checkpoints
//!   where the log has them
//! - writes with `error` / `append` / `overwrite` / `ignore` modes
//! - object-store construction from table URIs and storage options

pub mod action;
pub mod checkpoint;
pub mod error;
pub mod store;
pub mod table;
pub mod writer;

pub use action::{Add, Metadata, StructType};
pub use checkpoint::create_checkpoint;
pub use error::{DeltaError, DeltaResult};
pub use store::TableStore;
pub use table::{read_data_file, DeltaTable, LoadOptions};
pub use writer::{write_table, write_to_store, WriteOptions, WriteOutcome};
