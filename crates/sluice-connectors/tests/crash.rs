//! The writer process commits and then aborts. The caller must see a failed
//! write even though the table holds the new version.
#![cfg(unix)]

mod common;

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use serde_json::json;
use sluice_connectors::{
    DeltaTableDestinationConnector, DeltaTableWriteConfig, DestinationConnector, DestinationState,
    IsolatedWriter,
};
use sluice_core::{IngestError, StorageOptions, WriteMode};
use tempfile::TempDir;

fn aborting_writer(dir: &Path) -> IsolatedWriter {
    let script = dir.join("aborting-writer.sh");
    std::fs::write(
        &script,
        format!(
            "#!/bin/sh\n\"{}\" \"$@\" || exit $?\nkill -ABRT $$\n",
            env!("CARGO_BIN_EXE_sluice-delta-writer")
        ),
    )
    .unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    IsolatedWriter::new(script)
}

#[tokio::test]
async fn test_abort_after_commit_is_reported_as_failure() {
    let dir = TempDir::new().unwrap();
    let dest_uri = common::uri(&dir, "dest");

    let mut dest = DeltaTableDestinationConnector::new(
        dest_uri.clone(),
        StorageOptions::new(),
        DeltaTableWriteConfig {
            mode: WriteMode::Append,
            ..Default::default()
        },
        aborting_writer(dir.path()),
    );
    dest.initialize().await.unwrap();

    let err = dest
        .write_dict(vec![json!({"a": 1}), json!({"a": 2}), json!({"a": 3})])
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::DestinationWrite(_)));
    assert!(err.to_string().contains("signal 6"), "{}", err);
    assert_eq!(dest.state(), DestinationState::Failed);

    let (table, batches) = common::read_table(&dest_uri).await;
    assert_eq!(table.version(), 0);
    assert_eq!(batches.iter().map(|b| b.num_rows()).sum::<usize>(), 3);
}
