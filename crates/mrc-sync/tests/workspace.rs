use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use mrc_adapters::load_workbook;
use mrc_core::columns;
use mrc_storage::{FileLock, LockProvider};
use mrc_sync::{ManualEntry, ManualEntryOutcome, RunOutcome, SyncConfig, Workspace};
use tempfile::{tempdir, TempDir};

fn fixture_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/workspace")
}

/// Fresh copy of the demo workspace.
fn workspace_dir() -> TempDir {
    let dir = tempdir().expect("tempdir");
    let root = fixture_root();
    fs::copy(root.join("sources.yaml"), dir.path().join("sources.yaml")).expect("copy registry");
    fs::create_dir_all(dir.path().join("sources")).expect("sources dir");
    for entry in fs::read_dir(root.join("sources")).expect("fixture sources") {
        let path = entry.expect("entry").path();
        let name = path.file_name().expect("file name");
        fs::copy(&path, dir.path().join("sources").join(name)).expect("copy workbook");
    }
    dir
}

fn config(root: &Path) -> SyncConfig {
    SyncConfig {
        workspace_root: root.to_path_buf(),
        edit_lock_wait: Duration::from_secs(5),
        batch_lock_wait: Duration::from_secs(5),
        debounce_window: Duration::ZERO,
        ..SyncConfig::default()
    }
}

fn manual(first: &str, last: &str, dob: &str) -> ManualEntry {
    ManualEntry {
        first_name: first.into(),
        last_name: last.into(),
        dob: dob.into(),
        origin: Some("Front Desk".into()),
        user: None,
    }
}

async fn rows_on_disk(root: &Path) -> usize {
    let reopened = Workspace::open(config(root)).await.expect("reopen");
    reopened.master.snapshot().await.rows.len()
}

#[tokio::test]
async fn imported_rows_survive_without_a_clean_shutdown() {
    let dir = workspace_dir();
    {
        let workspace = Workspace::open(config(dir.path())).await.expect("open");
        let summary = workspace
            .consolidator
            .run_batch_import("system")
            .await
            .completed()
            .expect("import");
        assert_eq!(summary.appended, 4);
        // Dropped here with nothing else written.
    }

    assert_eq!(rows_on_disk(dir.path()).await, 4);
    let clinic_a = load_workbook(dir.path().join("sources").join("clinic-a.json")).expect("workbook");
    assert!(clinic_a.tables[0].header().iter().any(|h| h == columns::MASTER_UUID));

    let workspace = Workspace::open(config(dir.path())).await.expect("reopen");
    let again = workspace
        .consolidator
        .run_batch_import("system")
        .await
        .completed()
        .expect("import");
    assert_eq!(again.appended, 0);
    assert_eq!(rows_on_disk(dir.path()).await, 4);
}

#[tokio::test]
async fn workspaces_on_one_directory_build_on_each_others_writes() {
    let dir = workspace_dir();
    let importer = Workspace::open(config(dir.path())).await.expect("open");
    let desk = Workspace::open(config(dir.path())).await.expect("open");

    importer
        .consolidator
        .run_batch_import("system")
        .await
        .completed()
        .expect("import");
    let added = desk
        .consolidator
        .add_manual_record(manual("Ada", "Zed", "1970-01-01"))
        .await
        .completed()
        .expect("manual entry");
    // The desk saw the four imported rows before appending.
    assert!(matches!(added, ManualEntryOutcome::Accepted { row: 6, .. }));
    assert_eq!(rows_on_disk(dir.path()).await, 5);
}

#[tokio::test]
async fn concurrent_workspaces_take_turns_on_the_lock_file() {
    let dir = workspace_dir();
    let importer = Workspace::open(config(dir.path())).await.expect("open");
    let desk = Workspace::open(config(dir.path())).await.expect("open");

    let (import, entry) = tokio::join!(
        importer.consolidator.run_batch_import("system"),
        desk.consolidator.add_manual_record(manual("Ada", "Zed", "1970-01-01")),
    );
    assert!(import.is_completed());
    assert!(entry.is_completed());
    assert_eq!(rows_on_disk(dir.path()).await, 5);
}

#[tokio::test]
async fn a_held_lock_file_blocks_other_workspaces() {
    let dir = workspace_dir();
    let workspace = Workspace::open(SyncConfig {
        batch_lock_wait: Duration::from_millis(200),
        ..config(dir.path())
    })
    .await
    .expect("open");

    let other = FileLock::new(workspace.lock_path());
    let held = other.try_acquire(Duration::from_secs(1)).await.expect("lock file");
    let blocked = workspace.consolidator.run_batch_import("system").await;
    assert!(matches!(blocked, RunOutcome::LockTimeout { .. }));
    assert_eq!(rows_on_disk(dir.path()).await, 0);

    drop(held);
    let summary = workspace
        .consolidator
        .run_batch_import("system")
        .await
        .completed()
        .expect("import");
    assert_eq!(summary.appended, 4);
}
