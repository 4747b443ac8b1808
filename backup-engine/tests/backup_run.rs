mod common;

use backup_engine::daemon::shutdown::ShutdownCoordinator;
use backup_engine::executor::DatabaseStatus;
use backup_engine::ExitStatus;
use common::{copy_tree, FaultKind, Harness};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_second_run_uploads_nothing() {
    let h = Harness::new();
    h.write("2024/01/a.jpg", b"alpha");
    h.write("2024/01/b.jpg", b"bravo");
    h.write("c.mp4", b"charlie");

    let store = h.store();
    let first = h.run(h.config(), store.clone()).await;
    assert_eq!(first.status, ExitStatus::Success);
    assert_eq!(first.stats.uploaded, 3);
    assert_eq!(first.stats.bytes_uploaded, 17);
    assert!(h.object_exists("library/2024/01/a.jpg"));
    assert!(h.object_exists("library/c.mp4"));

    let store = h.store();
    let second = h.run(h.config(), store.clone()).await;
    assert_eq!(second.status, ExitStatus::Success);
    assert_eq!(second.stats.scanned, 3);
    assert_eq!(second.stats.uploaded, 0);
    assert_eq!(second.stats.skipped, 3);
    assert!(store.library_puts().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_modified_file_is_uploaded_again() {
    let h = Harness::new();
    h.write("a.jpg", b"one");
    h.write("b.jpg", b"two");
    h.run(h.config(), h.store()).await;
    let before = h.remote_record("a.jpg").unwrap();

    h.write("a.jpg", b"one, edited");
    let store = h.store();
    let report = h.run(h.config(), store.clone()).await;

    assert_eq!(report.stats.uploaded, 1);
    assert_eq!(report.stats.skipped, 1);
    assert_eq!(store.library_puts(), vec!["library/a.jpg".to_string()]);
    let after = h.remote_record("a.jpg").unwrap();
    assert_ne!(before.checksum, after.checksum);
    assert_eq!(after.size_bytes, 11);
    assert_eq!(
        std::fs::read(h.bucket.path().join("library/a.jpg")).unwrap(),
        b"one, edited"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_deleted_file_is_archived_not_deleted() {
    let h = Harness::new();
    h.write("keep.jpg", b"keep");
    h.write("gone.jpg", b"gone");
    h.run(h.config(), h.store()).await;

    h.remove("gone.jpg");
    let store = h.store();
    let report = h.run(h.config(), store.clone()).await;

    assert_eq!(report.status, ExitStatus::Success);
    assert_eq!(report.stats.archived, 1);
    assert!(report.reconciled);
    assert!(store.deletes().is_empty());
    assert!(h.object_exists("library/gone.jpg"));

    let record = h.remote_record("gone.jpg").unwrap();
    assert!(record.archived);
    assert_eq!(record.size_bytes, 4);
    assert!(!h.remote_record("keep.jpg").unwrap().archived);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reappeared_file_is_uploaded_and_revived() {
    let h = Harness::new();
    h.write("photo.jpg", b"original");
    h.run(h.config(), h.store()).await;
    h.remove("photo.jpg");
    h.run(h.config(), h.store()).await;
    assert!(h.remote_record("photo.jpg").unwrap().archived);

    h.write("photo.jpg", b"original");
    let store = h.store();
    let report = h.run(h.config(), store.clone()).await;

    assert_eq!(report.stats.uploaded, 1);
    assert_eq!(store.library_puts(), vec!["library/photo.jpg".to_string()]);
    assert!(!h.remote_record("photo.jpg").unwrap().archived);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transient_failures_exhaust_retries_and_mark_partial() {
    let h = Harness::new();
    h.write("ok.jpg", b"fine");
    h.write("bad.jpg", b"flaky");
    let store = h.store();
    store.fail("library/bad.jpg", FaultKind::Transient);

    let report = h.run(h.config(), store.clone()).await;

    assert_eq!(report.status, ExitStatus::Partial);
    assert_eq!(report.exit_code, 1);
    assert_eq!(report.stats.uploaded, 1);
    assert_eq!(report.stats.failed, 1);
    assert_eq!(report.failures[0].path, "bad.jpg");
    assert_eq!(store.attempts_for("library/bad.jpg"), 3);
    assert!(h.remote_record("bad.jpg").is_none());
    assert!(h.remote_record("ok.jpg").is_some());

    // The failed file is picked up by the next run.
    let report = h.run(h.config(), h.store()).await;
    assert_eq!(report.status, ExitStatus::Success);
    assert_eq!(report.stats.uploaded, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_rejected_upload_aborts_run_but_persists_catalog() {
    let h = Harness::new();
    for i in 0..5 {
        h.write(&format!("f{i}.jpg"), b"data");
    }
    let store = h.store();
    store.fail("library/f2.jpg", FaultKind::Auth);

    let report = h.run(h.config(), store.clone()).await;

    assert_eq!(report.status, ExitStatus::Fatal);
    assert_eq!(report.exit_code, 2);
    assert!(report.fatal_error.is_some());
    assert!(!report.reconciled);
    assert_eq!(store.attempts_for("library/f2.jpg"), 1);
    assert!(h.object_exists("manifest.db"));
    assert!(h.remote_record("f2.jpg").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_corrupt_catalog_is_fatal_and_touches_nothing() {
    let h = Harness::new();
    h.write("a.jpg", b"a");
    std::fs::write(h.bucket.path().join("manifest.db"), vec![7u8; 8192]).unwrap();

    let store = h.store();
    let report = h.run(h.config(), store.clone()).await;

    assert_eq!(report.status, ExitStatus::Fatal);
    assert!(store.puts().is_empty());
    assert_eq!(
        std::fs::read(h.bucket.path().join("manifest.db")).unwrap(),
        vec![7u8; 8192]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_scanner_is_throttled_by_queue_capacity() {
    let h = Harness::new();
    for i in 0..50 {
        h.write(&format!("dir{}/file{i:03}.jpg", i % 5), b"payload");
    }
    let mut config = h.config();
    config.pipeline.workers = 2;
    config.pipeline.queue_multiplier = 1;
    let capacity = config.queue_capacity() as u64;
    let workers = config.pipeline.workers as u64;

    let store = h.store();
    store.close_gate_after(0);
    let engine = Arc::new(h.engine(config, store.clone()));
    let stats = engine.stats();
    let running = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.run().await }
    });

    wait_until(|| store.waiting() == 2).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        stats.scanned() <= capacity + workers,
        "scanned {} files with capacity {} and {} workers",
        stats.scanned(),
        capacity,
        workers
    );

    store.open_gate();
    let report = running.await.unwrap();
    assert_eq!(report.status, ExitStatus::Success);
    assert_eq!(report.stats.uploaded, 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_checkpoint_lets_a_crashed_run_resume() {
    let h = Harness::new();
    for i in 0..10 {
        h.write(&format!("f{i}.jpg"), format!("content {i}").as_bytes());
    }
    let mut config = h.config();
    config.pipeline.workers = 1;
    config.pipeline.checkpoint_interval = 1;

    let store = h.store();
    store.close_gate_after(3);
    let engine = Arc::new(h.engine(config.clone(), store.clone()));
    let running = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.run().await }
    });

    // The fourth upload is stuck: the bucket now looks like a crash mid-run.
    wait_until(|| store.waiting() == 1).await;
    let crashed = Harness::new();
    copy_tree(h.bucket.path(), crashed.bucket.path());
    assert_eq!(crashed.remote_catalog().counts().unwrap().total, 3);

    let mut resumed_config = config.clone();
    resumed_config.destination.root = Some(crashed.bucket.path().to_path_buf());
    resumed_config.engine.work_dir = Some(crashed.work.path().to_path_buf());
    let resumed_store = crashed.store();
    let resumed = crashed.run(resumed_config, resumed_store.clone()).await;
    assert_eq!(resumed.status, ExitStatus::Success);
    assert_eq!(resumed.stats.skipped, 3);
    assert_eq!(resumed.stats.uploaded, 7);
    assert_eq!(resumed_store.library_puts().len(), 7);

    store.open_gate();
    assert_eq!(running.await.unwrap().status, ExitStatus::Success);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_excluded_names_are_never_uploaded() {
    let h = Harness::new();
    h.write("a.jpg", b"a");
    h.write("thumbs/a.webp", b"t");
    h.write(".DS_Store", b"x");
    let mut config = h.config();
    config.source.exclude = vec!["thumbs".into(), ".DS_Store".into()];

    let store = h.store();
    let report = h.run(config, store.clone()).await;
    assert_eq!(report.stats.uploaded, 1);
    assert_eq!(store.library_puts(), vec!["library/a.jpg".to_string()]);
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_database_dump_runs_after_files() {
    let h = Harness::new();
    h.write("a.jpg", b"a");
    let mut config = h.config();
    config.database.enabled = true;
    config.database.command = "sh".into();
    config.database.args = vec!["-c".into(), "printf 'select 1;'".into()];

    let report = h.run(config, h.store()).await;
    assert_eq!(report.status, ExitStatus::Success);
    match &report.database {
        DatabaseStatus::Succeeded { object, .. } => {
            assert!(object.ends_with("-v1.0.0-test.sql.gz"));
            assert!(h.object_exists(object));
        }
        other => panic!("unexpected database status: {other:?}"),
    }
    let catalog = h.remote_catalog();
    assert!(catalog.get_metadata("last_backup").unwrap().is_some());
    assert_eq!(
        catalog.get_metadata("app_version").unwrap().as_deref(),
        Some("v1.0.0-test")
    );
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failed_dump_is_partial_and_catalog_still_saved() {
    let h = Harness::new();
    h.write("a.jpg", b"a");
    let mut config = h.config();
    config.database.enabled = true;
    config.database.command = "sh".into();
    config.database.args = vec!["-c".into(), "echo 'no route to host' >&2; exit 1".into()];

    let report = h.run(config, h.store()).await;
    assert_eq!(report.status, ExitStatus::Partial);
    assert!(matches!(report.database, DatabaseStatus::Failed { .. }));
    assert!(h.remote_record("a.jpg").is_some());
    assert!(h.remote_catalog().get_metadata("last_backup").unwrap().is_none());
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unusual_file_names_do_not_abort_the_run() {
    let h = Harness::new();
    h.write("ok.jpg", b"fine");
    h.write("weird\\name.jpg", b"backslash");
    h.write("line\nbreak.jpg", b"newline");

    let store = h.store();
    let report = h.run(h.config(), store.clone()).await;

    assert_eq!(report.status, ExitStatus::Success);
    assert!(report.fatal_error.is_none());
    assert_eq!(report.stats.uploaded, 3);
    assert!(report.reconciled);
    assert!(h.object_exists("library/weird\\name.jpg"));
    assert!(h.object_exists("library/line\nbreak.jpg"));
    assert!(h.remote_record("line\nbreak.jpg").is_some());
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_signal_mid_run_persists_progress_and_exits_partial() {
    let h = Harness::new();
    h.write("old.jpg", b"from an earlier run");
    h.run(h.config(), h.store()).await;
    let last_clean_run = h.remote_catalog().get_metadata("last_backup").unwrap();
    assert!(last_clean_run.is_some());

    h.remove("old.jpg");
    for i in 0..10 {
        h.write(&format!("f{i:02}.jpg"), format!("content {i}").as_bytes());
    }
    let mut config = h.config();
    config.pipeline.workers = 1;
    config.database.enabled = true;
    config.database.command = "sh".into();
    config.database.args = vec!["-c".into(), "printf 'select 1;'".into()];

    let store = h.store();
    store.close_gate_after(2);
    let shutdown = ShutdownCoordinator::new(CancellationToken::new());
    let engine = Arc::new(h.engine_with_shutdown(config, store.clone(), shutdown.clone()));
    let running = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move { engine.run().await }
    });

    // Third upload is in flight when the signal arrives; it must still land.
    wait_until(|| store.waiting() == 1).await;
    shutdown.trigger("SIGTERM");
    store.open_gate();
    let report = running.await.unwrap();

    assert_eq!(report.status, ExitStatus::Partial);
    assert_eq!(report.exit_code, 1);
    assert!(report.interrupted);
    assert!(report.fatal_error.is_none());
    assert!(!report.reconciled);
    assert_eq!(report.stats.uploaded, 3);
    assert_eq!(report.database, DatabaseStatus::Skipped);
    assert!(!store.puts().iter().any(|p| p.starts_with("database/")));

    let catalog = h.remote_catalog();
    assert_eq!(catalog.counts().unwrap().total, 4);
    assert!(!catalog.get("old.jpg").unwrap().unwrap().archived);
    assert_eq!(catalog.get_metadata("last_backup").unwrap(), last_clean_run);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_final_catalog_upload_failure_is_fatal() {
    let h = Harness::new();
    h.write("a.jpg", b"a");
    let store = h.store();
    store.fail("manifest.db", FaultKind::Transient);

    let report = h.run(h.config(), store.clone()).await;

    assert_eq!(report.status, ExitStatus::Fatal);
    assert_eq!(report.exit_code, 2);
    assert!(report.fatal_error.is_some());
    assert_eq!(store.attempts_for("manifest.db"), 3);
    assert!(!h.object_exists("manifest.db"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_checkpoint_failure_aborts_the_run() {
    let h = Harness::new();
    for i in 0..6 {
        h.write(&format!("f{i}.jpg"), b"data");
    }
    let mut config = h.config();
    config.pipeline.workers = 1;
    config.pipeline.checkpoint_interval = 2;
    let store = h.store();
    store.fail("manifest.db", FaultKind::Auth);

    let report = h.run(config, store.clone()).await;

    assert_eq!(report.status, ExitStatus::Fatal);
    assert!(!report.reconciled);
    assert!(report.stats.uploaded < 6);
}
