mod common;

use std::fs;
use std::time::Duration;

use common::{EngineHarness, ScriptedTransform};
use dropmark::frontend::DropWatcher;
use dropmark::ledger::LedgerStatus;
use dropmark::shutdown::shutdown_channel;

async fn wait_for_file(path: &std::path::Path, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if path.exists() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    path.exists()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_watcher_processes_existing_and_new_files() {
    let harness = EngineHarness::new(ScriptedTransform::succeeding());
    harness.drop_file("20251104_0900_before.mp4", b"already here");
    fs::create_dir_all(harness.drop_dir().join("nested")).unwrap();

    let watcher =
        DropWatcher::start(&harness.drop_dir(), true, Some(Duration::from_millis(500))).unwrap();
    let (stop, signal) = shutdown_channel();

    let output_dir = harness.output_dir();
    let nested = harness.drop_dir().join("nested").join("20251104_1000_after.mp4");
    let scenario = async {
        let first =
            wait_for_file(&output_dir.join("wr_20251104_0900.mp4"), Duration::from_secs(10)).await;
        fs::write(&nested, b"arrived later").unwrap();
        let second =
            wait_for_file(&output_dir.join("wr_20251104_1000.mp4"), Duration::from_secs(10)).await;
        stop.trigger();
        (first, second)
    };

    let (result, (first, second)) = tokio::join!(watcher.run(&harness.engine, signal), scenario);
    result.unwrap();
    assert!(first, "startup enumeration should pick up existing files");
    assert!(second, "new files in subdirectories should be picked up");

    harness.engine.wait_idle().await;
    let done = harness.ledger().list_by_status(LedgerStatus::Done).unwrap();
    assert_eq!(done.len(), 2);
    assert_eq!(harness.transform.calls(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_watcher_ignores_unrelated_files() {
    let harness = EngineHarness::new(ScriptedTransform::succeeding());
    let watcher = DropWatcher::start(&harness.drop_dir(), false, None).unwrap();
    let (stop, signal) = shutdown_channel();

    let drop_dir = harness.drop_dir();
    let scenario = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        fs::write(drop_dir.join("notes.txt"), b"hello").unwrap();
        fs::write(drop_dir.join("holiday.mp4"), b"video").unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        stop.trigger();
    };

    let (result, ()) = tokio::join!(watcher.run(&harness.engine, signal), scenario);
    result.unwrap();
    harness.engine.wait_idle().await;

    assert!(harness.ledger().entries().unwrap().is_empty());
    assert_eq!(harness.transform.calls(), 0);
}

#[tokio::test]
async fn test_watcher_stops_promptly_on_shutdown() {
    let harness = EngineHarness::new(ScriptedTransform::succeeding());
    let watcher =
        DropWatcher::start(&harness.drop_dir(), true, Some(Duration::from_secs(30))).unwrap();
    let (stop, signal) = shutdown_channel();
    stop.trigger();

    let result =
        tokio::time::timeout(Duration::from_secs(2), watcher.run(&harness.engine, signal)).await;
    assert!(matches!(result, Ok(Ok(()))));
}
