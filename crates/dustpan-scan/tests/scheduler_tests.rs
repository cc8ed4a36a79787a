use std::fs;
use std::sync::Arc;

use dustpan_cache::CacheStore;
use dustpan_core::{EngineConfig, PathKey, ScanError};
use dustpan_scan::{ResultBoard, ScanEvent, ScanOutcome, ScanStatus, Scheduler};
use tempfile::TempDir;

fn create_tree() -> TempDir {
    let temp = TempDir::new().unwrap();
    fs::create_dir(temp.path().join("sub")).unwrap();
    fs::write(temp.path().join("a.txt"), vec![0u8; 100]).unwrap();
    fs::write(temp.path().join("sub/b.txt"), vec![0u8; 50]).unwrap();
    temp
}

fn open_store(dir: &TempDir) -> Arc<CacheStore> {
    Arc::new(CacheStore::open(dir.path().join("cache.db")).unwrap())
}

// The current-thread runtime does not run the spawned scan until the test
// yields, so both requests below land before the walk starts.
#[tokio::test]
async fn test_concurrent_requests_share_one_walk() {
    let temp = create_tree();
    let (scheduler, _events) = Scheduler::new(EngineConfig::default(), None).unwrap();

    let first = scheduler.request_scan(temp.path()).unwrap();
    let second = scheduler.request_scan(temp.path()).unwrap();
    assert_eq!(first.id(), second.id());

    let a = first.wait().await;
    let b = second.wait().await;
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.report().unwrap().total_size(), 150);
    assert_eq!(scheduler.stats().walks, 1);
    assert!(scheduler.in_flight().is_empty());
}

#[tokio::test]
async fn test_cancel_while_queued_finishes_without_walking() {
    let temp = create_tree();
    let (scheduler, mut events) = Scheduler::new(EngineConfig::default(), None).unwrap();

    let handle = scheduler.request_scan(temp.path()).unwrap();
    scheduler.cancel(&handle);

    let outcome = handle.wait().await;
    assert!(matches!(&*outcome, ScanOutcome::Cancelled { partial: None }));
    assert_eq!(scheduler.stats().walks, 0);

    match events.recv().await.unwrap() {
        ScanEvent::Finished { id, .. } => assert_eq!(id, handle.id()),
        other => panic!("unexpected event {other:?}"),
    }

    let fresh = scheduler.request_scan(temp.path()).unwrap();
    assert!(fresh.id() > handle.id());
    assert!(fresh.wait().await.is_complete());
}

#[tokio::test]
async fn test_rescan_supersedes_running_request() {
    let temp = create_tree();
    let (scheduler, _events) = Scheduler::new(EngineConfig::default(), None).unwrap();

    let old = scheduler.request_scan(temp.path()).unwrap();
    let new = scheduler.rescan(temp.path()).unwrap();
    assert!(new.id() > old.id());
    assert!(old.is_cancelled());

    assert!(old.wait().await.is_cancelled());
    assert!(new.wait().await.is_complete());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_every_scan_finishes_exactly_once() {
    let temp = create_tree();
    let (scheduler, mut events) = Scheduler::new(EngineConfig::default(), None).unwrap();

    let paths = [temp.path().to_path_buf(), temp.path().join("sub")];
    let handles: Vec<_> = scheduler
        .request_scans(&paths)
        .into_iter()
        .map(Result::unwrap)
        .collect();
    for handle in &handles {
        handle.wait().await;
        assert!(matches!(handle.status(), ScanStatus::Finished(_)));
    }
    scheduler.shutdown().await;

    let mut finished = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ScanEvent::Finished { id, .. } = event {
            finished.push(id);
        }
    }
    finished.sort();
    let mut expected: Vec<_> = handles.iter().map(|h| h.id()).collect();
    expected.sort();
    assert_eq!(finished, expected);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_path_is_rejected_immediately() {
    let (scheduler, _events) = Scheduler::new(EngineConfig::default(), None).unwrap();
    assert!(matches!(
        scheduler.request_scan(""),
        Err(ScanError::InvalidPath { .. })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_path_fails() {
    let temp = TempDir::new().unwrap();
    let (scheduler, _events) = Scheduler::new(EngineConfig::default(), None).unwrap();

    let handle = scheduler.request_scan(temp.path().join("missing")).unwrap();
    assert!(matches!(
        &*handle.wait().await,
        ScanOutcome::Failed(ScanError::NotFound { .. })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_board_keeps_newest_result() {
    let temp = create_tree();
    let (scheduler, mut events) = Scheduler::new(EngineConfig::default(), None).unwrap();
    let key = PathKey::normalize(temp.path()).unwrap();

    let older = scheduler.request_scan(temp.path()).unwrap();
    older.wait().await;
    fs::write(temp.path().join("more.txt"), vec![0u8; 25]).unwrap();
    let newer = scheduler.rescan(temp.path()).unwrap();
    newer.wait().await;
    // Workers publish the final event just after the status slot.
    scheduler.shutdown().await;

    let mut collected = Vec::new();
    while let Ok(event) = events.try_recv() {
        collected.push(event);
    }
    let (from_older, from_newer): (Vec<_>, Vec<_>) =
        collected.into_iter().partition(|e| e.id() == older.id());

    // Deliver the newer scan first; the older one must not overwrite it.
    let mut board = ResultBoard::new();
    for event in &from_newer {
        board.apply(event);
    }
    for event in &from_older {
        assert!(!board.apply(event));
    }
    assert_eq!(board.size_of(&key), Some(175));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_clear_cache_and_listing_go_through_the_store() {
    let temp = create_tree();
    let cache = TempDir::new().unwrap();
    let store = open_store(&cache);
    let (scheduler, _events) =
        Scheduler::new(EngineConfig::default(), Some(Arc::clone(&store))).unwrap();

    scheduler.request_scan(temp.path()).unwrap().wait().await;
    assert_eq!(store.len().unwrap(), 2);

    let listing = scheduler.list_children(temp.path()).unwrap();
    let sub = listing.iter().find(|e| e.name.as_str() == "sub").unwrap();
    assert_eq!(sub.size, Some(50));

    assert_eq!(scheduler.clear_cache(temp.path().join("sub")).unwrap(), 1);
    assert_eq!(scheduler.clear_cache(temp.path()).unwrap(), 1);
    assert!(store.is_empty().unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_forget_removed_drops_ancestor_totals() {
    let temp = TempDir::new().unwrap();
    fs::create_dir_all(temp.path().join("outer/inner/victim")).unwrap();
    fs::create_dir(temp.path().join("outer/sibling")).unwrap();
    fs::write(temp.path().join("outer/inner/victim/big.bin"), vec![0u8; 4096]).unwrap();
    fs::write(temp.path().join("outer/sibling/keep.bin"), vec![0u8; 10]).unwrap();

    let cache = TempDir::new().unwrap();
    let store = open_store(&cache);
    let (scheduler, _events) =
        Scheduler::new(EngineConfig::default(), Some(Arc::clone(&store))).unwrap();
    let first = scheduler.request_scan(temp.path()).unwrap().wait().await;
    assert_eq!(first.report().unwrap().total_size(), 4106);
    assert_eq!(store.len().unwrap(), 5);

    let victim = temp.path().join("outer/inner/victim");
    fs::remove_dir_all(&victim).unwrap();
    // victim, inner, outer and the scanned root.
    assert_eq!(scheduler.forget_removed(&victim).unwrap(), 4);

    let key = |rel: &str| PathKey::normalize(temp.path().join(rel)).unwrap();
    assert!(store.get(&key("outer")).is_none());
    assert!(store.get(&key("outer/sibling")).is_some());

    let second = scheduler.rescan(temp.path()).unwrap().wait().await;
    assert_eq!(second.report().unwrap().total_size(), 10);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_closes_store_and_rejects_requests() {
    let temp = create_tree();
    let cache = TempDir::new().unwrap();
    let store = open_store(&cache);
    let (scheduler, _events) =
        Scheduler::new(EngineConfig::default(), Some(Arc::clone(&store))).unwrap();

    let handle = scheduler.request_scan(temp.path()).unwrap();
    scheduler.shutdown().await;

    assert!(handle.is_finished());
    assert!(store.is_closed());
    assert!(scheduler.in_flight().is_empty());
    assert!(matches!(
        scheduler.request_scan(temp.path()),
        Err(ScanError::ShutDown)
    ));
}

#[test]
fn test_scheduler_needs_a_runtime() {
    assert!(Scheduler::new(EngineConfig::default(), None).is_err());
}
