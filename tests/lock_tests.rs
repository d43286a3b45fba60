// Run-lock behavior across threads and across "process" boundaries
// (separate FileStateStore instances over the same state file).

use assetshift::store::{FileStateStore, StateStore};
use assetshift::{LOCK_NAME, MigrationError, RunLock};
use std::mem::ManuallyDrop;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

#[test]
fn test_threads_never_hold_the_lock_concurrently() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(dir.path()));
    let inside = Arc::new(AtomicU32::new(0));
    let max_inside = Arc::new(AtomicU32::new(0));

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let store = Arc::clone(&store);
            let inside = Arc::clone(&inside);
            let max_inside = Arc::clone(&max_inside);
            std::thread::spawn(move || {
                let lock = RunLock::new(store, &format!("mig-{}", i), Duration::from_secs(60))
                    .poll_interval(Duration::from_millis(2));
                for _ in 0..5 {
                    let guard = lock.acquire(Duration::from_secs(10), false).unwrap();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(2));
                    inside.fetch_sub(1, Ordering::SeqCst);
                    guard.release().unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    assert!(store.get_lock(LOCK_NAME).unwrap().is_none());
}

#[test]
fn test_resume_reacquires_across_store_instances() {
    init_tracing();
    let dir = TempDir::new().unwrap();

    // First "process" acquires and crashes without releasing.
    {
        let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(dir.path()));
        let lock = RunLock::new(store, "mig-crash", Duration::from_secs(60));
        let _leaked =
            ManuallyDrop::new(lock.acquire(Duration::from_millis(100), false).unwrap());
    }

    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(dir.path()));

    // A different migration is blocked by the leftover row.
    let other = RunLock::new(Arc::clone(&store), "mig-other", Duration::from_secs(60))
        .poll_interval(Duration::from_millis(5));
    let err = other
        .acquire(Duration::from_millis(30), false)
        .unwrap_err();
    assert!(matches!(err, MigrationError::LockContention(_)));

    // The same migration id resumes right through it.
    let same = RunLock::new(Arc::clone(&store), "mig-crash", Duration::from_secs(60));
    let guard = same.acquire(Duration::from_millis(100), true).unwrap();
    guard.release().unwrap();
    assert!(store.get_lock(LOCK_NAME).unwrap().is_none());
}

#[test]
fn test_expired_row_swept_by_new_instance() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    {
        let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(dir.path()));
        let lock = RunLock::new(store, "mig-stale", Duration::from_millis(30));
        let _leaked =
            ManuallyDrop::new(lock.acquire(Duration::from_millis(100), false).unwrap());
    }
    std::thread::sleep(Duration::from_millis(50)); // let the TTL lapse

    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(dir.path()));
    let lock = RunLock::new(Arc::clone(&store), "mig-new", Duration::from_secs(60))
        .poll_interval(Duration::from_millis(5));
    let guard = lock.acquire(Duration::from_secs(1), false).unwrap();
    let row = store.get_lock(LOCK_NAME).unwrap().unwrap();
    assert_eq!(row.migration_id, "mig-new");
    drop(guard);
}

#[test]
fn test_force_cleanup_unblocks_foreign_lock() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    {
        let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(dir.path()));
        let lock = RunLock::new(store, "mig-gone", Duration::from_secs(3600));
        let _leaked =
            ManuallyDrop::new(lock.acquire(Duration::from_millis(100), false).unwrap());
    }

    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(dir.path()));
    let mine = RunLock::new(Arc::clone(&store), "mig-mine", Duration::from_secs(60));
    mine.force_cleanup().unwrap();
    let _guard = mine.acquire(Duration::from_millis(100), false).unwrap();
    assert_eq!(
        store.get_lock(LOCK_NAME).unwrap().unwrap().migration_id,
        "mig-mine"
    );
}
