use crate::core::{MigrationError, Result};
use crate::store::{LockRow, StateStore};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

/// Fixed name of the single migration lock row.
pub const LOCK_NAME: &str = "migration_lock";

/// Distributed mutual-exclusion token: one live migration at a time.
///
/// The lock is a single row in the state store with a TTL. A holder may
/// reacquire its own row when resuming; any other migration id waits for
/// release or expiry.
pub struct RunLock {
    store: Arc<dyn StateStore>,
    migration_id: String,
    holder: String,
    ttl: Duration,
    poll_interval: Duration,
}

impl RunLock {
    pub fn new(store: Arc<dyn StateStore>, migration_id: &str, ttl: Duration) -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let holder = format!(
            "{}:{}:{}",
            host,
            std::process::id(),
            Uuid::new_v4().simple()
        );
        Self {
            store,
            migration_id: migration_id.to_string(),
            holder,
            ttl,
            poll_interval: Duration::from_millis(200),
        }
    }

    /// Override the contention polling interval (tests use milliseconds).
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Wait up to `timeout` for the lock.
    ///
    /// Expired rows are swept before each attempt. An existing row for the
    /// same migration id is only reacquired when `is_resume` is set; a row
    /// for a different migration id means waiting until it is released or
    /// expires. A concurrent-insert conflict is treated as contention, not
    /// as a failure.
    pub fn acquire(&self, timeout: Duration, is_resume: bool) -> Result<LockGuard> {
        self.store.ensure_tables()?;
        let deadline = Instant::now() + timeout;
        loop {
            let now = chrono::Utc::now().timestamp_millis();
            match self.store.get_lock(LOCK_NAME)? {
                Some(row) if row.is_expired(now) => {
                    warn!(
                        holder = %row.holder,
                        migration_id = %row.migration_id,
                        "sweeping expired migration lock"
                    );
                    self.store.delete_lock(LOCK_NAME, None)?;
                    continue;
                }
                Some(row) if row.migration_id == self.migration_id && is_resume => {
                    let expires_at = now + self.ttl.as_millis() as i64;
                    self.store
                        .update_lock_expiry(LOCK_NAME, &self.migration_id, expires_at)?;
                    debug!(migration_id = %self.migration_id, "reacquired own lock for resume");
                    return Ok(self.guard());
                }
                Some(_) => {
                    // Held by someone else (or by us outside resume mode).
                }
                None => {
                    let row = LockRow {
                        name: LOCK_NAME.to_string(),
                        migration_id: self.migration_id.clone(),
                        holder: self.holder.clone(),
                        acquired_at: now,
                        expires_at: now + self.ttl.as_millis() as i64,
                    };
                    match self.store.insert_lock(&row) {
                        Ok(()) => {
                            debug!(migration_id = %self.migration_id, "acquired migration lock");
                            return Ok(self.guard());
                        }
                        Err(MigrationError::LockConflict(_)) => {
                            // Lost the insert race; fall through to wait.
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            if Instant::now() >= deadline {
                return Err(MigrationError::LockContention(format!(
                    "another migration is already running; wait for it to finish, \
                     or run force-cleanup for the stale lock if its process is gone \
                     (migration id '{}')",
                    self.migration_id
                )));
            }
            std::thread::sleep(self.poll_interval);
        }
    }

    /// Unconditionally remove the lock row, whoever holds it. Operator
    /// escape hatch for a crashed run whose TTL has not lapsed yet.
    pub fn force_cleanup(&self) -> Result<()> {
        self.store.ensure_tables()?;
        warn!(migration_id = %self.migration_id, "force-removing migration lock row");
        self.store.delete_lock(LOCK_NAME, None)
    }

    fn guard(&self) -> LockGuard {
        LockGuard {
            store: Arc::clone(&self.store),
            migration_id: self.migration_id.clone(),
            ttl: self.ttl,
            released: false,
        }
    }
}

/// RAII guard for the held lock.
///
/// Releases the row on drop so every exit path, including panics, gives
/// the lock back. Callers inside long sub-loops must call `refresh` on a
/// cadence shorter than the TTL.
pub struct LockGuard {
    store: Arc<dyn StateStore>,
    migration_id: String,
    ttl: Duration,
    released: bool,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("migration_id", &self.migration_id)
            .field("ttl", &self.ttl)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl LockGuard {
    /// Extend the expiry for the current holder. Returns false when the
    /// row no longer belongs to this migration (expired and swept).
    pub fn refresh(&self) -> Result<bool> {
        let expires_at = chrono::Utc::now().timestamp_millis() + self.ttl.as_millis() as i64;
        self.store
            .update_lock_expiry(LOCK_NAME, &self.migration_id, expires_at)
    }

    /// Explicitly release the lock, surfacing any store error.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.store.delete_lock(LOCK_NAME, Some(&self.migration_id))
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.store.delete_lock(LOCK_NAME, Some(&self.migration_id)) {
            warn!(
                migration_id = %self.migration_id,
                error = %e,
                "failed to release migration lock on drop"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStateStore;

    fn store() -> Arc<dyn StateStore> {
        Arc::new(MemoryStateStore::new())
    }

    #[test]
    fn test_acquire_and_release() {
        let store = store();
        let lock = RunLock::new(Arc::clone(&store), "m1", Duration::from_secs(60));
        let guard = lock.acquire(Duration::from_millis(50), false).unwrap();
        assert!(store.get_lock(LOCK_NAME).unwrap().is_some());
        guard.release().unwrap();
        assert!(store.get_lock(LOCK_NAME).unwrap().is_none());
    }

    #[test]
    fn test_second_caller_blocks_then_times_out() {
        let store = store();
        let first = RunLock::new(Arc::clone(&store), "m1", Duration::from_secs(60));
        let second = RunLock::new(Arc::clone(&store), "m2", Duration::from_secs(60))
            .poll_interval(Duration::from_millis(5));
        let _guard = first.acquire(Duration::from_millis(50), false).unwrap();
        let err = second
            .acquire(Duration::from_millis(30), false)
            .unwrap_err();
        assert!(matches!(err, MigrationError::LockContention(_)));
    }

    #[test]
    fn test_self_reacquire_requires_resume_mode() {
        let store = store();
        let lock = RunLock::new(Arc::clone(&store), "m1", Duration::from_secs(60))
            .poll_interval(Duration::from_millis(5));
        let guard = lock.acquire(Duration::from_millis(50), false).unwrap();

        // Not a resume: same id must still wait.
        assert!(lock.acquire(Duration::from_millis(30), false).is_err());

        // Resume: same id reacquires while the row is live.
        let resumed = lock.acquire(Duration::from_millis(50), true).unwrap();
        drop(resumed);
        drop(guard);
    }

    #[test]
    fn test_expired_lock_is_swept() {
        let store = store();
        store
            .insert_lock(&LockRow {
                name: LOCK_NAME.to_string(),
                migration_id: "crashed".into(),
                holder: "gone:1".into(),
                acquired_at: 0,
                expires_at: 1, // long past
            })
            .unwrap();
        let lock = RunLock::new(Arc::clone(&store), "m2", Duration::from_secs(60));
        let guard = lock.acquire(Duration::from_millis(100), false).unwrap();
        let row = store.get_lock(LOCK_NAME).unwrap().unwrap();
        assert_eq!(row.migration_id, "m2");
        drop(guard);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let store = store();
        let lock = RunLock::new(Arc::clone(&store), "m1", Duration::from_secs(60));
        {
            let _guard = lock.acquire(Duration::from_millis(50), false).unwrap();
        }
        assert!(store.get_lock(LOCK_NAME).unwrap().is_none());
    }

    #[test]
    fn test_refresh_extends_expiry() {
        let store = store();
        let lock = RunLock::new(Arc::clone(&store), "m1", Duration::from_secs(1));
        let guard = lock.acquire(Duration::from_millis(50), false).unwrap();
        let before = store.get_lock(LOCK_NAME).unwrap().unwrap().expires_at;
        std::thread::sleep(Duration::from_millis(10));
        assert!(guard.refresh().unwrap());
        let after = store.get_lock(LOCK_NAME).unwrap().unwrap().expires_at;
        assert!(after > before);
    }

    #[test]
    fn test_force_cleanup_clears_foreign_lock() {
        let store = store();
        let other = RunLock::new(Arc::clone(&store), "m1", Duration::from_secs(60));
        let _leaked = std::mem::ManuallyDrop::new(
            other.acquire(Duration::from_millis(50), false).unwrap(),
        );
        let mine = RunLock::new(Arc::clone(&store), "m2", Duration::from_secs(60));
        mine.force_cleanup().unwrap();
        assert!(store.get_lock(LOCK_NAME).unwrap().is_none());
    }
}
