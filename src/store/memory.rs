use crate::core::{MigrationError, Result};
use crate::store::{CheckpointRow, LockRow, RunStateRow, StateStore};
use std::collections::HashMap;
use std::sync::Mutex;

/// In-memory state store.
///
/// The deterministic collaborator used by unit and integration tests;
/// mirrors the semantics of `FileStateStore` without touching disk.
#[derive(Default)]
pub struct MemoryStateStore {
    inner: Mutex<Tables>,
}

#[derive(Default)]
struct Tables {
    locks: HashMap<String, LockRow>,
    runs: HashMap<String, RunStateRow>,
    checkpoints: Vec<CheckpointRow>,
    scratch: HashMap<(String, String), serde_json::Value>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStateStore {
    fn ensure_tables(&self) -> Result<()> {
        Ok(())
    }

    fn get_lock(&self, name: &str) -> Result<Option<LockRow>> {
        let tables = self.inner.lock()?;
        Ok(tables.locks.get(name).cloned())
    }

    fn insert_lock(&self, row: &LockRow) -> Result<()> {
        let mut tables = self.inner.lock()?;
        if tables.locks.contains_key(&row.name) {
            return Err(MigrationError::LockConflict(row.name.clone()));
        }
        tables.locks.insert(row.name.clone(), row.clone());
        Ok(())
    }

    fn update_lock_expiry(&self, name: &str, migration_id: &str, expires_at: i64) -> Result<bool> {
        let mut tables = self.inner.lock()?;
        match tables.locks.get_mut(name) {
            Some(row) if row.migration_id == migration_id => {
                row.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn delete_lock(&self, name: &str, migration_id: Option<&str>) -> Result<()> {
        let mut tables = self.inner.lock()?;
        match migration_id {
            Some(id) => {
                if tables.locks.get(name).is_some_and(|r| r.migration_id == id) {
                    tables.locks.remove(name);
                }
            }
            None => {
                tables.locks.remove(name);
            }
        }
        Ok(())
    }

    fn upsert_run_state(&self, row: &RunStateRow) -> Result<()> {
        let mut tables = self.inner.lock()?;
        tables.runs.insert(row.migration_id.clone(), row.clone());
        Ok(())
    }

    fn get_run_state(&self, migration_id: &str) -> Result<Option<RunStateRow>> {
        let tables = self.inner.lock()?;
        Ok(tables.runs.get(migration_id).cloned())
    }

    fn insert_checkpoint_row(&self, row: &CheckpointRow) -> Result<()> {
        let mut tables = self.inner.lock()?;
        tables.checkpoints.push(row.clone());
        Ok(())
    }

    fn list_checkpoint_rows(&self, migration_id: &str) -> Result<Vec<CheckpointRow>> {
        let tables = self.inner.lock()?;
        Ok(tables
            .checkpoints
            .iter()
            .filter(|r| r.migration_id == migration_id)
            .cloned()
            .collect())
    }

    fn save_scratch(
        &self,
        migration_id: &str,
        phase: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let mut tables = self.inner.lock()?;
        tables
            .scratch
            .insert((migration_id.to_string(), phase.to_string()), payload.clone());
        Ok(())
    }

    fn load_scratch(&self, migration_id: &str, phase: &str) -> Result<Option<serde_json::Value>> {
        let tables = self.inner.lock()?;
        Ok(tables
            .scratch
            .get(&(migration_id.to_string(), phase.to_string()))
            .cloned())
    }

    fn clear_scratch(&self, migration_id: &str) -> Result<()> {
        let mut tables = self.inner.lock()?;
        tables.scratch.retain(|(id, _), _| id != migration_id);
        Ok(())
    }

    fn purge_runs_older_than(&self, cutoff_ms: i64) -> Result<usize> {
        let mut tables = self.inner.lock()?;
        let stale: Vec<String> = tables
            .runs
            .values()
            .filter(|r| r.updated_at < cutoff_ms)
            .map(|r| r.migration_id.clone())
            .collect();
        for id in &stale {
            tables.runs.remove(id);
            tables.checkpoints.retain(|c| &c.migration_id != id);
            tables.scratch.retain(|(mid, _), _| mid != id);
        }
        Ok(stale.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lock_row(name: &str, id: &str, expires_at: i64) -> LockRow {
        LockRow {
            name: name.to_string(),
            migration_id: id.to_string(),
            holder: "host:1".to_string(),
            acquired_at: 0,
            expires_at,
        }
    }

    #[test]
    fn test_insert_lock_conflict() {
        let store = MemoryStateStore::new();
        store.insert_lock(&lock_row("mig", "a", 100)).unwrap();
        let err = store.insert_lock(&lock_row("mig", "b", 100)).unwrap_err();
        assert!(matches!(err, MigrationError::LockConflict(_)));
    }

    #[test]
    fn test_update_expiry_matches_holder() {
        let store = MemoryStateStore::new();
        store.insert_lock(&lock_row("mig", "a", 100)).unwrap();
        assert!(store.update_lock_expiry("mig", "a", 500).unwrap());
        assert!(!store.update_lock_expiry("mig", "other", 900).unwrap());
        assert_eq!(store.get_lock("mig").unwrap().unwrap().expires_at, 500);
    }

    #[test]
    fn test_delete_lock_scoped_to_holder() {
        let store = MemoryStateStore::new();
        store.insert_lock(&lock_row("mig", "a", 100)).unwrap();
        store.delete_lock("mig", Some("other")).unwrap();
        assert!(store.get_lock("mig").unwrap().is_some());
        store.delete_lock("mig", Some("a")).unwrap();
        assert!(store.get_lock("mig").unwrap().is_none());
    }

    #[test]
    fn test_purge_removes_runs_and_listings() {
        let store = MemoryStateStore::new();
        let row = RunStateRow {
            migration_id: "old".into(),
            phase: "complete".into(),
            status: "completed".into(),
            processed_count: 1,
            total_count: 1,
            batch_cursor: 0,
            processed_ids_json: "[]".into(),
            stats_json: "{}".into(),
            error: None,
            started_at: 0,
            updated_at: 10,
            completed_at: Some(10),
        };
        store.upsert_run_state(&row).unwrap();
        store
            .insert_checkpoint_row(&CheckpointRow {
                id: "c1".into(),
                migration_id: "old".into(),
                phase: "complete".into(),
                created_at: 10,
                processed_count: 1,
            })
            .unwrap();
        assert_eq!(store.purge_runs_older_than(100).unwrap(), 1);
        assert!(store.get_run_state("old").unwrap().is_none());
        assert!(store.list_checkpoint_rows("old").unwrap().is_empty());
    }
}
