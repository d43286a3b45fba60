use crate::core::{MigrationError, Result};
use crate::store::{CheckpointRow, LockRow, RunStateRow, StateStore};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;

/// File-backed state store.
///
/// All tables live in one JSON document that is atomically replaced on
/// every mutation (write-to-temp, sync, rename — the same discipline as
/// checkpoint files). Volume is small: one lock row, one run-state row
/// per migration, and summary checkpoint listings.
pub struct FileStateStore {
    path: PathBuf,
    guard: Mutex<()>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Tables {
    locks: HashMap<String, LockRow>,
    runs: HashMap<String, RunStateRow>,
    checkpoints: Vec<CheckpointRow>,
    scratch: HashMap<String, serde_json::Value>,
}

fn scratch_key(migration_id: &str, phase: &str) -> String {
    format!("{}::{}", migration_id, phase)
}

impl FileStateStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join("migration-state.json"),
            guard: Mutex::new(()),
        }
    }

    fn read_tables(&self) -> Result<Tables> {
        if !self.path.exists() {
            return Ok(Tables::default());
        }
        let data = fs::read_to_string(&self.path)
            .map_err(|e| MigrationError::StateStore(format!("failed to read state file: {}", e)))?;
        if data.trim().is_empty() {
            return Ok(Tables::default());
        }
        serde_json::from_str(&data)
            .map_err(|e| MigrationError::StateStore(format!("corrupt state file: {}", e)))
    }

    fn write_tables(&self, tables: &Tables) -> Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| MigrationError::StateStore("state file has no parent dir".into()))?;
        fs::create_dir_all(dir)
            .map_err(|e| MigrationError::StateStore(format!("failed to create state dir: {}", e)))?;
        let mut tmp = NamedTempFile::new_in(dir)
            .map_err(|e| MigrationError::StateStore(format!("failed to create temp file: {}", e)))?;
        let serialized = serde_json::to_string_pretty(tables)?;
        tmp.write_all(serialized.as_bytes())
            .map_err(|e| MigrationError::StateStore(format!("failed to write state: {}", e)))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| MigrationError::StateStore(format!("failed to sync state: {}", e)))?;
        tmp.persist(&self.path)
            .map_err(|e| MigrationError::StateStore(format!("failed to replace state: {}", e)))?;
        Ok(())
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut Tables) -> Result<T>) -> Result<T> {
        let _guard = self.guard.lock()?;
        let mut tables = self.read_tables()?;
        let out = f(&mut tables)?;
        self.write_tables(&tables)?;
        Ok(out)
    }
}

impl StateStore for FileStateStore {
    fn ensure_tables(&self) -> Result<()> {
        let _guard = self.guard.lock()?;
        if !self.path.exists() {
            self.write_tables(&Tables::default())?;
        }
        Ok(())
    }

    fn get_lock(&self, name: &str) -> Result<Option<LockRow>> {
        let _guard = self.guard.lock()?;
        Ok(self.read_tables()?.locks.get(name).cloned())
    }

    fn insert_lock(&self, row: &LockRow) -> Result<()> {
        self.mutate(|tables| {
            if tables.locks.contains_key(&row.name) {
                return Err(MigrationError::LockConflict(row.name.clone()));
            }
            tables.locks.insert(row.name.clone(), row.clone());
            Ok(())
        })
    }

    fn update_lock_expiry(&self, name: &str, migration_id: &str, expires_at: i64) -> Result<bool> {
        self.mutate(|tables| match tables.locks.get_mut(name) {
            Some(row) if row.migration_id == migration_id => {
                row.expires_at = expires_at;
                Ok(true)
            }
            _ => Ok(false),
        })
    }

    fn delete_lock(&self, name: &str, migration_id: Option<&str>) -> Result<()> {
        self.mutate(|tables| {
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
        })
    }

    fn upsert_run_state(&self, row: &RunStateRow) -> Result<()> {
        self.mutate(|tables| {
            tables.runs.insert(row.migration_id.clone(), row.clone());
            Ok(())
        })
    }

    fn get_run_state(&self, migration_id: &str) -> Result<Option<RunStateRow>> {
        let _guard = self.guard.lock()?;
        Ok(self.read_tables()?.runs.get(migration_id).cloned())
    }

    fn insert_checkpoint_row(&self, row: &CheckpointRow) -> Result<()> {
        self.mutate(|tables| {
            tables.checkpoints.push(row.clone());
            Ok(())
        })
    }

    fn list_checkpoint_rows(&self, migration_id: &str) -> Result<Vec<CheckpointRow>> {
        let _guard = self.guard.lock()?;
        Ok(self
            .read_tables()?
            .checkpoints
            .into_iter()
            .filter(|r| r.migration_id == migration_id)
            .collect())
    }

    fn save_scratch(
        &self,
        migration_id: &str,
        phase: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        self.mutate(|tables| {
            tables
                .scratch
                .insert(scratch_key(migration_id, phase), payload.clone());
            Ok(())
        })
    }

    fn load_scratch(&self, migration_id: &str, phase: &str) -> Result<Option<serde_json::Value>> {
        let _guard = self.guard.lock()?;
        Ok(self
            .read_tables()?
            .scratch
            .remove(&scratch_key(migration_id, phase)))
    }

    fn clear_scratch(&self, migration_id: &str) -> Result<()> {
        let prefix = format!("{}::", migration_id);
        self.mutate(|tables| {
            tables.scratch.retain(|k, _| !k.starts_with(&prefix));
            Ok(())
        })
    }

    fn purge_runs_older_than(&self, cutoff_ms: i64) -> Result<usize> {
        self.mutate(|tables| {
            let stale: Vec<String> = tables
                .runs
                .values()
                .filter(|r| r.updated_at < cutoff_ms)
                .map(|r| r.migration_id.clone())
                .collect();
            for id in &stale {
                let prefix = format!("{}::", id);
                tables.runs.remove(id);
                tables.checkpoints.retain(|c| &c.migration_id != id);
                tables.scratch.retain(|k, _| !k.starts_with(&prefix));
            }
            Ok(stale.len())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_ensure_tables_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path());
        store.ensure_tables().unwrap();
        store.ensure_tables().unwrap();
        assert!(dir.path().join("migration-state.json").exists());
    }

    #[test]
    fn test_lock_rows_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = FileStateStore::new(dir.path());
            store
                .insert_lock(&LockRow {
                    name: "migration_lock".into(),
                    migration_id: "m1".into(),
                    holder: "host:42".into(),
                    acquired_at: 1,
                    expires_at: 1000,
                })
                .unwrap();
        }
        let reopened = FileStateStore::new(dir.path());
        let row = reopened.get_lock("migration_lock").unwrap().unwrap();
        assert_eq!(row.migration_id, "m1");
        assert_eq!(row.holder, "host:42");
    }

    #[test]
    fn test_scratch_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path());
        let payload = serde_json::json!({"group": 3, "kept": "asset:10"});
        store.save_scratch("m1", "resolve_duplicates", &payload).unwrap();
        let loaded = store.load_scratch("m1", "resolve_duplicates").unwrap();
        assert_eq!(loaded, Some(payload));
        store.clear_scratch("m1").unwrap();
        assert!(store.load_scratch("m1", "resolve_duplicates").unwrap().is_none());
    }
}
