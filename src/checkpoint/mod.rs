use crate::core::{MigrationError, MigrationRun, Phase, Result, RunStats, RunStatus,
                  validate_migration_id};
use crate::store::{CheckpointRow, RunStateRow, StateStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use uuid::Uuid;

/// Suffix distinguishing quick-state files from full checkpoints in the
/// same directory.
const QUICK_SUFFIX: &str = ".state.json";

// ============================================================================
// Checkpoint Tiers
// ============================================================================

/// Full checkpoint: everything needed to reconstruct a run from cold
/// start, including the phase-specific payload. One file per migration
/// id, atomically replaced on save.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub migration_id: String,
    pub phase: Phase,
    pub status: RunStatus,
    pub pid: u32,
    pub batch_cursor: u64,
    pub total_items: u64,
    pub processed_ids: BTreeSet<String>,
    pub stats: RunStats,
    pub error: Option<String>,
    /// Phase-specific resume payload (e.g. the in-progress duplicate
    /// group). Source of truth lives here, not in the quick state.
    pub payload: serde_json::Value,
    pub saved_at: i64,
}

impl Checkpoint {
    pub fn from_run(run: &MigrationRun, payload: serde_json::Value) -> Self {
        Self {
            migration_id: run.migration_id.clone(),
            phase: run.phase,
            status: run.status,
            pid: run.pid,
            batch_cursor: run.batch_cursor,
            total_items: run.total_items,
            processed_ids: run.processed_ids.clone(),
            stats: run.stats.clone(),
            error: run.error.clone(),
            payload,
            saved_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Quick state: the small, frequently-updated tier for low-latency
/// resume. Holds no phase payload; its processed-id set never exceeds the
/// last full checkpoint's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuickState {
    pub migration_id: String,
    pub phase: Phase,
    pub batch_cursor: u64,
    pub processed_ids: BTreeSet<String>,
    pub stats: RunStats,
    pub updated_at: i64,
}

impl QuickState {
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        Self {
            migration_id: checkpoint.migration_id.clone(),
            phase: checkpoint.phase,
            batch_cursor: checkpoint.batch_cursor,
            processed_ids: checkpoint.processed_ids.clone(),
            stats: checkpoint.stats.clone(),
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn from_run(run: &MigrationRun) -> Self {
        Self {
            migration_id: run.migration_id.clone(),
            phase: run.phase,
            batch_cursor: run.batch_cursor,
            processed_ids: run.processed_ids.clone(),
            stats: run.stats.clone(),
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// Entry in a checkpoint directory listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub migration_id: String,
    pub phase: Phase,
    pub saved_at: i64,
    pub processed_count: u64,
}

/// Outcome of an age-based cleanup sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: usize,
    pub failed: usize,
}

// ============================================================================
// Checkpoint Store
// ============================================================================

/// Dual-tier durable persistence of run progress.
///
/// Full checkpoints (`{id}.json`) and quick state (`{id}.state.json`)
/// live as local files; summary fields are mirrored into the shared
/// state store so a dashboard can observe progress without reading this
/// process's files. The mirror is best-effort: its failure never fails
/// the primary write.
pub struct CheckpointStore {
    dir: PathBuf,
    store: Arc<dyn StateStore>,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, store: Arc<dyn StateStore>) -> Self {
        Self {
            dir: dir.into(),
            store,
        }
    }

    /// Resolve `{id}{suffix}` inside the checkpoint directory, rejecting
    /// any identifier that could escape it. The id character whitelist
    /// already forbids separators; the canonical-parent check guards the
    /// directory itself against symlink surprises.
    fn confined_path(&self, migration_id: &str, suffix: &str) -> Result<PathBuf> {
        validate_migration_id(migration_id)
            .map_err(|_| MigrationError::PathTraversal(migration_id.to_string()))?;
        let path = self.dir.join(format!("{}{}", migration_id, suffix));
        if self.dir.exists() {
            let canonical_dir = self.dir.canonicalize()?;
            let parent = path
                .parent()
                .ok_or_else(|| MigrationError::PathTraversal(migration_id.to_string()))?;
            if parent.canonicalize()? != canonical_dir {
                return Err(MigrationError::PathTraversal(migration_id.to_string()));
            }
        }
        Ok(path)
    }

    fn write_atomic(&self, path: &Path, json: &str) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| MigrationError::Checkpoint(format!("failed to create dir: {}", e)))?;
        let mut tmp = NamedTempFile::new_in(&self.dir)
            .map_err(|e| MigrationError::Checkpoint(format!("failed to create temp file: {}", e)))?;
        tmp.write_all(json.as_bytes())
            .map_err(|e| MigrationError::Checkpoint(format!("failed to write: {}", e)))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| MigrationError::Checkpoint(format!("failed to sync: {}", e)))?;
        tmp.persist(path)
            .map_err(|e| MigrationError::Checkpoint(format!("failed to replace: {}", e)))?;
        Ok(())
    }

    /// Save a full checkpoint, then derive its quick state, then mirror
    /// summary fields to the state store. Only the primary write can fail
    /// the call; the two secondary writes log and continue.
    pub fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let path = self.confined_path(&checkpoint.migration_id, ".json")?;
        let json = serde_json::to_string_pretty(checkpoint)?;
        self.write_atomic(&path, &json)?;
        debug!(
            migration_id = %checkpoint.migration_id,
            phase = %checkpoint.phase,
            "saved full checkpoint"
        );

        if let Err(e) = self.save_quick_state(&QuickState::from_checkpoint(checkpoint)) {
            warn!(
                migration_id = %checkpoint.migration_id,
                error = %e,
                "quick-state write failed after checkpoint save"
            );
        }
        if let Err(e) = self.mirror(checkpoint) {
            warn!(
                migration_id = %checkpoint.migration_id,
                error = %e,
                "state-store mirror failed after checkpoint save"
            );
        }
        Ok(())
    }

    /// Write the lightweight tier on its own (between full checkpoints,
    /// e.g. after every processed-id batch).
    pub fn save_quick_state(&self, state: &QuickState) -> Result<()> {
        let path = self.confined_path(&state.migration_id, QUICK_SUFFIX)?;
        let json = serde_json::to_string(state)?;
        self.write_atomic(&path, &json)
    }

    pub fn load_quick_state(&self, migration_id: &str) -> Result<Option<QuickState>> {
        let path = self.confined_path(migration_id, QUICK_SUFFIX)?;
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read_to_string(&path)
            .map_err(|e| MigrationError::Checkpoint(format!("failed to read quick state: {}", e)))?;
        Ok(Some(serde_json::from_str(&data)?))
    }

    /// Load an explicit migration's full checkpoint, or the most recently
    /// modified one in the directory. Quick-state files are excluded from
    /// the scan by suffix.
    pub fn load_latest_checkpoint(&self, migration_id: Option<&str>) -> Result<Option<Checkpoint>> {
        let path = match migration_id {
            Some(id) => {
                let path = self.confined_path(id, ".json")?;
                if !path.exists() {
                    return Ok(None);
                }
                path
            }
            None => match self.latest_full_checkpoint_file()? {
                Some(path) => path,
                None => return Ok(None),
            },
        };
        let data = fs::read_to_string(&path)
            .map_err(|e| MigrationError::Checkpoint(format!("failed to read checkpoint: {}", e)))?;
        let checkpoint: Checkpoint = serde_json::from_str(&data)
            .map_err(|e| MigrationError::Checkpoint(format!("corrupt checkpoint: {}", e)))?;
        Ok(Some(checkpoint))
    }

    fn latest_full_checkpoint_file(&self) -> Result<Option<PathBuf>> {
        let mut newest: Option<(SystemTime, PathBuf)> = None;
        for path in self.full_checkpoint_files()? {
            let modified = fs::metadata(&path)?.modified()?;
            if newest.as_ref().is_none_or(|(t, _)| modified > *t) {
                newest = Some((modified, path));
            }
        }
        Ok(newest.map(|(_, path)| path))
    }

    fn full_checkpoint_files(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(".json") && !name.ends_with(QUICK_SUFFIX) {
                files.push(path);
            }
        }
        Ok(files)
    }

    /// Summaries of every full checkpoint on disk, oldest first.
    pub fn list_checkpoints(&self) -> Result<Vec<CheckpointSummary>> {
        let mut summaries = Vec::new();
        for path in self.full_checkpoint_files()? {
            let data = match fs::read_to_string(&path) {
                Ok(data) => data,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable checkpoint");
                    continue;
                }
            };
            match serde_json::from_str::<Checkpoint>(&data) {
                Ok(cp) => summaries.push(CheckpointSummary {
                    migration_id: cp.migration_id,
                    phase: cp.phase,
                    saved_at: cp.saved_at,
                    processed_count: cp.processed_ids.len() as u64,
                }),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping corrupt checkpoint");
                }
            }
        }
        summaries.sort_by_key(|s| s.saved_at);
        Ok(summaries)
    }

    /// Delete checkpoint and quick-state files older than the cutoff.
    /// Individual delete failures are logged and counted, never abort the
    /// sweep.
    pub fn cleanup_old_checkpoints(&self, max_age_hours: u64) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        if !self.dir.exists() {
            return Ok(report);
        }
        let cutoff = SystemTime::now() - std::time::Duration::from_secs(max_age_hours * 3600);
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".json") {
                continue;
            }
            let modified = match fs::metadata(&path).and_then(|m| m.modified()) {
                Ok(t) => t,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "cannot stat checkpoint");
                    report.failed += 1;
                    continue;
                }
            };
            if modified >= cutoff {
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to delete old checkpoint");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    fn mirror(&self, checkpoint: &Checkpoint) -> Result<()> {
        let row = RunStateRow {
            migration_id: checkpoint.migration_id.clone(),
            phase: checkpoint.phase.to_string(),
            status: checkpoint.status.to_string(),
            processed_count: checkpoint.processed_ids.len() as u64,
            total_count: checkpoint.total_items,
            batch_cursor: checkpoint.batch_cursor,
            processed_ids_json: serde_json::to_string(&checkpoint.processed_ids)?,
            stats_json: serde_json::to_string(&checkpoint.stats)?,
            error: checkpoint.error.clone(),
            started_at: checkpoint.stats.started_at,
            updated_at: checkpoint.saved_at,
            completed_at: (checkpoint.status == RunStatus::Completed).then_some(checkpoint.saved_at),
        };
        self.store.upsert_run_state(&row)?;
        self.store.insert_checkpoint_row(&CheckpointRow {
            id: Uuid::new_v4().to_string(),
            migration_id: checkpoint.migration_id.clone(),
            phase: checkpoint.phase.to_string(),
            created_at: checkpoint.saved_at,
            processed_count: checkpoint.processed_ids.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStateStore;
    use tempfile::TempDir;

    fn sample_checkpoint(id: &str, phase: Phase) -> Checkpoint {
        let mut run = MigrationRun::new(id).unwrap();
        run.enter_phase(phase);
        run.mark_processed("asset:1");
        Checkpoint::from_run(&run, serde_json::json!({"batch": 0}))
    }

    fn store_in(dir: &TempDir) -> CheckpointStore {
        CheckpointStore::new(dir.path(), Arc::new(MemoryStateStore::new()))
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let cp = sample_checkpoint("m1", Phase::Discovery);
        store.save_checkpoint(&cp).unwrap();

        let loaded = store.load_latest_checkpoint(Some("m1")).unwrap().unwrap();
        assert_eq!(loaded.phase, Phase::Discovery);
        assert!(loaded.processed_ids.contains("asset:1"));
    }

    #[test]
    fn test_latest_excludes_quick_state_files() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.save_checkpoint(&sample_checkpoint("m1", Phase::Discovery)).unwrap();
        // Quick state written after the full file; a naive mtime scan
        // over *.json would pick it up.
        store
            .save_quick_state(&QuickState::from_run(&MigrationRun::new("m1").unwrap()))
            .unwrap();
        let latest = store.load_latest_checkpoint(None).unwrap().unwrap();
        assert_eq!(latest.phase, Phase::Discovery);
    }

    #[test]
    fn test_latest_of_many_saves() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        for (i, phase) in [Phase::Preparation, Phase::Discovery, Phase::FixLinks]
            .into_iter()
            .enumerate()
        {
            store
                .save_checkpoint(&sample_checkpoint(&format!("m{}", i), phase))
                .unwrap();
            std::thread::sleep(std::time::Duration::from_millis(15));
        }
        let latest = store.load_latest_checkpoint(None).unwrap().unwrap();
        assert_eq!(latest.migration_id, "m2");
        assert_eq!(latest.phase, Phase::FixLinks);
    }

    #[test]
    fn test_quick_state_subset_of_full() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let cp = sample_checkpoint("m1", Phase::Consolidate);
        store.save_checkpoint(&cp).unwrap();
        let quick = store.load_quick_state("m1").unwrap().unwrap();
        assert!(quick.processed_ids.is_subset(&cp.processed_ids));
        assert_eq!(quick.phase, cp.phase);
    }

    #[test]
    fn test_path_traversal_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        for bad in ["../escape", "..", "a/b", "/etc/passwd", "x\\y"] {
            let err = store.load_latest_checkpoint(Some(bad)).unwrap_err();
            assert!(
                matches!(err, MigrationError::PathTraversal(_)),
                "expected rejection for {bad:?}"
            );
        }
    }

    #[test]
    fn test_mirror_visible_in_state_store() {
        let dir = TempDir::new().unwrap();
        let shared: Arc<dyn StateStore> = Arc::new(MemoryStateStore::new());
        let store = CheckpointStore::new(dir.path(), Arc::clone(&shared));
        store.save_checkpoint(&sample_checkpoint("m1", Phase::Quarantine)).unwrap();

        let row = shared.get_run_state("m1").unwrap().unwrap();
        assert_eq!(row.phase, "quarantine");
        assert_eq!(row.processed_count, 1);
        assert_eq!(shared.list_checkpoint_rows("m1").unwrap().len(), 1);
    }

    #[test]
    fn test_cleanup_removes_only_old_files() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        // Three checkpoints aged 1h, 80h and 200h; only the last two fall
        // past a 72h cutoff.
        for (id, age_hours) in [("fresh", 1u64), ("aged80", 80), ("aged200", 200)] {
            store.save_checkpoint(&sample_checkpoint(id, Phase::Discovery)).unwrap();
            let path = dir.path().join(format!("{}.json", id));
            let quick = dir.path().join(format!("{}.state.json", id));
            let old = SystemTime::now() - std::time::Duration::from_secs(age_hours * 3600);
            for p in [path, quick] {
                let times = std::fs::File::options().write(true).open(&p).unwrap();
                times.set_modified(old).unwrap();
            }
        }

        let report = store.cleanup_old_checkpoints(72).unwrap();
        assert_eq!(report.removed, 4); // two full + two quick files
        assert_eq!(report.failed, 0);
        assert!(store.load_latest_checkpoint(Some("fresh")).unwrap().is_some());
        assert!(store.load_latest_checkpoint(Some("aged80")).unwrap().is_none());
        assert!(store.load_latest_checkpoint(Some("aged200")).unwrap().is_none());
    }

    #[test]
    fn test_list_checkpoints_sorted() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store.save_checkpoint(&sample_checkpoint("a", Phase::Discovery)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        store.save_checkpoint(&sample_checkpoint("b", Phase::FixLinks)).unwrap();
        let list = store.list_checkpoints().unwrap();
        assert_eq!(list.len(), 2);
        assert!(list[0].saved_at <= list[1].saved_at);
    }
}
