pub mod file;
pub mod memory;

pub use file::FileStateStore;
pub use memory::MemoryStateStore;

use crate::core::Result;
use serde::{Deserialize, Serialize};

// ============================================================================
// Durable Rows
// ============================================================================

/// The run-lock row. At most one non-expired row exists per lock name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRow {
    /// Fixed lock name (one per protected target).
    pub name: String,
    /// Migration currently holding the lock.
    pub migration_id: String,
    /// Host + pid + token of the holding process.
    pub holder: String,
    pub acquired_at: i64,
    pub expires_at: i64,
}

impl LockRow {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at <= now_ms
    }
}

/// Run-state mirror consumed by external observers (dashboard pollers).
///
/// Collection fields are stored JSON-encoded so the row maps onto a flat
/// table in any backing store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStateRow {
    pub migration_id: String,
    pub phase: String,
    pub status: String,
    pub processed_count: u64,
    pub total_count: u64,
    pub batch_cursor: u64,
    pub processed_ids_json: String,
    pub stats_json: String,
    pub error: Option<String>,
    pub started_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

/// Checkpoint-listing row: the summary surface, not the payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRow {
    pub id: String,
    pub migration_id: String,
    pub phase: String,
    pub created_at: i64,
    pub processed_count: u64,
}

// ============================================================================
// State Store
// ============================================================================

/// Durable shared-state surface: the lock row, the run-state mirror, the
/// checkpoint listing, and per-phase scratch payloads.
///
/// Single-writer by construction — only the lock-holding orchestrator
/// writes — so implementations need interior mutability but no further
/// coordination.
pub trait StateStore: Send + Sync {
    /// Create backing tables if missing. Must be idempotent; callers may
    /// invoke it before every lock acquisition.
    fn ensure_tables(&self) -> Result<()>;

    // --- lock table ---

    fn get_lock(&self, name: &str) -> Result<Option<LockRow>>;

    /// Insert a lock row. Fails with `MigrationError::LockConflict` when a
    /// row with the same name already exists (the concurrent-insert race).
    fn insert_lock(&self, row: &LockRow) -> Result<()>;

    /// Extend the expiry of an existing row, matched by name and holder
    /// migration id. Returns whether a row matched.
    fn update_lock_expiry(&self, name: &str, migration_id: &str, expires_at: i64) -> Result<bool>;

    /// Delete the lock row. When `migration_id` is given, only a row held
    /// by that migration is removed.
    fn delete_lock(&self, name: &str, migration_id: Option<&str>) -> Result<()>;

    // --- run-state mirror ---

    fn upsert_run_state(&self, row: &RunStateRow) -> Result<()>;

    fn get_run_state(&self, migration_id: &str) -> Result<Option<RunStateRow>>;

    // --- checkpoint listing ---

    fn insert_checkpoint_row(&self, row: &CheckpointRow) -> Result<()>;

    /// Rows for one migration, oldest first.
    fn list_checkpoint_rows(&self, migration_id: &str) -> Result<Vec<CheckpointRow>>;

    // --- phase scratch (granular resume state, e.g. in-progress
    // duplicate-group materialization) ---

    fn save_scratch(&self, migration_id: &str, phase: &str, payload: &serde_json::Value)
    -> Result<()>;

    fn load_scratch(&self, migration_id: &str, phase: &str) -> Result<Option<serde_json::Value>>;

    fn clear_scratch(&self, migration_id: &str) -> Result<()>;

    // --- janitor ---

    /// Remove run-state rows (and their checkpoint listings and scratch)
    /// last updated before the cutoff. Returns the number of runs purged.
    fn purge_runs_older_than(&self, cutoff_ms: i64) -> Result<usize>;
}
