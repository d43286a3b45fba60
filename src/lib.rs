// ============================================================================
// assetshift — content-store migration orchestration engine
// ============================================================================
//
// Migrates content-referenced binary objects and their metadata records
// between object-storage backends. Byte copying is an external tool's
// job; this crate owns the hard part: a phase-sequenced state machine
// with checkpoint/resume, a distributed run lock, retry with error
// classification, and a change-log-based rollback path.

pub mod adapter;
pub mod changelog;
pub mod checkpoint;
pub mod config;
pub mod core;
pub mod interface;
pub mod lock;
pub mod orchestrator;
pub mod retry;
pub mod rollback;
pub mod store;

// Re-export main types for convenience
pub use crate::core::{ErrorKind, MigrationError, MigrationRun, Phase, Result, RunStats, RunStatus};
pub use changelog::{Change, ChangeLog, ChangeRecord, LoadedChange};
pub use checkpoint::{Checkpoint, CheckpointStore, CheckpointSummary, CleanupReport, QuickState};
pub use config::MigrationConfig;
pub use lock::{LOCK_NAME, LockGuard, RunLock};
pub use orchestrator::{AutoConfirm, Confirm, Orchestrator, RunReport};
pub use retry::{RetryManager, RetrySummary};
pub use rollback::{RestoreReport, RollbackEngine, RollbackMode, RollbackStats};
pub use store::{FileStateStore, MemoryStateStore, StateStore};
