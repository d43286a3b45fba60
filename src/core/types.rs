use crate::core::{MigrationError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

// ============================================================================
// Phase Sequence
// ============================================================================

/// One stage of the fixed migration sequence.
///
/// The order is hard-coded; `OptimisedRoot` and `TempCleanup` are the two
/// optional stages, enabled via `MigrationConfig`. `Failed` is a terminal
/// error state reachable from anywhere and never part of the forward
/// sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Preparation,
    OptimisedRoot,
    Discovery,
    LinkInline,
    SafeDuplicates,
    ResolveDuplicates,
    FixLinks,
    Consolidate,
    Quarantine,
    TempCleanup,
    Cleanup,
    UpdateSubfolder,
    Complete,
    Failed,
}

/// The full superset sequence, in execution order.
const PHASE_ORDER: [Phase; 13] = [
    Phase::Preparation,
    Phase::OptimisedRoot,
    Phase::Discovery,
    Phase::LinkInline,
    Phase::SafeDuplicates,
    Phase::ResolveDuplicates,
    Phase::FixLinks,
    Phase::Consolidate,
    Phase::Quarantine,
    Phase::TempCleanup,
    Phase::Cleanup,
    Phase::UpdateSubfolder,
    Phase::Complete,
];

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Preparation => "preparation",
            Phase::OptimisedRoot => "optimised_root",
            Phase::Discovery => "discovery",
            Phase::LinkInline => "link_inline",
            Phase::SafeDuplicates => "safe_duplicates",
            Phase::ResolveDuplicates => "resolve_duplicates",
            Phase::FixLinks => "fix_links",
            Phase::Consolidate => "consolidate",
            Phase::Quarantine => "quarantine",
            Phase::TempCleanup => "temp_cleanup",
            Phase::Cleanup => "cleanup",
            Phase::UpdateSubfolder => "update_subfolder",
            Phase::Complete => "complete",
            Phase::Failed => "failed",
        }
    }

    /// Position in the superset sequence. `Failed` has no position.
    pub fn order_index(&self) -> Option<usize> {
        PHASE_ORDER.iter().position(|p| p == self)
    }

    /// The forward sequence for a run, with optional stages filtered by
    /// configuration flags.
    pub fn sequence(optimised_root: bool, temp_cleanup: bool) -> Vec<Phase> {
        PHASE_ORDER
            .iter()
            .copied()
            .filter(|p| match p {
                Phase::OptimisedRoot => optimised_root,
                Phase::TempCleanup => temp_cleanup,
                _ => true,
            })
            .collect()
    }

    /// Phases at or after `self` in the superset order (used by the
    /// rollback engine's `from` mode).
    pub fn and_after(&self) -> Vec<Phase> {
        match self.order_index() {
            Some(idx) => PHASE_ORDER[idx..].to_vec(),
            None => Vec::new(),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Phase {
    type Err = MigrationError;

    fn from_str(s: &str) -> Result<Self> {
        PHASE_ORDER
            .iter()
            .copied()
            .chain(std::iter::once(Phase::Failed))
            .find(|p| p.as_str() == s)
            .ok_or_else(|| MigrationError::Checkpoint(format!("unrecognized phase '{}'", s)))
    }
}

// ============================================================================
// Run Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Paused,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Paused => "paused",
        };
        f.write_str(s)
    }
}

// ============================================================================
// Run Stats
// ============================================================================

/// Named counters accumulated over one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunStats {
    pub files_moved: u64,
    pub files_quarantined: u64,
    pub duplicates_resolved: u64,
    pub links_fixed: u64,
    pub inline_images_linked: u64,
    pub errors: u64,
    pub retries: u64,
    pub checkpoints_saved: u64,
    pub resume_count: u64,
    /// Epoch millis of the first start of this run.
    pub started_at: i64,
}

impl RunStats {
    pub fn new() -> Self {
        Self {
            started_at: chrono::Utc::now().timestamp_millis(),
            ..Default::default()
        }
    }
}

// ============================================================================
// Migration Run
// ============================================================================

/// Live state of one migration run.
///
/// Mutated by the orchestrator after every phase and sub-batch; the
/// processed-id set only ever grows within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationRun {
    pub migration_id: String,
    pub phase: Phase,
    pub status: RunStatus,
    pub pid: u32,
    pub batch_cursor: u64,
    /// Total work items known for this run (from the inventory service).
    pub total_items: u64,
    pub processed_ids: BTreeSet<String>,
    pub stats: RunStats,
    pub error: Option<String>,
    pub started_at: i64,
    pub updated_at: i64,
    pub completed_at: Option<i64>,
}

impl MigrationRun {
    pub fn new(migration_id: &str) -> Result<Self> {
        validate_migration_id(migration_id)?;
        let now = chrono::Utc::now().timestamp_millis();
        Ok(Self {
            migration_id: migration_id.to_string(),
            phase: Phase::Preparation,
            status: RunStatus::Running,
            pid: std::process::id(),
            batch_cursor: 0,
            total_items: 0,
            processed_ids: BTreeSet::new(),
            stats: RunStats::new(),
            error: None,
            started_at: now,
            updated_at: now,
            completed_at: None,
        })
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().timestamp_millis();
    }

    pub fn mark_processed(&mut self, item_id: impl Into<String>) {
        self.processed_ids.insert(item_id.into());
        self.touch();
    }

    pub fn enter_phase(&mut self, phase: Phase) {
        self.phase = phase;
        self.batch_cursor = 0;
        self.touch();
    }

    pub fn mark_completed(&mut self) {
        self.status = RunStatus::Completed;
        self.phase = Phase::Complete;
        self.completed_at = Some(chrono::Utc::now().timestamp_millis());
        self.touch();
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.status = RunStatus::Failed;
        self.error = Some(message.into());
        self.touch();
    }
}

/// Migration ids become file names and store keys, so they are restricted
/// to `[A-Za-z0-9_-]+` before any path is derived from them.
pub fn validate_migration_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(MigrationError::InvalidInput(
            "migration id must not be empty".into(),
        ));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(MigrationError::InvalidInput(format!(
            "migration id '{}' contains characters outside [A-Za-z0-9_-]",
            id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_full_sequence_order() {
        let seq = Phase::sequence(true, true);
        assert_eq!(seq.first(), Some(&Phase::Preparation));
        assert_eq!(seq.last(), Some(&Phase::Complete));
        assert_eq!(seq.len(), 13);
    }

    #[test]
    fn test_optional_phases_filtered() {
        let seq = Phase::sequence(false, false);
        assert!(!seq.contains(&Phase::OptimisedRoot));
        assert!(!seq.contains(&Phase::TempCleanup));
        assert_eq!(seq.len(), 11);
    }

    #[test]
    fn test_phase_round_trip() {
        for phase in Phase::sequence(true, true) {
            assert_eq!(Phase::from_str(phase.as_str()).unwrap(), phase);
        }
    }

    #[test]
    fn test_unrecognized_phase_is_an_error() {
        let err = Phase::from_str("warp_speed").unwrap_err();
        assert!(err.to_string().contains("warp_speed"));
    }

    #[test]
    fn test_and_after_includes_self() {
        let tail = Phase::Quarantine.and_after();
        assert_eq!(tail.first(), Some(&Phase::Quarantine));
        assert!(tail.contains(&Phase::Cleanup));
        assert!(!tail.contains(&Phase::FixLinks));
    }

    #[test]
    fn test_migration_id_validation() {
        assert!(validate_migration_id("mig-2024_01").is_ok());
        assert!(validate_migration_id("").is_err());
        assert!(validate_migration_id("../escape").is_err());
        assert!(validate_migration_id("a/b").is_err());
    }

    #[test]
    fn test_run_lifecycle() {
        let mut run = MigrationRun::new("m1").unwrap();
        assert_eq!(run.status, RunStatus::Running);
        run.mark_processed("asset:1");
        run.enter_phase(Phase::Discovery);
        assert_eq!(run.batch_cursor, 0);
        run.mark_failed("boom");
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.error.as_deref(), Some("boom"));
    }
}
