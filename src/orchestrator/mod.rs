use crate::changelog::{Change, ChangeLog};
use crate::checkpoint::{Checkpoint, CheckpointStore, QuickState};
use crate::config::MigrationConfig;
use crate::core::{MigrationError, MigrationRun, Phase, Result, RunStats, RunStatus};
use crate::interface::{ContentRepository, DuplicateGroup, Inventory, ObjectStore};
use crate::lock::{LockGuard, RunLock};
use crate::retry::{RetryManager, RetrySummary};
use crate::store::StateStore;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

// ============================================================================
// Confirmation Gates
// ============================================================================

/// Operator confirmation at the two gates (after discovery, before
/// quarantine). Skipped entirely when `auto_confirm` is set.
pub trait Confirm {
    fn confirm(&self, gate: &str, summary: &str) -> bool;
}

/// Always answers yes; the unattended-execution collaborator.
pub struct AutoConfirm;

impl Confirm for AutoConfirm {
    fn confirm(&self, _gate: &str, _summary: &str) -> bool {
        true
    }
}

// ============================================================================
// Run Outcome
// ============================================================================

/// Final report of one `run`/`resume` invocation.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub migration_id: String,
    pub status: RunStatus,
    pub phase: Phase,
    pub processed: u64,
    pub total: u64,
    pub stats: RunStats,
    pub retries: RetrySummary,
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Drives the fixed phase sequence for one migration run.
///
/// Owns the run lock for the duration of a run, checkpoints at sub-phase
/// granularity, records every external mutation in the change log before
/// treating it as committed, and on any fatal error saves a resumable
/// checkpoint before emitting anything else.
pub struct Orchestrator<'a> {
    config: MigrationConfig,
    store: Arc<dyn StateStore>,
    checkpoints: CheckpointStore,
    changelog: ChangeLog,
    retry: RetryManager,
    repo: &'a dyn ContentRepository,
    files: &'a dyn ObjectStore,
    inventory: &'a dyn Inventory,
    confirm: &'a dyn Confirm,
    run: MigrationRun,
    /// In-progress duplicate group reconstructed from durable scratch on
    /// resume; consumed by the next `resolve_duplicates` entry.
    pending_group: Option<DuplicateGroup>,
    last_refresh: Instant,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        config: MigrationConfig,
        store: Arc<dyn StateStore>,
        repo: &'a dyn ContentRepository,
        files: &'a dyn ObjectStore,
        inventory: &'a dyn Inventory,
        confirm: &'a dyn Confirm,
    ) -> Result<Self> {
        config.validate()?;
        let checkpoints = CheckpointStore::new(&config.checkpoint_dir, Arc::clone(&store));
        let changelog = ChangeLog::open(
            config
                .checkpoint_dir
                .join(format!("{}.changes.jsonl", config.migration_id)),
            config.flush_every,
        )?;
        let run = MigrationRun::new(&config.migration_id)?;
        let retry = RetryManager::new(config.max_retries, config.base_delay);
        Ok(Self {
            config,
            store,
            checkpoints,
            changelog,
            retry,
            repo,
            files,
            inventory,
            confirm,
            run,
            pending_group: None,
            last_refresh: Instant::now(),
        })
    }

    pub fn run_state(&self) -> &MigrationRun {
        &self.run
    }

    // ------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------

    /// Fresh run: acquire the lock, warn about the configured modes, walk
    /// every phase from the top.
    pub fn run(&mut self) -> Result<RunReport> {
        let guard = self
            .lock()
            .acquire(self.config.lock_wait_timeout, false)?;
        self.print_mode_warnings();
        self.run = MigrationRun::new(&self.config.migration_id)?;
        self.checkpoints
            .save_quick_state(&QuickState::from_run(&self.run))?;

        let first = self.sequence()[0];
        self.drive(first, &guard)
    }

    /// Resume a previously checkpointed run.
    ///
    /// Quick state is preferred for fast restoration unless an explicit
    /// checkpoint id is requested. The lock is reacquired in resume mode,
    /// then the saved phase decides the re-entry point: early phases
    /// restart from the top, mid-sequence phases cascade forward from
    /// where they stopped, terminal-adjacent phases just re-verify.
    pub fn resume(&mut self, checkpoint_id: Option<&str>) -> Result<RunReport> {
        self.restore_state(checkpoint_id)?;
        self.run.status = RunStatus::Running;
        self.run.error = None;
        self.run.stats.resume_count += 1;

        let guard = self.lock().acquire(self.config.lock_wait_timeout, true)?;
        info!(
            migration_id = %self.run.migration_id,
            phase = %self.run.phase,
            processed = self.run.processed_ids.len(),
            "resuming migration"
        );

        let saved_phase = self.run.phase;
        match saved_phase {
            Phase::Failed => Err(MigrationError::Checkpoint(
                "checkpoint recorded phase 'failed'; resume from the failing phase instead".into(),
            )),
            // Cheap to redo and not yet durable enough to trust partials.
            Phase::Preparation | Phase::OptimisedRoot | Phase::Discovery => {
                let first = self.sequence()[0];
                self.run.batch_cursor = 0;
                self.drive(first, &guard)
            }
            // Nothing left but final verification.
            Phase::Cleanup | Phase::Complete => {
                self.run.mark_completed();
                self.save_checkpoint()?;
                self.changelog.flush()?;
                guard.release()?;
                Ok(self.report())
            }
            // Mid-sequence: granular tracking, cascade forward.
            phase => {
                if phase == Phase::ResolveDuplicates {
                    self.reload_duplicate_scratch()?;
                }
                let start = if self.sequence().contains(&phase) {
                    phase
                } else {
                    // An optional phase was recorded but is now disabled;
                    // continue from the next enabled phase after it.
                    self.next_enabled_after(phase)?
                };
                self.drive(start, &guard)
            }
        }
    }

    /// Operator escape hatch: drop the lock row regardless of holder.
    pub fn force_cleanup_lock(&self) -> Result<()> {
        self.lock().force_cleanup()
    }

    // ------------------------------------------------------------------
    // Phase loop
    // ------------------------------------------------------------------

    fn drive(&mut self, start: Phase, guard: &LockGuard) -> Result<RunReport> {
        match self.run_phases(start, guard) {
            Ok(RunStatus::Paused) => {
                self.run.status = RunStatus::Paused;
                self.save_checkpoint()?;
                self.changelog.flush()?;
                info!(migration_id = %self.run.migration_id, "run paused at operator gate");
                Ok(self.report())
            }
            Ok(_) => {
                self.changelog.flush()?;
                let report = self.report();
                info!(
                    migration_id = %report.migration_id,
                    processed = report.processed,
                    retries = report.retries.total_retries,
                    "migration completed"
                );
                Ok(report)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn run_phases(&mut self, start: Phase, guard: &LockGuard) -> Result<RunStatus> {
        let sequence = self.sequence();
        let start_idx = sequence
            .iter()
            .position(|p| *p == start)
            .ok_or_else(|| {
                MigrationError::Checkpoint(format!("phase '{}' is not enabled for this run", start))
            })?;
        let resume_cursor = self.run.batch_cursor;

        for (i, phase) in sequence[start_idx..].iter().copied().enumerate() {
            if phase == Phase::Quarantine && !self.gate("quarantine", "about to quarantine orphaned files")? {
                return Ok(RunStatus::Paused);
            }

            self.run.enter_phase(phase);
            if i == 0 {
                // First phase of a resume continues from the saved batch.
                self.run.batch_cursor = resume_cursor;
            }
            self.changelog.set_phase(phase)?;
            info!(migration_id = %self.run.migration_id, phase = %phase, "entering phase");

            match phase {
                Phase::Preparation => self.phase_preparation()?,
                Phase::OptimisedRoot => self.phase_optimised_root(guard)?,
                Phase::Discovery => self.phase_discovery()?,
                Phase::LinkInline => self.phase_link_inline(guard)?,
                Phase::SafeDuplicates => self.phase_duplicates(guard, true)?,
                Phase::ResolveDuplicates => self.phase_duplicates(guard, false)?,
                Phase::FixLinks => self.phase_fix_links(guard)?,
                Phase::Consolidate => self.phase_consolidate(guard)?,
                Phase::Quarantine => self.phase_quarantine(guard)?,
                Phase::TempCleanup => self.phase_temp_cleanup(guard)?,
                Phase::Cleanup => self.phase_cleanup()?,
                Phase::UpdateSubfolder => self.phase_update_subfolder(guard)?,
                Phase::Complete => self.phase_complete()?,
                Phase::Failed => unreachable!("failed is never part of the forward sequence"),
            }

            self.save_checkpoint()?;

            if phase == Phase::Discovery
                && !self.gate("discovery", "inventory analysis complete")?
            {
                return Ok(RunStatus::Paused);
            }
        }
        Ok(RunStatus::Completed)
    }

    fn gate(&mut self, name: &str, summary: &str) -> Result<bool> {
        if self.config.auto_confirm {
            return Ok(true);
        }
        // Bound the loss window before blocking on the operator.
        self.changelog.flush()?;
        Ok(self.confirm.confirm(name, summary))
    }

    // ------------------------------------------------------------------
    // Phases
    // ------------------------------------------------------------------

    fn phase_preparation(&mut self) -> Result<()> {
        std::fs::create_dir_all(&self.config.checkpoint_dir)?;
        std::fs::create_dir_all(&self.config.backup_dir)?;
        self.run.total_items = self.inventory.total_assets()?;
        Ok(())
    }

    fn phase_optimised_root(&mut self, guard: &LockGuard) -> Result<()> {
        let relocations = self.inventory.root_relocations()?;
        for relocation in relocations {
            let key = format!("root:{}", relocation.asset_id);
            if self.run.processed_ids.contains(&key) {
                continue;
            }
            self.maybe_refresh(guard)?;
            let op = format!("optimised-root:{}", relocation.asset_id);
            let files = self.files;
            self.retry
                .retry_operation(&op, || files.rename(&relocation.from, &relocation.to))?;
            self.repo
                .move_asset(&relocation.asset_id, folder_of(&relocation.to))?;
            self.changelog.log_change(Change::MovedAsset {
                asset_id: relocation.asset_id.clone(),
                from: relocation.from.clone(),
                to: relocation.to.clone(),
            })?;
            self.run.stats.files_moved += 1;
            self.note_processed(key)?;
        }
        Ok(())
    }

    fn phase_discovery(&mut self) -> Result<()> {
        let total = self.inventory.total_assets()?;
        let duplicates = self.inventory.duplicate_groups(false)?.len();
        let broken = self.inventory.broken_links()?.len();
        let orphaned = self.inventory.orphaned_files()?.len();
        self.run.total_items = total;
        info!(
            migration_id = %self.run.migration_id,
            total_assets = total,
            duplicate_groups = duplicates,
            broken_links = broken,
            orphaned_files = orphaned,
            "discovery summary"
        );
        Ok(())
    }

    fn phase_link_inline(&mut self, guard: &LockGuard) -> Result<()> {
        for image in self.inventory.inline_images()? {
            let key = format!("inline:{}:{}", image.entry_id, image.field);
            if self.run.processed_ids.contains(&key) {
                continue;
            }
            self.maybe_refresh(guard)?;
            let op = format!("link-inline:{}", image.entry_id);
            let repo = self.repo;
            self.retry.retry_operation(&op, || {
                repo.update_field(&image.entry_id, &image.field, &image.updated_content)
            })?;
            self.changelog.log_change(Change::InlineImageLinked {
                entry_id: image.entry_id.clone(),
                field: image.field.clone(),
                original_content: image.original_content.clone(),
                updated_content: image.updated_content.clone(),
            })?;
            self.run.stats.inline_images_linked += 1;
            self.note_processed(key)?;
        }
        Ok(())
    }

    fn phase_duplicates(&mut self, guard: &LockGuard, safe_only: bool) -> Result<()> {
        if !safe_only
            && let Some(group) = self.pending_group.take()
        {
            // The group materialized before the crash; finish it from the
            // durable scratch copy instead of re-deriving it.
            let key = format!("dup:{}", group.checksum);
            if !self.run.processed_ids.contains(&key) {
                self.maybe_refresh(guard)?;
                self.resolve_group(&group)?;
                self.run.stats.duplicates_resolved += 1;
                self.note_processed(key)?;
            }
        }
        let groups = self.inventory.duplicate_groups(safe_only)?;
        for group in groups {
            let key = format!("dup:{}", group.checksum);
            if self.run.processed_ids.contains(&key) {
                continue;
            }
            self.maybe_refresh(guard)?;
            if !safe_only {
                // Materialize the in-progress group so a crash mid-group
                // resumes from durable scratch instead of recomputing.
                self.store.save_scratch(
                    &self.run.migration_id,
                    Phase::ResolveDuplicates.as_str(),
                    &serde_json::to_value(&group)?,
                )?;
            }
            self.resolve_group(&group)?;
            self.run.stats.duplicates_resolved += 1;
            self.note_processed(key)?;
        }
        if !safe_only {
            self.store.clear_scratch(&self.run.migration_id)?;
        }
        Ok(())
    }

    fn resolve_group(&mut self, group: &DuplicateGroup) -> Result<()> {
        for dup in &group.remove {
            // Per-removal progress keys: a crash mid-group must not make
            // a resumed run repeat removals that already landed.
            let key = format!("dup:{}:{}", group.checksum, dup.asset_id);
            if self.run.processed_ids.contains(&key) {
                continue;
            }
            let quarantine_path = format!("{}/{}", self.config.quarantine_prefix, dup.path);
            // A removal interrupted right after its rename has the file in
            // quarantine already; renaming again would fail on the gone
            // source.
            if !self.files.exists(&quarantine_path)? {
                let op = format!("resolve-duplicate:{}", dup.asset_id);
                let files = self.files;
                let path = dup.path.clone();
                let target = quarantine_path.clone();
                self.retry
                    .retry_operation(&op, || files.rename(&path, &target))?;
            }
            self.repo
                .retarget_relations(&dup.asset_id, &group.keep.asset_id)?;
            self.changelog.log_change(Change::ResolvedDuplicate {
                kept_asset_id: group.keep.asset_id.clone(),
                removed_asset_id: dup.asset_id.clone(),
                removed_path: dup.path.clone(),
                quarantine_path,
            })?;
            self.note_processed(key)?;
        }
        Ok(())
    }

    fn phase_fix_links(&mut self, guard: &LockGuard) -> Result<()> {
        for link in self.inventory.broken_links()? {
            let key = format!("link:{}:{}", link.element_id, link.field);
            if self.run.processed_ids.contains(&key) {
                continue;
            }
            self.maybe_refresh(guard)?;
            let op = format!("fix-link:{}:{}", link.element_id, link.field);
            let repo = self.repo;
            self.retry.retry_operation(&op, || {
                repo.update_field(&link.element_id, &link.field, &link.target)
            })?;
            self.changelog.log_change(Change::FixedBrokenLink {
                element_id: link.element_id.clone(),
                field: link.field.clone(),
                original: link.current.clone(),
                updated: link.target.clone(),
            })?;
            self.run.stats.links_fixed += 1;
            self.note_processed(key)?;
        }
        Ok(())
    }

    fn phase_consolidate(&mut self, guard: &LockGuard) -> Result<()> {
        loop {
            let batch = self
                .inventory
                .asset_batch(self.run.batch_cursor, self.config.batch_size)?;
            if batch.is_empty() {
                break;
            }
            let batch_len = batch.len() as u64;
            for asset in batch {
                let key = format!("asset:{}", asset.id);
                if self.run.processed_ids.contains(&key) {
                    continue;
                }
                self.maybe_refresh(guard)?;
                let target = self.inventory.consolidated_folder(&asset)?;
                if target != asset.folder {
                    let from = asset.path();
                    let to = format!("{}/{}", target, asset.filename);
                    let op = format!("consolidate:{}", asset.id);
                    let files = self.files;
                    self.retry.retry_operation(&op, || files.rename(&from, &to))?;
                    self.repo.move_asset(&asset.id, &target)?;
                    self.changelog.log_change(Change::MovedAsset {
                        asset_id: asset.id.clone(),
                        from,
                        to,
                    })?;
                    self.run.stats.files_moved += 1;
                }
                self.run.mark_processed(key);
            }
            self.run.batch_cursor += batch_len;
            self.sync_retry_stats();
            self.checkpoints
                .save_quick_state(&QuickState::from_run(&self.run))?;
        }
        Ok(())
    }

    fn phase_quarantine(&mut self, guard: &LockGuard) -> Result<()> {
        for path in self.inventory.orphaned_files()? {
            let key = format!("orphan:{}", path);
            if self.run.processed_ids.contains(&key) {
                continue;
            }
            self.maybe_refresh(guard)?;
            let quarantine_path = format!("{}/{}", self.config.quarantine_prefix, path);
            let op = format!("quarantine:{}", path);
            let files = self.files;
            let from = path.clone();
            let to = quarantine_path.clone();
            self.retry.retry_operation(&op, || files.rename(&from, &to))?;
            self.changelog.log_change(Change::QuarantinedOrphanedFile {
                path,
                quarantine_path,
            })?;
            self.run.stats.files_quarantined += 1;
            self.note_processed(key)?;
        }
        Ok(())
    }

    fn phase_temp_cleanup(&mut self, guard: &LockGuard) -> Result<()> {
        // Temp files go through quarantine too, so even this phase stays
        // reversible.
        for path in self.inventory.temp_files()? {
            let key = format!("temp:{}", path);
            if self.run.processed_ids.contains(&key) {
                continue;
            }
            self.maybe_refresh(guard)?;
            let quarantine_path = format!("{}/{}", self.config.quarantine_prefix, path);
            let op = format!("temp-cleanup:{}", path);
            let files = self.files;
            let from = path.clone();
            let to = quarantine_path.clone();
            self.retry.retry_operation(&op, || files.rename(&from, &to))?;
            self.changelog.log_change(Change::QuarantinedOrphanedFile {
                path,
                quarantine_path,
            })?;
            self.run.stats.files_quarantined += 1;
            self.note_processed(key)?;
        }
        Ok(())
    }

    fn phase_cleanup(&mut self) -> Result<()> {
        self.changelog.log_change(Change::ClearedDerivedCaches)?;
        self.store.clear_scratch(&self.run.migration_id)?;

        // Janitor sweep: old checkpoint files and expired run rows.
        let report = self
            .checkpoints
            .cleanup_old_checkpoints(self.config.checkpoint_max_age_hours)?;
        let cutoff = chrono::Utc::now().timestamp_millis()
            - (self.config.run_retention_hours * 3600 * 1000) as i64;
        let purged = self.store.purge_runs_older_than(cutoff)?;
        info!(
            checkpoints_removed = report.removed,
            checkpoints_failed = report.failed,
            runs_purged = purged,
            "janitor sweep finished"
        );
        Ok(())
    }

    fn phase_update_subfolder(&mut self, guard: &LockGuard) -> Result<()> {
        for sub in self.inventory.subfolder_moves()? {
            let key = format!("subfolder:{}", sub.asset_id);
            if self.run.processed_ids.contains(&key) {
                continue;
            }
            self.maybe_refresh(guard)?;
            let op = format!("update-subfolder:{}", sub.asset_id);
            let repo = self.repo;
            self.retry
                .retry_operation(&op, || repo.move_asset(&sub.asset_id, &sub.new_folder))?;
            self.changelog.log_change(Change::UpdatedSubfolder {
                asset_id: sub.asset_id.clone(),
                old_folder: sub.old_folder.clone(),
                new_folder: sub.new_folder.clone(),
            })?;
            self.note_processed(key)?;
        }
        Ok(())
    }

    fn phase_complete(&mut self) -> Result<()> {
        self.sync_retry_stats();
        self.run.mark_completed();
        self.changelog.flush()
    }

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------

    fn lock(&self) -> RunLock {
        RunLock::new(
            Arc::clone(&self.store),
            &self.config.migration_id,
            self.config.lock_ttl,
        )
    }

    fn sequence(&self) -> Vec<Phase> {
        Phase::sequence(self.config.optimised_root, self.config.temp_cleanup)
    }

    fn next_enabled_after(&self, phase: Phase) -> Result<Phase> {
        let idx = phase
            .order_index()
            .ok_or_else(|| MigrationError::Checkpoint(format!("phase '{}' has no order", phase)))?;
        self.sequence()
            .into_iter()
            .find(|p| p.order_index().is_some_and(|i| i > idx))
            .ok_or_else(|| {
                MigrationError::Checkpoint(format!("no enabled phase after '{}'", phase))
            })
    }

    fn print_mode_warnings(&self) {
        if self.config.auto_confirm {
            warn!("auto-confirm is on: operator gates will not block");
        }
        if self.config.optimised_root {
            info!("optional phase enabled: optimised_root");
        }
        if self.config.temp_cleanup {
            info!("optional phase enabled: temp_cleanup");
        }
    }

    fn maybe_refresh(&mut self, guard: &LockGuard) -> Result<()> {
        if self.last_refresh.elapsed() >= self.config.lock_refresh_interval {
            if !guard.refresh()? {
                warn!(
                    migration_id = %self.run.migration_id,
                    "lock row no longer held by this run"
                );
            }
            self.last_refresh = Instant::now();
        }
        Ok(())
    }

    fn note_processed(&mut self, key: String) -> Result<()> {
        self.run.mark_processed(key);
        if self.run.processed_ids.len() % self.config.batch_size == 0 {
            self.sync_retry_stats();
            self.checkpoints
                .save_quick_state(&QuickState::from_run(&self.run))?;
        }
        Ok(())
    }

    fn sync_retry_stats(&mut self) {
        self.run.stats.retries = self.retry.total_retries();
    }

    fn save_checkpoint(&mut self) -> Result<()> {
        self.sync_retry_stats();
        self.run.stats.checkpoints_saved += 1;
        let payload = self
            .store
            .load_scratch(&self.run.migration_id, Phase::ResolveDuplicates.as_str())?
            .unwrap_or(serde_json::Value::Null);
        self.checkpoints
            .save_checkpoint(&Checkpoint::from_run(&self.run, payload))
    }

    /// Fatal-error path: checkpoint save comes first, before any further
    /// output, so state survives even when the output channel is the
    /// thing that is failing.
    fn fail(&mut self, e: MigrationError) -> MigrationError {
        self.run.mark_failed(e.to_string());
        if let Err(save_err) = self.save_checkpoint() {
            // Never mask the original error with a checkpoint failure.
            error!(
                migration_id = %self.run.migration_id,
                error = %save_err,
                "failed to save failure checkpoint"
            );
        }
        error!(
            migration_id = %self.run.migration_id,
            phase = %self.run.phase,
            error = %e,
            "migration failed; resume with the saved checkpoint once the cause is fixed"
        );
        if let Err(flush_err) = self.changelog.flush() {
            error!(error = %flush_err, "failed to flush change log on failure path");
        }
        e
    }

    fn restore_state(&mut self, checkpoint_id: Option<&str>) -> Result<()> {
        match checkpoint_id {
            Some(id) => {
                let checkpoint = self
                    .checkpoints
                    .load_latest_checkpoint(Some(id))?
                    .ok_or_else(|| {
                        MigrationError::NotFound(format!("no checkpoint for '{}'", id))
                    })?;
                self.apply_checkpoint(checkpoint);
            }
            None => {
                if let Some(quick) = self
                    .checkpoints
                    .load_quick_state(&self.config.migration_id)?
                {
                    self.run.phase = quick.phase;
                    self.run.batch_cursor = quick.batch_cursor;
                    self.run.processed_ids = quick.processed_ids;
                    self.run.stats = quick.stats;
                } else if let Some(checkpoint) = self
                    .checkpoints
                    .load_latest_checkpoint(Some(&self.config.migration_id))?
                {
                    self.apply_checkpoint(checkpoint);
                } else {
                    return Err(MigrationError::NotFound(format!(
                        "nothing to resume for migration '{}'",
                        self.config.migration_id
                    )));
                }
            }
        }
        Ok(())
    }

    fn apply_checkpoint(&mut self, checkpoint: Checkpoint) {
        self.run.migration_id = checkpoint.migration_id;
        self.run.phase = checkpoint.phase;
        self.run.batch_cursor = checkpoint.batch_cursor;
        self.run.total_items = checkpoint.total_items;
        self.run.processed_ids = checkpoint.processed_ids;
        self.run.stats = checkpoint.stats;
        self.run.error = checkpoint.error;
    }

    fn reload_duplicate_scratch(&mut self) -> Result<()> {
        if let Some(scratch) = self
            .store
            .load_scratch(&self.run.migration_id, Phase::ResolveDuplicates.as_str())?
        {
            let group: DuplicateGroup = serde_json::from_value(scratch)?;
            info!(
                migration_id = %self.run.migration_id,
                checksum = %group.checksum,
                "reconstructed in-progress duplicate group from scratch state"
            );
            self.pending_group = Some(group);
        }
        Ok(())
    }

    fn report(&self) -> RunReport {
        RunReport {
            migration_id: self.run.migration_id.clone(),
            status: self.run.status,
            phase: self.run.phase,
            processed: self.run.processed_ids.len() as u64,
            total: self.run.total_items,
            stats: self.run.stats.clone(),
            retries: self.retry.summary(),
        }
    }
}

fn folder_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}
