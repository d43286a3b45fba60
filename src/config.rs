use crate::core::{MigrationError, Result, validate_migration_id};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for one migration run.
///
/// Built with consuming setters, validated once before the orchestrator
/// starts.
#[derive(Debug, Clone)]
pub struct MigrationConfig {
    /// Path-safe identifier of the migration (`[A-Za-z0-9_-]+`).
    pub migration_id: String,

    /// Directory holding full checkpoints and quick-state files.
    pub checkpoint_dir: PathBuf,

    /// Directory holding pre-migration database backup snapshots.
    pub backup_dir: PathBuf,

    /// Object-store prefix under which quarantined files are parked.
    pub quarantine_prefix: String,

    /// Items processed per sub-batch (checkpoint granularity).
    pub batch_size: usize,

    /// Retry ceiling for retryable operations.
    pub max_retries: u32,

    /// First backoff delay; doubles per attempt.
    pub base_delay: Duration,

    /// Lock row time-to-live.
    pub lock_ttl: Duration,

    /// How long `acquire` waits for a contended lock before giving up.
    pub lock_wait_timeout: Duration,

    /// Minimum interval between lock refreshes inside heavy phases.
    pub lock_refresh_interval: Duration,

    /// Skip both operator confirmation gates (unattended execution).
    pub auto_confirm: bool,

    /// Flush the change log every N buffered entries.
    pub flush_every: usize,

    /// Checkpoint files older than this are removed by the janitor sweep.
    pub checkpoint_max_age_hours: u64,

    /// Durable run-state rows older than this are purged by the sweep.
    pub run_retention_hours: u64,

    /// Enable the optional `optimised_root` phase.
    pub optimised_root: bool,

    /// Enable the optional `temp_cleanup` phase.
    pub temp_cleanup: bool,
}

impl MigrationConfig {
    pub fn new(migration_id: &str) -> Self {
        Self {
            migration_id: migration_id.to_string(),
            checkpoint_dir: PathBuf::from("storage/migration-checkpoints"),
            backup_dir: PathBuf::from("storage/migration-backups"),
            quarantine_prefix: "_quarantine".to_string(),
            batch_size: 100,
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            lock_ttl: Duration::from_secs(12 * 3600),
            lock_wait_timeout: Duration::from_secs(30),
            lock_refresh_interval: Duration::from_secs(60),
            auto_confirm: false,
            flush_every: 50,
            checkpoint_max_age_hours: 7 * 24,
            run_retention_hours: 30 * 24,
            optimised_root: false,
            temp_cleanup: false,
        }
    }

    pub fn checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = dir.into();
        self
    }

    pub fn backup_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_dir = dir.into();
        self
    }

    pub fn quarantine_prefix(mut self, prefix: &str) -> Self {
        self.quarantine_prefix = prefix.to_string();
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    pub fn lock_wait_timeout(mut self, timeout: Duration) -> Self {
        self.lock_wait_timeout = timeout;
        self
    }

    pub fn lock_refresh_interval(mut self, interval: Duration) -> Self {
        self.lock_refresh_interval = interval;
        self
    }

    pub fn auto_confirm(mut self, yes: bool) -> Self {
        self.auto_confirm = yes;
        self
    }

    pub fn flush_every(mut self, n: usize) -> Self {
        self.flush_every = n;
        self
    }

    pub fn checkpoint_max_age_hours(mut self, hours: u64) -> Self {
        self.checkpoint_max_age_hours = hours;
        self
    }

    pub fn run_retention_hours(mut self, hours: u64) -> Self {
        self.run_retention_hours = hours;
        self
    }

    pub fn optimised_root(mut self, on: bool) -> Self {
        self.optimised_root = on;
        self
    }

    pub fn temp_cleanup(mut self, on: bool) -> Self {
        self.temp_cleanup = on;
        self
    }

    pub fn validate(&self) -> Result<()> {
        validate_migration_id(&self.migration_id)?;
        if self.batch_size == 0 {
            return Err(MigrationError::InvalidInput(
                "batch_size must be at least 1".into(),
            ));
        }
        if self.flush_every == 0 {
            return Err(MigrationError::InvalidInput(
                "flush_every must be at least 1".into(),
            ));
        }
        if self.lock_ttl < self.lock_refresh_interval {
            return Err(MigrationError::InvalidInput(
                "lock_ttl must be longer than lock_refresh_interval".into(),
            ));
        }
        Ok(())
    }
}
