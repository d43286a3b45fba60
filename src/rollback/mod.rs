use crate::changelog::{Change, ChangeLog, LoadedChange};
use crate::core::{MigrationError, Phase, Result, validate_migration_id};
use crate::interface::{ContentRepository, DatabaseAdmin, ObjectStore};
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

// ============================================================================
// Modes & Reports
// ============================================================================

/// Phase filter semantics for the change-by-change path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackMode {
    /// Reverse entries from exactly the given phase(s).
    Only,
    /// Reverse entries from the given phase and every later phase in the
    /// fixed order.
    From,
}

/// Outcome of (or plan for) a database restore.
#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub backup_file: PathBuf,
    pub size_bytes: u64,
    pub size_mb: f64,
    pub affected_tables: Vec<String>,
    pub estimated_secs: u64,
    pub applied: bool,
}

/// Outcome of (or plan for) a change-by-change rollback.
#[derive(Debug, Clone, Default)]
pub struct RollbackStats {
    pub reversed: u64,
    pub failed: u64,
    pub unknown: u64,
    pub by_type: BTreeMap<String, u64>,
    pub by_phase: BTreeMap<String, u64>,
    pub estimated_secs: u64,
    pub dry_run: bool,
}

// ============================================================================
// Rollback Engine
// ============================================================================

/// Reverses a migration either wholesale (restore the pre-migration
/// database backup) or change-by-change from the ledger.
pub struct RollbackEngine<'a> {
    changelog: &'a ChangeLog,
    repo: &'a dyn ContentRepository,
    files: &'a dyn ObjectStore,
    db: &'a dyn DatabaseAdmin,
    backup_dir: PathBuf,
}

/// Rough apply throughput used for restore time estimates.
const RESTORE_MB_PER_SEC: f64 = 2.0;
/// Rough per-entry cost for change-by-change estimates.
const REVERSAL_MS_PER_ENTRY: u64 = 50;

impl<'a> RollbackEngine<'a> {
    pub fn new(
        changelog: &'a ChangeLog,
        repo: &'a dyn ContentRepository,
        files: &'a dyn ObjectStore,
        db: &'a dyn DatabaseAdmin,
        backup_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            changelog,
            repo,
            files,
            db,
            backup_dir: backup_dir.into(),
        }
    }

    // ------------------------------------------------------------------
    // Database-restore path
    // ------------------------------------------------------------------

    /// Restore the full pre-migration backup for `migration_id`.
    ///
    /// The backup is verified before anything touches the database; a
    /// verification failure is always fatal. With `dry_run` the report is
    /// produced without applying.
    pub fn rollback_via_database(&self, migration_id: &str, dry_run: bool) -> Result<RestoreReport> {
        let path = self.backup_path(migration_id)?;
        let sql = self.verify_backup(&path)?;
        let size_bytes = fs::metadata(&path)?.len();
        let size_mb = size_bytes as f64 / (1024.0 * 1024.0);
        let report = RestoreReport {
            backup_file: path,
            size_bytes,
            size_mb,
            affected_tables: affected_tables(&sql),
            estimated_secs: (size_mb / RESTORE_MB_PER_SEC).ceil() as u64,
            applied: !dry_run,
        };
        if dry_run {
            return Ok(report);
        }

        info!(
            migration_id,
            size_mb = format!("{:.1}", report.size_mb),
            tables = report.affected_tables.len(),
            "applying database restore"
        );
        self.db.set_foreign_key_checks(false)?;
        let apply = self.db.execute_script(&sql);
        // Constraints come back on whether the apply succeeded or not.
        let reenable = self.db.set_foreign_key_checks(true);
        apply?;
        reenable?;
        self.db.invalidate_caches()?;
        Ok(report)
    }

    fn backup_path(&self, migration_id: &str) -> Result<PathBuf> {
        validate_migration_id(migration_id)
            .map_err(|_| MigrationError::PathTraversal(migration_id.to_string()))?;
        let path = self.backup_dir.join(format!("{}.sql", migration_id));
        if self.backup_dir.exists() {
            let canonical_dir = self.backup_dir.canonicalize()?;
            let parent = path
                .parent()
                .ok_or_else(|| MigrationError::PathTraversal(migration_id.to_string()))?;
            if parent.canonicalize()? != canonical_dir {
                return Err(MigrationError::PathTraversal(migration_id.to_string()));
            }
        }
        Ok(path)
    }

    /// Integrity checks on the backup file; returns its contents when
    /// every check passes.
    fn verify_backup(&self, path: &Path) -> Result<String> {
        if !path.exists() {
            return Err(MigrationError::BackupVerification(format!(
                "backup file '{}' does not exist",
                path.display()
            )));
        }
        if path.extension().and_then(|e| e.to_str()) != Some("sql") {
            return Err(MigrationError::BackupVerification(format!(
                "backup file '{}' is not a .sql file",
                path.display()
            )));
        }
        let sql = fs::read_to_string(path)
            .map_err(|e| MigrationError::BackupVerification(format!("unreadable backup: {}", e)))?;
        if sql.trim().is_empty() {
            return Err(MigrationError::BackupVerification(format!(
                "backup file '{}' is empty",
                path.display()
            )));
        }
        let statements =
            Regex::new(r"(?i)\b(INSERT\s+INTO|CREATE\s+TABLE|UPDATE|REPLACE\s+INTO|COPY)\b")
                .expect("statement pattern is valid");
        if !statements.is_match(&sql) {
            return Err(MigrationError::BackupVerification(format!(
                "backup file '{}' contains no recognizable restore statements",
                path.display()
            )));
        }
        let suspicious = Regex::new(
            r"(?i)(LOAD_FILE|INTO\s+(OUTFILE|DUMPFILE)|xp_cmdshell|EXEC(UTE)?\s+IMMEDIATE|\bsystem\s*\()",
        )
        .expect("suspicious pattern is valid");
        if let Some(found) = suspicious.find(&sql) {
            return Err(MigrationError::BackupVerification(format!(
                "backup file '{}' contains suspicious operation '{}'",
                path.display(),
                found.as_str()
            )));
        }
        Ok(sql)
    }

    // ------------------------------------------------------------------
    // Change-by-change path
    // ------------------------------------------------------------------

    /// Reverse ledger entries, newest first.
    ///
    /// `phases` filters which entries qualify according to `mode`; `None`
    /// reverses everything. One entry's failure never stops the rest;
    /// unknown kinds are warned about and counted.
    pub fn rollback(
        &self,
        phases: Option<&[Phase]>,
        mode: RollbackMode,
        dry_run: bool,
    ) -> Result<RollbackStats> {
        let selected = phases.map(|given| match mode {
            RollbackMode::Only => given.to_vec(),
            RollbackMode::From => {
                let earliest = given
                    .iter()
                    .filter_map(|p| p.order_index())
                    .min()
                    .unwrap_or(0);
                Phase::sequence(true, true)
                    .into_iter()
                    .filter(|p| p.order_index().is_some_and(|i| i >= earliest))
                    .collect()
            }
        });

        let mut stats = RollbackStats {
            dry_run,
            ..Default::default()
        };
        let mut entries = self.changelog.load_changes()?;
        entries.reverse(); // strict reverse chronological order

        for entry in entries {
            match entry {
                LoadedChange::Unknown { line, kind, .. } => {
                    warn!(line, kind = %kind, "cannot reverse unknown change type");
                    stats.unknown += 1;
                }
                LoadedChange::Known(record) => {
                    if let Some(selected) = &selected
                        && !selected.contains(&record.phase)
                    {
                        continue;
                    }
                    *stats
                        .by_type
                        .entry(record.change.kind().to_string())
                        .or_insert(0) += 1;
                    *stats
                        .by_phase
                        .entry(record.phase.to_string())
                        .or_insert(0) += 1;
                    if dry_run {
                        stats.reversed += 1;
                        continue;
                    }
                    match self.reverse(&record.change) {
                        Ok(()) => stats.reversed += 1,
                        Err(e) => {
                            warn!(
                                seq = record.seq,
                                kind = record.change.kind(),
                                error = %e,
                                "failed to reverse change"
                            );
                            stats.failed += 1;
                        }
                    }
                }
            }
        }
        stats.estimated_secs = (stats.reversed + stats.failed) * REVERSAL_MS_PER_ENTRY / 1000;
        Ok(stats)
    }

    fn reverse(&self, change: &Change) -> Result<()> {
        match change {
            Change::MovedAsset { asset_id, from, to } => {
                self.files.rename(to, from)?;
                self.repo.move_asset(asset_id, folder_of(from))
            }
            Change::FixedBrokenLink {
                element_id,
                field,
                original,
                ..
            } => self.repo.update_field(element_id, field, original),
            Change::QuarantinedOrphanedFile {
                path,
                quarantine_path,
            } => self.files.rename(quarantine_path, path),
            Change::InlineImageLinked {
                entry_id,
                field,
                original_content,
                ..
            } => self.repo.update_field(entry_id, field, original_content),
            Change::ResolvedDuplicate {
                removed_path,
                quarantine_path,
                ..
            } => self.files.rename(quarantine_path, removed_path),
            Change::UpdatedSubfolder {
                asset_id,
                old_folder,
                ..
            } => self.repo.move_asset(asset_id, old_folder),
            // Derived caches are rebuilt by the content system on demand.
            Change::ClearedDerivedCaches => Ok(()),
        }
    }
}

fn folder_of(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

fn affected_tables(sql: &str) -> Vec<String> {
    let pattern = Regex::new(
        r#"(?i)\b(?:INSERT\s+INTO|CREATE\s+TABLE(?:\s+IF\s+NOT\s+EXISTS)?|UPDATE|DELETE\s+FROM|REPLACE\s+INTO)\s+[`"]?([A-Za-z0-9_]+)"#,
    )
    .expect("table pattern is valid");
    let mut tables: Vec<String> = pattern
        .captures_iter(sql)
        .map(|c| c[1].to_lowercase())
        .collect();
    tables.sort();
    tables.dedup();
    tables
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{MemoryDatabaseAdmin, MemoryObjectStore, MemoryRepository};
    use crate::interface::AssetRecord;
    use std::io::Write;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        repo: MemoryRepository,
        files: MemoryObjectStore,
        db: MemoryDatabaseAdmin,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                repo: MemoryRepository::new(),
                files: MemoryObjectStore::new(),
                db: MemoryDatabaseAdmin::new(),
            }
        }

        fn changelog(&self) -> ChangeLog {
            ChangeLog::open(self.dir.path().join("changes.jsonl"), 1).unwrap()
        }

        fn engine<'a>(&'a self, log: &'a ChangeLog) -> RollbackEngine<'a> {
            RollbackEngine::new(log, &self.repo, &self.files, &self.db, self.dir.path())
        }

        fn write_backup(&self, id: &str, sql: &str) {
            let mut f = std::fs::File::create(self.dir.path().join(format!("{}.sql", id))).unwrap();
            f.write_all(sql.as_bytes()).unwrap();
        }
    }

    #[test]
    fn test_dry_run_database_rollback_reports_without_applying() {
        let fx = Fixture::new();
        let statement = "INSERT INTO assets VALUES (1);\n";
        let sql = statement.repeat(100_000); // well over a megabyte
        fx.write_backup("m1", &format!("CREATE TABLE assets (id INT);\n{}", sql));

        let log = fx.changelog();
        let report = fx.engine(&log).rollback_via_database("m1", true).unwrap();
        assert!(report.size_mb > 1.0);
        assert_eq!(report.affected_tables, vec!["assets"]);
        assert!(!report.applied);
        assert!(fx.db.applied_scripts().is_empty());
    }

    #[test]
    fn test_database_rollback_applies_with_fk_suspended() {
        let fx = Fixture::new();
        fx.write_backup("m1", "INSERT INTO assets VALUES (1);");
        let log = fx.changelog();
        let report = fx.engine(&log).rollback_via_database("m1", false).unwrap();
        assert!(report.applied);
        assert_eq!(fx.db.applied_scripts().len(), 1);
        assert!(fx.db.foreign_keys_enabled());
        assert_eq!(fx.db.caches_invalidated(), 1);
    }

    #[test]
    fn test_fk_checks_reenabled_even_when_apply_fails() {
        let fx = Fixture::new();
        fx.write_backup("m1", "INSERT INTO assets VALUES (1);");
        fx.db.fail_next_execute(true);
        let log = fx.changelog();
        assert!(fx.engine(&log).rollback_via_database("m1", false).is_err());
        assert!(fx.db.foreign_keys_enabled());
        assert_eq!(fx.db.caches_invalidated(), 0);
    }

    #[test]
    fn test_suspicious_backup_rejected() {
        let fx = Fixture::new();
        fx.write_backup(
            "m1",
            "INSERT INTO assets VALUES (1); SELECT LOAD_FILE('/etc/passwd');",
        );
        let log = fx.changelog();
        let err = fx.engine(&log).rollback_via_database("m1", false).unwrap_err();
        assert!(matches!(err, MigrationError::BackupVerification(_)));
        assert!(fx.db.applied_scripts().is_empty());
    }

    #[test]
    fn test_empty_and_missing_backups_rejected() {
        let fx = Fixture::new();
        let log = fx.changelog();
        let engine = fx.engine(&log);
        assert!(matches!(
            engine.rollback_via_database("absent", false),
            Err(MigrationError::BackupVerification(_))
        ));
        fx.write_backup("m1", "   \n");
        assert!(matches!(
            engine.rollback_via_database("m1", false),
            Err(MigrationError::BackupVerification(_))
        ));
    }

    #[test]
    fn test_backup_id_confined() {
        let fx = Fixture::new();
        let log = fx.changelog();
        let err = fx
            .engine(&log)
            .rollback_via_database("../../etc/passwd", true)
            .unwrap_err();
        assert!(matches!(err, MigrationError::PathTraversal(_)));
    }

    #[test]
    fn test_changes_reversed_in_reverse_order() {
        let fx = Fixture::new();
        fx.repo.insert_asset(AssetRecord {
            id: "a1".into(),
            filename: "pic.jpg".into(),
            folder: "new".into(),
            size: 10,
        });
        fx.files.write("step2/pic.jpg", b"img").unwrap();

        let mut log = fx.changelog();
        // Forward: old -> step1 -> step2. Reversal must unwind step2 first.
        log.log_change(Change::MovedAsset {
            asset_id: "a1".into(),
            from: "old/pic.jpg".into(),
            to: "step1/pic.jpg".into(),
        })
        .unwrap();
        log.log_change(Change::MovedAsset {
            asset_id: "a1".into(),
            from: "step1/pic.jpg".into(),
            to: "step2/pic.jpg".into(),
        })
        .unwrap();
        log.flush().unwrap();

        let stats = fx.engine(&log).rollback(None, RollbackMode::Only, false).unwrap();
        assert_eq!(stats.reversed, 2);
        assert_eq!(stats.failed, 0);
        assert!(fx.files.exists("old/pic.jpg").unwrap());
        assert_eq!(fx.repo.folder_of("a1").as_deref(), Some("old"));
    }

    #[test]
    fn test_phase_filter_only_and_from() {
        let fx = Fixture::new();
        let mut log = fx.changelog();
        log.set_phase(Phase::FixLinks).unwrap();
        log.log_change(Change::FixedBrokenLink {
            element_id: "e1".into(),
            field: "body".into(),
            original: "old-url".into(),
            updated: "new-url".into(),
        })
        .unwrap();
        log.set_phase(Phase::Quarantine).unwrap();
        log.log_change(Change::QuarantinedOrphanedFile {
            path: "stray.png".into(),
            quarantine_path: "_quarantine/stray.png".into(),
        })
        .unwrap();
        log.flush().unwrap();

        let engine = fx.engine(&log);
        let only = engine
            .rollback(Some(&[Phase::Quarantine]), RollbackMode::Only, true)
            .unwrap();
        assert_eq!(only.reversed, 1);
        assert_eq!(only.by_phase.get("quarantine"), Some(&1));

        let from = engine
            .rollback(Some(&[Phase::FixLinks]), RollbackMode::From, true)
            .unwrap();
        assert_eq!(from.reversed, 2);
    }

    #[test]
    fn test_one_failure_does_not_abort_remaining_reversals() {
        let fx = Fixture::new();
        // Only the second file actually exists in quarantine.
        fx.files.write("_quarantine/b.png", b"b").unwrap();
        let mut log = fx.changelog();
        log.log_change(Change::QuarantinedOrphanedFile {
            path: "a.png".into(),
            quarantine_path: "_quarantine/a.png".into(),
        })
        .unwrap();
        log.log_change(Change::QuarantinedOrphanedFile {
            path: "b.png".into(),
            quarantine_path: "_quarantine/b.png".into(),
        })
        .unwrap();
        log.flush().unwrap();

        let stats = fx.engine(&log).rollback(None, RollbackMode::Only, false).unwrap();
        assert_eq!(stats.reversed, 1);
        assert_eq!(stats.failed, 1);
        assert!(fx.files.exists("b.png").unwrap());
    }

    #[test]
    fn test_unknown_kinds_counted_never_fatal() {
        let fx = Fixture::new();
        let mut log = fx.changelog();
        log.log_change(Change::ClearedDerivedCaches).unwrap();
        log.flush().unwrap();
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(log.path())
            .unwrap();
        writeln!(
            f,
            "{}",
            r#"{"seq":99,"phase":"cleanup","recorded_at":0,"type":"teleported_asset"}"#
        )
        .unwrap();

        let stats = fx.engine(&log).rollback(None, RollbackMode::Only, false).unwrap();
        assert_eq!(stats.unknown, 1);
        assert_eq!(stats.reversed, 1);
    }

    #[test]
    fn test_affected_tables_extraction() {
        let tables = affected_tables(
            "CREATE TABLE IF NOT EXISTS assets (id INT);\n\
             INSERT INTO `relations` VALUES (1);\n\
             UPDATE content SET body='x';\n\
             INSERT INTO assets VALUES (2);",
        );
        assert_eq!(tables, vec!["assets", "content", "relations"]);
    }
}
