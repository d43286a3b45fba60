use crate::core::{MigrationError, Phase, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

// ============================================================================
// Change Types
// ============================================================================

/// One reversible mutation of an external system's durable state.
///
/// Every variant carries enough payload to undo the operation: original
/// and new locations, original and new content. The closed set mirrors
/// what the migration phases actually do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Change {
    MovedAsset {
        asset_id: String,
        from: String,
        to: String,
    },
    FixedBrokenLink {
        element_id: String,
        field: String,
        original: String,
        updated: String,
    },
    QuarantinedOrphanedFile {
        path: String,
        quarantine_path: String,
    },
    InlineImageLinked {
        entry_id: String,
        field: String,
        original_content: String,
        updated_content: String,
    },
    ResolvedDuplicate {
        kept_asset_id: String,
        removed_asset_id: String,
        removed_path: String,
        quarantine_path: String,
    },
    UpdatedSubfolder {
        asset_id: String,
        old_folder: String,
        new_folder: String,
    },
    /// Derived renditions and caches are regenerated by the content
    /// system itself; recorded for the audit trail, reversal is a no-op.
    ClearedDerivedCaches,
}

impl Change {
    pub fn kind(&self) -> &'static str {
        match self {
            Change::MovedAsset { .. } => "moved_asset",
            Change::FixedBrokenLink { .. } => "fixed_broken_link",
            Change::QuarantinedOrphanedFile { .. } => "quarantined_orphaned_file",
            Change::InlineImageLinked { .. } => "inline_image_linked",
            Change::ResolvedDuplicate { .. } => "resolved_duplicate",
            Change::UpdatedSubfolder { .. } => "updated_subfolder",
            Change::ClearedDerivedCaches => "cleared_derived_caches",
        }
    }
}

/// A change plus its ledger position and the phase active when it was
/// written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub seq: u64,
    pub phase: Phase,
    pub recorded_at: i64,
    #[serde(flatten)]
    pub change: Change,
}

/// A ledger line as read back from disk. Unknown kinds are surfaced, not
/// silently dropped, so the rollback engine can warn about them.
#[derive(Debug, Clone)]
pub enum LoadedChange {
    Known(ChangeRecord),
    Unknown {
        line: usize,
        kind: String,
        raw: serde_json::Value,
    },
}

// ============================================================================
// Change Log
// ============================================================================

/// Append-only ledger of reversible mutations, one JSON object per line.
///
/// Entries buffer in memory and flush in batches of `flush_every`; phase
/// boundaries and exit paths flush explicitly, bounding crash loss to
/// "since last flush".
pub struct ChangeLog {
    path: PathBuf,
    phase: Phase,
    buffer: Vec<ChangeRecord>,
    next_seq: u64,
    flush_every: usize,
}

impl ChangeLog {
    pub fn open(path: impl Into<PathBuf>, flush_every: usize) -> Result<Self> {
        let path = path.into();
        let next_seq = if path.exists() {
            let file = File::open(&path)
                .map_err(|e| MigrationError::ChangeLog(format!("failed to open log: {}", e)))?;
            BufReader::new(file).lines().count() as u64 + 1
        } else {
            1
        };
        Ok(Self {
            path,
            phase: Phase::Preparation,
            buffer: Vec::new(),
            next_seq,
            flush_every,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Tag subsequent entries with `phase`, flushing the previous phase's
    /// buffered entries first.
    pub fn set_phase(&mut self, phase: Phase) -> Result<()> {
        self.flush()?;
        self.phase = phase;
        Ok(())
    }

    /// Append one entry. The mutation it describes is only "committed"
    /// from the orchestrator's point of view once this returns.
    pub fn log_change(&mut self, change: Change) -> Result<()> {
        let record = ChangeRecord {
            seq: self.next_seq,
            phase: self.phase,
            recorded_at: chrono::Utc::now().timestamp_millis(),
            change,
        };
        self.next_seq += 1;
        self.buffer.push(record);
        if self.buffer.len() >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    /// Write buffered entries to disk. Must be called before a
    /// confirmation prompt and before process exit on every path.
    pub fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| MigrationError::ChangeLog(format!("failed to create dir: {}", e)))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| MigrationError::ChangeLog(format!("failed to open log: {}", e)))?;
        let mut writer = BufWriter::new(file);
        for record in &self.buffer {
            let line = serde_json::to_string(record)?;
            writeln!(writer, "{}", line)
                .map_err(|e| MigrationError::ChangeLog(format!("failed to append: {}", e)))?;
        }
        writer
            .flush()
            .map_err(|e| MigrationError::ChangeLog(format!("failed to flush: {}", e)))?;
        writer
            .get_mut()
            .sync_all()
            .map_err(|e| MigrationError::ChangeLog(format!("failed to sync: {}", e)))?;
        self.buffer.clear();
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Read the full ledger back in write order. Lines whose change type
    /// is not in the closed set come back as `Unknown` with a warning.
    pub fn load_changes(&self) -> Result<Vec<LoadedChange>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path)
            .map_err(|e| MigrationError::ChangeLog(format!("failed to open log: {}", e)))?;
        let mut out = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line
                .map_err(|e| MigrationError::ChangeLog(format!("failed to read log: {}", e)))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ChangeRecord>(&line) {
                Ok(record) => out.push(LoadedChange::Known(record)),
                Err(_) => {
                    let raw: serde_json::Value = serde_json::from_str(&line).map_err(|e| {
                        MigrationError::ChangeLog(format!("corrupt log line {}: {}", idx + 1, e))
                    })?;
                    let kind = raw
                        .get("type")
                        .and_then(|v| v.as_str())
                        .unwrap_or("<missing>")
                        .to_string();
                    warn!(line = idx + 1, kind = %kind, "unknown change type in ledger");
                    out.push(LoadedChange::Unknown {
                        line: idx + 1,
                        kind,
                        raw,
                    });
                }
            }
        }
        Ok(out)
    }
}
