//! Collaborator contracts consumed by the orchestration engine.
//!
//! The engine has no dependency on any concrete content system, object
//! store, or analysis service; everything arrives through these traits,
//! injected into the orchestrator's constructor. `adapter::memory`
//! provides deterministic in-memory implementations for tests.

use crate::core::Result;
use serde::{Deserialize, Serialize};

// ============================================================================
// Work Items
// ============================================================================

/// A metadata record for one content-referenced binary object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetRecord {
    pub id: String,
    pub filename: String,
    pub folder: String,
    pub size: u64,
}

impl AssetRecord {
    pub fn path(&self) -> String {
        if self.folder.is_empty() {
            self.filename.clone()
        } else {
            format!("{}/{}", self.folder, self.filename)
        }
    }
}

/// A physical file move with enough context to reverse it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relocation {
    pub asset_id: String,
    pub from: String,
    pub to: String,
}

/// One file within a duplicate group slated for removal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateFile {
    pub asset_id: String,
    pub path: String,
}

/// A set of content-identical files; `keep` survives, the rest are
/// quarantined and their records retargeted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateGroup {
    pub checksum: String,
    pub keep: DuplicateFile,
    pub remove: Vec<DuplicateFile>,
}

/// A record field still pointing at a pre-migration location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokenLink {
    pub element_id: String,
    pub field: String,
    pub current: String,
    pub target: String,
}

/// An inline `<img>` reference that should become a managed asset link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineImage {
    pub entry_id: String,
    pub field: String,
    pub original_content: String,
    pub updated_content: String,
}

/// A record whose folder attribution changes in the new layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubfolderMove {
    pub asset_id: String,
    pub old_folder: String,
    pub new_folder: String,
}

// ============================================================================
// Collaborator Traits
// ============================================================================

/// Narrow seam over the content system's record store (assets, entries,
/// their fields and relations).
pub trait ContentRepository {
    fn asset(&self, asset_id: &str) -> Result<Option<AssetRecord>>;

    /// Re-point an asset record at a new folder.
    fn move_asset(&self, asset_id: &str, new_folder: &str) -> Result<()>;

    /// Overwrite one field of one element.
    fn update_field(&self, element_id: &str, field: &str, value: &str) -> Result<()>;

    fn field_value(&self, element_id: &str, field: &str) -> Result<Option<String>>;

    /// Retarget every relation of `from_asset` to `to_asset` (duplicate
    /// resolution).
    fn retarget_relations(&self, from_asset: &str, to_asset: &str) -> Result<u64>;
}

/// Byte-level access to a named storage location.
pub trait ObjectStore {
    fn read(&self, path: &str) -> Result<Vec<u8>>;
    fn write(&self, path: &str, bytes: &[u8]) -> Result<()>;
    fn delete(&self, path: &str) -> Result<()>;
    fn exists(&self, path: &str) -> Result<bool>;
    fn rename(&self, from: &str, to: &str) -> Result<()>;
}

/// The analysis service that inventories assets and files and derives
/// each phase's batch of work. Built out-of-band; read-only here.
pub trait Inventory {
    fn total_assets(&self) -> Result<u64>;

    /// Paged scan used by the consolidation phase.
    fn asset_batch(&self, cursor: u64, limit: usize) -> Result<Vec<AssetRecord>>;

    /// Optimised-image files sitting in the volume root (optional
    /// `optimised_root` phase).
    fn root_relocations(&self) -> Result<Vec<Relocation>>;

    fn inline_images(&self) -> Result<Vec<InlineImage>>;

    /// `safe_only` restricts to groups whose removals have no live
    /// references.
    fn duplicate_groups(&self, safe_only: bool) -> Result<Vec<DuplicateGroup>>;

    fn broken_links(&self) -> Result<Vec<BrokenLink>>;

    /// Target folder for an asset under the consolidated layout.
    fn consolidated_folder(&self, asset: &AssetRecord) -> Result<String>;

    /// Files present in storage with no owning record.
    fn orphaned_files(&self) -> Result<Vec<String>>;

    /// Leftover temp/scratch files (optional `temp_cleanup` phase).
    fn temp_files(&self) -> Result<Vec<String>>;

    fn subfolder_moves(&self) -> Result<Vec<SubfolderMove>>;
}

/// Administrative database surface used only by the rollback engine's
/// restore path.
pub trait DatabaseAdmin {
    fn set_foreign_key_checks(&self, enabled: bool) -> Result<()>;
    fn execute_script(&self, sql: &str) -> Result<()>;
    fn invalidate_caches(&self) -> Result<()>;
}
