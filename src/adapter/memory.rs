//! In-memory collaborator implementations.
//!
//! First-class fakes in the same spirit as an in-memory storage engine:
//! deterministic, lock-guarded maps with optional failure injection so
//! orchestrator behavior under partial failure is testable.

use crate::core::{MigrationError, Result};
use crate::interface::{
    AssetRecord, BrokenLink, ContentRepository, DatabaseAdmin, DuplicateGroup, InlineImage,
    Inventory, ObjectStore, Relocation, SubfolderMove,
};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

// ============================================================================
// Repository
// ============================================================================

#[derive(Default)]
pub struct MemoryRepository {
    assets: Mutex<HashMap<String, AssetRecord>>,
    fields: Mutex<HashMap<(String, String), String>>,
    /// asset id -> element ids related to it
    relations: Mutex<HashMap<String, Vec<String>>>,
    /// Remaining number of `update_field` calls that fail retryably.
    flaky_update_field: AtomicU32,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_asset(&self, asset: AssetRecord) {
        self.assets.lock().unwrap().insert(asset.id.clone(), asset);
    }

    pub fn set_field(&self, element_id: &str, field: &str, value: &str) {
        self.fields
            .lock()
            .unwrap()
            .insert((element_id.to_string(), field.to_string()), value.to_string());
    }

    pub fn add_relation(&self, asset_id: &str, element_id: &str) {
        self.relations
            .lock()
            .unwrap()
            .entry(asset_id.to_string())
            .or_default()
            .push(element_id.to_string());
    }

    /// Make the next `times` calls to `update_field` fail with a
    /// retryable I/O error.
    pub fn make_update_field_flaky(&self, times: u32) {
        self.flaky_update_field.store(times, Ordering::SeqCst);
    }

    pub fn folder_of(&self, asset_id: &str) -> Option<String> {
        self.assets
            .lock()
            .unwrap()
            .get(asset_id)
            .map(|a| a.folder.clone())
    }
}

impl ContentRepository for MemoryRepository {
    fn asset(&self, asset_id: &str) -> Result<Option<AssetRecord>> {
        Ok(self.assets.lock()?.get(asset_id).cloned())
    }

    fn move_asset(&self, asset_id: &str, new_folder: &str) -> Result<()> {
        let mut assets = self.assets.lock()?;
        let asset = assets
            .get_mut(asset_id)
            .ok_or_else(|| MigrationError::NotFound(format!("asset '{}'", asset_id)))?;
        asset.folder = new_folder.to_string();
        Ok(())
    }

    fn update_field(&self, element_id: &str, field: &str, value: &str) -> Result<()> {
        let remaining = self.flaky_update_field.load(Ordering::SeqCst);
        if remaining > 0 {
            self.flaky_update_field.store(remaining - 1, Ordering::SeqCst);
            return Err(MigrationError::Repository(
                "simulated transient write failure".into(),
            ));
        }
        self.fields
            .lock()?
            .insert((element_id.to_string(), field.to_string()), value.to_string());
        Ok(())
    }

    fn field_value(&self, element_id: &str, field: &str) -> Result<Option<String>> {
        Ok(self
            .fields
            .lock()?
            .get(&(element_id.to_string(), field.to_string()))
            .cloned())
    }

    fn retarget_relations(&self, from_asset: &str, to_asset: &str) -> Result<u64> {
        let mut relations = self.relations.lock()?;
        let moved = relations.remove(from_asset).unwrap_or_default();
        let count = moved.len() as u64;
        relations
            .entry(to_asset.to_string())
            .or_default()
            .extend(moved);
        Ok(count)
    }
}

// ============================================================================
// Object Store
// ============================================================================

#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    /// Remaining number of `rename` calls that fail retryably.
    flaky_rename: AtomicU32,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn make_rename_flaky(&self, times: u32) {
        self.flaky_rename.store(times, Ordering::SeqCst);
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.objects.lock().unwrap().keys().cloned().collect();
        paths.sort();
        paths
    }
}

impl ObjectStore for MemoryObjectStore {
    fn read(&self, path: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()?
            .get(path)
            .cloned()
            .ok_or_else(|| MigrationError::NotFound(format!("object '{}'", path)))
    }

    fn write(&self, path: &str, bytes: &[u8]) -> Result<()> {
        self.objects.lock()?.insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.objects
            .lock()?
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| MigrationError::NotFound(format!("object '{}'", path)))
    }

    fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.objects.lock()?.contains_key(path))
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let remaining = self.flaky_rename.load(Ordering::SeqCst);
        if remaining > 0 {
            self.flaky_rename.store(remaining - 1, Ordering::SeqCst);
            return Err(MigrationError::ObjectStore(
                "simulated transient rename failure".into(),
            ));
        }
        let mut objects = self.objects.lock()?;
        let bytes = objects
            .remove(from)
            .ok_or_else(|| MigrationError::NotFound(format!("object '{}'", from)))?;
        objects.insert(to.to_string(), bytes);
        Ok(())
    }
}

// ============================================================================
// Inventory
// ============================================================================

/// Pre-baked analysis results fed to the orchestrator.
#[derive(Default)]
pub struct MemoryInventory {
    assets: Mutex<Vec<AssetRecord>>,
    root_relocations: Mutex<Vec<Relocation>>,
    inline_images: Mutex<Vec<InlineImage>>,
    safe_duplicates: Mutex<Vec<DuplicateGroup>>,
    unsafe_duplicates: Mutex<Vec<DuplicateGroup>>,
    broken_links: Mutex<Vec<BrokenLink>>,
    orphaned_files: Mutex<Vec<String>>,
    temp_files: Mutex<Vec<String>>,
    subfolder_moves: Mutex<Vec<SubfolderMove>>,
    consolidated_root: String,
}

impl MemoryInventory {
    pub fn new(consolidated_root: &str) -> Self {
        Self {
            consolidated_root: consolidated_root.to_string(),
            ..Default::default()
        }
    }

    pub fn with_assets(self, assets: Vec<AssetRecord>) -> Self {
        *self.assets.lock().unwrap() = assets;
        self
    }

    pub fn with_root_relocations(self, moves: Vec<Relocation>) -> Self {
        *self.root_relocations.lock().unwrap() = moves;
        self
    }

    pub fn with_inline_images(self, images: Vec<InlineImage>) -> Self {
        *self.inline_images.lock().unwrap() = images;
        self
    }

    pub fn with_safe_duplicates(self, groups: Vec<DuplicateGroup>) -> Self {
        *self.safe_duplicates.lock().unwrap() = groups;
        self
    }

    pub fn with_unsafe_duplicates(self, groups: Vec<DuplicateGroup>) -> Self {
        *self.unsafe_duplicates.lock().unwrap() = groups;
        self
    }

    pub fn with_broken_links(self, links: Vec<BrokenLink>) -> Self {
        *self.broken_links.lock().unwrap() = links;
        self
    }

    pub fn with_orphaned_files(self, files: Vec<String>) -> Self {
        *self.orphaned_files.lock().unwrap() = files;
        self
    }

    pub fn with_temp_files(self, files: Vec<String>) -> Self {
        *self.temp_files.lock().unwrap() = files;
        self
    }

    pub fn with_subfolder_moves(self, moves: Vec<SubfolderMove>) -> Self {
        *self.subfolder_moves.lock().unwrap() = moves;
        self
    }
}

impl Inventory for MemoryInventory {
    fn total_assets(&self) -> Result<u64> {
        Ok(self.assets.lock()?.len() as u64)
    }

    fn asset_batch(&self, cursor: u64, limit: usize) -> Result<Vec<AssetRecord>> {
        let assets = self.assets.lock()?;
        Ok(assets
            .iter()
            .skip(cursor as usize)
            .take(limit)
            .cloned()
            .collect())
    }

    fn root_relocations(&self) -> Result<Vec<Relocation>> {
        Ok(self.root_relocations.lock()?.clone())
    }

    fn inline_images(&self) -> Result<Vec<InlineImage>> {
        Ok(self.inline_images.lock()?.clone())
    }

    fn duplicate_groups(&self, safe_only: bool) -> Result<Vec<DuplicateGroup>> {
        if safe_only {
            Ok(self.safe_duplicates.lock()?.clone())
        } else {
            Ok(self.unsafe_duplicates.lock()?.clone())
        }
    }

    fn broken_links(&self) -> Result<Vec<BrokenLink>> {
        Ok(self.broken_links.lock()?.clone())
    }

    fn consolidated_folder(&self, asset: &AssetRecord) -> Result<String> {
        let bucket = asset.id.len() % 4;
        Ok(format!("{}/{}", self.consolidated_root, bucket))
    }

    fn orphaned_files(&self) -> Result<Vec<String>> {
        Ok(self.orphaned_files.lock()?.clone())
    }

    fn temp_files(&self) -> Result<Vec<String>> {
        Ok(self.temp_files.lock()?.clone())
    }

    fn subfolder_moves(&self) -> Result<Vec<SubfolderMove>> {
        Ok(self.subfolder_moves.lock()?.clone())
    }
}

// ============================================================================
// Database Admin
// ============================================================================

#[derive(Default)]
pub struct MemoryDatabaseAdmin {
    scripts: Mutex<Vec<String>>,
    fk_enabled: AtomicBool,
    caches_invalidated: AtomicU64,
    fail_execute: AtomicBool,
}

impl MemoryDatabaseAdmin {
    pub fn new() -> Self {
        let admin = Self::default();
        admin.fk_enabled.store(true, Ordering::SeqCst);
        admin
    }

    pub fn fail_next_execute(&self, fail: bool) {
        self.fail_execute.store(fail, Ordering::SeqCst);
    }

    pub fn applied_scripts(&self) -> Vec<String> {
        self.scripts.lock().unwrap().clone()
    }

    pub fn foreign_keys_enabled(&self) -> bool {
        self.fk_enabled.load(Ordering::SeqCst)
    }

    pub fn caches_invalidated(&self) -> u64 {
        self.caches_invalidated.load(Ordering::SeqCst)
    }
}

impl DatabaseAdmin for MemoryDatabaseAdmin {
    fn set_foreign_key_checks(&self, enabled: bool) -> Result<()> {
        self.fk_enabled.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    fn execute_script(&self, sql: &str) -> Result<()> {
        if self.fail_execute.swap(false, Ordering::SeqCst) {
            return Err(MigrationError::External("restore statement failed".into()));
        }
        self.scripts.lock()?.push(sql.to_string());
        Ok(())
    }

    fn invalidate_caches(&self) -> Result<()> {
        self.caches_invalidated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
