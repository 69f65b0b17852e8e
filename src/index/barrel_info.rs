//! Barrel manifest
//!
//! `BarrelsInfo` is the single persisted record of which barrels exist.
//! Updates follow the same sequence every time:
//! 1. Barrel files are written and closed
//! 2. The manifest is written to `barrels.tmp`
//! 3. `barrels.tmp` is renamed over `barrels` and the directory synced

use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

use crate::error::{IndexError, Result};
use crate::store::{Directory, OutputMode};

use super::forward_index::{fdd_file, fdi_file};
use super::types::{BarrelId, DocId};

pub const MANIFEST_FILE: &str = "barrels";
pub const MANIFEST_TMP_FILE: &str = "barrels.tmp";

/// One barrel (segment) of the collection
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrelInfo {
    pub id: BarrelId,
    /// File stem shared by the barrel's files
    pub name: String,
    pub base_doc_id: DocId,
    pub max_doc_id: DocId,
    /// Documents assigned to the barrel, deleted ones included
    pub doc_count: u32,
    pub searchable: bool,
    /// Merge level the barrel was produced at
    #[serde(default)]
    pub level: u32,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub has_forward_index: bool,
}

impl BarrelInfo {
    pub fn new(id: BarrelId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            base_doc_id: 0,
            max_doc_id: 0,
            doc_count: 0,
            searchable: false,
            level: 0,
            size_bytes: 0,
            has_forward_index: false,
        }
    }

    /// Name of a barrel produced by a flush
    pub fn flushed_name(id: BarrelId) -> String {
        format!("_{}", id.0)
    }

    /// Name of a barrel produced by a merge
    pub fn merged_name(level: u32, merge_times: u64) -> String {
        format!("_mid_{}_{}", level, merge_times)
    }

    pub fn is_empty(&self) -> bool {
        self.doc_count == 0
    }

    /// Account for a document added to the barrel
    pub fn add_doc(&mut self, doc_id: DocId) {
        if self.doc_count == 0 {
            self.base_doc_id = doc_id;
        }
        self.max_doc_id = self.max_doc_id.max(doc_id);
        self.doc_count += 1;
    }

    pub fn contains(&self, doc_id: DocId) -> bool {
        !self.is_empty() && doc_id >= self.base_doc_id && doc_id <= self.max_doc_id
    }

    /// Documents not covered by a tombstone
    pub fn live_doc_count(&self, deleted: &RoaringBitmap) -> u32 {
        self.doc_count.saturating_sub(self.deleted_count(deleted) as u32)
    }

    /// Tombstones inside the barrel's docid range
    pub fn deleted_count(&self, deleted: &RoaringBitmap) -> u64 {
        if self.is_empty() {
            return 0;
        }
        let below = match self.base_doc_id {
            0 => 0,
            base => deleted.rank(base - 1),
        };
        deleted.rank(self.max_doc_id) - below
    }

    pub fn voc_file(&self) -> String {
        format!("{}.voc", self.name)
    }

    pub fn dfp_file(&self) -> String {
        format!("{}.dfp", self.name)
    }

    pub fn pop_file(&self) -> String {
        format!("{}.pop", self.name)
    }

    pub fn files(&self) -> Vec<String> {
        let mut files = vec![self.voc_file(), self.dfp_file(), self.pop_file()];
        if self.has_forward_index {
            files.push(fdi_file(&self.name));
            files.push(fdd_file(&self.name));
        }
        files
    }
}

/// Stem of a barrel file name (`_3.voc` -> `_3`)
pub fn barrel_stem(file: &str) -> Option<&str> {
    let (stem, ext) = file.rsplit_once('.')?;
    matches!(ext, "voc" | "dfp" | "pop" | "fdi" | "fdd").then_some(stem)
}

/// Persisted list of live barrels
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BarrelsInfo {
    pub version: u32,
    /// Incremented on every committed change
    pub generation: u64,
    pub next_barrel_id: BarrelId,
    /// Completed merges, used to name merged barrels
    pub merge_times: u64,
    /// Live barrels, ascending by base docid
    pub barrels: Vec<BarrelInfo>,
}

impl Default for BarrelsInfo {
    fn default() -> Self {
        Self::new()
    }
}

impl BarrelsInfo {
    pub const VERSION: u32 = 1;

    pub fn new() -> Self {
        Self {
            version: Self::VERSION,
            generation: 0,
            next_barrel_id: BarrelId::new(0),
            merge_times: 0,
            barrels: Vec::new(),
        }
    }

    pub fn allocate_barrel_id(&mut self) -> BarrelId {
        let id = self.next_barrel_id;
        self.next_barrel_id = id.next();
        id
    }

    /// Reserve the name of the next merged barrel at `level`
    pub fn next_merged_name(&mut self, level: u32) -> String {
        let name = BarrelInfo::merged_name(level, self.merge_times);
        self.merge_times += 1;
        name
    }

    pub fn get(&self, id: BarrelId) -> Option<&BarrelInfo> {
        self.barrels.iter().find(|b| b.id == id)
    }

    pub fn len(&self) -> usize {
        self.barrels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.barrels.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BarrelInfo> {
        self.barrels.iter()
    }

    /// Highest docid held by any barrel
    pub fn max_doc_id(&self) -> Option<DocId> {
        self.barrels
            .iter()
            .filter(|b| !b.is_empty())
            .map(|b| b.max_doc_id)
            .max()
    }

    pub fn total_doc_count(&self) -> u64 {
        self.barrels.iter().map(|b| b.doc_count as u64).sum()
    }

    pub fn total_size_bytes(&self) -> u64 {
        self.barrels.iter().map(|b| b.size_bytes).sum()
    }

    /// Stems of every live barrel
    pub fn stems(&self) -> HashSet<&str> {
        self.barrels.iter().map(|b| b.name.as_str()).collect()
    }

    pub fn add_barrel(&mut self, barrel: BarrelInfo) -> Result<()> {
        if self.get(barrel.id).is_some() || self.barrels.iter().any(|b| b.name == barrel.name) {
            return Err(IndexError::DuplicateBarrel(barrel.name));
        }
        if let Some(clash) = self.barrels.iter().find(|b| overlaps(b, &barrel)) {
            return Err(IndexError::collapse(format!(
                "barrel {} overlaps docids of {}",
                barrel.name, clash.name
            )));
        }
        self.barrels.push(barrel);
        self.barrels.sort_by_key(|b| b.base_doc_id);
        self.generation += 1;
        Ok(())
    }

    /// Swap merged sources for their merge result
    pub fn replace(&mut self, sources: &[BarrelId], merged: BarrelInfo) -> Result<()> {
        for id in sources {
            if self.get(*id).is_none() {
                return Err(IndexError::collapse(format!(
                    "merge source {} is not in the manifest",
                    id
                )));
            }
        }
        self.barrels.retain(|b| !sources.contains(&b.id));
        if !merged.is_empty() {
            self.add_barrel(merged)?;
        } else {
            self.generation += 1;
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Load the manifest, or an empty one for a fresh directory
    pub fn load(dir: &dyn Directory) -> Result<Self> {
        if !dir.file_exists(MANIFEST_FILE) {
            return Ok(Self::new());
        }
        let info = Self::from_json(dir.open_bytes(MANIFEST_FILE)?.as_slice())?;
        if info.version != Self::VERSION {
            return Err(IndexError::Version {
                file: MANIFEST_FILE.to_string(),
                expected: Self::VERSION,
                actual: info.version,
            });
        }
        Ok(info)
    }

    pub fn save(&self, dir: &dyn Directory) -> Result<()> {
        let data = self.to_json()?;
        let mut out = dir.create_output(MANIFEST_TMP_FILE, OutputMode::Truncate)?;
        out.write_bytes(&data)?;
        out.close()?;
        dir.rename_file(MANIFEST_TMP_FILE, MANIFEST_FILE)?;
        dir.sync_directory()
    }
}

fn overlaps(a: &BarrelInfo, b: &BarrelInfo) -> bool {
    !a.is_empty() && !b.is_empty() && a.base_doc_id <= b.max_doc_id && b.base_doc_id <= a.max_doc_id
}

/// Shared manifest: lock-free snapshots, serialized persisted updates
pub struct BarrelsInfoHolder {
    current: ArcSwap<BarrelsInfo>,
    write_lock: Mutex<()>,
    directory: Arc<dyn Directory>,
}

impl BarrelsInfoHolder {
    pub fn open(directory: Arc<dyn Directory>) -> Result<Self> {
        let info = BarrelsInfo::load(directory.as_ref())?;
        Ok(Self {
            current: ArcSwap::from_pointee(info),
            write_lock: Mutex::new(()),
            directory,
        })
    }

    pub fn snapshot(&self) -> Arc<BarrelsInfo> {
        self.current.load_full()
    }

    pub fn generation(&self) -> u64 {
        self.current.load().generation
    }

    /// Apply `f` to a copy, persist it, then publish it
    ///
    /// Nothing is published when `f` or the save fails.
    pub fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut BarrelsInfo) -> Result<T>,
    {
        let _guard = self.write_lock.lock();
        let mut info = (**self.current.load()).clone();
        let out = f(&mut info)?;
        info.save(self.directory.as_ref())?;
        self.current.store(Arc::new(info));
        Ok(out)
    }

    /// Like `update`, but `f` may decline by returning `None`
    pub fn try_update<T, F>(&self, f: F) -> Result<Option<T>>
    where
        F: FnOnce(&mut BarrelsInfo) -> Result<Option<T>>,
    {
        let _guard = self.write_lock.lock();
        let mut info = (**self.current.load()).clone();
        let Some(out) = f(&mut info)? else {
            return Ok(None);
        };
        info.save(self.directory.as_ref())?;
        self.current.store(Arc::new(info));
        Ok(Some(out))
    }
}
