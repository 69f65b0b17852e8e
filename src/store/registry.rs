use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::DirectoryKind;
use crate::error::{IoResultExt, Result};

use super::directory::Directory;
use super::fs::FsDirectory;
use super::mmap::MmapDirectory;
use super::ram::RamDirectory;

/// One directory instance per canonical index path
///
/// Two components opening the same path share the same `Directory`.
/// Registries are plain values: create one per process (or per test) and
/// pass it to whoever opens indexes. `clear` drops every cached handle.
#[derive(Debug, Default)]
pub struct DirectoryRegistry {
    entries: Mutex<HashMap<PathBuf, Arc<dyn Directory>>>,
    buffer_size: Option<usize>,
}

impl DirectoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose file-backed directories use a custom I/O buffer size
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            buffer_size: Some(buffer_size),
        }
    }

    /// Return the cached directory for `path`, opening it on first use
    pub fn open(&self, kind: DirectoryKind, path: &Path) -> Result<Arc<dyn Directory>> {
        let key = canonical_key(kind, path)?;
        let mut entries = self.entries.lock();
        if let Some(dir) = entries.get(&key) {
            return Ok(dir.clone());
        }

        let buffer_size = self.buffer_size.unwrap_or(super::DEFAULT_BUFFER_SIZE);
        let dir: Arc<dyn Directory> = match kind {
            DirectoryKind::FileSystem => Arc::new(FsDirectory::with_buffer_size(&key, buffer_size)?),
            DirectoryKind::MemoryMapped => {
                Arc::new(MmapDirectory::with_buffer_size(&key, buffer_size)?)
            }
            DirectoryKind::Ram => Arc::new(RamDirectory::new()),
        };
        debug!(path = %key.display(), ?kind, "registered directory");
        entries.insert(key, dir.clone());
        Ok(dir)
    }

    pub fn get(&self, kind: DirectoryKind, path: &Path) -> Option<Arc<dyn Directory>> {
        let key = canonical_key(kind, path).ok()?;
        self.entries.lock().get(&key).cloned()
    }

    /// Forget one path; outstanding handles stay valid
    pub fn release(&self, kind: DirectoryKind, path: &Path) -> bool {
        match canonical_key(kind, path) {
            Ok(key) => self.entries.lock().remove(&key).is_some(),
            Err(_) => false,
        }
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn canonical_key(kind: DirectoryKind, path: &Path) -> Result<PathBuf> {
    if kind == DirectoryKind::Ram {
        return Ok(path.to_path_buf());
    }
    fs::create_dir_all(path).io_context("create_dir", &path.display().to_string())?;
    fs::canonicalize(path).io_context("canonicalize", &path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::OutputMode;
    use tempfile::TempDir;

    #[test]
    fn test_same_path_shares_instance() {
        let tmp = TempDir::new().unwrap();
        let registry = DirectoryRegistry::new();
        let a = registry.open(DirectoryKind::FileSystem, tmp.path()).unwrap();
        let b = registry
            .open(DirectoryKind::FileSystem, &tmp.path().join("."))
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_registries_are_isolated() {
        let first = DirectoryRegistry::new();
        let second = DirectoryRegistry::new();
        let path = Path::new("mem://idx");
        let a = first.open(DirectoryKind::Ram, path).unwrap();
        a.create_output("f", OutputMode::Truncate)
            .unwrap()
            .close()
            .unwrap();
        let b = second.open(DirectoryKind::Ram, path).unwrap();
        assert!(!b.file_exists("f"));
        assert!(first.get(DirectoryKind::Ram, path).unwrap().file_exists("f"));
    }

    #[test]
    fn test_release_and_clear() {
        let registry = DirectoryRegistry::new();
        let path = Path::new("mem://x");
        registry.open(DirectoryKind::Ram, path).unwrap();
        assert!(registry.release(DirectoryKind::Ram, path));
        assert!(!registry.release(DirectoryKind::Ram, path));
        registry.open(DirectoryKind::Ram, path).unwrap();
        registry.clear();
        assert!(registry.is_empty());
    }
}
