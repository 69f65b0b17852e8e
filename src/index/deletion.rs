use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use roaring::RoaringBitmap;
use tracing::debug;

use crate::error::{IndexError, Result};
use crate::store::{Directory, OutputMode};

use super::types::DocId;

pub const DELETED_DOCS_FILE: &str = "docs.del";
const DELETED_DOCS_TMP_FILE: &str = "docs.del.tmp";

/// Collection-wide tombstones; readers hold immutable snapshots
pub struct DeletedDocs {
    current: ArcSwap<RoaringBitmap>,
    write_lock: Mutex<()>,
    directory: Arc<dyn Directory>,
}

impl DeletedDocs {
    pub fn open(directory: Arc<dyn Directory>) -> Result<Self> {
        let bitmap = if directory.file_exists(DELETED_DOCS_FILE) {
            let bytes = directory.open_bytes(DELETED_DOCS_FILE)?;
            RoaringBitmap::deserialize_from(bytes.as_slice()).map_err(|e| {
                IndexError::collapse(format!("cannot decode '{}': {}", DELETED_DOCS_FILE, e))
            })?
        } else {
            RoaringBitmap::new()
        };
        Ok(Self {
            current: ArcSwap::from_pointee(bitmap),
            write_lock: Mutex::new(()),
            directory,
        })
    }

    pub fn snapshot(&self) -> Arc<RoaringBitmap> {
        self.current.load_full()
    }

    pub fn is_deleted(&self, doc_id: DocId) -> bool {
        self.current.load().contains(doc_id)
    }

    pub fn len(&self) -> u64 {
        self.current.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.load().is_empty()
    }

    /// Tombstone a document; false if it already was
    pub fn delete(&self, doc_id: DocId) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let current = self.current.load_full();
        if current.contains(doc_id) {
            return Ok(false);
        }
        let mut next = (*current).clone();
        next.insert(doc_id);
        self.save(&next)?;
        self.current.store(Arc::new(next));
        debug!(doc_id, "document deleted");
        Ok(true)
    }

    fn save(&self, bitmap: &RoaringBitmap) -> Result<()> {
        let mut data = Vec::with_capacity(bitmap.serialized_size());
        bitmap.serialize_into(&mut data)?;
        let mut out = self
            .directory
            .create_output(DELETED_DOCS_TMP_FILE, OutputMode::Truncate)?;
        out.write_bytes(&data)?;
        out.close()?;
        self.directory
            .rename_file(DELETED_DOCS_TMP_FILE, DELETED_DOCS_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RamDirectory;

    #[test]
    fn test_delete_and_reopen() {
        let dir: Arc<dyn Directory> = Arc::new(RamDirectory::new());
        let deleted = DeletedDocs::open(dir.clone()).unwrap();
        assert!(deleted.is_empty());
        let before = deleted.snapshot();

        assert!(deleted.delete(4).unwrap());
        assert!(!deleted.delete(4).unwrap());
        assert!(deleted.delete(70_000).unwrap());
        assert!(deleted.is_deleted(4));
        assert!(!before.contains(4));
        assert_eq!(deleted.len(), 2);

        let reopened = DeletedDocs::open(dir).unwrap();
        assert_eq!(*reopened.snapshot(), *deleted.snapshot());
    }

    #[test]
    fn test_corrupt_file_is_collapse() {
        let dir = RamDirectory::new();
        let mut out = dir.create_output(DELETED_DOCS_FILE, OutputMode::Truncate).unwrap();
        out.write_bytes(&[1, 2, 3]).unwrap();
        out.close().unwrap();
        let err = DeletedDocs::open(Arc::new(dir)).err().unwrap();
        assert!(err.is_fatal());
    }
}
