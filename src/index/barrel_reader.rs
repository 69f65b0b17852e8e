//! Read side of flushed barrels
//!
//! `BarrelFiles` owns the bytes of one barrel and is shared through `Arc`.
//! Retiring a barrel only marks it obsolete; its files are removed when the
//! last reader holding the `Arc` lets go.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use roaring::RoaringBitmap;
use tracing::{debug, warn};

use crate::error::Result;
use crate::store::{delete_if_exists, Directory, FileBytes};

use super::barrel_info::BarrelInfo;
use super::forward_index::{ForwardDocument, ForwardIndexReader};
use super::multi_term::MultiPostings;
use super::posting::SegmentPostings;
use super::term_reader::{TermDocFreqs, TermPositions, TermReader, Vocabulary};
use super::types::{DocId, Term, TermInfo};

pub struct BarrelFiles {
    info: BarrelInfo,
    /// Owner of the files; `None` for in-memory snapshots
    directory: Option<Arc<dyn Directory>>,
    vocabulary: Vocabulary,
    dfp: FileBytes,
    pop: FileBytes,
    forward: Option<ForwardIndexReader>,
    obsolete: AtomicBool,
}

impl BarrelFiles {
    /// Open a barrel whose files belong to `directory`
    pub fn open(directory: Arc<dyn Directory>, info: BarrelInfo) -> Result<Arc<Self>> {
        let mut files = Self::load(directory.as_ref(), info)?;
        files.directory = Some(directory);
        Ok(Arc::new(files))
    }

    /// Open a barrel from a directory that outlives no one, e.g. a RAM snapshot
    pub fn open_detached(directory: &dyn Directory, info: BarrelInfo) -> Result<Arc<Self>> {
        Ok(Arc::new(Self::load(directory, info)?))
    }

    fn load(directory: &dyn Directory, info: BarrelInfo) -> Result<Self> {
        let voc_file = info.voc_file();
        let vocabulary = Vocabulary::read(&directory.open_bytes(&voc_file)?, &voc_file)?;
        let forward = if info.has_forward_index {
            Some(ForwardIndexReader::open(directory, &info.name)?)
        } else {
            None
        };
        Ok(Self {
            dfp: directory.open_bytes(&info.dfp_file())?,
            pop: directory.open_bytes(&info.pop_file())?,
            vocabulary,
            forward,
            info,
            directory: None,
            obsolete: AtomicBool::new(false),
        })
    }

    pub fn info(&self) -> &BarrelInfo {
        &self.info
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    pub fn dfp(&self) -> &FileBytes {
        &self.dfp
    }

    pub fn pop(&self) -> &FileBytes {
        &self.pop
    }

    pub fn forward_index(&self) -> Option<&ForwardIndexReader> {
        self.forward.as_ref()
    }

    /// Delete the files once the last holder drops this barrel
    pub fn mark_obsolete(&self) {
        self.obsolete.store(true, Ordering::Release);
    }

    pub fn is_obsolete(&self) -> bool {
        self.obsolete.load(Ordering::Acquire)
    }

    /// Cursor over `info`'s posting; `None` when it cannot be decoded
    pub fn postings_at(
        &self,
        info: TermInfo,
        deleted: Option<Arc<RoaringBitmap>>,
    ) -> Option<SegmentPostings> {
        match SegmentPostings::open(&self.dfp, &self.pop, info.posting_pointer, deleted) {
            Ok(postings) => Some(postings),
            Err(e) => {
                warn!(barrel = %self.info.name, error = %e, "unreadable posting, skipping term");
                None
            }
        }
    }

    pub fn postings(
        &self,
        term: &Term,
        deleted: Option<Arc<RoaringBitmap>>,
    ) -> Option<SegmentPostings> {
        self.postings_at(self.vocabulary.get(term)?, deleted)
    }
}

impl fmt::Debug for BarrelFiles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BarrelFiles")
            .field("info", &self.info)
            .field("obsolete", &self.is_obsolete())
            .finish()
    }
}

impl Drop for BarrelFiles {
    fn drop(&mut self) {
        if !self.is_obsolete() {
            return;
        }
        let Some(directory) = &self.directory else {
            return;
        };
        for file in self.info.files() {
            if let Err(e) = delete_if_exists(directory.as_ref(), &file) {
                warn!(file = %file, error = %e, "failed to delete retired barrel file");
            }
        }
        debug!(barrel = %self.info.name, "retired barrel files deleted");
    }
}

/// Term access over one barrel
#[derive(Clone)]
pub struct SingleIndexBarrelReader {
    files: Arc<BarrelFiles>,
    deleted: Arc<RoaringBitmap>,
}

impl SingleIndexBarrelReader {
    pub fn new(files: Arc<BarrelFiles>, deleted: Arc<RoaringBitmap>) -> Self {
        Self { files, deleted }
    }

    pub fn info(&self) -> &BarrelInfo {
        self.files.info()
    }

    pub fn files(&self) -> &Arc<BarrelFiles> {
        &self.files
    }

    pub fn num_docs(&self) -> u32 {
        self.info().live_doc_count(&self.deleted)
    }

    pub fn is_deleted(&self, doc_id: DocId) -> bool {
        self.deleted.contains(doc_id)
    }

    fn deletions(&self) -> Option<Arc<RoaringBitmap>> {
        (self.info().deleted_count(&self.deleted) > 0).then(|| self.deleted.clone())
    }

    fn postings(&self, term: &Term) -> Option<SegmentPostings> {
        self.files.postings(term, self.deletions())
    }

    /// Forward-index entry of a live document
    pub fn document(&self, doc_id: DocId) -> Result<Option<ForwardDocument>> {
        if self.is_deleted(doc_id) {
            return Ok(None);
        }
        match self.files.forward_index() {
            Some(forward) => forward.document(doc_id),
            None => Ok(None),
        }
    }
}

impl TermReader for SingleIndexBarrelReader {
    fn term_info(&self, term: &Term) -> Option<TermInfo> {
        self.files.vocabulary().get(term)
    }

    fn term_doc_freqs(&self, term: &Term) -> Option<Box<dyn TermDocFreqs>> {
        Some(Box::new(self.postings(term)?))
    }

    fn term_positions(&self, term: &Term) -> Option<Box<dyn TermPositions>> {
        Some(Box::new(self.postings(term)?))
    }
}

/// Term access fanned in over every barrel of a manifest snapshot
#[derive(Clone, Default)]
pub struct MultiIndexBarrelReader {
    readers: Vec<SingleIndexBarrelReader>,
}

impl MultiIndexBarrelReader {
    /// `readers` must hold disjoint docid ranges
    pub fn new(mut readers: Vec<SingleIndexBarrelReader>) -> Self {
        readers.sort_by_key(|r| r.info().base_doc_id);
        Self { readers }
    }

    pub fn readers(&self) -> &[SingleIndexBarrelReader] {
        &self.readers
    }

    pub fn num_barrels(&self) -> usize {
        self.readers.len()
    }

    /// Live documents across all barrels
    pub fn num_docs(&self) -> u64 {
        self.readers.iter().map(|r| r.num_docs() as u64).sum()
    }

    pub fn max_doc_id(&self) -> Option<DocId> {
        self.readers
            .iter()
            .filter(|r| !r.info().is_empty())
            .map(|r| r.info().max_doc_id)
            .max()
    }

    pub fn is_deleted(&self, doc_id: DocId) -> bool {
        self.readers.first().is_some_and(|r| r.is_deleted(doc_id))
    }

    pub fn document(&self, doc_id: DocId) -> Result<Option<ForwardDocument>> {
        match self.readers.iter().find(|r| r.info().contains(doc_id)) {
            Some(reader) => reader.document(doc_id),
            None => Ok(None),
        }
    }
}

impl TermReader for MultiIndexBarrelReader {
    fn term_info(&self, term: &Term) -> Option<TermInfo> {
        let mut found = None;
        for reader in &self.readers {
            if let Some(info) = reader.term_info(term) {
                let total = found.get_or_insert(TermInfo::new(0, info.posting_pointer));
                total.doc_freq += info.doc_freq;
            }
        }
        found
    }

    fn term_doc_freqs(&self, term: &Term) -> Option<Box<dyn TermDocFreqs>> {
        let mut subs: Vec<Box<dyn TermDocFreqs>> = self
            .readers
            .iter()
            .filter_map(|r| r.term_doc_freqs(term))
            .collect();
        match subs.len() {
            0 => None,
            1 => subs.pop(),
            _ => Some(Box::new(MultiPostings::new(subs))),
        }
    }

    fn term_positions(&self, term: &Term) -> Option<Box<dyn TermPositions>> {
        let mut subs: Vec<Box<dyn TermPositions>> = self
            .readers
            .iter()
            .filter_map(|r| r.term_positions(term))
            .collect();
        match subs.len() {
            0 => None,
            1 => subs.pop(),
            _ => Some(Box::new(MultiPostings::new(subs))),
        }
    }
}
