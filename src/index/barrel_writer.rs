use std::sync::Arc;

use tracing::{info, warn};

use crate::config::{IndexSchema, MemoryConfig, PostingConfig};
use crate::error::{IndexError, Result};
use crate::store::{delete_if_exists, Directory, OutputMode, RamDirectory};

use super::arena::MemoryArena;
use super::barrel_info::BarrelInfo;
use super::barrel_reader::BarrelFiles;
use super::collection_indexer::CollectionIndexer;
use super::doc_length::DocLengthWriter;
use super::forward_index::{fdd_file, fdi_file};
use super::types::IndexerDocument;

/// The in-memory barrel currently accepting documents
pub struct IndexBarrelWriter {
    arena: MemoryArena,
    indexer: CollectionIndexer,
    info: BarrelInfo,
    memory: MemoryConfig,
    num_tokens: u64,
}

impl IndexBarrelWriter {
    pub fn new(
        info: BarrelInfo,
        schema: &IndexSchema,
        posting: PostingConfig,
        memory: MemoryConfig,
    ) -> Result<Self> {
        Ok(Self {
            arena: MemoryArena::new(memory.arena_size, memory.grow_size)?,
            indexer: CollectionIndexer::new(schema, posting),
            info,
            memory,
            num_tokens: 0,
        })
    }

    pub fn info(&self) -> &BarrelInfo {
        &self.info
    }

    pub fn doc_count(&self) -> u32 {
        self.info.doc_count
    }

    pub fn is_empty(&self) -> bool {
        self.info.is_empty()
    }

    pub fn num_tokens(&self) -> u64 {
        self.num_tokens
    }

    /// Bytes of arena memory in use
    pub fn memory_used(&self) -> usize {
        self.arena.used()
    }

    /// A document that fails once postings were written still takes its
    /// docid in this barrel, so readers can mask it with a tombstone.
    pub fn add_document(
        &mut self,
        doc: &IndexerDocument,
        doc_lengths: &mut DocLengthWriter,
    ) -> Result<()> {
        doc.validate()?;
        if !self.info.is_empty() && doc.doc_id <= self.info.max_doc_id {
            return Err(IndexError::InvalidArgument(format!(
                "doc {} does not follow doc {} in barrel {}",
                doc.doc_id, self.info.max_doc_id, self.info.name
            )));
        }
        let indexed = self.indexer.add_document(&mut self.arena, doc, doc_lengths);
        self.info.add_doc(doc.doc_id);
        self.num_tokens += indexed? as u64;
        Ok(())
    }

    /// Time to flush this barrel
    pub fn is_cache_full(&self) -> bool {
        self.arena.used() >= self.memory.flush_threshold
            || self.info.doc_count >= self.memory.max_docs_per_barrel
    }

    /// Write the barrel's files into `dir`, removing them again on failure
    pub fn write(&mut self, dir: &dyn Directory) -> Result<BarrelInfo> {
        self.indexer.seal();
        let mut info = self.info.clone();
        info.has_forward_index = self.indexer.has_forward_index();
        if let Err(e) = self.write_files(dir, &info) {
            for file in info.files() {
                if let Err(del) = delete_if_exists(dir, &file) {
                    warn!(file = %file, error = %del, "cannot remove partial barrel file");
                }
            }
            return Err(e);
        }

        info.size_bytes = info
            .files()
            .iter()
            .map(|f| dir.file_length(f))
            .sum::<Result<u64>>()?;
        info.searchable = true;
        info!(
            barrel = %info.name,
            docs = info.doc_count,
            terms = self.indexer.num_terms(),
            bytes = info.size_bytes,
            "barrel flushed"
        );
        Ok(info)
    }

    fn write_files(&self, dir: &dyn Directory, info: &BarrelInfo) -> Result<()> {
        let mut dfp = dir.create_output(&info.dfp_file(), OutputMode::Truncate)?;
        let mut pop = dir.create_output(&info.pop_file(), OutputMode::Truncate)?;
        let vocabulary = self.indexer.write(&self.arena, dfp.as_mut(), pop.as_mut())?;
        dfp.close()?;
        pop.close()?;

        if info.has_forward_index {
            let mut fdi = dir.create_output(&fdi_file(&info.name), OutputMode::Truncate)?;
            let mut fdd = dir.create_output(&fdd_file(&info.name), OutputMode::Truncate)?;
            self.indexer
                .forward_index()
                .write(fdi.as_mut(), fdd.as_mut())?;
            fdi.close()?;
            fdd.close()?;
        }

        // the vocabulary goes last: its presence marks a complete barrel
        let mut voc = dir.create_output(&info.voc_file(), OutputMode::Truncate)?;
        vocabulary.write(voc.as_mut())?;
        voc.close()
    }

    /// Searchable copy of the documents indexed so far, encoded into RAM
    pub fn snapshot(&self) -> Result<Option<Arc<BarrelFiles>>> {
        if self.is_empty() {
            return Ok(None);
        }
        let dir = RamDirectory::new();
        let mut info = self.info.clone();
        info.has_forward_index = self.indexer.has_forward_index();
        self.write_files(&dir, &info)?;
        info.searchable = true;
        BarrelFiles::open_detached(&dir, info).map(Some)
    }
}
