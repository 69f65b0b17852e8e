//! Barrel merging
//!
//! Terms are merged with a k-way walk over the source vocabularies. When
//! none of a term's sources holds deleted documents, the encoded streams
//! are spliced: only the first doc delta of each later source is
//! re-encoded and its skip points are shifted into place. Otherwise the
//! postings are decoded and re-encoded without the deleted documents.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Instant;

use roaring::RoaringBitmap;
use tracing::{debug, info, warn};

use crate::config::{MemoryConfig, PostingConfig};
use crate::error::{IndexError, Result};
use crate::store::vint::{encode_vint, SliceReader};
use crate::store::{delete_if_exists, Directory, IndexOutput, OutputMode};

use super::arena::MemoryArena;
use super::barrel_info::BarrelInfo;
use super::barrel_reader::BarrelFiles;
use super::forward_index::{fdd_file, fdi_file, merge_forward_indexes};
use super::merge_policy::MergeBarrelQueue;
use super::posting::{PostingDescriptor, PostingSlices, PostingWriter, SegmentPostings};
use super::skiplist::{SkipListMerger, SkipListReader, SkipListWriter, SkipPoint};
use super::term_reader::{TermDocFreqs, TermPositions, Vocabulary};
use super::types::{DocId, Term, TermInfo};

/// One merge source with its tombstones, if any fall into its range
struct Source {
    files: Arc<BarrelFiles>,
    deleted: Option<Arc<RoaringBitmap>>,
}

pub struct IndexMerger {
    posting: PostingConfig,
    memory: MemoryConfig,
}

impl IndexMerger {
    pub fn new(posting: PostingConfig, memory: MemoryConfig) -> Self {
        Self { posting, memory }
    }

    /// Merge `queue` into a new barrel described by `target` inside `out`
    ///
    /// `target` supplies id, name and level; document range and counts are
    /// filled in from the sources. Partial output is removed on failure.
    pub fn merge(
        &self,
        queue: &MergeBarrelQueue,
        deleted: &Arc<RoaringBitmap>,
        out: &dyn Directory,
        mut target: BarrelInfo,
    ) -> Result<BarrelInfo> {
        if queue.is_empty() {
            return Err(IndexError::InvalidArgument(
                "merge queue is empty".to_string(),
            ));
        }
        let started = Instant::now();
        let sources = queue
            .entries()
            .iter()
            .map(|entry| {
                let files = BarrelFiles::open_detached(entry.directory.as_ref(), entry.barrel.clone())?;
                let deleted = (entry.barrel.deleted_count(deleted) > 0).then(|| deleted.clone());
                Ok(Source { files, deleted })
            })
            .collect::<Result<Vec<_>>>()?;

        let first = &queue.entries()[0].barrel;
        target.base_doc_id = first.base_doc_id;
        target.max_doc_id = queue
            .entries()
            .iter()
            .map(|e| e.barrel.max_doc_id)
            .max()
            .unwrap_or(first.max_doc_id);
        target.doc_count = queue
            .entries()
            .iter()
            .map(|e| e.barrel.doc_count)
            .sum();
        target.has_forward_index = sources.iter().any(|s| s.files.forward_index().is_some());

        let num_terms = match self.write_files(&sources, deleted, out, &target) {
            Ok(n) => n,
            Err(e) => {
                for file in target.files() {
                    if let Err(del) = delete_if_exists(out, &file) {
                        warn!(file = %file, error = %del, "cannot remove partial merge output");
                    }
                }
                return Err(e);
            }
        };

        target.size_bytes = target
            .files()
            .iter()
            .map(|f| out.file_length(f))
            .sum::<Result<u64>>()?;
        target.searchable = true;
        info!(
            barrel = %target.name,
            sources = queue.len(),
            docs = target.doc_count,
            terms = num_terms,
            bytes = target.size_bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "barrels merged"
        );
        Ok(target)
    }

    fn write_files(
        &self,
        sources: &[Source],
        deleted: &RoaringBitmap,
        out: &dyn Directory,
        target: &BarrelInfo,
    ) -> Result<usize> {
        let mut arena = MemoryArena::new(self.memory.merge_arena_size, self.memory.grow_size)?;
        let mut dfp = out.create_output(&target.dfp_file(), OutputMode::Truncate)?;
        let mut pop = out.create_output(&target.pop_file(), OutputMode::Truncate)?;
        let vocabulary = self.merge_terms(sources, &mut arena, dfp.as_mut(), pop.as_mut())?;
        dfp.close()?;
        pop.close()?;

        if target.has_forward_index {
            let readers: Vec<_> = sources
                .iter()
                .filter_map(|s| s.files.forward_index())
                .collect();
            let mut fdi = out.create_output(&fdi_file(&target.name), OutputMode::Truncate)?;
            let mut fdd = out.create_output(&fdd_file(&target.name), OutputMode::Truncate)?;
            let docs = merge_forward_indexes(&readers, deleted, fdi.as_mut(), fdd.as_mut())?;
            fdi.close()?;
            fdd.close()?;
            debug!(barrel = %target.name, docs, "forward index merged");
        }

        // last, so a barrel with a vocabulary is always complete
        let mut voc = out.create_output(&target.voc_file(), OutputMode::Truncate)?;
        vocabulary.write(voc.as_mut())?;
        voc.close()?;
        Ok(vocabulary.num_terms())
    }

    fn merge_terms(
        &self,
        sources: &[Source],
        arena: &mut MemoryArena,
        dfp: &mut dyn IndexOutput,
        pop: &mut dyn IndexOutput,
    ) -> Result<Vocabulary> {
        let mut cursors: Vec<_> = sources.iter().map(|s| s.files.vocabulary().iter()).collect();
        let mut heads = vec![TermInfo::default(); sources.len()];
        let mut heap = BinaryHeap::new();
        for (i, cursor) in cursors.iter_mut().enumerate() {
            if let Some((term, info)) = cursor.next() {
                heads[i] = info;
                heap.push(Reverse((term, i)));
            }
        }

        let mut vocabulary = Vocabulary::new();
        let mut group: Vec<(usize, TermInfo)> = Vec::with_capacity(sources.len());
        while let Some(Reverse((term, first))) = heap.pop() {
            group.clear();
            group.push((first, heads[first]));
            while let Some(Reverse((next, _))) = heap.peek() {
                if *next != term {
                    break;
                }
                if let Some(Reverse((_, i))) = heap.pop() {
                    group.push((i, heads[i]));
                }
            }
            // sources are in docid order; keep the postings in that order too
            group.sort_unstable_by_key(|&(i, _)| i);
            for &(i, _) in &group {
                if let Some((next, info)) = cursors[i].next() {
                    heads[i] = info;
                    heap.push(Reverse((next, i)));
                }
            }

            let spliceable = group.iter().all(|&(i, _)| sources[i].deleted.is_none());
            let merged = if spliceable {
                self.splice_term(sources, &group, arena, dfp, pop)
            } else {
                self.rewrite_term(sources, &group, arena, dfp, pop)
            };
            arena.flush_mem();
            match merged.map_err(|e| term_context(&term, e))? {
                Some(info) => vocabulary.push(&term.field, term.value, info)?,
                None => debug!(term = %term, "every posting deleted, term dropped"),
            }
        }
        Ok(vocabulary)
    }

    /// Concatenate encoded postings of barrels without deletions
    fn splice_term(
        &self,
        sources: &[Source],
        group: &[(usize, TermInfo)],
        arena: &mut MemoryArena,
        dfp: &mut dyn IndexOutput,
        pop: &mut dyn IndexOutput,
    ) -> Result<Option<TermInfo>> {
        let mut skip = SkipListWriter::new(self.posting.skip_interval, self.posting.max_skip_levels);
        let mut docs: Vec<u8> = Vec::new();
        let pos_pointer = pop.file_pointer();
        let mut pos_len = 0u64;
        let mut df = 0u32;
        let mut ctf = 0u64;
        let mut last_doc: Option<DocId> = None;

        for &(i, info) in group {
            let files = &sources[i].files;
            let slices = PostingSlices::locate(files.dfp(), files.pop(), info.posting_pointer)?;
            let source = slices.descriptor;
            if source.df == 0 {
                continue;
            }
            let stream = slices.docs.as_slice();
            let mut reader = SliceReader::new(stream);
            let first_doc = reader.read_vint()?;
            let old_first_len = reader.position();

            let delta = match last_doc {
                Some(last) => {
                    if first_doc <= last {
                        return Err(IndexError::collapse(format!(
                            "barrel {} starts at doc {} but the previous source ends at {}",
                            files.info().name,
                            first_doc,
                            last
                        )));
                    }
                    // a point at the seam lets skip_to jump straight into this source
                    if df >= self.posting.skip_interval
                        && skip.last_point().map_or(true, |p| p.doc < last)
                    {
                        skip.add_skip_point(
                            arena,
                            SkipPoint::new(last, df, docs.len() as u64, pos_len),
                        )?;
                    }
                    first_doc - last
                }
                None => first_doc,
            };

            let base = docs.len() as i64;
            encode_vint(delta, &mut docs);
            let new_first_len = docs.len() as i64 - base;
            docs.extend_from_slice(&stream[old_first_len..]);

            if !slices.skip.is_empty() {
                let shift = SkipListMerger::new(
                    0,
                    df,
                    base + new_first_len - old_first_len as i64,
                    pos_len,
                );
                shift.merge(&SkipListReader::open(slices.skip)?, &mut skip, arena)?;
            }

            pop.write_bytes(slices.positions.as_slice())?;
            pos_len += source.pos_len;
            df = df
                .checked_add(source.df)
                .ok_or_else(|| IndexError::collapse("document frequency overflow"))?;
            ctf += source.ctf;
            last_doc = Some(source.last_doc);
        }

        let Some(last_doc) = last_doc else {
            return Ok(None);
        };
        skip.seal();
        let pointer = dfp.file_pointer();
        PostingDescriptor {
            df,
            ctf,
            last_doc,
            skip_len: skip.encoded_len(),
            doc_len: docs.len() as u64,
            pos_pointer,
            pos_len,
        }
        .write(dfp)?;
        skip.write(arena, dfp)?;
        dfp.write_bytes(&docs)?;
        Ok(Some(TermInfo::new(df, pointer)))
    }

    /// Decode, drop deleted documents, re-encode
    fn rewrite_term(
        &self,
        sources: &[Source],
        group: &[(usize, TermInfo)],
        arena: &mut MemoryArena,
        dfp: &mut dyn IndexOutput,
        pop: &mut dyn IndexOutput,
    ) -> Result<Option<TermInfo>> {
        let mut writer = PostingWriter::new(self.posting);
        for &(i, info) in group {
            let source = &sources[i];
            let mut postings = SegmentPostings::open(
                source.files.dfp(),
                source.files.pop(),
                info.posting_pointer,
                source.deleted.clone(),
            )?;
            while let Some(doc) = postings.next() {
                let positions = postings.positions();
                writer.add(arena, doc, positions)?;
            }
            if postings.is_failed() {
                return Err(IndexError::collapse(format!(
                    "corrupt posting in barrel {}",
                    source.files.info().name
                )));
            }
        }
        if writer.is_empty() {
            return Ok(None);
        }
        writer.seal();
        writer.write(arena, dfp, pop).map(Some)
    }
}

fn term_context(term: &Term, err: IndexError) -> IndexError {
    match err {
        IndexError::IndexCollapse(msg) => {
            IndexError::collapse(format!("merging term {}: {}", term, msg))
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FieldSchema, IndexSchema};
    use crate::index::barrel_reader::SingleIndexBarrelReader;
    use crate::index::barrel_writer::IndexBarrelWriter;
    use crate::index::doc_length::DocLengthWriter;
    use crate::index::merge_policy::MergeBarrelEntry;
    use crate::index::term_reader::{collect_postings, TermReader};
    use crate::index::types::{la_input, BarrelId, IndexerDocument, Posting};
    use crate::store::RamDirectory;

    fn posting_config() -> PostingConfig {
        PostingConfig {
            skip_interval: 2,
            max_skip_levels: 2,
        }
    }

    fn memory() -> MemoryConfig {
        MemoryConfig {
            arena_size: 8192,
            grow_size: 8192,
            flush_threshold: 1 << 20,
            max_docs_per_barrel: 1000,
            merge_arena_size: 4096,
        }
    }

    fn schema() -> IndexSchema {
        IndexSchema::new(vec![
            FieldSchema::indexed("body").with_forward_index(),
            FieldSchema::indexed("tag"),
        ])
    }

    /// body: term 1 in every doc, term 2 in even docs, term 100+doc once
    fn doc(id: DocId) -> IndexerDocument {
        let mut body = vec![1, 100 + id];
        if id % 2 == 0 {
            body.push(2);
            body.push(1);
        }
        IndexerDocument::new(id)
            .with_field("body", la_input(&body))
            .with_field("tag", la_input(&[id % 3]))
    }

    fn build(dir: &Arc<RamDirectory>, id: u64, docs: impl Iterator<Item = DocId>) -> MergeBarrelEntry {
        let barrel = BarrelId(id);
        let mut writer = IndexBarrelWriter::new(
            BarrelInfo::new(barrel, BarrelInfo::flushed_name(barrel)),
            &schema(),
            posting_config(),
            memory(),
        )
        .unwrap();
        let mut lengths = DocLengthWriter::open(dir.as_ref(), 2).unwrap();
        for d in docs {
            writer.add_document(&doc(d), &mut lengths).unwrap();
        }
        let info = writer.write(dir.as_ref()).unwrap();
        MergeBarrelEntry::new(dir.clone(), info)
    }

    fn open(dir: &Arc<RamDirectory>, info: BarrelInfo, deleted: RoaringBitmap) -> SingleIndexBarrelReader {
        let files = BarrelFiles::open(dir.clone(), info).unwrap();
        SingleIndexBarrelReader::new(files, Arc::new(deleted))
    }

    fn merged_target() -> BarrelInfo {
        BarrelInfo::new(BarrelId(99), BarrelInfo::merged_name(1, 0))
    }

    fn all_terms(reader: &SingleIndexBarrelReader) -> Vec<(Term, Vec<Posting>)> {
        reader
            .files()
            .vocabulary()
            .iter()
            .map(|(term, _)| {
                let mut postings = reader.term_positions(&term).unwrap();
                (term, collect_postings(&mut postings))
            })
            .collect()
    }

    #[test]
    fn test_spliced_merge_equals_single_barrel() {
        let dir = Arc::new(RamDirectory::new());
        let queue = MergeBarrelQueue::new(vec![
            build(&dir, 2, 13..30),
            build(&dir, 0, 0..7),
            build(&dir, 1, 7..13),
        ]);
        let expected = build(&dir, 3, 0..30);

        let merger = IndexMerger::new(posting_config(), memory());
        let deleted = Arc::new(RoaringBitmap::new());
        let info = merger
            .merge(&queue, &deleted, dir.as_ref(), merged_target())
            .unwrap();
        assert_eq!((info.base_doc_id, info.max_doc_id, info.doc_count), (0, 29, 30));
        assert!(info.searchable && info.has_forward_index);

        let merged = open(&dir, info, RoaringBitmap::new());
        let single = open(&dir, expected.barrel, RoaringBitmap::new());
        assert_eq!(all_terms(&merged), all_terms(&single));
        assert_eq!(merged.document(20).unwrap(), single.document(20).unwrap());
    }

    #[test]
    fn test_skip_to_across_seams() {
        let dir = Arc::new(RamDirectory::new());
        let queue = MergeBarrelQueue::new(vec![
            build(&dir, 0, 0..9),
            build(&dir, 1, 9..20),
            build(&dir, 2, 20..41),
        ]);
        let merger = IndexMerger::new(posting_config(), memory());
        let info = merger
            .merge(&queue, &Arc::new(RoaringBitmap::new()), dir.as_ref(), merged_target())
            .unwrap();
        let merged = open(&dir, info, RoaringBitmap::new());

        for target in [0, 1, 8, 9, 10, 19, 20, 21, 33, 40] {
            let mut postings = merged.term_positions(&Term::new("body", 2)).unwrap();
            let expect = if target % 2 == 0 { target } else { target + 1 };
            assert_eq!(postings.skip_to(target), Some(expect), "target {}", target);
            assert_eq!(postings.positions(), &[2], "target {}", target);
        }
        let mut postings = merged.term_doc_freqs(&Term::new("body", 1)).unwrap();
        assert_eq!(postings.skip_to(17), Some(17));
        assert_eq!(postings.next(), Some(18));
        assert_eq!(postings.skip_to(41), None);
    }

    #[test]
    fn test_merge_drops_deleted_docs() {
        let dir = Arc::new(RamDirectory::new());
        let queue = MergeBarrelQueue::new(vec![build(&dir, 0, 0..10), build(&dir, 1, 10..20)]);
        let mut deleted = RoaringBitmap::new();
        deleted.insert(4);
        deleted.insert(15);
        let merger = IndexMerger::new(posting_config(), memory());
        let info = merger
            .merge(&queue, &Arc::new(deleted.clone()), dir.as_ref(), merged_target())
            .unwrap();
        // raw count: tombstones stay in the collection bitmap
        assert_eq!(info.doc_count, 20);

        let merged = open(&dir, info, RoaringBitmap::new());
        assert!(merged.term_info(&Term::new("body", 104)).is_none());
        assert!(merged.term_info(&Term::new("body", 115)).is_none());
        assert_eq!(merged.doc_freq(&Term::new("body", 1)), 18);
        let mut evens = merged.term_positions(&Term::new("body", 2)).unwrap();
        let docs: Vec<DocId> = collect_postings(&mut evens).iter().map(|p| p.doc_id).collect();
        assert_eq!(docs, vec![0, 2, 6, 8, 10, 12, 14, 16, 18]);
        assert!(merged.document(4).unwrap().is_none());
        assert!(merged.document(5).unwrap().is_some());

        // skip data was rebuilt for the re-encoded posting
        let mut postings = merged.term_doc_freqs(&Term::new("body", 1)).unwrap();
        assert_eq!(postings.skip_to(15), Some(16));
    }

    #[test]
    fn test_failed_merge_leaves_no_files() {
        let dir = Arc::new(RamDirectory::new());
        let a = build(&dir, 0, 0..4);
        let b = build(&dir, 1, 4..8);
        // truncate b's posting file so its descriptors point past the end
        let mut out = dir.create_output("_1.dfp", OutputMode::Truncate).unwrap();
        out.write_bytes(&[0]).unwrap();
        out.close().unwrap();

        let merger = IndexMerger::new(posting_config(), memory());
        let target = merged_target();
        let err = merger
            .merge(
                &MergeBarrelQueue::new(vec![a, b]),
                &Arc::new(RoaringBitmap::new()),
                dir.as_ref(),
                target.clone(),
            )
            .unwrap_err();
        assert!(err.is_fatal());
        for file in ["dfp", "pop", "voc", "fdi", "fdd"] {
            assert!(!dir.file_exists(&format!("{}.{}", target.name, file)));
        }
    }
}
