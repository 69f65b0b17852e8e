//! Posting encode/decode
//!
//! In memory a posting lives in three `VariantDataPool`s (doc stream,
//! position stream, skip levels). Flushing writes a descriptor followed by
//! the skip data and the doc stream to `.dfp`, and the positions to `.pop`.
//!
//! - doc stream: `(docIdDelta VInt, tf VInt)*`, delta against the previous
//!   posting of the same term
//! - position stream: `tf` position deltas per document, reset at each
//!   document
//! - one skip point after every `skip_interval` postings

use std::ops::Range;
use std::sync::Arc;

use roaring::RoaringBitmap;
use tracing::warn;

use crate::config::PostingConfig;
use crate::error::{IndexError, Result};
use crate::store::vint::SliceReader;
use crate::store::{FileBytes, IndexOutput};

use super::arena::MemoryArena;
use super::pool::VariantDataPool;
use super::skiplist::{SkipListReader, SkipListWriter, SkipPoint};
use super::term_reader::{TermDocFreqs, TermPositions};
use super::types::{DocId, TermInfo, BAD_DOCID, DECODE_BLOCK_SIZE};

/// Header written at a term's posting pointer
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PostingDescriptor {
    pub df: u32,
    pub ctf: u64,
    pub last_doc: DocId,
    pub skip_len: u64,
    pub doc_len: u64,
    pub pos_pointer: u64,
    pub pos_len: u64,
}

impl PostingDescriptor {
    pub fn write(&self, out: &mut dyn IndexOutput) -> Result<()> {
        out.write_vint(self.df)?;
        out.write_vlong(self.ctf)?;
        out.write_vint(self.last_doc)?;
        out.write_vlong(self.skip_len)?;
        out.write_vlong(self.doc_len)?;
        out.write_vlong(self.pos_pointer)?;
        out.write_vlong(self.pos_len)
    }

    pub fn read(reader: &mut SliceReader<'_>) -> Result<Self> {
        Ok(Self {
            df: reader.read_vint()?,
            ctf: reader.read_vlong()?,
            last_doc: reader.read_vint()?,
            skip_len: reader.read_vlong()?,
            doc_len: reader.read_vlong()?,
            pos_pointer: reader.read_vlong()?,
            pos_len: reader.read_vlong()?,
        })
    }
}

/// Byte ranges of one term's posting inside `.dfp` / `.pop`
#[derive(Clone, Debug)]
pub struct PostingSlices {
    pub descriptor: PostingDescriptor,
    pub skip: FileBytes,
    pub docs: FileBytes,
    pub positions: FileBytes,
}

impl PostingSlices {
    pub fn locate(dfp: &FileBytes, pop: &FileBytes, pointer: u64) -> Result<Self> {
        if pointer as usize >= dfp.len() {
            return Err(IndexError::collapse(format!(
                "posting pointer {} beyond .dfp length {}",
                pointer,
                dfp.len()
            )));
        }
        let mut reader = SliceReader::at(dfp.as_slice(), pointer as usize);
        let descriptor = PostingDescriptor::read(&mut reader)?;
        let skip = span(reader.position(), descriptor.skip_len, "skip list")?;
        let docs = span(skip.end, descriptor.doc_len, "doc stream")?;
        let pos_start = usize::try_from(descriptor.pos_pointer)
            .map_err(|_| IndexError::collapse("position pointer out of range"))?;
        let positions = span(pos_start, descriptor.pos_len, "position stream")?;
        Ok(Self {
            descriptor,
            skip: dfp.slice(skip)?,
            docs: dfp.slice(docs)?,
            positions: pop.slice(positions)?,
        })
    }
}

/// `len` bytes from `start`, refusing lengths no file could hold
fn span(start: usize, len: u64, what: &str) -> Result<Range<usize>> {
    usize::try_from(len)
        .ok()
        .and_then(|len| start.checked_add(len))
        .map(|end| start..end)
        .ok_or_else(|| {
            IndexError::collapse(format!("{} of {} bytes at {} out of range", what, len, start))
        })
}

/// In-memory posting builder for one term of one barrel
pub struct PostingWriter {
    doc_pool: VariantDataPool,
    pos_pool: VariantDataPool,
    skip: Option<SkipListWriter>,
    config: PostingConfig,
    df: u32,
    ctf: u64,
    last_doc: Option<DocId>,
}

impl PostingWriter {
    pub fn new(config: PostingConfig) -> Self {
        Self {
            doc_pool: VariantDataPool::new(),
            pos_pool: VariantDataPool::new(),
            skip: None,
            config,
            df: 0,
            ctf: 0,
            last_doc: None,
        }
    }

    /// Append one document with its sorted word positions
    pub fn add(&mut self, arena: &mut MemoryArena, doc: DocId, positions: &[u32]) -> Result<()> {
        if positions.is_empty() {
            return Err(IndexError::InvalidArgument(format!(
                "posting for doc {} has no positions",
                doc
            )));
        }
        if positions.windows(2).any(|w| w[1] < w[0]) {
            return Err(IndexError::InvalidArgument(format!(
                "positions of doc {} are not sorted",
                doc
            )));
        }
        if let Some(last) = self.last_doc {
            if doc <= last {
                return Err(IndexError::InvalidArgument(format!(
                    "doc {} does not follow doc {}",
                    doc, last
                )));
            }
        }

        let tf = positions.len() as u32;
        self.doc_pool
            .add_vint(arena, doc - self.last_doc.unwrap_or(0))?;
        self.doc_pool.add_vint(arena, tf)?;
        let mut prev = 0;
        for &pos in positions {
            self.pos_pool.add_vint(arena, pos - prev)?;
            prev = pos;
        }

        self.df += 1;
        self.ctf += tf as u64;
        self.last_doc = Some(doc);

        if self.df % self.config.skip_interval == 0 {
            let point = SkipPoint::new(
                doc,
                self.df,
                self.doc_pool.length(),
                self.pos_pool.length(),
            );
            let config = self.config;
            self.skip
                .get_or_insert_with(|| {
                    SkipListWriter::new(config.skip_interval, config.max_skip_levels)
                })
                .add_skip_point(arena, point)?;
        }
        Ok(())
    }

    pub fn doc_freq(&self) -> u32 {
        self.df
    }

    pub fn ctf(&self) -> u64 {
        self.ctf
    }

    pub fn last_doc(&self) -> Option<DocId> {
        self.last_doc
    }

    pub fn is_empty(&self) -> bool {
        self.df == 0
    }

    /// Trim every pool's tail chunk before the final write
    pub fn seal(&mut self) {
        self.doc_pool.trunc_tail_chunk();
        self.pos_pool.trunc_tail_chunk();
        if let Some(skip) = &mut self.skip {
            skip.seal();
        }
    }

    pub fn descriptor(&self, pos_pointer: u64) -> PostingDescriptor {
        PostingDescriptor {
            df: self.df,
            ctf: self.ctf,
            last_doc: self.last_doc.unwrap_or(0),
            skip_len: self.skip.as_ref().map_or(0, |s| s.encoded_len()),
            doc_len: self.doc_pool.length(),
            pos_pointer,
            pos_len: self.pos_pool.length(),
        }
    }

    /// Write descriptor, skip data and doc stream to `dfp`, positions to `pop`
    pub fn write(
        &self,
        arena: &MemoryArena,
        dfp: &mut dyn IndexOutput,
        pop: &mut dyn IndexOutput,
    ) -> Result<TermInfo> {
        let pointer = dfp.file_pointer();
        self.descriptor(pop.file_pointer()).write(dfp)?;
        if let Some(skip) = &self.skip {
            skip.write(arena, dfp)?;
        }
        self.doc_pool.write_to(arena, dfp)?;
        self.pos_pool.write_to(arena, pop)?;
        Ok(TermInfo::new(self.df, pointer))
    }
}

/// Decoder for one term's posting in one barrel
pub struct SegmentPostings {
    descriptor: PostingDescriptor,
    docs: FileBytes,
    positions: FileBytes,
    skip: Option<SkipListReader>,
    deleted: Option<Arc<RoaringBitmap>>,
    doc_cursor: usize,
    pos_cursor: usize,
    decoded: u32,
    prev_doc: DocId,
    block_docs: Vec<DocId>,
    block_freqs: Vec<u32>,
    block_idx: usize,
    cur_doc: DocId,
    cur_freq: u32,
    pending_positions: u64,
    pos_buf: Vec<u32>,
    pos_loaded: bool,
    pos_idx: usize,
    failed: bool,
}

impl SegmentPostings {
    pub fn open(
        dfp: &FileBytes,
        pop: &FileBytes,
        pointer: u64,
        deleted: Option<Arc<RoaringBitmap>>,
    ) -> Result<Self> {
        Self::from_slices(PostingSlices::locate(dfp, pop, pointer)?, deleted)
    }

    pub fn from_slices(slices: PostingSlices, deleted: Option<Arc<RoaringBitmap>>) -> Result<Self> {
        let skip = if slices.skip.is_empty() {
            None
        } else {
            Some(SkipListReader::open(slices.skip)?)
        };
        Ok(Self {
            descriptor: slices.descriptor,
            docs: slices.docs,
            positions: slices.positions,
            skip,
            deleted,
            doc_cursor: 0,
            pos_cursor: 0,
            decoded: 0,
            prev_doc: 0,
            block_docs: Vec::with_capacity(DECODE_BLOCK_SIZE),
            block_freqs: Vec::with_capacity(DECODE_BLOCK_SIZE),
            block_idx: 0,
            cur_doc: BAD_DOCID,
            cur_freq: 0,
            pending_positions: 0,
            pos_buf: Vec::new(),
            pos_loaded: false,
            pos_idx: 0,
            failed: false,
        })
    }

    pub fn descriptor(&self) -> &PostingDescriptor {
        &self.descriptor
    }

    /// The stream hit corrupt data and stopped early
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    fn fill_block(&mut self) -> Result<bool> {
        self.block_docs.clear();
        self.block_freqs.clear();
        self.block_idx = 0;
        let count = (self.descriptor.df - self.decoded).min(DECODE_BLOCK_SIZE as u32);
        if count == 0 {
            return Ok(false);
        }
        let mut reader = SliceReader::at(self.docs.as_slice(), self.doc_cursor);
        for _ in 0..count {
            let delta = reader.read_vint()?;
            let tf = reader.read_vint()?;
            let doc = self
                .prev_doc
                .checked_add(delta)
                .ok_or_else(|| IndexError::collapse("docid overflow in posting"))?;
            self.block_docs.push(doc);
            self.block_freqs.push(tf);
            self.prev_doc = doc;
        }
        self.doc_cursor = reader.position();
        self.decoded += count;
        Ok(true)
    }

    fn advance(&mut self) -> Result<Option<DocId>> {
        if self.failed {
            return Ok(None);
        }
        loop {
            if self.cur_doc != BAD_DOCID && !self.pos_loaded {
                self.pending_positions += self.cur_freq as u64;
            }
            self.pos_loaded = false;
            self.pos_idx = 0;
            self.pos_buf.clear();

            if self.block_idx >= self.block_docs.len() && !self.fill_block()? {
                self.cur_doc = BAD_DOCID;
                self.cur_freq = 0;
                return Ok(None);
            }
            self.cur_doc = self.block_docs[self.block_idx];
            self.cur_freq = self.block_freqs[self.block_idx];
            self.block_idx += 1;

            let deleted = self
                .deleted
                .as_ref()
                .is_some_and(|d| d.contains(self.cur_doc));
            if !deleted {
                return Ok(Some(self.cur_doc));
            }
        }
    }

    fn jump(&mut self, point: SkipPoint) {
        self.doc_cursor = point.offset as usize;
        self.pos_cursor = point.pos_offset as usize;
        self.decoded = point.num_skipped;
        self.prev_doc = point.doc;
        self.block_docs.clear();
        self.block_freqs.clear();
        self.block_idx = 0;
        self.cur_doc = BAD_DOCID;
        self.cur_freq = 0;
        self.pending_positions = 0;
    }

    fn consumed(&self) -> u32 {
        self.decoded - (self.block_docs.len() - self.block_idx) as u32
    }

    fn advance_to(&mut self, target: DocId) -> Result<Option<DocId>> {
        if self.failed {
            return Ok(None);
        }
        if self.cur_doc != BAD_DOCID && self.cur_doc >= target {
            return Ok(Some(self.cur_doc));
        }
        if self.descriptor.df == 0 || target > self.descriptor.last_doc {
            // drain so doc() reports the sentinel
            self.decoded = self.descriptor.df;
            self.block_docs.clear();
            self.block_freqs.clear();
            self.block_idx = 0;
            self.cur_doc = BAD_DOCID;
            return Ok(None);
        }
        if target > 0 {
            if let Some(skip) = &mut self.skip {
                if let Some(point) = skip.skip_to(target - 1)? {
                    if point.num_skipped > self.consumed() {
                        self.jump(point);
                    }
                }
            }
        }
        while let Some(doc) = self.advance()? {
            if doc >= target {
                return Ok(Some(doc));
            }
        }
        Ok(None)
    }

    fn load_positions(&mut self) -> Result<()> {
        if self.pos_loaded || self.cur_doc == BAD_DOCID {
            return Ok(());
        }
        let mut reader = SliceReader::at(self.positions.as_slice(), self.pos_cursor);
        for _ in 0..self.pending_positions {
            reader.read_vint()?;
        }
        self.pending_positions = 0;

        self.pos_buf.clear();
        self.pos_buf.reserve(self.cur_freq as usize);
        let mut pos = 0u32;
        for _ in 0..self.cur_freq {
            pos = pos
                .checked_add(reader.read_vint()?)
                .ok_or_else(|| IndexError::collapse("position overflow"))?;
            self.pos_buf.push(pos);
        }
        self.pos_cursor = reader.position();
        self.pos_loaded = true;
        self.pos_idx = 0;
        Ok(())
    }

    fn degrade<T>(&mut self, res: Result<Option<T>>) -> Option<T> {
        match res {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "corrupt posting stream, treating as exhausted");
                self.failed = true;
                self.cur_doc = BAD_DOCID;
                self.pos_buf.clear();
                None
            }
        }
    }
}

impl TermDocFreqs for SegmentPostings {
    fn doc_freq(&self) -> u32 {
        self.descriptor.df
    }

    fn ctf(&self) -> u64 {
        self.descriptor.ctf
    }

    fn next(&mut self) -> Option<DocId> {
        let res = self.advance();
        self.degrade(res)
    }

    fn skip_to(&mut self, target: DocId) -> Option<DocId> {
        let res = self.advance_to(target);
        self.degrade(res)
    }

    fn doc(&self) -> DocId {
        self.cur_doc
    }

    fn freq(&self) -> u32 {
        if self.cur_doc == BAD_DOCID {
            0
        } else {
            self.cur_freq
        }
    }
}

impl TermPositions for SegmentPostings {
    fn next_position(&mut self) -> Option<u32> {
        let res = self.load_positions().map(|_| Some(()));
        self.degrade(res)?;
        let pos = self.pos_buf.get(self.pos_idx).copied();
        if pos.is_some() {
            self.pos_idx += 1;
        }
        pos
    }

    fn positions(&mut self) -> &[u32] {
        let res = self.load_positions().map(|_| Some(()));
        if self.degrade(res).is_none() {
            return &[];
        }
        &self.pos_buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::term_reader::collect_postings;
    use crate::index::types::Posting;
    use crate::store::{Directory, OutputMode, RamDirectory};

    fn config(skip_interval: u32) -> PostingConfig {
        PostingConfig {
            skip_interval,
            max_skip_levels: 3,
        }
    }

    /// Encode postings and return (.dfp, .pop, pointer)
    fn encode(postings: &[Posting], skip_interval: u32) -> (FileBytes, FileBytes, u64) {
        let mut arena = MemoryArena::new(1 << 12, 1 << 12).unwrap();
        let mut writer = PostingWriter::new(config(skip_interval));
        for p in postings {
            writer.add(&mut arena, p.doc_id, &p.positions).unwrap();
        }
        writer.seal();

        let dir = RamDirectory::new();
        let mut dfp = dir.create_output("t.dfp", OutputMode::Truncate).unwrap();
        let mut pop = dir.create_output("t.pop", OutputMode::Truncate).unwrap();
        // a leading byte so the pointer is not zero
        dfp.write_byte(0xFF).unwrap();
        let info = writer.write(&arena, dfp.as_mut(), pop.as_mut()).unwrap();
        assert_eq!(info.doc_freq, postings.len() as u32);
        dfp.close().unwrap();
        pop.close().unwrap();
        (
            dir.open_bytes("t.dfp").unwrap(),
            dir.open_bytes("t.pop").unwrap(),
            info.posting_pointer,
        )
    }

    fn sample(n: u32) -> Vec<Posting> {
        (0..n)
            .map(|i| {
                let doc = i * 7 + (i % 5);
                let positions: Vec<u32> = (0..(i % 4) + 1).map(|k| k * 2 + i % 3).collect();
                Posting::with_positions(doc, positions)
            })
            .collect()
    }

    #[test]
    fn test_roundtrip_with_positions() {
        for n in [1, 7, 8, 9, 64, 300] {
            let postings = sample(n);
            let (dfp, pop, ptr) = encode(&postings, 8);
            let mut reader = SegmentPostings::open(&dfp, &pop, ptr, None).unwrap();
            assert_eq!(reader.doc_freq(), n);
            assert_eq!(
                reader.ctf(),
                postings.iter().map(|p| p.term_freq as u64).sum::<u64>()
            );
            assert_eq!(collect_postings(&mut reader), postings);
            assert_eq!(reader.doc(), BAD_DOCID);
            assert_eq!(reader.next(), None);
        }
    }

    #[test]
    fn test_skip_to_with_skip_list() {
        let docs = [10u32, 20, 30, 40, 50];
        let postings: Vec<Posting> = docs
            .iter()
            .map(|&d| Posting::with_positions(d, vec![d % 7]))
            .collect();
        let (dfp, pop, ptr) = encode(&postings, 2);
        let mut reader = SegmentPostings::open(&dfp, &pop, ptr, None).unwrap();
        assert!(reader.skip.is_some());

        assert_eq!(reader.skip_to(35), Some(40));
        assert_eq!(reader.freq(), 1);
        assert_eq!(reader.positions(), &[40 % 7]);
        assert_eq!(reader.skip_to(40), Some(40));
        assert_eq!(reader.next(), Some(50));
        assert_eq!(reader.skip_to(51), None);
        assert_eq!(reader.doc(), BAD_DOCID);
    }

    #[test]
    fn test_skip_to_exact_block_end() {
        let postings: Vec<Posting> = (1..=40)
            .map(|d| Posting::with_positions(d * 10, vec![d, d + 1]))
            .collect();
        let (dfp, pop, ptr) = encode(&postings, 4);

        for target in [0u32, 10, 40, 41, 200, 205, 400] {
            let mut reader = SegmentPostings::open(&dfp, &pop, ptr, None).unwrap();
            let expected = postings.iter().find(|p| p.doc_id >= target);
            assert_eq!(reader.skip_to(target), expected.map(|p| p.doc_id));
            if let Some(p) = expected {
                assert_eq!(reader.positions(), p.positions.as_slice());
            }
        }
    }

    #[test]
    fn test_positions_skipped_lazily() {
        let postings = sample(100);
        let (dfp, pop, ptr) = encode(&postings, 8);
        let mut reader = SegmentPostings::open(&dfp, &pop, ptr, None).unwrap();
        // walk without reading positions, then read one deep in the list
        for _ in 0..57 {
            reader.next().unwrap();
        }
        assert_eq!(reader.doc(), postings[56].doc_id);
        assert_eq!(reader.positions(), postings[56].positions.as_slice());
        let mut got = Vec::new();
        while let Some(p) = reader.next_position() {
            got.push(p);
        }
        assert_eq!(got, postings[56].positions);

        let target = postings[90].doc_id;
        assert_eq!(reader.skip_to(target), Some(target));
        assert_eq!(reader.next_position(), Some(postings[90].positions[0]));
    }

    #[test]
    fn test_deleted_docs_are_skipped() {
        let postings = sample(20);
        let (dfp, pop, ptr) = encode(&postings, 4);
        let mut deleted = RoaringBitmap::new();
        deleted.insert(postings[0].doc_id);
        deleted.insert(postings[7].doc_id);
        let mut reader = SegmentPostings::open(&dfp, &pop, ptr, Some(Arc::new(deleted))).unwrap();

        let expected: Vec<Posting> = postings
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != 0 && *i != 7)
            .map(|(_, p)| p.clone())
            .collect();
        assert_eq!(collect_postings(&mut reader), expected);
    }

    #[test]
    fn test_writer_rejects_bad_input() {
        let mut arena = MemoryArena::new(256, 256).unwrap();
        let mut writer = PostingWriter::new(config(8));
        writer.add(&mut arena, 5, &[1]).unwrap();
        assert!(writer.add(&mut arena, 5, &[1]).is_err());
        assert!(writer.add(&mut arena, 4, &[1]).is_err());
        assert!(writer.add(&mut arena, 6, &[]).is_err());
        assert!(writer.add(&mut arena, 6, &[3, 1]).is_err());
        assert_eq!(writer.doc_freq(), 1);
    }

    #[test]
    fn test_corrupt_stream_degrades_to_empty() {
        let postings = sample(10);
        let (dfp, pop, ptr) = encode(&postings, 8);
        // cut the doc stream in half
        let mut slices = PostingSlices::locate(&dfp, &pop, ptr).unwrap();
        let half = slices.docs.len() / 2;
        slices.docs = slices.docs.slice(0..half).unwrap();
        let mut reader = SegmentPostings::from_slices(slices, None).unwrap();
        assert_eq!(reader.next(), None);
        assert_eq!(reader.doc(), BAD_DOCID);
        assert_eq!(reader.freq(), 0);
    }

    #[test]
    fn test_oversized_descriptor_is_rejected() {
        let dir = RamDirectory::new();
        let broken = [
            PostingDescriptor {
                skip_len: u64::MAX,
                ..Default::default()
            },
            PostingDescriptor {
                skip_len: 1,
                doc_len: u64::MAX,
                ..Default::default()
            },
            PostingDescriptor {
                pos_pointer: u64::MAX,
                pos_len: 1,
                ..Default::default()
            },
            PostingDescriptor {
                pos_pointer: 1,
                pos_len: u64::MAX,
                ..Default::default()
            },
            PostingDescriptor {
                doc_len: 64,
                ..Default::default()
            },
        ];
        for (i, descriptor) in broken.iter().enumerate() {
            let name = format!("bad{}.dfp", i);
            let mut out = dir.create_output(&name, OutputMode::Truncate).unwrap();
            out.write_byte(0xFF).unwrap();
            descriptor.write(out.as_mut()).unwrap();
            out.write_bytes(&[0; 4]).unwrap();
            out.close().unwrap();
            let dfp = dir.open_bytes(&name).unwrap();
            let pop = FileBytes::from_vec(vec![0; 4]);
            assert!(matches!(
                PostingSlices::locate(&dfp, &pop, 1),
                Err(IndexError::IndexCollapse(_))
            ));
        }
    }
}
