//! Multi-level skip lists over posting streams
//!
//! A skip point is recorded after every completed block of postings and
//! remembers where the *next* block starts. Level `k` holds every
//! `skip_interval^k`-th point; entries above level 0 carry a child pointer
//! to the same point's entry in the level below, so `skip_to` walks down
//! from the sparsest level.
//!
//! Serialized form: `VInt num_levels`, then each level from the top down to
//! 0 as `VLong len` followed by `len` bytes of delta-encoded entries
//! `(doc, count, offset, pos_offset[, child])`.

use crate::error::{IndexError, Result};
use crate::store::vint::{vlong_len, SliceReader};
use crate::store::{FileBytes, IndexOutput};

use super::arena::MemoryArena;
use super::pool::VariantDataPool;
use super::types::{DocId, BAD_DOCID};

/// Upper bound on skip levels accepted when reading
const MAX_READ_LEVELS: usize = 32;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SkipPoint {
    /// Last docid of the completed block
    pub doc: DocId,
    /// Postings before the next block
    pub num_skipped: u32,
    /// Doc-stream offset of the next block
    pub offset: u64,
    /// Position-stream offset of the next block
    pub pos_offset: u64,
}

impl SkipPoint {
    pub fn new(doc: DocId, num_skipped: u32, offset: u64, pos_offset: u64) -> Self {
        Self {
            doc,
            num_skipped,
            offset,
            pos_offset,
        }
    }
}

pub struct SkipListWriter {
    skip_interval: u64,
    levels: Vec<VariantDataPool>,
    last: Vec<SkipPoint>,
    num_points: u64,
}

impl SkipListWriter {
    pub fn new(skip_interval: u32, max_levels: usize) -> Self {
        let max_levels = max_levels.max(1);
        Self {
            skip_interval: skip_interval.max(2) as u64,
            levels: (0..max_levels).map(|_| VariantDataPool::new()).collect(),
            last: vec![SkipPoint::default(); max_levels],
            num_points: 0,
        }
    }

    pub fn num_points(&self) -> u64 {
        self.num_points
    }

    pub fn is_empty(&self) -> bool {
        self.num_points == 0
    }

    pub fn last_point(&self) -> Option<SkipPoint> {
        (self.num_points > 0).then(|| self.last[0])
    }

    fn levels_for(&self, point_number: u64) -> usize {
        let mut levels = 1;
        let mut n = point_number;
        while levels < self.levels.len() && n % self.skip_interval == 0 {
            levels += 1;
            n /= self.skip_interval;
        }
        levels
    }

    pub fn add_skip_point(&mut self, arena: &mut MemoryArena, point: SkipPoint) -> Result<()> {
        if let Some(prev) = self.last_point() {
            if point.doc <= prev.doc
                || point.num_skipped < prev.num_skipped
                || point.offset < prev.offset
                || point.pos_offset < prev.pos_offset
            {
                return Err(IndexError::InvalidArgument(format!(
                    "skip point {:?} does not follow {:?}",
                    point, prev
                )));
            }
        }

        self.num_points += 1;
        let levels = self.levels_for(self.num_points);
        let mut child_pointer = 0u64;
        for level in 0..levels {
            let last = self.last[level];
            let pool = &mut self.levels[level];
            let entry_start = pool.length();
            pool.add_vint(arena, point.doc - last.doc)?;
            pool.add_vint(arena, point.num_skipped - last.num_skipped)?;
            pool.add_vlong(arena, point.offset - last.offset)?;
            pool.add_vlong(arena, point.pos_offset - last.pos_offset)?;
            if level > 0 {
                pool.add_vlong(arena, child_pointer)?;
            }
            self.last[level] = point;
            child_pointer = entry_start;
        }
        Ok(())
    }

    pub fn num_levels(&self) -> usize {
        self.levels.iter().take_while(|l| !l.is_empty()).count()
    }

    /// Bytes `write` will produce
    pub fn encoded_len(&self) -> u64 {
        let levels = self.num_levels();
        if levels == 0 {
            return 0;
        }
        let body: u64 = self.levels[..levels]
            .iter()
            .map(|l| vlong_len(l.length()) as u64 + l.length())
            .sum();
        vlong_len(levels as u64) as u64 + body
    }

    pub fn seal(&mut self) {
        for level in &mut self.levels {
            level.trunc_tail_chunk();
        }
    }

    pub fn write(&self, arena: &MemoryArena, out: &mut dyn IndexOutput) -> Result<()> {
        let levels = self.num_levels();
        if levels == 0 {
            return Ok(());
        }
        out.write_vint(levels as u32)?;
        for level in self.levels[..levels].iter().rev() {
            out.write_vlong(level.length())?;
            level.write_to(arena, out)?;
        }
        Ok(())
    }
}

pub struct SkipListReader {
    data: FileBytes,
    regions: Vec<(usize, usize)>,
    cursors: Vec<usize>,
    base: Vec<SkipPoint>,
    next: Vec<Option<(SkipPoint, u64)>>,
    last: Option<SkipPoint>,
}

impl SkipListReader {
    pub fn open(data: FileBytes) -> Result<Self> {
        let mut regions = Vec::new();
        if !data.is_empty() {
            let mut reader = SliceReader::new(data.as_slice());
            let levels = reader.read_vint()? as usize;
            if levels == 0 || levels > MAX_READ_LEVELS {
                return Err(IndexError::collapse(format!(
                    "skip list claims {} levels",
                    levels
                )));
            }
            regions = vec![(0, 0); levels];
            for level in (0..levels).rev() {
                let len = reader.read_vlong()? as usize;
                let start = reader.position();
                reader.read_slice(len)?;
                regions[level] = (start, start + len);
            }
        }

        let levels = regions.len();
        let mut reader = Self {
            data,
            cursors: regions.iter().map(|r| r.0).collect(),
            regions,
            base: vec![SkipPoint::default(); levels],
            next: vec![None; levels],
            last: None,
        };
        for level in 0..levels {
            reader.load_next_skip(level)?;
        }
        Ok(reader)
    }

    pub fn num_levels(&self) -> usize {
        self.regions.len()
    }

    /// Last point consumed by `skip_to`
    pub fn last_point(&self) -> Option<SkipPoint> {
        self.last
    }

    /// Docid of the next unconsumed point, `BAD_DOCID` once exhausted
    pub fn next_skip_doc(&self, level: usize) -> DocId {
        self.next
            .get(level)
            .copied()
            .flatten()
            .map_or(BAD_DOCID, |(p, _)| p.doc)
    }

    /// Decode the next entry of `level`; false once the level is exhausted
    pub fn load_next_skip(&mut self, level: usize) -> Result<bool> {
        let (_, end) = self.regions[level];
        let cursor = self.cursors[level];
        if cursor >= end {
            self.next[level] = None;
            return Ok(false);
        }

        let data = self.data.as_slice();
        let mut reader = SliceReader::at(&data[..end], cursor);
        let (point, child) = decode_entry(&mut reader, self.base[level], level > 0)?;
        self.cursors[level] = reader.position();
        self.next[level] = Some((point, child));
        Ok(true)
    }

    /// Position `level` just after `point`'s own entry, whose start is
    /// `child`; returns that entry's pointer into the next level down
    fn seek_child(&mut self, level: usize, child: u64, point: SkipPoint) -> Result<u64> {
        let (start, end) = self.regions[level];
        let pos = start
            .checked_add(child as usize)
            .filter(|&p| p < end)
            .ok_or_else(|| IndexError::collapse("skip child pointer out of range"))?;
        let data = self.data.as_slice();
        let mut reader = SliceReader::at(&data[..end], pos);
        let (_, grandchild) = decode_entry(&mut reader, SkipPoint::default(), level > 0)?;
        self.cursors[level] = reader.position();
        self.base[level] = point;
        self.load_next_skip(level)?;
        Ok(grandchild)
    }

    /// Advance to the last point whose docid is `<= target`
    ///
    /// Forward-only: a smaller target than a previous call returns the
    /// point already reached.
    pub fn skip_to(&mut self, target: DocId) -> Result<Option<SkipPoint>> {
        let mut pending: Option<(u64, SkipPoint)> = None;
        for level in (0..self.regions.len()).rev() {
            if let Some((child, point)) = pending.take() {
                let grandchild = self.seek_child(level, child, point)?;
                if level > 0 {
                    pending = Some((grandchild, point));
                }
            }
            while let Some((point, child)) = self.next[level] {
                if point.doc > target {
                    break;
                }
                self.base[level] = point;
                self.last = Some(point);
                if level > 0 {
                    pending = Some((child, point));
                }
                self.load_next_skip(level)?;
            }
        }
        Ok(self.last)
    }

    /// All level-0 points in order
    pub fn points(&self) -> Result<Vec<SkipPoint>> {
        let Some(&(start, end)) = self.regions.first() else {
            return Ok(Vec::new());
        };
        let data = self.data.as_slice();
        let mut reader = SliceReader::at(&data[..end], start);
        let mut base = SkipPoint::default();
        let mut points = Vec::new();
        while reader.position() < end {
            let (point, _) = decode_entry(&mut reader, base, false)?;
            points.push(point);
            base = point;
        }
        Ok(points)
    }
}

fn decode_entry(
    reader: &mut SliceReader<'_>,
    base: SkipPoint,
    has_child: bool,
) -> Result<(SkipPoint, u64)> {
    let overflow = || IndexError::collapse("skip entry overflows");
    let doc = base.doc.checked_add(reader.read_vint()?).ok_or_else(overflow)?;
    let num_skipped = base
        .num_skipped
        .checked_add(reader.read_vint()?)
        .ok_or_else(overflow)?;
    let offset = base.offset.checked_add(reader.read_vlong()?).ok_or_else(overflow)?;
    let pos_offset = base
        .pos_offset
        .checked_add(reader.read_vlong()?)
        .ok_or_else(overflow)?;
    let child = if has_child { reader.read_vlong()? } else { 0 };
    Ok((SkipPoint::new(doc, num_skipped, offset, pos_offset), child))
}

/// Re-emits one barrel's skip points shifted into a merged posting
#[derive(Clone, Copy, Debug, Default)]
pub struct SkipListMerger {
    pub base_doc: DocId,
    pub base_count: u32,
    /// Signed: re-encoding the first posting may shrink the stream
    pub base_offset: i64,
    pub base_pos_offset: u64,
}

impl SkipListMerger {
    pub fn new(base_doc: DocId, base_count: u32, base_offset: i64, base_pos_offset: u64) -> Self {
        Self {
            base_doc,
            base_count,
            base_offset,
            base_pos_offset,
        }
    }

    pub fn rebase(&self, point: SkipPoint) -> Result<SkipPoint> {
        let overflow = || IndexError::collapse("rebased skip point out of range");
        let offset = (point.offset as i64)
            .checked_add(self.base_offset)
            .and_then(|o| u64::try_from(o).ok())
            .ok_or_else(overflow)?;
        Ok(SkipPoint {
            doc: point.doc.checked_add(self.base_doc).ok_or_else(overflow)?,
            num_skipped: point
                .num_skipped
                .checked_add(self.base_count)
                .ok_or_else(overflow)?,
            offset,
            pos_offset: point
                .pos_offset
                .checked_add(self.base_pos_offset)
                .ok_or_else(overflow)?,
        })
    }

    /// Append every point of `source` to `dest`; returns how many were added
    pub fn merge(
        &self,
        source: &SkipListReader,
        dest: &mut SkipListWriter,
        arena: &mut MemoryArena,
    ) -> Result<usize> {
        let points = source.points()?;
        for point in &points {
            dest.add_skip_point(arena, self.rebase(*point)?)?;
        }
        Ok(points.len())
    }
}
