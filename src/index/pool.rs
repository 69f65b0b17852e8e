use crate::error::{IndexError, Result};
use crate::store::vint::{self, MAX_VLONG_LEN};
use crate::store::IndexOutput;

use super::arena::{Chunk, MemoryArena};

const MIN_CHUNK_LOG: u32 = 5;
const MAX_CHUNK_LOG: u32 = 15;

/// Append-only VInt/VLong byte pool living in a `MemoryArena`
///
/// Chunk sizes double from 32 bytes up to 32 KiB. A value is never split
/// across chunks; every chunk but the tail is truncated to the bytes
/// actually written.
#[derive(Debug, Default, Clone)]
pub struct VariantDataPool {
    chunks: Vec<Chunk>,
    tail_used: usize,
    length: u64,
    next_log_size: u32,
}

impl VariantDataPool {
    pub fn new() -> Self {
        Self {
            next_log_size: MIN_CHUNK_LOG,
            ..Default::default()
        }
    }

    /// Logical number of bytes written
    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn add_vint(&mut self, arena: &mut MemoryArena, value: u32) -> Result<()> {
        self.add_vlong(arena, value as u64)
    }

    pub fn add_vlong(&mut self, arena: &mut MemoryArena, value: u64) -> Result<()> {
        let mut buf = [0u8; MAX_VLONG_LEN];
        let n = vint::write_vlong(value, &mut buf);
        self.reserve(arena, n)?;
        let Some(&tail) = self.chunks.last() else {
            return Err(IndexError::OutOfMemory("pool has no tail chunk".to_string()));
        };
        arena.bytes_mut(tail)[self.tail_used..self.tail_used + n].copy_from_slice(&buf[..n]);
        self.tail_used += n;
        self.length += n as u64;
        Ok(())
    }

    fn tail_remaining(&self) -> usize {
        self.chunks
            .last()
            .map_or(0, |c| c.len() - self.tail_used)
    }

    fn reserve(&mut self, arena: &mut MemoryArena, needed: usize) -> Result<()> {
        if self.tail_remaining() >= needed {
            return Ok(());
        }
        self.trunc_tail_chunk();

        let mut log = self.next_log_size.max(MIN_CHUNK_LOG);
        while (1usize << log) < needed {
            log += 1;
        }
        let chunk = match arena.get_mem_by_log_size(log) {
            Some(chunk) => chunk,
            None => {
                arena.grow(1usize << log)?;
                arena.get_mem_by_log_size(log).ok_or_else(|| {
                    IndexError::OutOfMemory(format!("no {}-byte chunk after grow", 1usize << log))
                })?
            }
        };
        self.chunks.push(chunk);
        self.tail_used = 0;
        self.next_log_size = (log + 1).min(MAX_CHUNK_LOG);
        Ok(())
    }

    /// Shrink the tail chunk to its written length
    pub fn trunc_tail_chunk(&mut self) {
        if let Some(tail) = self.chunks.last_mut() {
            *tail = tail.truncated(self.tail_used);
        }
    }

    /// The written bytes in order, one slice per chunk
    pub fn slices<'a>(&'a self, arena: &'a MemoryArena) -> impl Iterator<Item = &'a [u8]> + 'a {
        let last = self.chunks.len().saturating_sub(1);
        self.chunks.iter().enumerate().map(move |(i, &chunk)| {
            let bytes = arena.bytes(chunk);
            if i == last {
                &bytes[..self.tail_used.min(bytes.len())]
            } else {
                bytes
            }
        })
    }

    pub fn write_to(&self, arena: &MemoryArena, out: &mut dyn IndexOutput) -> Result<()> {
        for bytes in self.slices(arena) {
            out.write_bytes(bytes)?;
        }
        Ok(())
    }

    pub fn to_vec(&self, arena: &MemoryArena) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.length as usize);
        for bytes in self.slices(arena) {
            out.extend_from_slice(bytes);
        }
        out
    }

    /// Forget all chunks; call after the arena was flushed
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::vint::SliceReader;

    #[test]
    fn test_values_span_many_chunks() {
        let mut arena = MemoryArena::new(1 << 16, 1 << 16).unwrap();
        let mut pool = VariantDataPool::new();
        for i in 0..5_000u32 {
            pool.add_vint(&mut arena, i * 31).unwrap();
        }
        pool.add_vlong(&mut arena, u64::MAX).unwrap();

        let bytes = pool.to_vec(&arena);
        assert_eq!(bytes.len() as u64, pool.length());
        let mut reader = SliceReader::new(&bytes);
        for i in 0..5_000u32 {
            assert_eq!(reader.read_vint().unwrap(), i * 31);
        }
        assert_eq!(reader.read_vlong().unwrap(), u64::MAX);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_write_to_matches_slices() {
        use crate::store::{Directory, OutputMode, RamDirectory};

        let mut arena = MemoryArena::new(64, 64).unwrap();
        let mut pool = VariantDataPool::new();
        for i in 0..200u32 {
            pool.add_vint(&mut arena, i << 9).unwrap();
        }
        assert!(pool.slices(&arena).count() > 1);

        let dir = RamDirectory::new();
        let mut out = dir.create_output("pool", OutputMode::Truncate).unwrap();
        pool.write_to(&arena, out.as_mut()).unwrap();
        out.close().unwrap();
        let written = dir.open_bytes("pool").unwrap();
        assert_eq!(written.as_slice(), pool.to_vec(&arena).as_slice());
        assert_eq!(written.len() as u64, pool.length());
    }

    #[test]
    fn test_grows_arena_when_exhausted() {
        let mut arena = MemoryArena::new(32, 64).unwrap();
        let mut pool = VariantDataPool::new();
        for i in 0..100u32 {
            pool.add_vint(&mut arena, i).unwrap();
        }
        assert!(arena.grow_count() > 0);
        assert_eq!(pool.length(), 100);
        assert_eq!(pool.to_vec(&arena), (0..100u8).map(|b| b | 0x80).collect::<Vec<_>>());
    }

    #[test]
    fn test_trunc_tail_chunk() {
        let mut arena = MemoryArena::new(1024, 1024).unwrap();
        let mut pool = VariantDataPool::new();
        pool.add_vint(&mut arena, 300).unwrap();
        pool.trunc_tail_chunk();
        assert_eq!(pool.to_vec(&arena).len(), 2);

        // a truncated tail forces the next value into a fresh chunk
        pool.add_vint(&mut arena, 1).unwrap();
        assert_eq!(pool.to_vec(&arena), vec![0x2C, 0x82, 0x81]);
        assert_eq!(pool.length(), 3);
    }

    #[test]
    fn test_reset_after_flush() {
        let mut arena = MemoryArena::new(256, 256).unwrap();
        let mut pool = VariantDataPool::new();
        pool.add_vint(&mut arena, 9).unwrap();
        arena.flush_mem();
        pool.reset();
        assert!(pool.is_empty());
        pool.add_vint(&mut arena, 10).unwrap();
        assert_eq!(pool.to_vec(&arena), vec![0x8A]);
    }
}
