//! Bump allocator backing the in-memory barrel
//!
//! The arena hands out chunks as handles (`Chunk`) rather than pointers.
//! Allocation tries the primary block first and then every chained
//! grow-block; when none has room it returns `None` and the caller decides
//! whether to `grow`. `flush_mem` rewinds the primary block and drops the
//! chain.

use crate::error::{IndexError, Result};

/// Handle to a chunk of arena memory
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Chunk {
    block: u32,
    offset: u32,
    len: u32,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Same chunk, shortened to `len` bytes
    pub fn truncated(self, len: usize) -> Chunk {
        Chunk {
            len: (len as u32).min(self.len),
            ..self
        }
    }
}

struct Block {
    data: Vec<u8>,
    used: usize,
}

impl Block {
    fn allocate(size: usize) -> Result<Self> {
        let mut data = Vec::new();
        data.try_reserve_exact(size)
            .map_err(|_| IndexError::OutOfMemory(format!("arena block of {} bytes", size)))?;
        data.resize(size, 0);
        Ok(Self { data, used: 0 })
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.used
    }
}

pub struct MemoryArena {
    blocks: Vec<Block>,
    grow_size: usize,
}

impl MemoryArena {
    /// Arena with one primary block of `size` bytes
    pub fn new(size: usize, grow_size: usize) -> Result<Self> {
        if size > u32::MAX as usize || grow_size > u32::MAX as usize {
            return Err(IndexError::InvalidArgument(
                "arena blocks are limited to 4 GiB".to_string(),
            ));
        }
        Ok(Self {
            blocks: vec![Block::allocate(size)?],
            grow_size,
        })
    }

    /// Zeroed chunk of `2^log2_size` bytes
    pub fn get_mem_by_log_size(&mut self, log2_size: u32) -> Option<Chunk> {
        if log2_size >= 32 {
            return None;
        }
        self.get_mem_by_real_size(1usize << log2_size)
    }

    /// Zeroed chunk of exactly `size` bytes
    pub fn get_mem_by_real_size(&mut self, size: usize) -> Option<Chunk> {
        let (index, block) = self
            .blocks
            .iter_mut()
            .enumerate()
            .find(|(_, b)| b.remaining() >= size)?;
        let offset = block.used;
        block.used += size;
        block.data[offset..offset + size].fill(0);
        Some(Chunk {
            block: index as u32,
            offset: offset as u32,
            len: size as u32,
        })
    }

    /// Chain a new block of at least `size` bytes
    pub fn grow(&mut self, size: usize) -> Result<()> {
        let size = size.max(self.grow_size);
        if size > u32::MAX as usize {
            return Err(IndexError::OutOfMemory(format!(
                "arena grow of {} bytes",
                size
            )));
        }
        self.blocks.push(Block::allocate(size)?);
        Ok(())
    }

    /// Rewind to an empty arena, dropping grow-blocks
    pub fn flush_mem(&mut self) {
        self.blocks.truncate(1);
        if let Some(primary) = self.blocks.first_mut() {
            primary.used = 0;
        }
    }

    pub fn bytes(&self, chunk: Chunk) -> &[u8] {
        let block = &self.blocks[chunk.block as usize];
        let start = chunk.offset as usize;
        &block.data[start..start + chunk.len()]
    }

    pub fn bytes_mut(&mut self, chunk: Chunk) -> &mut [u8] {
        let block = &mut self.blocks[chunk.block as usize];
        let start = chunk.offset as usize;
        &mut block.data[start..start + chunk.len as usize]
    }

    pub fn grow_size(&self) -> usize {
        self.grow_size
    }

    /// Bytes handed out so far
    pub fn used(&self) -> usize {
        self.blocks.iter().map(|b| b.used).sum()
    }

    pub fn capacity(&self) -> usize {
        self.blocks.iter().map(|b| b.data.len()).sum()
    }

    /// Number of chained grow-blocks
    pub fn grow_count(&self) -> usize {
        self.blocks.len() - 1
    }
}
