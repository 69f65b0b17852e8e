use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use crate::error::{IndexError, Result};

use super::vint::{self, MAX_VLONG_LEN};

/// Default buffer size of file-backed inputs and outputs
pub const DEFAULT_BUFFER_SIZE: usize = 512 * 1024;

/// How `create_output` treats an existing file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputMode {
    /// Start from an empty file
    Truncate,
    /// Keep existing bytes and position at the end
    Append,
}

/// Shared, immutable view over (part of) a file
#[derive(Clone)]
pub struct FileBytes {
    backing: Arc<dyn AsRef<[u8]> + Send + Sync>,
    range: Range<usize>,
}

impl FileBytes {
    pub fn from_vec(data: Vec<u8>) -> Self {
        let len = data.len();
        Self {
            backing: Arc::new(data),
            range: 0..len,
        }
    }

    pub fn from_backing(backing: Arc<dyn AsRef<[u8]> + Send + Sync>) -> Self {
        let len = (*backing).as_ref().len();
        Self {
            backing,
            range: 0..len,
        }
    }

    pub fn empty() -> Self {
        Self::from_vec(Vec::new())
    }

    pub fn as_slice(&self) -> &[u8] {
        &(*self.backing).as_ref()[self.range.clone()]
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }

    /// Sub-range relative to this view
    pub fn slice(&self, range: Range<usize>) -> Result<FileBytes> {
        if range.start > range.end || range.end > self.len() {
            return Err(IndexError::collapse(format!(
                "slice {}..{} outside of {} bytes",
                range.start,
                range.end,
                self.len()
            )));
        }
        Ok(FileBytes {
            backing: self.backing.clone(),
            range: self.range.start + range.start..self.range.start + range.end,
        })
    }
}

impl fmt::Debug for FileBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileBytes").field("len", &self.len()).finish()
    }
}

/// Random-access input stream over one file
pub trait IndexInput: Send {
    fn name(&self) -> &str;
    fn read_byte(&mut self) -> Result<u8>;
    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()>;
    fn seek(&mut self, pos: u64) -> Result<()>;
    fn file_pointer(&self) -> u64;
    fn length(&self) -> u64;

    fn is_eof(&self) -> bool {
        self.file_pointer() >= self.length()
    }

    fn read_vlong(&mut self) -> Result<u64> {
        let mut result: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_byte()?;
            result |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 != 0 {
                return Ok(result);
            }
            shift += 7;
            if shift > 63 {
                return Err(IndexError::collapse(format!(
                    "variable-byte value too large in '{}'",
                    self.name()
                )));
            }
        }
    }

    fn read_vint(&mut self) -> Result<u32> {
        let value = self.read_vlong()?;
        u32::try_from(value).map_err(|_| {
            IndexError::collapse(format!("vint overflows 32 bits in '{}'", self.name()))
        })
    }

    fn read_u32(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_bytes(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_bytes(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_string(&mut self) -> Result<String> {
        let len = self.read_vint()? as usize;
        let mut buf = vec![0u8; len];
        self.read_bytes(&mut buf)?;
        String::from_utf8(buf).map_err(|_| {
            IndexError::collapse(format!("string is not valid utf-8 in '{}'", self.name()))
        })
    }
}

/// Sequential output stream over one file
pub trait IndexOutput: Send {
    fn name(&self) -> &str;
    fn write_bytes(&mut self, buf: &[u8]) -> Result<()>;
    fn seek(&mut self, pos: u64) -> Result<()>;
    fn file_pointer(&self) -> u64;
    fn length(&self) -> u64;
    fn flush(&mut self) -> Result<()>;
    /// Flush, make durable and publish the file
    fn close(self: Box<Self>) -> Result<()>;

    fn write_byte(&mut self, b: u8) -> Result<()> {
        self.write_bytes(&[b])
    }

    fn write_vlong(&mut self, value: u64) -> Result<()> {
        let mut buf = [0u8; MAX_VLONG_LEN];
        let n = vint::write_vlong(value, &mut buf);
        self.write_bytes(&buf[..n])
    }

    fn write_vint(&mut self, value: u32) -> Result<()> {
        self.write_vlong(value as u64)
    }

    fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    fn write_u64(&mut self, value: u64) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    fn write_string(&mut self, value: &str) -> Result<()> {
        let len = u32::try_from(value.len())
            .map_err(|_| IndexError::InvalidArgument("string too long".to_string()))?;
        self.write_vint(len)?;
        self.write_bytes(value.as_bytes())
    }
}

/// Byte-stream abstraction every persisted structure goes through
pub trait Directory: Send + Sync + fmt::Debug {
    fn file_exists(&self, name: &str) -> bool;
    fn list_files(&self) -> Result<Vec<String>>;
    fn file_length(&self, name: &str) -> Result<u64>;
    fn open_input(&self, name: &str) -> Result<Box<dyn IndexInput>>;
    /// Whole file as a shared byte view
    fn open_bytes(&self, name: &str) -> Result<FileBytes>;
    fn create_output(&self, name: &str, mode: OutputMode) -> Result<Box<dyn IndexOutput>>;
    fn delete_file(&self, name: &str) -> Result<()>;
    fn rename_file(&self, from: &str, to: &str) -> Result<()>;

    /// Make renames and deletions durable
    fn sync_directory(&self) -> Result<()> {
        Ok(())
    }
}

/// IndexInput over a shared byte view
pub struct SliceInput {
    name: String,
    bytes: FileBytes,
    pos: usize,
}

impl SliceInput {
    pub fn new(name: impl Into<String>, bytes: FileBytes) -> Self {
        Self {
            name: name.into(),
            bytes,
            pos: 0,
        }
    }
}

impl IndexInput for SliceInput {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_byte(&mut self) -> Result<u8> {
        let b = *self.bytes.as_slice().get(self.pos).ok_or_else(|| {
            IndexError::file_io(
                "read",
                self.name.clone(),
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "read past end"),
            )
        })?;
        self.pos += 1;
        Ok(b)
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        let end = self.pos + buf.len();
        let data = self.bytes.as_slice();
        if end > data.len() {
            return Err(IndexError::file_io(
                "read",
                self.name.clone(),
                std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "read past end"),
            ));
        }
        buf.copy_from_slice(&data[self.pos..end]);
        self.pos = end;
        Ok(())
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        if pos > self.bytes.len() as u64 {
            return Err(IndexError::file_io(
                "seek",
                self.name.clone(),
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "seek past end"),
            ));
        }
        self.pos = pos as usize;
        Ok(())
    }

    fn file_pointer(&self) -> u64 {
        self.pos as u64
    }

    fn length(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Delete a file, treating "already gone" as success
pub fn delete_if_exists(dir: &dyn Directory, name: &str) -> Result<()> {
    match dir.delete_file(name) {
        Err(e) if e.is_not_found() => Ok(()),
        other => other,
    }
}
