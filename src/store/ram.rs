use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{IndexError, Result};

use super::directory::{Directory, FileBytes, IndexInput, IndexOutput, OutputMode, SliceInput};

type FileTable = Arc<RwLock<HashMap<String, Arc<Vec<u8>>>>>;

/// In-process directory; files live as shared byte vectors
#[derive(Debug, Default, Clone)]
pub struct RamDirectory {
    files: FileTable,
}

impl RamDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total bytes held
    pub fn size_bytes(&self) -> u64 {
        self.files.read().values().map(|f| f.len() as u64).sum()
    }

    fn missing(op: &'static str, name: &str) -> IndexError {
        IndexError::file_io(
            op,
            name,
            io::Error::new(io::ErrorKind::NotFound, "no such file"),
        )
    }
}

impl Directory for RamDirectory {
    fn file_exists(&self, name: &str) -> bool {
        self.files.read().contains_key(name)
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.files.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn file_length(&self, name: &str) -> Result<u64> {
        self.files
            .read()
            .get(name)
            .map(|f| f.len() as u64)
            .ok_or_else(|| Self::missing("stat", name))
    }

    fn open_input(&self, name: &str) -> Result<Box<dyn IndexInput>> {
        Ok(Box::new(SliceInput::new(name, self.open_bytes(name)?)))
    }

    fn open_bytes(&self, name: &str) -> Result<FileBytes> {
        let data = self
            .files
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Self::missing("open", name))?;
        Ok(FileBytes::from_backing(data))
    }

    fn create_output(&self, name: &str, mode: OutputMode) -> Result<Box<dyn IndexOutput>> {
        let buffer = match mode {
            OutputMode::Truncate => Vec::new(),
            OutputMode::Append => self
                .files
                .read()
                .get(name)
                .map(|f| f.as_ref().clone())
                .unwrap_or_default(),
        };
        let pos = buffer.len() as u64;
        let output = RamIndexOutput {
            name: name.to_string(),
            files: self.files.clone(),
            buffer,
            pos,
        };
        output.publish();
        Ok(Box::new(output))
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.files
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Self::missing("delete", name))
    }

    fn rename_file(&self, from: &str, to: &str) -> Result<()> {
        let mut files = self.files.write();
        let data = files.remove(from).ok_or_else(|| Self::missing("rename", from))?;
        files.insert(to.to_string(), data);
        Ok(())
    }
}

/// Output buffered in memory, published to the directory on flush/close
pub struct RamIndexOutput {
    name: String,
    files: FileTable,
    buffer: Vec<u8>,
    pos: u64,
}

impl RamIndexOutput {
    fn publish(&self) {
        self.files
            .write()
            .insert(self.name.clone(), Arc::new(self.buffer.clone()));
    }
}

impl IndexOutput for RamIndexOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        let start = self.pos as usize;
        let end = start + buf.len();
        if end > self.buffer.len() {
            self.buffer
                .try_reserve(end - self.buffer.len())
                .map_err(|_| IndexError::OutOfMemory(format!("growing '{}'", self.name)))?;
            self.buffer.resize(end, 0);
        }
        self.buffer[start..end].copy_from_slice(buf);
        self.pos = end as u64;
        Ok(())
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        if pos as usize > self.buffer.len() {
            self.buffer.resize(pos as usize, 0);
        }
        self.pos = pos;
        Ok(())
    }

    fn file_pointer(&self) -> u64 {
        self.pos
    }

    fn length(&self) -> u64 {
        self.buffer.len() as u64
    }

    fn flush(&mut self) -> Result<()> {
        self.publish();
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.publish();
        Ok(())
    }
}
