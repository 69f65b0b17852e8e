use std::path::PathBuf;
use std::sync::Arc;

use memmap2::Mmap;

use crate::error::{IoResultExt, Result};

use super::directory::{Directory, FileBytes, IndexInput, IndexOutput, OutputMode, SliceInput};
use super::fs::FsDirectory;

struct MappedFile(Mmap);

impl AsRef<[u8]> for MappedFile {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Filesystem directory that serves reads from memory maps
#[derive(Debug)]
pub struct MmapDirectory {
    fs: FsDirectory,
}

impl MmapDirectory {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            fs: FsDirectory::open(root)?,
        })
    }

    pub fn with_buffer_size(root: impl Into<PathBuf>, buffer_size: usize) -> Result<Self> {
        Ok(Self {
            fs: FsDirectory::with_buffer_size(root, buffer_size)?,
        })
    }
}

impl Directory for MmapDirectory {
    fn file_exists(&self, name: &str) -> bool {
        self.fs.file_exists(name)
    }

    fn list_files(&self) -> Result<Vec<String>> {
        self.fs.list_files()
    }

    fn file_length(&self, name: &str) -> Result<u64> {
        self.fs.file_length(name)
    }

    fn open_input(&self, name: &str) -> Result<Box<dyn IndexInput>> {
        Ok(Box::new(SliceInput::new(name, self.open_bytes(name)?)))
    }

    fn open_bytes(&self, name: &str) -> Result<FileBytes> {
        let file = self.fs.open_file(name)?;
        let len = file.metadata().io_context("stat", name)?.len();
        if len == 0 {
            return Ok(FileBytes::empty());
        }
        // SAFETY: barrel files are immutable once published; writers only
        // ever create new files.
        let mmap = unsafe { Mmap::map(&file) }.io_context("mmap", name)?;
        Ok(FileBytes::from_backing(Arc::new(MappedFile(mmap))))
    }

    fn create_output(&self, name: &str, mode: OutputMode) -> Result<Box<dyn IndexOutput>> {
        self.fs.create_output(name, mode)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.fs.delete_file(name)
    }

    fn rename_file(&self, from: &str, to: &str) -> Result<()> {
        self.fs.rename_file(from, to)
    }

    fn sync_directory(&self) -> Result<()> {
        self.fs.sync_directory()
    }
}
