use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{IoResultExt, Result};

use super::directory::{
    Directory, FileBytes, IndexInput, IndexOutput, OutputMode, DEFAULT_BUFFER_SIZE,
};

/// Directory over a local filesystem path
#[derive(Debug)]
pub struct FsDirectory {
    root: PathBuf,
    buffer_size: usize,
}

impl FsDirectory {
    /// Open (creating if needed) a directory
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        Self::with_buffer_size(root, DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(root: impl Into<PathBuf>, buffer_size: usize) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).io_context("create_dir", &root.display().to_string())?;
        Ok(Self {
            root,
            buffer_size: buffer_size.max(1),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub(crate) fn open_file(&self, name: &str) -> Result<File> {
        File::open(self.path_of(name)).io_context("open", name)
    }
}

impl Directory for FsDirectory {
    fn file_exists(&self, name: &str) -> bool {
        self.path_of(name).is_file()
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root).io_context("list", &self.root.display().to_string())? {
            let entry = entry.io_context("list", &self.root.display().to_string())?;
            if entry.path().is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn file_length(&self, name: &str) -> Result<u64> {
        Ok(fs::metadata(self.path_of(name)).io_context("stat", name)?.len())
    }

    fn open_input(&self, name: &str) -> Result<Box<dyn IndexInput>> {
        let file = self.open_file(name)?;
        let length = file.metadata().io_context("stat", name)?.len();
        Ok(Box::new(FsIndexInput {
            name: name.to_string(),
            reader: BufReader::with_capacity(self.buffer_size, file),
            pos: 0,
            length,
        }))
    }

    fn open_bytes(&self, name: &str) -> Result<FileBytes> {
        let data = fs::read(self.path_of(name)).io_context("read", name)?;
        Ok(FileBytes::from_vec(data))
    }

    fn create_output(&self, name: &str, mode: OutputMode) -> Result<Box<dyn IndexOutput>> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(mode == OutputMode::Truncate)
            .open(self.path_of(name))
            .io_context("create", name)?;
        let length = file.metadata().io_context("stat", name)?.len();
        let mut writer = BufWriter::with_capacity(self.buffer_size, file);
        if mode == OutputMode::Append {
            writer.seek(SeekFrom::End(0)).io_context("seek", name)?;
        }
        Ok(Box::new(FsIndexOutput {
            name: name.to_string(),
            writer,
            pos: length,
            length,
        }))
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        fs::remove_file(self.path_of(name)).io_context("delete", name)
    }

    fn rename_file(&self, from: &str, to: &str) -> Result<()> {
        fs::rename(self.path_of(from), self.path_of(to)).io_context("rename", from)
    }

    fn sync_directory(&self) -> Result<()> {
        let dir = File::open(&self.root).io_context("open", &self.root.display().to_string())?;
        dir.sync_all().io_context("sync", &self.root.display().to_string())
    }
}

/// Buffered file input
pub struct FsIndexInput {
    name: String,
    reader: BufReader<File>,
    pos: u64,
    length: u64,
}

impl IndexInput for FsIndexInput {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_byte(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_bytes(&mut buf)?;
        Ok(buf[0])
    }

    fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        self.reader.read_exact(buf).io_context("read", &self.name)?;
        self.pos += buf.len() as u64;
        Ok(())
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        let delta = pos as i64 - self.pos as i64;
        self.reader.seek_relative(delta).io_context("seek", &self.name)?;
        self.pos = pos;
        Ok(())
    }

    fn file_pointer(&self) -> u64 {
        self.pos
    }

    fn length(&self) -> u64 {
        self.length
    }
}

/// Buffered file output
pub struct FsIndexOutput {
    name: String,
    writer: BufWriter<File>,
    pos: u64,
    length: u64,
}

impl IndexOutput for FsIndexOutput {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_bytes(&mut self, buf: &[u8]) -> Result<()> {
        self.writer.write_all(buf).io_context("write", &self.name)?;
        self.pos += buf.len() as u64;
        self.length = self.length.max(self.pos);
        Ok(())
    }

    fn seek(&mut self, pos: u64) -> Result<()> {
        self.writer.seek(SeekFrom::Start(pos)).io_context("seek", &self.name)?;
        self.pos = pos;
        self.length = self.length.max(pos);
        Ok(())
    }

    fn file_pointer(&self) -> u64 {
        self.pos
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush().io_context("flush", &self.name)
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.writer.flush().io_context("flush", &self.name)?;
        self.writer.get_ref().sync_all().io_context("sync", &self.name)
    }
}
