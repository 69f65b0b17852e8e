//! Per-document field lengths (`doclen.map`)
//!
//! A flat array of little-endian `u16`, one row of `num_slots` values per
//! docid. Rows are written once per document; gaps left by missing docids
//! read back as zero.

use crate::error::Result;
use crate::store::{Directory, FileBytes, IndexOutput, OutputMode};

use super::types::DocId;

pub const DOC_LENGTH_FILE: &str = "doclen.map";

pub struct DocLengthWriter {
    output: Box<dyn IndexOutput>,
    pending: Vec<u16>,
}

impl DocLengthWriter {
    /// Open `doclen.map` for appending, keeping existing rows
    pub fn open(dir: &dyn Directory, num_slots: usize) -> Result<Self> {
        Ok(Self {
            output: dir.create_output(DOC_LENGTH_FILE, OutputMode::Append)?,
            pending: vec![0; num_slots],
        })
    }

    pub fn num_slots(&self) -> usize {
        self.pending.len()
    }

    /// Row width in bytes
    pub fn width(&self) -> u64 {
        self.pending.len() as u64 * 2
    }

    /// Record the length of one field of the current document
    pub fn fill(&mut self, slot: usize, length: usize) {
        if let Some(value) = self.pending.get_mut(slot) {
            *value = length.min(u16::MAX as usize) as u16;
        }
    }

    /// Drop the current row without writing it
    pub fn discard_row(&mut self) {
        self.pending.iter_mut().for_each(|value| *value = 0);
    }

    /// Write the current row at `doc_id` and start a new one
    pub fn add(&mut self, doc_id: DocId) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let target = doc_id as u64 * self.width();
        let end = self.output.length();
        if target > end {
            if self.output.file_pointer() != end {
                self.output.seek(end)?;
            }
            let gap = vec![0u8; (target - end) as usize];
            self.output.write_bytes(&gap)?;
        } else if self.output.file_pointer() != target {
            self.output.seek(target)?;
        }

        let mut row = Vec::with_capacity(self.pending.len() * 2);
        for value in &mut self.pending {
            row.extend_from_slice(&value.to_le_bytes());
            *value = 0;
        }
        self.output.write_bytes(&row)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.output.flush()
    }

    pub fn close(self) -> Result<()> {
        self.output.close()
    }
}

/// Read-only view over `doclen.map`
#[derive(Clone, Debug)]
pub struct DocLengthReader {
    bytes: FileBytes,
    num_slots: usize,
}

impl DocLengthReader {
    pub fn open(dir: &dyn Directory, num_slots: usize) -> Result<Self> {
        let bytes = if dir.file_exists(DOC_LENGTH_FILE) {
            dir.open_bytes(DOC_LENGTH_FILE)?
        } else {
            FileBytes::empty()
        };
        Ok(Self { bytes, num_slots })
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    /// Number of rows present on disk
    pub fn num_docs(&self) -> u64 {
        if self.num_slots == 0 {
            return 0;
        }
        self.bytes.len() as u64 / (self.num_slots as u64 * 2)
    }

    pub fn doc_length(&self, doc_id: DocId, slot: usize) -> u16 {
        if slot >= self.num_slots {
            return 0;
        }
        let at = (doc_id as usize * self.num_slots + slot) * 2;
        match self.bytes.as_slice().get(at..at + 2) {
            Some(b) => u16::from_le_bytes([b[0], b[1]]),
            None => 0,
        }
    }

    /// Sum of one slot over all rows
    pub fn total_length(&self, slot: usize) -> u64 {
        (0..self.num_docs())
            .map(|doc| self.doc_length(doc as DocId, slot) as u64)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RamDirectory;

    #[test]
    fn test_rows_and_gaps() {
        let dir = RamDirectory::new();
        let mut writer = DocLengthWriter::open(&dir, 2).unwrap();
        writer.fill(0, 5);
        writer.fill(1, 7);
        writer.add(0).unwrap();
        writer.fill(1, 100_000);
        writer.add(3).unwrap();
        writer.flush().unwrap();

        let reader = DocLengthReader::open(&dir, 2).unwrap();
        assert_eq!(reader.num_docs(), 4);
        assert_eq!(reader.doc_length(0, 0), 5);
        assert_eq!(reader.doc_length(0, 1), 7);
        assert_eq!(reader.doc_length(1, 1), 0);
        assert_eq!(reader.doc_length(3, 0), 0);
        assert_eq!(reader.doc_length(3, 1), u16::MAX);
        assert_eq!(reader.doc_length(9, 0), 0);
        assert_eq!(reader.doc_length(0, 2), 0);
        assert_eq!(reader.total_length(0), 5);
    }

    #[test]
    fn test_reopen_appends_and_overwrites() {
        let dir = RamDirectory::new();
        let mut writer = DocLengthWriter::open(&dir, 1).unwrap();
        writer.fill(0, 1);
        writer.add(0).unwrap();
        writer.fill(0, 2);
        writer.add(1).unwrap();
        writer.close().unwrap();

        let mut writer = DocLengthWriter::open(&dir, 1).unwrap();
        // replaying doc 1 rewrites its row in place
        writer.fill(0, 9);
        writer.add(1).unwrap();
        writer.fill(0, 4);
        writer.add(2).unwrap();
        writer.close().unwrap();

        let reader = DocLengthReader::open(&dir, 1).unwrap();
        assert_eq!(reader.num_docs(), 3);
        assert_eq!(
            (0..3).map(|d| reader.doc_length(d, 0)).collect::<Vec<_>>(),
            vec![1, 9, 4]
        );
    }

    #[test]
    fn test_missing_file_reads_zero() {
        let dir = RamDirectory::new();
        let reader = DocLengthReader::open(&dir, 3).unwrap();
        assert_eq!(reader.num_docs(), 0);
        assert_eq!(reader.doc_length(0, 0), 0);
    }
}
