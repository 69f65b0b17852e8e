//! Write-ahead log of analyzed documents
//!
//! Record format:
//! - u32 length (little endian)
//! - u32 crc32 of payload
//! - bincode-encoded `IndexerDocument`

use std::sync::Arc;

use crc32fast::Hasher;
use tracing::{info, warn};

use crate::error::{IndexError, Result};
use crate::store::vint::SliceReader;
use crate::store::{Directory, IndexOutput, OutputMode};

use super::types::IndexerDocument;

pub const BINLOG_FILE: &str = "binlog";
pub const BINLOG_TMP_FILE: &str = "binlog.tmp";

const HEADER_LEN: usize = 8;

/// Documents recovered from a binlog
#[derive(Debug, Default)]
pub struct BinlogReplay {
    pub documents: Vec<IndexerDocument>,
    /// Unreadable records at the tail, left by an interrupted write
    pub torn_records: usize,
}

pub struct Binlog {
    directory: Arc<dyn Directory>,
    output: Option<Box<dyn IndexOutput>>,
    records: u64,
}

impl Binlog {
    /// Open for appending after any existing records
    pub fn open(directory: Arc<dyn Directory>) -> Result<Self> {
        let output = directory.create_output(BINLOG_FILE, OutputMode::Append)?;
        Ok(Self {
            directory,
            output: Some(output),
            records: 0,
        })
    }

    /// Read every intact record of the log in `directory`
    pub fn replay(directory: &dyn Directory) -> Result<BinlogReplay> {
        let mut replay = BinlogReplay::default();
        if !directory.file_exists(BINLOG_FILE) {
            return Ok(replay);
        }
        let bytes = directory.open_bytes(BINLOG_FILE)?;
        let mut reader = SliceReader::new(bytes.as_slice());
        while !reader.is_empty() {
            match read_record(&mut reader) {
                Some(doc) => replay.documents.push(doc),
                None => {
                    replay.torn_records = 1;
                    warn!(
                        offset = reader.position(),
                        "torn binlog record, ignoring the rest of the log"
                    );
                    break;
                }
            }
        }
        info!(
            documents = replay.documents.len(),
            torn = replay.torn_records,
            "binlog replayed"
        );
        Ok(replay)
    }

    /// Records appended since open or the last reset
    pub fn len(&self) -> u64 {
        self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records == 0
    }

    pub fn append(&mut self, doc: &IndexerDocument) -> Result<()> {
        let output = self
            .output
            .as_mut()
            .ok_or_else(|| IndexError::InvalidArgument("binlog is closed".to_string()))?;
        write_record(output.as_mut(), doc)?;
        output.flush()?;
        self.records += 1;
        Ok(())
    }

    /// Replace the log with exactly `docs` and open it for appending
    ///
    /// The new log is written aside and renamed over the old one, so a crash
    /// leaves one of the two intact.
    pub fn rewrite(directory: Arc<dyn Directory>, docs: &[IndexerDocument]) -> Result<Self> {
        let mut out = directory.create_output(BINLOG_TMP_FILE, OutputMode::Truncate)?;
        for doc in docs {
            write_record(out.as_mut(), doc)?;
        }
        out.close()?;
        directory.rename_file(BINLOG_TMP_FILE, BINLOG_FILE)?;
        directory.sync_directory()?;

        let mut binlog = Self::open(directory)?;
        binlog.records = docs.len() as u64;
        Ok(binlog)
    }

    /// Drop every record; called once they are durable in a barrel
    pub fn reset(&mut self) -> Result<()> {
        if let Some(output) = self.output.take() {
            output.close()?;
        }
        self.directory
            .create_output(BINLOG_FILE, OutputMode::Truncate)?
            .close()?;
        self.output = Some(
            self.directory
                .create_output(BINLOG_FILE, OutputMode::Append)?,
        );
        self.records = 0;
        Ok(())
    }

    pub fn close(mut self) -> Result<()> {
        match self.output.take() {
            Some(output) => output.close(),
            None => Ok(()),
        }
    }
}

fn write_record(output: &mut dyn IndexOutput, doc: &IndexerDocument) -> Result<()> {
    let payload = bincode::serialize(doc)?;
    let mut hasher = Hasher::new();
    hasher.update(&payload);
    output.write_u32(payload.len() as u32)?;
    output.write_u32(hasher.finalize())?;
    output.write_bytes(&payload)
}

fn read_record(reader: &mut SliceReader<'_>) -> Option<IndexerDocument> {
    if reader.remaining() < HEADER_LEN {
        return None;
    }
    let len = reader.read_u32().ok()? as usize;
    let crc32 = reader.read_u32().ok()?;
    let payload = reader.read_slice(len).ok()?;
    let mut hasher = Hasher::new();
    hasher.update(payload);
    if hasher.finalize() != crc32 {
        return None;
    }
    bincode::deserialize(payload).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::types::la_input;
    use crate::store::RamDirectory;

    fn doc(id: u32) -> IndexerDocument {
        IndexerDocument::new(id).with_field("body", la_input(&[id, id + 1]))
    }

    #[test]
    fn test_append_and_replay() {
        let dir: Arc<dyn Directory> = Arc::new(RamDirectory::new());
        let mut log = Binlog::open(dir.clone()).unwrap();
        for id in 0..3 {
            log.append(&doc(id)).unwrap();
        }
        assert_eq!(log.len(), 3);
        log.close().unwrap();

        // reopening appends after the existing records
        let mut log = Binlog::open(dir.clone()).unwrap();
        log.append(&doc(3)).unwrap();
        log.close().unwrap();

        let replay = Binlog::replay(dir.as_ref()).unwrap();
        assert_eq!(replay.torn_records, 0);
        assert_eq!(replay.documents, (0..4).map(doc).collect::<Vec<_>>());
    }

    #[test]
    fn test_torn_tail_is_tolerated() {
        let dir: Arc<dyn Directory> = Arc::new(RamDirectory::new());
        let mut log = Binlog::open(dir.clone()).unwrap();
        log.append(&doc(0)).unwrap();
        log.append(&doc(1)).unwrap();
        log.close().unwrap();

        let full = dir.open_bytes(BINLOG_FILE).unwrap();
        let mut out = dir.create_output(BINLOG_FILE, OutputMode::Truncate).unwrap();
        out.write_bytes(&full.as_slice()[..full.len() - 3]).unwrap();
        out.close().unwrap();

        let replay = Binlog::replay(dir.as_ref()).unwrap();
        assert_eq!(replay.documents, vec![doc(0)]);
        assert_eq!(replay.torn_records, 1);
    }

    #[test]
    fn test_checksum_mismatch_stops_replay() {
        let dir: Arc<dyn Directory> = Arc::new(RamDirectory::new());
        let mut log = Binlog::open(dir.clone()).unwrap();
        log.append(&doc(0)).unwrap();
        log.close().unwrap();

        let mut data = dir.open_bytes(BINLOG_FILE).unwrap().as_slice().to_vec();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        let mut out = dir.create_output(BINLOG_FILE, OutputMode::Truncate).unwrap();
        out.write_bytes(&data).unwrap();
        out.close().unwrap();

        let replay = Binlog::replay(dir.as_ref()).unwrap();
        assert!(replay.documents.is_empty());
        assert_eq!(replay.torn_records, 1);
    }

    #[test]
    fn test_rewrite_drops_torn_tail_and_keeps_appending() {
        let dir: Arc<dyn Directory> = Arc::new(RamDirectory::new());
        let mut log = Binlog::open(dir.clone()).unwrap();
        log.append(&doc(0)).unwrap();
        log.append(&doc(1)).unwrap();
        log.close().unwrap();
        let mut out = dir.create_output(BINLOG_FILE, OutputMode::Append).unwrap();
        out.write_bytes(&[0xFF; 5]).unwrap();
        out.close().unwrap();

        let replay = Binlog::replay(dir.as_ref()).unwrap();
        assert_eq!(replay.torn_records, 1);
        let mut log = Binlog::rewrite(dir.clone(), &replay.documents[1..]).unwrap();
        assert_eq!(log.len(), 1);
        log.append(&doc(2)).unwrap();
        log.close().unwrap();

        assert!(!dir.file_exists(BINLOG_TMP_FILE));
        let replay = Binlog::replay(dir.as_ref()).unwrap();
        assert_eq!(replay.torn_records, 0);
        assert_eq!(replay.documents, vec![doc(1), doc(2)]);
    }

    #[test]
    fn test_reset_truncates() {
        let dir: Arc<dyn Directory> = Arc::new(RamDirectory::new());
        let mut log = Binlog::open(dir.clone()).unwrap();
        log.append(&doc(0)).unwrap();
        log.reset().unwrap();
        assert!(log.is_empty());
        log.append(&doc(9)).unwrap();
        log.close().unwrap();

        let replay = Binlog::replay(dir.as_ref()).unwrap();
        assert_eq!(replay.documents, vec![doc(9)]);
    }
}
