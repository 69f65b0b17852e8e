//! Forward index: docid -> analyzed tokens of the opted-in fields
//!
//! - `<barrel>.fdi`: fixed 12-byte entries `(doc u32 LE, offset u64 LE)`,
//!   ascending by doc
//! - `<barrel>.fdd`: per document `VInt fieldCount`, then per field
//!   `string name, VInt n, (termId VInt, offset VInt)*`

use roaring::RoaringBitmap;

use crate::error::{IndexError, Result};
use crate::store::vint::{self, SliceReader};
use crate::store::{Directory, FileBytes, IndexOutput};

use super::types::{DocId, LaInput, Token};

const ENTRY_LEN: usize = 12;

/// One document's forward entry
pub type ForwardDocument = Vec<(String, LaInput)>;

pub fn fdi_file(barrel: &str) -> String {
    format!("{}.fdi", barrel)
}

pub fn fdd_file(barrel: &str) -> String {
    format!("{}.fdd", barrel)
}

#[derive(Clone, Debug, Default)]
pub struct ForwardIndexWriter {
    entries: Vec<(DocId, u64)>,
    data: Vec<u8>,
}

impl ForwardIndexWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn num_docs(&self) -> usize {
        self.entries.len()
    }

    pub fn add_document(&mut self, doc_id: DocId, fields: &[(&str, &[Token])]) -> Result<()> {
        if let Some(&(last, _)) = self.entries.last() {
            if doc_id <= last {
                return Err(IndexError::InvalidArgument(format!(
                    "forward index doc {} after {}",
                    doc_id, last
                )));
            }
        }
        self.entries.push((doc_id, self.data.len() as u64));
        vint::encode_vint(fields.len() as u32, &mut self.data);
        for (name, tokens) in fields {
            vint::encode_vint(name.len() as u32, &mut self.data);
            self.data.extend_from_slice(name.as_bytes());
            vint::encode_vint(tokens.len() as u32, &mut self.data);
            for token in tokens.iter() {
                vint::encode_vint(token.term_id, &mut self.data);
                vint::encode_vint(token.offset, &mut self.data);
            }
        }
        Ok(())
    }

    pub fn write(&self, fdi: &mut dyn IndexOutput, fdd: &mut dyn IndexOutput) -> Result<()> {
        for &(doc, offset) in &self.entries {
            fdi.write_u32(doc)?;
            fdi.write_u64(offset)?;
        }
        fdd.write_bytes(&self.data)
    }
}

#[derive(Clone, Debug)]
pub struct ForwardIndexReader {
    index: FileBytes,
    data: FileBytes,
}

impl ForwardIndexReader {
    pub fn open(dir: &dyn Directory, barrel: &str) -> Result<Self> {
        let index = dir.open_bytes(&fdi_file(barrel))?;
        if index.len() % ENTRY_LEN != 0 {
            return Err(IndexError::collapse(format!(
                "'{}' has a partial entry",
                fdi_file(barrel)
            )));
        }
        Ok(Self {
            index,
            data: dir.open_bytes(&fdd_file(barrel))?,
        })
    }

    pub fn num_docs(&self) -> usize {
        self.index.len() / ENTRY_LEN
    }

    fn entry(&self, i: usize) -> Result<(DocId, u64)> {
        let mut reader = SliceReader::at(self.index.as_slice(), i * ENTRY_LEN);
        Ok((reader.read_u32()?, reader.read_u64()?))
    }

    /// Encoded bytes of the i-th document
    fn raw(&self, i: usize) -> Result<&[u8]> {
        let (_, start) = self.entry(i)?;
        let end = if i + 1 < self.num_docs() {
            self.entry(i + 1)?.1
        } else {
            self.data.len() as u64
        };
        self.data
            .as_slice()
            .get(start as usize..end as usize)
            .ok_or_else(|| IndexError::collapse("forward index offset out of range"))
    }

    fn find(&self, doc_id: DocId) -> Result<Option<usize>> {
        let (mut lo, mut hi) = (0, self.num_docs());
        while lo < hi {
            let mid = (lo + hi) / 2;
            let (doc, _) = self.entry(mid)?;
            match doc.cmp(&doc_id) {
                std::cmp::Ordering::Equal => return Ok(Some(mid)),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        Ok(None)
    }

    pub fn document(&self, doc_id: DocId) -> Result<Option<ForwardDocument>> {
        let Some(i) = self.find(doc_id)? else {
            return Ok(None);
        };
        let mut reader = SliceReader::new(self.raw(i)?);
        let field_count = reader.read_vint()?;
        let mut fields = Vec::with_capacity(field_count as usize);
        for _ in 0..field_count {
            let name = reader.read_string()?;
            let n = reader.read_vint()?;
            let mut tokens = Vec::with_capacity(n as usize);
            for _ in 0..n {
                let term_id = reader.read_vint()?;
                tokens.push(Token::new(term_id, reader.read_vint()?));
            }
            fields.push((name, tokens));
        }
        Ok(Some(fields))
    }

    pub fn doc_ids(&self) -> Result<Vec<DocId>> {
        (0..self.num_docs())
            .map(|i| self.entry(i).map(|(doc, _)| doc))
            .collect()
    }
}

/// Concatenate forward indexes in docid order, dropping deleted documents
pub fn merge_forward_indexes(
    sources: &[&ForwardIndexReader],
    deleted: &RoaringBitmap,
    fdi: &mut dyn IndexOutput,
    fdd: &mut dyn IndexOutput,
) -> Result<usize> {
    let mut written = 0;
    let mut last: Option<DocId> = None;
    for source in sources {
        for i in 0..source.num_docs() {
            let (doc, _) = source.entry(i)?;
            if deleted.contains(doc) {
                continue;
            }
            if last.is_some_and(|l| doc <= l) {
                return Err(IndexError::collapse(format!(
                    "forward index sources overlap at doc {}",
                    doc
                )));
            }
            fdi.write_u32(doc)?;
            fdi.write_u64(fdd.file_pointer())?;
            fdd.write_bytes(source.raw(i)?)?;
            last = Some(doc);
            written += 1;
        }
    }
    Ok(written)
}
