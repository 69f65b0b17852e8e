//! Term lookup and posting cursors
//!
//! `TermDocFreqs` walks (doc, tf) pairs, `TermPositions` adds the word
//! positions of the current document. Both return `None` and report
//! `BAD_DOCID` from `doc()` once exhausted.

use std::collections::BTreeMap;

use crate::error::{IndexError, Result};
use crate::store::vint::SliceReader;
use crate::store::{FileBytes, IndexOutput};

use super::types::{DocId, Posting, Term, TermId, TermInfo};

pub const VOCABULARY_MAGIC: u32 = 0x4256_4F43;
pub const VOCABULARY_VERSION: u32 = 1;

pub trait TermDocFreqs: Send {
    /// Documents containing the term, deleted ones included
    fn doc_freq(&self) -> u32;

    /// Total occurrences across all documents
    fn ctf(&self) -> u64;

    /// Advance to the next live document
    fn next(&mut self) -> Option<DocId>;

    /// Advance to the first live document `>= target`; never moves backwards
    fn skip_to(&mut self, target: DocId) -> Option<DocId>;

    fn doc(&self) -> DocId;

    fn freq(&self) -> u32;
}

pub trait TermPositions: TermDocFreqs {
    /// Next position of the current document
    fn next_position(&mut self) -> Option<u32>;

    /// All positions of the current document
    fn positions(&mut self) -> &[u32];
}

impl<T: TermDocFreqs + ?Sized> TermDocFreqs for Box<T> {
    fn doc_freq(&self) -> u32 {
        (**self).doc_freq()
    }

    fn ctf(&self) -> u64 {
        (**self).ctf()
    }

    fn next(&mut self) -> Option<DocId> {
        (**self).next()
    }

    fn skip_to(&mut self, target: DocId) -> Option<DocId> {
        (**self).skip_to(target)
    }

    fn doc(&self) -> DocId {
        (**self).doc()
    }

    fn freq(&self) -> u32 {
        (**self).freq()
    }
}

impl<T: TermPositions + ?Sized> TermPositions for Box<T> {
    fn next_position(&mut self) -> Option<u32> {
        (**self).next_position()
    }

    fn positions(&mut self) -> &[u32] {
        (**self).positions()
    }
}

/// Per-barrel (or fanned-in) term dictionary
pub trait TermReader: Send + Sync {
    fn term_info(&self, term: &Term) -> Option<TermInfo>;

    fn term_doc_freqs(&self, term: &Term) -> Option<Box<dyn TermDocFreqs>>;

    fn term_positions(&self, term: &Term) -> Option<Box<dyn TermPositions>>;

    fn doc_freq(&self, term: &Term) -> u32 {
        self.term_info(term).map_or(0, |info| info.doc_freq)
    }
}

/// Drain a cursor into owned postings
pub fn collect_postings<P: TermPositions + ?Sized>(postings: &mut P) -> Vec<Posting> {
    let mut out = Vec::new();
    while let Some(doc) = postings.next() {
        out.push(Posting::with_positions(doc, postings.positions().to_vec()));
    }
    out
}

/// Sorted term dictionary of one barrel, persisted as `.voc`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Vocabulary {
    fields: BTreeMap<String, Vec<(TermId, TermInfo)>>,
}

impl Vocabulary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a term; ids must increase within a field
    pub fn push(&mut self, field: &str, term_id: TermId, info: TermInfo) -> Result<()> {
        let terms = self.fields.entry(field.to_string()).or_default();
        if let Some(&(last, _)) = terms.last() {
            if term_id <= last {
                return Err(IndexError::InvalidArgument(format!(
                    "term {} added after {} in field '{}'",
                    term_id, last, field
                )));
            }
        }
        terms.push((term_id, info));
        Ok(())
    }

    pub fn get(&self, term: &Term) -> Option<TermInfo> {
        let terms = self.fields.get(&term.field)?;
        terms
            .binary_search_by_key(&term.value, |&(id, _)| id)
            .ok()
            .map(|i| terms[i].1)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    pub fn terms(&self, field: &str) -> &[(TermId, TermInfo)] {
        self.fields.get(field).map_or(&[], Vec::as_slice)
    }

    pub fn num_terms(&self) -> usize {
        self.fields.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.num_terms() == 0
    }

    /// All terms in (field, term id) order
    pub fn iter(&self) -> impl Iterator<Item = (Term, TermInfo)> + '_ {
        self.fields.iter().flat_map(|(field, terms)| {
            terms
                .iter()
                .map(move |&(id, info)| (Term::new(field.clone(), id), info))
        })
    }

    pub fn write(&self, out: &mut dyn IndexOutput) -> Result<()> {
        out.write_u32(VOCABULARY_MAGIC)?;
        out.write_u32(VOCABULARY_VERSION)?;
        out.write_vint(self.fields.len() as u32)?;
        for (field, terms) in &self.fields {
            out.write_string(field)?;
            out.write_vint(terms.len() as u32)?;
            let mut prev = 0;
            for &(id, info) in terms {
                out.write_vint(id - prev)?;
                out.write_vint(info.doc_freq)?;
                out.write_vlong(info.posting_pointer)?;
                prev = id;
            }
        }
        Ok(())
    }

    pub fn read(bytes: &FileBytes, file: &str) -> Result<Self> {
        let mut reader = SliceReader::new(bytes.as_slice());
        let magic = reader.read_u32()?;
        if magic != VOCABULARY_MAGIC {
            return Err(IndexError::collapse(format!(
                "'{}' is not a vocabulary file",
                file
            )));
        }
        let version = reader.read_u32()?;
        if version != VOCABULARY_VERSION {
            return Err(IndexError::Version {
                file: file.to_string(),
                expected: VOCABULARY_VERSION,
                actual: version,
            });
        }

        let mut fields = BTreeMap::new();
        let field_count = reader.read_vint()?;
        for _ in 0..field_count {
            let name = reader.read_string()?;
            let count = reader.read_vint()? as usize;
            // each entry takes at least three bytes
            let mut terms = Vec::with_capacity(count.min(reader.remaining() / 3));
            let mut id: TermId = 0;
            for i in 0..count {
                let delta = reader.read_vint()?;
                if i > 0 && delta == 0 {
                    return Err(IndexError::collapse(format!(
                        "duplicate term in field '{}' of '{}'",
                        name, file
                    )));
                }
                id = id
                    .checked_add(delta)
                    .ok_or_else(|| IndexError::collapse("term id overflow"))?;
                let doc_freq = reader.read_vint()?;
                let pointer = reader.read_vlong()?;
                terms.push((id, TermInfo::new(doc_freq, pointer)));
            }
            fields.insert(name, terms);
        }
        Ok(Self { fields })
    }
}
