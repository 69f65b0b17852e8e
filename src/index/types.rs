//! Core types shared by the indexing and reading paths

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::error::{IndexError, Result};

/// Collection-wide document id; ids grow with indexing order
pub type DocId = u32;

/// Numeric term id produced by the analysis layer
pub type TermId = u32;

/// Byte offset inside an index file
pub type FileOffset = u64;

/// "No (more) documents" sentinel returned by posting cursors
pub const BAD_DOCID: DocId = u32::MAX;

/// Postings decoded per block on the read path
pub const DECODE_BLOCK_SIZE: usize = 128;

/// Barrel handle: index into the barrel manifest
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BarrelId(pub u64);

impl BarrelId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for BarrelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "barrel#{}", self.0)
    }
}

/// A token within a named field, ordered by field then id
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Term {
    pub field: String,
    pub value: TermId,
}

impl Term {
    pub fn new(field: impl Into<String>, value: TermId) -> Self {
        Self {
            field: field.into(),
            value,
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.field, self.value)
    }
}

/// Vocabulary entry locating a term's posting inside `.dfp`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermInfo {
    pub doc_freq: u32,
    pub posting_pointer: FileOffset,
}

impl TermInfo {
    pub fn new(doc_freq: u32, posting_pointer: FileOffset) -> Self {
        Self {
            doc_freq,
            posting_pointer,
        }
    }
}

/// One analyzed token: term id plus word offset in the field
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Token {
    pub term_id: TermId,
    pub offset: u32,
}

impl Token {
    pub fn new(term_id: TermId, offset: u32) -> Self {
        Self { term_id, offset }
    }
}

/// Analyzed token stream of one field
pub type LaInput = Vec<Token>;

/// Build an LaInput where the i-th term sits at offset i
pub fn la_input(term_ids: &[TermId]) -> LaInput {
    term_ids
        .iter()
        .enumerate()
        .map(|(i, &t)| Token::new(t, i as u32))
        .collect()
}

/// One field of a document handed to the indexer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexerField {
    pub name: String,
    /// `None` when analysis produced nothing for the field
    pub tokens: Option<LaInput>,
}

/// A document in analyzed form
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IndexerDocument {
    pub doc_id: DocId,
    pub fields: Vec<IndexerField>,
}

impl IndexerDocument {
    pub fn new(doc_id: DocId) -> Self {
        Self {
            doc_id,
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, tokens: LaInput) -> Self {
        self.fields.push(IndexerField {
            name: name.into(),
            tokens: Some(tokens),
        });
        self
    }

    pub fn with_empty_field(mut self, name: impl Into<String>) -> Self {
        self.fields.push(IndexerField {
            name: name.into(),
            tokens: None,
        });
        self
    }

    pub fn token_count(&self) -> usize {
        self.fields
            .iter()
            .map(|f| f.tokens.as_ref().map_or(0, |t| t.len()))
            .sum()
    }

    /// Refuse documents the indexer could only take in part
    ///
    /// A field name may appear once; a second posting for the same doc
    /// would not follow the first.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::with_capacity(self.fields.len());
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(IndexError::InvalidArgument(format!(
                    "field '{}' appears more than once in doc {}",
                    field.name, self.doc_id
                )));
            }
        }
        Ok(())
    }
}

/// A decoded posting entry
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub doc_id: DocId,
    pub term_freq: u32,
    pub positions: Vec<u32>,
}

impl Posting {
    pub fn new(doc_id: DocId, term_freq: u32) -> Self {
        Self {
            doc_id,
            term_freq,
            positions: Vec::new(),
        }
    }

    pub fn with_positions(doc_id: DocId, positions: Vec<u32>) -> Self {
        Self {
            doc_id,
            term_freq: positions.len() as u32,
            positions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_term_order() {
        let mut terms = vec![
            Term::new("title", 3),
            Term::new("body", 9),
            Term::new("title", 1),
            Term::new("body", 2),
        ];
        terms.sort();
        assert_eq!(
            terms,
            vec![
                Term::new("body", 2),
                Term::new("body", 9),
                Term::new("title", 1),
                Term::new("title", 3),
            ]
        );
    }

    #[test]
    fn test_barrel_id() {
        let id = BarrelId::new(4);
        assert_eq!(id.next(), BarrelId(5));
        assert_eq!(id.to_string(), "barrel#4");
    }

    #[test]
    fn test_document_builder() {
        let doc = IndexerDocument::new(7)
            .with_field("title", la_input(&[1, 2, 1]))
            .with_empty_field("body");
        assert_eq!(doc.token_count(), 3);
        assert_eq!(doc.fields[0].tokens.as_ref().unwrap()[2], Token::new(1, 2));
        assert!(doc.fields[1].tokens.is_none());
        assert!(doc.validate().is_ok());
    }

    #[test]
    fn test_repeated_field_is_invalid() {
        let doc = IndexerDocument::new(3)
            .with_field("body", la_input(&[1]))
            .with_empty_field("title")
            .with_field("body", la_input(&[2]));
        assert!(matches!(doc.validate(), Err(IndexError::InvalidArgument(_))));
    }
}
