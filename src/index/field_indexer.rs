use std::collections::HashMap;

use crate::config::PostingConfig;
use crate::error::Result;
use crate::store::IndexOutput;

use super::arena::MemoryArena;
use super::posting::PostingWriter;
use super::term_reader::Vocabulary;
use super::types::{DocId, TermId, Token};

/// Routes one field's tokens to per-term posting writers
pub struct FieldIndexer {
    field: String,
    config: PostingConfig,
    postings: HashMap<TermId, PostingWriter>,
    scratch: Vec<Token>,
    positions: Vec<u32>,
    num_tokens: u64,
}

impl FieldIndexer {
    pub fn new(field: impl Into<String>, config: PostingConfig) -> Self {
        Self {
            field: field.into(),
            config,
            postings: HashMap::new(),
            scratch: Vec::new(),
            positions: Vec::new(),
            num_tokens: 0,
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn num_terms(&self) -> usize {
        self.postings.len()
    }

    pub fn num_tokens(&self) -> u64 {
        self.num_tokens
    }

    pub fn posting(&self, term_id: TermId) -> Option<&PostingWriter> {
        self.postings.get(&term_id)
    }

    /// Index one document's tokens; returns the field length
    pub fn add_field(
        &mut self,
        arena: &mut MemoryArena,
        doc_id: DocId,
        tokens: &[Token],
    ) -> Result<usize> {
        self.scratch.clear();
        self.scratch.extend_from_slice(tokens);
        self.scratch.sort_unstable();

        let mut i = 0;
        while i < self.scratch.len() {
            let term_id = self.scratch[i].term_id;
            self.positions.clear();
            while i < self.scratch.len() && self.scratch[i].term_id == term_id {
                self.positions.push(self.scratch[i].offset);
                i += 1;
            }
            let config = self.config;
            self.postings
                .entry(term_id)
                .or_insert_with(|| PostingWriter::new(config))
                .add(arena, doc_id, &self.positions)?;
        }
        self.num_tokens += tokens.len() as u64;
        Ok(tokens.len())
    }

    fn sorted_terms(&self) -> Vec<TermId> {
        let mut terms: Vec<TermId> = self.postings.keys().copied().collect();
        terms.sort_unstable();
        terms
    }

    pub fn seal(&mut self) {
        for posting in self.postings.values_mut() {
            posting.seal();
        }
    }

    /// Write every posting in term order and register it in `vocabulary`
    pub fn write(
        &self,
        arena: &MemoryArena,
        dfp: &mut dyn IndexOutput,
        pop: &mut dyn IndexOutput,
        vocabulary: &mut Vocabulary,
    ) -> Result<()> {
        for term_id in self.sorted_terms() {
            if let Some(posting) = self.postings.get(&term_id) {
                let info = posting.write(arena, dfp, pop)?;
                vocabulary.push(&self.field, term_id, info)?;
            }
        }
        Ok(())
    }
}
