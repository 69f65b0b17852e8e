use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::config::{IndexSchema, PostingConfig};
use crate::error::Result;
use crate::store::IndexOutput;

use super::arena::MemoryArena;
use super::doc_length::DocLengthWriter;
use super::field_indexer::FieldIndexer;
use super::forward_index::ForwardIndexWriter;
use super::term_reader::Vocabulary;
use super::types::{IndexerDocument, Token};

#[derive(Clone, Copy, Debug)]
struct FieldSlot {
    slot: usize,
    forward: bool,
}

/// Splits documents into per-field indexers and records field lengths
pub struct CollectionIndexer {
    slots: HashMap<String, FieldSlot>,
    fields: BTreeMap<String, FieldIndexer>,
    forward: ForwardIndexWriter,
}

impl CollectionIndexer {
    pub fn new(schema: &IndexSchema, config: PostingConfig) -> Self {
        let mut slots = HashMap::new();
        let mut fields = BTreeMap::new();
        for (slot, field) in schema.indexed_fields().enumerate() {
            slots.insert(
                field.name.clone(),
                FieldSlot {
                    slot,
                    forward: field.forward_index,
                },
            );
            fields.insert(field.name.clone(), FieldIndexer::new(&field.name, config));
        }
        Self {
            slots,
            fields,
            forward: ForwardIndexWriter::new(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldIndexer> {
        self.fields.get(name)
    }

    pub fn num_terms(&self) -> usize {
        self.fields.values().map(FieldIndexer::num_terms).sum()
    }

    pub fn has_forward_index(&self) -> bool {
        !self.forward.is_empty()
    }

    pub fn forward_index(&self) -> &ForwardIndexWriter {
        &self.forward
    }

    /// Index one document; returns the number of tokens indexed
    ///
    /// Repeated field names are refused before any posting is written.
    pub fn add_document(
        &mut self,
        arena: &mut MemoryArena,
        doc: &IndexerDocument,
        doc_lengths: &mut DocLengthWriter,
    ) -> Result<usize> {
        doc.validate()?;
        match self.index_fields(arena, doc, doc_lengths) {
            Ok(indexed) => {
                doc_lengths.add(doc.doc_id)?;
                Ok(indexed)
            }
            Err(e) => {
                doc_lengths.discard_row();
                Err(e)
            }
        }
    }

    fn index_fields(
        &mut self,
        arena: &mut MemoryArena,
        doc: &IndexerDocument,
        doc_lengths: &mut DocLengthWriter,
    ) -> Result<usize> {
        let mut indexed = 0;
        let mut forward: Vec<(&str, &[Token])> = Vec::new();
        for field in &doc.fields {
            let (Some(&slot), Some(indexer)) =
                (self.slots.get(&field.name), self.fields.get_mut(&field.name))
            else {
                debug!(field = %field.name, doc_id = doc.doc_id, "ignoring field outside the schema");
                continue;
            };
            match field.tokens.as_deref() {
                Some(tokens) if !tokens.is_empty() => {
                    let len = indexer.add_field(arena, doc.doc_id, tokens)?;
                    doc_lengths.fill(slot.slot, len);
                    indexed += len;
                    if slot.forward {
                        forward.push((field.name.as_str(), tokens));
                    }
                }
                _ => doc_lengths.fill(slot.slot, 0),
            }
        }
        if !forward.is_empty() {
            self.forward.add_document(doc.doc_id, &forward)?;
        }
        Ok(indexed)
    }

    pub fn seal(&mut self) {
        for field in self.fields.values_mut() {
            field.seal();
        }
    }

    /// Write all postings; fields come out in name order
    pub fn write(
        &self,
        arena: &MemoryArena,
        dfp: &mut dyn IndexOutput,
        pop: &mut dyn IndexOutput,
    ) -> Result<Vocabulary> {
        let mut vocabulary = Vocabulary::new();
        for field in self.fields.values() {
            field.write(arena, dfp, pop, &mut vocabulary)?;
        }
        Ok(vocabulary)
    }
}
