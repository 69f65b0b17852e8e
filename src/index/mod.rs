//! Barrel-based inverted index
//!
//! Documents arrive already analyzed (term ids with positions) and are
//! indexed into an in-memory barrel. Full barrels are flushed to immutable
//! files and merged in the background.
//!
//! # Architecture
//!
//! - `MemoryArena` / `VariantDataPool`: arena-backed growable byte chains
//! - `PostingWriter` / `SegmentPostings`: doc, frequency and position
//!   streams with a multi-level skip list
//! - `FieldIndexer` / `CollectionIndexer`: term to posting maps per field
//! - `IndexBarrelWriter`: the in-memory barrel and its flush
//! - `BarrelFiles` / `MultiIndexBarrelReader`: readers over flushed barrels
//! - `BarrelsInfo`: the manifest of live barrels, swapped atomically
//! - `MergePolicy` / `IndexMerger`: when and how barrels are merged
//! - `IndexManager`: ties it together, with binlog recovery and deletions

mod types;
mod arena;
mod pool;
mod skiplist;
mod posting;
mod term_reader;
mod multi_term;
mod doc_length;
mod forward_index;
mod field_indexer;
mod collection_indexer;
mod barrel_info;
mod deletion;
mod barrel_reader;
mod barrel_writer;
mod merge_policy;
mod merger;
mod binlog;
mod progress;
mod manager;

pub use types::*;
pub use arena::*;
pub use pool::*;
pub use skiplist::*;
pub use posting::*;
pub use term_reader::*;
pub use multi_term::*;
pub use doc_length::*;
pub use forward_index::*;
pub use field_indexer::*;
pub use collection_indexer::*;
pub use barrel_info::*;
pub use deletion::*;
pub use barrel_reader::*;
pub use barrel_writer::*;
pub use merge_policy::*;
pub use merger::*;
pub use binlog::*;
pub use progress::*;
pub use manager::*;
