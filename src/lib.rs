pub mod config;
pub mod error;
pub mod index;
pub mod store;

pub use config::{DirectoryKind, FieldSchema, IndexManagerConfig, IndexProfile, IndexSchema};
pub use error::{IndexError, Result};
pub use index::{
    IndexManager, IndexerDocument, MergeStrategy, MultiIndexBarrelReader, Term, TermReader,
    UnconditionalMode,
};
pub use store::{Directory, DirectoryRegistry};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
