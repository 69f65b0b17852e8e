use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{IndexError, IoResultExt, Result};
use crate::index::{MergeStrategy, UnconditionalMode};
use crate::store::DEFAULT_BUFFER_SIZE;

/// Which Directory backend holds the index files
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectoryKind {
    FileSystem,
    MemoryMapped,
    Ram,
}

/// One property of the collection schema
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    /// Build postings for this field
    pub indexed: bool,
    /// Also keep the doc -> tokens forward index
    #[serde(default)]
    pub forward_index: bool,
}

impl FieldSchema {
    pub fn indexed(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            indexed: true,
            forward_index: false,
        }
    }

    pub fn with_forward_index(mut self) -> Self {
        self.forward_index = true;
        self
    }
}

/// Properties known to the index
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSchema {
    pub fields: Vec<FieldSchema>,
}

impl IndexSchema {
    pub fn new(fields: Vec<FieldSchema>) -> Self {
        Self { fields }
    }

    /// Indexed properties, in doc-length slot order
    pub fn indexed_fields(&self) -> impl Iterator<Item = &FieldSchema> {
        self.fields.iter().filter(|f| f.indexed)
    }

    pub fn num_indexed_properties(&self) -> usize {
        self.indexed_fields().count()
    }

    /// Doc-length slot of an indexed field
    pub fn slot_of(&self, name: &str) -> Option<usize> {
        self.indexed_fields().position(|f| f.name == name)
    }
}

/// Posting layout parameters
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostingConfig {
    /// Postings per block; one skip point is emitted per full block
    pub skip_interval: u32,
    pub max_skip_levels: usize,
}

impl Default for PostingConfig {
    fn default() -> Self {
        Self {
            skip_interval: 8,
            max_skip_levels: 3,
        }
    }
}

/// Memory limits of the in-memory barrel
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Initial arena block size in bytes
    pub arena_size: usize,
    /// Size of each chained grow-arena
    pub grow_size: usize,
    /// Arena bytes in use after which the barrel is flushed
    pub flush_threshold: usize,
    pub max_docs_per_barrel: u32,
    /// Arena used by the merger when re-encoding postings
    pub merge_arena_size: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            arena_size: 32 * 1024 * 1024,
            grow_size: 4 * 1024 * 1024,
            flush_threshold: 48 * 1024 * 1024,
            max_docs_per_barrel: 100_000,
            merge_arena_size: 4 * 1024 * 1024,
        }
    }
}

/// Where merges run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Inline on the thread that flushed the barrel
    Synchronous,
    /// On a dedicated merge worker thread
    Background,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MergeConfig {
    pub strategy: MergeStrategy,
    pub mode: MergeMode,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            strategy: MergeStrategy::default(),
            mode: MergeMode::Background,
        }
    }
}

/// Top-level index manager configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexManagerConfig {
    pub index_location: PathBuf,
    pub directory: DirectoryKind,
    pub schema: IndexSchema,
    pub posting: PostingConfig,
    pub memory: MemoryConfig,
    pub merge: MergeConfig,
    /// Log analyzed documents before indexing them
    pub binlog: bool,
    /// Let readers see the in-memory barrel
    pub realtime: bool,
    pub io_buffer_size: usize,
}

impl Default for IndexManagerConfig {
    fn default() -> Self {
        Self {
            index_location: PathBuf::from("./index"),
            directory: DirectoryKind::FileSystem,
            schema: IndexSchema::default(),
            posting: PostingConfig::default(),
            memory: MemoryConfig::default(),
            merge: MergeConfig::default(),
            binlog: true,
            realtime: false,
            io_buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Configuration profiles for different workloads
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexProfile {
    /// Small barrels, eager merges, in-memory barrel searchable
    Realtime,
    Balanced,
    /// Large barrels, merges deferred to shutdown
    Bulk,
}

impl IndexProfile {
    pub fn max_docs_per_barrel(&self) -> u32 {
        match self {
            IndexProfile::Realtime => 5_000,
            IndexProfile::Balanced => 100_000,
            IndexProfile::Bulk => 1_000_000,
        }
    }

    pub fn merge_strategy(&self) -> MergeStrategy {
        match self {
            IndexProfile::Realtime => MergeStrategy::Tiered {
                collision_factor: 3,
                level_size: 1_000,
            },
            IndexProfile::Balanced => MergeStrategy::default(),
            IndexProfile::Bulk => MergeStrategy::Unconditional {
                mode: UnconditionalMode::Offline,
            },
        }
    }

    /// Apply this profile to a config
    pub fn apply_to(&self, config: &mut IndexManagerConfig) {
        config.memory.max_docs_per_barrel = self.max_docs_per_barrel();
        config.merge.strategy = self.merge_strategy();
        config.realtime = matches!(self, IndexProfile::Realtime);
        if let IndexProfile::Bulk = self {
            config.memory.arena_size = 128 * 1024 * 1024;
            config.memory.flush_threshold = 192 * 1024 * 1024;
        }
    }
}

impl IndexManagerConfig {
    pub fn new(index_location: impl Into<PathBuf>, schema: IndexSchema) -> Self {
        Self {
            index_location: index_location.into(),
            schema,
            ..Default::default()
        }
    }

    pub fn with_profile(mut self, profile: IndexProfile) -> Self {
        profile.apply_to(&mut self);
        self
    }

    pub fn with_directory(mut self, kind: DirectoryKind) -> Self {
        self.directory = kind;
        self
    }

    pub fn with_merge_strategy(mut self, strategy: MergeStrategy) -> Self {
        self.merge.strategy = strategy;
        self
    }

    pub fn with_merge_mode(mut self, mode: MergeMode) -> Self {
        self.merge.mode = mode;
        self
    }

    pub fn with_posting(mut self, posting: PostingConfig) -> Self {
        self.posting = posting;
        self
    }

    pub fn with_memory(mut self, memory: MemoryConfig) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_binlog(mut self, enabled: bool) -> Self {
        self.binlog = enabled;
        self
    }

    pub fn with_realtime(mut self, enabled: bool) -> Self {
        self.realtime = enabled;
        self
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.posting.skip_interval < 1 {
            return Err(IndexError::InvalidArgument(
                "skip_interval must be at least 1".to_string(),
            ));
        }
        if self.posting.max_skip_levels < 1 {
            return Err(IndexError::InvalidArgument(
                "max_skip_levels must be at least 1".to_string(),
            ));
        }
        if self.memory.arena_size == 0 || self.memory.grow_size == 0 {
            return Err(IndexError::InvalidArgument(
                "arena sizes must be non-zero".to_string(),
            ));
        }
        if self.memory.max_docs_per_barrel == 0 {
            return Err(IndexError::InvalidArgument(
                "max_docs_per_barrel must be non-zero".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for field in &self.schema.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(IndexError::InvalidArgument(format!(
                    "duplicate field '{}' in schema",
                    field.name
                )));
            }
        }
        self.merge.strategy.validate()
    }

    pub fn from_json(data: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(data)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Load a JSON config file
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).io_context("read", &path.display().to_string())?;
        Self::from_json(&data)
    }
}
