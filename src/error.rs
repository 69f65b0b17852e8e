use std::io;

use thiserror::Error;

/// Main error type for index operations
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("I/O error during {op} on '{file}': {source}")]
    FileIo {
        op: &'static str,
        file: String,
        #[source]
        source: io::Error,
    },

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("Index collapse: {0}")]
    IndexCollapse(String),

    #[error("Version mismatch in '{file}': expected {expected}, found {actual}")]
    Version {
        file: String,
        expected: u32,
        actual: u32,
    },

    #[error("Empty barrel: {0}")]
    EmptyBarrel(String),

    #[error("Duplicate barrel: {0}")]
    DuplicateBarrel(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for index operations
pub type Result<T> = std::result::Result<T, IndexError>;

impl IndexError {
    /// Wrap an io error with the operation and file it happened on
    pub fn file_io(op: &'static str, file: impl Into<String>, source: io::Error) -> Self {
        IndexError::FileIo {
            op,
            file: file.into(),
            source,
        }
    }

    pub fn collapse(msg: impl Into<String>) -> Self {
        IndexError::IndexCollapse(msg.into())
    }

    /// Errors that only mean "nothing to do"
    pub fn is_benign(&self) -> bool {
        matches!(self, IndexError::EmptyBarrel(_))
    }

    /// Errors that leave the on-disk index unusable until rebuilt
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            IndexError::IndexCollapse(_) | IndexError::Version { .. }
        )
    }

    /// Check if the caller can flush and try again
    pub fn is_retriable(&self) -> bool {
        matches!(self, IndexError::OutOfMemory(_))
    }

    /// True for a missing file under a FileIo error
    pub fn is_not_found(&self) -> bool {
        match self {
            IndexError::FileIo { source, .. } | IndexError::Io(source) => {
                source.kind() == io::ErrorKind::NotFound
            }
            _ => false,
        }
    }
}

/// Attach operation and file context to raw io results
pub trait IoResultExt<T> {
    fn io_context(self, op: &'static str, file: &str) -> Result<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn io_context(self, op: &'static str, file: &str) -> Result<T> {
        self.map_err(|e| IndexError::file_io(op, file, e))
    }
}
