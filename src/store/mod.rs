//! Storage layer for index files
//!
//! # Architecture
//!
//! - **Directory**: named byte files with open/create/delete/rename
//! - **IndexInput / IndexOutput**: buffered streams with the VInt/VLong codec
//! - **FileBytes**: shared immutable views handed to readers
//! - **Backends**: local filesystem, memory-mapped, in-process RAM
//! - **DirectoryRegistry**: one directory instance per path, no globals

mod directory;
mod fs;
mod mmap;
mod ram;
mod registry;
pub mod vint;

pub use directory::*;
pub use fs::*;
pub use mmap::*;
pub use ram::*;
pub use registry::*;
