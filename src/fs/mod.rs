//! Filesystem layer
//!
//! `backing` and `marker` talk to the backing directory, `staging` moves
//! content through the cipher, `operations` dispatches path-addressed
//! requests and `adapter` connects all of it to FUSE.

pub mod adapter;
pub mod attr;
pub mod backing;
pub mod inode;
pub mod marker;
pub mod operations;
pub mod staging;

pub use adapter::{mount, FuseAdapter};
pub use attr::{DirEntry, FileAttributes, FileKind, FsStats, TimeUpdate};
pub use backing::BackingStore;
pub use operations::{FsResult, Operations, SealFs};
