//! Shogun Relay storage adapter
//!
//! Backend-agnostic file tree rooted at the drive root. Concrete backends
//! (`LocalFs`, `S3Compatible`) are picked at construction; callers only see
//! the [`StorageBackend`] trait.

pub mod adapter;
pub mod error;
pub mod local;
pub mod path;
pub mod s3;

pub use adapter::{
    guess_content_type, ByteStream, DriveEntry, DriveStats, EntryKind, FileMeta, StorageBackend,
};
pub use error::{Result, StorageError};
pub use local::LocalFs;
pub use path::clean_path;
pub use s3::S3Compatible;
