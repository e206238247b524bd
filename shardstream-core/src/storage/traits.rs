// shardstream-core/src/storage/traits.rs

//! Storage traits.
//!
//! `StorageBackend` is the read/write surface the shard writer and the local
//! cache work against. `RemoteStore` is the narrow read-only surface the
//! cache fetches published shards and manifests through.

use std::io::{Read, Write};
use std::path::Path;

use bytes::Bytes;

use crate::error::Result;

/// An open object, read front to back.
pub trait StorageReader: Read + Send {
    /// Object size in bytes, known at open.
    fn size(&self) -> u64;
}

/// An object being written.
pub trait StorageWriter: Write + Send {
    /// Flushes and syncs the object. Data is durable only after this
    /// returns `Ok`.
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Writable storage rooted at a directory or prefix.
///
/// Object-safe; shared as `Arc<dyn StorageBackend>`.
pub trait StorageBackend: Send + Sync {
    fn exists(&self, path: &Path) -> Result<bool>;

    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageReader>>;

    /// Creates or truncates an object, creating parent directories.
    fn open_write(&self, path: &Path) -> Result<Box<dyn StorageWriter>>;

    fn delete(&self, path: &Path) -> Result<()>;

    /// Moves an object into place. Manifests and cached shards are published
    /// by writing a temporary name and renaming it.
    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    fn create_dir_all(&self, path: &Path) -> Result<()>;
}

/// Read-only access to a published dataset.
///
/// Paths are relative to the dataset root, e.g. `train/index.json` or
/// `train/shard.00003.mds.zstd`.
pub trait RemoteStore: Send + Sync {
    /// Fetches a whole object.
    fn get(&self, path: &Path) -> Result<Bytes>;

    fn exists(&self, path: &Path) -> Result<bool>;

    /// Human-readable location, for logs.
    fn location(&self) -> String;
}
