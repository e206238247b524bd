// shardstream-core/src/storage/mod.rs

//! Storage abstraction for shard files and manifests.
//!
//! Writers and the local cache use `StorageBackend`; readers pull published
//! datasets through `RemoteStore`. `LocalStorage` implements both, so a
//! dataset written to a directory can be streamed straight from it.
//!
//! # Example
//!
//! ```no_run
//! use shardstream_core::storage::{LocalStorage, RemoteStore, StorageBackend};
//! use std::io::Write;
//! use std::path::Path;
//!
//! let storage = LocalStorage::open("/data/my-dataset").unwrap();
//!
//! let mut writer = storage.open_write(Path::new("notes.txt")).unwrap();
//! writer.write_all(b"Hello, world!").unwrap();
//! writer.finish().unwrap();
//!
//! let bytes = storage.get(Path::new("notes.txt")).unwrap();
//! assert_eq!(bytes.as_ref(), b"Hello, world!");
//! ```

mod local;
mod retry;
mod traits;

pub use local::LocalStorage;
pub use retry::{retry, RetryConfig, RetryResult};
pub use traits::{RemoteStore, StorageBackend, StorageReader, StorageWriter};

// S3 storage (requires feature flag)
#[cfg(feature = "s3")]
mod s3;

#[cfg(feature = "s3")]
pub use s3::ObjectStoreRemote;
