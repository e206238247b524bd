// shardstream-core/src/lib.rs

//! Shardstream - Core Library
//!
//! Writes samples into size-limited, hash-verified shard files with a
//! per-split manifest, and streams them back with deterministic,
//! epoch-aware partitioning across ranks, backed by a local shard cache.

pub mod cache;
pub mod config;
pub mod dataset;
pub mod error;
pub mod format;
pub mod manifest;
pub mod reader;
pub mod sampler;
pub mod storage;
pub mod writer;

// Re-export commonly used types for convenience
pub use config::StreamConfig;
pub use error::{Result, StreamError};
pub use storage::{LocalStorage, RemoteStore, StorageBackend, StorageReader, StorageWriter};

pub use cache::{CacheOptions, CacheStats, ShardCache, ShardHandle, ShardState};
pub use dataset::{DatasetOptions, StreamingDataset};
pub use format::{Column, ColumnType, Compression, HashAlgorithm, Sample, Schema, Value};
pub use manifest::{FileInfo, Manifest, ShardDescriptor};
pub use reader::{CancelToken, SampleStream};
pub use sampler::{EpochPlan, PlanConfig};
pub use writer::{ShardWriter, WriterOptions};
