// shardstream-core/src/error.rs

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {

    #[error("Storage error at '{path}': {message}")]
    Storage {
        path: PathBuf,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Sample does not match schema: {message}")]
    SchemaMismatch {
        message: String,
    },

    #[error("Shard {shard} holds {samples} samples in {bytes} bytes, over the {limit} byte limit")]
    ShardSizeViolation {
        shard: usize,
        samples: usize,
        bytes: u64,
        limit: u64,
    },

    #[error("Manifest at '{path}' is corrupt: {message}")]
    ManifestCorrupt {
        path: PathBuf,
        message: String,
    },

    #[error("Failed to fetch shard {shard} after {attempts} attempt(s): {message}")]
    ShardFetch {
        shard: usize,
        attempts: u32,
        message: String,
        #[source]
        source: Option<Box<StreamError>>,
    },

    #[error("Shard {shard} failed {algorithm} verification: expected {expected}, got {actual}")]
    HashMismatch {
        shard: usize,
        algorithm: String,
        expected: String,
        actual: String,
    },

    #[error("Cache quota of {quota} bytes cannot hold shard {shard} ({shard_bytes} bytes)")]
    CacheQuotaUnsatisfiable {
        quota: u64,
        shard: usize,
        shard_bytes: u64,
    },

    #[error("Compression error ({algorithm}): {message}")]
    Compression {
        algorithm: String,
        message: String,
    },

    #[error("Serialization error: {message}")]
    Serialization {
        message: String,
    },

    #[error("Failed to decode {what}: {message}")]
    Decode {
        what: String,
        message: String,
    },

    #[error("Sample {index} out of range (total samples: {total})")]
    SampleOutOfRange {
        index: u64,
        total: u64,
    },

    #[error("Read cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, StreamError>;

// Convenience constructors
impl StreamError {

    pub fn storage(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn storage_with_source(
        path: impl Into<PathBuf>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Storage {
            path: path.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    pub fn config_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Config {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn schema(message: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            message: message.into(),
        }
    }

    pub fn manifest_corrupt(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::ManifestCorrupt {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn shard_fetch(shard: usize, attempts: u32, source: StreamError) -> Self {
        Self::ShardFetch {
            shard,
            attempts,
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    pub fn compression(algorithm: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Compression {
            algorithm: algorithm.into(),
            message: message.into(),
        }
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    pub fn decode(what: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            what: what.into(),
            message: message.into(),
        }
    }

    pub fn out_of_range(index: u64, total: u64) -> Self {
        Self::SampleOutOfRange { index, total }
    }

    /// Whether a fetch that failed with this error is worth retrying.
    ///
    /// Storage I/O is transient; everything else (bad manifests, hash
    /// mismatches, undecodable payloads) will fail the same way again.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Storage { .. })
    }
}
