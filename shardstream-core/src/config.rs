// shardstream-core/src/config.rs

//! Configuration management for shardstream.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Result, StreamError};
use crate::format::{Compression, HashAlgorithm};

// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub storage: StorageConfig,
    pub writer: WriterConfig,
    pub cache: CacheConfig,
    pub download: DownloadConfig,
    pub sampler: SamplerConfig,
}

/// Storage backend type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendType {
    /// Local filesystem storage.
    #[default]
    Local,
    /// S3-compatible object storage.
    S3,
}

// Storage configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage backend type: "local" or "s3".
    pub backend: StorageBackendType,
    // Dataset root (local directory or S3 key prefix).
    pub base_path: PathBuf,
    // Buffer size in bytes for I/O operations.
    pub buffer_size: usize,
    // Whether to use memory-mapped I/O (local storage only).
    pub use_mmap: bool,
    // File size threshold (bytes) above which to use mmap (local storage only).
    pub mmap_threshold: u64,
    /// S3-specific configuration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Config>,
}

/// S3-compatible storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    /// S3 bucket name.
    pub bucket: String,
    /// AWS region (e.g., "us-east-1").
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// AWS access key ID (if not using instance credentials).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key_id: Option<String>,
    /// AWS secret access key (if not using instance credentials).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_access_key: Option<String>,
    /// Request timeout in milliseconds.
    pub request_timeout_ms: u64,
    /// Whether to allow HTTP (non-TLS) connections.
    pub allow_http: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: "us-east-1".to_string(),
            endpoint: None,
            access_key_id: None,
            secret_access_key: None,
            request_timeout_ms: 60_000,
            allow_http: false,
        }
    }
}

impl S3Config {
    /// Apply environment variable overrides to S3 configuration.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("SHARDSTREAM_S3_BUCKET") {
            self.bucket = val;
        }
        if let Ok(val) = std::env::var("SHARDSTREAM_S3_REGION") {
            self.region = val;
        }
        if let Ok(val) = std::env::var("SHARDSTREAM_S3_ENDPOINT") {
            self.endpoint = Some(val);
        }
        if let Ok(val) = std::env::var("SHARDSTREAM_S3_ACCESS_KEY_ID") {
            self.access_key_id = Some(val);
        }
        if let Ok(val) = std::env::var("SHARDSTREAM_S3_SECRET_ACCESS_KEY") {
            self.secret_access_key = Some(val);
        }
        if let Ok(val) = std::env::var("SHARDSTREAM_S3_REQUEST_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.request_timeout_ms = v;
            }
        }
        if let Ok(val) = std::env::var("SHARDSTREAM_S3_ALLOW_HTTP") {
            if let Ok(v) = val.parse() {
                self.allow_http = v;
            }
        }
        self
    }

    /// Validate S3 configuration.
    pub fn validate(&self) -> Result<()> {
        if self.bucket.is_empty() {
            return Err(StreamError::config("s3.bucket must not be empty"));
        }
        if self.region.is_empty() {
            return Err(StreamError::config("s3.region must not be empty"));
        }
        if self.request_timeout_ms == 0 {
            return Err(StreamError::config(
                "s3.request_timeout_ms must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Shard writer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    // Compression: "none", "lz4", "zstd" or "zstd:<level>".
    pub compression: String,
    // Hash algorithms recorded per shard file ("xxh64", "sha256").
    pub hashes: Vec<String>,
    // Shard size limit in bytes; None puts every sample in one shard.
    pub size_limit: Option<u64>,
}

/// Local shard cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    // Local directory where verified shards are cached, per split.
    pub local_dir: PathBuf,
    // Disk quota in bytes for decompressed shards; None is unbounded.
    pub quota_bytes: Option<u64>,
    // Number of shards to fetch ahead of the reader.
    pub prefetch_depth: usize,
    // Keep the compressed download next to the decompressed shard.
    pub keep_zip: bool,
    // Hash algorithm used for verification; defaults to the manifest's first.
    pub validate_hash: Option<String>,
}

/// Shard download retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    // Number of re-attempts after a transient fetch failure.
    pub max_retries: u32,
    // Initial delay (milliseconds) between retries.
    pub retry_delay_ms: u64,
    // Maximum delay (milliseconds) between retries.
    pub max_retry_delay_ms: u64,
}

/// Epoch sampling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub shuffle: bool,
    pub seed: u64,
    // Consumer batch size; enables batch-aligned partitioning when set.
    pub batch_size: Option<usize>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendType::Local,
            base_path: PathBuf::from("./data"),
            buffer_size: 64 * 1024, // 64 KB
            use_mmap: true,
            mmap_threshold: 1024 * 1024, // 1 MB
            s3: None,
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            compression: "none".to_string(),
            hashes: vec!["xxh64".to_string()],
            size_limit: Some(1 << 26), // 64 MB
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local_dir: PathBuf::from("./cache"),
            quota_bytes: None,
            prefetch_depth: 2,
            keep_zip: false,
            validate_hash: None,
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_delay_ms: 100,
            max_retry_delay_ms: 10_000,
        }
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            shuffle: false,
            seed: 9176,
            batch_size: None,
        }
    }
}

impl FromStr for StreamConfig {
    type Err = StreamError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| StreamError::config_with_source("failed to parse TOML config", e))
    }
}

impl StreamConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed, or is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            StreamError::storage_with_source(path, "failed to read config file", e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Variables are prefixed with `SHARDSTREAM_` and use underscores to
    // separate nested fields, e.g. `SHARDSTREAM_CACHE_QUOTA_BYTES` overrides
    // `cache.quota_bytes` and `SHARDSTREAM_SAMPLER_SEED` overrides
    // `sampler.seed`.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Storage overrides
        if let Ok(val) = std::env::var("SHARDSTREAM_STORAGE_BACKEND") {
            match val.to_lowercase().as_str() {
                "local" => self.storage.backend = StorageBackendType::Local,
                "s3" => self.storage.backend = StorageBackendType::S3,
                _ => {} // ignore invalid values
            }
        }
        if let Ok(val) = std::env::var("SHARDSTREAM_STORAGE_BASE_PATH") {
            self.storage.base_path = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("SHARDSTREAM_STORAGE_BUFFER_SIZE") {
            if let Ok(v) = val.parse() {
                self.storage.buffer_size = v;
            }
        }
        if let Ok(val) = std::env::var("SHARDSTREAM_STORAGE_USE_MMAP") {
            if let Ok(v) = val.parse() {
                self.storage.use_mmap = v;
            }
        }

        if std::env::var("SHARDSTREAM_S3_BUCKET").is_ok() {
            let s3_config = self.storage.s3.take().unwrap_or_default().with_env_overrides();
            self.storage.s3 = Some(s3_config);
        } else if let Some(s3_config) = self.storage.s3.take() {
            self.storage.s3 = Some(s3_config.with_env_overrides());
        }

        // Writer overrides
        if let Ok(val) = std::env::var("SHARDSTREAM_WRITER_COMPRESSION") {
            self.writer.compression = val;
        }
        if let Ok(val) = std::env::var("SHARDSTREAM_WRITER_HASHES") {
            self.writer.hashes = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Ok(val) = std::env::var("SHARDSTREAM_WRITER_SIZE_LIMIT") {
            if let Ok(v) = val.parse() {
                self.writer.size_limit = Some(v);
            }
        }

        // Cache overrides
        if let Ok(val) = std::env::var("SHARDSTREAM_CACHE_LOCAL_DIR") {
            self.cache.local_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("SHARDSTREAM_CACHE_QUOTA_BYTES") {
            if let Ok(v) = val.parse() {
                self.cache.quota_bytes = Some(v);
            }
        }
        if let Ok(val) = std::env::var("SHARDSTREAM_CACHE_PREFETCH_DEPTH") {
            if let Ok(v) = val.parse() {
                self.cache.prefetch_depth = v;
            }
        }
        if let Ok(val) = std::env::var("SHARDSTREAM_CACHE_KEEP_ZIP") {
            if let Ok(v) = val.parse() {
                self.cache.keep_zip = v;
            }
        }

        // Download overrides
        if let Ok(val) = std::env::var("SHARDSTREAM_DOWNLOAD_MAX_RETRIES") {
            if let Ok(v) = val.parse() {
                self.download.max_retries = v;
            }
        }
        if let Ok(val) = std::env::var("SHARDSTREAM_DOWNLOAD_RETRY_DELAY_MS") {
            if let Ok(v) = val.parse() {
                self.download.retry_delay_ms = v;
            }
        }

        // Sampler overrides
        if let Ok(val) = std::env::var("SHARDSTREAM_SAMPLER_SHUFFLE") {
            if let Ok(v) = val.parse() {
                self.sampler.shuffle = v;
            }
        }
        if let Ok(val) = std::env::var("SHARDSTREAM_SAMPLER_SEED") {
            if let Ok(v) = val.parse() {
                self.sampler.seed = v;
            }
        }
        if let Ok(val) = std::env::var("SHARDSTREAM_SAMPLER_BATCH_SIZE") {
            if let Ok(v) = val.parse() {
                self.sampler.batch_size = Some(v);
            }
        }

        self
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.storage.buffer_size == 0 {
            return Err(StreamError::config(
                "storage.buffer_size must be greater than 0",
            ));
        }

        if self.storage.backend == StorageBackendType::S3 {
            match &self.storage.s3 {
                Some(s3_config) => s3_config.validate()?,
                None => {
                    return Err(StreamError::config(
                        "storage.s3 configuration is required when backend is 's3'",
                    ));
                }
            }
        }

        self.writer.compression.parse::<Compression>()?;
        for name in &self.writer.hashes {
            name.parse::<HashAlgorithm>()?;
        }
        if self.writer.size_limit == Some(0) {
            return Err(StreamError::config(
                "writer.size_limit must be greater than 0",
            ));
        }

        if self.cache.quota_bytes == Some(0) {
            return Err(StreamError::config(
                "cache.quota_bytes must be greater than 0",
            ));
        }
        if let Some(name) = &self.cache.validate_hash {
            name.parse::<HashAlgorithm>()?;
        }

        if self.download.max_retry_delay_ms < self.download.retry_delay_ms {
            return Err(StreamError::config(
                "download.max_retry_delay_ms must not be smaller than download.retry_delay_ms",
            ));
        }

        if self.sampler.batch_size == Some(0) {
            return Err(StreamError::config(
                "sampler.batch_size must be greater than 0",
            ));
        }

        Ok(())
    }
}
