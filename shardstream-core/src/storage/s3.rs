// shardstream-core/src/storage/s3.rs

//! S3-compatible remote store using the object_store crate.
//!
//! The rest of the crate is synchronous, so the store owns a small tokio
//! runtime and blocks on each request. Callers must not invoke it from
//! inside another tokio runtime.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use object_store::aws::AmazonS3Builder;
use object_store::{ClientOptions, ObjectStore};
use tokio::runtime::Runtime;

use super::traits::RemoteStore;
use crate::config::S3Config;
use crate::error::{Result, StreamError};

/// Read-only view of a dataset stored under a prefix of an object store.
pub struct ObjectStoreRemote {
    store: Arc<dyn ObjectStore>,
    /// Base prefix for all keys.
    base_prefix: String,
    runtime: Runtime,
}

impl ObjectStoreRemote {
    /// Creates an S3 remote from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the client cannot
    /// be built.
    pub fn new(config: &S3Config, base_prefix: impl Into<String>) -> Result<Self> {
        config.validate()?;

        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region)
            .with_client_options(
                ClientOptions::new()
                    .with_timeout(Duration::from_millis(config.request_timeout_ms))
                    .with_allow_http(config.allow_http),
            );

        // MinIO, LocalStack, etc.
        if let Some(endpoint) = &config.endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        if let Some(access_key) = &config.access_key_id {
            builder = builder.with_access_key_id(access_key);
        }
        if let Some(secret_key) = &config.secret_access_key {
            builder = builder.with_secret_access_key(secret_key);
        }

        let store = builder
            .build()
            .map_err(|e| StreamError::config_with_source("failed to build S3 client", e))?;

        Self::with_store(Arc::new(store), base_prefix)
    }

    /// Wraps an existing object store.
    pub fn with_store(store: Arc<dyn ObjectStore>, base_prefix: impl Into<String>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("shardstream-s3")
            .enable_all()
            .build()
            .map_err(|e| StreamError::config_with_source("failed to start S3 runtime", e))?;

        Ok(Self {
            store,
            base_prefix: base_prefix.into(),
            runtime,
        })
    }

    /// Resolves a path to an object_store path with the base prefix.
    fn resolve_path(&self, path: &Path) -> object_store::path::Path {
        let path_str = path.to_string_lossy();
        let full_path = if self.base_prefix.is_empty() {
            path_str.to_string()
        } else {
            format!(
                "{}/{}",
                self.base_prefix.trim_end_matches('/'),
                path_str.trim_start_matches('/')
            )
        };
        object_store::path::Path::from(full_path)
    }

    fn convert_error(path: &Path, message: &str, error: object_store::Error) -> StreamError {
        StreamError::storage(path, format!("{message}: {error}"))
    }
}

impl RemoteStore for ObjectStoreRemote {
    fn get(&self, path: &Path) -> Result<Bytes> {
        let object_path = self.resolve_path(path);
        self.runtime
            .block_on(async {
                let result = self.store.get(&object_path).await?;
                result.bytes().await
            })
            .map_err(|e| Self::convert_error(path, "failed to read object", e))
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        let object_path = self.resolve_path(path);
        match self.runtime.block_on(self.store.head(&object_path)) {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(Self::convert_error(path, "failed to check existence", e)),
        }
    }

    fn location(&self) -> String {
        format!("{}/{}", self.store, self.base_prefix)
    }
}
