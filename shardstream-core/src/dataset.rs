// shardstream-core/src/dataset.rs

//! Consumer-facing handle over one split of a published dataset.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::cache::{CacheOptions, CacheStats, ShardCache};
use crate::config::{StorageBackendType, StreamConfig};
use crate::error::{Result, StreamError};
use crate::format::{Sample, Schema};
use crate::manifest::Manifest;
use crate::reader::{CancelToken, SampleStream};
use crate::sampler::{EpochPlan, PlanConfig};
use crate::storage::{LocalStorage, RemoteStore};

/// Options for opening a dataset.
#[derive(Debug, Clone)]
pub struct DatasetOptions {
    pub cache: CacheOptions,
    pub plan: PlanConfig,
    /// Shards fetched ahead of each reader; zero disables prefetching.
    pub prefetch_depth: usize,
}

impl Default for DatasetOptions {
    fn default() -> Self {
        Self {
            cache: CacheOptions::default(),
            plan: PlanConfig::default(),
            prefetch_depth: 2,
        }
    }
}

impl DatasetOptions {
    pub fn from_config(config: &StreamConfig) -> Result<Self> {
        Ok(Self {
            cache: CacheOptions::from_config(&config.cache, &config.download)?,
            plan: PlanConfig::from(&config.sampler),
            prefetch_depth: config.cache.prefetch_depth,
        })
    }
}

/// A readable split.
///
/// The manifest is loaded once at open. Every reader created from one
/// handle shares its shard cache, so ranks hosted in the same process never
/// download a shard twice.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use shardstream_core::dataset::{DatasetOptions, StreamingDataset};
/// use shardstream_core::storage::LocalStorage;
///
/// # fn main() -> shardstream_core::Result<()> {
/// let remote = Arc::new(LocalStorage::open("/data/numbers")?);
/// let dataset = StreamingDataset::open(remote, "/tmp/cache", "train", DatasetOptions::default())?;
///
/// dataset.set_epoch(1);
/// for sample in dataset.iterate(0, 1)? {
///     let sample = sample?;
///     println!("{:?}", sample.get("words"));
/// }
/// # Ok(())
/// # }
/// ```
pub struct StreamingDataset {
    split: String,
    manifest: Arc<Manifest>,
    cache: Arc<ShardCache>,
    options: DatasetOptions,
    epoch: AtomicU64,
}

impl StreamingDataset {
    /// Opens `split` from `remote`, caching shards under
    /// `local_cache_dir/<split>`.
    ///
    /// # Errors
    ///
    /// `ManifestCorrupt` if the manifest cannot be loaded, or any cache
    /// construction error such as `CacheQuotaUnsatisfiable`.
    pub fn open(
        remote: Arc<dyn RemoteStore>,
        local_cache_dir: impl AsRef<Path>,
        split: &str,
        options: DatasetOptions,
    ) -> Result<Self> {
        let manifest = Arc::new(Manifest::load(remote.as_ref(), split)?);
        let cache = ShardCache::new(
            manifest.clone(),
            remote.clone(),
            split,
            local_cache_dir,
            options.cache.clone(),
        )?;

        info!(
            split,
            remote = %remote.location(),
            shards = manifest.num_shards(),
            samples = manifest.num_samples(),
            "Opened dataset"
        );

        Ok(Self {
            split: split.to_string(),
            manifest,
            cache: Arc::new(cache),
            options,
            epoch: AtomicU64::new(0),
        })
    }

    /// Opens `split` using the remote and cache settings of `config`.
    pub fn from_config(config: &StreamConfig, split: &str) -> Result<Self> {
        let options = DatasetOptions::from_config(config)?;
        Self::open(remote_from_config(config)?, &config.cache.local_dir, split, options)
    }

    pub fn split(&self) -> &str {
        &self.split
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    pub fn schema(&self) -> &Schema {
        self.manifest.schema()
    }

    /// Total number of samples in the split.
    pub fn len(&self) -> u64 {
        self.manifest.num_samples()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads one sample by global id.
    ///
    /// # Errors
    ///
    /// `SampleOutOfRange` for an id past the end, or the error of fetching
    /// its shard.
    pub fn get(&self, id: u64) -> Result<Sample> {
        let (shard, local) = self.manifest.locate(id)?;
        let handle = self.cache.acquire(shard)?;
        self.manifest.schema().decode(handle.sample(local)?)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Relaxed)
    }

    /// Sets the epoch used by `iterate`.
    pub fn set_epoch(&self, epoch: u64) {
        self.epoch.store(epoch, Ordering::Relaxed);
    }

    /// Partition plan for `epoch` across `world_size` ranks.
    pub fn plan(&self, epoch: u64, world_size: usize) -> Result<EpochPlan> {
        EpochPlan::new(self.len(), epoch, world_size, &self.options.plan)
    }

    /// Streams the samples of `rank` at the current epoch.
    pub fn iterate(&self, rank: usize, world_size: usize) -> Result<SampleStream> {
        self.iterate_epoch(self.epoch(), rank, world_size)
    }

    /// Streams the samples of `rank` at `epoch`.
    ///
    /// # Errors
    ///
    /// A config error if `world_size` is zero or `rank >= world_size`.
    pub fn iterate_epoch(&self, epoch: u64, rank: usize, world_size: usize) -> Result<SampleStream> {
        self.iterate_with_cancel(epoch, rank, world_size, CancelToken::new())
    }

    /// Like `iterate_epoch`, stopping when `cancel` is triggered.
    pub fn iterate_with_cancel(
        &self,
        epoch: u64,
        rank: usize,
        world_size: usize,
        cancel: CancelToken,
    ) -> Result<SampleStream> {
        let ids = self.plan(epoch, world_size)?.rank(rank)?;
        Ok(SampleStream::with_cancel(
            self.cache.clone(),
            ids,
            self.options.prefetch_depth,
            cancel,
        ))
    }

    pub fn cache(&self) -> &Arc<ShardCache> {
        &self.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}

/// Builds the remote store selected by `config.storage`.
pub fn remote_from_config(config: &StreamConfig) -> Result<Arc<dyn RemoteStore>> {
    match config.storage.backend {
        StorageBackendType::Local => Ok(Arc::new(LocalStorage::new(&config.storage)?)),
        #[cfg(feature = "s3")]
        StorageBackendType::S3 => {
            let s3 = config.storage.s3.as_ref().ok_or_else(|| {
                StreamError::config("storage.s3 configuration is required when backend is 's3'")
            })?;
            let prefix = config.storage.base_path.to_string_lossy().to_string();
            Ok(Arc::new(crate::storage::ObjectStoreRemote::new(s3, prefix)?))
        }
        #[cfg(not(feature = "s3"))]
        StorageBackendType::S3 => Err(StreamError::config(
            "S3 storage requires the 's3' feature",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Column, ColumnType};
    use crate::storage::StorageBackend;
    use crate::writer::{ShardWriter, WriterOptions};
    use tempfile::TempDir;

    fn write_numbers(root: &Path, count: u32, size_limit: Option<u64>) {
        let storage = Arc::new(LocalStorage::open(root).unwrap());
        let schema = Schema::new(vec![
            Column::new("number", ColumnType::U32),
            Column::new("words", ColumnType::Str),
        ])
        .unwrap();
        let options = WriterOptions {
            size_limit,
            ..Default::default()
        };
        let mut writer = ShardWriter::new(storage, "train", schema, options).unwrap();
        for i in 0..count {
            let sample = Sample::new().with("number", i).with("words", format!("n{i}"));
            writer.write(&sample).unwrap();
        }
        writer.finish().unwrap();
    }

    fn open(remote: &TempDir, cache: &TempDir, options: DatasetOptions) -> StreamingDataset {
        let storage = Arc::new(LocalStorage::open(remote.path()).unwrap());
        StreamingDataset::open(storage, cache.path(), "train", options).unwrap()
    }

    fn numbers(stream: SampleStream) -> Vec<u64> {
        stream
            .map(|s| s.unwrap().get("number").unwrap().as_u64().unwrap())
            .collect()
    }

    #[test]
    fn test_open_and_get() {
        let (remote, cache) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        write_numbers(remote.path(), 25, Some(64));
        let dataset = open(&remote, &cache, DatasetOptions::default());

        assert_eq!(dataset.len(), 25);
        assert!(!dataset.is_empty());
        assert!(dataset.manifest().num_shards() > 1);
        assert_eq!(dataset.get(17).unwrap().get("words").unwrap().as_str(), Some("n17"));
        assert!(matches!(
            dataset.get(25),
            Err(StreamError::SampleOutOfRange { .. })
        ));
    }

    #[test]
    fn test_missing_manifest_is_corrupt() {
        let (remote, cache) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        let storage = Arc::new(LocalStorage::open(remote.path()).unwrap());
        let result = StreamingDataset::open(storage, cache.path(), "train", DatasetOptions::default());
        assert!(matches!(result, Err(StreamError::ManifestCorrupt { .. })));
    }

    #[test]
    fn test_truncated_manifest_is_corrupt() {
        let (remote, cache) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        write_numbers(remote.path(), 5, None);
        let path = remote.path().join("train/index.json");
        let data = std::fs::read(&path).unwrap();
        std::fs::write(&path, &data[..data.len() / 2]).unwrap();

        let storage = Arc::new(LocalStorage::open(remote.path()).unwrap());
        let result = StreamingDataset::open(storage, cache.path(), "train", DatasetOptions::default());
        assert!(matches!(result, Err(StreamError::ManifestCorrupt { .. })));
    }

    #[test]
    fn test_iterate_uses_current_epoch() {
        let (remote, cache) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        write_numbers(remote.path(), 50, Some(128));
        let options = DatasetOptions {
            plan: PlanConfig {
                shuffle: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let dataset = open(&remote, &cache, options);

        dataset.set_epoch(3);
        assert_eq!(dataset.epoch(), 3);
        let current = numbers(dataset.iterate(0, 1).unwrap());
        let explicit = numbers(dataset.iterate_epoch(3, 0, 1).unwrap());
        assert_eq!(current, explicit);
        assert_eq!(current, dataset.plan(3, 1).unwrap().rank(0).unwrap());

        let other = numbers(dataset.iterate_epoch(4, 0, 1).unwrap());
        assert_ne!(current, other);
    }

    #[test]
    fn test_ranks_share_one_cache() {
        let (remote, cache) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        write_numbers(remote.path(), 40, Some(96));
        let dataset = Arc::new(open(&remote, &cache, DatasetOptions::default()));
        let shards = dataset.manifest().num_shards() as u64;

        let handles: Vec<_> = (0..4)
            .map(|rank| {
                let dataset = dataset.clone();
                std::thread::spawn(move || numbers(dataset.iterate(rank, 4).unwrap()))
            })
            .collect();
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..40).collect::<Vec<_>>());
        assert_eq!(dataset.cache_stats().fetches, shards);
    }

    #[test]
    fn test_iterate_with_cancel() {
        let (remote, cache) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        write_numbers(remote.path(), 10, None);
        let dataset = open(&remote, &cache, DatasetOptions::default());

        let token = CancelToken::new();
        let mut stream = dataset.iterate_with_cancel(0, 0, 1, token.clone()).unwrap();
        assert!(stream.next().unwrap().is_ok());
        token.cancel();
        assert!(matches!(stream.next(), Some(Err(StreamError::Cancelled))));
    }

    #[test]
    fn test_invalid_rank() {
        let (remote, cache) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        write_numbers(remote.path(), 10, None);
        let dataset = open(&remote, &cache, DatasetOptions::default());
        assert!(dataset.iterate(2, 2).is_err());
        assert!(dataset.iterate(0, 0).is_err());
    }

    #[test]
    fn test_from_config() {
        let (remote, cache) = (TempDir::new().unwrap(), TempDir::new().unwrap());
        write_numbers(remote.path(), 12, None);

        let mut config = StreamConfig::default();
        config.storage.base_path = remote.path().to_path_buf();
        config.cache.local_dir = cache.path().to_path_buf();
        config.cache.prefetch_depth = 0;

        let dataset = StreamingDataset::from_config(&config, "train").unwrap();
        assert_eq!(dataset.len(), 12);
        assert_eq!(numbers(dataset.iterate(0, 1).unwrap()), (0..12).collect::<Vec<_>>());
        assert!(StorageBackend::exists(
            &LocalStorage::open(cache.path()).unwrap(),
            Path::new("train/shard.00000.mds")
        )
        .unwrap());
    }
}
