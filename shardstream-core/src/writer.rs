// shardstream-core/src/writer.rs

//! Shard writer.
//!
//! Encodes samples against a fixed schema, groups them into size-limited
//! shards, hashes and optionally compresses each shard, and publishes the
//! split's manifest once every shard is on storage.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info};

use crate::config::WriterConfig;
use crate::error::{Result, StreamError};
use crate::format::{
    digest_all, encode_shard, Compression, HashAlgorithm, Sample, Schema,
    OFFSET_BYTES_PER_SAMPLE, SHARD_HEADER_BYTES,
};
use crate::manifest::{manifest_path, FileInfo, Manifest, ShardDescriptor, MANIFEST_FILE};
use crate::storage::StorageBackend;

/// Default shard size limit, 64 MiB.
pub const DEFAULT_SIZE_LIMIT: u64 = 1 << 26;

/// Parsed writer settings.
#[derive(Debug, Clone, PartialEq)]
pub struct WriterOptions {
    pub compression: Compression,
    pub hashes: Vec<HashAlgorithm>,
    /// `None` puts every sample in one shard.
    pub size_limit: Option<u64>,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            compression: Compression::None,
            hashes: vec![HashAlgorithm::Xxh64],
            size_limit: Some(DEFAULT_SIZE_LIMIT),
        }
    }
}

impl TryFrom<&WriterConfig> for WriterOptions {
    type Error = StreamError;

    fn try_from(config: &WriterConfig) -> Result<Self> {
        let hashes = config
            .hashes
            .iter()
            .map(|name| name.parse())
            .collect::<Result<Vec<HashAlgorithm>>>()?;
        Ok(Self {
            compression: config.compression.parse()?,
            hashes,
            size_limit: config.size_limit,
        })
    }
}

/// Writes one split of a dataset.
///
/// Samples are buffered until the pending shard would exceed the size
/// limit, at which point the shard is finalized and written. `finish`
/// flushes the last shard and publishes `<split>/index.json`; a writer that
/// hit an error never publishes a manifest.
pub struct ShardWriter {
    storage: Arc<dyn StorageBackend>,
    split: PathBuf,
    schema: Schema,
    options: WriterOptions,
    pending: Vec<Vec<u8>>,
    // Accounted size of the pending shard, including its offset table.
    pending_bytes: u64,
    shards: Vec<ShardDescriptor>,
    samples_written: u64,
    failed: bool,
}

impl ShardWriter {
    /// Creates a writer for `split` under the storage root.
    ///
    /// # Errors
    ///
    /// Returns a config error for a zero size limit, or a storage error if
    /// the split directory cannot be created.
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        split: &str,
        schema: Schema,
        options: WriterOptions,
    ) -> Result<Self> {
        if options.size_limit == Some(0) {
            return Err(StreamError::config("size_limit must be greater than 0"));
        }

        let split = PathBuf::from(split);
        storage.create_dir_all(&split)?;

        Ok(Self {
            storage,
            split,
            schema,
            options,
            pending: Vec::new(),
            pending_bytes: SHARD_HEADER_BYTES,
            shards: Vec::new(),
            samples_written: 0,
            failed: false,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Samples accepted so far, including those still pending.
    pub fn num_samples(&self) -> u64 {
        self.samples_written
    }

    /// Shards finalized so far.
    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// Encodes and buffers one sample.
    ///
    /// # Errors
    ///
    /// `SchemaMismatch` if the sample does not conform, or any error from
    /// finalizing the previous shard. Either error aborts the writer.
    pub fn write(&mut self, sample: &Sample) -> Result<()> {
        self.ensure_usable()?;
        let result = self.write_inner(sample);
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    fn write_inner(&mut self, sample: &Sample) -> Result<()> {
        let encoded = self.schema.encode(sample)?;
        let added = encoded.len() as u64 + OFFSET_BYTES_PER_SAMPLE;

        if let Some(limit) = self.options.size_limit {
            if !self.pending.is_empty() && self.pending_bytes + added > limit {
                self.flush_shard()?;
            }
        }

        self.pending.push(encoded);
        self.pending_bytes += added;
        self.samples_written += 1;
        Ok(())
    }

    /// Flushes the last shard and publishes the manifest atomically.
    ///
    /// # Errors
    ///
    /// Fails if the writer was aborted earlier or any write fails; in both
    /// cases no manifest is published.
    pub fn finish(mut self) -> Result<Manifest> {
        self.ensure_usable()?;
        if !self.pending.is_empty() {
            self.flush_shard()?;
        }

        let manifest = Manifest::new(
            self.schema,
            self.options.compression,
            self.options.hashes,
            self.options.size_limit,
            self.shards,
        )?;
        let data = manifest.to_json()?;

        let final_path = manifest_path(&self.split.to_string_lossy());
        let temp_path = self.split.join(format!(".{MANIFEST_FILE}.tmp"));
        write_to_path(self.storage.as_ref(), &temp_path, &data)?;
        self.storage.rename(&temp_path, &final_path)?;

        info!(
            split = %self.split.display(),
            shards = manifest.num_shards(),
            samples = manifest.num_samples(),
            "Published manifest"
        );
        Ok(manifest)
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.failed {
            return Err(StreamError::serialization(format!(
                "writer for '{}' was aborted by an earlier error",
                self.split.display()
            )));
        }
        Ok(())
    }

    /// Finalizes the pending samples into a shard file and descriptor.
    fn flush_shard(&mut self) -> Result<()> {
        let index = self.shards.len();
        let samples = std::mem::take(&mut self.pending);
        self.pending_bytes = SHARD_HEADER_BYTES;

        let raw = encode_shard(&samples)?;
        let raw_bytes = raw.len() as u64;
        if let Some(limit) = self.options.size_limit {
            if samples.len() > 1 && raw_bytes > limit {
                return Err(StreamError::ShardSizeViolation {
                    shard: index,
                    samples: samples.len(),
                    bytes: raw_bytes,
                    limit,
                });
            }
        }

        let header = SHARD_HEADER_BYTES + OFFSET_BYTES_PER_SAMPLE * samples.len() as u64;
        let mut offsets = Vec::with_capacity(samples.len() + 1);
        let mut offset = header as u32;
        offsets.push(offset);
        for sample in &samples {
            offset += sample.len() as u32;
            offsets.push(offset);
        }

        let raw_info = FileInfo {
            basename: ShardDescriptor::raw_basename(index),
            bytes: raw_bytes,
            hashes: digest_all(&self.options.hashes, &raw),
        };

        let zip_info = match ShardDescriptor::zip_basename(index, self.options.compression) {
            Some(basename) => {
                let zipped = self.options.compression.compress(&raw)?;
                write_to_path(self.storage.as_ref(), &self.split.join(&basename), &zipped)?;
                Some(FileInfo {
                    basename,
                    bytes: zipped.len() as u64,
                    hashes: digest_all(&self.options.hashes, &zipped),
                })
            }
            None => {
                write_to_path(
                    self.storage.as_ref(),
                    &self.split.join(&raw_info.basename),
                    &raw,
                )?;
                None
            }
        };

        debug!(
            shard = index,
            samples = samples.len(),
            raw_bytes,
            zip_bytes = zip_info.as_ref().map(|z| z.bytes),
            "Wrote shard"
        );

        self.shards.push(ShardDescriptor {
            index,
            samples: samples.len(),
            raw: raw_info,
            zip: zip_info,
            offsets,
        });
        Ok(())
    }
}

/// Writes data to a path using the storage backend.
fn write_to_path(storage: &dyn StorageBackend, path: &Path, data: &[u8]) -> Result<()> {
    let mut writer = storage.open_write(path)?;
    writer
        .write_all(data)
        .map_err(|e| StreamError::storage_with_source(path, "failed to write data", e))?;
    writer.finish()
}
