// shardstream-core/src/manifest.rs

//! Dataset index for one split.
//!
//! The manifest lists every shard in order with its sample count, file
//! sizes, content hashes and per-sample offsets, plus the schema and writer
//! settings. It is written once after all shards of a split are finalized
//! and is immutable afterwards.
//!
//! # File Format
//!
//! `<split>/index.json`:
//!
//! ```json
//! {
//!   "version": 2,
//!   "schema": [{"name": "number", "type": "u32"}, {"name": "words", "type": "str"}],
//!   "compression": "zstd:3",
//!   "hashes": ["xxh64"],
//!   "size_limit": 67108864,
//!   "shards": [
//!     {
//!       "index": 0,
//!       "samples": 3,
//!       "raw": {"basename": "shard.00000.mds", "bytes": 57, "hashes": {"xxh64": "..."}},
//!       "zip": {"basename": "shard.00000.mds.zstd", "bytes": 48, "hashes": {"xxh64": "..."}},
//!       "offsets": [20, 32, 43, 57]
//!     }
//!   ]
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, StreamError};
use crate::format::{Compression, HashAlgorithm, Schema, OFFSET_BYTES_PER_SAMPLE, SHARD_HEADER_BYTES};
use crate::storage::RemoteStore;

/// Current manifest format version.
pub const MANIFEST_VERSION: u32 = 2;

/// File name of the manifest inside a split directory.
pub const MANIFEST_FILE: &str = "index.json";

/// Relative path of a split's manifest.
pub fn manifest_path(split: &str) -> PathBuf {
    Path::new(split).join(MANIFEST_FILE)
}

/// A file belonging to a shard, as published.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub basename: String,
    pub bytes: u64,
    /// Hex digests keyed by algorithm name.
    #[serde(default)]
    pub hashes: BTreeMap<String, String>,
}

impl FileInfo {
    pub fn hash(&self, algorithm: HashAlgorithm) -> Option<&str> {
        self.hashes.get(algorithm.name()).map(String::as_str)
    }
}

/// Metadata for one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardDescriptor {
    pub index: usize,
    pub samples: usize,
    /// Decompressed shard file.
    pub raw: FileInfo,
    /// Compressed shard file, present iff the split is compressed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zip: Option<FileInfo>,
    /// Absolute sample offsets into the raw file, `samples + 1` entries.
    pub offsets: Vec<u32>,
}

impl ShardDescriptor {
    /// File name of a raw shard.
    pub fn raw_basename(index: usize) -> String {
        format!("shard.{index:05}.mds")
    }

    /// File name of a compressed shard, `None` when uncompressed.
    pub fn zip_basename(index: usize, compression: Compression) -> Option<String> {
        compression
            .extension()
            .map(|ext| format!("{}.{ext}", Self::raw_basename(index)))
    }

    /// The file that is actually published and fetched.
    pub fn remote_file(&self) -> &FileInfo {
        self.zip.as_ref().unwrap_or(&self.raw)
    }

    fn check(&self, position: usize, compression: Compression, hashes: &[HashAlgorithm]) -> std::result::Result<(), String> {
        if self.index != position {
            return Err(format!("shard at position {position} has index {}", self.index));
        }
        if self.samples == 0 {
            return Err(format!("shard {position} is empty"));
        }
        if self.raw.basename != Self::raw_basename(position) {
            return Err(format!("shard {position} has raw file '{}'", self.raw.basename));
        }
        match (&self.zip, Self::zip_basename(position, compression)) {
            (None, None) => {}
            (Some(zip), Some(expected)) if zip.basename == expected => {}
            (Some(zip), _) => {
                return Err(format!(
                    "shard {position} has compressed file '{}' but split compression is {compression}",
                    zip.basename
                ))
            }
            (None, Some(_)) => {
                return Err(format!("shard {position} is missing its compressed file"));
            }
        }
        for algorithm in hashes {
            let files = std::iter::once(&self.raw).chain(self.zip.as_ref());
            for file in files {
                if file.hash(*algorithm).is_none() {
                    return Err(format!(
                        "'{}' has no {} digest",
                        file.basename,
                        algorithm.name()
                    ));
                }
            }
        }

        if self.offsets.len() != self.samples + 1 {
            return Err(format!(
                "shard {position} lists {} offsets for {} samples",
                self.offsets.len(),
                self.samples
            ));
        }
        let header = SHARD_HEADER_BYTES + OFFSET_BYTES_PER_SAMPLE * self.samples as u64;
        if u64::from(self.offsets[0]) != header {
            return Err(format!(
                "shard {position} first offset is {}, expected {header}",
                self.offsets[0]
            ));
        }
        if self.offsets.windows(2).any(|w| w[0] > w[1]) {
            return Err(format!("shard {position} offsets are not monotonic"));
        }
        if u64::from(self.offsets[self.samples]) != self.raw.bytes {
            return Err(format!(
                "shard {position} offsets end at {} but raw size is {}",
                self.offsets[self.samples], self.raw.bytes
            ));
        }
        Ok(())
    }
}

/// Serialized form; converted into `Manifest` after validation.
#[derive(Deserialize)]
struct ManifestRepr {
    version: u32,
    schema: Schema,
    compression: Compression,
    #[serde(default)]
    hashes: Vec<HashAlgorithm>,
    size_limit: Option<u64>,
    shards: Vec<ShardDescriptor>,
}

/// A validated dataset index with a cumulative sample table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Manifest {
    version: u32,
    schema: Schema,
    compression: Compression,
    hashes: Vec<HashAlgorithm>,
    size_limit: Option<u64>,
    shards: Vec<ShardDescriptor>,
    /// `ends[i]` is one past the last global id held by shard `i`.
    #[serde(skip)]
    ends: Vec<u64>,
}

impl Manifest {
    /// Builds a manifest from ordered shard descriptors.
    ///
    /// # Errors
    ///
    /// Returns `ManifestCorrupt` if the descriptors are inconsistent with
    /// each other or with the writer settings.
    pub fn new(
        schema: Schema,
        compression: Compression,
        hashes: Vec<HashAlgorithm>,
        size_limit: Option<u64>,
        shards: Vec<ShardDescriptor>,
    ) -> Result<Self> {
        Self::from_parts(
            ManifestRepr {
                version: MANIFEST_VERSION,
                schema,
                compression,
                hashes,
                size_limit,
                shards,
            },
            Path::new(MANIFEST_FILE),
        )
    }

    fn from_parts(repr: ManifestRepr, path: &Path) -> Result<Self> {
        if repr.version != MANIFEST_VERSION {
            return Err(StreamError::manifest_corrupt(
                path,
                format!(
                    "unsupported version {} (expected {MANIFEST_VERSION})",
                    repr.version
                ),
            ));
        }

        let mut ends = Vec::with_capacity(repr.shards.len());
        let mut total = 0u64;
        for (position, shard) in repr.shards.iter().enumerate() {
            shard
                .check(position, repr.compression, &repr.hashes)
                .map_err(|message| StreamError::manifest_corrupt(path, message))?;
            if let Some(limit) = repr.size_limit {
                if shard.samples > 1 && shard.raw.bytes > limit {
                    return Err(StreamError::manifest_corrupt(
                        path,
                        format!(
                            "shard {position} holds {} samples in {} bytes, over the {limit} byte limit",
                            shard.samples, shard.raw.bytes
                        ),
                    ));
                }
            }
            total += shard.samples as u64;
            ends.push(total);
        }

        Ok(Self {
            version: repr.version,
            schema: repr.schema,
            compression: repr.compression,
            hashes: repr.hashes,
            size_limit: repr.size_limit,
            shards: repr.shards,
            ends,
        })
    }

    /// Parses and validates manifest JSON. `path` is used in errors only.
    pub fn from_json(path: impl AsRef<Path>, data: &[u8]) -> Result<Self> {
        let path = path.as_ref();
        let repr: ManifestRepr = serde_json::from_slice(data)
            .map_err(|e| StreamError::manifest_corrupt(path, e.to_string()))?;
        Self::from_parts(repr, path)
    }

    /// Fetches and validates the manifest of `split` from a remote store.
    ///
    /// # Errors
    ///
    /// A manifest that cannot be fetched or parsed is `ManifestCorrupt`.
    pub fn load(remote: &dyn RemoteStore, split: &str) -> Result<Self> {
        let path = manifest_path(split);
        let data = remote.get(&path).map_err(|e| {
            StreamError::manifest_corrupt(
                &path,
                format!("unreadable from {}: {e}", remote.location()),
            )
        })?;
        let manifest = Self::from_json(&path, &data)?;
        debug!(
            split,
            shards = manifest.num_shards(),
            samples = manifest.num_samples(),
            "Loaded manifest"
        );
        Ok(manifest)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| StreamError::serialization(e.to_string()))
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }

    pub fn hashes(&self) -> &[HashAlgorithm] {
        &self.hashes
    }

    pub fn size_limit(&self) -> Option<u64> {
        self.size_limit
    }

    pub fn shards(&self) -> &[ShardDescriptor] {
        &self.shards
    }

    pub fn shard(&self, index: usize) -> Option<&ShardDescriptor> {
        self.shards.get(index)
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// Total number of samples in the split.
    pub fn num_samples(&self) -> u64 {
        self.ends.last().copied().unwrap_or(0)
    }

    /// Global id of the first sample in `shard`.
    pub fn shard_start(&self, shard: usize) -> u64 {
        match shard {
            0 => 0,
            s => self.ends.get(s - 1).copied().unwrap_or_else(|| self.num_samples()),
        }
    }

    /// Maps a global sample id to `(shard, index within shard)`.
    ///
    /// # Errors
    ///
    /// Returns `SampleOutOfRange` if `id >= num_samples()`.
    pub fn locate(&self, id: u64) -> Result<(usize, usize)> {
        let total = self.num_samples();
        if id >= total {
            return Err(StreamError::out_of_range(id, total));
        }
        let shard = self.ends.partition_point(|&end| end <= id);
        Ok((shard, (id - self.shard_start(shard)) as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Column, ColumnType};

    fn schema() -> Schema {
        Schema::new(vec![Column::new("text", ColumnType::Str)]).unwrap()
    }

    /// Descriptor for a shard of `samples` samples, each `sample_bytes` long.
    fn descriptor(index: usize, samples: usize, sample_bytes: u32) -> ShardDescriptor {
        let header = (SHARD_HEADER_BYTES + OFFSET_BYTES_PER_SAMPLE * samples as u64) as u32;
        let offsets: Vec<u32> = (0..=samples as u32).map(|i| header + i * sample_bytes).collect();
        let bytes = u64::from(*offsets.last().unwrap());
        let mut hashes = BTreeMap::new();
        hashes.insert("xxh64".to_string(), format!("{index:016x}"));
        ShardDescriptor {
            index,
            samples,
            raw: FileInfo {
                basename: ShardDescriptor::raw_basename(index),
                bytes,
                hashes,
            },
            zip: None,
            offsets,
        }
    }

    fn manifest(counts: &[usize]) -> Manifest {
        let shards = counts
            .iter()
            .enumerate()
            .map(|(i, n)| descriptor(i, *n, 10))
            .collect();
        Manifest::new(
            schema(),
            Compression::None,
            vec![HashAlgorithm::Xxh64],
            None,
            shards,
        )
        .unwrap()
    }

    #[test]
    fn test_cumulative_table() {
        let m = manifest(&[3, 5, 2]);
        assert_eq!(m.num_shards(), 3);
        assert_eq!(m.num_samples(), 10);
        assert_eq!(m.shard_start(0), 0);
        assert_eq!(m.shard_start(1), 3);
        assert_eq!(m.shard_start(2), 8);
    }

    #[test]
    fn test_locate_boundaries() {
        let m = manifest(&[3, 5, 2]);
        assert_eq!(m.locate(0).unwrap(), (0, 0));
        assert_eq!(m.locate(2).unwrap(), (0, 2));
        assert_eq!(m.locate(3).unwrap(), (1, 0));
        assert_eq!(m.locate(7).unwrap(), (1, 4));
        assert_eq!(m.locate(8).unwrap(), (2, 0));
        assert_eq!(m.locate(9).unwrap(), (2, 1));
        assert!(matches!(
            m.locate(10),
            Err(StreamError::SampleOutOfRange { index: 10, total: 10 })
        ));
    }

    #[test]
    fn test_locate_many_shards() {
        // 10,000 samples across 40 shards of 250
        let m = manifest(&[250; 40]);
        assert_eq!(m.num_samples(), 10_000);
        assert_eq!(m.locate(7_500).unwrap(), (30, 0));
        assert_eq!(m.locate(7_499).unwrap(), (29, 249));
        assert_eq!(m.locate(7_777).unwrap(), (31, 27));
    }

    #[test]
    fn test_empty_manifest() {
        let m = manifest(&[]);
        assert_eq!(m.num_samples(), 0);
        assert!(m.locate(0).is_err());
    }

    #[test]
    fn test_json_roundtrip() {
        let m = manifest(&[2, 1]);
        let json = m.to_json().unwrap();
        let parsed = Manifest::from_json("train/index.json", &json).unwrap();
        assert_eq!(parsed, m);
        assert_eq!(parsed.locate(2).unwrap(), (1, 0));
    }

    #[test]
    fn test_rejects_garbage() {
        let err = Manifest::from_json("train/index.json", b"{\"version\": 2, \"sha").unwrap_err();
        assert!(matches!(err, StreamError::ManifestCorrupt { .. }));
    }

    #[test]
    fn test_rejects_wrong_version() {
        let mut value: serde_json::Value =
            serde_json::from_slice(&manifest(&[1]).to_json().unwrap()).unwrap();
        value["version"] = serde_json::json!(1);
        let err = Manifest::from_json("x", &serde_json::to_vec(&value).unwrap()).unwrap_err();
        assert!(err.to_string().contains("unsupported version"));
    }

    #[test]
    fn test_rejects_offset_arity() {
        let mut shard = descriptor(0, 3, 10);
        shard.offsets.pop();
        let err = Manifest::new(schema(), Compression::None, vec![], None, vec![shard]).unwrap_err();
        assert!(matches!(err, StreamError::ManifestCorrupt { .. }));
    }

    #[test]
    fn test_rejects_out_of_order_index() {
        let shards = vec![descriptor(0, 1, 4), descriptor(2, 1, 4)];
        assert!(Manifest::new(schema(), Compression::None, vec![], None, shards).is_err());
    }

    #[test]
    fn test_rejects_missing_zip() {
        let shards = vec![descriptor(0, 1, 4)];
        let err = Manifest::new(schema(), Compression::Lz4, vec![], None, shards).unwrap_err();
        assert!(err.to_string().contains("missing its compressed file"));
    }

    #[test]
    fn test_rejects_missing_digest() {
        let mut shard = descriptor(0, 1, 4);
        shard.raw.hashes.clear();
        let result = Manifest::new(
            schema(),
            Compression::None,
            vec![HashAlgorithm::Xxh64],
            None,
            vec![shard],
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_oversized_multi_sample_shard() {
        let shards = vec![descriptor(0, 4, 100), descriptor(1, 1, 1000)];
        let err = Manifest::new(schema(), Compression::None, vec![], Some(200), shards).unwrap_err();
        assert!(err.to_string().contains("shard 0"));

        // a single oversized sample is allowed
        let shards = vec![descriptor(0, 1, 1000)];
        assert!(Manifest::new(schema(), Compression::None, vec![], Some(200), shards).is_ok());
    }

    #[test]
    fn test_basenames() {
        assert_eq!(ShardDescriptor::raw_basename(7), "shard.00007.mds");
        assert_eq!(ShardDescriptor::zip_basename(7, Compression::None), None);
        assert_eq!(
            ShardDescriptor::zip_basename(12, Compression::Zstd { level: 3 }).as_deref(),
            Some("shard.00012.mds.zstd")
        );
        assert_eq!(manifest_path("train"), PathBuf::from("train/index.json"));
    }
}
