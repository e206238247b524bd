// shardstream-core/src/cache.rs

//! Local shard cache.
//!
//! Resolves a shard to verified, decompressed bytes, downloading it from the
//! remote store on demand and keeping the raw file in a local directory
//! bounded by a disk quota.
//!
//! # Shard lifecycle
//!
//! ```text
//! Absent ──► Fetching ──► Verified ──► Evicted ──► Fetching ...
//!               │
//!               └──► Corrupt ──► Fetching (next access)
//! ```
//!
//! A verified shard stays in memory until it is evicted, so the quota
//! bounds memory as well as disk. Bytes handed out are shared
//! `Arc<ShardBytes>` handles; while a reader holds one the shard is pinned
//! and never evicted.
//!
//! Shard files are verified whenever they are loaded from disk: files left
//! by an earlier run, shards brought back after eviction, and any file whose
//! size or modification time no longer matches what was loaded.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::config::{CacheConfig, DownloadConfig};
use crate::error::{Result, StreamError};
use crate::format::{HashAlgorithm, ShardBytes};
use crate::manifest::{FileInfo, Manifest, ShardDescriptor};
use crate::storage::{
    retry, LocalStorage, RemoteStore, RetryConfig, RetryResult, StorageBackend,
};

/// Verified shard bytes shared between readers.
pub type ShardHandle = Arc<ShardBytes>;

/// Cache state of one shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardState {
    Absent,
    Fetching,
    Verified,
    Evicted,
    Corrupt,
}

/// Cache behavior.
#[derive(Debug, Clone)]
pub struct CacheOptions {
    /// Disk quota for cached shard files; `None` is unbounded.
    pub quota_bytes: Option<u64>,
    /// Keep the compressed download next to the raw shard.
    pub keep_zip: bool,
    /// Hash checked on every load; defaults to the manifest's first hash.
    pub validate_hash: Option<HashAlgorithm>,
    pub retry: RetryConfig,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            quota_bytes: None,
            keep_zip: false,
            validate_hash: None,
            retry: RetryConfig::default(),
        }
    }
}

impl CacheOptions {
    pub fn from_config(cache: &CacheConfig, download: &DownloadConfig) -> Result<Self> {
        Ok(Self {
            quota_bytes: cache.quota_bytes,
            keep_zip: cache.keep_zip,
            validate_hash: cache
                .validate_hash
                .as_deref()
                .map(str::parse)
                .transpose()?,
            retry: RetryConfig::from(download),
        })
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub resident_bytes: u64,
    pub resident_shards: usize,
    /// Shards downloaded from the remote store.
    pub fetches: u64,
    /// Loads served by reading and verifying a local file.
    pub hits: u64,
    /// Acquires served from a shard already held in memory.
    pub memory_hits: u64,
    pub evictions: u64,
    /// Local files or downloads that failed verification.
    pub corrupt: u64,
}

/// Size and modification time of a cached raw shard file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
}

struct Entry {
    state: ShardState,
    last_access: u64,
    /// Bytes this shard occupies in the cache directory.
    resident: u64,
    /// In-memory bytes of a `Verified` shard. `None` for a file adopted from
    /// an earlier run that has not been verified yet.
    handle: Option<ShardHandle>,
    /// Stamp of the local file `handle` was verified against.
    stamp: Option<FileStamp>,
    /// Bumped on every completed load so waiters can tell their fetch ended.
    generation: u64,
    last_error: Option<StreamError>,
}

impl Entry {
    fn new() -> Self {
        Self {
            state: ShardState::Absent,
            last_access: 0,
            resident: 0,
            handle: None,
            stamp: None,
            generation: 0,
            last_error: None,
        }
    }

    /// Only the cache itself references the shard.
    fn unpinned(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| Arc::strong_count(h) == 1)
    }
}

struct Inner {
    entries: Vec<Entry>,
    tick: u64,
    resident_bytes: u64,
}

/// Shard cache for one split.
///
/// All readers in a process share one `ShardCache` through an `Arc`. The
/// bookkeeping lock is held only for state transitions; downloads and file
/// writes run under a per-shard I/O lock.
pub struct ShardCache {
    manifest: Arc<Manifest>,
    remote: Arc<dyn RemoteStore>,
    /// Remote directory of the split.
    split: PathBuf,
    local: LocalStorage,
    options: CacheOptions,
    hash: Option<HashAlgorithm>,
    inner: Mutex<Inner>,
    fetched: Condvar,
    io_locks: Vec<Mutex<()>>,
    fetches: AtomicU64,
    hits: AtomicU64,
    memory_hits: AtomicU64,
    evictions: AtomicU64,
    corrupt: AtomicU64,
}

impl ShardCache {
    /// Creates a cache rooted at `local_dir/<split>`.
    ///
    /// Shard files already in that directory are adopted: they count against
    /// the quota, are evicted first, and are verified on first use.
    ///
    /// # Errors
    ///
    /// `CacheQuotaUnsatisfiable` if the quota cannot hold the largest shard
    /// (raw file plus the kept download when `keep_zip` is set), a config
    /// error if `validate_hash` names a hash the manifest lacks, or a
    /// storage error if the directory cannot be created.
    pub fn new(
        manifest: Arc<Manifest>,
        remote: Arc<dyn RemoteStore>,
        split: &str,
        local_dir: impl AsRef<Path>,
        options: CacheOptions,
    ) -> Result<Self> {
        if let Some(quota) = options.quota_bytes {
            let largest = manifest
                .shards()
                .iter()
                .map(|d| (d.index, footprint(d, options.keep_zip)))
                .max_by_key(|(_, bytes)| *bytes);
            if let Some((shard, shard_bytes)) = largest {
                if quota < shard_bytes {
                    return Err(StreamError::CacheQuotaUnsatisfiable {
                        quota,
                        shard,
                        shard_bytes,
                    });
                }
            }
        }

        let hash = match options.validate_hash {
            Some(algorithm) if !manifest.hashes().contains(&algorithm) => {
                return Err(StreamError::config(format!(
                    "manifest has no {algorithm} digests to validate against"
                )));
            }
            Some(algorithm) => Some(algorithm),
            None => manifest.hashes().first().copied(),
        };

        let local = LocalStorage::open(local_dir.as_ref().join(split))?;
        let num_shards = manifest.num_shards();

        debug!(
            split,
            local = %local.base_path().display(),
            remote = %remote.location(),
            quota = ?options.quota_bytes,
            "Opened shard cache"
        );

        let cache = Self {
            manifest,
            remote,
            split: PathBuf::from(split),
            local,
            options,
            hash,
            inner: Mutex::new(Inner {
                entries: (0..num_shards).map(|_| Entry::new()).collect(),
                tick: 0,
                resident_bytes: 0,
            }),
            fetched: Condvar::new(),
            io_locks: (0..num_shards).map(|_| Mutex::new(())).collect(),
            fetches: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            memory_hits: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            corrupt: AtomicU64::new(0),
        };
        cache.adopt_existing()?;
        cache.evict_if_needed();
        Ok(cache)
    }

    /// Registers shard files left in the cache directory by an earlier run
    /// and removes interrupted temp files.
    fn adopt_existing(&self) -> Result<()> {
        let dir = self.local.base_path();
        let listing = fs::read_dir(dir).map_err(|e| {
            StreamError::storage_with_source(dir, "failed to list cache directory", e)
        })?;
        for item in listing.flatten() {
            let name = item.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') && name.ends_with(".tmp") {
                debug!(file = %name, "Removing interrupted cache write");
                if let Err(e) = self.local.delete(Path::new(name.as_ref())) {
                    warn!(file = %name, error = %e, "Failed to remove temp file");
                }
            }
        }

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut adopted = 0usize;
        for descriptor in self.manifest.shards() {
            let raw = self.stamp(descriptor);
            let zip = descriptor
                .zip
                .as_ref()
                .and_then(|zip| file_len(&dir.join(&zip.basename)).map(|len| (zip, len)));

            let Some(raw) = raw else {
                // a download without its raw shard cannot be served
                if let Some((zip, _)) = zip {
                    let _ = self.local.delete(Path::new(&zip.basename));
                }
                continue;
            };
            let mut resident = raw.len;
            if let Some((zip, len)) = zip {
                if self.options.keep_zip {
                    resident += len;
                } else {
                    let _ = self.local.delete(Path::new(&zip.basename));
                }
            }

            let entry = &mut inner.entries[descriptor.index];
            entry.state = ShardState::Verified;
            entry.resident = resident;
            inner.resident_bytes += resident;
            adopted += 1;
        }

        if adopted > 0 {
            info!(
                shards = adopted,
                bytes = inner.resident_bytes,
                dir = %dir.display(),
                "Found cached shards from an earlier run"
            );
        }
        Ok(())
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    pub fn local_dir(&self) -> &Path {
        self.local.base_path()
    }

    pub fn state(&self, shard: usize) -> Option<ShardState> {
        self.inner.lock().entries.get(shard).map(|e| e.state)
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            resident_bytes: inner.resident_bytes,
            resident_shards: inner.entries.iter().filter(|e| e.resident > 0).count(),
            fetches: self.fetches.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            corrupt: self.corrupt.load(Ordering::Relaxed),
        }
    }

    /// Returns verified bytes of `shard`, fetching it if needed.
    ///
    /// Concurrent callers for the same shard wait for a single in-flight
    /// load and share its outcome.
    pub fn acquire(&self, shard: usize) -> Result<ShardHandle> {
        let descriptor = self.manifest.shard(shard).ok_or_else(|| {
            StreamError::config(format!(
                "shard {shard} does not exist ({} shards)",
                self.manifest.num_shards()
            ))
        })?;

        let mut guard = self.inner.lock();
        let reload = loop {
            let state = guard.entries[shard].state;
            match state {
                ShardState::Fetching => {
                    let generation = guard.entries[shard].generation;
                    self.fetched.wait(&mut guard);
                    let entry = &guard.entries[shard];
                    if entry.generation != generation && entry.state == ShardState::Corrupt {
                        return Err(match &entry.last_error {
                            Some(e) => replicate(shard, e),
                            None => StreamError::shard_fetch(shard, 1, StreamError::Cancelled),
                        });
                    }
                }
                ShardState::Verified => {
                    let Some(handle) = guard.entries[shard].handle.clone() else {
                        guard.entries[shard].state = ShardState::Fetching;
                        break true;
                    };
                    let recorded = guard.entries[shard].stamp;
                    let generation = guard.entries[shard].generation;
                    let current = MutexGuard::unlocked(&mut guard, || self.stamp(descriptor));

                    let inner = &mut *guard;
                    let entry = &mut inner.entries[shard];
                    if entry.state != ShardState::Verified || entry.generation != generation {
                        continue;
                    }
                    if current.is_some() && current == recorded {
                        inner.tick += 1;
                        entry.last_access = inner.tick;
                        self.memory_hits.fetch_add(1, Ordering::Relaxed);
                        return Ok(handle);
                    }
                    warn!(shard, "Cached shard file changed on disk, verifying again");
                    entry.state = ShardState::Fetching;
                    break true;
                }
                ShardState::Absent | ShardState::Evicted | ShardState::Corrupt => {
                    guard.entries[shard].state = ShardState::Fetching;
                    break false;
                }
            }
        };
        drop(guard);

        let result = {
            let _io = self.io_locks[shard].lock();
            self.load(descriptor, reload)
                .map(|handle| (handle, self.stamp(descriptor)))
        };

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.tick += 1;
        let entry = &mut inner.entries[shard];
        entry.generation += 1;
        inner.resident_bytes -= entry.resident;
        let result = match result {
            Ok((handle, stamp)) => {
                entry.state = ShardState::Verified;
                entry.handle = Some(handle.clone());
                entry.stamp = stamp;
                entry.last_access = inner.tick;
                entry.resident = footprint(descriptor, self.options.keep_zip);
                entry.last_error = None;
                inner.resident_bytes += entry.resident;
                Ok(handle)
            }
            Err(e) => {
                entry.state = ShardState::Corrupt;
                entry.handle = None;
                entry.stamp = None;
                entry.resident = 0;
                entry.last_error = Some(replicate(shard, &e));
                Err(e)
            }
        };
        self.fetched.notify_all();
        drop(guard);

        if result.is_ok() {
            self.evict_if_needed();
        }
        result
    }

    /// Loads a shard from the local file if it verifies, else from remote.
    /// Called with the shard's I/O lock held.
    fn load(&self, descriptor: &ShardDescriptor, reload: bool) -> Result<ShardHandle> {
        let shard = descriptor.index;
        let raw_path = Path::new(&descriptor.raw.basename);

        if StorageBackend::exists(&self.local, raw_path)? {
            match self.read_local(descriptor) {
                Ok(handle) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(handle);
                }
                Err(e) => {
                    warn!(shard, error = %e, "Cached shard failed verification, re-fetching");
                    self.corrupt.fetch_add(1, Ordering::Relaxed);
                    self.remove_local(descriptor);
                }
            }
        } else if reload {
            warn!(shard, "Cached shard file disappeared, re-fetching");
        }

        let handle = self.fetch_remote(descriptor)?;
        self.fetches.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    fn read_local(&self, descriptor: &ShardDescriptor) -> Result<ShardHandle> {
        let data = self.local.get(Path::new(&descriptor.raw.basename))?;
        self.verify_file(descriptor.index, &descriptor.raw, &data)?;
        parse_shard(descriptor, data)
    }

    /// Downloads, verifies and stores a shard. A hash mismatch triggers
    /// exactly one more download before it is reported.
    fn fetch_remote(&self, descriptor: &ShardDescriptor) -> Result<ShardHandle> {
        let shard = descriptor.index;
        let remote_file = descriptor.remote_file();
        let remote_path = self.split.join(&remote_file.basename);
        let mut mismatches = 0;

        loop {
            let mut attempts = 0;
            let downloaded = retry(&self.options.retry, |attempt| {
                attempts = attempt + 1;
                match self.remote.get(&remote_path) {
                    Ok(data) => RetryResult::Ok(data),
                    Err(e) if e.is_transient() => {
                        warn!(shard, attempt, error = %e, "Shard download failed");
                        RetryResult::Retry(e)
                    }
                    Err(e) => RetryResult::Fail(e),
                }
            })
            .map_err(|e| StreamError::shard_fetch(shard, attempts, e))?;

            match self.unpack(descriptor, &downloaded) {
                Ok((raw, handle)) => {
                    self.store_local(descriptor, &raw, &downloaded)?;
                    debug!(
                        shard,
                        bytes = downloaded.len(),
                        attempts,
                        "Fetched shard"
                    );
                    return Ok(handle);
                }
                Err(e @ StreamError::HashMismatch { .. }) => {
                    self.corrupt.fetch_add(1, Ordering::Relaxed);
                    if mismatches > 0 {
                        return Err(e);
                    }
                    mismatches += 1;
                    warn!(shard, error = %e, "Downloaded shard is corrupt, fetching once more");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Verifies a download and turns it into raw shard bytes.
    fn unpack(&self, descriptor: &ShardDescriptor, downloaded: &Bytes) -> Result<(Bytes, ShardHandle)> {
        let shard = descriptor.index;
        self.verify_file(shard, descriptor.remote_file(), downloaded)?;

        let raw = if descriptor.zip.is_some() {
            let raw = Bytes::from(self.manifest.compression().decompress(downloaded)?);
            self.verify_file(shard, &descriptor.raw, &raw)?;
            raw
        } else {
            downloaded.clone()
        };

        let handle = parse_shard(descriptor, raw.clone())?;
        Ok((raw, handle))
    }

    fn verify_file(&self, shard: usize, file: &FileInfo, data: &[u8]) -> Result<()> {
        if data.len() as u64 != file.bytes {
            return Err(StreamError::HashMismatch {
                shard,
                algorithm: "size".to_string(),
                expected: file.bytes.to_string(),
                actual: data.len().to_string(),
            });
        }
        if let Some(algorithm) = self.hash {
            let expected = file.hash(algorithm).ok_or_else(|| {
                StreamError::manifest_corrupt(
                    self.split.join(&file.basename),
                    format!("no {algorithm} digest"),
                )
            })?;
            algorithm.verify(shard, data, expected)?;
        }
        Ok(())
    }

    /// Writes the raw shard (and optionally the download) into the cache
    /// directory via temp file and rename.
    fn store_local(&self, descriptor: &ShardDescriptor, raw: &[u8], downloaded: &[u8]) -> Result<()> {
        self.write_atomic(&descriptor.raw.basename, raw)?;
        if self.options.keep_zip {
            if let Some(zip) = &descriptor.zip {
                self.write_atomic(&zip.basename, downloaded)?;
            }
        }
        Ok(())
    }

    fn write_atomic(&self, basename: &str, data: &[u8]) -> Result<()> {
        let temp_path = PathBuf::from(format!(".{basename}.tmp"));
        let result = (|| {
            let mut writer = self.local.open_write(&temp_path)?;
            writer.write_all(data).map_err(|e| {
                StreamError::storage_with_source(&temp_path, "failed to write cached shard", e)
            })?;
            writer.finish()?;
            self.local.rename(&temp_path, Path::new(basename))
        })();
        if result.is_err() && StorageBackend::exists(&self.local, &temp_path).unwrap_or(false) {
            let _ = self.local.delete(&temp_path);
        }
        result
    }

    fn remove_local(&self, descriptor: &ShardDescriptor) {
        let files = std::iter::once(&descriptor.raw).chain(descriptor.zip.as_ref());
        for file in files {
            let path = Path::new(&file.basename);
            if !StorageBackend::exists(&self.local, path).unwrap_or(false) {
                continue;
            }
            if let Err(e) = self.local.delete(path) {
                warn!(shard = descriptor.index, error = %e, "Failed to remove cached file");
            }
        }
    }

    fn stamp(&self, descriptor: &ShardDescriptor) -> Option<FileStamp> {
        let meta = fs::metadata(self.local.base_path().join(&descriptor.raw.basename)).ok()?;
        Some(FileStamp {
            len: meta.len(),
            modified: meta.modified().ok(),
        })
    }

    /// Evicts least recently used, unpinned shards until under quota.
    fn evict_if_needed(&self) {
        let Some(quota) = self.options.quota_bytes else {
            return;
        };

        loop {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if inner.resident_bytes <= quota {
                return;
            }

            let victim = inner
                .entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.state == ShardState::Verified && e.unpinned())
                .min_by_key(|(_, e)| e.last_access)
                .map(|(i, _)| i);
            let Some(victim) = victim else {
                warn!(
                    resident = inner.resident_bytes,
                    quota, "Cache over quota but every resident shard is in use"
                );
                return;
            };
            let Some(io) = self.io_locks[victim].try_lock() else {
                return;
            };

            let entry = &mut inner.entries[victim];
            entry.state = ShardState::Evicted;
            entry.handle = None;
            entry.stamp = None;
            inner.resident_bytes -= entry.resident;
            entry.resident = 0;
            drop(guard);

            if let Some(descriptor) = self.manifest.shard(victim) {
                self.remove_local(descriptor);
            }
            drop(io);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(shard = victim, "Evicted shard");
        }
    }
}

/// Bytes a verified shard occupies in the cache directory.
fn footprint(descriptor: &ShardDescriptor, keep_zip: bool) -> u64 {
    let zip = match (&descriptor.zip, keep_zip) {
        (Some(zip), true) => zip.bytes,
        _ => 0,
    };
    descriptor.raw.bytes + zip
}

fn file_len(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().map(|m| m.len())
}

/// Copy of a load failure for the callers that waited on it, keeping the
/// variant. Sources are dropped; their text is already in the message.
fn replicate(shard: usize, error: &StreamError) -> StreamError {
    match error {
        StreamError::HashMismatch {
            shard,
            algorithm,
            expected,
            actual,
        } => StreamError::HashMismatch {
            shard: *shard,
            algorithm: algorithm.clone(),
            expected: expected.clone(),
            actual: actual.clone(),
        },
        StreamError::Decode { what, message } => StreamError::Decode {
            what: what.clone(),
            message: message.clone(),
        },
        StreamError::Compression { algorithm, message } => StreamError::Compression {
            algorithm: algorithm.clone(),
            message: message.clone(),
        },
        StreamError::ManifestCorrupt { path, message } => StreamError::ManifestCorrupt {
            path: path.clone(),
            message: message.clone(),
        },
        StreamError::ShardFetch {
            shard,
            attempts,
            message,
            ..
        } => StreamError::ShardFetch {
            shard: *shard,
            attempts: *attempts,
            message: message.clone(),
            source: None,
        },
        other => StreamError::ShardFetch {
            shard,
            attempts: 1,
            message: other.to_string(),
            source: None,
        },
    }
}

fn parse_shard(descriptor: &ShardDescriptor, raw: Bytes) -> Result<ShardHandle> {
    let shard = ShardBytes::parse(descriptor.index, raw)?;
    if shard.num_samples() != descriptor.samples {
        return Err(StreamError::decode(
            format!("shard {}", descriptor.index),
            format!(
                "holds {} samples, manifest says {}",
                shard.num_samples(),
                descriptor.samples
            ),
        ));
    }
    if !shard.offsets().eq(descriptor.offsets.iter().copied()) {
        return Err(StreamError::decode(
            format!("shard {}", descriptor.index),
            "offset table differs from the manifest",
        ));
    }
    Ok(Arc::new(shard))
}
