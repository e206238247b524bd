// shardstream-core/src/storage/local.rs

//! Local filesystem storage backend implementation.
//!
//! This module provides a storage backend that uses the local filesystem.
//! It supports both buffered I/O and memory-mapped I/O for efficient
//! access to large shard files.

use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use memmap2::Mmap;

use super::traits::{RemoteStore, StorageBackend, StorageReader, StorageWriter};
use crate::config::StorageConfig;
use crate::error::{Result, StreamError};

/// Local filesystem storage backend.
///
/// Serves both as the writer's output location and as a `RemoteStore` for
/// datasets published to a local or network-mounted directory. The shard
/// cache also uses it for its own directory.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    /// Base path for all storage operations.
    base_path: PathBuf,
    /// Buffer size for buffered I/O operations.
    buffer_size: usize,
    /// Whether to use memory-mapped I/O.
    use_mmap: bool,
    /// File size threshold above which to use mmap.
    mmap_threshold: u64,
}

impl LocalStorage {
    /// Creates a new `LocalStorage` instance from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the base path cannot be created.
    pub fn new(config: &StorageConfig) -> Result<Self> {
        Self::with_settings(
            config.base_path.clone(),
            config.buffer_size,
            config.use_mmap,
            config.mmap_threshold,
        )
    }

    /// Creates a `LocalStorage` rooted at `base_path` with default I/O settings.
    pub fn open(base_path: impl Into<PathBuf>) -> Result<Self> {
        let defaults = StorageConfig::default();
        Self::with_settings(
            base_path.into(),
            defaults.buffer_size,
            defaults.use_mmap,
            defaults.mmap_threshold,
        )
    }

    fn with_settings(
        base_path: PathBuf,
        buffer_size: usize,
        use_mmap: bool,
        mmap_threshold: u64,
    ) -> Result<Self> {
        if !base_path.exists() {
            fs::create_dir_all(&base_path).map_err(|e| {
                StreamError::storage_with_source(&base_path, "failed to create base directory", e)
            })?;
        }

        Ok(Self {
            base_path,
            buffer_size,
            use_mmap,
            mmap_threshold,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolves a path relative to the base path.
    fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_path.join(path)
        }
    }

    fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    StreamError::storage_with_source(
                        parent,
                        "failed to create parent directories",
                        e,
                    )
                })?;
            }
        }
        Ok(())
    }
}

impl StorageBackend for LocalStorage {
    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.resolve_path(path).exists())
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageReader>> {
        let full_path = self.resolve_path(path);
        let file = File::open(&full_path)
            .map_err(|e| StreamError::storage_with_source(&full_path, "failed to open file", e))?;

        let size = file
            .metadata()
            .map_err(|e| {
                StreamError::storage_with_source(&full_path, "failed to read file metadata", e)
            })?
            .len();

        if self.use_mmap && size >= self.mmap_threshold {
            // SAFETY: shard files are immutable once published; the map is
            // read-only and owned by the reader.
            let mmap = unsafe { Mmap::map(&file) }.map_err(|e| {
                StreamError::storage_with_source(&full_path, "failed to memory-map file", e)
            })?;

            Ok(Box::new(MmapReader { mmap, position: 0 }))
        } else {
            Ok(Box::new(LocalReader::new(file, size, self.buffer_size)))
        }
    }

    fn open_write(&self, path: &Path) -> Result<Box<dyn StorageWriter>> {
        let full_path = self.resolve_path(path);
        Self::ensure_parent(&full_path)?;

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&full_path)
            .map_err(|e| {
                StreamError::storage_with_source(&full_path, "failed to create file", e)
            })?;

        Ok(Box::new(LocalWriter::new(file, self.buffer_size, full_path)))
    }

    fn delete(&self, path: &Path) -> Result<()> {
        let full_path = self.resolve_path(path);

        if full_path.is_dir() {
            fs::remove_dir_all(&full_path).map_err(|e| {
                StreamError::storage_with_source(&full_path, "failed to delete directory", e)
            })
        } else {
            fs::remove_file(&full_path).map_err(|e| {
                StreamError::storage_with_source(&full_path, "failed to delete file", e)
            })
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let from_path = self.resolve_path(from);
        let to_path = self.resolve_path(to);
        Self::ensure_parent(&to_path)?;

        fs::rename(&from_path, &to_path).map_err(|e| {
            StreamError::storage_with_source(
                &from_path,
                format!("failed to rename to {}", to_path.display()),
                e,
            )
        })
    }

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        let full_path = self.resolve_path(path);
        fs::create_dir_all(&full_path).map_err(|e| {
            StreamError::storage_with_source(&full_path, "failed to create directories", e)
        })
    }
}

impl RemoteStore for LocalStorage {
    fn get(&self, path: &Path) -> Result<Bytes> {
        let mut reader = self.open_read(path)?;
        let mut buf = Vec::with_capacity(reader.size() as usize);
        reader.read_to_end(&mut buf).map_err(|e| {
            StreamError::storage_with_source(self.resolve_path(path), "failed to read file", e)
        })?;
        Ok(Bytes::from(buf))
    }

    fn exists(&self, path: &Path) -> Result<bool> {
        StorageBackend::exists(self, path)
    }

    fn location(&self) -> String {
        self.base_path.display().to_string()
    }
}

/// Buffered file reader for local storage.
struct LocalReader {
    reader: BufReader<File>,
    size: u64,
}

impl LocalReader {
    fn new(file: File, size: u64, buffer_size: usize) -> Self {
        Self {
            reader: BufReader::with_capacity(buffer_size, file),
            size,
        }
    }
}

impl Read for LocalReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl StorageReader for LocalReader {
    fn size(&self) -> u64 {
        self.size
    }
}

/// Reads a memory-mapped shard front to back.
struct MmapReader {
    mmap: Mmap,
    position: usize,
}

impl Read for MmapReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = &self.mmap[self.position.min(self.mmap.len())..];
        let n = buf.len().min(remaining.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.position += n;
        Ok(n)
    }
}

impl StorageReader for MmapReader {
    fn size(&self) -> u64 {
        self.mmap.len() as u64
    }
}

/// Buffered file writer for local storage.
struct LocalWriter {
    writer: BufWriter<File>,
    path: PathBuf,
}

impl LocalWriter {
    fn new(file: File, buffer_size: usize, path: PathBuf) -> Self {
        Self {
            writer: BufWriter::with_capacity(buffer_size, file),
            path,
        }
    }
}

impl Write for LocalWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl StorageWriter for LocalWriter {
    fn finish(mut self: Box<Self>) -> Result<()> {
        self.writer.flush().map_err(|e| {
            StreamError::storage_with_source(&self.path, "failed to flush writer", e)
        })?;

        self.writer.get_ref().sync_all().map_err(|e| {
            StreamError::storage_with_source(&self.path, "failed to sync file to disk", e)
        })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_storage() -> (LocalStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = StorageConfig {
            base_path: temp_dir.path().to_path_buf(),
            buffer_size: 4096,
            use_mmap: true,
            mmap_threshold: 1024, // Low threshold for testing
            ..Default::default()
        };
        let storage = LocalStorage::new(&config).unwrap();
        (storage, temp_dir)
    }

    fn write_file(storage: &LocalStorage, path: &str, data: &[u8]) {
        let mut writer = storage.open_write(Path::new(path)).unwrap();
        writer.write_all(data).unwrap();
        writer.finish().unwrap();
    }

    #[test]
    fn test_new_creates_base_dir() {
        let temp_dir = TempDir::new().unwrap();
        let new_base = temp_dir.path().join("new_subdir");

        let _storage = LocalStorage::open(&new_base).unwrap();
        assert!(new_base.exists());
    }

    #[test]
    fn test_write_and_get_small_file() {
        let (storage, _temp) = create_test_storage();
        write_file(&storage, "train/index.json", b"{}");

        assert!(StorageBackend::exists(&storage, Path::new("train/index.json")).unwrap());
        let bytes = storage.get(Path::new("train/index.json")).unwrap();
        assert_eq!(bytes.as_ref(), b"{}");
    }

    #[test]
    fn test_write_and_get_large_file_uses_mmap() {
        let (storage, _temp) = create_test_storage();
        let data: Vec<u8> = (0..2048).map(|i| (i % 256) as u8).collect();
        write_file(&storage, "large.bin", &data);

        let mut reader = storage.open_read(Path::new("large.bin")).unwrap();
        assert_eq!(reader.size(), 2048);
        let mut head = [0u8; 100];
        reader.read_exact(&mut head).unwrap();
        assert_eq!(&head[..], &data[..100]);

        assert_eq!(storage.get(Path::new("large.bin")).unwrap().as_ref(), data.as_slice());
    }

    #[test]
    fn test_get_missing_file() {
        let (storage, _temp) = create_test_storage();
        let err = storage.get(Path::new("missing.mds")).unwrap_err();
        assert!(err.is_transient());
        assert!(!RemoteStore::exists(&storage, Path::new("missing.mds")).unwrap());
    }

    #[test]
    fn test_rename_creates_parent_dirs() {
        let (storage, _temp) = create_test_storage();
        write_file(&storage, ".index.json.tmp", b"{}");

        storage
            .rename(Path::new(".index.json.tmp"), Path::new("val/index.json"))
            .unwrap();

        assert!(!StorageBackend::exists(&storage, Path::new(".index.json.tmp")).unwrap());
        assert!(StorageBackend::exists(&storage, Path::new("val/index.json")).unwrap());
    }

    #[test]
    fn test_delete() {
        let (storage, _temp) = create_test_storage();
        write_file(&storage, "dir/file.txt", b"x");

        storage.delete(Path::new("dir/file.txt")).unwrap();
        assert!(!StorageBackend::exists(&storage, Path::new("dir/file.txt")).unwrap());
        assert!(storage.delete(Path::new("dir/file.txt")).is_err());

        storage.delete(Path::new("dir")).unwrap();
        assert!(!StorageBackend::exists(&storage, Path::new("dir")).unwrap());
    }

    #[test]
    fn test_overwrite_file() {
        let (storage, _temp) = create_test_storage();
        write_file(&storage, "file.txt", b"initial");
        write_file(&storage, "file.txt", b"new");
        assert_eq!(storage.get(Path::new("file.txt")).unwrap().as_ref(), b"new");
    }

    #[test]
    fn test_object_safety() {
        let (storage, _temp) = create_test_storage();
        let backend: Box<dyn StorageBackend> = Box::new(storage.clone());
        let remote: Box<dyn RemoteStore> = Box::new(storage);

        let mut writer = backend.open_write(Path::new("test.txt")).unwrap();
        writer.write_all(b"hello").unwrap();
        writer.finish().unwrap();

        assert!(remote.exists(Path::new("test.txt")).unwrap());
    }
}
