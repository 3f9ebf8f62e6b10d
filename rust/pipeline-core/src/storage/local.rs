// rust/pipeline-core/src/storage/local.rs

//! Local filesystem storage backend.
//!
//! Small files are read through a buffered reader; files above the
//! configured threshold are memory-mapped, which is the common case for
//! the per-day record arrays.

use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use super::traits::{ObjectMeta, StorageBackend, StorageReader};
use crate::config::StorageConfig;
use crate::error::{PipelineError, Result};

/// Local filesystem storage backend rooted at a dataset directory.
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
    /// Creates a new `LocalStorage` rooted at `base_path`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the base path is not an existing
    /// directory. The dataset is never created on demand.
    pub fn new(base_path: impl Into<PathBuf>, config: &StorageConfig) -> Result<Self> {
        let base_path = base_path.into();

        if !base_path.is_dir() {
            return Err(PipelineError::config(format!(
                "dataset directory '{}' does not exist",
                base_path.display()
            )));
        }

        Ok(Self {
            base_path,
            buffer_size: config.buffer_size,
            use_mmap: config.use_mmap,
            mmap_threshold: config.mmap_threshold,
        })
    }

    /// Returns the directory this backend is rooted at.
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
}

impl StorageBackend for LocalStorage {
    fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.resolve_path(path).exists())
    }

    fn metadata(&self, path: &Path) -> Result<ObjectMeta> {
        let full_path = self.resolve_path(path);
        let meta = fs::metadata(&full_path).map_err(|e| {
            PipelineError::storage_with_source(&full_path, "failed to read metadata", e)
        })?;

        Ok(ObjectMeta {
            size: meta.len(),
            modified: meta.modified().ok(),
            is_dir: meta.is_dir(),
        })
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageReader>> {
        let full_path = self.resolve_path(path);
        let file = File::open(&full_path)
            .map_err(|e| PipelineError::storage_with_source(&full_path, "failed to open file", e))?;

        let size = file
            .metadata()
            .map_err(|e| {
                PipelineError::storage_with_source(&full_path, "failed to read file metadata", e)
            })?
            .len();

        if self.use_mmap && size >= self.mmap_threshold {
            // SAFETY: the file is opened read-only and the dataset is not
            // modified while a run is in progress.
            let mmap = unsafe { Mmap::map(&file) }.map_err(|e| {
                PipelineError::storage_with_source(&full_path, "failed to memory-map file", e)
            })?;

            Ok(Box::new(MmapReader::new(mmap, full_path)))
        } else {
            Ok(Box::new(LocalReader::new(file, size, self.buffer_size, full_path)))
        }
    }

    fn list(&self, prefix: &Path) -> Result<Vec<String>> {
        let full_path = self.resolve_path(prefix);

        if !full_path.exists() {
            return Ok(Vec::new());
        }

        if !full_path.is_dir() {
            return Err(PipelineError::storage(&full_path, "path is not a directory"));
        }

        let mut entries = Vec::new();

        for entry in fs::read_dir(&full_path).map_err(|e| {
            PipelineError::storage_with_source(&full_path, "failed to read directory", e)
        })? {
            let entry = entry.map_err(|e| {
                PipelineError::storage_with_source(&full_path, "failed to read directory entry", e)
            })?;

            if let Some(name) = entry.file_name().to_str() {
                entries.push(name.to_string());
            }
        }

        entries.sort();
        Ok(entries)
    }
}

/// Buffered file reader for local storage.
struct LocalReader {
    reader: BufReader<File>,
    size: u64,
    path: PathBuf,
}

impl LocalReader {
    fn new(file: File, size: u64, buffer_size: usize, path: PathBuf) -> Self {
        Self {
            reader: BufReader::with_capacity(buffer_size, file),
            size,
            path,
        }
    }
}

impl Read for LocalReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for LocalReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.reader.seek(pos)
    }
}

impl StorageReader for LocalReader {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_range(&mut self, start: u64, length: usize) -> Result<Vec<u8>> {
        self.seek(SeekFrom::Start(start)).map_err(|e| {
            PipelineError::storage_with_source(
                &self.path,
                format!("failed to seek to position {start}"),
                e,
            )
        })?;

        let mut buf = vec![0u8; length];
        self.read_exact(&mut buf).map_err(|e| {
            PipelineError::storage_with_source(
                &self.path,
                format!("failed to read {length} bytes at position {start}"),
                e,
            )
        })?;

        Ok(buf)
    }
}

/// Memory-mapped file reader for local storage.
struct MmapReader {
    mmap: Mmap,
    position: u64,
    path: PathBuf,
}

impl MmapReader {
    fn new(mmap: Mmap, path: PathBuf) -> Self {
        Self {
            mmap,
            position: 0,
            path,
        }
    }
}

impl Read for MmapReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let pos = (self.position as usize).min(self.mmap.len());
        let remaining = &self.mmap[pos..];
        let to_read = buf.len().min(remaining.len());

        buf[..to_read].copy_from_slice(&remaining[..to_read]);
        self.position += to_read as u64;
        Ok(to_read)
    }
}

impl Seek for MmapReader {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => self.mmap.len() as i64 + offset,
            SeekFrom::Current(offset) => self.position as i64 + offset,
        };

        if new_pos < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek to negative position",
            ));
        }

        self.position = new_pos as u64;
        Ok(self.position)
    }
}

impl StorageReader for MmapReader {
    fn size(&self) -> u64 {
        self.mmap.len() as u64
    }

    fn read_range(&mut self, start: u64, length: usize) -> Result<Vec<u8>> {
        let start = start as usize;
        let end = start + length;

        if end > self.mmap.len() {
            return Err(PipelineError::storage(
                &self.path,
                format!(
                    "read range {}..{} exceeds file size {}",
                    start,
                    end,
                    self.mmap.len()
                ),
            ));
        }

        Ok(self.mmap[start..end].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_storage() -> (LocalStorage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = StorageConfig {
            buffer_size: 4096,
            use_mmap: true,
            mmap_threshold: 1024, // Low threshold for testing
        };
        let storage = LocalStorage::new(temp_dir.path(), &config).unwrap();
        (storage, temp_dir)
    }

    fn write_file(temp_dir: &TempDir, name: &str, data: &[u8]) {
        std::fs::write(temp_dir.path().join(name), data).unwrap();
    }

    #[test]
    fn test_new_rejects_missing_dir() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("nope");

        let result = LocalStorage::new(&missing, &StorageConfig::default());
        assert!(matches!(result, Err(PipelineError::Config { .. })));
    }

    #[test]
    fn test_exists_and_metadata() {
        let (storage, temp) = create_test_storage();
        assert!(!storage.exists(Path::new("day_0_dense.bin")).unwrap());

        write_file(&temp, "day_0_dense.bin", b"hello world");

        assert!(storage.exists(Path::new("day_0_dense.bin")).unwrap());
        let meta = storage.metadata(Path::new("day_0_dense.bin")).unwrap();
        assert_eq!(meta.size, 11);
        assert!(!meta.is_dir);
    }

    #[test]
    fn test_metadata_not_found() {
        let (storage, _temp) = create_test_storage();
        assert!(storage.metadata(Path::new("nonexistent.bin")).is_err());
    }

    #[test]
    fn test_read_range_small_file() {
        let (storage, temp) = create_test_storage();
        write_file(&temp, "small.bin", b"0123456789");

        let mut reader = storage.open_read(Path::new("small.bin")).unwrap();
        assert_eq!(reader.size(), 10);
        assert_eq!(reader.read_range(3, 4).unwrap(), b"3456");
    }

    #[test]
    fn test_read_range_large_file() {
        let (storage, temp) = create_test_storage();
        let data: Vec<u8> = (0..2048).map(|i| (i % 256) as u8).collect();
        write_file(&temp, "large.bin", &data);

        // Above the threshold, so this goes through the mmap reader
        let mut reader = storage.open_read(Path::new("large.bin")).unwrap();
        assert_eq!(reader.read_range(1000, 24).unwrap(), &data[1000..1024]);

        let mut all = Vec::new();
        reader.seek(SeekFrom::Start(0)).unwrap();
        reader.read_to_end(&mut all).unwrap();
        assert_eq!(all, data);
    }

    #[test]
    fn test_read_range_out_of_bounds() {
        let (storage, temp) = create_test_storage();
        write_file(&temp, "large.bin", &vec![0u8; 2048]);

        let mut reader = storage.open_read(Path::new("large.bin")).unwrap();
        assert!(reader.read_range(2040, 16).is_err());
    }

    #[test]
    fn test_mmap_disabled() {
        let temp = TempDir::new().unwrap();
        let config = StorageConfig {
            use_mmap: false,
            mmap_threshold: 1024,
            ..Default::default()
        };
        let storage = LocalStorage::new(temp.path(), &config).unwrap();
        write_file(&temp, "large.bin", &vec![7u8; 4096]);

        let mut reader = storage.open_read(Path::new("large.bin")).unwrap();
        assert_eq!(reader.read_range(4090, 6).unwrap(), vec![7u8; 6]);
    }

    #[test]
    fn test_list_sorted() {
        let (storage, temp) = create_test_storage();
        write_file(&temp, "day_1_dense.bin", b"");
        write_file(&temp, "day_0_dense.bin", b"");
        write_file(&temp, "day_0_labels.bin", b"");

        let entries = storage.list(Path::new("")).unwrap();
        assert_eq!(
            entries,
            vec!["day_0_dense.bin", "day_0_labels.bin", "day_1_dense.bin"]
        );
    }

    #[test]
    fn test_list_nonexistent() {
        let (storage, _temp) = create_test_storage();
        assert!(storage.list(Path::new("missing")).unwrap().is_empty());
    }

    #[test]
    fn test_object_safety() {
        let (storage, _temp) = create_test_storage();
        let _boxed: Box<dyn StorageBackend> = Box::new(storage);
    }
}
