// rust/pipeline-core/src/storage/traits.rs

//! Storage abstraction traits for reading training data.
//!
//! The dataset is assumed to be locally available and immutable for the
//! duration of a run, so only the read side is modelled.

use std::io::{Read, Seek};
use std::path::Path;

use crate::error::Result;

/// Metadata about a stored object.
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    /// Size of the object in bytes.
    pub size: u64,
    /// Last modification time, if available.
    pub modified: Option<std::time::SystemTime>,
    /// Whether this object is a directory.
    pub is_dir: bool,
}

/// A handle for reading from storage.
///
/// This trait extends `Read` and `Seek` with additional methods for
/// efficient random access.
pub trait StorageReader: Read + Seek + Send {
    /// Returns the total size of the object in bytes.
    fn size(&self) -> u64;

    /// Reads a range of bytes from the object.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails or the range is out of bounds.
    fn read_range(&mut self, start: u64, length: usize) -> Result<Vec<u8>>;
}

/// The storage backend the dataset layer reads through.
///
/// # Object Safety
///
/// This trait is object-safe and is shared as `Arc<dyn StorageBackend>`
/// between the driver thread and prefetch workers.
pub trait StorageBackend: Send + Sync {
    /// Checks if an object exists at the given path.
    fn exists(&self, path: &Path) -> Result<bool>;

    /// Retrieves metadata for an object.
    ///
    /// # Errors
    ///
    /// Returns an error if the object doesn't exist or metadata cannot be read.
    fn metadata(&self, path: &Path) -> Result<ObjectMeta>;

    /// Opens an object for reading.
    ///
    /// # Errors
    ///
    /// Returns an error if the object doesn't exist or cannot be opened.
    fn open_read(&self, path: &Path) -> Result<Box<dyn StorageReader>>;

    /// Lists the entries under `prefix`, sorted by name.
    ///
    /// # Errors
    ///
    /// Returns an error if the listing fails.
    fn list(&self, prefix: &Path) -> Result<Vec<String>>;
}
