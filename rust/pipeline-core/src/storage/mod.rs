// rust/pipeline-core/src/storage/mod.rs

//! Storage abstraction for reading the training dataset.
//!
//! The dataset layer talks to storage through [`StorageBackend`], so tests
//! can substitute an in-memory backend and the trainer can use
//! [`LocalStorage`] over a dataset directory.
//!
//! # Example
//!
//! ```no_run
//! use pipeline_core::config::StorageConfig;
//! use pipeline_core::storage::{LocalStorage, StorageBackend};
//! use std::path::Path;
//!
//! let storage = LocalStorage::new("/data/criteo", &StorageConfig::default()).unwrap();
//! for name in storage.list(Path::new("")).unwrap() {
//!     println!("{name}");
//! }
//! ```

mod local;
mod traits;

pub use local::LocalStorage;
pub use traits::{ObjectMeta, StorageBackend, StorageReader};
