// rust/pipeline-core/src/config.rs

//! Configuration management for the phased training driver.
//!
//! This module provides configuration parsing from TOML files, environment
//! variable overrides, and validation of configuration values.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::dataset::{Phase, MAX_WORLD_SIZE, SPARSE_FEATURE_COUNT};
use crate::error::{PipelineError, Result};

/// Per-phase batch limit applied in synthetic mode when none is configured.
pub const SYNTHETIC_DEFAULT_LIMIT: usize = 10;

// Top-level trainer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    pub training: TrainingConfig,
    pub dataset: DatasetConfig,
    pub storage: StorageConfig,
    pub distributed: DistributedConfig,
}

/// Epoch and per-phase limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Number of train/validate rounds before the final test phase.
    pub epochs: usize,
    /// Rows per batch.
    pub batch_size: usize,
    /// Maximum number of train results per epoch (unlimited when unset).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_train_batches: Option<usize>,
    /// Maximum number of validation results per epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_val_batches: Option<usize>,
    /// Maximum number of test results.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_test_batches: Option<usize>,
    /// Emit a debug line every N train steps.
    pub log_every_n_steps: usize,
}

/// Dataset source options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Directory of `day_<d>_<kind>` files. Synthetic data is generated when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Hash size used for every categorical feature.
    pub num_embeddings: u32,
    /// Per-feature hash sizes; overrides `num_embeddings` when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_embeddings_per_feature: Option<Vec<u32>>,
    // Whether to shuffle batch order within each traversal.
    pub shuffle_batches: bool,
    // Optional seed for reproducible shuffling and synthetic data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
    // Number of prefetch worker threads per phase sequence (0 loads inline).
    pub num_workers: usize,
    // Batches each prefetch worker may hold ahead of the consumer.
    pub prefetch_batches: usize,
}

// Storage configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    // Buffer size in bytes for I/O operations.
    pub buffer_size: usize,
    // Whether to use memory-mapped I/O.
    pub use_mmap: bool,
    // File size threshold (bytes) above which to use mmap.
    pub mmap_threshold: u64,
}

/// Process-group topology for this worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DistributedConfig {
    pub rank: usize,
    pub world_size: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 1,
            batch_size: 32,
            limit_train_batches: None,
            limit_val_batches: None,
            limit_test_batches: None,
            log_every_n_steps: 100,
        }
    }
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            path: None,
            num_embeddings: 100_000,
            num_embeddings_per_feature: None,
            shuffle_batches: false,
            seed: None,
            num_workers: 2,
            prefetch_batches: 2,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            buffer_size: 64 * 1024,      // 64 KB
            use_mmap: true,
            mmap_threshold: 1024 * 1024, // 1 MB
        }
    }
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }
}

impl DatasetConfig {
    /// True when batches are generated rather than read from disk.
    pub fn is_synthetic(&self) -> bool {
        self.path.is_none()
    }

    /// Hash sizes for all categorical features.
    pub fn hash_sizes(&self) -> Vec<u32> {
        match &self.num_embeddings_per_feature {
            Some(sizes) => sizes.clone(),
            None => vec![self.num_embeddings; SPARSE_FEATURE_COUNT],
        }
    }
}

impl FromStr for TrainerConfig {
    type Err = PipelineError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| PipelineError::config_with_source("failed to parse TOML config", e))
    }
}

impl TrainerConfig {
    // Load configuration from a TOML file.
    //
    // # Errors
    //
    // Returns an error if the file cannot be read, parsed, or is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PipelineError::storage_with_source(path, "failed to read config file", e)
        })?;
        let config: Self = content.parse()?;
        config.validate()?;
        Ok(config)
    }

    // Apply environment variable overrides.
    //
    // Environment variables are prefixed with `DLRM_` and use underscores
    // to separate nested fields. For example:
    // - `DLRM_TRAINING_EPOCHS` overrides `training.epochs`
    // - `DLRM_DATASET_PATH` overrides `dataset.path`
    // - `DLRM_DATASET_SHUFFLE_BATCHES` overrides `dataset.shuffle_batches`
    // - `DLRM_DISTRIBUTED_RANK` overrides `distributed.rank`
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Training overrides
        if let Ok(val) = std::env::var("DLRM_TRAINING_EPOCHS") {
            if let Ok(v) = val.parse() {
                self.training.epochs = v;
            }
        }
        if let Ok(val) = std::env::var("DLRM_TRAINING_BATCH_SIZE") {
            if let Ok(v) = val.parse() {
                self.training.batch_size = v;
            }
        }
        if let Ok(val) = std::env::var("DLRM_TRAINING_LIMIT_TRAIN_BATCHES") {
            if let Ok(v) = val.parse() {
                self.training.limit_train_batches = Some(v);
            }
        }
        if let Ok(val) = std::env::var("DLRM_TRAINING_LIMIT_VAL_BATCHES") {
            if let Ok(v) = val.parse() {
                self.training.limit_val_batches = Some(v);
            }
        }
        if let Ok(val) = std::env::var("DLRM_TRAINING_LIMIT_TEST_BATCHES") {
            if let Ok(v) = val.parse() {
                self.training.limit_test_batches = Some(v);
            }
        }

        // Dataset overrides
        if let Ok(val) = std::env::var("DLRM_DATASET_PATH") {
            self.dataset.path = Some(PathBuf::from(val));
        }
        if let Ok(val) = std::env::var("DLRM_DATASET_SHUFFLE_BATCHES") {
            if let Ok(v) = val.parse() {
                self.dataset.shuffle_batches = v;
            }
        }
        if let Ok(val) = std::env::var("DLRM_DATASET_SEED") {
            if let Ok(v) = val.parse() {
                self.dataset.seed = Some(v);
            }
        }
        if let Ok(val) = std::env::var("DLRM_DATASET_NUM_WORKERS") {
            if let Ok(v) = val.parse() {
                self.dataset.num_workers = v;
            }
        }

        // Storage overrides
        if let Ok(val) = std::env::var("DLRM_STORAGE_USE_MMAP") {
            if let Ok(v) = val.parse() {
                self.storage.use_mmap = v;
            }
        }

        // Distributed overrides
        if let Ok(val) = std::env::var("DLRM_DISTRIBUTED_RANK") {
            if let Ok(v) = val.parse() {
                self.distributed.rank = v;
            }
        }
        if let Ok(val) = std::env::var("DLRM_DISTRIBUTED_WORLD_SIZE") {
            if let Ok(v) = val.parse() {
                self.distributed.world_size = v;
            }
        }

        self
    }

    /// Returns the batch limit for `phase`.
    ///
    /// Synthetic data never runs out, so an unset limit falls back to
    /// [`SYNTHETIC_DEFAULT_LIMIT`] in that mode.
    pub fn phase_limit(&self, phase: Phase) -> Option<usize> {
        let limit = match phase {
            Phase::Train => self.training.limit_train_batches,
            Phase::Validate => self.training.limit_val_batches,
            Phase::Test => self.training.limit_test_batches,
        };
        if self.dataset.is_synthetic() {
            Some(limit.unwrap_or(SYNTHETIC_DEFAULT_LIMIT))
        } else {
            limit
        }
    }

    // Validate all configuration values.
    //
    // # Errors
    //
    // Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        // Training validation
        if self.training.epochs == 0 {
            return Err(PipelineError::config(
                "training.epochs must be greater than 0",
            ));
        }
        if self.training.batch_size == 0 {
            return Err(PipelineError::config(
                "training.batch_size must be greater than 0",
            ));
        }
        if self.training.log_every_n_steps == 0 {
            return Err(PipelineError::config(
                "training.log_every_n_steps must be greater than 0",
            ));
        }

        // Dataset validation
        if let Some(sizes) = &self.dataset.num_embeddings_per_feature {
            if sizes.len() != SPARSE_FEATURE_COUNT {
                return Err(PipelineError::config(format!(
                    "dataset.num_embeddings_per_feature must have {} entries, got {}",
                    SPARSE_FEATURE_COUNT,
                    sizes.len()
                )));
            }
        }
        if self.dataset.hash_sizes().iter().any(|&size| size == 0) {
            return Err(PipelineError::config(
                "dataset embedding hash sizes must be greater than 0",
            ));
        }
        if self.dataset.num_workers > 0 && self.dataset.prefetch_batches == 0 {
            return Err(PipelineError::config(
                "dataset.prefetch_batches must be greater than 0 when prefetching",
            ));
        }

        // Storage validation
        if self.storage.buffer_size == 0 {
            return Err(PipelineError::config(
                "storage.buffer_size must be greater than 0",
            ));
        }

        // Distributed validation
        if self.distributed.world_size == 0 {
            return Err(PipelineError::config(
                "distributed.world_size must be greater than 0",
            ));
        }
        if self.distributed.world_size > MAX_WORLD_SIZE as usize {
            return Err(PipelineError::config(format!(
                "distributed.world_size {} exceeds the maximum of {MAX_WORLD_SIZE}",
                self.distributed.world_size
            )));
        }
        if self.distributed.rank >= self.distributed.world_size {
            return Err(PipelineError::config(format!(
                "distributed.rank {} must be less than world_size {}",
                self.distributed.rank, self.distributed.world_size
            )));
        }

        Ok(())
    }
}
