// rust/pipeline-core/src/dataset/source.rs

//! Batch sources backing a phase dataset.

use std::path::Path;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::layout::RecordKind;
use super::partition::ShardAssignment;
use super::traits::{Batch, BatchOrigin, BatchSource, Phase, DENSE_FEATURE_COUNT, SPARSE_FEATURE_COUNT};
use crate::error::{PipelineError, Result};
use crate::storage::StorageBackend;

/// Location of one batch: a row range inside a single slice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSpec {
    /// Index into the assignment's slices.
    pub slice: usize,
    /// First row, relative to the start of the slice's files.
    pub row_start: u64,
    pub rows: usize,
}

/// Cuts every slice into `ceil(rows / batch_size)` batches.
///
/// A batch never spans two slices, so the last batch of each slice may be
/// short.
pub fn plan_batches(assignment: &ShardAssignment, batch_size: usize) -> Vec<BatchSpec> {
    let batch_size = batch_size as u64;
    let mut specs = Vec::new();
    for (slice_idx, slice) in assignment.slices.iter().enumerate() {
        let mut row = slice.row_start;
        while row < slice.row_end {
            let rows = batch_size.min(slice.row_end - row);
            specs.push(BatchSpec {
                slice: slice_idx,
                row_start: row,
                rows: rows as usize,
            });
            row += rows;
        }
    }
    specs
}

fn check_hash_sizes(hash_sizes: &[u32]) -> Result<()> {
    if hash_sizes.len() != SPARSE_FEATURE_COUNT {
        return Err(PipelineError::config(format!(
            "expected {} hash sizes, got {}",
            SPARSE_FEATURE_COUNT,
            hash_sizes.len()
        )));
    }
    if hash_sizes.contains(&0) {
        return Err(PipelineError::config("hash sizes must be greater than 0"));
    }
    Ok(())
}

/// Reads the batches of one shard assignment through a storage backend.
pub struct ShardBatchSource {
    storage: Arc<dyn StorageBackend>,
    assignment: ShardAssignment,
    batches: Vec<BatchSpec>,
    hash_sizes: Vec<u32>,
}

impl ShardBatchSource {
    /// # Errors
    ///
    /// Returns a configuration error for a zero batch size or a hash size
    /// list that does not cover every categorical feature.
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        assignment: ShardAssignment,
        batch_size: usize,
        hash_sizes: Vec<u32>,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(PipelineError::config("batch_size must be greater than 0"));
        }
        check_hash_sizes(&hash_sizes)?;

        let batches = plan_batches(&assignment, batch_size);
        Ok(Self {
            storage,
            assignment,
            batches,
            hash_sizes,
        })
    }

    pub fn assignment(&self) -> &ShardAssignment {
        &self.assignment
    }

    pub fn batch_specs(&self) -> &[BatchSpec] {
        &self.batches
    }

    fn read_rows(&self, file: &str, kind: RecordKind, spec: &BatchSpec) -> Result<Vec<u8>> {
        let path = Path::new(file);
        let start = spec.row_start * kind.row_bytes();
        let length = spec.rows * kind.row_bytes() as usize;

        let mut reader = self.storage.open_read(path)?;
        let data = reader.read_range(start, length)?;
        if data.len() != length {
            return Err(PipelineError::storage(
                path,
                format!("short read: expected {length} bytes at offset {start}, got {}", data.len()),
            ));
        }
        Ok(data)
    }
}

impl BatchSource for ShardBatchSource {
    fn phase(&self) -> Phase {
        self.assignment.phase
    }

    fn num_batches(&self) -> Option<usize> {
        Some(self.batches.len())
    }

    fn load(&self, index: usize) -> Result<Batch> {
        let spec = self.batches.get(index).ok_or_else(|| {
            PipelineError::dataset(
                self.assignment.phase.as_str(),
                format!("batch {index} out of range ({} batches)", self.batches.len()),
            )
        })?;
        let group = &self.assignment.slices[spec.slice].group;

        let dense = self.read_rows(&group.dense, RecordKind::Dense, spec)?;
        let sparse = self.read_rows(&group.sparse, RecordKind::Sparse, spec)?;
        let labels = self.read_rows(&group.labels, RecordKind::Labels, spec)?;

        let sparse = sparse
            .chunks_exact(4)
            .enumerate()
            .map(|(i, b)| {
                let id = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
                id % self.hash_sizes[i % SPARSE_FEATURE_COUNT]
            })
            .collect();

        Ok(Batch {
            origin: BatchOrigin {
                phase: self.assignment.phase,
                index,
            },
            num_rows: spec.rows,
            dense: decode_f32(&dense),
            sparse,
            labels: decode_f32(&labels),
        })
    }
}

fn decode_f32(data: &[u8]) -> Vec<f32> {
    data.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Generates random batches, like a random recommendation dataset.
///
/// Each batch is drawn from its own RNG seeded by `(seed, phase, index)`,
/// so any index can be loaded from any thread and always yields the same
/// batch. The source is unbounded.
pub struct SyntheticBatchSource {
    phase: Phase,
    batch_size: usize,
    hash_sizes: Vec<u32>,
    seed: u64,
}

impl SyntheticBatchSource {
    /// # Errors
    ///
    /// Same as [`ShardBatchSource::new`].
    pub fn new(phase: Phase, batch_size: usize, hash_sizes: Vec<u32>, seed: u64) -> Result<Self> {
        if batch_size == 0 {
            return Err(PipelineError::config("batch_size must be greater than 0"));
        }
        check_hash_sizes(&hash_sizes)?;
        Ok(Self {
            phase,
            batch_size,
            hash_sizes,
            seed,
        })
    }

    fn batch_seed(&self, index: usize) -> u64 {
        let salt: u64 = match self.phase {
            Phase::Train => 0x7472_6169_6e00_0000,
            Phase::Validate => 0x7661_6c00_0000_0000,
            Phase::Test => 0x7465_7374_0000_0000,
        };
        self.seed ^ salt ^ (index as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
    }
}

impl BatchSource for SyntheticBatchSource {
    fn phase(&self) -> Phase {
        self.phase
    }

    fn num_batches(&self) -> Option<usize> {
        None
    }

    fn load(&self, index: usize) -> Result<Batch> {
        let mut rng = StdRng::seed_from_u64(self.batch_seed(index));
        let rows = self.batch_size;

        let dense = (0..rows * DENSE_FEATURE_COUNT)
            .map(|_| rng.random::<f32>())
            .collect();
        let sparse = (0..rows * SPARSE_FEATURE_COUNT)
            .map(|i| rng.random_range(0..self.hash_sizes[i % SPARSE_FEATURE_COUNT]))
            .collect();
        let labels = (0..rows)
            .map(|_| if rng.random_bool(0.5) { 1.0 } else { 0.0 })
            .collect();

        Ok(Batch {
            origin: BatchOrigin {
                phase: self.phase,
                index,
            },
            num_rows: rows,
            dense,
            sparse,
            labels,
        })
    }
}
