// rust/pipeline-core/src/dataset/mod.rs

//! Phase-aware dataset partitioning and batch iteration.
//!
//! A dataset directory is discovered into a [`DatasetLayout`], split per
//! phase and rank by the [`ShardPartitioner`], and wrapped into a
//! restartable [`PhaseDataset`] whose every `iter()` call starts a fresh
//! traversal.
//!
//! # Example
//!
//! ```ignore
//! use pipeline_core::dataset::{
//!     DatasetLayout, Phase, PhaseDataset, SequenceConfig, ShardBatchSource, ShardPartitioner,
//!     Topology,
//! };
//! use std::sync::Arc;
//!
//! let layout = DatasetLayout::discover(storage.as_ref())?;
//! let partitioner = ShardPartitioner::new(Topology::new(rank, world_size)?);
//! let assignment = partitioner.assign(&layout, Phase::Validate)?;
//!
//! let source = ShardBatchSource::new(storage.clone(), assignment, 2048, hash_sizes)?;
//! let dataset = PhaseDataset::new(Arc::new(source), SequenceConfig::default());
//!
//! for batch in dataset.iter() {
//!     let batch = batch?;
//!     // Feed the batch to the engine
//! }
//! ```

mod iterator;
mod layout;
mod partition;
mod prefetch;
mod source;
mod traits;

pub use iterator::{BatchOrder, PhaseDataset, PhaseSequence, SequenceConfig};
pub use layout::{parse_day, parse_file_name, DatasetLayout, FileGroup, RecordKind};
pub use partition::{
    partition_rows, FileSlice, ShardAssignment, ShardKey, ShardPartitioner, Topology, MAX_WORLD_SIZE,
};
pub use prefetch::PrefetchingSequence;
pub use source::{plan_batches, BatchSpec, ShardBatchSource, SyntheticBatchSource};
pub use traits::{
    Batch, BatchOrigin, BatchSource, Phase, DENSE_FEATURE_COUNT, SPARSE_FEATURE_COUNT,
};
