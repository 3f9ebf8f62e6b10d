// rust/pipeline-core/src/dataset/traits.rs

use std::fmt;
use std::str::FromStr;

use crate::error::{PipelineError, Result};

/// Dense (integer-valued, stored as `f32`) features per row.
pub const DENSE_FEATURE_COUNT: usize = 13;

/// Categorical id features per row.
pub const SPARSE_FEATURE_COUNT: usize = 26;

/// One logically distinct pass over disjoint data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Train,
    Validate,
    Test,
}

impl Phase {
    pub const ALL: [Phase; 3] = [Phase::Train, Phase::Validate, Phase::Test];

    /// Short stage name used in logs and reports ("train", "val", "test").
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Train => "train",
            Phase::Validate => "val",
            Phase::Test => "test",
        }
    }

    /// Whether the phase reports metrics instead of updating the model.
    pub fn is_eval(&self) -> bool {
        !matches!(self, Phase::Train)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "train" => Ok(Phase::Train),
            "val" | "validate" | "validation" => Ok(Phase::Validate),
            "test" => Ok(Phase::Test),
            _ => Err(PipelineError::config(format!(
                "supplied phase was '{s}'. Must be one of train, val, test"
            ))),
        }
    }
}

/// Where a batch came from: its phase and its index within that phase's
/// unshuffled batch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BatchOrigin {
    pub phase: Phase,
    pub index: usize,
}

/// A batch of training rows.
///
/// Feature buffers are row-major: `dense` holds `num_rows *
/// DENSE_FEATURE_COUNT` values, `sparse` holds `num_rows *
/// SPARSE_FEATURE_COUNT` ids and `labels` one value per row.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub origin: BatchOrigin,
    pub num_rows: usize,
    pub dense: Vec<f32>,
    pub sparse: Vec<u32>,
    pub labels: Vec<f32>,
}

impl Batch {
    /// Dense features of row `row`.
    pub fn dense_row(&self, row: usize) -> &[f32] {
        &self.dense[row * DENSE_FEATURE_COUNT..(row + 1) * DENSE_FEATURE_COUNT]
    }

    /// Categorical ids of row `row`.
    pub fn sparse_row(&self, row: usize) -> &[u32] {
        &self.sparse[row * SPARSE_FEATURE_COUNT..(row + 1) * SPARSE_FEATURE_COUNT]
    }
}

/// Produces the batches of one phase shard by index.
///
/// Implementations must be deterministic: loading the same index twice
/// yields the same batch. Prefetch workers call `load` concurrently.
pub trait BatchSource: Send + Sync {
    /// The phase this source serves.
    fn phase(&self) -> Phase;

    /// Number of batches in the shard, or `None` for an unbounded source.
    fn num_batches(&self) -> Option<usize>;

    /// Loads batch `index` of the unshuffled order.
    fn load(&self, index: usize) -> Result<Batch>;
}
