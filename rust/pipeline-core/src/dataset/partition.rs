// rust/pipeline-core/src/dataset/partition.rs

//! Phase-aware partitioning of dataset rows across worker ranks.
//!
//! Every phase concatenates the rows of its file groups (ordered by day)
//! and cuts them into `group_count` contiguous ranges. The slot a worker
//! reads is its [`ShardKey`]:
//!
//! | phase    | group_index         | group_count    |
//! |----------|---------------------|----------------|
//! | train    | `rank`              | `world_size`   |
//! | validate | `rank`              | `2*world_size` |
//! | test     | `rank + world_size` | `2*world_size` |
//!
//! Validation and test share the final day: the doubled slot count splits
//! its rows in two halves, validation taking slots `0..world_size` and test
//! the remaining ones, while every real worker still gets one slot of each.

use tracing::{debug, warn};

use super::layout::{DatasetLayout, FileGroup};
use super::traits::Phase;
use crate::error::{PipelineError, Result};

/// Largest supported world size. Validate and Test split the final day
/// into `2 * world_size` slots, which must fit a `u32`.
pub const MAX_WORLD_SIZE: u32 = u32::MAX / 2;

/// Rank and size of the real process group, fixed for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    rank: u32,
    world_size: u32,
}

impl Topology {
    /// # Errors
    ///
    /// Returns a configuration error unless `rank < world_size` and
    /// `world_size <= MAX_WORLD_SIZE`.
    pub fn new(rank: u32, world_size: u32) -> Result<Self> {
        if world_size == 0 {
            return Err(PipelineError::config("world_size must be greater than 0"));
        }
        if world_size > MAX_WORLD_SIZE {
            return Err(PipelineError::config(format!(
                "world_size {world_size} exceeds the maximum of {MAX_WORLD_SIZE}"
            )));
        }
        if rank >= world_size {
            return Err(PipelineError::config(format!(
                "rank {rank} out of range for world_size {world_size}"
            )));
        }
        Ok(Self { rank, world_size })
    }

    /// A single-process topology.
    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn world_size(&self) -> u32 {
        self.world_size
    }
}

/// The partition slot a worker reads for one phase, distinct from the
/// process topology it was derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardKey {
    pub group_index: u32,
    pub group_count: u32,
}

impl ShardKey {
    pub fn for_phase(phase: Phase, topology: Topology) -> Self {
        match phase {
            Phase::Train => Self {
                group_index: topology.rank,
                group_count: topology.world_size,
            },
            Phase::Validate => Self {
                group_index: topology.rank,
                group_count: topology.world_size * 2,
            },
            Phase::Test => Self {
                group_index: topology.rank + topology.world_size,
                group_count: topology.world_size * 2,
            },
        }
    }

    /// Half-open row range `[start, end)` of this slot out of `total_rows`.
    ///
    /// The first `total_rows % group_count` slots get one extra row.
    pub fn row_range(&self, total_rows: u64) -> (u64, u64) {
        let count = self.group_count as u64;
        let index = self.group_index as u64;
        let per_slot = total_rows / count;
        let remainder = total_rows % count;

        let start = index * per_slot + index.min(remainder);
        let extra = if index < remainder { 1 } else { 0 };
        (start, start + per_slot + extra)
    }
}

/// A contiguous row range of one file group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSlice {
    pub group: FileGroup,
    pub row_start: u64,
    pub row_end: u64,
}

impl FileSlice {
    pub fn rows(&self) -> u64 {
        self.row_end - self.row_start
    }
}

/// The slices one worker reads for one phase, in day order.
#[derive(Debug, Clone)]
pub struct ShardAssignment {
    pub phase: Phase,
    pub key: ShardKey,
    pub slices: Vec<FileSlice>,
}

impl ShardAssignment {
    pub fn total_rows(&self) -> u64 {
        self.slices.iter().map(FileSlice::rows).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_rows() == 0
    }
}

/// Cuts the rows of `groups` into `key.group_count` contiguous ranges and
/// returns the slices that make up range `key.group_index`.
///
/// This is pure: no storage access, only the row counts recorded in the
/// groups.
///
/// # Errors
///
/// Returns an error if the slot index is not below the slot count.
pub fn partition_rows(groups: &[FileGroup], key: ShardKey) -> Result<Vec<FileSlice>> {
    if key.group_index >= key.group_count {
        return Err(PipelineError::invalid_shard(key.group_index, key.group_count));
    }

    let total_rows: u64 = groups.iter().map(|g| g.rows).sum();
    let (start, end) = key.row_range(total_rows);

    let mut slices = Vec::new();
    let mut group_start = 0u64;
    for group in groups {
        let group_end = group_start + group.rows;
        let lo = start.max(group_start);
        let hi = end.min(group_end);
        if lo < hi {
            slices.push(FileSlice {
                group: group.clone(),
                row_start: lo - group_start,
                row_end: hi - group_start,
            });
        }
        group_start = group_end;
    }

    Ok(slices)
}

/// Assigns dataset rows to this worker for each phase.
#[derive(Debug, Clone, Copy)]
pub struct ShardPartitioner {
    topology: Topology,
}

impl ShardPartitioner {
    pub fn new(topology: Topology) -> Self {
        Self { topology }
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Computes this worker's assignment for `phase`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the layout has no files for the
    /// phase.
    pub fn assign(&self, layout: &DatasetLayout, phase: Phase) -> Result<ShardAssignment> {
        let groups = layout.phase_groups(phase)?;
        let key = ShardKey::for_phase(phase, self.topology);
        let slices = partition_rows(&groups, key)?;

        let assignment = ShardAssignment { phase, key, slices };
        if assignment.is_empty() {
            warn!(
                phase = %phase,
                group_index = key.group_index,
                group_count = key.group_count,
                "shard is empty: fewer rows than partition slots"
            );
        }
        debug!(
            phase = %phase,
            group_index = key.group_index,
            group_count = key.group_count,
            slices = assignment.slices.len(),
            rows = assignment.total_rows(),
            "computed shard assignment"
        );
        Ok(assignment)
    }
}
