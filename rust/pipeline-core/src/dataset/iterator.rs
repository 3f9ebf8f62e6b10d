// rust/pipeline-core/src/dataset/iterator.rs

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::debug;

use super::prefetch::PrefetchingSequence;
use super::traits::{Batch, BatchSource, Phase};
use crate::error::Result;

/// Traversal options of a phase dataset.
#[derive(Debug, Clone)]
pub struct SequenceConfig {
    /// Permute the batch order on every traversal.
    pub shuffle: bool,
    /// Base seed; traversal `n` shuffles with `seed + n`.
    pub seed: u64,
    /// Background loader threads (0 loads on the consumer thread).
    pub num_workers: usize,
    /// Batches each loader may hold ahead of the consumer.
    pub prefetch_batches: usize,
}

impl Default for SequenceConfig {
    fn default() -> Self {
        Self {
            shuffle: false,
            seed: 0,
            num_workers: 0,
            prefetch_batches: 2,
        }
    }
}

/// The batch indices one traversal visits, in delivery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOrder {
    Finite(Vec<usize>),
    /// Every index from 0 upwards; used for generated data.
    Unbounded,
}

impl BatchOrder {
    /// Batch index delivered at `position`, or `None` past the end.
    pub fn get(&self, position: usize) -> Option<usize> {
        match self {
            BatchOrder::Finite(order) => order.get(position).copied(),
            BatchOrder::Unbounded => Some(position),
        }
    }

    pub fn len(&self) -> Option<usize> {
        match self {
            BatchOrder::Finite(order) => Some(order.len()),
            BatchOrder::Unbounded => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }
}

/// A restartable factory of batch sequences over one phase shard.
///
/// Every call to [`PhaseDataset::iter`] starts a new traversal from the
/// first batch. Traversals are independent of each other, so a sequence
/// that was partially consumed by a lookahead can keep going while a fresh
/// one is started.
pub struct PhaseDataset {
    source: Arc<dyn BatchSource>,
    config: SequenceConfig,
    traversals: AtomicU64,
}

impl PhaseDataset {
    pub fn new(source: Arc<dyn BatchSource>, config: SequenceConfig) -> Self {
        Self {
            source,
            config,
            traversals: AtomicU64::new(0),
        }
    }

    pub fn phase(&self) -> Phase {
        self.source.phase()
    }

    /// Batches per traversal, `None` when unbounded.
    pub fn num_batches(&self) -> Option<usize> {
        self.source.num_batches()
    }

    pub fn config(&self) -> &SequenceConfig {
        &self.config
    }

    /// Number of traversals started so far.
    pub fn traversals(&self) -> u64 {
        self.traversals.load(Ordering::Relaxed)
    }

    /// Order of traversal `traversal`.
    ///
    /// Unbounded sources are never shuffled; their batches are already
    /// independent random draws.
    pub fn traversal_order(&self, traversal: u64) -> BatchOrder {
        let Some(count) = self.source.num_batches() else {
            return BatchOrder::Unbounded;
        };

        let mut order: Vec<usize> = (0..count).collect();
        if self.config.shuffle {
            let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(traversal));
            order.shuffle(&mut rng);
        }
        BatchOrder::Finite(order)
    }

    /// Starts a new traversal.
    pub fn iter(&self) -> PhaseSequence {
        let traversal = self.traversals.fetch_add(1, Ordering::Relaxed);
        let order = self.traversal_order(traversal);
        debug!(
            phase = %self.phase(),
            traversal,
            batches = ?order.len(),
            workers = self.config.num_workers,
            "starting phase traversal"
        );

        let inner = if self.config.num_workers == 0 {
            SequenceInner::Inline {
                source: Arc::clone(&self.source),
                order,
                position: 0,
            }
        } else {
            SequenceInner::Prefetch(PrefetchingSequence::new(
                Arc::clone(&self.source),
                Arc::new(order),
                self.config.num_workers,
                self.config.prefetch_batches,
            ))
        };

        PhaseSequence {
            phase: self.phase(),
            inner,
            yielded: 0,
            done: false,
        }
    }
}

enum SequenceInner {
    Inline {
        source: Arc<dyn BatchSource>,
        order: BatchOrder,
        position: usize,
    },
    Prefetch(PrefetchingSequence),
}

/// One traversal over a phase shard.
///
/// Yields `Ok(batch)` in traversal order, then `None`. A load failure is
/// yielded once as `Err` and ends the sequence.
pub struct PhaseSequence {
    phase: Phase,
    inner: SequenceInner,
    yielded: usize,
    done: bool,
}

impl PhaseSequence {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Batches delivered so far.
    pub fn yielded(&self) -> usize {
        self.yielded
    }

    /// Returns `Ok(Some(batch))` for the next batch, `Ok(None)` at the end.
    pub fn next_batch(&mut self) -> Result<Option<Batch>> {
        if self.done {
            return Ok(None);
        }

        let result = match &mut self.inner {
            SequenceInner::Inline {
                source,
                order,
                position,
            } => match order.get(*position) {
                Some(index) => {
                    *position += 1;
                    source.load(index).map(Some)
                }
                None => Ok(None),
            },
            SequenceInner::Prefetch(prefetch) => prefetch.next_batch(),
        };

        match &result {
            Ok(Some(_)) => self.yielded += 1,
            Ok(None) | Err(_) => self.done = true,
        }
        result
    }
}

impl Iterator for PhaseSequence {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_batch() {
            Ok(Some(batch)) => Some(Ok(batch)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}
