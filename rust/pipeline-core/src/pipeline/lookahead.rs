// rust/pipeline-core/src/pipeline/lookahead.rs

//! Composition of a phase's sequence with the head of the next one.
//!
//! An engine of depth `P` holds `P - 1` items once ramped up. Feeding it
//! `current ++ next[..P-1]` completes every item of `current` and leaves
//! exactly the first `P - 1` items of `next` in flight, ready for the next
//! phase.

use std::iter::{Chain, Take};

use super::engine::PipelineDepth;

/// Whether the engine already holds items of the phase being composed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferCarry {
    /// First phase of the run: nothing is buffered yet.
    Empty,
    /// The previous phase left `P - 1` items of this phase in flight.
    Primed,
}

/// Item counts requested from each side of a composition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompositionPlan {
    /// Items taken from the current sequence, `None` for all of them.
    pub current_limit: Option<usize>,
    /// Items taken from the head of the next sequence.
    pub lookahead: usize,
}

impl CompositionPlan {
    fn current_take(&self) -> usize {
        self.current_limit.unwrap_or(usize::MAX)
    }
}

/// `current` limited, followed by the lookahead slice of `next`.
pub type Combined<'a, C, N> = Chain<Take<&'a mut C>, Take<&'a mut N>>;

#[derive(Debug, Clone, Copy)]
pub struct LookaheadCompositor {
    depth: PipelineDepth,
}

impl LookaheadCompositor {
    pub fn new(depth: PipelineDepth) -> Self {
        Self { depth }
    }

    pub fn depth(&self) -> PipelineDepth {
        self.depth
    }

    /// Counts for a phase with result limit `limit`.
    ///
    /// With a primed buffer the first `P - 1` results of the phase are
    /// already in flight, so that many fewer items are taken from `current`.
    pub fn plan(&self, limit: Option<usize>, carry: BufferCarry) -> CompositionPlan {
        let lookahead = self.depth.lookahead();
        let current_limit = match carry {
            BufferCarry::Empty => limit,
            BufferCarry::Primed => limit.map(|l| l.saturating_sub(lookahead)),
        };
        CompositionPlan {
            current_limit,
            lookahead,
        }
    }

    /// Chains `current` (limited per [`plan`](Self::plan)) with the first
    /// `P - 1` items of `next`.
    ///
    /// Both sequences are borrowed: whatever the combined sequence pulls
    /// from `next` is consumed from that instance, which continues at item
    /// `P - 1` afterwards. A `next` shorter than the lookahead contributes
    /// what it has.
    pub fn compose<'a, C, N>(
        &self,
        current: &'a mut C,
        next: &'a mut N,
        limit: Option<usize>,
        carry: BufferCarry,
    ) -> Combined<'a, C, N>
    where
        C: Iterator,
        N: Iterator<Item = C::Item>,
    {
        let plan = self.plan(limit, carry);
        current
            .take(plan.current_take())
            .chain(next.take(plan.lookahead))
    }
}
