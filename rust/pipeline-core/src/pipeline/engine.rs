// rust/pipeline-core/src/pipeline/engine.rs

//! The execution engine contract and a staged reference engine.

use std::collections::VecDeque;

use tracing::trace;

use crate::dataset::{Batch, BatchOrigin, Phase};
use crate::error::{PipelineError, Result};

/// Number of overlapped stages of the training pipeline.
pub const TRAIN_PIPELINE_STAGES: usize = 3;

/// Buffering depth `P` of an execution engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineDepth(usize);

impl PipelineDepth {
    /// # Errors
    ///
    /// Returns a configuration error for zero stages.
    pub fn new(stages: usize) -> Result<Self> {
        if stages == 0 {
            return Err(PipelineError::config("pipeline must have at least one stage"));
        }
        Ok(Self(stages))
    }

    pub fn stages(&self) -> usize {
        self.0
    }

    /// Items the engine holds in flight once ramped up (`P - 1`).
    pub fn lookahead(&self) -> usize {
        self.0 - 1
    }
}

impl Default for PipelineDepth {
    fn default() -> Self {
        Self(TRAIN_PIPELINE_STAGES)
    }
}

/// A completed step, attributed to the batch it was computed from.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutput {
    pub origin: BatchOrigin,
    pub loss: f32,
    /// One logit per row.
    pub logits: Vec<f32>,
    pub labels: Vec<f32>,
}

/// An overlapped execution pipeline with a fixed depth.
///
/// Once ramped up, every `progress` call pulls exactly one item from
/// `upstream` and returns the result of the oldest in-flight item. The
/// first call of the engine's lifetime pulls `P - 1` extra items to fill
/// the buffer. When `upstream` is exhausted `progress` returns `Ok(None)`
/// and keeps the buffered items; they are completed by later calls with a
/// new upstream.
pub trait ExecutionEngine {
    fn depth(&self) -> PipelineDepth;

    /// Switches between training and evaluation for subsequent steps.
    fn set_phase(&mut self, phase: Phase);

    /// # Errors
    ///
    /// Propagates upstream load failures and step failures.
    fn progress(
        &mut self,
        upstream: &mut dyn Iterator<Item = Result<Batch>>,
    ) -> Result<Option<StepOutput>>;

    /// Items currently buffered.
    fn in_flight(&self) -> usize;
}

/// The numeric side of a step, opaque to the pipeline.
pub trait StepModel {
    /// Computes one step over `batch` in the mode of `phase`.
    fn step(&mut self, batch: &Batch, phase: Phase) -> Result<StepOutput>;
}

/// Reference engine: a bounded in-flight queue in front of a [`StepModel`].
///
/// Steps are computed when an item leaves the queue, in the phase the
/// engine is set to at that moment.
pub struct StagedEngine<M> {
    model: M,
    depth: PipelineDepth,
    phase: Phase,
    buffer: VecDeque<Batch>,
    connected: bool,
}

impl<M: StepModel> StagedEngine<M> {
    pub fn new(model: M, depth: PipelineDepth) -> Self {
        Self {
            model,
            depth,
            phase: Phase::Train,
            buffer: VecDeque::with_capacity(depth.stages()),
            connected: false,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    /// Origins of the buffered items, oldest first.
    pub fn buffered(&self) -> impl Iterator<Item = BatchOrigin> + '_ {
        self.buffer.iter().map(|b| b.origin)
    }

    fn pull(&mut self, upstream: &mut dyn Iterator<Item = Result<Batch>>) -> Result<bool> {
        match upstream.next() {
            Some(batch) => {
                self.buffer.push_back(batch?);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

impl<M: StepModel> ExecutionEngine for StagedEngine<M> {
    fn depth(&self) -> PipelineDepth {
        self.depth
    }

    fn set_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    fn progress(
        &mut self,
        upstream: &mut dyn Iterator<Item = Result<Batch>>,
    ) -> Result<Option<StepOutput>> {
        if !self.connected {
            self.connected = true;
            for _ in 0..self.depth.lookahead() {
                if !self.pull(upstream)? {
                    break;
                }
            }
            trace!(in_flight = self.buffer.len(), "pipeline filled");
        }

        if !self.pull(upstream)? {
            return Ok(None);
        }

        match self.buffer.pop_front() {
            Some(batch) => self.model.step(&batch, self.phase).map(Some),
            None => Ok(None),
        }
    }

    fn in_flight(&self) -> usize {
        self.buffer.len()
    }
}
