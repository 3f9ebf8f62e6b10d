// rust/pipeline-core/src/pipeline/mod.rs

//! Overlapped execution across phase and epoch boundaries.
//!
//! An [`ExecutionEngine`] of depth `P` keeps `P - 1` batches in flight. The
//! [`LookaheadCompositor`] feeds each phase with the head of the next one
//! so that buffer is never flushed, and the [`PhaseOrchestrator`] runs the
//! `Train -> Validate` epochs and the final `Test` in that style.

mod engine;
mod lookahead;
mod orchestrator;

pub use engine::{
    ExecutionEngine, PipelineDepth, StagedEngine, StepModel, StepOutput, TRAIN_PIPELINE_STAGES,
};
pub use lookahead::{BufferCarry, Combined, CompositionPlan, LookaheadCompositor};
pub use orchestrator::{
    LookaheadSource, OrchestratorConfig, PhaseLimits, PhaseOrchestrator, PhaseSchedule,
    PhaseSummary, RunReport, ScheduledPhase, SequenceFactory, TrainSummary,
};
