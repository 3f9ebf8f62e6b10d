// rust/pipeline-core/src/lib.rs

//! Phased Pipeline Training - Core Library
//!
//! This crate provides the orchestration core of a recommendation-model
//! training job: phase-aware partitioning of a day-file dataset across
//! worker ranks, restartable per-phase batch sequences, and a phase
//! orchestrator that keeps a fixed-depth execution pipeline full across
//! Train, Validate and Test boundaries.

pub mod config;
pub mod error;
pub mod storage;

// Re-export commonly used types for convenience
pub use config::TrainerConfig;
pub use error::{PipelineError, Result};
pub use storage::{LocalStorage, ObjectMeta, StorageBackend, StorageReader};

pub mod dataset;
pub use dataset::{
    Batch, BatchOrigin, BatchSource, DatasetLayout, Phase, PhaseDataset, PhaseSequence,
    ShardAssignment, ShardKey, ShardPartitioner, Topology,
};

pub mod metrics;
pub use metrics::{BinaryMetrics, PhaseMetrics};

pub mod pipeline;
pub use pipeline::{
    ExecutionEngine, LookaheadCompositor, PhaseOrchestrator, PhaseSummary, PipelineDepth,
    RunReport, StagedEngine, StepModel, StepOutput,
};

pub mod runtime;
pub use runtime::{PhaseDatasets, Runtime};
