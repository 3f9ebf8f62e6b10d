// rust/pipeline-core/src/runtime.rs

//! Main runtime wiring.
//!
//! This module provides the `Runtime` struct that ties together the
//! components of a training job: storage, dataset layout, per-phase shard
//! datasets and the phase orchestrator.
//!
//! # Example
//!
//! ```no_run
//! use pipeline_core::pipeline::{PipelineDepth, StagedEngine, StepModel, StepOutput};
//! use pipeline_core::{Batch, Phase, Result, Runtime, TrainerConfig};
//!
//! struct Constant;
//!
//! impl StepModel for Constant {
//!     fn step(&mut self, batch: &Batch, _phase: Phase) -> Result<StepOutput> {
//!         Ok(StepOutput {
//!             origin: batch.origin,
//!             loss: 0.0,
//!             logits: vec![0.0; batch.num_rows],
//!             labels: batch.labels.clone(),
//!         })
//!     }
//! }
//!
//! let runtime = Runtime::from_config(TrainerConfig::default()).unwrap();
//! let engine = StagedEngine::new(Constant, PipelineDepth::default());
//! let report = runtime.run(engine, |summary| println!("{summary}")).unwrap();
//! println!("{} evaluations", report.evaluations.len());
//! ```

use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::config::TrainerConfig;
use crate::dataset::{
    BatchSource, DatasetLayout, Phase, PhaseDataset, SequenceConfig, ShardBatchSource,
    ShardPartitioner, SyntheticBatchSource, Topology,
};
use crate::error::{PipelineError, Result};
use crate::pipeline::{ExecutionEngine, OrchestratorConfig, PhaseOrchestrator, PhaseSummary, RunReport};
use crate::storage::{LocalStorage, StorageBackend};

/// The restartable datasets of the three phases.
pub struct PhaseDatasets {
    pub train: PhaseDataset,
    pub validate: PhaseDataset,
    pub test: PhaseDataset,
}

impl PhaseDatasets {
    pub fn get(&self, phase: Phase) -> &PhaseDataset {
        match phase {
            Phase::Train => &self.train,
            Phase::Validate => &self.validate,
            Phase::Test => &self.test,
        }
    }
}

/// The runtime of one worker process.
///
/// Shard assignments are computed once here and never change for the
/// lifetime of the runtime.
pub struct Runtime {
    config: TrainerConfig,
    topology: Topology,
    storage: Option<Arc<dyn StorageBackend>>,
    layout: Option<DatasetLayout>,
    datasets: PhaseDatasets,
}

impl Runtime {
    /// Creates a runtime from a configuration file.
    ///
    /// Environment variable overrides are applied after loading the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or is invalid.
    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self> {
        let config = TrainerConfig::from_file(path)?.with_env_overrides();
        Self::from_config(config)
    }

    /// Creates a runtime from a configuration.
    ///
    /// With a dataset path the directory is discovered and partitioned for
    /// this worker's rank; without one every phase reads generated data.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the configuration is invalid or the
    /// dataset directory does not match the expected layout.
    pub fn from_config(config: TrainerConfig) -> Result<Self> {
        config.validate()?;

        let topology = Topology::new(
            to_u32(config.distributed.rank, "distributed.rank")?,
            to_u32(config.distributed.world_size, "distributed.world_size")?,
        )?;
        let seed = config.dataset.seed.unwrap_or(0);
        let sequence_config = SequenceConfig {
            shuffle: config.dataset.shuffle_batches,
            seed,
            num_workers: config.dataset.num_workers,
            prefetch_batches: config.dataset.prefetch_batches,
        };
        let batch_size = config.training.batch_size;
        let hash_sizes = config.dataset.hash_sizes();

        let (storage, layout, sources) = match &config.dataset.path {
            Some(path) => {
                let storage: Arc<dyn StorageBackend> =
                    Arc::new(LocalStorage::new(path.clone(), &config.storage)?);
                let layout = DatasetLayout::discover(storage.as_ref())?;
                let partitioner = ShardPartitioner::new(topology);

                let mut sources: Vec<Arc<dyn BatchSource>> = Vec::with_capacity(3);
                for phase in Phase::ALL {
                    let assignment = partitioner.assign(&layout, phase)?;
                    sources.push(Arc::new(ShardBatchSource::new(
                        Arc::clone(&storage),
                        assignment,
                        batch_size,
                        hash_sizes.clone(),
                    )?));
                }
                info!(
                    path = %path.display(),
                    days = layout.groups().len(),
                    final_day = layout.final_day(),
                    "using file-backed dataset"
                );
                (Some(storage), Some(layout), sources)
            }
            None => {
                // Ranks draw different data from the same base seed
                let rank_seed = seed.wrapping_add(u64::from(topology.rank()));
                let mut sources: Vec<Arc<dyn BatchSource>> = Vec::with_capacity(3);
                for phase in Phase::ALL {
                    sources.push(Arc::new(SyntheticBatchSource::new(
                        phase,
                        batch_size,
                        hash_sizes.clone(),
                        rank_seed,
                    )?));
                }
                info!("no dataset path configured, using synthetic data");
                (None, None, sources)
            }
        };

        let mut datasets = sources
            .into_iter()
            .map(|source| PhaseDataset::new(source, sequence_config.clone()));
        let (Some(train), Some(validate), Some(test)) =
            (datasets.next(), datasets.next(), datasets.next())
        else {
            return Err(PipelineError::config("expected one dataset per phase"));
        };

        info!(
            rank = topology.rank(),
            world_size = topology.world_size(),
            train_batches = ?train.num_batches(),
            validate_batches = ?validate.num_batches(),
            test_batches = ?test.num_batches(),
            "runtime initialized"
        );

        Ok(Self {
            config,
            topology,
            storage,
            layout,
            datasets: PhaseDatasets {
                train,
                validate,
                test,
            },
        })
    }

    /// Runs the full schedule on `engine`, calling `on_summary` after every
    /// Validate and Test phase.
    ///
    /// # Errors
    ///
    /// Fails on the first load or engine error.
    pub fn run<E, R>(&self, engine: E, on_summary: R) -> Result<RunReport>
    where
        E: ExecutionEngine,
        R: FnMut(&PhaseSummary),
    {
        let mut orchestrator = PhaseOrchestrator::new(engine, self.orchestrator_config())?;
        orchestrator.run_with(
            &self.datasets.train,
            &self.datasets.validate,
            &self.datasets.test,
            on_summary,
        )
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig::from(&self.config)
    }

    /// Returns the current configuration.
    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// The storage backend, absent for synthetic data.
    pub fn storage(&self) -> Option<&Arc<dyn StorageBackend>> {
        self.storage.as_ref()
    }

    /// The discovered dataset layout, absent for synthetic data.
    pub fn layout(&self) -> Option<&DatasetLayout> {
        self.layout.as_ref()
    }

    pub fn datasets(&self) -> &PhaseDatasets {
        &self.datasets
    }
}

fn to_u32(value: usize, field: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| PipelineError::config(format!("{field} {value} does not fit in 32 bits")))
}
