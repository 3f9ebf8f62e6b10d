// rust/pipeline-core/src/pipeline/orchestrator.rs

//! Drives the engine through `Train -> Validate` epochs and a final `Test`.
//!
//! The engine buffer is never flushed between phases. Instead every phase
//! is fed with the head of the phase that follows it, so the items left in
//! flight at a boundary are exactly the first items of the next phase.

use std::fmt;

use tracing::{debug, info, warn};

use super::engine::ExecutionEngine;
use super::lookahead::{BufferCarry, LookaheadCompositor};
use crate::config::TrainerConfig;
use crate::dataset::{Batch, Phase, PhaseDataset, PhaseSequence};
use crate::error::{PipelineError, Result};
use crate::metrics::{BinaryMetrics, PhaseMetrics};

/// Something that can start a fresh traversal of a phase.
pub trait SequenceFactory {
    type Sequence: Iterator<Item = Result<Batch>>;

    fn restart(&self) -> Self::Sequence;
}

impl SequenceFactory for PhaseDataset {
    type Sequence = PhaseSequence;

    fn restart(&self) -> PhaseSequence {
        self.iter()
    }
}

/// Per-phase result limits; `None` runs the phase to the end of its data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseLimits {
    pub train: Option<usize>,
    pub validate: Option<usize>,
    pub test: Option<usize>,
}

impl PhaseLimits {
    pub fn get(&self, phase: Phase) -> Option<usize> {
        match phase {
            Phase::Train => self.train,
            Phase::Validate => self.validate,
            Phase::Test => self.test,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub epochs: usize,
    pub limits: PhaseLimits,
    pub log_every_n_steps: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            epochs: 1,
            limits: PhaseLimits::default(),
            log_every_n_steps: 100,
        }
    }
}

impl From<&TrainerConfig> for OrchestratorConfig {
    fn from(config: &TrainerConfig) -> Self {
        Self {
            epochs: config.training.epochs,
            limits: PhaseLimits {
                train: config.phase_limit(Phase::Train),
                validate: config.phase_limit(Phase::Validate),
                test: config.phase_limit(Phase::Test),
            },
            log_every_n_steps: config.training.log_every_n_steps,
        }
    }
}

/// Which sequence supplies the lookahead slice of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookaheadSource {
    /// A new validation traversal, which then runs as the next phase.
    FreshValidate,
    /// A new training traversal for the next epoch.
    FreshTrain,
    /// The test traversal started at the beginning of the run.
    RunTest,
    /// A throwaway test traversal; its items are never reported.
    FreshTest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledPhase {
    pub phase: Phase,
    pub epoch: usize,
    pub carry: BufferCarry,
    pub lookahead: LookaheadSource,
}

/// The order of phases in a run: `(Train, Validate)` per epoch, then Test.
#[derive(Debug, Clone)]
pub struct PhaseSchedule {
    epochs: usize,
    position: usize,
}

impl PhaseSchedule {
    pub fn new(epochs: usize) -> Self {
        Self { epochs, position: 0 }
    }
}

impl Iterator for PhaseSchedule {
    type Item = ScheduledPhase;

    fn next(&mut self) -> Option<ScheduledPhase> {
        let position = self.position;
        if position > 2 * self.epochs {
            return None;
        }
        self.position += 1;

        // Only the very first phase starts with an empty engine
        let carry = if position == 0 {
            BufferCarry::Empty
        } else {
            BufferCarry::Primed
        };

        let scheduled = if position == 2 * self.epochs {
            ScheduledPhase {
                phase: Phase::Test,
                epoch: self.epochs.saturating_sub(1),
                carry,
                lookahead: LookaheadSource::FreshTest,
            }
        } else {
            let epoch = position / 2;
            if position % 2 == 0 {
                ScheduledPhase {
                    phase: Phase::Train,
                    epoch,
                    carry,
                    lookahead: LookaheadSource::FreshValidate,
                }
            } else {
                ScheduledPhase {
                    phase: Phase::Validate,
                    epoch,
                    carry,
                    lookahead: if epoch + 1 < self.epochs {
                        LookaheadSource::FreshTrain
                    } else {
                        LookaheadSource::RunTest
                    },
                }
            }
        };
        Some(scheduled)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainSummary {
    pub epoch: usize,
    pub steps: usize,
    pub mean_loss: f64,
    pub foreign_results: usize,
}

/// Metrics of one Validate or Test phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseSummary {
    pub phase: Phase,
    pub epoch: usize,
    pub steps: usize,
    pub auroc: f64,
    pub accuracy: f64,
    /// Results dropped because they were computed from another phase's batch.
    pub foreign_results: usize,
}

impl fmt::Display for PhaseSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "AUROC over {} set: {}.", self.phase, self.auroc)?;
        write!(f, "Accuracy over {} set: {}.", self.phase, self.accuracy)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub train: Vec<TrainSummary>,
    /// Validate and Test summaries in the order they ran.
    pub evaluations: Vec<PhaseSummary>,
}

impl RunReport {
    pub fn validations(&self) -> impl Iterator<Item = &PhaseSummary> {
        self.evaluations.iter().filter(|s| s.phase == Phase::Validate)
    }

    pub fn test(&self) -> Option<&PhaseSummary> {
        self.evaluations.iter().find(|s| s.phase == Phase::Test)
    }
}

struct PhaseOutcome {
    steps: usize,
    foreign_results: usize,
    loss_sum: f64,
    metrics: Option<Box<dyn PhaseMetrics>>,
}

fn binary_metrics() -> Box<dyn PhaseMetrics> {
    Box::new(BinaryMetrics::new())
}

/// Runs the phases of a training job over one execution engine.
///
/// An orchestrator runs once: the engine keeps the trailing test lookahead
/// in flight after the run, which no later phase could be attributed to.
pub struct PhaseOrchestrator<E> {
    engine: E,
    compositor: LookaheadCompositor,
    config: OrchestratorConfig,
    new_metrics: fn() -> Box<dyn PhaseMetrics>,
    finished: bool,
}

impl<E: ExecutionEngine> PhaseOrchestrator<E> {
    /// # Errors
    ///
    /// Returns a configuration error for zero epochs or a zero logging
    /// interval.
    pub fn new(engine: E, config: OrchestratorConfig) -> Result<Self> {
        if config.epochs == 0 {
            return Err(PipelineError::config("epochs must be greater than 0"));
        }
        if config.log_every_n_steps == 0 {
            return Err(PipelineError::config("log_every_n_steps must be greater than 0"));
        }
        let compositor = LookaheadCompositor::new(engine.depth());
        Ok(Self {
            engine,
            compositor,
            config,
            new_metrics: binary_metrics,
            finished: false,
        })
    }

    /// Replaces the evaluation metrics accumulator.
    #[must_use]
    pub fn with_metrics(mut self, new_metrics: fn() -> Box<dyn PhaseMetrics>) -> Self {
        self.new_metrics = new_metrics;
        self
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn into_engine(self) -> E {
        self.engine
    }

    pub fn run<F: SequenceFactory>(&mut self, train: &F, validate: &F, test: &F) -> Result<RunReport> {
        self.run_with(train, validate, test, |_| {})
    }

    /// Runs every scheduled phase, calling `on_summary` after each Validate
    /// and Test phase.
    ///
    /// # Errors
    ///
    /// Fails on the first load or engine error, or when called twice.
    pub fn run_with<F, R>(&mut self, train: &F, validate: &F, test: &F, mut on_summary: R) -> Result<RunReport>
    where
        F: SequenceFactory,
        R: FnMut(&PhaseSummary),
    {
        if self.finished {
            return Err(PipelineError::engine("orchestrator has already run"));
        }
        self.finished = true;

        let mut report = RunReport::default();
        let mut train_seq = train.restart();
        let mut test_seq = test.restart();
        let mut validate_seq: Option<F::Sequence> = None;

        for scheduled in PhaseSchedule::new(self.config.epochs) {
            let outcome = match scheduled.lookahead {
                LookaheadSource::FreshValidate => {
                    let mut next = validate.restart();
                    let outcome = self.run_phase(scheduled, &mut train_seq, &mut next)?;
                    validate_seq = Some(next);
                    outcome
                }
                LookaheadSource::FreshTrain => {
                    let mut current = validate_seq.take().ok_or_else(|| {
                        PipelineError::engine("validation scheduled before training")
                    })?;
                    train_seq = train.restart();
                    self.run_phase(scheduled, &mut current, &mut train_seq)?
                }
                LookaheadSource::RunTest => {
                    let mut current = validate_seq.take().ok_or_else(|| {
                        PipelineError::engine("validation scheduled before training")
                    })?;
                    self.run_phase(scheduled, &mut current, &mut test_seq)?
                }
                LookaheadSource::FreshTest => {
                    let mut trailing = test.restart();
                    self.run_phase(scheduled, &mut test_seq, &mut trailing)?
                }
            };

            match outcome.metrics {
                Some(metrics) => {
                    let summary = PhaseSummary {
                        phase: scheduled.phase,
                        epoch: scheduled.epoch,
                        steps: outcome.steps,
                        auroc: metrics.auroc(),
                        accuracy: metrics.accuracy(),
                        foreign_results: outcome.foreign_results,
                    };
                    info!(
                        phase = %summary.phase,
                        epoch = summary.epoch,
                        auroc = summary.auroc,
                        accuracy = summary.accuracy,
                        "evaluation complete"
                    );
                    on_summary(&summary);
                    report.evaluations.push(summary);
                }
                None => report.train.push(TrainSummary {
                    epoch: scheduled.epoch,
                    steps: outcome.steps,
                    mean_loss: if outcome.steps == 0 {
                        f64::NAN
                    } else {
                        outcome.loss_sum / outcome.steps as f64
                    },
                    foreign_results: outcome.foreign_results,
                }),
            }
        }

        Ok(report)
    }

    fn run_phase<C, N>(&mut self, scheduled: ScheduledPhase, current: &mut C, next: &mut N) -> Result<PhaseOutcome>
    where
        C: Iterator<Item = Result<Batch>>,
        N: Iterator<Item = Result<Batch>>,
    {
        let ScheduledPhase { phase, epoch, carry, .. } = scheduled;
        let limit = self.config.limits.get(phase);
        let plan = self.compositor.plan(limit, carry);

        if let (BufferCarry::Primed, Some(limit)) = (carry, limit) {
            if limit < plan.lookahead {
                warn!(
                    phase = %phase,
                    limit,
                    buffered = plan.lookahead,
                    "limit is below the pipeline lookahead; the buffered batches still complete"
                );
            }
        }
        info!(phase = %phase, epoch, limit = ?limit, "starting phase");
        debug!(
            phase = %phase,
            carry = ?carry,
            current_limit = ?plan.current_limit,
            lookahead = plan.lookahead,
            in_flight = self.engine.in_flight(),
            "composed phase sequence"
        );

        self.engine.set_phase(phase);
        let mut combined = self.compositor.compose(current, next, limit, carry);

        let mut outcome = PhaseOutcome {
            steps: 0,
            foreign_results: 0,
            loss_sum: 0.0,
            metrics: phase.is_eval().then(self.new_metrics),
        };
        while let Some(output) = self.engine.progress(&mut combined)? {
            if output.origin.phase != phase {
                outcome.foreign_results += 1;
                warn!(
                    phase = %phase,
                    origin = %output.origin.phase,
                    index = output.origin.index,
                    "dropping result computed from another phase's batch"
                );
                continue;
            }

            outcome.steps += 1;
            outcome.loss_sum += f64::from(output.loss);
            match outcome.metrics.as_mut() {
                Some(metrics) => metrics.update(&output),
                None if outcome.steps % self.config.log_every_n_steps == 0 => {
                    debug!(epoch, step = outcome.steps, loss = output.loss, "train step");
                }
                None => {}
            }
        }

        if outcome.steps == 0 {
            warn!(phase = %phase, epoch, "phase produced no results");
        }
        info!(phase = %phase, epoch, steps = outcome.steps, "finished phase");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{BatchOrigin, DENSE_FEATURE_COUNT, SPARSE_FEATURE_COUNT};
    use crate::pipeline::{PipelineDepth, StagedEngine, StepModel, StepOutput};
    use std::cell::Cell;

    struct VecFactory {
        phase: Phase,
        batches: usize,
        fail_at: Option<usize>,
        restarts: Cell<usize>,
    }

    impl VecFactory {
        fn new(phase: Phase, batches: usize) -> Self {
            Self {
                phase,
                batches,
                fail_at: None,
                restarts: Cell::new(0),
            }
        }
    }

    impl SequenceFactory for VecFactory {
        type Sequence = std::vec::IntoIter<Result<Batch>>;

        fn restart(&self) -> Self::Sequence {
            self.restarts.set(self.restarts.get() + 1);
            (0..self.batches)
                .map(|index| {
                    if self.fail_at == Some(index) {
                        return Err(PipelineError::dataset("vec", "read failed"));
                    }
                    // Even batches are positive, odd negative
                    let label = if index % 2 == 0 { 1.0 } else { 0.0 };
                    Ok(Batch {
                        origin: BatchOrigin { phase: self.phase, index },
                        num_rows: 1,
                        dense: vec![0.0; DENSE_FEATURE_COUNT],
                        sparse: vec![0; SPARSE_FEATURE_COUNT],
                        labels: vec![label],
                    })
                })
                .collect::<Vec<_>>()
                .into_iter()
        }
    }

    /// Records every step as `(batch origin, engine phase)`.
    #[derive(Default)]
    struct RecordingModel {
        steps: Vec<(BatchOrigin, Phase)>,
    }

    impl StepModel for RecordingModel {
        fn step(&mut self, batch: &Batch, phase: Phase) -> Result<StepOutput> {
            self.steps.push((batch.origin, phase));
            Ok(StepOutput {
                origin: batch.origin,
                loss: 1.0,
                logits: batch.labels.iter().map(|l| l * 2.0 - 1.0).collect(),
                labels: batch.labels.clone(),
            })
        }
    }

    fn orchestrator(stages: usize, epochs: usize, limits: PhaseLimits) -> PhaseOrchestrator<StagedEngine<RecordingModel>> {
        let engine = StagedEngine::new(RecordingModel::default(), PipelineDepth::new(stages).unwrap());
        let config = OrchestratorConfig {
            epochs,
            limits,
            log_every_n_steps: 1,
        };
        PhaseOrchestrator::new(engine, config).unwrap()
    }

    fn factories(train: usize, validate: usize, test: usize) -> (VecFactory, VecFactory, VecFactory) {
        (
            VecFactory::new(Phase::Train, train),
            VecFactory::new(Phase::Validate, validate),
            VecFactory::new(Phase::Test, test),
        )
    }

    #[test]
    fn test_schedule_single_epoch() {
        let phases: Vec<_> = PhaseSchedule::new(1).collect();
        assert_eq!(
            phases,
            vec![
                ScheduledPhase {
                    phase: Phase::Train,
                    epoch: 0,
                    carry: BufferCarry::Empty,
                    lookahead: LookaheadSource::FreshValidate,
                },
                ScheduledPhase {
                    phase: Phase::Validate,
                    epoch: 0,
                    carry: BufferCarry::Primed,
                    lookahead: LookaheadSource::RunTest,
                },
                ScheduledPhase {
                    phase: Phase::Test,
                    epoch: 0,
                    carry: BufferCarry::Primed,
                    lookahead: LookaheadSource::FreshTest,
                },
            ]
        );
    }

    #[test]
    fn test_schedule_multiple_epochs() {
        let phases: Vec<_> = PhaseSchedule::new(3)
            .map(|s| (s.phase, s.epoch, s.lookahead))
            .collect();
        assert_eq!(
            phases,
            vec![
                (Phase::Train, 0, LookaheadSource::FreshValidate),
                (Phase::Validate, 0, LookaheadSource::FreshTrain),
                (Phase::Train, 1, LookaheadSource::FreshValidate),
                (Phase::Validate, 1, LookaheadSource::FreshTrain),
                (Phase::Train, 2, LookaheadSource::FreshValidate),
                (Phase::Validate, 2, LookaheadSource::RunTest),
                (Phase::Test, 2, LookaheadSource::FreshTest),
            ]
        );
        assert!(PhaseSchedule::new(3).skip(1).all(|s| s.carry == BufferCarry::Primed));
    }

    #[test]
    fn test_every_result_is_attributed_to_its_phase() {
        let (train, validate, test) = factories(7, 4, 5);
        let mut orch = orchestrator(3, 2, PhaseLimits::default());

        let report = orch.run(&train, &validate, &test).unwrap();

        // Each step ran in the phase its batch came from
        let steps = &orch.engine().model().steps;
        assert!(steps.iter().all(|(origin, phase)| origin.phase == *phase));

        assert_eq!(report.train.iter().map(|t| t.steps).collect::<Vec<_>>(), vec![7, 7]);
        assert!(report.train.iter().all(|t| t.mean_loss == 1.0));
        let evals: Vec<_> = report.evaluations.iter().map(|s| (s.phase, s.epoch, s.steps)).collect();
        assert_eq!(
            evals,
            vec![(Phase::Validate, 0, 4), (Phase::Validate, 1, 4), (Phase::Test, 1, 5)]
        );
        assert!(report.evaluations.iter().all(|s| s.foreign_results == 0));

        let test_summary = report.test().unwrap();
        assert_eq!(test_summary.auroc, 1.0);
        assert_eq!(test_summary.accuracy, 1.0);

        // Train traversals: initial + one per following epoch; test: run-wide + trailing
        assert_eq!(train.restarts.get(), 2);
        assert_eq!(validate.restarts.get(), 2);
        assert_eq!(test.restarts.get(), 2);

        // The trailing test lookahead stays in flight and is never reported
        assert_eq!(
            orch.engine().buffered().collect::<Vec<_>>(),
            vec![
                BatchOrigin { phase: Phase::Test, index: 0 },
                BatchOrigin { phase: Phase::Test, index: 1 },
            ]
        );
    }

    #[test]
    fn test_every_batch_completes_once_per_traversal() {
        let (train, validate, test) = factories(6, 3, 4);
        let mut orch = orchestrator(3, 2, PhaseLimits::default());
        orch.run(&train, &validate, &test).unwrap();

        let steps = &orch.engine().model().steps;
        let validate_indices: Vec<_> = steps
            .iter()
            .filter(|(o, _)| o.phase == Phase::Validate)
            .map(|(o, _)| o.index)
            .collect();
        assert_eq!(validate_indices, vec![0, 1, 2, 0, 1, 2]);

        let test_indices: Vec<_> = steps
            .iter()
            .filter(|(o, _)| o.phase == Phase::Test)
            .map(|(o, _)| o.index)
            .collect();
        assert_eq!(test_indices, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_limits_count_results() {
        let (train, validate, test) = factories(20, 20, 20);
        let limits = PhaseLimits {
            train: Some(5),
            validate: Some(3),
            test: Some(2),
        };
        let mut orch = orchestrator(3, 2, limits);

        let report = orch.run(&train, &validate, &test).unwrap();

        assert_eq!(report.train.iter().map(|t| t.steps).collect::<Vec<_>>(), vec![5, 5]);
        let evals: Vec<_> = report.evaluations.iter().map(|s| s.steps).collect();
        assert_eq!(evals, vec![3, 3, 2]);
        assert!(orch
            .engine()
            .model()
            .steps
            .iter()
            .all(|(origin, phase)| origin.phase == *phase));
    }

    #[test]
    fn test_limit_below_lookahead_drains_buffer() {
        let (train, validate, test) = factories(10, 10, 10);
        let limits = PhaseLimits {
            validate: Some(1),
            ..PhaseLimits::default()
        };
        let mut orch = orchestrator(3, 1, limits);

        let report = orch.run(&train, &validate, &test).unwrap();

        // The two buffered validation batches complete in their own phase
        let validation = report.validations().next().unwrap();
        assert_eq!(validation.steps, 2);
        assert_eq!(validation.foreign_results, 0);
        assert_eq!(report.test().unwrap().steps, 10);
    }

    #[test]
    fn test_short_lookahead_source_is_not_misattributed() {
        // One validation batch cannot fill a lookahead of two
        let (train, validate, test) = factories(7, 1, 3);
        let mut orch = orchestrator(3, 1, PhaseLimits::default());

        let report = orch.run(&train, &validate, &test).unwrap();

        assert_eq!(report.train[0].steps, 6);
        let validation = report.validations().next().unwrap();
        assert_eq!(validation.steps, 1);
        assert_eq!(validation.foreign_results, 1);
        assert_eq!(report.test().unwrap().steps, 3);
    }

    #[test]
    fn test_single_stage_engine() {
        let (train, validate, test) = factories(3, 2, 2);
        let mut orch = orchestrator(1, 2, PhaseLimits::default());

        let report = orch.run(&train, &validate, &test).unwrap();
        assert_eq!(report.train.iter().map(|t| t.steps).collect::<Vec<_>>(), vec![3, 3]);
        assert_eq!(report.evaluations.iter().map(|s| s.steps).collect::<Vec<_>>(), vec![2, 2, 2]);
        assert_eq!(orch.engine().in_flight(), 0);
    }

    #[test]
    fn test_summaries_are_reported_as_they_complete() {
        let (train, validate, test) = factories(4, 4, 4);
        let mut orch = orchestrator(2, 2, PhaseLimits::default());

        let mut seen = Vec::new();
        let report = orch
            .run_with(&train, &validate, &test, |s| seen.push((s.phase, s.epoch)))
            .unwrap();

        assert_eq!(seen, vec![(Phase::Validate, 0), (Phase::Validate, 1), (Phase::Test, 1)]);
        assert_eq!(report.evaluations.len(), 3);
        assert!(report.evaluations[0].to_string().starts_with("AUROC over val set: 1."));
    }

    #[test]
    fn test_load_error_is_fatal() {
        let (train, mut validate, test) = factories(4, 4, 4);
        validate.fail_at = Some(2);
        let mut orch = orchestrator(3, 1, PhaseLimits::default());

        let err = orch.run(&train, &validate, &test).unwrap_err();
        assert!(matches!(err, PipelineError::Dataset { .. }));
    }

    #[test]
    fn test_runs_once() {
        let (train, validate, test) = factories(2, 2, 2);
        let mut orch = orchestrator(2, 1, PhaseLimits::default());
        orch.run(&train, &validate, &test).unwrap();
        assert!(orch.run(&train, &validate, &test).is_err());
    }

    #[test]
    fn test_rejects_zero_epochs() {
        let engine = StagedEngine::new(RecordingModel::default(), PipelineDepth::default());
        let config = OrchestratorConfig {
            epochs: 0,
            ..OrchestratorConfig::default()
        };
        assert!(matches!(
            PhaseOrchestrator::new(engine, config),
            Err(e) if e.is_config()
        ));
    }
}
