//! A logistic-regression probe standing in for the recommendation model.
//!
//! The probe scores rows from their log-transformed dense features and
//! takes one SGD step per Train batch. Validate and Test batches only run
//! the forward pass.

use pipeline_core::dataset::DENSE_FEATURE_COUNT;
use pipeline_core::{Batch, Phase, PipelineError, Result, StepModel, StepOutput};

pub struct LinearProbe {
    weights: [f32; DENSE_FEATURE_COUNT],
    bias: f32,
    learning_rate: f32,
}

impl LinearProbe {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            weights: [0.0; DENSE_FEATURE_COUNT],
            bias: 0.0,
            learning_rate,
        }
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    fn features(row: &[f32]) -> impl Iterator<Item = f32> + '_ {
        row.iter().map(|&x| x.max(0.0).ln_1p())
    }

    fn logit(&self, row: &[f32]) -> f32 {
        self.bias
            + Self::features(row)
                .zip(&self.weights)
                .map(|(x, w)| x * w)
                .sum::<f32>()
    }
}

impl Default for LinearProbe {
    fn default() -> Self {
        Self::new(0.05)
    }
}

/// Binary cross-entropy on a logit, stable for large magnitudes.
fn bce_with_logit(logit: f32, label: f32) -> f32 {
    logit.max(0.0) - logit * label + (-logit.abs()).exp().ln_1p()
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

impl StepModel for LinearProbe {
    fn step(&mut self, batch: &Batch, phase: Phase) -> Result<StepOutput> {
        if batch.num_rows == 0 || batch.labels.len() != batch.num_rows {
            return Err(PipelineError::engine(format!(
                "batch {} of {} has {} rows and {} labels",
                batch.origin.index,
                batch.origin.phase,
                batch.num_rows,
                batch.labels.len()
            )));
        }

        let logits: Vec<f32> = (0..batch.num_rows)
            .map(|row| self.logit(batch.dense_row(row)))
            .collect();
        let loss = logits
            .iter()
            .zip(&batch.labels)
            .map(|(&z, &y)| bce_with_logit(z, y))
            .sum::<f32>()
            / batch.num_rows as f32;

        if phase == Phase::Train {
            let scale = self.learning_rate / batch.num_rows as f32;
            let mut grad_w = [0.0f32; DENSE_FEATURE_COUNT];
            let mut grad_b = 0.0f32;
            for (row, (&z, &y)) in logits.iter().zip(&batch.labels).enumerate() {
                let err = sigmoid(z) - y;
                for (g, x) in grad_w.iter_mut().zip(Self::features(batch.dense_row(row))) {
                    *g += err * x;
                }
                grad_b += err;
            }
            for (w, g) in self.weights.iter_mut().zip(grad_w) {
                *w -= scale * g;
            }
            self.bias -= scale * grad_b;
        }

        Ok(StepOutput {
            origin: batch.origin,
            loss,
            logits,
            labels: batch.labels.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_core::dataset::SPARSE_FEATURE_COUNT;
    use pipeline_core::BatchOrigin;

    /// Rows whose first dense feature is large exactly when the label is 1.
    fn separable_batch(phase: Phase) -> Batch {
        let rows = 8;
        let mut dense = vec![0.0; rows * DENSE_FEATURE_COUNT];
        let mut labels = Vec::with_capacity(rows);
        for row in 0..rows {
            let positive = row % 2 == 0;
            dense[row * DENSE_FEATURE_COUNT] = if positive { 50.0 } else { 0.0 };
            labels.push(if positive { 1.0 } else { 0.0 });
        }
        Batch {
            origin: BatchOrigin { phase, index: 0 },
            num_rows: rows,
            dense,
            sparse: vec![0; rows * SPARSE_FEATURE_COUNT],
            labels,
        }
    }

    #[test]
    fn test_training_reduces_loss() {
        let mut probe = LinearProbe::new(0.5);
        let batch = separable_batch(Phase::Train);

        let first = probe.step(&batch, Phase::Train).unwrap().loss;
        for _ in 0..50 {
            probe.step(&batch, Phase::Train).unwrap();
        }
        let last = probe.step(&batch, Phase::Train).unwrap().loss;
        assert!(last < first);
        assert!(probe.weights()[0] > 0.0);
    }

    #[test]
    fn test_eval_does_not_update() {
        let mut probe = LinearProbe::default();
        let batch = separable_batch(Phase::Validate);

        let out = probe.step(&batch, Phase::Validate).unwrap();
        assert!(probe.weights().iter().all(|&w| w == 0.0));
        assert_eq!(out.logits, vec![0.0; 8]);
        assert!((out.loss - std::f32::consts::LN_2).abs() < 1e-6);
        assert_eq!(out.origin.phase, Phase::Validate);
    }

    #[test]
    fn test_rejects_mismatched_labels() {
        let mut probe = LinearProbe::default();
        let mut batch = separable_batch(Phase::Test);
        batch.labels.pop();
        assert!(probe.step(&batch, Phase::Test).is_err());
    }

    #[test]
    fn test_bce_is_stable() {
        assert!(bce_with_logit(100.0, 1.0).abs() < 1e-6);
        assert!((bce_with_logit(-100.0, 1.0) - 100.0).abs() < 1e-3);
        assert!(bce_with_logit(1e4, 0.0).is_finite());
    }
}
