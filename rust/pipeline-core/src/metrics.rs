// rust/pipeline-core/src/metrics.rs

//! Evaluation metrics accumulated over one Validate or Test phase.

use crate::pipeline::StepOutput;

/// Accumulates step outputs of one phase.
pub trait PhaseMetrics {
    fn update(&mut self, output: &StepOutput);

    /// Rows seen so far.
    fn count(&self) -> usize;

    /// Area under the ROC curve, `NaN` unless both classes were seen.
    fn auroc(&self) -> f64;

    /// Fraction of rows classified correctly, `NaN` for an empty phase.
    fn accuracy(&self) -> f64;
}

/// Binary classification metrics over logits.
///
/// A row is predicted positive when `sigmoid(logit) >= 0.5`, i.e. when the
/// logit is non-negative, and labelled positive when its label is `>= 0.5`.
#[derive(Debug, Clone, Default)]
pub struct BinaryMetrics {
    scores: Vec<f32>,
    labels: Vec<bool>,
}

impl BinaryMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PhaseMetrics for BinaryMetrics {
    fn update(&mut self, output: &StepOutput) {
        for (&logit, &label) in output.logits.iter().zip(&output.labels) {
            self.scores.push(logit);
            self.labels.push(label >= 0.5);
        }
    }

    fn count(&self) -> usize {
        self.scores.len()
    }

    fn auroc(&self) -> f64 {
        let positives = self.labels.iter().filter(|&&l| l).count();
        let negatives = self.labels.len() - positives;
        if positives == 0 || negatives == 0 {
            return f64::NAN;
        }

        let mut order: Vec<usize> = (0..self.scores.len()).collect();
        order.sort_by(|&a, &b| self.scores[a].total_cmp(&self.scores[b]));

        // Sum of 1-based ranks of the positives, ties get their mean rank
        let mut positive_rank_sum = 0.0;
        let mut start = 0;
        while start < order.len() {
            let mut end = start + 1;
            while end < order.len() && self.scores[order[end]] == self.scores[order[start]] {
                end += 1;
            }
            let mean_rank = (start + end + 1) as f64 / 2.0;
            let tied_positives = order[start..end].iter().filter(|&&i| self.labels[i]).count();
            positive_rank_sum += mean_rank * tied_positives as f64;
            start = end;
        }

        let positives = positives as f64;
        let negatives = negatives as f64;
        (positive_rank_sum - positives * (positives + 1.0) / 2.0) / (positives * negatives)
    }

    fn accuracy(&self) -> f64 {
        if self.scores.is_empty() {
            return f64::NAN;
        }
        let correct = self
            .scores
            .iter()
            .zip(&self.labels)
            .filter(|&(&score, &label)| (score >= 0.0) == label)
            .count();
        correct as f64 / self.scores.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{BatchOrigin, Phase};

    fn output(logits: Vec<f32>, labels: Vec<f32>) -> StepOutput {
        StepOutput {
            origin: BatchOrigin { phase: Phase::Validate, index: 0 },
            loss: 0.0,
            logits,
            labels,
        }
    }

    #[test]
    fn test_perfect_separation() {
        let mut m = BinaryMetrics::new();
        m.update(&output(vec![-2.0, -1.0, 1.0, 3.0], vec![0.0, 0.0, 1.0, 1.0]));

        assert_eq!(m.count(), 4);
        assert_eq!(m.auroc(), 1.0);
        assert_eq!(m.accuracy(), 1.0);
    }

    #[test]
    fn test_inverted_scores() {
        let mut m = BinaryMetrics::new();
        m.update(&output(vec![2.0, 1.0], vec![0.0, 0.0]));
        m.update(&output(vec![-1.0, -2.0], vec![1.0, 1.0]));

        assert_eq!(m.auroc(), 0.0);
        assert_eq!(m.accuracy(), 0.0);
    }

    #[test]
    fn test_ties_count_half() {
        let mut m = BinaryMetrics::new();
        m.update(&output(vec![0.5, 0.5], vec![1.0, 0.0]));
        assert!((m.auroc() - 0.5).abs() < 1e-12);

        let mut m = BinaryMetrics::new();
        // pairs: (0.9 vs 0.1) win, (0.9 vs 0.5) win, (0.5 vs 0.1) win, (0.5 vs 0.5) tie
        m.update(&output(vec![0.9, 0.5, 0.5, 0.1], vec![1.0, 1.0, 0.0, 0.0]));
        assert!((m.auroc() - 3.5 / 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_degenerate_inputs() {
        let m = BinaryMetrics::new();
        assert!(m.auroc().is_nan());
        assert!(m.accuracy().is_nan());

        let mut m = BinaryMetrics::new();
        m.update(&output(vec![1.0, -1.0], vec![1.0, 1.0]));
        assert!(m.auroc().is_nan());
        assert_eq!(m.accuracy(), 0.5);
    }
}
