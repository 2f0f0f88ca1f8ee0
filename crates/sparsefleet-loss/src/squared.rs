//! Squared loss.

use sparsefleet_core::Progress;
use sparsefleet_data::LocalizedBlock;

use crate::{binary_auc, linear_predict, Loss};

/// Squared loss bound to one minibatch: objective `0.5 * sum_i (p_i - y_i)^2`,
/// gradient per local coordinate `sum_i (p_i - y_i) x_ij`.
pub struct SquaredLoss {
    labels: Vec<f32>,
    pred: Vec<f32>,
}

impl SquaredLoss {
    /// Binds the loss to `rows` and the pulled `weights`.
    pub fn new(rows: &LocalizedBlock, weights: &[f32], threads: usize) -> Self {
        Self {
            labels: rows.labels.clone(),
            pred: linear_predict(rows, weights, threads),
        }
    }
}

impl Loss for SquaredLoss {
    fn evaluate(&self, progress: &mut Progress) {
        let objective: f64 = self
            .labels
            .iter()
            .zip(&self.pred)
            .map(|(&y, &p)| 0.5 * ((p - y) as f64).powi(2))
            .sum();

        progress.num_examples += self.labels.len() as i64;
        progress.minibatch_count += 1;
        progress.objective_sum += objective;
        progress.auc_sum += binary_auc(&self.labels, &self.pred);
    }

    fn calc_grad(&self, rows: &LocalizedBlock, buf: &mut [f32]) {
        buf.fill(0.0);
        for r in 0..rows.num_rows() {
            let residual = self.pred[r] - self.labels[r];
            for i in rows.offsets[r]..rows.offsets[r + 1] {
                buf[rows.indices[i] as usize] += residual * rows.value(i);
            }
        }
    }
}
