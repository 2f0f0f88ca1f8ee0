//! Binary logistic loss over labels in {-1, +1}.

use sparsefleet_core::Progress;
use sparsefleet_data::LocalizedBlock;

use crate::{binary_auc, linear_predict, Loss};

/// Logistic loss bound to one minibatch.
///
/// Objective is `sum_i ln(1 + exp(-y_i p_i))`; the gradient per local
/// coordinate j is `sum_i dl/dp_i * x_ij` with
/// `dl/dp_i = -y_i / (1 + exp(y_i p_i))`.
pub struct LogisticLoss {
    labels: Vec<f32>,
    pred: Vec<f32>,
}

impl LogisticLoss {
    /// Binds the loss to `rows` and the pulled `weights`, computing
    /// predictions up front.
    pub fn new(rows: &LocalizedBlock, weights: &[f32], threads: usize) -> Self {
        Self {
            labels: rows.labels.clone(),
            pred: linear_predict(rows, weights, threads),
        }
    }

    #[inline]
    fn sign_label(y: f32) -> f32 {
        if y > 0.0 {
            1.0
        } else {
            -1.0
        }
    }
}

impl Loss for LogisticLoss {
    fn evaluate(&self, progress: &mut Progress) {
        let mut objective = 0.0f64;
        for (&y, &p) in self.labels.iter().zip(&self.pred) {
            let margin = Self::sign_label(y) * p;
            // ln(1 + exp(-m)) computed in the numerically stable branch.
            objective += if margin > 0.0 {
                ((-margin as f64).exp() + 1.0).ln()
            } else {
                -margin as f64 + ((margin as f64).exp() + 1.0).ln()
            };
        }

        progress.num_examples += self.labels.len() as i64;
        progress.minibatch_count += 1;
        progress.objective_sum += objective;
        progress.auc_sum += binary_auc(&self.labels, &self.pred);
    }

    fn calc_grad(&self, rows: &LocalizedBlock, buf: &mut [f32]) {
        buf.fill(0.0);
        for r in 0..rows.num_rows() {
            let y = Self::sign_label(self.labels[r]);
            let dldp = -y / (1.0 + (y * self.pred[r]).exp());
            for i in rows.offsets[r]..rows.offsets[r + 1] {
                buf[rows.indices[i] as usize] += dldp * rows.value(i);
            }
        }
    }
}
