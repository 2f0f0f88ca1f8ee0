//! Factorization-machine loss with a logistic link.
//!
//! The weight buffer holds `1 + dim_v` floats per pulled key, laid out
//! `[w, v_1..v_dim_v]`. Prediction for row i is
//!
//! ```text
//! p_i = sum_j w_j x_ij + 0.5 * sum_f [ S_if^2 - sum_j v_jf^2 x_ij^2 ]
//! S_if = sum_j v_jf x_ij
//! ```
//!
//! The per-row factor sums `S` are computed once at construction and reused
//! by the gradient.

use sparsefleet_core::Progress;
use sparsefleet_data::LocalizedBlock;

use crate::{binary_auc, Loss};

/// FM loss bound to one minibatch.
pub struct FmLoss {
    labels: Vec<f32>,
    pred: Vec<f32>,
    /// Row-major `num_rows x dim_v` factor sums.
    factor_sums: Vec<f32>,
    dim_v: usize,
}

impl FmLoss {
    /// Binds the loss to `rows` and the pulled `weights`
    /// (`rows unique keys * (1 + dim_v)` floats).
    pub fn new(rows: &LocalizedBlock, weights: &[f32], dim_v: usize, threads: usize) -> Self {
        let d = 1 + dim_v;
        let n = rows.num_rows();
        debug_assert_eq!(weights.len() % d, 0);

        let predict_row = |r: usize| -> (f32, Vec<f32>) {
            let mut linear = 0.0f32;
            let mut sums = vec![0.0f32; dim_v];
            let mut sq_sums = vec![0.0f32; dim_v];
            for i in rows.offsets[r]..rows.offsets[r + 1] {
                let x = rows.value(i);
                let base = rows.indices[i] as usize * d;
                linear += weights[base] * x;
                for f in 0..dim_v {
                    let vx = weights[base + 1 + f] * x;
                    sums[f] += vx;
                    sq_sums[f] += vx * vx;
                }
            }
            let interaction: f32 = sums
                .iter()
                .zip(&sq_sums)
                .map(|(s, q)| 0.5 * (s * s - q))
                .sum();
            (linear + interaction, sums)
        };

        let per_row: Vec<(f32, Vec<f32>)> = if threads > 1 && n > 1 {
            use rayon::prelude::*;
            (0..n).into_par_iter().map(predict_row).collect()
        } else {
            (0..n).map(predict_row).collect()
        };

        let mut pred = Vec::with_capacity(n);
        let mut factor_sums = Vec::with_capacity(n * dim_v);
        for (p, sums) in per_row {
            pred.push(p);
            factor_sums.extend(sums);
        }

        Self {
            labels: rows.labels.clone(),
            pred,
            factor_sums,
            dim_v,
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

impl Loss for FmLoss {
    fn evaluate(&self, progress: &mut Progress) {
        let mut objective = 0.0f64;
        for (&y, &p) in self.labels.iter().zip(&self.pred) {
            let margin = Self::sign_label(y) * p;
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
        let d = 1 + self.dim_v;
        // `buf` holds the pulled weights on entry and the gradient on exit;
        // the factor gradient reads v, so accumulate into a fresh vector.
        let mut grad = vec![0.0f32; buf.len()];

        for r in 0..rows.num_rows() {
            let y = Self::sign_label(self.labels[r]);
            let dldp = -y / (1.0 + (y * self.pred[r]).exp());
            let sums = &self.factor_sums[r * self.dim_v..(r + 1) * self.dim_v];
            for i in rows.offsets[r]..rows.offsets[r + 1] {
                let x = rows.value(i);
                let base = rows.indices[i] as usize * d;
                grad[base] += dldp * x;
                for f in 0..self.dim_v {
                    let v = buf[base + 1 + f];
                    grad[base + 1 + f] += dldp * x * (sums[f] - v * x);
                }
            }
        }

        buf.copy_from_slice(&grad);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block() -> LocalizedBlock {
        LocalizedBlock {
            labels: vec![1.0, -1.0],
            offsets: vec![0, 2, 3],
            indices: vec![0, 1, 1],
            values: vec![1.0, 0.5, 2.0],
        }
    }

    #[test]
    fn test_reduces_to_linear_when_factors_zero() {
        let rows = block();
        let dim_v = 2;
        // w = [0.4, -0.6], all v = 0.
        let weights = vec![0.4, 0.0, 0.0, -0.6, 0.0, 0.0];
        let fm = FmLoss::new(&rows, &weights, dim_v, 1);
        assert!((fm.pred[0] - (0.4 - 0.3)).abs() < 1e-6);
        assert!((fm.pred[1] - (-1.2)).abs() < 1e-6);
    }

    #[test]
    fn test_pairwise_interaction_term() {
        // One row, two features, one factor: p = w.x + v0 v1 x0 x1.
        let rows = LocalizedBlock {
            labels: vec![1.0],
            offsets: vec![0, 2],
            indices: vec![0, 1],
            values: vec![1.0, 1.0],
        };
        let weights = vec![0.0, 2.0, 0.0, 3.0];
        let fm = FmLoss::new(&rows, &weights, 1, 1);
        assert!((fm.pred[0] - 6.0).abs() < 1e-6);
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let rows = block();
        let dim_v = 2;
        let weights = vec![0.3f32, 0.1, -0.2, -0.4, 0.2, 0.05];
        let eps = 1e-3f32;

        let objective = |w: &[f32]| -> f64 {
            let fm = FmLoss::new(&rows, w, dim_v, 1);
            let mut p = Progress::new();
            fm.evaluate(&mut p);
            p.objective_sum
        };

        let fm = FmLoss::new(&rows, &weights, dim_v, 1);
        let mut grad = weights.clone();
        fm.calc_grad(&rows, &mut grad);

        for j in 0..weights.len() {
            let mut wp = weights.clone();
            wp[j] += eps;
            let mut wm = weights.clone();
            wm[j] -= eps;
            let numeric = (objective(&wp) - objective(&wm)) / (2.0 * eps as f64);
            assert!(
                (grad[j] as f64 - numeric).abs() < 1e-2,
                "coord {j}: analytic {} vs numeric {numeric}",
                grad[j]
            );
        }
    }

    #[test]
    fn test_parallel_matches_serial() {
        let rows = block();
        let weights = vec![0.3f32, 0.1, -0.2, -0.4, 0.2, 0.05];
        let serial = FmLoss::new(&rows, &weights, 2, 1);
        let parallel = FmLoss::new(&rows, &weights, 2, 4);
        assert_eq!(serial.pred, parallel.pred);
        assert_eq!(serial.factor_sums, parallel.factor_sums);
    }
}
