//! FTRL-Proximal, the sparsity-oriented default.

use serde::{Deserialize, Serialize};

use sparsefleet_core::{FeaId, Progress};

use crate::{HandlerBase, L1L2, UpdateHandler};

/// Per-key state: weight, smoothed linear term and `sqrt(sum_t g_t^2)`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FtrlEntry {
    /// The weight.
    pub w: f32,
    /// The smoothed linear term.
    pub z: f32,
    /// `sqrt` of the accumulated squared gradient. Never negative.
    pub sq_cum_grad: f32,
}

/// FTRL-Proximal handle: per key,
/// `n' = sqrt(n^2 + g^2)`, `sigma = (n' - n) / alpha`,
/// `z <- z + g - sigma * w`, `w <- prox(-z, (beta + n') / alpha)`.
#[derive(Debug, Clone)]
pub struct FtrlHandle {
    base: HandlerBase,
}

impl FtrlHandle {
    /// Creates the handle with learning-rate parameters and penalty.
    pub fn new(alpha: f32, beta: f32, penalty: L1L2) -> Self {
        Self {
            base: HandlerBase::new(alpha, beta, penalty),
        }
    }
}

impl UpdateHandler for FtrlHandle {
    type Entry = FtrlEntry;

    fn start(&mut self, _is_push: bool) {}

    fn push(&mut self, _key: FeaId, grad: f32, entry: &mut FtrlEntry) {
        let n = entry.sq_cum_grad;
        entry.sq_cum_grad = (n * n + grad * grad).sqrt();

        let old_w = entry.w;
        let sigma = (entry.sq_cum_grad - n) / self.base.alpha;
        entry.z += grad - sigma * old_w;

        let eta = (self.base.beta + entry.sq_cum_grad) / self.base.alpha;
        entry.w = self.base.penalty.solve(-entry.z, eta);
        self.base.report(old_w, entry.w);
    }

    fn pull(&self, _key: FeaId, entry: &FtrlEntry) -> f32 {
        entry.w
    }

    fn finish(&mut self) -> Progress {
        self.base.take_progress()
    }

    fn weight(entry: &FtrlEntry) -> f32 {
        entry.w
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reference recurrence applied step by step on one key, checked to
    /// 1e-6: alpha=1, beta=1, lambda1=0.1, gradients 0.5, -0.2, 0.3.
    #[test]
    fn test_single_key_recurrence() {
        let mut h = FtrlHandle::new(1.0, 1.0, L1L2::new(0.1, 0.0));
        let mut e = FtrlEntry::default();

        h.start(true);
        h.push(1, 0.5, &mut e);
        // n = 0.5, sigma = 0.5, z = 0.5, w = prox(-0.5, 1.5) = -(0.4)/1.5.
        assert!((e.sq_cum_grad - 0.5).abs() < 1e-6);
        assert!((e.z - 0.5).abs() < 1e-6);
        assert!((e.w + 0.4 / 1.5).abs() < 1e-6);

        // Reference continuation computed from the defining recurrences.
        let mut n = 0.5f32;
        let mut z = 0.5f32;
        let mut w = e.w;
        for &g in &[-0.2f32, 0.3] {
            let n_new = (n * n + g * g).sqrt();
            let sigma = (n_new - n) / 1.0;
            z += g - sigma * w;
            let eta = (1.0 + n_new) / 1.0;
            w = if z.abs() <= 0.1 {
                0.0
            } else {
                -(z - z.signum() * 0.1) / eta
            };
            n = n_new;

            h.push(1, g, &mut e);
            assert!((e.sq_cum_grad - n).abs() < 1e-6);
            assert!((e.z - z).abs() < 1e-6);
            assert!((e.w - w).abs() < 1e-6);
        }
    }

    #[test]
    fn test_small_z_stays_exactly_zero() {
        let mut h = FtrlHandle::new(1.0, 1.0, L1L2::new(1.0, 0.0));
        let mut e = FtrlEntry::default();
        h.start(true);
        h.push(1, 0.5, &mut e);
        // |z| = 0.5 <= lambda1 = 1: thresholded to exact zero.
        assert_eq!(e.w, 0.0);
        assert!(e.sq_cum_grad > 0.0);
    }

    #[test]
    fn test_sq_cum_grad_never_negative() {
        let mut h = FtrlHandle::new(0.5, 1.0, L1L2::new(0.01, 0.01));
        let mut e = FtrlEntry::default();
        h.start(true);
        for &g in &[-3.0f32, 2.5, -0.001, 4.0] {
            h.push(1, g, &mut e);
            assert!(e.sq_cum_grad >= 0.0);
        }
    }

    #[test]
    fn test_entry_serde_round_trip() {
        let e = FtrlEntry {
            w: -0.25,
            z: 0.4,
            sq_cum_grad: 1.5,
        };
        let s = serde_json::to_string(&e).unwrap();
        let back: FtrlEntry = serde_json::from_str(&s).unwrap();
        assert_eq!(back.w, e.w);
        assert_eq!(back.z, e.z);
        assert_eq!(back.sq_cum_grad, e.sq_cum_grad);
    }
}
