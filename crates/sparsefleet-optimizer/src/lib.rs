//! Online update handlers applied per key on a parameter-server shard.
//!
//! A handler is chosen once, at shard construction, and sees every batched
//! push and pull through the hook sequence `start` (once per batch), `init`
//! (once per key, on the first push observing it), `push`/`pull` (per key),
//! and `finish` (once per batch, draining the handler's progress delta).
//!
//! All three handlers share the L1/L2 proximal step
//! `prox(u, eta) = sign(u) * max(0, |u| - lambda1) / (eta + lambda2)`,
//! which maps `[-lambda1, lambda1]` to exactly zero and produces the sparse
//! models this system exists for.

use serde::de::DeserializeOwned;
use serde::Serialize;

use sparsefleet_core::{FeaId, Progress};

mod adagrad;
mod ftrl;
mod sgd;

pub use adagrad::{AdagradEntry, AdagradHandle};
pub use ftrl::{FtrlEntry, FtrlHandle};
pub use sgd::{SgdEntry, SgdHandle};

/// The L1/L2 penalty pair and its proximal operator.
#[derive(Debug, Clone, Copy, Default)]
pub struct L1L2 {
    /// L1 penalty.
    pub lambda1: f32,
    /// L2 penalty.
    pub lambda2: f32,
}

impl L1L2 {
    /// Creates the penalty pair.
    pub fn new(lambda1: f32, lambda2: f32) -> Self {
        Self { lambda1, lambda2 }
    }

    /// The proximal step: soft-thresholds `u` by `lambda1` and scales by
    /// `eta + lambda2`. Monotone in `u` outside `[-lambda1, lambda1]`,
    /// exactly zero inside it.
    #[inline]
    pub fn solve(&self, u: f32, eta: f32) -> f32 {
        if u.abs() <= self.lambda1 {
            0.0
        } else {
            let shrunk = u.signum() * (u.abs() - self.lambda1);
            shrunk / (eta + self.lambda2)
        }
    }
}

/// Hook contract between a shard and its update algorithm.
pub trait UpdateHandler: Send + 'static {
    /// Per-key state owned by the shard.
    type Entry: Default + Clone + Send + Serialize + DeserializeOwned + 'static;

    /// Called once per incoming batch. Push batches may update epoch-wide
    /// state such as SGD's iteration counter.
    fn start(&mut self, is_push: bool);

    /// Called exactly once when a key is first observed by a push; `entry`
    /// is zero-initialized beforehand.
    fn init(&mut self, key: FeaId, entry: &mut Self::Entry) {
        let _ = (key, entry);
    }

    /// Applies one gradient to `entry`.
    fn push(&mut self, key: FeaId, grad: f32, entry: &mut Self::Entry);

    /// Reads the weight served for `entry`.
    fn pull(&self, key: FeaId, entry: &Self::Entry) -> f32;

    /// Called once per batch; drains the progress delta accumulated since
    /// the previous `finish` (nnz changes, clamp counts).
    fn finish(&mut self) -> Progress;

    /// The weight stored in `entry`, for model persistence.
    fn weight(entry: &Self::Entry) -> f32;
}

/// State common to the SGD-family handlers: learning-rate parameters, the
/// penalty, and the nnz(w) delta accumulated between `finish` calls.
#[derive(Debug, Clone)]
pub struct HandlerBase {
    /// Learning-rate scale (alpha).
    pub alpha: f32,
    /// Learning-rate offset (beta). Positive by configuration-time
    /// invariant, which also keeps the proximal denominator nonzero.
    pub beta: f32,
    /// The L1/L2 penalty.
    pub penalty: L1L2,
    nnz_delta: i64,
}

impl HandlerBase {
    /// Creates the shared state. `beta` must be positive.
    pub fn new(alpha: f32, beta: f32, penalty: L1L2) -> Self {
        debug_assert!(beta > 0.0);
        Self {
            alpha,
            beta,
            penalty,
            nnz_delta: 0,
        }
    }

    /// Accumulates the nnz(w) change of one weight update.
    #[inline]
    pub fn report(&mut self, old_w: f32, new_w: f32) {
        if old_w == 0.0 && new_w != 0.0 {
            self.nnz_delta += 1;
        } else if new_w == 0.0 && old_w != 0.0 {
            self.nnz_delta -= 1;
        }
    }

    /// Drains the accumulated delta into a progress record.
    pub fn take_progress(&mut self) -> Progress {
        let delta = std::mem::take(&mut self.nnz_delta);
        Progress {
            nnz_w: delta,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prox_zero_interval() {
        let p = L1L2::new(0.5, 0.0);
        for u in [-0.5f32, -0.25, 0.0, 0.25, 0.5] {
            assert_eq!(p.solve(u, 1.0), 0.0, "u={u}");
        }
    }

    #[test]
    fn test_prox_monotone_outside_interval() {
        let p = L1L2::new(0.5, 0.1);
        let us: Vec<f32> = (-20..=20).map(|i| i as f32 * 0.25).collect();
        let ys: Vec<f32> = us.iter().map(|&u| p.solve(u, 2.0)).collect();
        for w in ys.windows(2) {
            assert!(w[0] <= w[1]);
        }
    }

    #[test]
    fn test_prox_shrinkage_value() {
        let p = L1L2::new(0.1, 0.0);
        // Prox(-0.5, 1.5) = -(0.5 - 0.1) / 1.5.
        let got = p.solve(-0.5, 1.5);
        assert!((got + 0.4 / 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_prox_l2_scales_denominator() {
        let p = L1L2::new(0.0, 1.0);
        assert!((p.solve(2.0, 1.0) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_report_tracks_sign_transitions() {
        let mut base = HandlerBase::new(1.0, 1.0, L1L2::default());
        base.report(0.0, 0.5); // new nonzero
        base.report(0.5, 0.2); // stays nonzero
        base.report(0.2, 0.0); // zeroed
        base.report(0.0, 0.0); // no-op
        let prog = base.take_progress();
        assert_eq!(prog.nnz_w, 0);
        // Drained: next finish sees nothing.
        assert!(base.take_progress().is_empty());
    }
}
