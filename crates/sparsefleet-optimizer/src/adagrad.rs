//! AdaGrad with a per-coordinate learning rate.

use serde::{Deserialize, Serialize};

use sparsefleet_core::{FeaId, Progress};

use crate::{HandlerBase, L1L2, UpdateHandler};

/// Per-key state: the weight and `sqrt(sum_t g_t^2)`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AdagradEntry {
    /// The weight.
    pub w: f32,
    /// `sqrt` of the accumulated squared gradient. Never negative.
    pub sq_cum_grad: f32,
}

/// AdaGrad handle: per key, `n' = sqrt(n^2 + g^2)`,
/// `eta = (n' + beta) / alpha`, `w <- prox(eta * w - g, eta)`.
#[derive(Debug, Clone)]
pub struct AdagradHandle {
    base: HandlerBase,
}

impl AdagradHandle {
    /// Creates the handle with learning-rate parameters and penalty.
    pub fn new(alpha: f32, beta: f32, penalty: L1L2) -> Self {
        Self {
            base: HandlerBase::new(alpha, beta, penalty),
        }
    }
}

impl UpdateHandler for AdagradHandle {
    type Entry = AdagradEntry;

    fn start(&mut self, _is_push: bool) {}

    fn push(&mut self, _key: FeaId, grad: f32, entry: &mut AdagradEntry) {
        let n = entry.sq_cum_grad;
        entry.sq_cum_grad = (n * n + grad * grad).sqrt();

        let eta = (entry.sq_cum_grad + self.base.beta) / self.base.alpha;
        let old_w = entry.w;
        entry.w = self.base.penalty.solve(eta * old_w - grad, eta);
        self.base.report(old_w, entry.w);
    }

    fn pull(&self, _key: FeaId, entry: &AdagradEntry) -> f32 {
        entry.w
    }

    fn finish(&mut self) -> Progress {
        self.base.take_progress()
    }

    fn weight(entry: &AdagradEntry) -> f32 {
        entry.w
    }
}
