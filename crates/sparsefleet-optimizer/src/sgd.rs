//! Plain SGD with a global decaying learning rate.

use serde::{Deserialize, Serialize};

use sparsefleet_core::{FeaId, Progress};

use crate::{HandlerBase, L1L2, UpdateHandler};

/// Per-key state: the weight alone.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SgdEntry {
    /// The weight.
    pub w: f32,
}

/// SGD handle. The effective inverse step `eta = (beta + sqrt(t)) / alpha`
/// is precomputed once per push batch in `start`, where `t` is the push-batch
/// counter; the per-key update is `w <- prox(eta * w - g, eta)`.
#[derive(Debug, Clone)]
pub struct SgdHandle {
    base: HandlerBase,
    /// Push-batch counter. Integer schedule, so replays of the same batch
    /// sequence reproduce entries bitwise.
    t: u64,
    eta: f32,
}

impl SgdHandle {
    /// Creates the handle with learning-rate parameters and penalty.
    pub fn new(alpha: f32, beta: f32, penalty: L1L2) -> Self {
        Self {
            base: HandlerBase::new(alpha, beta, penalty),
            t: 1,
            eta: 0.0,
        }
    }
}

impl UpdateHandler for SgdHandle {
    type Entry = SgdEntry;

    fn start(&mut self, is_push: bool) {
        if is_push {
            self.eta = (self.base.beta + (self.t as f32).sqrt()) / self.base.alpha;
            self.t += 1;
        }
    }

    fn push(&mut self, _key: FeaId, grad: f32, entry: &mut SgdEntry) {
        let old_w = entry.w;
        entry.w = self.base.penalty.solve(self.eta * entry.w - grad, self.eta);
        self.base.report(old_w, entry.w);
    }

    fn pull(&self, _key: FeaId, entry: &SgdEntry) -> f32 {
        entry.w
    }

    fn finish(&mut self) -> Progress {
        self.base.take_progress()
    }

    fn weight(entry: &SgdEntry) -> f32 {
        entry.w
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_batch_step() {
        let mut h = SgdHandle::new(1.0, 1.0, L1L2::default());
        let mut e = SgdEntry::default();
        h.start(true);
        // t = 1: eta = (1 + 1) / 1 = 2; w = -g / 2.
        h.push(7, 0.6, &mut e);
        assert!((e.w + 0.3).abs() < 1e-6);
        assert_eq!(h.pull(7, &e), e.w);
    }

    #[test]
    fn test_eta_grows_with_batches() {
        let mut h = SgdHandle::new(1.0, 1.0, L1L2::default());
        h.start(true);
        let eta1 = h.eta;
        h.start(true);
        let eta2 = h.eta;
        assert!(eta2 > eta1);
        // Pull batches do not advance the schedule.
        h.start(false);
        assert!((h.eta - eta2).abs() < 1e-9);
    }

    #[test]
    fn test_huge_l1_zeroes_every_weight() {
        let mut h = SgdHandle::new(1.0, 1.0, L1L2::new(1e9, 0.0));
        let mut e = SgdEntry { w: 0.5 };
        h.start(true);
        h.push(1, 0.3, &mut e);
        assert_eq!(e.w, 0.0);
    }

    #[test]
    fn test_integer_schedule_is_reproducible() {
        let run = || {
            let mut h = SgdHandle::new(0.3, 1.0, L1L2::new(0.01, 0.001));
            let mut e = SgdEntry::default();
            for g in [0.5f32, -0.2, 0.3, 0.05, -0.4] {
                h.start(true);
                h.push(1, g, &mut e);
                h.finish();
            }
            e.w
        };
        assert_eq!(run().to_bits(), run().to_bits());
    }

    #[test]
    fn test_nnz_reported_through_finish() {
        let mut h = SgdHandle::new(1.0, 1.0, L1L2::default());
        let mut e = SgdEntry::default();
        h.start(true);
        h.push(1, 1.0, &mut e);
        let prog = h.finish();
        assert_eq!(prog.nnz_w, 1);
    }
}
