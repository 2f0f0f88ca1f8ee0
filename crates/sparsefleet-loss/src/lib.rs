//! Loss modules for the worker pipeline.
//!
//! A loss is bound to one localized minibatch and the weight buffer pulled
//! for it. Construction computes the predictions (in parallel over rows via
//! rayon when `threads > 1`); [`Loss::evaluate`] folds objective, AUC and
//! example counts into a progress record; [`Loss::calc_grad`] overwrites a
//! buffer with per-coordinate gradients aligned to the pulled `feaid`
//! vector.

use sparsefleet_core::config::LossKind;
use sparsefleet_core::Progress;
use sparsefleet_data::LocalizedBlock;

mod auc;
mod fm;
mod logistic;
mod squared;

pub use auc::binary_auc;
pub use fm::FmLoss;
pub use logistic::LogisticLoss;
pub use squared::SquaredLoss;

/// A loss bound to one minibatch and its pulled weights.
pub trait Loss: Send {
    /// Folds this minibatch's objective sum, AUC and counts into `progress`.
    fn evaluate(&self, progress: &mut Progress);

    /// Overwrites `buf` with per-coordinate gradients. On entry `buf` holds
    /// the pulled weights; on exit it holds the gradient aligned to the same
    /// `feaid` vector.
    fn calc_grad(&self, rows: &LocalizedBlock, buf: &mut [f32]);
}

/// Builds the configured loss bound to `rows` and `weights`.
///
/// `dim_v` is only consulted by the FM loss, whose per-key weight layout is
/// `[w, v_1..v_dim_v]`.
pub fn create_loss(
    kind: LossKind,
    dim_v: usize,
    rows: &LocalizedBlock,
    weights: &[f32],
    threads: usize,
) -> Box<dyn Loss> {
    match kind {
        LossKind::Logistic => Box::new(LogisticLoss::new(rows, weights, threads)),
        LossKind::Squared => Box::new(SquaredLoss::new(rows, weights, threads)),
        LossKind::Fm => Box::new(FmLoss::new(rows, weights, dim_v, threads)),
    }
}

/// Computes linear predictions `x_i . w` for every row.
pub(crate) fn linear_predict(rows: &LocalizedBlock, w: &[f32], threads: usize) -> Vec<f32> {
    let predict_row = |r: usize| -> f32 {
        let mut p = 0.0f32;
        for i in rows.offsets[r]..rows.offsets[r + 1] {
            p += w[rows.indices[i] as usize] * rows.value(i);
        }
        p
    };

    if threads > 1 && rows.num_rows() > 1 {
        use rayon::prelude::*;
        (0..rows.num_rows()).into_par_iter().map(predict_row).collect()
    } else {
        (0..rows.num_rows()).map(predict_row).collect()
    }
}
