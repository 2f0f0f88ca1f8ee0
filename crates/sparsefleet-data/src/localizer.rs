//! Feature-ID localization.
//!
//! Rewrites a minibatch whose column indices are global feature IDs into a
//! minibatch indexed against a dense `0..m` space, plus the companion
//! `feaid` vector of the `m` unique IDs in ascending order. The pair is the
//! unit of pull/push traffic: ascending unique keys keep the RPCs compact
//! and order-independent.

use sparsefleet_core::FeaId;

use crate::row_block::{LocalizedBlock, RowBlock};

/// Localizes `block`, returning the rewritten rows and the sorted unique
/// feature-ID vector.
///
/// Row order and per-row lengths are preserved; `feaid` is strictly
/// ascending with no duplicates, and for every rewritten column `c`,
/// `feaid[c]` is the original global ID at that position. Runs in
/// O(nnz log u) for u unique IDs.
pub fn localize(block: &RowBlock) -> (LocalizedBlock, Vec<FeaId>) {
    let mut feaid = block.indices.clone();
    feaid.sort_unstable();
    feaid.dedup();

    let indices = block
        .indices
        .iter()
        .map(|id| {
            // Present by construction: feaid contains every id in the block.
            feaid.binary_search(id).unwrap() as u32
        })
        .collect();

    let local = LocalizedBlock {
        labels: block.labels.clone(),
        offsets: block.offsets.clone(),
        indices,
        values: block.values.clone(),
    };
    (local, feaid)
}
