//! Minibatch AUC via the rank-sum statistic.

/// AUC over one minibatch: labels > 0 are positives, everything else
/// negative. Tied scores share their average rank. A single-class minibatch
/// contributes the neutral 0.5.
pub fn binary_auc(labels: &[f32], scores: &[f32]) -> f64 {
    debug_assert_eq!(labels.len(), scores.len());
    let n = labels.len();
    let num_pos = labels.iter().filter(|&&y| y > 0.0).count();
    let num_neg = n - num_pos;
    if num_pos == 0 || num_neg == 0 {
        return 0.5;
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    // Sum of positive ranks, averaging ranks within tied-score runs.
    let mut rank_sum = 0.0f64;
    let mut i = 0;
    while i < n {
        let mut j = i;
        while j + 1 < n && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            if labels[idx] > 0.0 {
                rank_sum += avg_rank;
            }
        }
        i = j + 1;
    }

    let pos = num_pos as f64;
    let neg = num_neg as f64;
    (rank_sum - pos * (pos + 1.0) / 2.0) / (pos * neg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_perfect_separation() {
        let labels = [1.0, 1.0, -1.0, -1.0];
        let scores = [0.9, 0.8, 0.2, 0.1];
        assert!((binary_auc(&labels, &scores) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_inverted_separation() {
        let labels = [1.0, -1.0];
        let scores = [0.1, 0.9];
        assert!(binary_auc(&labels, &scores).abs() < 1e-12);
    }

    #[test]
    fn test_ties_average_to_half() {
        let labels = [1.0, -1.0, 1.0, -1.0];
        let scores = [0.5, 0.5, 0.5, 0.5];
        assert!((binary_auc(&labels, &scores) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_single_class_is_neutral() {
        let labels = [1.0, 1.0];
        let scores = [0.3, 0.7];
        assert!((binary_auc(&labels, &scores) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_partial_ranking() {
        // One inversion among 2x2: AUC = 3/4.
        let labels = [1.0, -1.0, 1.0, -1.0];
        let scores = [0.9, 0.6, 0.5, 0.1];
        assert!((binary_auc(&labels, &scores) - 0.75).abs() < 1e-12);
    }
}
