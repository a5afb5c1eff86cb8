//! Weighted-random starting-index iteration (spec.md glossary: "Weighted
//! random index"), ported verbatim from
//! `original_source/utils/util.go:ForEachFromRandomIndexWithPossibility`.
//!
//! Pick a uniform random number in `[0, total_weight)`, walk the weights
//! accumulating until the running sum exceeds it — that's the start index —
//! then iterate from there, wrapping around so every element is visited
//! exactly once.

use rand::Rng;

/// Call `visit(i)` for each index `0..weights.len()`, starting from a
/// weight-biased random index and wrapping around, stopping early the
/// first time `visit` returns `true`. Returns whether `visit` ever
/// returned `true`.
///
/// If `total_weight` is `0` (every candidate has weight 0, or the slice is
/// empty), falls back to a uniform random start — every backend with
/// weight 0 still participates in serving, just never in the weighted
/// draw (spec.md §3: "`weight=0` backends participate in serving but not
/// in random selection").
pub fn for_each_from_random_index(weights: &[u32], mut visit: impl FnMut(usize) -> bool) -> bool {
    let len = weights.len();
    if len == 0 {
        return false;
    }
    let total: u64 = weights.iter().map(|&w| w as u64).sum();
    let start = if total == 0 {
        rand::thread_rng().gen_range(0..len)
    } else {
        let mut n = rand::thread_rng().gen_range(0..total);
        let mut start = 0;
        for (i, &w) in weights.iter().enumerate() {
            if n < w as u64 {
                start = i;
                break;
            }
            n -= w as u64;
        }
        start
    };

    for i in start..len {
        if visit(i) {
            return true;
        }
    }
    for i in 0..start {
        if visit(i) {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn visits_every_index_exactly_once() {
        let weights = vec![10, 0, 30, 60];
        for _ in 0..200 {
            let mut seen = Vec::new();
            for_each_from_random_index(&weights, |i| {
                seen.push(i);
                false
            });
            assert_eq!(seen.len(), weights.len());
            let unique: HashSet<_> = seen.iter().copied().collect();
            assert_eq!(unique.len(), weights.len());
        }
    }

    #[test]
    fn stops_on_first_true() {
        let weights = vec![1, 1, 1, 1];
        let mut visited = 0;
        for_each_from_random_index(&weights, |_| {
            visited += 1;
            true
        });
        assert_eq!(visited, 1);
    }

    #[test]
    fn all_zero_weights_still_visits_everything() {
        let weights = vec![0, 0, 0];
        let mut count = 0;
        for_each_from_random_index(&weights, |_| {
            count += 1;
            false
        });
        assert_eq!(count, 3);
    }

    #[test]
    fn empty_slice_returns_false_immediately() {
        let weights: Vec<u32> = vec![];
        let mut called = false;
        let result = for_each_from_random_index(&weights, |_| {
            called = true;
            true
        });
        assert!(!result);
        assert!(!called);
    }

    proptest::proptest! {
        /// spec.md §8, property 1: "For any non-empty weight vector (including
        /// all-zero), a single pass of `ForEachFromRandomIndex` visits every
        /// index exactly once."
        #[test]
        fn every_index_visited_exactly_once_for_arbitrary_weights(
            weights in proptest::collection::vec(0u32..1000, 1..20)
        ) {
            let mut seen = Vec::new();
            for_each_from_random_index(&weights, |i| {
                seen.push(i);
                false
            });
            seen.sort_unstable();
            let expected: Vec<usize> = (0..weights.len()).collect();
            proptest::prop_assert_eq!(seen, expected);
        }
    }

    #[test]
    fn distribution_roughly_matches_weights() {
        // Heavier-weighted entries should be chosen as the start index
        // more often. Not a strict statistical test, just a sanity check
        // that weight 0 is never the start when another option exists.
        let weights = vec![0, 100];
        let mut zero_starts = 0;
        for _ in 0..500 {
            for_each_from_random_index(&weights, |i| {
                if i == 0 {
                    zero_starts += 1;
                }
                true
            });
        }
        assert_eq!(zero_starts, 0);
    }
}
