//! Trial-type selection shared by all paradigm adapters.
//!
//! Three modes pick which condition each trial presents:
//!
//! - [`SelectionMode::Iid`]: independent inverse-CDF draws, proportions are only approximate.
//! - [`SelectionMode::BalancedShuffle`]: exact counts (up to rounding), then a uniform permutation.
//! - [`SelectionMode::CsvPreset`]: replay of a supplied index sequence, truncated or repeated.
//!
//! [`repair_max_consecutive`] optionally post-processes a sequence to cap runs of one condition.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::sampling::inverse_cdf;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    Iid,
    BalancedShuffle,
    CsvPreset,
}

impl fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                SelectionMode::Iid => "iid",
                SelectionMode::BalancedShuffle => "balanced_shuffle",
                SelectionMode::CsvPreset => "csv_preset",
            }
        )
    }
}

/// The `selection` block of a paradigm configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelectionConfig {
    pub mode: SelectionMode,
    #[serde(default)]
    pub seed: Option<u64>,
    /// Condition indices replayed by `csv_preset`.
    #[serde(default)]
    pub sequence: Option<Vec<usize>>,
}

impl SelectionConfig {
    pub fn new(mode: SelectionMode) -> Self {
        Self {
            mode,
            seed: None,
            sequence: None,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}

/// Independent draws: each trial picks the first category whose cumulative probability
/// reaches `r ~ U(0, 1)`.
pub fn iid<R: Rng>(probabilities: &[f64], n_trials: usize, rng: &mut R) -> Vec<usize> {
    (0..n_trials)
        .map(|_| inverse_cdf(probabilities, rng.random::<f64>()))
        .collect()
}

/// Exact per-condition counts for `n_trials`.
///
/// Each count is `round(p_i * n_trials)`; when the rounded counts miss `n_trials`, the signed
/// remainder is added to the (first) largest count. A deficit larger than that count empties
/// it and the rest is taken from the next largest, so the counts always sum to `n_trials`.
pub fn balanced_counts(probabilities: &[f64], n_trials: usize) -> Vec<usize> {
    let mut counts: Vec<usize> = probabilities
        .iter()
        .map(|p| (p * n_trials as f64).round().max(0.) as usize)
        .collect();
    let total: usize = counts.iter().sum();
    if total < n_trials {
        if let Some(largest) = first_largest(&counts) {
            counts[largest] += n_trials - total;
        }
    }
    let mut deficit = total.saturating_sub(n_trials);
    while deficit > 0 {
        let Some(largest) = first_largest(&counts) else { break };
        let taken = deficit.min(counts[largest]);
        if taken == 0 {
            break;
        }
        counts[largest] -= taken;
        deficit -= taken;
    }
    counts
}

fn first_largest(counts: &[usize]) -> Option<usize> {
    let mut largest: Option<usize> = None;
    for (i, count) in counts.iter().enumerate() {
        if largest.map_or(true, |l| *count > counts[l]) {
            largest = Some(i);
        }
    }
    largest
}

/// Exact-count sequence in uniformly random order.
pub fn balanced_shuffle<R: Rng>(probabilities: &[f64], n_trials: usize, rng: &mut R) -> Vec<usize> {
    let mut sequence: Vec<usize> = balanced_counts(probabilities, n_trials)
        .into_iter()
        .enumerate()
        .flat_map(|(i, count)| std::iter::repeat(i).take(count))
        .collect();
    sequence.shuffle(rng);
    sequence
}

/// Replays `preset`, truncating it or repeating it cyclically to reach `n_trials`.
pub fn csv_preset(preset: &[usize], n_trials: usize) -> Vec<usize> {
    if preset.is_empty() {
        return Vec::new();
    }
    preset.iter().copied().cycle().take(n_trials).collect()
}

/// Caps runs of `target` at `limit` with a single greedy left-to-right pass.
///
/// Whenever the run of `target` exceeds `limit`, the offending entry is swapped with the next
/// later entry holding a different condition and the run counter restarts. This is a local fix,
/// not a minimal rearrangement: when no different condition remains to the right the scan stops,
/// and the sequence may still violate the limit. Returns whether the final sequence satisfies it.
pub fn repair_max_consecutive(sequence: &mut [usize], target: usize, limit: usize) -> bool {
    let mut run = 0;
    let mut i = 0;
    while i < sequence.len() {
        if sequence[i] == target {
            run += 1;
            if run > limit {
                match (i + 1..sequence.len()).find(|&j| sequence[j] != target) {
                    Some(j) => {
                        sequence.swap(i, j);
                        run = 0;
                    }
                    None => break,
                }
            }
        } else {
            run = 0;
        }
        i += 1;
    }
    max_run(sequence, target) <= limit
}

/// Longest run of `target` in `sequence`.
pub fn max_run(sequence: &[usize], target: usize) -> usize {
    let mut longest = 0;
    let mut run = 0;
    for &value in sequence {
        if value == target {
            run += 1;
            longest = longest.max(run);
        } else {
            run = 0;
        }
    }
    longest
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_pcg::Pcg64;

    #[test]
    fn balanced_counts_sum_to_n() {
        for n in [1usize, 7, 10, 33, 100, 101, 999] {
            for probs in [
                vec![0.8, 0.2],
                vec![1. / 3., 1. / 3., 1. / 3.],
                vec![0.5, 0.25, 0.125, 0.125],
                vec![0.05, 0.95],
            ] {
                let counts = balanced_counts(&probs, n);
                assert_eq!(counts.iter().sum::<usize>(), n, "n={n}, p={probs:?}");
                for (c, p) in counts.iter().zip(&probs) {
                    // Only the largest count absorbs the remainder; others are exact roundings
                    let rounded = (p * n as f64).round() as i64;
                    assert!((*c as i64 - rounded).abs() <= probs.len() as i64);
                }
            }
        }
    }

    #[test]
    fn remainder_goes_to_largest_count() {
        // 3 * round(10/3) = 9, remainder 1 lands on the first largest
        assert_eq!(balanced_counts(&[1. / 3., 1. / 3., 1. / 3.], 10), vec![4, 3, 3]);
        // round(0.5)=1 twice for n=1, remainder -1 taken from the first largest
        assert_eq!(balanced_counts(&[0.5, 0.5], 1), vec![0, 1]);
    }

    #[test]
    fn balanced_counts_spill_a_large_deficit() {
        // Every count rounds up to 1, the deficit of 2 empties the first two
        assert_eq!(balanced_counts(&[0.25; 4], 2), vec![0, 0, 1, 1]);
        assert_eq!(balanced_counts(&[0.125; 8], 4), vec![0, 0, 0, 0, 1, 1, 1, 1]);
        for n in 0..12 {
            for k in 1..10 {
                let probabilities = vec![1. / k as f64; k];
                assert_eq!(balanced_counts(&probabilities, n).iter().sum::<usize>(), n);
            }
        }
    }

    #[test]
    fn balanced_shuffle_is_exact_for_any_seed() {
        for seed in 0..20 {
            let mut rng = Pcg64::seed_from_u64(seed);
            let seq = balanced_shuffle(&[0.8, 0.2], 100, &mut rng);
            assert_eq!(seq.iter().filter(|&&i| i == 0).count(), 80);
            assert_eq!(seq.iter().filter(|&&i| i == 1).count(), 20);
        }
    }

    #[test]
    fn csv_preset_truncates_and_cycles() {
        assert_eq!(csv_preset(&[0, 1, 1], 2), vec![0, 1]);
        assert_eq!(csv_preset(&[0, 1, 1], 7), vec![0, 1, 1, 0, 1, 1, 0]);
        assert!(csv_preset(&[], 4).is_empty());
    }

    #[test]
    fn iid_respects_degenerate_probabilities() {
        let mut rng = Pcg64::seed_from_u64(5);
        assert!(iid(&[0., 1.], 50, &mut rng).iter().all(|&i| i == 1));
    }

    #[test]
    fn repair_caps_runs_when_it_reports_success() {
        for seed in 0..50 {
            let mut rng = Pcg64::seed_from_u64(seed);
            let mut seq = balanced_shuffle(&[0.7, 0.3], 60, &mut rng);
            let before: Vec<usize> = {
                let mut counts = vec![0; 2];
                seq.iter().for_each(|&i| counts[i] += 1);
                counts
            };
            if repair_max_consecutive(&mut seq, 0, 2) {
                assert!(max_run(&seq, 0) <= 2);
            }
            // Swaps never change the counts
            let mut after = vec![0; 2];
            seq.iter().for_each(|&i| after[i] += 1);
            assert_eq!(before, after);
        }
    }

    #[test]
    fn repair_swaps_forward() {
        let mut seq = vec![1, 1, 1, 0, 0];
        assert!(repair_max_consecutive(&mut seq, 1, 2));
        assert_eq!(seq, vec![1, 1, 0, 1, 0]);
    }

    #[test]
    fn repair_reports_pathological_tail() {
        let mut seq = vec![0, 1, 1, 1, 1];
        assert!(!repair_max_consecutive(&mut seq, 1, 2));
        assert!(max_run(&seq, 1) > 2);
    }
}
