//! Weighted latency distribution over one reporting window.

use std::time::Duration;

use crate::types::{Error, Result};

/// Percentile targets, validated once at construction.
///
/// Targets must be strictly descending and within `[0.0, 1.0]`; `1.0` is the
/// maximum and `0.0` the minimum.
#[derive(Debug, Clone, PartialEq)]
pub struct Percentiles(Vec<f64>);

impl Percentiles {
    pub fn new(targets: &[f64]) -> Result<Self> {
        for (j, &p) in targets.iter().enumerate() {
            if !(0.0..=1.0).contains(&p) {
                return Err(Error::config(format!("invalid percentile: {}", p)));
            }
            if j > 0 && targets[j - 1] <= p {
                return Err(Error::config(format!(
                    "invalid percentile order: {} does not descend from {}",
                    p,
                    targets[j - 1]
                )));
            }
        }
        Ok(Self(targets.to_vec()))
    }

    /// `[max, p99, p95, p50, min]`, the set every report uses.
    pub fn report() -> Self {
        Self(vec![1.0, 0.99, 0.95, 0.5, 0.0])
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    duration: Duration,
    weight: u32,
}

/// Append-only list of weighted samples plus the running total weight.
#[derive(Debug, Default)]
pub struct LatencyDistribution {
    samples: Vec<Sample>,
    total_weight: u64,
}

impl LatencyDistribution {
    pub fn new() -> Self {
        Self {
            samples: Vec::with_capacity(16),
            total_weight: 0,
        }
    }

    pub fn add(&mut self, weight: u32, duration: Duration) {
        self.samples.push(Sample { duration, weight });
        self.total_weight += u64::from(weight);
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.total_weight = 0;
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Durations at each target, in target order.
    ///
    /// Walks the samples from longest to shortest; a target is answered by the
    /// first sample at which the remaining weight fraction drops to or below
    /// it. Targets never reached (empty distribution) read as zero.
    pub fn percentiles(&mut self, targets: &Percentiles) -> Vec<Duration> {
        let targets = targets.as_slice();
        let mut values = vec![Duration::ZERO; targets.len()];
        if self.total_weight == 0 {
            return values;
        }

        self.samples
            .sort_unstable_by(|a, b| b.duration.cmp(&a.duration));

        let mut remaining = self.total_weight;
        let mut j = 0;
        for sample in &self.samples {
            if j == targets.len() {
                break;
            }
            remaining -= u64::from(sample.weight);
            let fraction = remaining as f64 / self.total_weight as f64;
            while j < targets.len() && fraction <= targets[j] {
                values[j] = sample.duration;
                j += 1;
            }
        }

        values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_max_median_min() {
        let mut dist = LatencyDistribution::new();
        for s in [2, 1, 4, 3] {
            dist.add(1, secs(s));
        }
        let targets = Percentiles::new(&[1.0, 0.5, 0.0]).unwrap();
        assert_eq!(dist.percentiles(&targets), vec![secs(4), secs(3), secs(1)]);
    }

    #[test]
    fn test_weights_shift_median() {
        let mut dist = LatencyDistribution::new();
        dist.add(1, secs(10));
        dist.add(9, secs(1));
        let targets = Percentiles::new(&[1.0, 0.5, 0.0]).unwrap();
        // 90% of the weight sits at 1s, so the weighted median is 1s.
        assert_eq!(dist.percentiles(&targets), vec![secs(10), secs(1), secs(1)]);
    }

    #[test]
    fn test_single_sample_answers_every_target() {
        let mut dist = LatencyDistribution::new();
        dist.add(1, Duration::from_millis(7));
        let values = dist.percentiles(&Percentiles::report());
        assert_eq!(values, vec![Duration::from_millis(7); 5]);
    }

    #[test]
    fn test_empty_distribution_is_zero() {
        let mut dist = LatencyDistribution::new();
        assert_eq!(
            dist.percentiles(&Percentiles::report()),
            vec![Duration::ZERO; 5]
        );
    }

    #[test]
    fn test_clear_resets_weight() {
        let mut dist = LatencyDistribution::new();
        dist.add(3, secs(1));
        dist.clear();
        assert!(dist.is_empty());
        assert_eq!(dist.percentiles(&Percentiles::report())[0], Duration::ZERO);
    }

    #[test]
    fn test_rejects_ascending_targets() {
        assert!(matches!(
            Percentiles::new(&[0.5, 0.9]),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_rejects_duplicate_targets() {
        assert!(Percentiles::new(&[0.5, 0.5]).is_err());
    }

    #[test]
    fn test_rejects_out_of_range() {
        assert!(Percentiles::new(&[1.5]).is_err());
        assert!(Percentiles::new(&[-0.1]).is_err());
    }

    proptest! {
        #[test]
        fn prop_extremes_match_max_and_min(samples in proptest::collection::vec((1u32..10, 0u64..10_000), 1..64)) {
            let mut dist = LatencyDistribution::new();
            for (w, ms) in &samples {
                dist.add(*w, Duration::from_millis(*ms));
            }
            let values = dist.percentiles(&Percentiles::new(&[1.0, 0.0]).unwrap());
            let max = samples.iter().map(|(_, ms)| *ms).max().unwrap();
            let min = samples.iter().map(|(_, ms)| *ms).min().unwrap();
            prop_assert_eq!(values[0], Duration::from_millis(max));
            prop_assert_eq!(values[1], Duration::from_millis(min));
        }

        #[test]
        fn prop_results_descend(samples in proptest::collection::vec((1u32..10, 0u64..10_000), 1..64)) {
            let mut dist = LatencyDistribution::new();
            for (w, ms) in &samples {
                dist.add(*w, Duration::from_millis(*ms));
            }
            let values = dist.percentiles(&Percentiles::report());
            for pair in values.windows(2) {
                prop_assert!(pair[0] >= pair[1]);
            }
        }
    }
}
