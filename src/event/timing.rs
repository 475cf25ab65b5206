//! Timing distribution
//!
//! Accumulates duration samples for one metric between two flushes. Keeps
//! every sample so the flushed percentiles are exact, not estimated.

use std::time::Duration;

/// Exact distribution of timing samples for a single key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimingDistribution {
    count: u64,
    sum: Duration,
    min: Duration,
    max: Duration,
    samples: Vec<Duration>,
}

impl TimingDistribution {
    /// Create a distribution holding a single sample
    pub fn new(sample: Duration) -> Self {
        TimingDistribution {
            count: 1,
            sum: sample,
            min: sample,
            max: sample,
            samples: vec![sample],
        }
    }

    /// Fold another distribution into this one.
    ///
    /// Returns false if the running sum would overflow; `self` is left
    /// unchanged in that case.
    pub fn merge(&mut self, other: TimingDistribution) -> bool {
        let sum = match self.sum.checked_add(other.sum) {
            Some(sum) => sum,
            None => return false,
        };
        self.sum = sum;
        self.count = self.count.saturating_add(other.count);
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.samples.extend(other.samples);
        true
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> Duration {
        self.sum
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn samples(&self) -> &[Duration] {
        &self.samples
    }

    /// Mean sample duration
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        let nanos = self.sum.as_nanos() / u128::from(self.count);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }

    /// Nearest-rank percentile, `q` in `0.0..=100.0`
    pub fn percentile(&self, q: f64) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let mut sorted = self.samples.clone();
        sorted.sort_unstable();

        let q = q.clamp(0.0, 100.0);
        let rank = ((q / 100.0) * sorted.len() as f64).ceil() as usize;
        let idx = rank.saturating_sub(1).min(sorted.len() - 1);
        sorted[idx]
    }
}

/// Render a duration as StatsD milliseconds, keeping sub-millisecond precision
pub(crate) fn format_millis(d: Duration) -> String {
    if d.subsec_nanos() % 1_000_000 == 0 {
        d.as_millis().to_string()
    } else {
        format!("{:.3}", d.as_secs_f64() * 1000.0)
    }
}
