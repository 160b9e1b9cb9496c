//! Streaming statistics and percentile computation

use serde::{Deserialize, Serialize};

/// Count, extremes, mean and variance of a stream of values.
///
/// Uses Welford's online update so long-running connections keep full
/// precision without summing raw values.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, value: f64) {
        self.count += 1;
        if self.count == 1 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }

        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    /// Population variance
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / self.count as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }
}

/// Latency percentiles in microseconds
#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct Percentiles {
    pub p50: f64,
    pub p75: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
    pub p999: f64,
}

impl Percentiles {
    /// Nearest-rank percentiles of an ascending sample of nanosecond values
    pub fn from_sorted_ns(sorted: &[u64]) -> Self {
        if sorted.is_empty() {
            return Self::default();
        }
        let at = |permille: u64| ns_to_us(sorted[nearest_rank_index(sorted.len(), permille)]);

        Self {
            p50: at(500),
            p75: at(750),
            p90: at(900),
            p95: at(950),
            p99: at(990),
            p999: at(999),
        }
    }
}

/// Index of the nearest-rank percentile, `permille` in 1..=1000, `len` > 0
pub fn nearest_rank_index(len: usize, permille: u64) -> usize {
    let rank = (len as u64 * permille).div_ceil(1000).max(1);
    (rank as usize - 1).min(len - 1)
}

pub fn ns_to_us(ns: u64) -> f64 {
    ns as f64 / 1000.0
}
