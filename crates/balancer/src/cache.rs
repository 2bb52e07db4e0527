//! Rolling window of per-task execution time observations
//!
//! One `PerformanceCache` exists per channel and algorithm pairing. It keeps
//! a bounded FIFO of performance samples, weighted by the number of tasks
//! each sample covers, and maintains the running mean per-task time over the
//! retained window.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Mean per-task execution time observed over a count of tasks.
///
/// Immutable once created, except for [`PerformanceSample::merge`], which
/// folds a new observation into an accumulated sample using the incremental
/// mean formula.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    /// Mean execution time per task, in nanoseconds.
    pub mean: f64,
    /// Number of tasks the mean was computed over.
    pub samples: i64,
}

impl PerformanceSample {
    pub fn new(mean: f64, samples: i64) -> Self {
        Self { mean, samples }
    }

    /// Fold `count` tasks executed in `total_time` into this sample:
    /// `new_mean = (mean * samples + total_time) / (samples + count)`.
    pub fn merge(&mut self, count: i64, total_time: f64) {
        let combined = self.samples + count;
        if combined <= 0 {
            return;
        }
        self.mean = (self.mean * self.samples as f64 + total_time) / combined as f64;
        self.samples = combined;
    }
}

/// Bounded rolling-window moving-average estimator of per-task time.
///
/// Capacity is expressed in tasks, not in sample entries: adding a sample
/// evicts from the oldest end until the window again holds at most
/// `capacity` tasks. The oldest sample is trimmed rather than dropped when
/// only part of it must go. A single sample larger than the whole capacity
/// is retained as-is; it is never split.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceCache {
    samples: VecDeque<PerformanceSample>,
    capacity: i64,
    total_time: f64,
    nb_samples: i64,
    mean: f64,
    previous_mean: f64,
}

impl PerformanceCache {
    pub fn new(capacity: i64) -> Self {
        Self::with_initial_mean(capacity, 0.0)
    }

    /// Create a cache whose mean reads as `initial_mean` until the first
    /// sample arrives. Strategies seed this with the configured initial
    /// mean time so early decisions have a defined baseline.
    pub fn with_initial_mean(capacity: i64, initial_mean: f64) -> Self {
        Self {
            samples: VecDeque::new(),
            capacity: capacity.max(1),
            total_time: 0.0,
            nb_samples: 0,
            mean: initial_mean,
            previous_mean: initial_mean,
        }
    }

    /// Add a sample, evicting or trimming from the oldest end to keep the
    /// retained task count within capacity.
    pub fn add_sample(&mut self, sample: PerformanceSample) {
        if sample.samples <= 0 {
            return;
        }

        let mut excess = self.nb_samples + sample.samples - self.capacity;
        while excess > 0 {
            let Some(front) = self.samples.front_mut() else {
                break;
            };
            if front.samples <= excess {
                let evicted = self.samples.pop_front().unwrap();
                self.nb_samples -= evicted.samples;
                self.total_time -= evicted.mean * evicted.samples as f64;
                excess -= evicted.samples;
            } else {
                front.samples -= excess;
                self.nb_samples -= excess;
                self.total_time -= front.mean * excess as f64;
                excess = 0;
            }
        }

        self.nb_samples += sample.samples;
        self.total_time += sample.mean * sample.samples as f64;
        self.samples.push_back(sample);
        self.compute_mean();
    }

    /// Shrink the window to a new capacity, evicting from the oldest end.
    /// Never splits the last remaining sample.
    pub fn set_capacity(&mut self, capacity: i64) {
        self.capacity = capacity.max(1);
        let mut excess = self.nb_samples - self.capacity;
        while excess > 0 && self.samples.len() > 1 {
            let front = self.samples.front_mut().unwrap();
            if front.samples <= excess {
                let evicted = self.samples.pop_front().unwrap();
                self.nb_samples -= evicted.samples;
                self.total_time -= evicted.mean * evicted.samples as f64;
                excess -= evicted.samples;
            } else {
                front.samples -= excess;
                self.nb_samples -= excess;
                self.total_time -= front.mean * excess as f64;
                excess = 0;
            }
        }
        self.compute_mean();
    }

    /// Drop all retained samples. The last computed mean and previous mean
    /// are kept; callers must not assume they reset.
    pub fn clear(&mut self) {
        self.samples.clear();
        self.nb_samples = 0;
        self.total_time = 0.0;
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    pub fn previous_mean(&self) -> f64 {
        self.previous_mean
    }

    pub fn nb_samples(&self) -> i64 {
        self.nb_samples
    }

    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    pub fn total_time(&self) -> f64 {
        self.total_time
    }

    // Guard against the empty window: with zero samples the mean is left
    // as last computed.
    fn compute_mean(&mut self) {
        if self.nb_samples > 0 {
            self.previous_mean = self.mean;
            self.mean = self.total_time / self.nb_samples as f64;
        }
    }
}
