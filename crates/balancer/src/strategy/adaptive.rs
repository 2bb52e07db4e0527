//! Channel and job awareness shared by the adaptive strategies
//!
//! The adaptive algorithms embed an [`AdaptiveBase`] instead of inheriting
//! from it: it tracks the node's worker thread count and the current job's
//! remaining task count, owns the channel's rolling performance cache, and
//! converts extended feedback into the plain `(task_count, total_time)`
//! contract.

use crate::cache::{PerformanceCache, PerformanceSample};
use crate::models::{ChannelDescriptor, JobDescriptor};
use crate::profile::TuningProfile;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct AdaptiveBase {
    nb_threads: usize,
    job_cap: Option<usize>,
    max_bundle_size: usize,
    cache: PerformanceCache,
}

impl AdaptiveBase {
    pub fn new(profile: &TuningProfile, max_bundle_size: usize) -> Self {
        Self {
            nb_threads: 1,
            job_cap: None,
            max_bundle_size: max_bundle_size.max(1),
            cache: PerformanceCache::with_initial_mean(
                profile.performance_cache_size,
                profile.initial_mean_time,
            ),
        }
    }

    /// Worker thread count of the node, at least 1.
    pub fn nb_threads(&self) -> usize {
        self.nb_threads
    }

    /// Smaller of the server-wide cap and the job's remaining tasks.
    pub fn max_size(&self) -> usize {
        match self.job_cap {
            Some(cap) => cap.clamp(1, self.max_bundle_size),
            None => self.max_bundle_size,
        }
    }

    /// Recompute the thread count from the node's reported configuration.
    /// Unknown or non-positive values fall back to a single thread, and a
    /// thread-count change invalidates the per-task time history.
    pub fn channel_changed(&mut self, channel: &ChannelDescriptor) {
        let threads = if channel.processing_threads > 0 {
            channel.processing_threads as usize
        } else {
            1
        };
        if threads != self.nb_threads {
            debug!(
                old_threads = self.nb_threads,
                new_threads = threads,
                "Node thread count changed, resetting performance window"
            );
            self.nb_threads = threads;
            self.cache.clear();
        }
    }

    pub fn job_changed(&mut self, job: Option<&JobDescriptor>) {
        self.job_cap = job.map(|j| j.task_count.max(1));
    }

    /// Reconstruct the wall-clock cost of a bundle from extended feedback,
    /// assuming perfect parallel packing across the node's worker threads:
    /// `floor(task_count / threads)` full rounds plus a trailing partial
    /// round weighted `(task_count mod threads) / threads`, each round
    /// costing the mean pure-execution time of one task.
    pub fn effective_total_time(
        &self,
        task_count: usize,
        accumulated_elapsed: f64,
        overhead_time: f64,
    ) -> f64 {
        if task_count == 0 {
            return overhead_time;
        }
        let threads = self.nb_threads.max(1);
        let mean_elapsed = accumulated_elapsed / task_count as f64;
        let full_rounds = (task_count / threads) as f64;
        let trailing = (task_count % threads) as f64 / threads as f64;
        (full_rounds + trailing) * mean_elapsed + overhead_time
    }

    /// Record a normalized per-task observation in the rolling window.
    pub fn record(&mut self, mean: f64, task_count: i64) {
        self.cache
            .add_sample(PerformanceSample::new(mean, task_count));
    }

    pub fn cache(&self) -> &PerformanceCache {
        &self.cache
    }

    /// Replace the rolling window, used when restoring persisted state.
    pub fn restore_cache(&mut self, cache: PerformanceCache) {
        self.cache = cache;
    }

    /// Release job references and drop the accumulated window.
    pub fn reset(&mut self) {
        self.job_cap = None;
        self.cache.clear();
    }
}
