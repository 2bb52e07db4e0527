//! Resilient strategy: continuous direction-based adjustment
//!
//! No discrete search phases. Every feedback folds into a per-size mean;
//! once a size has accumulated enough samples its mean is compared against
//! the last known-good mean. Small deviations nudge the size by one in the
//! current direction, large ones take a multiplicative step sized from the
//! best observed bundle, flipping direction when the mean improved. The
//! size never leaves `[1, floor(max/2)]`.

use super::{
    AdaptiveBase, BundlingStrategy, ChannelAware, ExtendedFeedback, JobAware, PersistentState,
    StrategyContext,
};
use crate::cache::{PerformanceCache, PerformanceSample};
use crate::error::PersistenceError;
use crate::models::{ChannelDescriptor, JobDescriptor};
use crate::profile::TuningProfile;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

pub struct ResilientStrategy {
    instance_id: u64,
    profile: Arc<TuningProfile>,
    base: AdaptiveBase,
    current_size: usize,
    /// Reference mean of the best regime seen so far. Starts at infinity
    /// so the first trustworthy measurement is adopted unconditionally.
    current_mean: f64,
    direction: i64,
    samples: BTreeMap<usize, PerformanceSample>,
}

/// Serialized form of the per-channel adjustment state. The reference mean
/// is optional because the infinity sentinel has no JSON representation.
#[derive(Serialize, Deserialize)]
struct ResilientState {
    current_size: usize,
    current_mean: Option<f64>,
    direction: i64,
    samples: BTreeMap<usize, PerformanceSample>,
    cache: PerformanceCache,
}

impl ResilientStrategy {
    pub fn new(ctx: &StrategyContext) -> Self {
        Self {
            instance_id: ctx.instance_id,
            profile: Arc::clone(&ctx.profile),
            base: AdaptiveBase::new(&ctx.profile, ctx.max_bundle_size),
            current_size: ctx.profile.size.max(1),
            current_mean: f64::INFINITY,
            direction: 1,
            samples: BTreeMap::new(),
        }
    }

    pub fn boxed(ctx: &StrategyContext) -> Box<dyn BundlingStrategy> {
        Box::new(Self::new(ctx))
    }

    /// Upper bound for this strategy's size updates, half the channel's
    /// effective maximum and never below 1.
    fn half_cap(&self) -> usize {
        (self.base.max_size() / 2).max(1)
    }

    fn clamp_size(&self, size: i64) -> usize {
        size.clamp(1, self.half_cap() as i64) as usize
    }

    fn best_size(&self) -> Option<usize> {
        self.samples
            .iter()
            .min_by(|a, b| a.1.mean.partial_cmp(&b.1.mean).unwrap_or(Ordering::Equal))
            .map(|(size, _)| *size)
    }

    /// One adjustment step against the freshly merged mean for `size`.
    fn adjust(&mut self, sample_mean: f64) {
        if !self.current_mean.is_finite() {
            // Bootstrap: adopt the first trustworthy mean without moving,
            // so the very first decisions grow from the starting size
            // instead of reacting to the sentinel.
            self.current_mean = sample_mean;
            debug!(
                bundler = self.instance_id,
                mean = sample_mean,
                "Adopted initial reference mean"
            );
            return;
        }

        let deviation = sample_mean / self.current_mean - 1.0;
        if deviation.abs() <= self.profile.max_deviation {
            // Near the reference regime: single-step probe in the current
            // direction.
            self.current_size = self.clamp_size(self.current_size as i64 + self.direction);
            return;
        }

        if deviation < 0.0 {
            self.direction = -self.direction;
            self.current_mean = sample_mean;
        }
        let best = self.best_size().unwrap_or(self.current_size);
        let factor = if self.direction > 0 {
            self.profile.growth_factor
        } else {
            self.profile.shrink_factor
        };
        let diff = ((best as f64 * factor).ceil() as i64).max(1);
        self.current_size = self.clamp_size(self.current_size as i64 + self.direction * diff);
        debug!(
            bundler = self.instance_id,
            size = self.current_size,
            direction = self.direction,
            deviation,
            "Stepped bundle size"
        );
    }
}

impl BundlingStrategy for ResilientStrategy {
    fn name(&self) -> &'static str {
        "resilient"
    }

    fn instance_id(&self) -> u64 {
        self.instance_id
    }

    fn current_size(&self) -> usize {
        self.clamp_size(self.current_size as i64)
    }

    fn feedback(&mut self, task_count: usize, total_time: f64) {
        // Anomalous input leaves the last known-good size untouched.
        if task_count == 0 || !total_time.is_finite() || total_time < 0.0 {
            return;
        }
        let per_task = total_time / task_count as f64;
        self.base.record(per_task, task_count as i64);

        let entry = self
            .samples
            .entry(task_count)
            .or_insert_with(|| PerformanceSample::new(0.0, 0));
        entry.merge(task_count as i64, total_time);

        if entry.samples > self.profile.min_samples_to_analyse {
            let sample_mean = entry.mean;
            self.adjust(sample_mean);
        }
    }

    fn max_size(&self) -> usize {
        self.base.max_size()
    }

    fn setup(&mut self) {
        debug!(
            bundler = self.instance_id,
            initial_size = self.current_size,
            "Resilient sizing strategy ready"
        );
    }

    fn dispose(&mut self) {
        self.samples.clear();
        self.base.reset();
    }

    fn as_extended_feedback(&mut self) -> Option<&mut dyn ExtendedFeedback> {
        Some(self)
    }

    fn as_channel_aware(&mut self) -> Option<&mut dyn ChannelAware> {
        Some(self)
    }

    fn as_job_aware(&mut self) -> Option<&mut dyn JobAware> {
        Some(self)
    }

    fn as_persistent_state(&mut self) -> Option<&mut dyn PersistentState> {
        Some(self)
    }
}

impl ExtendedFeedback for ResilientStrategy {
    fn feedback_extended(
        &mut self,
        task_count: usize,
        total_time: f64,
        accumulated_elapsed: f64,
        overhead_time: f64,
    ) {
        let corrected = if accumulated_elapsed.is_finite() && overhead_time.is_finite() {
            self.base
                .effective_total_time(task_count, accumulated_elapsed, overhead_time)
        } else {
            total_time
        };
        self.feedback(task_count, corrected);
    }
}

impl ChannelAware for ResilientStrategy {
    fn channel_changed(&mut self, channel: &ChannelDescriptor) {
        self.base.channel_changed(channel);
    }
}

impl JobAware for ResilientStrategy {
    fn job_changed(&mut self, job: Option<&JobDescriptor>) {
        self.base.job_changed(job);
    }
}

impl PersistentState for ResilientStrategy {
    fn save_state(&self) -> Result<Vec<u8>, PersistenceError> {
        let state = ResilientState {
            current_size: self.current_size,
            current_mean: self.current_mean.is_finite().then_some(self.current_mean),
            direction: self.direction,
            samples: self.samples.clone(),
            cache: self.base.cache().clone(),
        };
        Ok(serde_json::to_vec(&state)?)
    }

    fn restore_state(&mut self, bytes: &[u8]) -> Result<(), PersistenceError> {
        let state: ResilientState = serde_json::from_slice(bytes)?;
        self.current_size = state.current_size.max(1);
        self.current_mean = state.current_mean.unwrap_or(f64::INFINITY);
        self.direction = if state.direction < 0 { -1 } else { 1 };
        self.samples = state.samples;
        self.base.restore_cache(state.cache);
        Ok(())
    }
}
