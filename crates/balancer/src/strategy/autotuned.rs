//! Auto-tuned strategy: discrete search over observed bundle sizes
//!
//! Alternates two modes. In the stable mode it accumulates per-size
//! statistics; once enough samples accrue (or a converged size drifts) it
//! switches to an analysing mode that perturbs the best known size with a
//! randomly signed, exponentially decaying magnitude, trying sizes it has
//! not measured yet. When the allotted guesses are spent the search freezes
//! on the best size seen and the map is cleared for the next round.

use super::{
    AdaptiveBase, BundlingStrategy, ChannelAware, ExtendedFeedback, JobAware, PersistentState,
    StrategyContext,
};
use crate::cache::{PerformanceCache, PerformanceSample};
use crate::error::PersistenceError;
use crate::models::{ChannelDescriptor, JobDescriptor};
use crate::profile::TuningProfile;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

pub struct AutoTunedStrategy {
    instance_id: u64,
    profile: Arc<TuningProfile>,
    base: AdaptiveBase,
    current_size: usize,
    samples: BTreeMap<usize, PerformanceSample>,
    analysing: bool,
    guess_count: i64,
    stable_mean: Option<f64>,
    rng: StdRng,
}

/// Serialized form of the per-channel search state.
#[derive(Serialize, Deserialize)]
struct AutoTunedState {
    current_size: usize,
    analysing: bool,
    guess_count: i64,
    stable_mean: Option<f64>,
    samples: BTreeMap<usize, PerformanceSample>,
    cache: PerformanceCache,
}

impl AutoTunedStrategy {
    pub fn new(ctx: &StrategyContext) -> Self {
        Self::with_rng(ctx, StdRng::from_entropy())
    }

    /// Construct with an explicit random source, for deterministic runs.
    pub fn with_rng(ctx: &StrategyContext, rng: StdRng) -> Self {
        Self {
            instance_id: ctx.instance_id,
            profile: Arc::clone(&ctx.profile),
            base: AdaptiveBase::new(&ctx.profile, ctx.max_bundle_size),
            current_size: ctx.profile.initial_size.max(1),
            samples: BTreeMap::new(),
            analysing: false,
            guess_count: 0,
            stable_mean: None,
            rng,
        }
    }

    pub fn boxed(ctx: &StrategyContext) -> Box<dyn BundlingStrategy> {
        Box::new(Self::new(ctx))
    }

    /// True while the strategy is exploring sizes rather than holding a
    /// converged one.
    pub fn is_analysing(&self) -> bool {
        self.analysing
    }

    fn best_size(&self) -> Option<usize> {
        self.samples
            .iter()
            .min_by(|a, b| a.1.mean.partial_cmp(&b.1.mean).unwrap_or(Ordering::Equal))
            .map(|(size, _)| *size)
    }

    fn check_for_analysis(&mut self) {
        let Some(sample) = self.samples.get(&self.current_size) else {
            return;
        };
        match self.stable_mean {
            None => {
                if sample.samples > self.profile.min_samples_to_analyse {
                    self.enter_analysing();
                }
            }
            Some(stable) => {
                if sample.samples > self.profile.min_samples_to_check_convergence {
                    let drift = (stable - sample.mean).abs() / stable;
                    if drift > self.profile.max_deviation {
                        debug!(
                            bundler = self.instance_id,
                            size = self.current_size,
                            drift,
                            "Converged size drifted, re-entering analysis"
                        );
                        self.enter_analysing();
                    }
                }
            }
        }
    }

    fn enter_analysing(&mut self) {
        self.analysing = true;
        self.guess_count = 0;
    }

    /// One analysis step: perturb the best known size until an untried
    /// candidate is found or the guess budget runs out. The guess counter
    /// advances only on rejected draws, and the perturbation magnitude
    /// decays exponentially with it, so the search always terminates.
    fn perform_analysis(&mut self) {
        let Some(best_size) = self.best_size() else {
            return;
        };
        let max = self.max_size();
        loop {
            if self.guess_count >= self.profile.max_guess_to_stable {
                self.stabilize(best_size, max);
                return;
            }
            let ceiling = best_size as f64 * self.profile.size_ratio_deviation;
            let decay = (-(self.guess_count as f64) * self.profile.decrease_ratio).exp();
            let magnitude = (self.rng.gen_range(0.0..=ceiling) * decay).round() as i64;
            let sign = if self.rng.gen_bool(0.5) { 1 } else { -1 };
            let candidate = (best_size as i64 + sign * magnitude).clamp(1, max as i64) as usize;
            if magnitude > 0 && !self.samples.contains_key(&candidate) {
                self.current_size = candidate;
                return;
            }
            self.guess_count += 1;
        }
    }

    fn stabilize(&mut self, best_size: usize, max: usize) {
        self.current_size = best_size.clamp(1, max);
        self.stable_mean = self.samples.get(&best_size).map(|s| s.mean);
        self.samples.clear();
        self.analysing = false;
        self.guess_count = 0;
        debug!(
            bundler = self.instance_id,
            size = self.current_size,
            mean = self.stable_mean,
            "Search settled on a stable bundle size"
        );
    }
}

impl BundlingStrategy for AutoTunedStrategy {
    fn name(&self) -> &'static str {
        "autotuned"
    }

    fn instance_id(&self) -> u64 {
        self.instance_id
    }

    fn current_size(&self) -> usize {
        self.current_size.clamp(1, self.max_size())
    }

    fn feedback(&mut self, task_count: usize, total_time: f64) {
        // Anomalous input leaves the last known-good size untouched.
        if task_count == 0 || !total_time.is_finite() || total_time < 0.0 {
            return;
        }
        let per_task = total_time / task_count as f64;
        self.base.record(per_task, task_count as i64);

        self.samples
            .entry(task_count)
            .or_insert_with(|| PerformanceSample::new(0.0, 0))
            .merge(task_count as i64, total_time);

        if self.analysing {
            self.perform_analysis();
        } else {
            self.check_for_analysis();
        }
        self.current_size = self.current_size.clamp(1, self.max_size());
    }

    fn max_size(&self) -> usize {
        self.base.max_size()
    }

    fn setup(&mut self) {
        debug!(
            bundler = self.instance_id,
            initial_size = self.current_size,
            "Auto-tuned sizing strategy ready"
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

impl ExtendedFeedback for AutoTunedStrategy {
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

impl ChannelAware for AutoTunedStrategy {
    fn channel_changed(&mut self, channel: &ChannelDescriptor) {
        self.base.channel_changed(channel);
    }
}

impl JobAware for AutoTunedStrategy {
    fn job_changed(&mut self, job: Option<&JobDescriptor>) {
        self.base.job_changed(job);
    }
}

impl PersistentState for AutoTunedStrategy {
    fn save_state(&self) -> Result<Vec<u8>, PersistenceError> {
        let state = AutoTunedState {
            current_size: self.current_size,
            analysing: self.analysing,
            guess_count: self.guess_count,
            stable_mean: self.stable_mean,
            samples: self.samples.clone(),
            cache: self.base.cache().clone(),
        };
        Ok(serde_json::to_vec(&state)?)
    }

    fn restore_state(&mut self, bytes: &[u8]) -> Result<(), PersistenceError> {
        let state: AutoTunedState = serde_json::from_slice(bytes)?;
        self.current_size = state.current_size.max(1);
        self.analysing = state.analysing;
        self.guess_count = state.guess_count;
        self.stable_mean = state.stable_mean;
        self.samples = state.samples;
        self.base.restore_cache(state.cache);
        Ok(())
    }
}
