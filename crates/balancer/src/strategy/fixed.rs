//! Fixed-size strategy
//!
//! Returns the externally configured bundle size on every call. No
//! feedback, channel, or job sensitivity; this is the manual algorithm and
//! the fallback when adaptive behavior is not wanted.

use super::{BundlingStrategy, StrategyContext};
use tracing::debug;

pub struct FixedStrategy {
    instance_id: u64,
    size: usize,
    max_bundle_size: usize,
}

impl FixedStrategy {
    pub fn new(ctx: &StrategyContext) -> Self {
        Self {
            instance_id: ctx.instance_id,
            size: ctx.profile.size.max(1),
            max_bundle_size: ctx.max_bundle_size.max(1),
        }
    }

    pub fn boxed(ctx: &StrategyContext) -> Box<dyn BundlingStrategy> {
        Box::new(Self::new(ctx))
    }
}

impl BundlingStrategy for FixedStrategy {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn instance_id(&self) -> u64 {
        self.instance_id
    }

    fn current_size(&self) -> usize {
        self.size.clamp(1, self.max_size())
    }

    fn feedback(&mut self, _task_count: usize, _total_time: f64) {}

    fn max_size(&self) -> usize {
        self.max_bundle_size
    }

    fn setup(&mut self) {
        debug!(
            bundler = self.instance_id,
            size = self.size,
            "Fixed sizing strategy ready"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::TuningProfile;
    use std::sync::Arc;

    fn context(size: usize) -> StrategyContext {
        let profile = TuningProfile {
            size,
            ..TuningProfile::default()
        };
        StrategyContext {
            instance_id: 1,
            profile: Arc::new(profile),
            max_bundle_size: 300,
        }
    }

    #[test]
    fn test_feedback_never_changes_size() {
        let mut strategy = FixedStrategy::new(&context(25));
        assert_eq!(strategy.current_size(), 25);

        for i in 0..100 {
            strategy.feedback(25, 1_000_000.0 * (i + 1) as f64);
            assert_eq!(strategy.current_size(), 25);
        }
    }

    #[test]
    fn test_size_is_clamped_to_max() {
        let strategy = FixedStrategy::new(&context(100_000));
        assert_eq!(strategy.current_size(), 300);
        assert!(strategy.current_size() <= strategy.max_size());
    }

    #[test]
    fn test_size_is_at_least_one() {
        // A zero size cannot come from a validated profile, but the
        // strategy still guards the invariant.
        let ctx = context(1);
        let strategy = FixedStrategy::new(&ctx);
        assert!(strategy.current_size() >= 1);
    }
}
