//! Pluggable bundle-sizing strategies
//!
//! Every algorithm implements [`BundlingStrategy`]; optional capabilities
//! (extended feedback, channel awareness, job awareness, persistable state)
//! are separate traits reached through accessor methods, so callers probe
//! for them instead of walking an inheritance chain. One strategy instance
//! serves exactly one channel for its whole lifetime.

mod adaptive;
mod autotuned;
mod fixed;
mod resilient;

pub use adaptive::AdaptiveBase;
pub use autotuned::AutoTunedStrategy;
pub use fixed::FixedStrategy;
pub use resilient::ResilientStrategy;

use crate::error::PersistenceError;
use crate::models::{ChannelDescriptor, JobDescriptor};
use crate::profile::TuningProfile;
use std::sync::Arc;

/// Construction context handed to a strategy by the registry.
#[derive(Debug, Clone)]
pub struct StrategyContext {
    /// Engine-wide unique instance number, for logs and diagnostics.
    pub instance_id: u64,
    /// Shared immutable tuning parameters.
    pub profile: Arc<TuningProfile>,
    /// Server-wide bundle size cap.
    pub max_bundle_size: usize,
}

/// The contract every sizing algorithm implements.
///
/// `feedback` and `current_size` sit on the dispatch-critical path: they
/// must never block on I/O and never panic. Internal anomalies (a NaN mean,
/// a zero task count) leave the last known-good size in place.
pub trait BundlingStrategy: Send {
    /// Algorithm name this instance was created under.
    fn name(&self) -> &'static str;

    /// Engine-wide unique instance number.
    fn instance_id(&self) -> u64;

    /// The number of tasks to put in the next bundle. Always in
    /// `[1, max_size()]`, including before any feedback has arrived.
    fn current_size(&self) -> usize;

    /// Report the wall-clock round-trip time, in nanoseconds, of a
    /// completed bundle of `task_count` tasks. Called at most once per
    /// bundle and never concurrently for one channel.
    fn feedback(&mut self, task_count: usize, total_time: f64);

    /// Hard ceiling on the bundle size: the smaller of the server-wide cap
    /// and the current job's remaining task count, when known.
    fn max_size(&self) -> usize;

    /// Lifecycle hook invoked once after construction.
    fn setup(&mut self) {}

    /// Lifecycle hook invoked exactly once when the channel closes.
    /// Releases channel and job back-references.
    fn dispose(&mut self) {}

    fn as_extended_feedback(&mut self) -> Option<&mut dyn ExtendedFeedback> {
        None
    }

    fn as_channel_aware(&mut self) -> Option<&mut dyn ChannelAware> {
        None
    }

    fn as_job_aware(&mut self) -> Option<&mut dyn JobAware> {
        None
    }

    fn as_persistent_state(&mut self) -> Option<&mut dyn PersistentState> {
        None
    }
}

/// Richer feedback separating pure execution time from transport overhead.
pub trait ExtendedFeedback {
    /// `accumulated_elapsed` is the sum, across the node's worker threads,
    /// of pure task-execution time; `overhead_time` covers everything else
    /// in the round trip (queueing, serialization, network).
    fn feedback_extended(
        &mut self,
        task_count: usize,
        total_time: f64,
        accumulated_elapsed: f64,
        overhead_time: f64,
    );
}

/// Awareness of the channel's node configuration.
pub trait ChannelAware {
    /// Invoked when the node's reported configuration changes.
    fn channel_changed(&mut self, channel: &ChannelDescriptor);
}

/// Awareness of the job currently dispatched on the channel.
pub trait JobAware {
    /// Invoked when a job starts, updates its remaining task count, or
    /// completes (`None`).
    fn job_changed(&mut self, job: Option<&JobDescriptor>);
}

/// Strategy state that can be serialized through the persistence gateway
/// and restored on channel reconnection.
pub trait PersistentState {
    fn save_state(&self) -> Result<Vec<u8>, PersistenceError>;
    fn restore_state(&mut self, bytes: &[u8]) -> Result<(), PersistenceError>;
}
