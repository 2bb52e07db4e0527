//! Per-channel strategy lifecycle
//!
//! The [`ChannelManager`] owns one strategy instance per connected channel
//! and serializes feedback, sizing, and lifecycle calls on that channel
//! behind a per-channel async lock. State is restored from the persistence
//! gateway when a channel registers and written back after every feedback
//! and on removal; persistence failures are logged and never reach the
//! dispatch path.

use crate::config::BalancerConfig;
use crate::error::{BalancerError, Result};
use crate::health::HealthRegistry;
use crate::models::{ChannelDescriptor, JobDescriptor, LoadBalancingInformation};
use crate::observability::{BalancerMetrics, StructuredLogger};
use crate::persistence::PersistenceGateway;
use crate::profile::TuningProfile;
use crate::registry::StrategyRegistry;
use crate::strategy::BundlingStrategy;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

struct ChannelEntry {
    descriptor: ChannelDescriptor,
    strategy: Box<dyn BundlingStrategy>,
    disposed: bool,
}

pub struct ChannelManager {
    config: BalancerConfig,
    registry: Arc<StrategyRegistry>,
    profile: Arc<TuningProfile>,
    /// Stable identifier of the configured algorithm, the persistence key
    /// partner of the channel id.
    algorithm_id: String,
    gateway: Arc<dyn PersistenceGateway>,
    channels: DashMap<String, Arc<Mutex<ChannelEntry>>>,
    metrics: BalancerMetrics,
    logger: StructuredLogger,
    health: HealthRegistry,
}

impl ChannelManager {
    /// Fails fast when the configured algorithm is unknown or the profile
    /// carries a malformed parameter, so misconfiguration surfaces at
    /// startup instead of at first channel registration.
    pub fn new(
        config: BalancerConfig,
        registry: Arc<StrategyRegistry>,
        gateway: Arc<dyn PersistenceGateway>,
        health: HealthRegistry,
    ) -> Result<Self> {
        let profile = Arc::new(TuningProfile::from_params(&config.profile_params())?);
        let algorithm_id = registry
            .algorithm_id(&config.algorithm)
            .ok_or_else(|| BalancerError::UnknownAlgorithm(config.algorithm.clone()))?;
        let logger = StructuredLogger::new(config.driver_name.clone());
        logger.log_startup(&config.algorithm, &config.persistence.backend);

        Ok(Self {
            config,
            registry,
            profile,
            algorithm_id,
            gateway,
            channels: DashMap::new(),
            metrics: BalancerMetrics::new(),
            logger,
            health,
        })
    }

    /// Register a channel and give it a fresh strategy instance, restoring
    /// persisted state when the strategy supports it. Registering an
    /// already-known channel updates its descriptor in place.
    pub async fn register_channel(&self, descriptor: ChannelDescriptor) -> Result<()> {
        let channel_id = descriptor.channel_id();

        if let Some(existing) = self.lookup(&channel_id) {
            let mut entry = existing.lock().await;
            if !entry.disposed {
                if let Some(aware) = entry.strategy.as_channel_aware() {
                    aware.channel_changed(&descriptor);
                }
                entry.descriptor = descriptor;
                return Ok(());
            }
        }

        let mut strategy = self.registry.create(
            &self.config.algorithm,
            Arc::clone(&self.profile),
            self.config.max_bundle_size,
        )?;
        if let Some(aware) = strategy.as_channel_aware() {
            aware.channel_changed(&descriptor);
        }

        let mut restored = false;
        if strategy.as_persistent_state().is_some() {
            match self.gateway.load(&channel_id, &self.algorithm_id).await {
                Ok(Some(bytes)) => {
                    let outcome = strategy
                        .as_persistent_state()
                        .map(|persistent| persistent.restore_state(&bytes));
                    match outcome {
                        Some(Ok(())) => {
                            restored = true;
                            self.logger.log_state_restored(
                                &channel_id,
                                &self.algorithm_id,
                                bytes.len(),
                            );
                        }
                        Some(Err(error)) => {
                            self.logger.log_restore_failed(
                                &channel_id,
                                &self.algorithm_id,
                                &error.to_string(),
                            );
                        }
                        None => {}
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    self.logger.log_restore_failed(
                        &channel_id,
                        &self.algorithm_id,
                        &error.to_string(),
                    );
                }
            }
        }
        strategy.setup();

        self.metrics.set_bundle_size(
            &channel_id,
            &self.config.algorithm,
            strategy.current_size() as i64,
        );
        self.logger.log_channel_registered(
            &channel_id,
            &descriptor.host,
            &self.config.algorithm,
            restored,
        );

        self.channels.insert(
            channel_id,
            Arc::new(Mutex::new(ChannelEntry {
                descriptor,
                strategy,
                disposed: false,
            })),
        );
        self.metrics.set_channels_active(self.channels.len() as i64);
        Ok(())
    }

    /// The number of tasks to put in the next bundle for this channel.
    pub async fn current_size(&self, channel_id: &str) -> Result<usize> {
        let entry = self.entry(channel_id)?;
        let entry = entry.lock().await;
        if entry.disposed {
            return Err(BalancerError::UnknownChannel(channel_id.to_string()));
        }
        Ok(entry.strategy.current_size())
    }

    /// Apply round-trip feedback for a completed bundle, then persist the
    /// updated strategy state.
    pub async fn feedback(&self, channel_id: &str, task_count: usize, total_time: f64) -> Result<()> {
        let entry = self.entry(channel_id)?;
        let mut entry = entry.lock().await;
        if entry.disposed {
            return Err(BalancerError::UnknownChannel(channel_id.to_string()));
        }

        let started = Instant::now();
        entry.strategy.feedback(task_count, total_time);
        self.metrics
            .observe_feedback_latency(started.elapsed().as_secs_f64());
        self.metrics.inc_feedback_events();
        self.metrics.set_bundle_size(
            channel_id,
            &self.config.algorithm,
            entry.strategy.current_size() as i64,
        );

        self.store_state(channel_id, &mut entry).await;
        Ok(())
    }

    /// Extended feedback separating execution time from transport overhead.
    /// Falls back to plain feedback for strategies without the capability.
    pub async fn feedback_extended(
        &self,
        channel_id: &str,
        task_count: usize,
        total_time: f64,
        accumulated_elapsed: f64,
        overhead_time: f64,
    ) -> Result<()> {
        let entry = self.entry(channel_id)?;
        let mut entry = entry.lock().await;
        if entry.disposed {
            return Err(BalancerError::UnknownChannel(channel_id.to_string()));
        }

        let started = Instant::now();
        match entry.strategy.as_extended_feedback() {
            Some(extended) => {
                extended.feedback_extended(task_count, total_time, accumulated_elapsed, overhead_time)
            }
            None => entry.strategy.feedback(task_count, total_time),
        }
        self.metrics
            .observe_feedback_latency(started.elapsed().as_secs_f64());
        self.metrics.inc_feedback_events();
        self.metrics.set_bundle_size(
            channel_id,
            &self.config.algorithm,
            entry.strategy.current_size() as i64,
        );

        self.store_state(channel_id, &mut entry).await;
        Ok(())
    }

    /// Notify the channel's strategy that its dispatched job started,
    /// shrank, or completed (`None`).
    pub async fn job_changed(&self, channel_id: &str, job: Option<&JobDescriptor>) -> Result<()> {
        let entry = self.entry(channel_id)?;
        let mut entry = entry.lock().await;
        if entry.disposed {
            return Err(BalancerError::UnknownChannel(channel_id.to_string()));
        }
        if let Some(aware) = entry.strategy.as_job_aware() {
            aware.job_changed(job);
        }
        Ok(())
    }

    /// Remove a channel: persist its final state, dispose the strategy
    /// exactly once, and drop its exported metrics series.
    pub async fn remove_channel(&self, channel_id: &str) -> Result<()> {
        let (_, entry) = self
            .channels
            .remove(channel_id)
            .ok_or_else(|| BalancerError::UnknownChannel(channel_id.to_string()))?;
        self.metrics.set_channels_active(self.channels.len() as i64);

        let mut entry = entry.lock().await;
        if !entry.disposed {
            self.store_state(channel_id, &mut entry).await;
            entry.strategy.dispose();
            entry.disposed = true;
        }
        self.metrics
            .clear_bundle_size(channel_id, &self.config.algorithm);
        self.logger
            .log_channel_removed(channel_id, &self.config.algorithm);
        Ok(())
    }

    /// Remove every registered channel, persisting final states.
    pub async fn remove_all(&self) {
        for channel_id in self.channel_ids() {
            // A concurrent removal of the same channel is not an error here.
            let _ = self.remove_channel(&channel_id).await;
        }
    }

    /// Remove all channels and wait for queued persistence operations to
    /// complete. Returns `false` when the timeout expired with operations
    /// still pending.
    pub async fn shutdown(&self, drain_timeout: Duration) -> bool {
        self.logger.log_shutdown("engine stop requested");
        self.remove_all().await;
        self.drain_persistence(drain_timeout).await
    }

    /// Wait until the gateway reports no pending operations, polling the
    /// backlog into health and metrics along the way.
    pub async fn drain_persistence(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let pending = self.gateway.pending_operation_count();
            self.metrics.set_persistence_pending(pending as i64);
            self.health
                .report_persistence_backlog(pending, self.config.persistence.queue_capacity)
                .await;
            if pending == 0 {
                self.logger.log_drain(0, true);
                return true;
            }
            if Instant::now() >= deadline {
                self.logger.log_drain(pending, false);
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Management snapshot of the active configuration.
    pub fn information(&self) -> LoadBalancingInformation {
        self.registry
            .information(&self.config.algorithm, &self.profile)
    }

    /// Descriptor the channel registered (or last re-registered) with.
    pub async fn descriptor(&self, channel_id: &str) -> Result<ChannelDescriptor> {
        let entry = self.entry(channel_id)?;
        let entry = entry.lock().await;
        Ok(entry.descriptor.clone())
    }

    pub fn active_channels(&self) -> usize {
        self.channels.len()
    }

    /// Identifiers of all registered channels, sorted.
    pub fn channel_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn algorithm(&self) -> &str {
        &self.config.algorithm
    }

    /// The gateway this manager persists through, for management-side
    /// inspection and deletion of stored state.
    pub fn persistence(&self) -> Arc<dyn PersistenceGateway> {
        Arc::clone(&self.gateway)
    }

    fn lookup(&self, channel_id: &str) -> Option<Arc<Mutex<ChannelEntry>>> {
        self.channels
            .get(channel_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    fn entry(&self, channel_id: &str) -> Result<Arc<Mutex<ChannelEntry>>> {
        self.lookup(channel_id)
            .ok_or_else(|| BalancerError::UnknownChannel(channel_id.to_string()))
    }

    async fn store_state(&self, channel_id: &str, entry: &mut ChannelEntry) {
        // The snapshot is taken before awaiting so the capability borrow
        // never spans the store.
        let snapshot = match entry.strategy.as_persistent_state() {
            Some(persistent) => persistent.save_state(),
            None => return,
        };
        match snapshot {
            Ok(bytes) => {
                if let Err(error) = self
                    .gateway
                    .store(channel_id, &self.algorithm_id, &bytes)
                    .await
                {
                    self.logger.log_persistence_failure(
                        "store",
                        channel_id,
                        &self.algorithm_id,
                        &error.to_string(),
                    );
                }
            }
            Err(error) => {
                self.logger.log_persistence_failure(
                    "serialize",
                    channel_id,
                    &self.algorithm_id,
                    &error.to_string(),
                );
            }
        }
    }
}
