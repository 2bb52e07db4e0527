//! Algorithm registry and strategy factory
//!
//! Maps algorithm names to strategy constructors and stamps every created
//! strategy with a unique instance id. Strategies are never shared: each
//! channel gets a fresh instance, though instances may share the immutable
//! tuning profile behind an `Arc`.

use crate::error::{BalancerError, Result};
use crate::models::{stable_id, LoadBalancingInformation};
use crate::profile::{ProfileParams, TuningProfile};
use crate::strategy::{
    AutoTunedStrategy, BundlingStrategy, FixedStrategy, ResilientStrategy, StrategyContext,
};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// Constructor for one strategy kind. Providers must be cheap: they run on
/// the channel-registration path.
pub type StrategyProvider = Arc<dyn Fn(&StrategyContext) -> Box<dyn BundlingStrategy> + Send + Sync>;

pub struct StrategyRegistry {
    providers: DashMap<String, StrategyProvider>,
    ids_by_name: DashMap<String, String>,
    names_by_id: DashMap<String, String>,
    next_instance_id: AtomicU64,
}

impl StrategyRegistry {
    /// Registry preloaded with the built-in algorithms.
    pub fn new() -> Self {
        let registry = Self {
            providers: DashMap::new(),
            ids_by_name: DashMap::new(),
            names_by_id: DashMap::new(),
            next_instance_id: AtomicU64::new(1),
        };
        registry.register("fixed", Arc::new(|ctx| FixedStrategy::boxed(ctx)));
        registry.register("autotuned", Arc::new(|ctx| AutoTunedStrategy::boxed(ctx)));
        registry.register("resilient", Arc::new(|ctx| ResilientStrategy::boxed(ctx)));
        registry
    }

    /// Register an additional provider. Names are case-insensitive; a
    /// repeated name replaces the previous provider. Each name gets a
    /// stable identifier that keys persisted state.
    pub fn register(&self, name: &str, provider: StrategyProvider) {
        let key = Self::normalize(name);
        let id = stable_id(&key);
        info!(algorithm = %key, algorithm_id = %id, "Registered load-balancing algorithm");
        self.ids_by_name.insert(key.clone(), id.clone());
        self.names_by_id.insert(id, key.clone());
        self.providers.insert(key, provider);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(&Self::normalize(name))
    }

    /// Stable identifier of a registered algorithm name.
    pub fn algorithm_id(&self, name: &str) -> Option<String> {
        self.ids_by_name
            .get(&Self::normalize(name))
            .map(|e| e.value().clone())
    }

    /// Registered name behind a stable identifier, for display of persisted
    /// records.
    pub fn algorithm_name(&self, algorithm_id: &str) -> Option<String> {
        self.names_by_id
            .get(algorithm_id)
            .map(|e| e.value().clone())
    }

    /// All registered algorithm names, sorted for stable display.
    pub fn algorithm_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Create a fresh strategy instance for one channel. The profile is
    /// shared, the instance never is.
    pub fn create(
        &self,
        algorithm: &str,
        profile: Arc<TuningProfile>,
        max_bundle_size: usize,
    ) -> Result<Box<dyn BundlingStrategy>> {
        let key = Self::normalize(algorithm);
        let provider = match self.providers.get(&key) {
            Some(entry) => Arc::clone(entry.value()),
            None => return Err(BalancerError::UnknownAlgorithm(algorithm.to_string())),
        };
        let ctx = StrategyContext {
            instance_id: self.next_instance_id.fetch_add(1, Ordering::Relaxed),
            profile,
            max_bundle_size,
        };
        Ok(provider(&ctx))
    }

    /// Resolve raw parameters into a profile, then create. Fails fast on
    /// an unknown algorithm or a malformed parameter value.
    pub fn create_from_params(
        &self,
        algorithm: &str,
        params: &ProfileParams,
        max_bundle_size: usize,
    ) -> Result<Box<dyn BundlingStrategy>> {
        if !self.contains(algorithm) {
            return Err(BalancerError::UnknownAlgorithm(algorithm.to_string()));
        }
        let profile = Arc::new(TuningProfile::from_params(params)?);
        self.create(algorithm, profile, max_bundle_size)
    }

    /// Management snapshot: active algorithm, its resolved parameters and
    /// everything the registry knows about.
    pub fn information(&self, algorithm: &str, profile: &TuningProfile) -> LoadBalancingInformation {
        LoadBalancingInformation {
            algorithm: Self::normalize(algorithm),
            parameters: profile.as_params(),
            algorithm_names: self.algorithm_names(),
        }
    }

    fn normalize(name: &str) -> String {
        name.trim().to_ascii_lowercase()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}
