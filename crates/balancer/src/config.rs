//! Engine configuration

use crate::error::{BalancerError, Result};
use crate::profile::ProfileParams;
use serde::Deserialize;
use std::collections::BTreeMap;

/// Load-balancing engine configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BalancerConfig {
    /// Name the engine reports itself under in logs
    #[serde(default = "default_driver_name")]
    pub driver_name: String,

    /// Active bundling algorithm name
    #[serde(default = "default_algorithm")]
    pub algorithm: String,

    /// Global upper bound for any bundle size
    #[serde(default = "default_max_bundle_size")]
    pub max_bundle_size: usize,

    /// Raw tuning parameters for the active algorithm's profile
    #[serde(default)]
    pub profile: BTreeMap<String, String>,

    /// State persistence backend settings
    #[serde(default)]
    pub persistence: PersistenceSettings,
}

/// Strategy state persistence settings
#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceSettings {
    /// Backend kind: "none", "file" or "sql"
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Root directory of the file backend
    #[serde(default = "default_root")]
    pub root: String,

    /// Table name of the SQL backend
    #[serde(default = "default_table")]
    pub table: String,

    /// Connection URL of the SQL backend
    #[serde(default)]
    pub url: Option<String>,

    /// Capacity of the asynchronous write queue
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_driver_name() -> String {
    std::env::var("DRIVER_NAME").unwrap_or_else(|_| "driver".to_string())
}

fn default_algorithm() -> String {
    "resilient".to_string()
}

fn default_max_bundle_size() -> usize {
    300
}

fn default_backend() -> String {
    "none".to_string()
}

fn default_root() -> String {
    "lb_persistence".to_string()
}

fn default_table() -> String {
    "load_balancer".to_string()
}

fn default_queue_capacity() -> usize {
    1000
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            driver_name: default_driver_name(),
            algorithm: default_algorithm(),
            max_bundle_size: default_max_bundle_size(),
            profile: BTreeMap::new(),
            persistence: PersistenceSettings::default(),
        }
    }
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            root: default_root(),
            table: default_table(),
            url: None,
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl BalancerConfig {
    /// Load configuration from the environment, `BALANCER__` prefixed with
    /// `__` separating nesting levels, e.g. `BALANCER__PERSISTENCE__BACKEND`.
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("BALANCER").separator("__"))
            .build()
            .map_err(|e| BalancerError::Config(e.to_string()))?;

        Ok(config.try_deserialize().unwrap_or_default())
    }

    /// The profile map as typed-access parameters.
    pub fn profile_params(&self) -> ProfileParams {
        self.profile
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}
