//! Tuning profiles for the sizing algorithms
//!
//! A profile is parsed once from configuration at registry construction and
//! shared read-only by every channel running the same algorithm. Malformed
//! values are rejected up front, before any channel exists; unrecognized
//! keys are ignored so one parameter bag can feed several algorithms.

use crate::error::{BalancerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Raw profile parameters as configured: a string-to-string bag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileParams(BTreeMap<String, String>);

impl ProfileParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) -> &mut Self {
        self.0.insert(key.into(), value.to_string());
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn get_i64(&self, key: &str, default: i64) -> Result<i64> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|_| BalancerError::InvalidProfile {
                name: key.to_string(),
                reason: format!("'{}' is not an integer", raw),
            }),
        }
    }

    fn get_usize(&self, key: &str, default: usize) -> Result<usize> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|_| BalancerError::InvalidProfile {
                name: key.to_string(),
                reason: format!("'{}' is not a non-negative integer", raw),
            }),
        }
    }

    fn get_f64(&self, key: &str, default: f64) -> Result<f64> {
        match self.get(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|_| BalancerError::InvalidProfile {
                name: key.to_string(),
                reason: format!("'{}' is not a number", raw),
            }),
        }
    }
}

impl FromIterator<(String, String)> for ProfileParams {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Immutable, validated tuning parameters shared by all channels using the
/// same algorithm. Each algorithm reads the subset it needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TuningProfile {
    /// Samples to accumulate for a size before analysing it.
    pub min_samples_to_analyse: i64,
    /// Samples to accumulate before re-checking a converged size for drift.
    pub min_samples_to_check_convergence: i64,
    /// Fractional deviation tolerated around the best known mean.
    pub max_deviation: f64,
    /// Rejected perturbation draws before the search settles.
    pub max_guess_to_stable: i64,
    /// Perturbation magnitude ceiling, as a ratio of the best size.
    pub size_ratio_deviation: f64,
    /// Exponential decay rate of the perturbation magnitude.
    pub decrease_ratio: f64,
    /// Bundle size of the fixed algorithm.
    pub size: usize,
    /// Starting bundle size of the adaptive algorithms.
    pub initial_size: usize,
    /// Rolling-window capacity, in tasks, of the per-channel cache.
    pub performance_cache_size: i64,
    /// Mean per-task time assumed before any feedback, in nanoseconds.
    pub initial_mean_time: f64,
    /// Multiplicative step applied when growing the bundle size.
    pub growth_factor: f64,
    /// Multiplicative step applied when shrinking the bundle size.
    pub shrink_factor: f64,
}

impl Default for TuningProfile {
    fn default() -> Self {
        Self {
            min_samples_to_analyse: 100,
            min_samples_to_check_convergence: 50,
            max_deviation: 0.2,
            max_guess_to_stable: 50,
            size_ratio_deviation: 1.5,
            decrease_ratio: 0.2,
            size: 1,
            initial_size: 10,
            performance_cache_size: 2000,
            initial_mean_time: 1e9,
            growth_factor: 1.3,
            shrink_factor: 0.6,
        }
    }
}

impl TuningProfile {
    /// Build a profile from raw parameters, applying defaults for absent
    /// keys and failing fast on malformed or out-of-range values.
    pub fn from_params(params: &ProfileParams) -> Result<Self> {
        let defaults = Self::default();
        let profile = Self {
            min_samples_to_analyse: params
                .get_i64("min_samples_to_analyse", defaults.min_samples_to_analyse)?,
            min_samples_to_check_convergence: params.get_i64(
                "min_samples_to_check_convergence",
                defaults.min_samples_to_check_convergence,
            )?,
            max_deviation: params.get_f64("max_deviation", defaults.max_deviation)?,
            max_guess_to_stable: params
                .get_i64("max_guess_to_stable", defaults.max_guess_to_stable)?,
            size_ratio_deviation: params
                .get_f64("size_ratio_deviation", defaults.size_ratio_deviation)?,
            decrease_ratio: params.get_f64("decrease_ratio", defaults.decrease_ratio)?,
            size: params.get_usize("size", defaults.size)?,
            initial_size: params.get_usize("initial_size", defaults.initial_size)?,
            performance_cache_size: params
                .get_i64("performance_cache_size", defaults.performance_cache_size)?,
            initial_mean_time: params.get_f64("initial_mean_time", defaults.initial_mean_time)?,
            growth_factor: params.get_f64("growth_factor", defaults.growth_factor)?,
            shrink_factor: params.get_f64("shrink_factor", defaults.shrink_factor)?,
        };
        profile.validate()?;
        Ok(profile)
    }

    fn validate(&self) -> Result<()> {
        fn invalid(name: &str, reason: impl Into<String>) -> BalancerError {
            BalancerError::InvalidProfile {
                name: name.to_string(),
                reason: reason.into(),
            }
        }

        if self.min_samples_to_analyse < 1 {
            return Err(invalid("min_samples_to_analyse", "must be at least 1"));
        }
        if self.min_samples_to_check_convergence < 1 {
            return Err(invalid(
                "min_samples_to_check_convergence",
                "must be at least 1",
            ));
        }
        if !(self.max_deviation > 0.0) {
            return Err(invalid("max_deviation", "must be positive"));
        }
        if self.max_guess_to_stable < 1 {
            return Err(invalid("max_guess_to_stable", "must be at least 1"));
        }
        if !(self.size_ratio_deviation > 0.0) {
            return Err(invalid("size_ratio_deviation", "must be positive"));
        }
        if !(self.decrease_ratio >= 0.0) {
            return Err(invalid("decrease_ratio", "must not be negative"));
        }
        if self.size < 1 {
            return Err(invalid("size", "must be at least 1"));
        }
        if self.initial_size < 1 {
            return Err(invalid("initial_size", "must be at least 1"));
        }
        if self.performance_cache_size < 1 {
            return Err(invalid("performance_cache_size", "must be at least 1"));
        }
        if !(self.initial_mean_time > 0.0) {
            return Err(invalid("initial_mean_time", "must be positive"));
        }
        if !(self.growth_factor > 1.0) {
            return Err(invalid("growth_factor", "must be greater than 1"));
        }
        if !(self.shrink_factor > 0.0 && self.shrink_factor < 1.0) {
            return Err(invalid("shrink_factor", "must be between 0 and 1"));
        }
        Ok(())
    }

    /// Resolved parameter values for the management snapshot.
    pub fn as_params(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert(
            "min_samples_to_analyse".to_string(),
            self.min_samples_to_analyse.to_string(),
        );
        map.insert(
            "min_samples_to_check_convergence".to_string(),
            self.min_samples_to_check_convergence.to_string(),
        );
        map.insert("max_deviation".to_string(), self.max_deviation.to_string());
        map.insert(
            "max_guess_to_stable".to_string(),
            self.max_guess_to_stable.to_string(),
        );
        map.insert(
            "size_ratio_deviation".to_string(),
            self.size_ratio_deviation.to_string(),
        );
        map.insert(
            "decrease_ratio".to_string(),
            self.decrease_ratio.to_string(),
        );
        map.insert("size".to_string(), self.size.to_string());
        map.insert("initial_size".to_string(), self.initial_size.to_string());
        map.insert(
            "performance_cache_size".to_string(),
            self.performance_cache_size.to_string(),
        );
        map.insert(
            "initial_mean_time".to_string(),
            self.initial_mean_time.to_string(),
        );
        map.insert("growth_factor".to_string(), self.growth_factor.to_string());
        map.insert("shrink_factor".to_string(), self.shrink_factor.to_string());
        map
    }
}
