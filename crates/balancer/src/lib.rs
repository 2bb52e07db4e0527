//! Adaptive bundle sizing for grid job dispatch
//!
//! This crate provides the driver-side load-balancing engine:
//! - Pluggable bundle-sizing strategies (fixed, auto-tuned, resilient)
//! - Per-channel strategy lifecycle with feedback-driven adjustment
//! - Strategy state persistence (file and SQL backends, async coalescing)
//! - Health checks and observability

pub mod cache;
pub mod config;
pub mod error;
pub mod health;
pub mod manager;
pub mod models;
pub mod observability;
pub mod persistence;
pub mod profile;
pub mod registry;
pub mod strategy;

pub use config::{BalancerConfig, PersistenceSettings};
pub use error::{BalancerError, PersistenceError, Result};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use manager::ChannelManager;
pub use models::*;
pub use observability::{init_logging, BalancerMetrics, StructuredLogger};
pub use registry::StrategyRegistry;
