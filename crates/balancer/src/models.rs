//! Core data models for the load-balancing engine

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Descriptor of a driver-to-node channel.
///
/// The persistence identity is derived from the stable fields only, so a
/// node keeps the same identity across reconnections even though its
/// transport connection (and connection UUID) changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    /// Permanent node UUID, assigned once at first node startup.
    pub node_uuid: String,
    pub host: String,
    pub management_port: u16,
    /// Processing thread count reported by the node. Zero or negative
    /// means unknown; sizing falls back to a single thread.
    pub processing_threads: i32,
}

impl ChannelDescriptor {
    pub fn new(node_uuid: impl Into<String>, host: impl Into<String>, management_port: u16) -> Self {
        Self {
            node_uuid: node_uuid.into(),
            host: host.into(),
            management_port,
            processing_threads: 0,
        }
    }

    pub fn with_processing_threads(mut self, threads: i32) -> Self {
        self.processing_threads = threads;
        self
    }

    /// Stable channel identifier used as the persistence key.
    pub fn channel_id(&self) -> String {
        stable_id(&format!(
            "{}:{}:{}",
            self.host, self.management_port, self.node_uuid
        ))
    }
}

/// Descriptor of the job currently dispatched on a channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub job_uuid: String,
    /// Tasks of the job not yet dispatched; bounds the bundle size.
    pub task_count: usize,
}

impl JobDescriptor {
    pub fn new(job_uuid: impl Into<String>, task_count: usize) -> Self {
        Self {
            job_uuid: job_uuid.into(),
            task_count,
        }
    }
}

/// Read-only snapshot of the load-balancing configuration, consumed by
/// management tooling. Regenerated on demand, never mutated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancingInformation {
    /// Name of the currently configured algorithm.
    pub algorithm: String,
    /// Resolved tuning parameters of the current profile.
    pub parameters: BTreeMap<String, String>,
    /// Names of all registered algorithms, sorted.
    pub algorithm_names: Vec<String>,
}

/// Stable hexadecimal identifier for a name (channel identity material or
/// an algorithm name). Survives restarts and renames of transient state.
pub fn stable_id(name: &str) -> String {
    hex::encode(Sha256::digest(name.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_id_is_deterministic() {
        assert_eq!(stable_id("autotuned"), stable_id("autotuned"));
        assert_ne!(stable_id("autotuned"), stable_id("resilient"));
        // 32-byte digest, hex encoded
        assert_eq!(stable_id("x").len(), 64);
    }

    #[test]
    fn test_channel_id_ignores_transient_fields() {
        let a = ChannelDescriptor::new("uuid-1", "node-1.grid", 11198).with_processing_threads(8);
        let b = ChannelDescriptor::new("uuid-1", "node-1.grid", 11198).with_processing_threads(4);
        assert_eq!(a.channel_id(), b.channel_id());

        let c = ChannelDescriptor::new("uuid-2", "node-1.grid", 11198);
        assert_ne!(a.channel_id(), c.channel_id());
    }
}
