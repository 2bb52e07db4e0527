//! End-to-end engine tests
//!
//! Drive the full path: backend selection from configuration, strategy
//! registry, per-channel manager, feedback loops, state persistence across
//! a restart, and the shutdown drain of the asynchronous queue.

use anyhow::Result;
use balancer::manager::ChannelManager;
use balancer::models::{ChannelDescriptor, JobDescriptor};
use balancer::persistence::{build_gateway, PersistenceScope, QueuedPersistence};
use balancer::{BalancerConfig, HealthRegistry, StrategyRegistry};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

fn file_config(algorithm: &str, root: &Path) -> BalancerConfig {
    let mut config = BalancerConfig {
        algorithm: algorithm.to_string(),
        ..BalancerConfig::default()
    };
    config.persistence.backend = "file".to_string();
    config.persistence.root = root.to_string_lossy().into_owned();
    // Decide from the second sample per size so the loops below move
    // within a handful of rounds.
    config
        .profile
        .insert("min_samples_to_analyse".to_string(), "1".to_string());
    config
        .profile
        .insert("min_samples_to_check_convergence".to_string(), "1".to_string());
    config
}

struct Engine {
    manager: ChannelManager,
    shutdown: broadcast::Sender<()>,
    worker: JoinHandle<()>,
}

/// Wire the engine the way a driver would: configured backend behind the
/// coalescing queue, worker spawned, manager on top.
async fn start_engine(config: BalancerConfig) -> Result<Engine> {
    balancer::init_logging();
    let backend = build_gateway(&config.persistence).await?;
    let (queued, worker) = QueuedPersistence::new(backend, config.persistence.queue_capacity);
    let (shutdown, _) = broadcast::channel(1);
    let worker = tokio::spawn(worker.run(shutdown.subscribe()));
    let manager = ChannelManager::new(
        config,
        Arc::new(StrategyRegistry::new()),
        Arc::new(queued),
        HealthRegistry::new(),
    )?;
    Ok(Engine {
        manager,
        shutdown,
        worker,
    })
}

impl Engine {
    async fn stop(self) {
        assert!(self.manager.shutdown(Duration::from_secs(5)).await);
        let _ = self.shutdown.send(());
        self.worker.await.expect("worker");
    }
}

#[tokio::test]
async fn test_resilient_loop_grows_and_persists_through_the_queue() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = start_engine(file_config("resilient", dir.path())).await?;

    let node_a = ChannelDescriptor::new("uuid-a", "node-a.grid", 11198).with_processing_threads(8);
    let node_b = ChannelDescriptor::new("uuid-b", "node-b.grid", 11198).with_processing_threads(8);
    let channel_a = node_a.channel_id();
    let channel_b = node_b.channel_id();
    engine.manager.register_channel(node_a).await?;
    engine.manager.register_channel(node_b).await?;

    // Constant per-task cost on node A: once the reference mean settles,
    // every round probes one step up.
    for _ in 0..10 {
        let size = engine.manager.current_size(&channel_a).await?;
        engine
            .manager
            .feedback(&channel_a, size, size as f64 * 1_000_000.0)
            .await?;
    }
    assert_eq!(engine.manager.current_size(&channel_a).await?, 9);
    assert_eq!(engine.manager.current_size(&channel_b).await?, 1);

    // A dispatched job with few remaining tasks caps the size; completion
    // lifts the cap again.
    engine
        .manager
        .job_changed(&channel_a, Some(&JobDescriptor::new("job-1", 8)))
        .await?;
    assert_eq!(engine.manager.current_size(&channel_a).await?, 4);
    engine.manager.job_changed(&channel_a, None).await?;
    assert_eq!(engine.manager.current_size(&channel_a).await?, 9);

    let gateway = engine.manager.persistence();
    engine.stop().await;

    let mut expected = vec![channel_a, channel_b];
    expected.sort();
    let stored = gateway.list(&PersistenceScope::all()).await?;
    assert_eq!(stored, expected);
    Ok(())
}

#[tokio::test]
async fn test_autotuned_state_survives_restart() -> Result<()> {
    let dir = TempDir::new()?;
    let node = ChannelDescriptor::new("uuid-a", "node-a.grid", 11198).with_processing_threads(8);
    let channel_id = node.channel_id();

    let first = start_engine(file_config("autotuned", dir.path())).await?;
    first.manager.register_channel(node.clone()).await?;
    for _ in 0..40 {
        let size = first.manager.current_size(&channel_id).await?;
        first
            .manager
            .feedback(&channel_id, size, size as f64 * 1_000_000.0)
            .await?;
    }
    let size_before = first.manager.current_size(&channel_id).await?;
    first.stop().await;

    let second = start_engine(file_config("autotuned", dir.path())).await?;
    second.manager.register_channel(node).await?;
    assert_eq!(second.manager.current_size(&channel_id).await?, size_before);
    second.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_management_delete_forces_a_fresh_start() -> Result<()> {
    let dir = TempDir::new()?;
    let node = ChannelDescriptor::new("uuid-a", "node-a.grid", 11198);
    let channel_id = node.channel_id();

    let first = start_engine(file_config("resilient", dir.path())).await?;
    first.manager.register_channel(node.clone()).await?;
    for _ in 0..6 {
        first.manager.feedback(&channel_id, 1, 1_000_000.0).await?;
    }
    assert_eq!(first.manager.current_size(&channel_id).await?, 5);
    first.stop().await;

    let second = start_engine(file_config("resilient", dir.path())).await?;
    let gateway = second.manager.persistence();
    gateway.delete(&PersistenceScope::all()).await?;
    assert!(second.manager.drain_persistence(Duration::from_secs(5)).await);

    // With the stored state gone, registration starts from the floor.
    second.manager.register_channel(node).await?;
    assert_eq!(second.manager.current_size(&channel_id).await?, 1);
    second.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_extended_feedback_drives_sizing_end_to_end() -> Result<()> {
    let mut config = BalancerConfig {
        algorithm: "resilient".to_string(),
        ..BalancerConfig::default()
    };
    config
        .profile
        .insert("min_samples_to_analyse".to_string(), "1".to_string());
    let backend = build_gateway(&config.persistence).await?;
    let manager = ChannelManager::new(
        config,
        Arc::new(StrategyRegistry::new()),
        backend,
        HealthRegistry::new(),
    )?;

    let node = ChannelDescriptor::new("uuid-a", "node-a.grid", 11198).with_processing_threads(1);
    let channel_id = node.channel_id();
    manager.register_channel(node).await?;

    // Single-threaded node, 1ms of pure execution per task, no overhead:
    // the reconstructed round trip matches the plain-feedback shape.
    for _ in 0..8 {
        let size = manager.current_size(&channel_id).await?;
        manager
            .feedback_extended(&channel_id, size, 0.0, size as f64 * 1_000_000.0, 0.0)
            .await?;
    }
    assert_eq!(manager.current_size(&channel_id).await?, 7);
    Ok(())
}

#[tokio::test]
async fn test_sql_backend_round_trip() -> Result<()> {
    let mut config = BalancerConfig {
        algorithm: "resilient".to_string(),
        ..BalancerConfig::default()
    };
    config
        .profile
        .insert("min_samples_to_analyse".to_string(), "1".to_string());
    config.persistence.backend = "sql".to_string();
    config.persistence.url = Some("sqlite::memory:".to_string());

    // An in-memory database dies with its pool, so the "restarted" manager
    // shares the gateway instead of rebuilding it.
    let backend = build_gateway(&config.persistence).await?;
    let registry = Arc::new(StrategyRegistry::new());
    let node = ChannelDescriptor::new("uuid-a", "node-a.grid", 11198);
    let channel_id = node.channel_id();

    let first = ChannelManager::new(
        config.clone(),
        Arc::clone(&registry),
        Arc::clone(&backend),
        HealthRegistry::new(),
    )?;
    first.register_channel(node.clone()).await?;
    for _ in 0..6 {
        first.feedback(&channel_id, 1, 1_000_000.0).await?;
    }
    assert_eq!(first.current_size(&channel_id).await?, 5);
    first.remove_channel(&channel_id).await?;

    let second = ChannelManager::new(config, registry, backend, HealthRegistry::new())?;
    second.register_channel(node).await?;
    assert_eq!(second.current_size(&channel_id).await?, 5);
    Ok(())
}
