//! Strategy state persistence
//!
//! Backends implement a single gateway contract: binary state records keyed
//! by `(channel_id, algorithm_id)`, with scoped delete and list operations
//! and an in-flight operation count for drain monitoring. Stores have
//! overwrite semantics and are atomic from the caller's point of view.
//! Persistence never sits on the dispatch path; see [`QueuedPersistence`]
//! for the fire-and-forget wrapper.

mod file;
mod queue;
mod sql;

pub use file::FilePersistence;
pub use queue::{PersistenceWorker, QueuedPersistence};
pub use sql::SqlPersistence;

use crate::config::PersistenceSettings;
use crate::error::{BalancerError, PersistenceError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Record selector for delete and list. An absent id means "all".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistenceScope {
    pub channel_id: Option<String>,
    pub algorithm_id: Option<String>,
}

impl PersistenceScope {
    /// Everything in the store.
    pub fn all() -> Self {
        Self::default()
    }

    /// All algorithms of one channel.
    pub fn channel(channel_id: impl Into<String>) -> Self {
        Self {
            channel_id: Some(channel_id.into()),
            algorithm_id: None,
        }
    }

    /// One algorithm across all channels.
    pub fn algorithm(algorithm_id: impl Into<String>) -> Self {
        Self {
            channel_id: None,
            algorithm_id: Some(algorithm_id.into()),
        }
    }

    /// A single record.
    pub fn record(channel_id: impl Into<String>, algorithm_id: impl Into<String>) -> Self {
        Self {
            channel_id: Some(channel_id.into()),
            algorithm_id: Some(algorithm_id.into()),
        }
    }

    pub fn matches(&self, channel_id: &str, algorithm_id: &str) -> bool {
        self.channel_id.as_deref().map_or(true, |c| c == channel_id)
            && self
                .algorithm_id
                .as_deref()
                .map_or(true, |a| a == algorithm_id)
    }
}

/// Store for serialized strategy state.
///
/// `list` returns channel ids when no channel filter is given, and
/// algorithm ids when one is.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    async fn load(
        &self,
        channel_id: &str,
        algorithm_id: &str,
    ) -> Result<Option<Vec<u8>>, PersistenceError>;

    async fn store(
        &self,
        channel_id: &str,
        algorithm_id: &str,
        state: &[u8],
    ) -> Result<(), PersistenceError>;

    async fn delete(&self, scope: &PersistenceScope) -> Result<(), PersistenceError>;

    async fn list(&self, scope: &PersistenceScope) -> Result<Vec<String>, PersistenceError>;

    fn pending_operation_count(&self) -> usize;
}

/// Shared in-flight operation counter. Each operation holds a guard for its
/// duration so the count survives early returns.
#[derive(Clone, Debug, Default)]
pub(crate) struct PendingCounter(Arc<AtomicUsize>);

impl PendingCounter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn begin(&self) -> PendingGuard {
        self.0.fetch_add(1, Ordering::AcqRel);
        PendingGuard(Arc::clone(&self.0))
    }

    pub(crate) fn count(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug)]
pub(crate) struct PendingGuard(Arc<AtomicUsize>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Backend used when persistence is disabled. Remembers nothing, fails
/// nothing.
#[derive(Debug, Clone, Default)]
pub struct NoopPersistence;

#[async_trait]
impl PersistenceGateway for NoopPersistence {
    async fn load(
        &self,
        _channel_id: &str,
        _algorithm_id: &str,
    ) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(None)
    }

    async fn store(
        &self,
        _channel_id: &str,
        _algorithm_id: &str,
        _state: &[u8],
    ) -> Result<(), PersistenceError> {
        Ok(())
    }

    async fn delete(&self, _scope: &PersistenceScope) -> Result<(), PersistenceError> {
        Ok(())
    }

    async fn list(&self, _scope: &PersistenceScope) -> Result<Vec<String>, PersistenceError> {
        Ok(Vec::new())
    }

    fn pending_operation_count(&self) -> usize {
        0
    }
}

/// Construct the backend named by the settings. The asynchronous queue
/// wrapper is applied by the caller, which owns the worker task.
pub async fn build_gateway(
    settings: &PersistenceSettings,
) -> Result<Arc<dyn PersistenceGateway>, BalancerError> {
    match settings.backend.as_str() {
        "none" => Ok(Arc::new(NoopPersistence)),
        "file" => Ok(Arc::new(FilePersistence::new(&settings.root))),
        "sql" => {
            let url = settings.url.as_deref().ok_or_else(|| {
                BalancerError::Config("sql persistence requires a connection url".to_string())
            })?;
            if !is_safe_table_name(&settings.table) {
                return Err(BalancerError::Config(format!(
                    "invalid persistence table name '{}'",
                    settings.table
                )));
            }
            let backend = SqlPersistence::connect(url, &settings.table)
                .await
                .map_err(BalancerError::Persistence)?;
            Ok(Arc::new(backend))
        }
        other => Err(BalancerError::Config(format!(
            "unknown persistence backend '{other}'"
        ))),
    }
}

/// Table names are interpolated into SQL text and must stay plain
/// identifiers.
fn is_safe_table_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !name.starts_with(|c: char| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_matching_matrix() {
        assert!(PersistenceScope::all().matches("c1", "a1"));
        assert!(PersistenceScope::channel("c1").matches("c1", "a1"));
        assert!(!PersistenceScope::channel("c1").matches("c2", "a1"));
        assert!(PersistenceScope::algorithm("a1").matches("c2", "a1"));
        assert!(!PersistenceScope::algorithm("a1").matches("c2", "a2"));
        assert!(PersistenceScope::record("c1", "a1").matches("c1", "a1"));
        assert!(!PersistenceScope::record("c1", "a1").matches("c1", "a2"));
    }

    #[test]
    fn test_safe_table_names() {
        assert!(is_safe_table_name("load_balancer"));
        assert!(is_safe_table_name("lb2"));
        assert!(!is_safe_table_name(""));
        assert!(!is_safe_table_name("2lb"));
        assert!(!is_safe_table_name("lb;drop table users"));
    }

    #[tokio::test]
    async fn test_noop_gateway_remembers_nothing() {
        let gateway = NoopPersistence;
        gateway.store("c1", "a1", b"state").await.unwrap();

        assert_eq!(gateway.load("c1", "a1").await.unwrap(), None);
        assert!(gateway
            .list(&PersistenceScope::all())
            .await
            .unwrap()
            .is_empty());
        assert_eq!(gateway.pending_operation_count(), 0);
    }

    #[tokio::test]
    async fn test_build_gateway_selects_backend() {
        let none = PersistenceSettings::default();
        assert!(build_gateway(&none).await.is_ok());

        let unknown = PersistenceSettings {
            backend: "etcd".to_string(),
            ..PersistenceSettings::default()
        };
        assert!(matches!(
            build_gateway(&unknown).await.err().unwrap(),
            BalancerError::Config(_)
        ));

        let sql_without_url = PersistenceSettings {
            backend: "sql".to_string(),
            ..PersistenceSettings::default()
        };
        assert!(matches!(
            build_gateway(&sql_without_url).await.err().unwrap(),
            BalancerError::Config(_)
        ));
    }

    #[test]
    fn test_pending_counter_guard() {
        let counter = PendingCounter::new();
        assert_eq!(counter.count(), 0);
        {
            let _a = counter.begin();
            let _b = counter.begin();
            assert_eq!(counter.count(), 2);
        }
        assert_eq!(counter.count(), 0);
    }
}
