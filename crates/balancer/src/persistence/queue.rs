//! Asynchronous persistence queue
//!
//! Wraps any gateway so stores and deletes return immediately. A worker
//! task drains the queue in bursts; within a burst, stores for the same
//! record collapse to the newest payload at the earliest queue position,
//! and a delete acts as a barrier for later stores of the records it
//! covers. Loads and lists pass through to the delegate. The pending count
//! covers queued and in-flight operations, supporting a bounded drain at
//! shutdown.

use super::{PendingCounter, PendingGuard, PersistenceGateway, PersistenceScope};
use crate::error::PersistenceError;
use crate::observability::BalancerMetrics;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

enum QueueOp {
    Store {
        channel_id: String,
        algorithm_id: String,
        state: Vec<u8>,
    },
    Delete {
        scope: PersistenceScope,
    },
}

struct QueueCommand {
    op: QueueOp,
    // released when the operation has been executed or discarded
    _guard: PendingGuard,
}

pub struct QueuedPersistence {
    delegate: Arc<dyn PersistenceGateway>,
    tx: mpsc::Sender<QueueCommand>,
    pending: PendingCounter,
}

impl QueuedPersistence {
    /// Split construction: the caller spawns the returned worker and keeps
    /// the handle for shutdown.
    pub fn new(
        delegate: Arc<dyn PersistenceGateway>,
        capacity: usize,
    ) -> (Self, PersistenceWorker) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let pending = PendingCounter::new();
        let worker = PersistenceWorker {
            delegate: Arc::clone(&delegate),
            rx,
            metrics: BalancerMetrics::new(),
        };
        (
            Self {
                delegate,
                tx,
                pending,
            },
            worker,
        )
    }

    /// Wait until queued work is flushed or the timeout elapses. Returns
    /// whether the queue fully drained.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.pending.count() > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    fn enqueue(&self, op: QueueOp) -> Result<(), PersistenceError> {
        let command = QueueCommand {
            op,
            _guard: self.pending.begin(),
        };
        self.tx.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PersistenceError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => PersistenceError::QueueClosed,
        })
    }
}

#[async_trait]
impl PersistenceGateway for QueuedPersistence {
    async fn load(
        &self,
        channel_id: &str,
        algorithm_id: &str,
    ) -> Result<Option<Vec<u8>>, PersistenceError> {
        let _guard = self.pending.begin();
        self.delegate.load(channel_id, algorithm_id).await
    }

    async fn store(
        &self,
        channel_id: &str,
        algorithm_id: &str,
        state: &[u8],
    ) -> Result<(), PersistenceError> {
        self.enqueue(QueueOp::Store {
            channel_id: channel_id.to_string(),
            algorithm_id: algorithm_id.to_string(),
            state: state.to_vec(),
        })
    }

    async fn delete(&self, scope: &PersistenceScope) -> Result<(), PersistenceError> {
        self.enqueue(QueueOp::Delete {
            scope: scope.clone(),
        })
    }

    async fn list(&self, scope: &PersistenceScope) -> Result<Vec<String>, PersistenceError> {
        let _guard = self.pending.begin();
        self.delegate.list(scope).await
    }

    fn pending_operation_count(&self) -> usize {
        self.pending.count()
    }
}

/// Drains the queue, executing operations against the wrapped gateway.
pub struct PersistenceWorker {
    delegate: Arc<dyn PersistenceGateway>,
    rx: mpsc::Receiver<QueueCommand>,
    metrics: BalancerMetrics,
}

impl PersistenceWorker {
    /// Process queued operations until shutdown or until all senders are
    /// gone, then flush what is already queued.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                command = self.rx.recv() => match command {
                    Some(command) => self.process_burst(command).await,
                    None => return,
                },
            }
        }
        while let Ok(command) = self.rx.try_recv() {
            self.process_burst(command).await;
        }
    }

    /// Drain whatever has queued up behind `first` and execute the
    /// coalesced remainder in order.
    async fn process_burst(&mut self, first: QueueCommand) {
        let mut batch = vec![first];
        while let Ok(next) = self.rx.try_recv() {
            batch.push(next);
        }
        for command in coalesce(batch) {
            self.execute(command).await;
        }
    }

    async fn execute(&self, command: QueueCommand) {
        let started = Instant::now();
        let result = match &command.op {
            QueueOp::Store {
                channel_id,
                algorithm_id,
                state,
            } => {
                self.metrics.inc_persistence_operation("store");
                self.delegate.store(channel_id, algorithm_id, state).await
            }
            QueueOp::Delete { scope } => {
                self.metrics.inc_persistence_operation("delete");
                self.delegate.delete(scope).await
            }
        };
        self.metrics
            .observe_persistence_latency(started.elapsed().as_secs_f64());

        if let Err(error) = result {
            self.metrics.inc_persistence_errors();
            match &command.op {
                QueueOp::Store {
                    channel_id,
                    algorithm_id,
                    ..
                } => warn!(
                    channel = %channel_id,
                    algorithm = %algorithm_id,
                    error = %error,
                    "Queued store failed, in-memory state unaffected"
                ),
                QueueOp::Delete { scope } => warn!(
                    scope = ?scope,
                    error = %error,
                    "Queued delete failed"
                ),
            }
        }
    }
}

/// Collapse repeated stores of the same record to the newest payload at the
/// earliest position. A delete clears the collapse map for the records it
/// covers, so stores queued after it execute after it.
fn coalesce(batch: Vec<QueueCommand>) -> Vec<QueueCommand> {
    let mut out: Vec<QueueCommand> = Vec::with_capacity(batch.len());
    let mut stores: HashMap<(String, String), usize> = HashMap::new();
    for command in batch {
        let store_key = match &command.op {
            QueueOp::Store {
                channel_id,
                algorithm_id,
                ..
            } => Some((channel_id.clone(), algorithm_id.clone())),
            QueueOp::Delete { .. } => None,
        };
        match store_key {
            Some(key) => {
                if let Some(&position) = stores.get(&key) {
                    out[position] = command;
                } else {
                    stores.insert(key, out.len());
                    out.push(command);
                }
            }
            None => {
                if let QueueOp::Delete { scope } = &command.op {
                    stores.retain(|(channel, algorithm), _| !scope.matches(channel, algorithm));
                }
                out.push(command);
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    /// In-memory gateway that records the operations it sees.
    #[derive(Default)]
    struct MockGateway {
        records: Mutex<HashMap<(String, String), Vec<u8>>>,
        store_attempts: AtomicUsize,
        store_successes: AtomicUsize,
        delete_count: AtomicUsize,
        fail_stores: AtomicBool,
    }

    #[async_trait]
    impl PersistenceGateway for MockGateway {
        async fn load(
            &self,
            channel_id: &str,
            algorithm_id: &str,
        ) -> Result<Option<Vec<u8>>, PersistenceError> {
            let records = self.records.lock().await;
            Ok(records
                .get(&(channel_id.to_string(), algorithm_id.to_string()))
                .cloned())
        }

        async fn store(
            &self,
            channel_id: &str,
            algorithm_id: &str,
            state: &[u8],
        ) -> Result<(), PersistenceError> {
            self.store_attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail_stores.load(Ordering::SeqCst) {
                return Err(PersistenceError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "injected",
                )));
            }
            self.store_successes.fetch_add(1, Ordering::SeqCst);
            let mut records = self.records.lock().await;
            records.insert(
                (channel_id.to_string(), algorithm_id.to_string()),
                state.to_vec(),
            );
            Ok(())
        }

        async fn delete(&self, scope: &PersistenceScope) -> Result<(), PersistenceError> {
            self.delete_count.fetch_add(1, Ordering::SeqCst);
            let mut records = self.records.lock().await;
            records.retain(|(channel, algorithm), _| !scope.matches(channel, algorithm));
            Ok(())
        }

        async fn list(&self, scope: &PersistenceScope) -> Result<Vec<String>, PersistenceError> {
            let records = self.records.lock().await;
            let mut out: Vec<String> = records
                .keys()
                .filter(|(channel, algorithm)| scope.matches(channel, algorithm))
                .map(|(channel, _)| channel.clone())
                .collect();
            out.sort();
            out.dedup();
            Ok(out)
        }

        fn pending_operation_count(&self) -> usize {
            0
        }
    }

    fn queued(
        mock: Arc<MockGateway>,
        capacity: usize,
    ) -> (QueuedPersistence, PersistenceWorker, broadcast::Sender<()>) {
        let (gateway, worker) = QueuedPersistence::new(mock, capacity);
        let (shutdown_tx, _) = broadcast::channel(1);
        (gateway, worker, shutdown_tx)
    }

    #[tokio::test]
    async fn test_store_is_queued_and_executed() {
        let mock = Arc::new(MockGateway::default());
        let (gateway, worker, shutdown) = queued(Arc::clone(&mock), 16);
        tokio::spawn(worker.run(shutdown.subscribe()));

        gateway.store("c1", "a1", b"state").await.unwrap();
        assert!(gateway.drain(Duration::from_secs(5)).await);

        assert_eq!(mock.store_successes.load(Ordering::SeqCst), 1);
        assert_eq!(
            mock.load("c1", "a1").await.unwrap(),
            Some(b"state".to_vec())
        );
        assert_eq!(gateway.pending_operation_count(), 0);
    }

    #[tokio::test]
    async fn test_burst_stores_coalesce_to_newest_payload() {
        let mock = Arc::new(MockGateway::default());
        let (gateway, worker, shutdown) = queued(Arc::clone(&mock), 16);

        // Queue everything before the worker starts so the whole burst is
        // visible to one drain.
        gateway.store("c1", "a1", b"v1").await.unwrap();
        gateway.store("c1", "a1", b"v2").await.unwrap();
        gateway.store("c1", "a1", b"v3").await.unwrap();
        gateway.store("c2", "a1", b"other").await.unwrap();

        tokio::spawn(worker.run(shutdown.subscribe()));
        assert!(gateway.drain(Duration::from_secs(5)).await);

        // One write per record, carrying the newest payload.
        assert_eq!(mock.store_successes.load(Ordering::SeqCst), 2);
        assert_eq!(mock.load("c1", "a1").await.unwrap(), Some(b"v3".to_vec()));
        assert_eq!(
            mock.load("c2", "a1").await.unwrap(),
            Some(b"other".to_vec())
        );
    }

    #[tokio::test]
    async fn test_delete_is_a_coalescing_barrier() {
        let mock = Arc::new(MockGateway::default());
        let (gateway, worker, shutdown) = queued(Arc::clone(&mock), 16);

        gateway.store("c1", "a1", b"v1").await.unwrap();
        gateway
            .delete(&PersistenceScope::record("c1", "a1"))
            .await
            .unwrap();
        gateway.store("c1", "a1", b"v2").await.unwrap();

        tokio::spawn(worker.run(shutdown.subscribe()));
        assert!(gateway.drain(Duration::from_secs(5)).await);

        // The store after the delete must not collapse into the one before
        // it, so the record survives.
        assert_eq!(mock.store_successes.load(Ordering::SeqCst), 2);
        assert_eq!(mock.delete_count.load(Ordering::SeqCst), 1);
        assert_eq!(mock.load("c1", "a1").await.unwrap(), Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn test_load_and_list_pass_through() {
        let mock = Arc::new(MockGateway::default());
        mock.store("c1", "a1", b"seed").await.unwrap();

        let (gateway, worker, shutdown) = queued(Arc::clone(&mock), 16);
        tokio::spawn(worker.run(shutdown.subscribe()));

        assert_eq!(
            gateway.load("c1", "a1").await.unwrap(),
            Some(b"seed".to_vec())
        );
        assert_eq!(
            gateway.list(&PersistenceScope::all()).await.unwrap(),
            vec!["c1"]
        );
    }

    #[tokio::test]
    async fn test_failed_store_does_not_stop_the_worker() {
        let mock = Arc::new(MockGateway::default());
        let (gateway, worker, shutdown) = queued(Arc::clone(&mock), 16);
        tokio::spawn(worker.run(shutdown.subscribe()));

        mock.fail_stores.store(true, Ordering::SeqCst);
        gateway.store("c1", "a1", b"lost").await.unwrap();
        assert!(gateway.drain(Duration::from_secs(5)).await);
        assert_eq!(mock.store_successes.load(Ordering::SeqCst), 0);

        mock.fail_stores.store(false, Ordering::SeqCst);
        gateway.store("c1", "a1", b"kept").await.unwrap();
        assert!(gateway.drain(Duration::from_secs(5)).await);

        assert_eq!(mock.store_attempts.load(Ordering::SeqCst), 2);
        assert_eq!(mock.load("c1", "a1").await.unwrap(), Some(b"kept".to_vec()));
    }

    #[tokio::test]
    async fn test_full_queue_rejects_without_leaking_pending() {
        let mock = Arc::new(MockGateway::default());
        // No worker: the single slot stays occupied.
        let (gateway, _worker, _shutdown) = queued(Arc::clone(&mock), 1);

        gateway.store("c1", "a1", b"v1").await.unwrap();
        let err = gateway.store("c1", "a1", b"v2").await.unwrap_err();
        assert!(matches!(err, PersistenceError::QueueFull));
        assert_eq!(gateway.pending_operation_count(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_flushes_then_closes() {
        let mock = Arc::new(MockGateway::default());
        let (gateway, worker, shutdown) = queued(Arc::clone(&mock), 16);

        gateway.store("c1", "a1", b"flushed").await.unwrap();

        let handle = tokio::spawn(worker.run(shutdown.subscribe()));
        shutdown.send(()).unwrap();
        handle.await.unwrap();

        assert_eq!(
            mock.load("c1", "a1").await.unwrap(),
            Some(b"flushed".to_vec())
        );
        let err = gateway.store("c1", "a1", b"late").await.unwrap_err();
        assert!(matches!(err, PersistenceError::QueueClosed));
    }
}
