//! Filesystem persistence backend
//!
//! One file per record: `root/<channel_id>/<algorithm_id>.data`. Writes go
//! to a temp file in the same directory and move into place with an atomic
//! rename, so a concurrent load sees the previous state or the new one,
//! never a partial write. An empty channel directory is pruned after its
//! last record is deleted.

use super::{PendingCounter, PersistenceGateway, PersistenceScope};
use crate::error::PersistenceError;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

const STATE_EXTENSION: &str = "data";

pub struct FilePersistence {
    root: PathBuf,
    pending: PendingCounter,
}

impl FilePersistence {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            pending: PendingCounter::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn channel_dir(&self, channel_id: &str) -> PathBuf {
        self.root.join(channel_id)
    }

    fn state_file(&self, channel_id: &str, algorithm_id: &str) -> PathBuf {
        self.channel_dir(channel_id)
            .join(format!("{algorithm_id}.{STATE_EXTENSION}"))
    }

    async fn channel_ids(&self) -> Result<Vec<String>, PersistenceError> {
        let mut channels = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(channels),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                channels.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        Ok(channels)
    }

    async fn algorithm_ids(&self, channel_id: &str) -> Result<Vec<String>, PersistenceError> {
        let mut algorithms = Vec::new();
        let mut entries = match fs::read_dir(self.channel_dir(channel_id)).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(algorithms),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(STATE_EXTENSION) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    algorithms.push(stem.to_string());
                }
            }
        }
        Ok(algorithms)
    }

    async fn remove_record(
        &self,
        channel_id: &str,
        algorithm_id: &str,
    ) -> Result<(), PersistenceError> {
        match fs::remove_file(self.state_file(channel_id, algorithm_id)).await {
            Ok(()) => {
                self.prune_if_empty(channel_id).await;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn prune_if_empty(&self, channel_id: &str) {
        let dir = self.channel_dir(channel_id);
        if let Ok(mut entries) = fs::read_dir(&dir).await {
            if matches!(entries.next_entry().await, Ok(None)) {
                let _ = fs::remove_dir(&dir).await;
            }
        }
    }

    async fn remove_channel(&self, channel_id: &str) -> Result<(), PersistenceError> {
        match fs::remove_dir_all(self.channel_dir(channel_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn record_exists(
        &self,
        channel_id: &str,
        algorithm_id: &str,
    ) -> Result<bool, PersistenceError> {
        match fs::metadata(self.state_file(channel_id, algorithm_id)).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl PersistenceGateway for FilePersistence {
    async fn load(
        &self,
        channel_id: &str,
        algorithm_id: &str,
    ) -> Result<Option<Vec<u8>>, PersistenceError> {
        let _guard = self.pending.begin();
        match fs::read(self.state_file(channel_id, algorithm_id)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn store(
        &self,
        channel_id: &str,
        algorithm_id: &str,
        state: &[u8],
    ) -> Result<(), PersistenceError> {
        let _guard = self.pending.begin();
        let dir = self.channel_dir(channel_id);
        fs::create_dir_all(&dir).await?;

        let target = self.state_file(channel_id, algorithm_id);
        let temp = target.with_extension("tmp");
        let mut file = fs::File::create(&temp).await?;
        file.write_all(state).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp, &target).await?;

        debug!(
            channel = %channel_id,
            algorithm = %algorithm_id,
            bytes = state.len(),
            "Stored strategy state"
        );
        Ok(())
    }

    async fn delete(&self, scope: &PersistenceScope) -> Result<(), PersistenceError> {
        let _guard = self.pending.begin();
        match (&scope.channel_id, &scope.algorithm_id) {
            (None, None) => {
                for channel_id in self.channel_ids().await? {
                    self.remove_channel(&channel_id).await?;
                }
            }
            (Some(channel_id), None) => self.remove_channel(channel_id).await?,
            (None, Some(algorithm_id)) => {
                for channel_id in self.channel_ids().await? {
                    self.remove_record(&channel_id, algorithm_id).await?;
                }
            }
            (Some(channel_id), Some(algorithm_id)) => {
                self.remove_record(channel_id, algorithm_id).await?;
            }
        }
        Ok(())
    }

    async fn list(&self, scope: &PersistenceScope) -> Result<Vec<String>, PersistenceError> {
        let _guard = self.pending.begin();
        let mut out = match (&scope.channel_id, &scope.algorithm_id) {
            (None, None) => self.channel_ids().await?,
            (None, Some(algorithm_id)) => {
                let mut channels = Vec::new();
                for channel_id in self.channel_ids().await? {
                    if self.record_exists(&channel_id, algorithm_id).await? {
                        channels.push(channel_id);
                    }
                }
                channels
            }
            (Some(channel_id), None) => self.algorithm_ids(channel_id).await?,
            (Some(channel_id), Some(algorithm_id)) => {
                if self.record_exists(channel_id, algorithm_id).await? {
                    vec![algorithm_id.clone()]
                } else {
                    Vec::new()
                }
            }
        };
        out.sort();
        Ok(out)
    }

    fn pending_operation_count(&self) -> usize {
        self.pending.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(dir: &tempfile::TempDir) -> FilePersistence {
        FilePersistence::new(dir.path().join("lb_state"))
    }

    #[tokio::test]
    async fn test_store_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = backend(&dir);

        gateway.store("c1", "a1", b"alpha").await.unwrap();
        assert_eq!(
            gateway.load("c1", "a1").await.unwrap(),
            Some(b"alpha".to_vec())
        );

        gateway.store("c1", "a1", b"beta").await.unwrap();
        assert_eq!(
            gateway.load("c1", "a1").await.unwrap(),
            Some(b"beta".to_vec())
        );
        assert_eq!(gateway.pending_operation_count(), 0);
    }

    #[tokio::test]
    async fn test_load_absent_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = backend(&dir);
        assert_eq!(gateway.load("c1", "a1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_record_scope_prunes_empty_channel() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = backend(&dir);
        gateway.store("c1", "a1", b"x").await.unwrap();
        gateway.store("c1", "a2", b"y").await.unwrap();

        gateway
            .delete(&PersistenceScope::record("c1", "a1"))
            .await
            .unwrap();
        assert_eq!(gateway.load("c1", "a1").await.unwrap(), None);
        assert_eq!(gateway.load("c1", "a2").await.unwrap(), Some(b"y".to_vec()));

        gateway
            .delete(&PersistenceScope::record("c1", "a2"))
            .await
            .unwrap();
        assert!(gateway.list(&PersistenceScope::all()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_channel_scope() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = backend(&dir);
        gateway.store("c1", "a1", b"x").await.unwrap();
        gateway.store("c1", "a2", b"y").await.unwrap();
        gateway.store("c2", "a1", b"z").await.unwrap();

        gateway.delete(&PersistenceScope::channel("c1")).await.unwrap();

        assert_eq!(gateway.load("c1", "a1").await.unwrap(), None);
        assert_eq!(gateway.load("c1", "a2").await.unwrap(), None);
        assert_eq!(gateway.load("c2", "a1").await.unwrap(), Some(b"z".to_vec()));
    }

    #[tokio::test]
    async fn test_delete_algorithm_scope_across_channels() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = backend(&dir);
        gateway.store("c1", "a1", b"x").await.unwrap();
        gateway.store("c1", "a2", b"y").await.unwrap();
        gateway.store("c2", "a1", b"z").await.unwrap();

        gateway
            .delete(&PersistenceScope::algorithm("a1"))
            .await
            .unwrap();

        assert_eq!(gateway.load("c1", "a1").await.unwrap(), None);
        assert_eq!(gateway.load("c1", "a2").await.unwrap(), Some(b"y".to_vec()));
        assert_eq!(gateway.load("c2", "a1").await.unwrap(), None);
        // c2 lost its only record and its directory is pruned.
        assert_eq!(gateway.list(&PersistenceScope::all()).await.unwrap(), vec!["c1"]);
    }

    #[tokio::test]
    async fn test_delete_all_wipes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = backend(&dir);
        gateway.store("c1", "a1", b"x").await.unwrap();
        gateway.store("c2", "a2", b"y").await.unwrap();

        gateway.delete(&PersistenceScope::all()).await.unwrap();

        assert!(gateway.list(&PersistenceScope::all()).await.unwrap().is_empty());
        assert_eq!(gateway.load("c1", "a1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_list_matrix() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = backend(&dir);
        gateway.store("c2", "a1", b"x").await.unwrap();
        gateway.store("c1", "a1", b"y").await.unwrap();
        gateway.store("c1", "a2", b"z").await.unwrap();

        assert_eq!(
            gateway.list(&PersistenceScope::all()).await.unwrap(),
            vec!["c1", "c2"]
        );
        assert_eq!(
            gateway.list(&PersistenceScope::channel("c1")).await.unwrap(),
            vec!["a1", "a2"]
        );
        assert_eq!(
            gateway.list(&PersistenceScope::algorithm("a2")).await.unwrap(),
            vec!["c1"]
        );
        assert_eq!(
            gateway
                .list(&PersistenceScope::record("c2", "a1"))
                .await
                .unwrap(),
            vec!["a1"]
        );
        assert!(gateway
            .list(&PersistenceScope::record("c2", "a2"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_store_leaves_no_temp_residue() {
        let dir = tempfile::tempdir().unwrap();
        let gateway = backend(&dir);
        gateway.store("c1", "a1", b"first").await.unwrap();
        gateway.store("c1", "a1", b"second").await.unwrap();

        let mut names = Vec::new();
        let mut entries = fs::read_dir(gateway.root().join("c1")).await.unwrap();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["a1.data"]);
    }
}
