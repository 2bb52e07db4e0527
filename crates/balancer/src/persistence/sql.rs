//! SQL persistence backend
//!
//! One row per record in a `(NODEID, ALGORITHMID, STATE)` table with a
//! composite primary key. State bytes are hex-encoded into the TEXT column
//! so one schema works across drivers. A store runs in a transaction that
//! locks the row first (`SELECT ... FOR UPDATE` where the dialect supports
//! it) to serialize update-vs-insert races on the same key.

use super::{PendingCounter, PersistenceGateway, PersistenceScope};
use crate::error::PersistenceError;
use async_trait::async_trait;
use sqlx::any::{AnyPool, AnyPoolOptions};
use sqlx::Row;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SqlDialect {
    Postgres,
    Sqlite,
    Other,
}

impl SqlDialect {
    fn from_url(url: &str) -> Self {
        if url.starts_with("postgres") {
            SqlDialect::Postgres
        } else if url.starts_with("sqlite") {
            SqlDialect::Sqlite
        } else {
            SqlDialect::Other
        }
    }

    fn placeholder(&self, n: usize) -> String {
        match self {
            SqlDialect::Postgres => format!("${n}"),
            _ => "?".to_string(),
        }
    }

    /// SQLite has no row locks; its writers serialize on the database.
    fn row_lock_clause(&self) -> &'static str {
        match self {
            SqlDialect::Sqlite => "",
            _ => " FOR UPDATE",
        }
    }
}

pub struct SqlPersistence {
    pool: AnyPool,
    table: String,
    dialect: SqlDialect,
    pending: PendingCounter,
}

impl SqlPersistence {
    /// Connect and make sure the state table exists. The caller validates
    /// the table name; it is interpolated into SQL text.
    pub async fn connect(url: &str, table: &str) -> Result<Self, PersistenceError> {
        let dialect = SqlDialect::from_url(url);
        let max_connections = if dialect == SqlDialect::Sqlite { 1 } else { 5 };
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        let backend = Self {
            pool,
            table: table.to_string(),
            dialect,
            pending: PendingCounter::new(),
        };
        backend.ensure_table().await?;
        Ok(backend)
    }

    async fn ensure_table(&self) -> Result<(), PersistenceError> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (\
             NODEID VARCHAR(64) NOT NULL, \
             ALGORITHMID VARCHAR(64) NOT NULL, \
             STATE TEXT NOT NULL, \
             PRIMARY KEY (NODEID, ALGORITHMID))",
            self.table
        );
        sqlx::query(&ddl).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl PersistenceGateway for SqlPersistence {
    async fn load(
        &self,
        channel_id: &str,
        algorithm_id: &str,
    ) -> Result<Option<Vec<u8>>, PersistenceError> {
        let _guard = self.pending.begin();
        let sql = format!(
            "SELECT STATE FROM {} WHERE NODEID = {} AND ALGORITHMID = {}",
            self.table,
            self.dialect.placeholder(1),
            self.dialect.placeholder(2)
        );
        let row = sqlx::query(&sql)
            .bind(channel_id)
            .bind(algorithm_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let encoded: String = row.try_get(0)?;
                Ok(Some(hex::decode(encoded)?))
            }
            None => Ok(None),
        }
    }

    async fn store(
        &self,
        channel_id: &str,
        algorithm_id: &str,
        state: &[u8],
    ) -> Result<(), PersistenceError> {
        let _guard = self.pending.begin();
        let encoded = hex::encode(state);

        let mut tx = self.pool.begin().await?;
        let select = format!(
            "SELECT NODEID FROM {} WHERE NODEID = {} AND ALGORITHMID = {}{}",
            self.table,
            self.dialect.placeholder(1),
            self.dialect.placeholder(2),
            self.dialect.row_lock_clause()
        );
        let existing = sqlx::query(&select)
            .bind(channel_id)
            .bind(algorithm_id)
            .fetch_optional(&mut *tx)
            .await?;

        if existing.is_some() {
            let update = format!(
                "UPDATE {} SET STATE = {} WHERE NODEID = {} AND ALGORITHMID = {}",
                self.table,
                self.dialect.placeholder(1),
                self.dialect.placeholder(2),
                self.dialect.placeholder(3)
            );
            sqlx::query(&update)
                .bind(encoded.as_str())
                .bind(channel_id)
                .bind(algorithm_id)
                .execute(&mut *tx)
                .await?;
        } else {
            let insert = format!(
                "INSERT INTO {} (NODEID, ALGORITHMID, STATE) VALUES ({}, {}, {})",
                self.table,
                self.dialect.placeholder(1),
                self.dialect.placeholder(2),
                self.dialect.placeholder(3)
            );
            sqlx::query(&insert)
                .bind(channel_id)
                .bind(algorithm_id)
                .bind(encoded.as_str())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

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
                let sql = format!("DELETE FROM {}", self.table);
                sqlx::query(&sql).execute(&self.pool).await?;
            }
            (Some(channel_id), None) => {
                let sql = format!(
                    "DELETE FROM {} WHERE NODEID = {}",
                    self.table,
                    self.dialect.placeholder(1)
                );
                sqlx::query(&sql)
                    .bind(channel_id.as_str())
                    .execute(&self.pool)
                    .await?;
            }
            (None, Some(algorithm_id)) => {
                let sql = format!(
                    "DELETE FROM {} WHERE ALGORITHMID = {}",
                    self.table,
                    self.dialect.placeholder(1)
                );
                sqlx::query(&sql)
                    .bind(algorithm_id.as_str())
                    .execute(&self.pool)
                    .await?;
            }
            (Some(channel_id), Some(algorithm_id)) => {
                let sql = format!(
                    "DELETE FROM {} WHERE NODEID = {} AND ALGORITHMID = {}",
                    self.table,
                    self.dialect.placeholder(1),
                    self.dialect.placeholder(2)
                );
                sqlx::query(&sql)
                    .bind(channel_id.as_str())
                    .bind(algorithm_id.as_str())
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    async fn list(&self, scope: &PersistenceScope) -> Result<Vec<String>, PersistenceError> {
        let _guard = self.pending.begin();
        let rows = match (&scope.channel_id, &scope.algorithm_id) {
            (None, None) => {
                let sql = format!("SELECT DISTINCT NODEID FROM {} ORDER BY NODEID", self.table);
                sqlx::query(&sql).fetch_all(&self.pool).await?
            }
            (None, Some(algorithm_id)) => {
                let sql = format!(
                    "SELECT DISTINCT NODEID FROM {} WHERE ALGORITHMID = {} ORDER BY NODEID",
                    self.table,
                    self.dialect.placeholder(1)
                );
                sqlx::query(&sql)
                    .bind(algorithm_id.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            (Some(channel_id), None) => {
                let sql = format!(
                    "SELECT ALGORITHMID FROM {} WHERE NODEID = {} ORDER BY ALGORITHMID",
                    self.table,
                    self.dialect.placeholder(1)
                );
                sqlx::query(&sql)
                    .bind(channel_id.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            (Some(channel_id), Some(algorithm_id)) => {
                let sql = format!(
                    "SELECT ALGORITHMID FROM {} WHERE NODEID = {} AND ALGORITHMID = {}",
                    self.table,
                    self.dialect.placeholder(1),
                    self.dialect.placeholder(2)
                );
                sqlx::query(&sql)
                    .bind(channel_id.as_str())
                    .bind(algorithm_id.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter()
            .map(|row| row.try_get::<String, _>(0).map_err(PersistenceError::from))
            .collect()
    }

    fn pending_operation_count(&self) -> usize {
        self.pending.count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn sqlite_backend() -> SqlPersistence {
        SqlPersistence::connect("sqlite::memory:", "load_balancer")
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_store_then_load_round_trip() {
        let gateway = sqlite_backend().await;

        gateway.store("c1", "a1", b"alpha").await.unwrap();
        assert_eq!(
            gateway.load("c1", "a1").await.unwrap(),
            Some(b"alpha".to_vec())
        );

        // Second store takes the update path.
        gateway.store("c1", "a1", b"beta").await.unwrap();
        assert_eq!(
            gateway.load("c1", "a1").await.unwrap(),
            Some(b"beta".to_vec())
        );
        assert_eq!(gateway.pending_operation_count(), 0);
    }

    #[tokio::test]
    async fn test_load_absent_returns_none() {
        let gateway = sqlite_backend().await;
        assert_eq!(gateway.load("c1", "a1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_scopes() {
        let gateway = sqlite_backend().await;
        gateway.store("c1", "a1", b"x").await.unwrap();
        gateway.store("c1", "a2", b"y").await.unwrap();
        gateway.store("c2", "a1", b"z").await.unwrap();

        gateway
            .delete(&PersistenceScope::record("c1", "a1"))
            .await
            .unwrap();
        assert_eq!(gateway.load("c1", "a1").await.unwrap(), None);
        assert_eq!(gateway.load("c1", "a2").await.unwrap(), Some(b"y".to_vec()));

        gateway
            .delete(&PersistenceScope::algorithm("a1"))
            .await
            .unwrap();
        assert_eq!(gateway.load("c2", "a1").await.unwrap(), None);

        gateway.delete(&PersistenceScope::channel("c1")).await.unwrap();
        assert_eq!(gateway.load("c1", "a2").await.unwrap(), None);

        gateway.store("c3", "a3", b"w").await.unwrap();
        gateway.delete(&PersistenceScope::all()).await.unwrap();
        assert!(gateway.list(&PersistenceScope::all()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_matrix() {
        let gateway = sqlite_backend().await;
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
    async fn test_binary_state_survives_the_text_column() {
        let gateway = sqlite_backend().await;
        let state: Vec<u8> = (0..=255).collect();

        gateway.store("c1", "a1", &state).await.unwrap();
        assert_eq!(gateway.load("c1", "a1").await.unwrap(), Some(state));
    }
}
