use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use log::info;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Row, SqlitePool,
};
use telemetry_core::{snapshot::Snapshot, ErrorKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("snapshot payload could not be (de)serialized: {0}")]
    Payload(#[from] serde_json::Error),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::PersistenceError
    }
}

/// Durable home of the latest snapshot, used after restarts and when the in-process
/// cache has expired.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Persists `snapshot` and removes every older row.
    async fn store_latest(&self, snapshot: &Snapshot) -> Result<(), StoreError>;

    /// The newest stored snapshot, however old it is.
    async fn get_latest(&self) -> Result<Option<Snapshot>, StoreError>;

    async fn row_count(&self) -> Result<u64, StoreError>;
}

/// [`SnapshotStore`] backed by a single SQLite table holding JSON payloads.
pub struct SqliteSnapshotStore {
    pool: SqlitePool,
}

impl SqliteSnapshotStore {
    const MAX_CONNECTIONS: u32 = 4;
    const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Opens (creating if needed) the database at `database_url`, e.g.
    /// `sqlite://validator-telemetry.db?mode=rwc`.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(Self::MAX_CONNECTIONS)
            .acquire_timeout(Self::ACQUIRE_TIMEOUT)
            .connect(database_url)
            .await?;
        let store = SqliteSnapshotStore { pool };
        store.initialize_schema().await?;
        info!("opened snapshot store at {database_url}");
        Ok(store)
    }

    /// A private in-memory database. All work goes through one connection that is
    /// never recycled, since each SQLite memory connection is its own database.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = SqliteSnapshotStore { pool };
        store.initialize_schema().await?;
        Ok(store)
    }

    async fn initialize_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                captured_at INTEGER NOT NULL,
                payload TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    async fn store_latest(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let payload = serde_json::to_string(snapshot)?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO snapshots (captured_at, payload) VALUES (?, ?)")
            .bind(snapshot.captured_at.timestamp_millis())
            .bind(payload)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            DELETE FROM snapshots
            WHERE id <> (SELECT id FROM snapshots ORDER BY captured_at DESC, id DESC LIMIT 1)
            "#,
        )
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_latest(&self) -> Result<Option<Snapshot>, StoreError> {
        let row = sqlx::query("SELECT payload FROM snapshots ORDER BY captured_at DESC, id DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let payload: String = row.try_get("payload")?;
                Ok(Some(serde_json::from_str(&payload)?))
            }
            None => Ok(None),
        }
    }

    async fn row_count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM snapshots")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}
