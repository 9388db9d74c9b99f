//! SQLite backend.
//!
//! The catalog lives in `_collections` (one JSON definition per row), the
//! ledger in `_migrations`, and the store-wide write lock is the single row
//! of `_migration_lock`. The row is what serializes separate processes; an
//! in-process mutex in front of it keeps local callers queueing instead of
//! polling.
//!
//! Transactions start with `BEGIN IMMEDIATE`, so a transaction owns the
//! database write lock from its first statement and never has to upgrade a
//! read lock midway. A process waiting for the lock row only reads it, and
//! attempts the insert once the row is gone.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Sqlite;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::{Backend, Transaction};
use crate::error::{StoreError, StoreResult};
use crate::ledger::MigrationRecord;
use crate::migration::MigrationId;
use crate::schema::CollectionSchema;

/// SQL to create the catalog table.
pub const CREATE_COLLECTIONS_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS _collections (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    type TEXT NOT NULL,
    definition TEXT NOT NULL,
    updated TEXT NOT NULL
)
"#;

/// SQL to create the migrations ledger table.
pub const CREATE_MIGRATIONS_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS _migrations (
    file TEXT PRIMARY KEY NOT NULL,
    applied TEXT NOT NULL
)
"#;

/// SQL to create the single-row lock table.
pub const CREATE_LOCK_TABLE_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS _migration_lock (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    holder TEXT NOT NULL,
    acquired TEXT NOT NULL
)
"#;

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_HOLDER: AtomicU64 = AtomicU64::new(1);

/// Stores the catalog and ledger in SQLite.
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
    local: Arc<Mutex<()>>,
}

/// Held while this process owns the `_migration_lock` row.
#[derive(Debug)]
pub struct SqliteLockGuard {
    _local: OwnedMutexGuard<()>,
    holder: String,
}

impl SqliteLockGuard {
    /// Returns the token written into the lock row.
    #[must_use]
    pub fn holder(&self) -> &str {
        &self.holder
    }
}

impl SqliteBackend {
    /// Wraps an existing pool.
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            local: Arc::default(),
        }
    }

    /// Connects to `url`, creating the database file if needed.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self::new(pool))
    }

    /// Returns the underlying pool.
    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Ensures the catalog, ledger and lock tables exist.
    pub async fn ensure_tables(&self) -> StoreResult<()> {
        for sql in [
            CREATE_COLLECTIONS_TABLE_SQL,
            CREATE_MIGRATIONS_TABLE_SQL,
            CREATE_LOCK_TABLE_SQL,
        ] {
            sqlx::query(sql).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Returns the token of the current lock holder, if any.
    pub async fn lock_holder(&self) -> StoreResult<Option<String>> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT holder FROM _migration_lock WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(holder,)| holder))
    }

    async fn try_claim(&self, holder: &str) -> StoreResult<bool> {
        let result =
            sqlx::query("INSERT OR IGNORE INTO _migration_lock (id, holder, acquired) VALUES (1, ?, ?)")
                .bind(holder)
                .bind(Utc::now().to_rfc3339())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected() == 1)
    }
}

impl Backend for SqliteBackend {
    type Tx = SqliteTransaction;
    type Guard = SqliteLockGuard;

    fn name(&self) -> &'static str {
        "sqlite"
    }

    async fn lock(&self, timeout: Option<Duration>) -> StoreResult<Option<Self::Guard>> {
        let deadline = timeout.map(|limit| Instant::now() + limit);
        let acquire = Arc::clone(&self.local).lock_owned();
        let local = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, acquire).await {
                Ok(local) => local,
                Err(_) => return Ok(None),
            },
            None => acquire.await,
        };
        let holder = format!(
            "pid-{}-{}",
            std::process::id(),
            NEXT_HOLDER.fetch_add(1, Ordering::Relaxed)
        );

        loop {
            match self.lock_holder().await? {
                Some(current) => debug!(holder = %current, "Migration lock is held, waiting"),
                None => {
                    if self.try_claim(&holder).await? {
                        debug!(holder = %holder, "Acquired migration lock");
                        return Ok(Some(SqliteLockGuard {
                            _local: local,
                            holder,
                        }));
                    }
                }
            }
            if deadline.is_some_and(|deadline| Instant::now() + LOCK_POLL_INTERVAL > deadline) {
                return Ok(None);
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL).await;
        }
    }

    async fn unlock(&self, guard: Self::Guard) -> StoreResult<()> {
        let result = sqlx::query("DELETE FROM _migration_lock WHERE id = 1 AND holder = ?")
            .bind(&guard.holder)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            warn!(holder = %guard.holder, "Migration lock row was already gone");
        }
        Ok(())
    }

    async fn begin(&self) -> StoreResult<Self::Tx> {
        Ok(SqliteTransaction {
            tx: self.pool.begin_with("BEGIN IMMEDIATE").await?,
        })
    }

    async fn collections(&self) -> StoreResult<Vec<CollectionSchema>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT definition FROM _collections ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(|(definition,)| decode_collection(definition)).collect()
    }

    async fn records(&self) -> StoreResult<Vec<MigrationRecord>> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT file, applied FROM _migrations")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(|(file, applied)| decode_record(&file, &applied)).collect()
    }
}

/// Transaction over a [`SqliteBackend`].
pub struct SqliteTransaction {
    tx: sqlx::Transaction<'static, Sqlite>,
}

impl Transaction for SqliteTransaction {
    async fn get_collection(&mut self, id: &str) -> StoreResult<Option<CollectionSchema>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT definition FROM _collections WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *self.tx)
            .await?;
        row.map(|(definition,)| decode_collection(&definition)).transpose()
    }

    async fn put_collection(&mut self, collection: &CollectionSchema) -> StoreResult<()> {
        let definition = serde_json::to_string(collection)?;
        sqlx::query(
            "INSERT INTO _collections (id, name, type, definition, updated) VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, type = excluded.type, \
             definition = excluded.definition, updated = excluded.updated",
        )
        .bind(&collection.id)
        .bind(&collection.name)
        .bind(collection.kind.as_str())
        .bind(definition)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn delete_collection(&mut self, id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM _collections WHERE id = ?")
            .bind(id)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn all_collections(&mut self) -> StoreResult<Vec<CollectionSchema>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT definition FROM _collections ORDER BY id")
            .fetch_all(&mut *self.tx)
            .await?;
        rows.iter().map(|(definition,)| decode_collection(definition)).collect()
    }

    async fn get_record(&mut self, id: &MigrationId) -> StoreResult<Option<MigrationRecord>> {
        let row: Option<(String, String)> =
            sqlx::query_as("SELECT file, applied FROM _migrations WHERE file = ?")
                .bind(id.to_string())
                .fetch_optional(&mut *self.tx)
                .await?;
        row.map(|(file, applied)| decode_record(&file, &applied)).transpose()
    }

    async fn put_record(&mut self, record: &MigrationRecord) -> StoreResult<()> {
        sqlx::query("INSERT OR REPLACE INTO _migrations (file, applied) VALUES (?, ?)")
            .bind(record.id.to_string())
            .bind(record.applied_at.to_rfc3339())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn delete_record(&mut self, id: &MigrationId) -> StoreResult<()> {
        sqlx::query("DELETE FROM _migrations WHERE file = ?")
            .bind(id.to_string())
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn all_records(&mut self) -> StoreResult<Vec<MigrationRecord>> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT file, applied FROM _migrations")
            .fetch_all(&mut *self.tx)
            .await?;
        rows.into_iter().map(|(file, applied)| decode_record(&file, &applied)).collect()
    }

    async fn commit(self) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> StoreResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

fn decode_collection(definition: &str) -> StoreResult<CollectionSchema> {
    Ok(serde_json::from_str(definition)?)
}

fn decode_record(file: &str, applied: &str) -> StoreResult<MigrationRecord> {
    let id = file
        .parse::<MigrationId>()
        .map_err(|e| StoreError::Corrupt(e.to_string()))?;
    let applied_at = DateTime::parse_from_rfc3339(applied)
        .map_err(|e| StoreError::Corrupt(format!("applied time of '{}': {}", file, e)))?
        .with_timezone(&Utc);
    Ok(MigrationRecord { id, applied_at })
}
