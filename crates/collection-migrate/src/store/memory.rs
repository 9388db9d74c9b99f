//! In-process backend.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use super::{Backend, Transaction};
use crate::error::StoreResult;
use crate::ledger::MigrationRecord;
use crate::migration::MigrationId;
use crate::schema::CollectionSchema;

#[derive(Debug, Clone, Default)]
struct MemoryState {
    collections: BTreeMap<String, CollectionSchema>,
    records: BTreeMap<MigrationId, MigrationRecord>,
}

impl MemoryState {
    fn apply(&mut self, write: Write) {
        match write {
            Write::PutCollection(collection) => {
                self.collections.insert(collection.id.clone(), collection);
            }
            Write::DeleteCollection(id) => {
                self.collections.remove(&id);
            }
            Write::PutRecord(record) => {
                self.records.insert(record.id.clone(), record);
            }
            Write::DeleteRecord(id) => {
                self.records.remove(&id);
            }
        }
    }
}

#[derive(Debug, Clone)]
enum Write {
    PutCollection(CollectionSchema),
    DeleteCollection(String),
    PutRecord(MigrationRecord),
    DeleteRecord(MigrationId),
}

/// Keeps the catalog and ledger in memory.
///
/// A transaction reads from a private copy of the state and logs its writes.
/// Commit replays the log onto the shared state under its write lock, so
/// transactions that touch different keys never undo each other.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    state: Arc<RwLock<MemoryState>>,
    lock: Arc<Mutex<()>>,
}

impl MemoryBackend {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store whose catalog already holds `collections`.
    #[must_use]
    pub fn with_collections(collections: impl IntoIterator<Item = CollectionSchema>) -> Self {
        let state = MemoryState {
            collections: collections.into_iter().map(|c| (c.id.clone(), c)).collect(),
            records: BTreeMap::new(),
        };
        Self {
            state: Arc::new(RwLock::new(state)),
            lock: Arc::default(),
        }
    }
}

impl Backend for MemoryBackend {
    type Tx = MemoryTransaction;
    type Guard = OwnedMutexGuard<()>;

    fn name(&self) -> &'static str {
        "memory"
    }

    async fn lock(&self, timeout: Option<Duration>) -> StoreResult<Option<Self::Guard>> {
        let acquire = Arc::clone(&self.lock).lock_owned();
        match timeout {
            Some(limit) => Ok(tokio::time::timeout(limit, acquire).await.ok()),
            None => Ok(Some(acquire.await)),
        }
    }

    async fn unlock(&self, guard: Self::Guard) -> StoreResult<()> {
        drop(guard);
        Ok(())
    }

    async fn begin(&self) -> StoreResult<Self::Tx> {
        let working = self.state.read().await.clone();
        Ok(MemoryTransaction {
            shared: Arc::clone(&self.state),
            working,
            log: Vec::new(),
        })
    }

    async fn collections(&self) -> StoreResult<Vec<CollectionSchema>> {
        Ok(self.state.read().await.collections.values().cloned().collect())
    }

    async fn records(&self) -> StoreResult<Vec<MigrationRecord>> {
        Ok(self.state.read().await.records.values().cloned().collect())
    }
}

/// Transaction over a [`MemoryBackend`].
#[derive(Debug)]
pub struct MemoryTransaction {
    shared: Arc<RwLock<MemoryState>>,
    working: MemoryState,
    log: Vec<Write>,
}

impl MemoryTransaction {
    fn write(&mut self, write: Write) {
        self.working.apply(write.clone());
        self.log.push(write);
    }
}

impl Transaction for MemoryTransaction {
    async fn get_collection(&mut self, id: &str) -> StoreResult<Option<CollectionSchema>> {
        Ok(self.working.collections.get(id).cloned())
    }

    async fn put_collection(&mut self, collection: &CollectionSchema) -> StoreResult<()> {
        self.write(Write::PutCollection(collection.clone()));
        Ok(())
    }

    async fn delete_collection(&mut self, id: &str) -> StoreResult<()> {
        self.write(Write::DeleteCollection(id.to_string()));
        Ok(())
    }

    async fn all_collections(&mut self) -> StoreResult<Vec<CollectionSchema>> {
        Ok(self.working.collections.values().cloned().collect())
    }

    async fn get_record(&mut self, id: &MigrationId) -> StoreResult<Option<MigrationRecord>> {
        Ok(self.working.records.get(id).cloned())
    }

    async fn put_record(&mut self, record: &MigrationRecord) -> StoreResult<()> {
        self.write(Write::PutRecord(record.clone()));
        Ok(())
    }

    async fn delete_record(&mut self, id: &MigrationId) -> StoreResult<()> {
        self.write(Write::DeleteRecord(id.clone()));
        Ok(())
    }

    async fn all_records(&mut self) -> StoreResult<Vec<MigrationRecord>> {
        Ok(self.working.records.values().cloned().collect())
    }

    async fn commit(self) -> StoreResult<()> {
        let mut shared = self.shared.write().await;
        for write in self.log {
            shared.apply(write);
        }
        Ok(())
    }

    async fn rollback(self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDefinition, FieldKind};

    fn products() -> CollectionSchema {
        CollectionSchema::new("products", "products")
            .field(FieldDefinition::new("title", FieldKind::text()))
    }

    #[tokio::test]
    async fn test_commit_publishes_writes() {
        let backend = MemoryBackend::new();
        let mut tx = backend.begin().await.unwrap();
        tx.put_collection(&products()).await.unwrap();

        // Not visible before commit
        assert!(backend.collections().await.unwrap().is_empty());

        tx.commit().await.unwrap();
        assert_eq!(backend.collections().await.unwrap(), vec![products()]);
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let backend = MemoryBackend::with_collections([products()]);
        let mut tx = backend.begin().await.unwrap();
        tx.delete_collection("products").await.unwrap();
        assert!(tx.all_collections().await.unwrap().is_empty());
        tx.rollback().await.unwrap();

        assert_eq!(backend.collections().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_commits_keep_each_others_writes() {
        let backend = MemoryBackend::with_collections([products()]);
        let mut first = backend.begin().await.unwrap();
        let mut second = backend.begin().await.unwrap();

        first
            .put_collection(&CollectionSchema::new("quotes", "quotes"))
            .await
            .unwrap();
        second.delete_collection("products").await.unwrap();
        second
            .put_record(&MigrationRecord {
                id: "10_first".parse().unwrap(),
                applied_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        first.commit().await.unwrap();
        second.commit().await.unwrap();

        let ids: Vec<String> = backend
            .collections()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["quotes"]);
        assert_eq!(backend.records().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let backend = MemoryBackend::new();
        let guard = backend.lock(None).await.unwrap().unwrap();

        let other = backend.clone();
        let waiting = other.lock(Some(Duration::from_millis(50))).await.unwrap();
        assert!(waiting.is_none());

        backend.unlock(guard).await.unwrap();
        let guard = other.lock(Some(Duration::from_millis(50))).await.unwrap().unwrap();
        other.unlock(guard).await.unwrap();
    }
}
