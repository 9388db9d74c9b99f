//! Storage backends.
//!
//! A backend persists two things: the live collection catalog and the
//! migration ledger. Both are written through a [`Transaction`] so that a
//! migration's catalog changes and its ledger mark commit together. Writers
//! also hold the backend's store-wide lock; readers use the snapshot methods
//! on [`Backend`] and only ever see committed state.

mod memory;
mod sqlite;

use std::future::Future;
use std::time::Duration;

pub use memory::MemoryBackend;
pub use sqlite::{SqliteBackend, SqliteLockGuard};

use crate::error::StoreResult;
use crate::ledger::MigrationRecord;
use crate::migration::MigrationId;
use crate::schema::CollectionSchema;

/// A durable store for the catalog and the ledger.
///
/// Handles are cheap to clone and share the same underlying store.
pub trait Backend: Clone + Send + Sync + 'static {
    /// Transaction type.
    type Tx: Transaction;

    /// Proof that the store-wide write lock is held.
    type Guard: Send;

    /// Returns the backend name, for logging.
    fn name(&self) -> &'static str;

    /// Acquires the store-wide write lock, waiting while another writer holds it.
    ///
    /// Returns `None` if `timeout` elapses first. Without a timeout the wait
    /// is unbounded.
    fn lock(
        &self,
        timeout: Option<Duration>,
    ) -> impl Future<Output = StoreResult<Option<Self::Guard>>> + Send;

    /// Releases the store-wide write lock.
    fn unlock(&self, guard: Self::Guard) -> impl Future<Output = StoreResult<()>> + Send;

    /// Starts a transaction.
    fn begin(&self) -> impl Future<Output = StoreResult<Self::Tx>> + Send;

    /// Returns the committed catalog, ordered by collection id.
    fn collections(&self) -> impl Future<Output = StoreResult<Vec<CollectionSchema>>> + Send;

    /// Returns the committed ledger records, in no particular order.
    fn records(&self) -> impl Future<Output = StoreResult<Vec<MigrationRecord>>> + Send;
}

/// A unit of work against a [`Backend`].
///
/// Dropping a transaction without committing discards its writes.
pub trait Transaction: Send {
    /// Gets a collection by id.
    fn get_collection(
        &mut self,
        id: &str,
    ) -> impl Future<Output = StoreResult<Option<CollectionSchema>>> + Send;

    /// Inserts or replaces a collection, keyed by its id.
    fn put_collection(
        &mut self,
        collection: &CollectionSchema,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    /// Removes a collection. Removing a missing id is not an error.
    fn delete_collection(&mut self, id: &str) -> impl Future<Output = StoreResult<()>> + Send;

    /// Returns every collection, ordered by id.
    fn all_collections(&mut self) -> impl Future<Output = StoreResult<Vec<CollectionSchema>>> + Send;

    /// Gets a ledger record.
    fn get_record(
        &mut self,
        id: &MigrationId,
    ) -> impl Future<Output = StoreResult<Option<MigrationRecord>>> + Send;

    /// Inserts or replaces a ledger record.
    fn put_record(&mut self, record: &MigrationRecord) -> impl Future<Output = StoreResult<()>> + Send;

    /// Removes a ledger record. Removing a missing id is not an error.
    fn delete_record(&mut self, id: &MigrationId) -> impl Future<Output = StoreResult<()>> + Send;

    /// Returns every ledger record.
    fn all_records(&mut self) -> impl Future<Output = StoreResult<Vec<MigrationRecord>>> + Send;

    /// Makes the writes visible.
    fn commit(self) -> impl Future<Output = StoreResult<()>> + Send;

    /// Discards the writes.
    fn rollback(self) -> impl Future<Output = StoreResult<()>> + Send;
}
