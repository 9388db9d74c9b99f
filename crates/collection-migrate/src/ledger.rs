//! Migration ledger.
//!
//! The ledger records which migrations have been applied to a store. It is
//! kept next to the catalog in the same backend, so the runner can mark a
//! migration inside the transaction that applies its catalog changes.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::error::{MigrateError, Result, StoreResult};
use crate::migration::MigrationId;
use crate::store::{Backend, Transaction};

/// A record of an applied migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRecord {
    /// Migration identifier.
    pub id: MigrationId,
    /// When the migration was applied.
    pub applied_at: DateTime<Utc>,
}

/// Reads and writes the ledger of a backend.
#[derive(Debug, Clone)]
pub struct MigrationLedger<B> {
    backend: B,
}

impl<B: Backend> MigrationLedger<B> {
    /// Creates a ledger over `backend`.
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    /// Returns applied migrations in ascending id order.
    pub async fn list_applied(&self) -> Result<Vec<MigrationRecord>> {
        let mut records = self.backend.records().await?;
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    /// Checks whether `id` has been applied.
    pub async fn is_applied(&self, id: &MigrationId) -> Result<bool> {
        Ok(self.backend.records().await?.iter().any(|r| &r.id == id))
    }

    /// Records `id` as applied. Marking an applied migration again is a no-op.
    ///
    /// Waits for the store lock, so a mark never interleaves with a running
    /// migration.
    pub async fn mark_applied(&self, id: &MigrationId) -> Result<()> {
        if !self.write(id, Mark::Applied).await? {
            debug!(migration = %id, "Already marked applied");
        }
        Ok(())
    }

    /// Removes the record for `id`. Reverting an unapplied migration is a no-op.
    pub async fn mark_reverted(&self, id: &MigrationId) -> Result<()> {
        if !self.write(id, Mark::Reverted).await? {
            debug!(migration = %id, "Not marked applied");
        }
        Ok(())
    }

    async fn write(&self, id: &MigrationId, mark: Mark) -> Result<bool> {
        let guard = self
            .backend
            .lock(None)
            .await?
            .ok_or(MigrateError::LockTimeout(Duration::ZERO))?;
        let result = write_in(&self.backend, id, mark).await;
        let unlocked = self.backend.unlock(guard).await;
        match (result, unlocked) {
            (Err(e), Err(unlock)) => {
                warn!(error = %unlock, "Failed to release migration lock");
                Err(e.into())
            }
            (Ok(_), Err(unlock)) => Err(unlock.into()),
            (result, Ok(())) => Ok(result?),
        }
    }

    /// Returns the ids from `known` that are not applied, ascending and deduplicated.
    pub async fn pending(&self, known: &[MigrationId]) -> Result<Vec<MigrationId>> {
        let applied: BTreeSet<MigrationId> = self
            .backend
            .records()
            .await?
            .into_iter()
            .map(|r| r.id)
            .collect();

        let pending: BTreeSet<&MigrationId> =
            known.iter().filter(|id| !applied.contains(*id)).collect();
        Ok(pending.into_iter().cloned().collect())
    }

    /// Returns applied ids that are missing from `known`.
    pub async fn unknown(&self, known: &[MigrationId]) -> Result<Vec<MigrationId>> {
        Ok(self
            .list_applied()
            .await?
            .into_iter()
            .map(|r| r.id)
            .filter(|id| !known.contains(id))
            .collect())
    }

}

#[derive(Debug, Clone, Copy)]
enum Mark {
    Applied,
    Reverted,
}

async fn write_in<B: Backend>(backend: &B, id: &MigrationId, mark: Mark) -> StoreResult<bool> {
    let mut tx = backend.begin().await?;
    let changed = match mark {
        Mark::Applied => mark_applied_in(&mut tx, id, Utc::now()).await,
        Mark::Reverted => mark_reverted_in(&mut tx, id).await,
    };
    match changed {
        Ok(changed) => {
            tx.commit().await?;
            Ok(changed)
        }
        Err(e) => {
            if let Err(rollback) = tx.rollback().await {
                warn!(error = %rollback, "Rollback failed");
            }
            Err(e)
        }
    }
}

/// Marks `id` applied within `tx`. Returns whether a record was written.
pub(crate) async fn mark_applied_in<T: Transaction>(
    tx: &mut T,
    id: &MigrationId,
    at: DateTime<Utc>,
) -> StoreResult<bool> {
    if tx.get_record(id).await?.is_some() {
        return Ok(false);
    }
    tx.put_record(&MigrationRecord {
        id: id.clone(),
        applied_at: at,
    })
    .await?;
    Ok(true)
}

/// Removes the record for `id` within `tx`. Returns whether one existed.
pub(crate) async fn mark_reverted_in<T: Transaction>(
    tx: &mut T,
    id: &MigrationId,
) -> StoreResult<bool> {
    if tx.get_record(id).await?.is_none() {
        return Ok(false);
    }
    tx.delete_record(id).await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBackend;

    fn id(s: &str) -> MigrationId {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_mark_and_list() {
        let ledger = MigrationLedger::new(MemoryBackend::new());
        ledger.mark_applied(&id("20_second")).await.unwrap();
        ledger.mark_applied(&id("10_first")).await.unwrap();

        let applied: Vec<MigrationId> = ledger
            .list_applied()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(applied, vec![id("10_first"), id("20_second")]);
        assert!(ledger.is_applied(&id("10_first")).await.unwrap());
    }

    #[tokio::test]
    async fn test_marks_are_idempotent() {
        let ledger = MigrationLedger::new(MemoryBackend::new());
        ledger.mark_applied(&id("10_first")).await.unwrap();
        let first = ledger.list_applied().await.unwrap();

        ledger.mark_applied(&id("10_first")).await.unwrap();
        assert_eq!(ledger.list_applied().await.unwrap(), first);

        ledger.mark_reverted(&id("10_first")).await.unwrap();
        ledger.mark_reverted(&id("10_first")).await.unwrap();
        assert!(ledger.list_applied().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_sorted_and_deduplicated() {
        let ledger = MigrationLedger::new(MemoryBackend::new());
        ledger.mark_applied(&id("20_b")).await.unwrap();

        let known = vec![id("30_c"), id("10_a"), id("20_b"), id("10_a")];
        let pending = ledger.pending(&known).await.unwrap();
        assert_eq!(pending, vec![id("10_a"), id("30_c")]);
    }

    #[tokio::test]
    async fn test_unknown_applied_migration() {
        let ledger = MigrationLedger::new(MemoryBackend::new());
        ledger.mark_applied(&id("99_gone")).await.unwrap();
        ledger.mark_applied(&id("10_a")).await.unwrap();

        let unknown = ledger.unknown(&[id("10_a")]).await.unwrap();
        assert_eq!(unknown, vec![id("99_gone")]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_marks_are_all_recorded() {
        let ledger = MigrationLedger::new(MemoryBackend::new());

        let mut handles = Vec::new();
        for i in 0..200 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.mark_applied(&id(&format!("{i}_m"))).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(ledger.list_applied().await.unwrap().len(), 200);

        let mut handles = Vec::new();
        for i in (0..200).step_by(2) {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.mark_reverted(&id(&format!("{i}_m"))).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(ledger.list_applied().await.unwrap().len(), 100);
    }

    #[tokio::test]
    async fn test_mark_waits_for_store_lock() {
        let backend = MemoryBackend::new();
        let ledger = MigrationLedger::new(backend.clone());
        let guard = backend.lock(None).await.unwrap().unwrap();

        let first = id("10_a");
        let blocked = tokio::time::timeout(Duration::from_millis(50), ledger.mark_applied(&first)).await;
        assert!(blocked.is_err());
        assert!(!ledger.is_applied(&first).await.unwrap());

        backend.unlock(guard).await.unwrap();
        ledger.mark_applied(&first).await.unwrap();
        assert!(ledger.is_applied(&first).await.unwrap());
    }
}
