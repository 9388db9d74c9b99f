//! Migration runner.
//!
//! Applies and reverts migrations against a [`Backend`]. Writers hold the
//! backend's store-wide lock for the whole batch, and each migration runs in
//! its own transaction that carries both the catalog changes and the ledger
//! mark, so a migration is either fully applied or not applied at all.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::error::{ImportError, MigrateError, Result};
use crate::importer::{ChangeSet, Importer};
use crate::ledger::{self, MigrationLedger};
use crate::migration::{Action, Migration, MigrationId};
use crate::schema::{validate, CollectionSchema};
use crate::store::{Backend, Transaction};

/// Where a migration is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    /// Not applied.
    Pending,
    /// Forward action running.
    Applying,
    /// Applied and recorded in the ledger.
    Applied,
    /// Reverse action running.
    Reverting,
}

impl fmt::Display for MigrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Applying => "applying",
            Self::Applied => "applied",
            Self::Reverting => "reverting",
        })
    }
}

/// Status line for one migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    /// Migration id.
    pub id: MigrationId,
    /// Committed state.
    pub state: MigrationState,
    /// When it was applied.
    pub applied_at: Option<DateTime<Utc>>,
    /// Whether the migration is part of this runner's set.
    pub registered: bool,
}

/// Direction of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Applying migrations.
    Up,
    /// Reverting migrations.
    Down,
}

/// Outcome of `up` or `down`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Direction of the run.
    pub direction: Direction,
    /// Migrations applied or reverted, in execution order.
    pub migrations: Vec<MigrationId>,
    /// Whether nothing was written.
    pub dry_run: bool,
}

impl RunReport {
    fn new(direction: Direction, dry_run: bool) -> Self {
        Self {
            direction,
            migrations: Vec::new(),
            dry_run,
        }
    }

    /// Returns whether no migration ran.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (verb, noun) = match (self.direction, self.dry_run) {
            (Direction::Up, false) => ("Applied", "apply"),
            (Direction::Up, true) => ("Would apply", "apply"),
            (Direction::Down, false) => ("Reverted", "revert"),
            (Direction::Down, true) => ("Would revert", "revert"),
        };
        if self.migrations.is_empty() {
            return writeln!(f, "No migrations to {}", noun);
        }
        writeln!(f, "{} {} migration(s):", verb, self.migrations.len())?;
        for id in &self.migrations {
            writeln!(f, "  {}", id)?;
        }
        Ok(())
    }
}

/// Runs a fixed set of migrations against a backend.
pub struct MigrationRunner<B: Backend> {
    backend: B,
    ledger: MigrationLedger<B>,
    migrations: Vec<Migration>,
    lock_timeout: Option<Duration>,
    dry_run: bool,
}

impl<B: Backend> MigrationRunner<B> {
    /// Creates a runner. Fails if two migrations share an id.
    pub fn new(backend: B, mut migrations: Vec<Migration>) -> Result<Self> {
        migrations.sort_by(|a, b| a.id().cmp(b.id()));
        if let Some(pair) = migrations.windows(2).find(|w| w[0].id() == w[1].id()) {
            return Err(MigrateError::DuplicateMigration(pair[0].id().clone()));
        }

        Ok(Self {
            ledger: MigrationLedger::new(backend.clone()),
            backend,
            migrations,
            lock_timeout: None,
            dry_run: false,
        })
    }

    /// Bounds how long `up`, `down` and `import` wait for the store lock.
    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = Some(timeout);
        self
    }

    /// Enables dry-run mode (actions run on a detached catalog, nothing is written).
    #[must_use]
    pub fn dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    /// Returns the backend.
    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Returns the ledger.
    #[must_use]
    pub fn ledger(&self) -> &MigrationLedger<B> {
        &self.ledger
    }

    /// Returns the migrations, in ascending id order.
    #[must_use]
    pub fn migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Gets a migration by id.
    #[must_use]
    pub fn get(&self, id: &MigrationId) -> Option<&Migration> {
        self.migrations
            .binary_search_by(|m| m.id().cmp(id))
            .ok()
            .map(|idx| &self.migrations[idx])
    }

    fn known_ids(&self) -> Vec<MigrationId> {
        self.migrations.iter().map(|m| m.id().clone()).collect()
    }

    /// Returns migrations that are not applied yet.
    pub async fn pending(&self) -> Result<Vec<MigrationId>> {
        self.ledger.pending(&self.known_ids()).await
    }

    /// Lists every registered or applied migration with its state.
    pub async fn status(&self) -> Result<Vec<MigrationStatus>> {
        let applied: BTreeMap<MigrationId, DateTime<Utc>> = self
            .ledger
            .list_applied()
            .await?
            .into_iter()
            .map(|r| (r.id, r.applied_at))
            .collect();

        let ids: BTreeSet<MigrationId> = self
            .known_ids()
            .into_iter()
            .chain(applied.keys().cloned())
            .collect();

        Ok(ids
            .into_iter()
            .map(|id| {
                let applied_at = applied.get(&id).copied();
                MigrationStatus {
                    state: if applied_at.is_some() {
                        MigrationState::Applied
                    } else {
                        MigrationState::Pending
                    },
                    applied_at,
                    registered: self.get(&id).is_some(),
                    id,
                }
            })
            .collect())
    }

    /// Applies every pending migration in ascending order.
    pub async fn up(&self) -> Result<RunReport> {
        self.up_steps(usize::MAX).await
    }

    /// Applies at most `count` pending migrations in ascending order.
    pub async fn up_steps(&self, count: usize) -> Result<RunReport> {
        let guard = self.acquire().await?;
        let result = self.apply_pending(count).await;
        self.release(guard, result).await
    }

    /// Reverts the `steps` most recently applied migrations, newest first.
    pub async fn down(&self, steps: usize) -> Result<RunReport> {
        let guard = self.acquire().await?;
        let result = self.revert_applied(steps).await;
        self.release(guard, result).await
    }

    /// Reconciles `desired` against the live catalog in one transaction.
    ///
    /// In dry-run mode the change set is only computed.
    pub async fn import(&self, desired: &[CollectionSchema], importer: &Importer) -> Result<ChangeSet> {
        for collection in desired {
            validate(collection).map_err(|source| ImportError::Invalid {
                collection: collection.name.clone(),
                source,
            })?;
        }

        let guard = self.acquire().await?;
        let result = self.import_locked(desired, importer).await;
        self.release(guard, result).await
    }

    async fn acquire(&self) -> Result<B::Guard> {
        debug!(backend = self.backend.name(), "Waiting for migration lock");
        match self.backend.lock(self.lock_timeout).await? {
            Some(guard) => Ok(guard),
            None => Err(MigrateError::LockTimeout(self.lock_timeout.unwrap_or_default())),
        }
    }

    async fn release<T>(&self, guard: B::Guard, result: Result<T>) -> Result<T> {
        let unlocked = self.backend.unlock(guard).await;
        match (result, unlocked) {
            (Err(e), Err(unlock)) => {
                warn!(error = %unlock, "Failed to release migration lock");
                Err(e)
            }
            (Ok(_), Err(unlock)) => Err(unlock.into()),
            (result, Ok(())) => result,
        }
    }

    async fn apply_pending(&self, count: usize) -> Result<RunReport> {
        let known = self.known_ids();
        for id in self.ledger.unknown(&known).await? {
            warn!(id = %id, "Applied migration is not registered");
        }
        let pending: Vec<MigrationId> = self
            .ledger
            .pending(&known)
            .await?
            .into_iter()
            .take(count)
            .collect();

        let mut report = RunReport::new(Direction::Up, self.dry_run);
        if pending.is_empty() {
            info!("No pending migrations");
            return Ok(report);
        }

        if self.dry_run {
            let mut catalog = Catalog::new(self.backend.collections().await?);
            for id in pending {
                let migration = self.get(&id).ok_or_else(|| MigrateError::UnknownMigration(id.clone()))?;
                info!(id = %id, action = %migration.forward().describe(), "Dry run: applying migration");
                replay(&id, migration.forward(), &mut catalog)?;
                report.migrations.push(id);
            }
            return Ok(report);
        }

        for id in pending {
            let migration = self.get(&id).ok_or_else(|| MigrateError::UnknownMigration(id.clone()))?;
            if self.apply_one(migration).await? {
                report.migrations.push(id);
            }
        }
        Ok(report)
    }

    async fn revert_applied(&self, steps: usize) -> Result<RunReport> {
        let targets: Vec<MigrationId> = self
            .ledger
            .list_applied()
            .await?
            .into_iter()
            .rev()
            .take(steps)
            .map(|r| r.id)
            .collect();

        let mut report = RunReport::new(Direction::Down, self.dry_run);
        if targets.is_empty() {
            info!("No applied migrations");
            return Ok(report);
        }

        let mut detached = if self.dry_run {
            Some(Catalog::new(self.backend.collections().await?))
        } else {
            None
        };

        for id in targets {
            let migration = self.get(&id).ok_or_else(|| MigrateError::UnknownMigration(id.clone()))?;
            let reverse = migration
                .reverse()
                .ok_or_else(|| MigrateError::Irreversible(id.clone()))?;

            match detached.as_mut() {
                Some(catalog) => {
                    info!(id = %id, action = %reverse.describe(), "Dry run: reverting migration");
                    replay(&id, reverse, catalog)?;
                }
                None => {
                    if !self.revert_one(&id, reverse).await? {
                        continue;
                    }
                }
            }
            report.migrations.push(id);
        }
        Ok(report)
    }

    /// Applies one migration in its own transaction. Returns `false` if it
    /// turned out to be applied already.
    async fn apply_one(&self, migration: &Migration) -> Result<bool> {
        let id = migration.id();
        info!(id = %id, state = %MigrationState::Applying, "Applying migration");

        let mut tx = self.backend.begin().await?;
        match run_forward(&mut tx, migration).await {
            Ok(true) => {
                tx.commit().await.map_err(|e| failed(id, e.into()))?;
                info!(id = %id, state = %MigrationState::Applied, "Migration applied");
                Ok(true)
            }
            Ok(false) => {
                tx.rollback().await?;
                warn!(id = %id, "Migration already applied, skipping");
                Ok(false)
            }
            Err(e) => {
                rollback(tx, id).await;
                warn!(id = %id, state = %MigrationState::Pending, error = %e, "Migration failed");
                Err(failed(id, e))
            }
        }
    }

    async fn revert_one(&self, id: &MigrationId, reverse: &dyn Action) -> Result<bool> {
        info!(id = %id, state = %MigrationState::Reverting, "Reverting migration");

        let mut tx = self.backend.begin().await?;
        match run_reverse(&mut tx, id, reverse).await {
            Ok(true) => {
                tx.commit().await.map_err(|e| failed(id, e.into()))?;
                info!(id = %id, state = %MigrationState::Pending, "Migration reverted");
                Ok(true)
            }
            Ok(false) => {
                tx.rollback().await?;
                warn!(id = %id, "Migration not applied, skipping revert");
                Ok(false)
            }
            Err(e) => {
                rollback(tx, id).await;
                warn!(id = %id, state = %MigrationState::Applied, error = %e, "Revert failed");
                Err(failed(id, e))
            }
        }
    }

    async fn import_locked(&self, desired: &[CollectionSchema], importer: &Importer) -> Result<ChangeSet> {
        if self.dry_run {
            let existing = self.backend.collections().await?;
            return Ok(importer.reconcile(desired, &existing)?);
        }

        let mut tx = self.backend.begin().await?;
        match import_in(&mut tx, desired, importer).await {
            Ok(changes) => {
                tx.commit().await?;
                let counts = changes.counts();
                info!(
                    created = counts.created,
                    updated = counts.updated,
                    deleted = counts.deleted,
                    "Imported collections"
                );
                Ok(changes)
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(error = %rb, "Rollback failed");
                }
                Err(e)
            }
        }
    }
}

async fn run_forward<T: Transaction>(tx: &mut T, migration: &Migration) -> Result<bool> {
    let id = migration.id();
    if tx.get_record(id).await?.is_some() {
        return Ok(false);
    }

    let mut catalog = Catalog::load(tx).await?;
    migration.forward().apply(&mut catalog)?;
    catalog.bind_relations()?;
    catalog.flush(tx).await?;
    ledger::mark_applied_in(tx, id, Utc::now()).await?;
    Ok(true)
}

async fn run_reverse<T: Transaction>(tx: &mut T, id: &MigrationId, reverse: &dyn Action) -> Result<bool> {
    if tx.get_record(id).await?.is_none() {
        return Ok(false);
    }

    let mut catalog = Catalog::load(tx).await?;
    reverse.apply(&mut catalog)?;
    catalog.bind_relations()?;
    catalog.flush(tx).await?;
    ledger::mark_reverted_in(tx, id).await?;
    Ok(true)
}

async fn import_in<T: Transaction>(
    tx: &mut T,
    desired: &[CollectionSchema],
    importer: &Importer,
) -> Result<ChangeSet> {
    let mut catalog = Catalog::load(tx).await?;
    let changes = importer.reconcile(desired, catalog.collections())?;
    changes.apply(&mut catalog)?;
    catalog.flush(tx).await?;
    Ok(changes)
}

fn replay(id: &MigrationId, action: &dyn Action, catalog: &mut Catalog) -> Result<()> {
    action
        .apply(catalog)
        .and_then(|()| catalog.bind_relations().map_err(MigrateError::from))
        .map_err(|e| failed(id, e))
}

async fn rollback<T: Transaction>(tx: T, id: &MigrationId) {
    if let Err(e) = tx.rollback().await {
        warn!(id = %id, error = %e, "Rollback failed");
    }
}

fn failed(id: &MigrationId, source: MigrateError) -> MigrateError {
    MigrateError::MigrationFailed {
        id: id.clone(),
        source: Box::new(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::DropCollections;
    use crate::schema::{FieldDefinition, FieldKind};
    use crate::store::MemoryBackend;

    fn id(s: &str) -> MigrationId {
        s.parse().unwrap()
    }

    fn create(migration_id: &str, collection: CollectionSchema) -> Migration {
        let drop = DropCollections::new([collection.id.clone()]);
        Migration::new(id(migration_id), move |c: &mut Catalog| -> Result<()> {
            c.create(collection.clone())?;
            Ok(())
        })
        .with_reverse(drop)
    }

    fn products() -> CollectionSchema {
        CollectionSchema::new("p1", "products")
            .field(FieldDefinition::new("title", FieldKind::text()).required())
    }

    fn quotes() -> CollectionSchema {
        CollectionSchema::new("q1", "quotes")
            .field(FieldDefinition::new("product", FieldKind::relation("products")))
    }

    fn failing(migration_id: &str) -> Migration {
        Migration::new(id(migration_id), |c: &mut Catalog| -> Result<()> {
            c.create(CollectionSchema::new("half", "half"))?;
            Err(MigrateError::Action("boom".to_string()))
        })
    }

    fn runner(backend: &MemoryBackend) -> MigrationRunner<MemoryBackend> {
        MigrationRunner::new(
            backend.clone(),
            vec![create("20_quotes", quotes()), create("10_products", products())],
        )
        .unwrap()
    }

    async fn collection_ids(backend: &MemoryBackend) -> Vec<String> {
        backend
            .collections()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect()
    }

    #[tokio::test]
    async fn test_up_applies_in_order() {
        let backend = MemoryBackend::new();
        let runner = runner(&backend);

        let report = runner.up().await.unwrap();
        assert_eq!(report.migrations, vec![id("10_products"), id("20_quotes")]);
        assert_eq!(collection_ids(&backend).await, vec!["p1", "q1"]);

        // The relation was written by name and stored by id
        let stored = backend.collections().await.unwrap();
        assert_eq!(stored[1].fields[0].kind.relation_target(), Some("p1"));
        assert!(runner.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_up_is_idempotent() {
        let backend = MemoryBackend::new();
        let runner = runner(&backend);
        runner.up().await.unwrap();

        let before = backend.collections().await.unwrap();
        let report = runner.up().await.unwrap();
        assert!(report.is_empty());
        assert_eq!(report.to_string(), "No migrations to apply\n");
        assert_eq!(backend.collections().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_up_steps() {
        let backend = MemoryBackend::new();
        let runner = runner(&backend);

        let report = runner.up_steps(1).await.unwrap();
        assert_eq!(report.migrations, vec![id("10_products")]);
        assert_eq!(runner.pending().await.unwrap(), vec![id("20_quotes")]);
    }

    #[tokio::test]
    async fn test_failed_migration_is_rolled_back() {
        let backend = MemoryBackend::new();
        let runner = MigrationRunner::new(
            backend.clone(),
            vec![
                create("10_products", products()),
                failing("20_broken"),
                create("30_quotes", quotes()),
            ],
        )
        .unwrap();

        let err = runner.up().await.unwrap_err();
        assert!(matches!(&err, MigrateError::MigrationFailed { id: m, .. } if *m == id("20_broken")));
        assert!(matches!(err.root_cause(), MigrateError::Action(_)));

        // The first migration stays, the failed one left nothing behind
        // and the batch stopped
        assert_eq!(collection_ids(&backend).await, vec!["p1"]);
        let applied = runner.ledger().list_applied().await.unwrap();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].id, id("10_products"));
    }

    #[tokio::test]
    async fn test_down_reverts_newest_first() {
        let backend = MemoryBackend::new();
        let runner = runner(&backend);
        runner.up().await.unwrap();

        let report = runner.down(1).await.unwrap();
        assert_eq!(report.migrations, vec![id("20_quotes")]);
        assert_eq!(collection_ids(&backend).await, vec!["p1"]);

        let report = runner.down(5).await.unwrap();
        assert_eq!(report.migrations, vec![id("10_products")]);
        assert!(backend.collections().await.unwrap().is_empty());
        assert!(runner.ledger().list_applied().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_round_trip_restores_catalog() {
        let existing = CollectionSchema::new("e1", "existing");
        let backend = MemoryBackend::with_collections([existing]);
        let runner = runner(&backend);
        let before = backend.collections().await.unwrap();

        runner.up().await.unwrap();
        runner.down(2).await.unwrap();
        assert_eq!(backend.collections().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_irreversible_migration_stops_down() {
        let backend = MemoryBackend::new();
        let one_way = Migration::new(id("5_seed"), |c: &mut Catalog| -> Result<()> {
            c.create(CollectionSchema::new("s1", "seed"))?;
            Ok(())
        });
        let runner = MigrationRunner::new(
            backend.clone(),
            vec![one_way, create("10_products", products())],
        )
        .unwrap();
        runner.up().await.unwrap();

        let err = runner.down(2).await.unwrap_err();
        assert!(matches!(err, MigrateError::Irreversible(m) if m == id("5_seed")));

        // The newer migration was reverted before the irreversible one was hit
        assert_eq!(collection_ids(&backend).await, vec!["s1"]);
        assert!(runner.ledger().is_applied(&id("5_seed")).await.unwrap());
    }

    #[tokio::test]
    async fn test_down_with_unknown_migration() {
        let backend = MemoryBackend::new();
        runner(&backend).up().await.unwrap();

        let other = MigrationRunner::new(backend.clone(), vec![create("10_products", products())]).unwrap();
        let err = other.down(1).await.unwrap_err();
        assert!(matches!(err, MigrateError::UnknownMigration(m) if m == id("20_quotes")));
    }

    #[tokio::test]
    async fn test_duplicate_ids_rejected() {
        let result = MigrationRunner::new(
            MemoryBackend::new(),
            vec![create("10_products", products()), create("10_products", quotes())],
        );
        assert!(matches!(result, Err(MigrateError::DuplicateMigration(_))));
    }

    #[tokio::test]
    async fn test_dry_run_writes_nothing() {
        let backend = MemoryBackend::new();
        let report = runner(&backend).dry_run(true).up().await.unwrap();

        assert!(report.dry_run);
        assert_eq!(report.migrations.len(), 2);
        assert!(report.to_string().starts_with("Would apply 2 migration(s):"));
        assert!(backend.collections().await.unwrap().is_empty());
        assert!(backend.records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_runners_apply_once() {
        let backend = MemoryBackend::new();
        let first = runner(&backend);
        let second = runner(&backend);

        let (a, b) = tokio::join!(first.up(), second.up());
        let (a, b) = (a.unwrap(), b.unwrap());

        // Whoever ran second found nothing pending
        assert_eq!(a.migrations.len() + b.migrations.len(), 2);
        assert!(a.is_empty() || b.is_empty());
        assert_eq!(backend.records().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_lock_timeout() {
        let backend = MemoryBackend::new();
        let guard = backend.lock(None).await.unwrap().unwrap();

        let runner = runner(&backend).with_lock_timeout(Duration::from_millis(50));
        let err = runner.up().await.unwrap_err();
        assert!(matches!(err, MigrateError::LockTimeout(_)));
        assert!(backend.records().await.unwrap().is_empty());

        backend.unlock(guard).await.unwrap();
        assert_eq!(runner.up().await.unwrap().migrations.len(), 2);
    }

    #[tokio::test]
    async fn test_status() {
        let backend = MemoryBackend::new();
        let runner = runner(&backend);
        runner.up_steps(1).await.unwrap();

        let status = runner.status().await.unwrap();
        assert_eq!(status.len(), 2);
        assert_eq!(status[0].state, MigrationState::Applied);
        assert!(status[0].applied_at.is_some());
        assert_eq!(status[1].state, MigrationState::Pending);
        assert!(status.iter().all(|s| s.registered));
    }

    #[tokio::test]
    async fn test_import_under_lock() {
        let backend = MemoryBackend::new();
        let runner = MigrationRunner::new(backend.clone(), Vec::new()).unwrap();
        let importer = Importer::new();

        let changes = runner.import(&[quotes(), products()], &importer).await.unwrap();
        assert_eq!(changes.counts().created, 2);
        assert_eq!(collection_ids(&backend).await, vec!["p1", "q1"]);

        let again = runner.import(&[quotes(), products()], &importer).await.unwrap();
        assert!(again.is_empty());

        let dry = runner
            .dry_run(true)
            .import(&[CollectionSchema::new("n1", "notes")], &importer)
            .await
            .unwrap();
        assert_eq!(dry.counts().created, 1);
        assert_eq!(backend.collections().await.unwrap().len(), 2);
    }
}
