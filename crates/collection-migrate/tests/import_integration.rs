//! Integration tests for collection imports.
//!
//! These go through `MigrationRunner::import` so the change set is applied
//! and committed against a real store.

mod common;

use collection_migrate::prelude::*;
use common::*;

// ============================================================================
// Reconcile
// ============================================================================

#[test]
fn test_reconcile_never_deletes_without_delete_missing() {
    let existing = vec![tags(), products()];
    let changes = reconcile(&[products()], &existing, false).unwrap();
    assert!(changes.deleted.is_empty());
    assert!(changes.is_empty());

    let changes = reconcile(&[], &existing, false).unwrap();
    assert!(changes.deleted.is_empty());

    let changes = reconcile(&[products()], &existing, true).unwrap();
    assert_eq!(changes.deleted.len(), 1);
    assert_eq!(changes.deleted[0].name, "tags");
}

#[test]
fn test_reconcile_added_field() {
    let existing = vec![tags()];
    let desired = vec![tags().field(FieldDefinition::new("color", FieldKind::text()))];

    let changes = reconcile(&desired, &existing, false).unwrap();
    assert!(changes.created.is_empty());
    assert!(changes.deleted.is_empty());
    assert_eq!(changes.updated.len(), 1);

    let fields = &changes.updated[0].fields;
    assert_eq!(fields.added.len(), 1);
    assert_eq!(fields.added[0].name, "color");
    assert!(fields.removed.is_empty());
    assert!(fields.changed.is_empty());
}

#[test]
fn test_reconcile_binds_relations_between_new_collections() {
    // Orders comes first and targets products by name.
    let changes = reconcile(&[orders(), products()], &[], false).unwrap();
    assert_eq!(changes.created.len(), 2);

    let orders = &changes.created[0];
    assert_eq!(
        orders.get_field("product").unwrap().kind.relation_target(),
        Some("prod0000000001")
    );
}

// ============================================================================
// Import through the runner
// ============================================================================

async fn check_import_is_idempotent<B: Backend>(backend: B) {
    let runner = MigrationRunner::new(backend.clone(), Vec::new()).unwrap();
    let importer = Importer::new();
    let desired = vec![orders(), products()];

    let changes = runner.import(&desired, &importer).await.unwrap();
    assert_eq!(changes.counts().created, 2);
    assert_eq!(names(&backend).await, vec!["orders", "products"]);

    let again = runner.import(&desired, &importer).await.unwrap();
    assert!(again.is_empty(), "unexpected changes:\n{again}");
    assert_eq!(again.to_string(), "No changes\n");
}

#[tokio::test]
async fn test_import_is_idempotent_memory() {
    check_import_is_idempotent(MemoryBackend::new()).await;
}

#[tokio::test]
async fn test_import_is_idempotent_sqlite() {
    check_import_is_idempotent(sqlite_memory().await).await;
}

async fn check_import_failure_changes_nothing<B: Backend>(backend: B) {
    seed(&backend, &[products()]).await;
    let runner = MigrationRunner::new(backend.clone(), Vec::new()).unwrap();
    let importer = Importer::with_options(ImportOptions::new().delete_missing(true));

    // Deleting products would leave the new orders relation dangling.
    let err = runner.import(&[orders()], &importer).await.unwrap_err();
    assert!(matches!(
        err,
        MigrateError::Import(ImportError::UnresolvedRelation { .. })
            | MigrateError::Import(ImportError::ReferencedCollection { .. })
    ));
    assert_eq!(names(&backend).await, vec!["products"]);
}

#[tokio::test]
async fn test_import_failure_changes_nothing_memory() {
    check_import_failure_changes_nothing(MemoryBackend::new()).await;
}

#[tokio::test]
async fn test_import_failure_changes_nothing_sqlite() {
    check_import_failure_changes_nothing(sqlite_memory().await).await;
}

#[tokio::test]
async fn test_import_rename_hint_sqlite() {
    let backend = sqlite_memory().await;
    seed(&backend, &[tags()]).await;
    let runner = MigrationRunner::new(backend.clone(), Vec::new()).unwrap();

    let mut renamed = tags();
    renamed.fields[0].name = "title".to_string();
    renamed.fields[0].id = None;
    let importer = Importer::with_options(
        ImportOptions::new().with_renames(RenameHints::new().rename("tags00000000001", "label", "title")),
    );

    let changes = runner.import(&[renamed], &importer).await.unwrap();
    assert_eq!(changes.updated.len(), 1);
    assert_eq!(
        changes.updated[0].fields.renamed,
        vec![("label".to_string(), "title".to_string())]
    );

    // The field keeps its id across the rename.
    let tags = backend.collections().await.unwrap().remove(0);
    let title = tags.get_field("title").unwrap();
    assert_eq!(title.id.as_deref(), Some("tags_label"));
    assert!(tags.get_field("label").is_none());
}

#[tokio::test]
async fn test_import_dry_run_sqlite() {
    let backend = sqlite_memory().await;
    let runner = MigrationRunner::new(backend.clone(), Vec::new())
        .unwrap()
        .dry_run(true);

    let changes = runner
        .import(&[products(), tags()], &Importer::new())
        .await
        .unwrap();
    assert_eq!(changes.counts().created, 2);
    assert!(changes.to_string().contains("+ create products"));
    assert!(names(&backend).await.is_empty());
}

#[tokio::test]
async fn test_import_rejects_invalid_schema_before_locking() {
    let backend = MemoryBackend::new();
    let runner = MigrationRunner::new(backend.clone(), Vec::new()).unwrap();

    let invalid = CollectionSchema::new("bad00000000001", "bad")
        .field(FieldDefinition::new("title", FieldKind::text()))
        .field(FieldDefinition::new("Title", FieldKind::text()));

    // Holding the lock proves validation runs first.
    let guard = backend.lock(None).await.unwrap().unwrap();
    let err = runner.import(&[invalid], &Importer::new()).await.unwrap_err();
    assert!(matches!(err, MigrateError::Import(ImportError::Invalid { .. })));
    backend.unlock(guard).await.unwrap();
}
