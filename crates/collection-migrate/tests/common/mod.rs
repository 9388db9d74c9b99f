//! Common test utilities for integration tests.

#![allow(dead_code)]

use std::path::Path;

use collection_migrate::prelude::*;
use sqlx::sqlite::SqlitePoolOptions;

/// Creates an in-memory SQLite backend with its tables.
pub async fn sqlite_memory() -> SqliteBackend {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect(":memory:")
        .await
        .unwrap();
    let backend = SqliteBackend::new(pool);
    backend.ensure_tables().await.unwrap();
    backend
}

/// Opens a file-backed SQLite backend. Separate calls share the file but
/// nothing else, like two processes would.
pub async fn sqlite_file(path: &Path) -> SqliteBackend {
    let backend = SqliteBackend::connect(&format!("sqlite:{}", path.display()))
        .await
        .unwrap();
    backend.ensure_tables().await.unwrap();
    backend
}

/// Writes `collections` straight into the catalog.
pub async fn seed<B: Backend>(backend: &B, collections: &[CollectionSchema]) {
    let mut tx = backend.begin().await.unwrap();
    for collection in collections {
        tx.put_collection(collection).await.unwrap();
    }
    tx.commit().await.unwrap();
}

pub fn id(s: &str) -> MigrationId {
    s.parse().unwrap()
}

pub fn tags() -> CollectionSchema {
    CollectionSchema::new("tags00000000001", "tags")
        .field(FieldDefinition::new("label", FieldKind::text()).with_id("tags_label"))
}

pub fn products() -> CollectionSchema {
    CollectionSchema::new("prod0000000001", "products")
        .field(
            FieldDefinition::new("name", FieldKind::text())
                .with_id("prod_name")
                .required(),
        )
        .field(FieldDefinition::new("price", FieldKind::number()).with_id("prod_price"))
}

/// An orders collection whose relation targets products by name.
pub fn orders() -> CollectionSchema {
    CollectionSchema::new("ord00000000001", "orders")
        .field(FieldDefinition::new("product", FieldKind::relation("products")).with_id("ord_product"))
        .field(FieldDefinition::new("quantity", FieldKind::number()).with_id("ord_qty"))
}

/// A reversible migration that creates `collection` and deletes it on revert.
pub fn create_migration(migration_id: &str, collection: CollectionSchema) -> Migration {
    let collection_id = collection.id.clone();
    Migration::new(id(migration_id), move |catalog: &mut Catalog| -> Result<()> {
        catalog.create(collection.clone())?;
        Ok(())
    })
    .with_reverse(move |catalog: &mut Catalog| -> Result<()> {
        catalog.delete(&collection_id)?;
        Ok(())
    })
}

/// A reversible migration that adds a text field to the tags collection.
pub fn add_tag_color(migration_id: &str) -> Migration {
    Migration::new(id(migration_id), |catalog: &mut Catalog| -> Result<()> {
        catalog.update("tags00000000001", |tags| {
            tags.fields
                .push(FieldDefinition::new("color", FieldKind::text()).with_id("tags_color"));
        })?;
        Ok(())
    })
    .with_reverse(|catalog: &mut Catalog| -> Result<()> {
        catalog.update("tags00000000001", |tags| {
            tags.fields.retain(|f| f.name != "color");
        })?;
        Ok(())
    })
}

/// A migration that creates a collection and then fails.
pub fn failing_migration(migration_id: &str) -> Migration {
    Migration::new(id(migration_id), |catalog: &mut Catalog| -> Result<()> {
        catalog.create(CollectionSchema::new("half0000000001", "half_done"))?;
        Err(MigrateError::Action("boom".to_string()))
    })
}

/// A migration without a reverse action.
pub fn irreversible(migration_id: &str) -> Migration {
    Migration::new(id(migration_id), |_catalog: &mut Catalog| -> Result<()> { Ok(()) })
}

/// Returns the collection names in the committed catalog.
pub async fn names<B: Backend>(backend: &B) -> Vec<String> {
    backend
        .collections()
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.name)
        .collect()
}

/// Returns the applied migration ids, ascending.
pub async fn applied<B: Backend>(backend: &B) -> Vec<String> {
    let mut ids: Vec<String> = backend
        .records()
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id.to_string())
        .collect();
    ids.sort();
    ids
}
