//! Example: Code-defined Collection Migrations
//!
//! This example applies the built-in collections snapshot followed by two
//! migrations written in Rust, then reconciles a desired schema against the
//! result and finally reverts as far as it can. The snapshot itself cannot be
//! reverted, so the revert stops there.
//!
//! Run with: cargo run --example custom_migration -p collection-migrate

use collection_migrate::prelude::*;

// =============================================================================
// Migration Definitions
// =============================================================================

/// Adds a reviews collection linked to products and users.
struct AddReviews;

impl CollectionMigration for AddReviews {
    const ID: &'static str = "1731000000_add_reviews";
    const REVERSIBLE: bool = true;

    fn up(catalog: &mut Catalog) -> Result<()> {
        catalog.create(
            CollectionSchema::new("reviews0000001", "reviews")
                .field(FieldDefinition::new("product", FieldKind::relation("products")).required())
                .field(FieldDefinition::new("author", FieldKind::relation("users")))
                .field(FieldDefinition::new("rating", FieldKind::number()).required())
                .field(FieldDefinition::new("body", FieldKind::editor()))
                .index(IndexSchema::new("idx_reviews_product", ["product"])),
        )?;
        Ok(())
    }

    fn down(catalog: &mut Catalog) -> Result<()> {
        catalog.delete("reviews0000001")?;
        Ok(())
    }
}

/// Opens reviews for public reading.
struct PublicReviews;

impl CollectionMigration for PublicReviews {
    const ID: &'static str = "1731000100_public_reviews";
    const REVERSIBLE: bool = true;

    fn up(catalog: &mut Catalog) -> Result<()> {
        catalog.update("reviews0000001", |reviews| {
            reviews.rules.list_rule = Some(String::new());
            reviews.rules.view_rule = Some(String::new());
        })?;
        Ok(())
    }

    fn down(catalog: &mut Catalog) -> Result<()> {
        catalog.update("reviews0000001", |reviews| {
            reviews.rules.list_rule = None;
            reviews.rules.view_rule = None;
        })?;
        Ok(())
    }
}

fn print_catalog(title: &str, collections: &[CollectionSchema]) {
    println!("\n{}:", title);
    for collection in collections {
        let fields: Vec<&str> = collection.field_names().collect();
        println!("  {} [{}] {}", collection.name, collection.kind, fields.join(", "));
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let backend = MemoryBackend::new();

    let mut migrations = builtin_migrations()?;
    migrations.push(AddReviews::to_migration()?);
    migrations.push(PublicReviews::to_migration()?);
    let runner = MigrationRunner::new(backend.clone(), migrations)?;

    println!("=== Applying migrations ===");
    print!("{}", runner.up().await?);
    print_catalog("Catalog", &backend.collections().await?);

    println!("\n=== Reconciling a desired schema ===");
    let mut desired = backend.collections().await?;
    if let Some(reviews) = desired.iter_mut().find(|c| c.name == "reviews") {
        reviews
            .fields
            .push(FieldDefinition::new("verified", FieldKind::boolean()));
    }
    print!("{}", runner.import(&desired, &Importer::new()).await?);

    println!("\n=== Status ===");
    for entry in runner.status().await? {
        println!("  {} {}", entry.state, entry.id);
    }

    println!("\n=== Reverting ===");
    match runner.down(usize::MAX).await {
        Ok(report) => print!("{}", report),
        Err(e) => println!("Stopped: {}", e),
    }
    print_catalog("Catalog", &backend.collections().await?);

    Ok(())
}
