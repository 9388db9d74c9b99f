//! Collection schema migrations for backend-as-a-service stores.
//!
//! `collection-migrate` manages a catalog of typed collection schemas (base,
//! auth and view collections with fields, access rules, indexes and options)
//! and evolves it through ordered, transactional migrations:
//! - Schemas are validated before any store is touched
//! - Each migration commits its catalog changes together with its ledger entry
//! - A desired set of collections can be reconciled against the live catalog
//!
//! # Architecture
//!
//! - **Schema** - `CollectionSchema`, `FieldDefinition` and `validate()`
//! - **Store** - the `Backend` / `Transaction` traits with memory and SQLite backends
//! - **Ledger** - which migrations have been applied
//! - **Catalog** - the working copy of collections a migration edits
//! - **Importer** - reconciles desired collections into a `ChangeSet`
//! - **Runner** - applies and reverts migrations under the store lock
//! - **Document** - JSON migration files and the built-in collections snapshot
//!
//! # Example
//!
//! ```rust,ignore
//! use collection_migrate::prelude::*;
//!
//! pub struct AddPosts;
//!
//! impl CollectionMigration for AddPosts {
//!     const ID: &'static str = "1731000000_add_posts";
//!     const REVERSIBLE: bool = true;
//!
//!     fn up(catalog: &mut Catalog) -> Result<()> {
//!         catalog.create(
//!             CollectionSchema::new("posts0000000001", "posts")
//!                 .field(FieldDefinition::new("title", FieldKind::text()).required())
//!                 .field(FieldDefinition::new("author", FieldKind::relation("users"))),
//!         )?;
//!         Ok(())
//!     }
//!
//!     fn down(catalog: &mut Catalog) -> Result<()> {
//!         catalog.delete("posts0000000001")?;
//!         Ok(())
//!     }
//! }
//!
//! let backend = SqliteBackend::connect("sqlite:pb_data/data.db").await?;
//! backend.ensure_tables().await?;
//!
//! let mut migrations = builtin_migrations()?;
//! migrations.push(AddPosts::to_migration()?);
//! let report = MigrationRunner::new(backend, migrations)?.up().await?;
//! print!("{report}");
//! ```
//!
//! # CLI Usage
//!
//! ```bash
//! # Create the store tables
//! collection-migrate init
//!
//! # Apply pending migrations
//! collection-migrate up
//!
//! # Show migration status
//! collection-migrate status
//!
//! # Revert the last migration
//! collection-migrate down
//!
//! # Reconcile a collections file against the live catalog
//! collection-migrate import pb_schema.json --delete-missing
//! ```

pub mod catalog;
pub mod document;
pub mod error;
pub mod importer;
pub mod ledger;
pub mod migration;
pub mod runner;
pub mod schema;
pub mod store;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::catalog::Catalog;
    pub use crate::document::{builtin_migrations, load_dir, MigrationDocument, SNAPSHOT_MIGRATION_ID};
    pub use crate::error::{ImportError, MigrateError, Result, StoreError, ValidationError};
    pub use crate::importer::{
        reconcile, ChangeSet, ImportCollections, ImportOptions, Importer, RenameHints,
    };
    pub use crate::ledger::{MigrationLedger, MigrationRecord};
    pub use crate::migration::{Action, DropCollections, Migration, MigrationId};
    pub use crate::runner::{MigrationRunner, MigrationState, MigrationStatus, RunReport};
    pub use crate::schema::{
        validate, AccessRules, AuthOptions, CollectionKind, CollectionSchema, FieldDefinition,
        FieldKind, IndexSchema,
    };
    pub use crate::store::{Backend, MemoryBackend, SqliteBackend, Transaction};
    pub use crate::CollectionMigration;
}

use catalog::Catalog;
use error::Result;
use migration::Migration;

/// Trait for migrations defined in Rust code.
///
/// This trait is implemented by migration structs to define catalog changes.
pub trait CollectionMigration {
    /// Migration id (e.g., "1731000000_add_posts").
    const ID: &'static str;

    /// Whether [`down`](Self::down) undoes [`up`](Self::up).
    const REVERSIBLE: bool = false;

    /// Applies the migration.
    fn up(catalog: &mut Catalog) -> Result<()>;

    /// Reverts the migration. Only used when `REVERSIBLE` is set.
    fn down(_catalog: &mut Catalog) -> Result<()> {
        Ok(())
    }

    /// Converts to a runnable migration.
    fn to_migration() -> Result<Migration> {
        let up: fn(&mut Catalog) -> Result<()> = Self::up;
        let migration = Migration::new(Self::ID.parse()?, up);
        if Self::REVERSIBLE {
            let down: fn(&mut Catalog) -> Result<()> = Self::down;
            Ok(migration.with_reverse(down))
        } else {
            Ok(migration)
        }
    }
}
