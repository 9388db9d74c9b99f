//! Migration documents.
//!
//! Migrations can be written as JSON files named `<id>.json`. Two shapes are
//! understood:
//!
//! - a versioned document with an `up` import step and an optional `down`
//!   step:
//!
//!   ```json
//!   {
//!     "version": 1,
//!     "up": { "collections": [], "deleteMissing": false, "renames": {} },
//!     "down": { "collections": [] }
//!   }
//!   ```
//!
//! - a collections snapshot: a bare array of collections, imported with
//!   `deleteMissing`. Snapshots cannot be reverted.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{MigrateError, Result};
use crate::importer::{ImportCollections, ImportOptions, RenameHints};
use crate::migration::{Migration, MigrationId};
use crate::schema::CollectionSchema;

/// The document version this build reads and writes.
pub const DOCUMENT_VERSION: u32 = 1;

/// Id of the built-in collections snapshot migration.
pub const SNAPSHOT_MIGRATION_ID: &str = "1730835288_collections_snapshot";

const COLLECTIONS_SNAPSHOT: &str =
    include_str!("../migrations/1730835288_collections_snapshot.json");

/// One direction of a versioned document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportStep {
    /// Desired collections.
    pub collections: Vec<CollectionSchema>,
    /// Delete catalog collections absent from `collections`.
    #[serde(default)]
    pub delete_missing: bool,
    /// Field renames, keyed by collection id and old field name.
    #[serde(default, skip_serializing_if = "RenameHints::is_empty")]
    pub renames: RenameHints,
    /// Treat a field id that reappears under a new name as a rename.
    #[serde(default)]
    pub match_field_ids: bool,
}

impl ImportStep {
    /// Returns the importer options for this step.
    #[must_use]
    pub fn options(&self) -> ImportOptions {
        ImportOptions::new()
            .delete_missing(self.delete_missing)
            .with_renames(self.renames.clone())
            .match_field_ids(self.match_field_ids)
    }

    /// Turns the step into an action.
    #[must_use]
    pub fn into_action(self) -> ImportCollections {
        let options = self.options();
        ImportCollections::new(self.collections).with_options(options)
    }
}

/// A versioned migration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationDocument {
    /// Format version.
    pub version: u32,
    /// Forward step.
    pub up: ImportStep,
    /// Reverse step, if the migration can be reverted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub down: Option<ImportStep>,
}

#[derive(Deserialize)]
struct Header {
    version: Option<u32>,
}

impl MigrationDocument {
    /// Parses a document read from `path`.
    pub fn parse(path: &Path, text: &str) -> Result<Self> {
        let header: Header = serde_json::from_str(text).map_err(|e| parse_error(path, &e))?;
        match header.version {
            Some(DOCUMENT_VERSION) => {}
            Some(version) => {
                return Err(MigrateError::UnsupportedVersion {
                    path: path.to_path_buf(),
                    version,
                })
            }
            None => {
                return Err(MigrateError::ParseError {
                    path: path.to_path_buf(),
                    message: "missing \"version\"".to_string(),
                })
            }
        }
        serde_json::from_str(text).map_err(|e| parse_error(path, &e))
    }

    /// Builds the migration with the given id.
    #[must_use]
    pub fn into_migration(self, id: MigrationId) -> Migration {
        let migration = Migration::new(id, self.up.into_action());
        match self.down {
            Some(down) => migration.with_reverse(down.into_action()),
            None => migration,
        }
    }
}

fn parse_error(path: &Path, err: &serde_json::Error) -> MigrateError {
    MigrateError::ParseError {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}

/// Parses a collections snapshot (a bare JSON array of collections).
pub fn parse_snapshot(path: &Path, text: &str) -> Result<Vec<CollectionSchema>> {
    serde_json::from_str(text).map_err(|e| parse_error(path, &e))
}

/// Builds a migration that imports a snapshot, deleting collections the
/// snapshot leaves out.
///
/// The import may delete or overwrite collections whose prior definitions
/// are not kept anywhere, so the migration has no reverse.
pub fn snapshot_migration(id: MigrationId, collections: Vec<CollectionSchema>) -> Migration {
    let forward =
        ImportCollections::new(collections).with_options(ImportOptions::new().delete_missing(true));
    Migration::new(id, forward)
}

/// Returns the collections of the built-in snapshot.
pub fn builtin_snapshot() -> Result<Vec<CollectionSchema>> {
    parse_snapshot(Path::new(SNAPSHOT_MIGRATION_ID), COLLECTIONS_SNAPSHOT)
}

/// Returns the migrations compiled into this crate.
pub fn builtin_migrations() -> Result<Vec<Migration>> {
    let id: MigrationId = SNAPSHOT_MIGRATION_ID.parse()?;
    Ok(vec![snapshot_migration(id, builtin_snapshot()?)])
}

/// Loads one migration file. The file stem is the migration id.
pub fn load_file(path: &Path) -> Result<Migration> {
    let id: MigrationId = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or_default()
        .parse()?;
    let text = fs::read_to_string(path)?;

    if text.trim_start().starts_with('[') {
        debug!(id = %id, "Loading collections snapshot");
        return Ok(snapshot_migration(id, parse_snapshot(path, &text)?));
    }
    Ok(MigrationDocument::parse(path, &text)?.into_migration(id))
}

/// Loads every `*.json` migration in `dir`. A missing directory yields none.
pub fn load_dir(dir: &Path) -> Result<Vec<Migration>> {
    if !dir.exists() {
        debug!(dir = %dir.display(), "Migrations directory does not exist");
        return Ok(Vec::new());
    }

    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    let migrations = paths
        .iter()
        .map(|path| load_file(path))
        .collect::<Result<Vec<_>>>()?;
    info!(dir = %dir.display(), count = migrations.len(), "Loaded migrations");
    Ok(migrations)
}
