//! Error types for the migration system.

use std::path::PathBuf;
use std::time::Duration;

use crate::migration::MigrationId;

/// A collection schema is malformed.
///
/// Validation runs before any transaction is opened, so these errors never
/// leave partial state behind.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    /// The collection id is empty or contains unsupported characters.
    #[error("Invalid collection id '{0}'")]
    InvalidCollectionId(String),

    /// The collection name is empty or not a valid identifier.
    #[error("Invalid collection name '{0}'")]
    InvalidCollectionName(String),

    /// A field name is empty or not a valid identifier.
    #[error("Collection '{collection}' has an invalid field name '{field}'")]
    InvalidFieldName {
        /// Collection name.
        collection: String,
        /// Offending field name.
        field: String,
    },

    /// A field uses a name reserved for system columns.
    #[error("Field name '{field}' is reserved in collection '{collection}'")]
    ReservedFieldName {
        /// Collection name.
        collection: String,
        /// Offending field name.
        field: String,
    },

    /// Two fields share a name (case-insensitive).
    #[error("Collection '{collection}' declares field '{field}' more than once")]
    DuplicateField {
        /// Collection name.
        collection: String,
        /// Duplicated field name.
        field: String,
    },

    /// Two fields share a stable field id.
    #[error("Collection '{collection}' declares field id '{id}' more than once")]
    DuplicateFieldId {
        /// Collection name.
        collection: String,
        /// Duplicated field id.
        id: String,
    },

    /// Field options are not valid for the declared type.
    #[error("Field '{collection}.{field}' has invalid {kind} options: {message}")]
    InvalidOptions {
        /// Collection name.
        collection: String,
        /// Field name.
        field: String,
        /// Declared field type.
        kind: &'static str,
        /// What is wrong.
        message: String,
    },

    /// A relation field does not carry a well-formed collection reference.
    #[error("Relation '{collection}.{field}' has a malformed target '{target}'")]
    MalformedRelationTarget {
        /// Collection name.
        collection: String,
        /// Field name.
        field: String,
        /// The target as written.
        target: String,
    },

    /// An index definition is invalid.
    #[error("Index '{index}' on collection '{collection}' is invalid: {message}")]
    InvalidIndex {
        /// Collection name.
        collection: String,
        /// Index name.
        index: String,
        /// What is wrong.
        message: String,
    },

    /// Kind-specific collection options are invalid.
    #[error("Collection '{collection}' has invalid options: {message}")]
    InvalidCollectionOptions {
        /// Collection name.
        collection: String,
        /// What is wrong.
        message: String,
    },

    /// The serialized field type is unknown.
    #[error("Unknown field type '{0}'")]
    UnknownFieldType(String),

    /// Options could not be decoded for the declared type.
    #[error("Malformed options for '{name}': {message}")]
    MalformedOptions {
        /// Field or collection name.
        name: String,
        /// Decoder message.
        message: String,
    },

    /// Multiple errors occurred.
    #[error("Multiple validation errors:\n{}", .0.iter().map(|e| format!("  - {}", e)).collect::<Vec<_>>().join("\n"))]
    Multiple(Vec<ValidationError>),
}

impl ValidationError {
    /// Collapses a list of problems into a single error, if there are any.
    pub(crate) fn from_list(
        mut errors: Vec<ValidationError>,
    ) -> std::result::Result<(), ValidationError> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Multiple(errors)),
        }
    }
}

/// Reconciling desired collections against the catalog failed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ImportError {
    /// A desired collection failed validation.
    #[error("Collection '{collection}' is invalid: {source}")]
    Invalid {
        /// Collection name.
        collection: String,
        /// Underlying validation error.
        #[source]
        source: ValidationError,
    },

    /// The desired set lists the same collection id twice.
    #[error("Collection id '{0}' appears more than once in the import")]
    DuplicateCollection(String),

    /// Two collections would end up with the same name.
    #[error("Collection name '{0}' is already in use")]
    DuplicateName(String),

    /// A collection with this id already exists in the catalog.
    #[error("Collection '{0}' already exists")]
    CollectionExists(String),

    /// No collection with this id exists in the catalog.
    #[error("Collection '{0}' does not exist")]
    CollectionNotFound(String),

    /// A relation target resolves to no collection.
    #[error("Relation '{collection}.{field}' targets unknown collection '{target}'")]
    UnresolvedRelation {
        /// Collection name.
        collection: String,
        /// Field name.
        field: String,
        /// Unresolved target reference.
        target: String,
    },

    /// A deleted collection is still the target of a surviving relation.
    #[error("Collection '{collection}' is still referenced by '{referenced_by}.{field}'")]
    ReferencedCollection {
        /// Collection being deleted.
        collection: String,
        /// Collection holding the relation.
        referenced_by: String,
        /// Relation field name.
        field: String,
    },

    /// System collections cannot be deleted.
    #[error("System collection '{0}' cannot be deleted")]
    SystemCollection(String),

    /// A collection's kind cannot change once created.
    #[error("Collection '{collection}' cannot change type from {from} to {to}")]
    KindChange {
        /// Collection name.
        collection: String,
        /// Current kind.
        from: String,
        /// Requested kind.
        to: String,
    },
}

/// Storage failure in a backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored definition could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row is not in the expected shape.
    #[error("Corrupt store data: {0}")]
    Corrupt(String),
}

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// A migration identifier could not be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid migration id '{0}': expected '<unix-seconds>_<name>'")]
pub struct ParseMigrationIdError(pub String);

/// Errors that can occur during migration operations.
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// A schema is malformed.
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// A migration has no reverse action.
    #[error("Migration '{0}' is not reversible")]
    Irreversible(MigrationId),

    /// Reconciliation failed.
    #[error("Import error: {0}")]
    Import(#[from] ImportError),

    /// The ledger or catalog store failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A migration failed and was rolled back.
    #[error("Migration '{id}' failed: {source}")]
    MigrationFailed {
        /// The migration that failed.
        id: MigrationId,
        /// Why it failed.
        #[source]
        source: Box<MigrateError>,
    },

    /// Two migrations share an id.
    #[error("Migration '{0}' is registered more than once")]
    DuplicateMigration(MigrationId),

    /// The ledger lists a migration that is not registered.
    #[error("Migration '{0}' is applied but not registered")]
    UnknownMigration(MigrationId),

    /// The store lock could not be acquired in time.
    #[error("Timed out after {0:?} waiting for the migration lock")]
    LockTimeout(Duration),

    /// A custom action reported a failure.
    #[error("Action failed: {0}")]
    Action(String),

    /// A migration id is malformed.
    #[error(transparent)]
    InvalidMigrationId(#[from] ParseMigrationIdError),

    /// A migration document declares a version this build cannot read.
    #[error("Migration document '{path}' has unsupported version {version}")]
    UnsupportedVersion {
        /// Path to the document.
        path: PathBuf,
        /// Declared version.
        version: u32,
    },

    /// Failed to parse a migration document.
    #[error("Failed to parse migration file '{path}': {message}")]
    ParseError {
        /// Path to the migration file.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    /// IO error (reading migration files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MigrateError {
    /// Returns the innermost error, unwrapping `MigrationFailed` layers.
    #[must_use]
    pub fn root_cause(&self) -> &MigrateError {
        match self {
            Self::MigrationFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

/// Result type for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;
