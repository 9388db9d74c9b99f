//! Migration definitions.
//!
//! A [`Migration`] pairs a [`MigrationId`] with a forward [`Action`] and an
//! optional reverse action. Actions are synchronous: they receive the
//! [`Catalog`] working copy of the transaction they run in and either edit it
//! or fail. The runner takes care of loading, flushing and ledger bookkeeping.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::catalog::Catalog;
use crate::error::{ParseMigrationIdError, Result};

/// Identifies a migration as `<unix-seconds>_<name>`.
///
/// Ids order by timestamp, then by name, which is also the order in which
/// migrations are applied.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MigrationId {
    timestamp: i64,
    name: String,
}

impl MigrationId {
    /// Creates an id from its parts.
    pub fn new(timestamp: i64, name: impl Into<String>) -> std::result::Result<Self, ParseMigrationIdError> {
        let name = name.into();
        if timestamp < 0 || !is_valid_name(&name) {
            return Err(ParseMigrationIdError(format!("{}_{}", timestamp, name)));
        }
        Ok(Self { timestamp, name })
    }

    /// Creates an id stamped with the current time.
    pub fn now(name: impl Into<String>) -> std::result::Result<Self, ParseMigrationIdError> {
        Self::new(chrono::Utc::now().timestamp(), name)
    }

    /// Returns the timestamp part.
    #[must_use]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Returns the name part.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.timestamp, self.name)
    }
}

impl FromStr for MigrationId {
    type Err = ParseMigrationIdError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let err = || ParseMigrationIdError(s.to_string());
        let (ts, name) = s.split_once('_').ok_or_else(err)?;
        if ts.is_empty() || !ts.bytes().all(|b| b.is_ascii_digit()) {
            return Err(err());
        }
        let timestamp = ts.parse::<i64>().map_err(|_| err())?;
        Self::new(timestamp, name).map_err(|_| err())
    }
}

impl TryFrom<String> for MigrationId {
    type Error = ParseMigrationIdError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MigrationId> for String {
    fn from(id: MigrationId) -> Self {
        id.to_string()
    }
}

/// A unit of work that edits the catalog.
pub trait Action: Send + Sync {
    /// Applies the action to `catalog`.
    fn apply(&self, catalog: &mut Catalog) -> Result<()>;

    /// Short description for logs and reports.
    fn describe(&self) -> String {
        "custom action".to_string()
    }
}

impl<F> Action for F
where
    F: Fn(&mut Catalog) -> Result<()> + Send + Sync,
{
    fn apply(&self, catalog: &mut Catalog) -> Result<()> {
        self(catalog)
    }
}

/// A migration ready to be run.
#[derive(Clone)]
pub struct Migration {
    id: MigrationId,
    forward: Arc<dyn Action>,
    reverse: Option<Arc<dyn Action>>,
}

impl Migration {
    /// Creates an irreversible migration.
    #[must_use]
    pub fn new(id: MigrationId, forward: impl Action + 'static) -> Self {
        Self {
            id,
            forward: Arc::new(forward),
            reverse: None,
        }
    }

    /// Sets the reverse action.
    #[must_use]
    pub fn with_reverse(mut self, reverse: impl Action + 'static) -> Self {
        self.reverse = Some(Arc::new(reverse));
        self
    }

    /// Returns the migration id.
    #[must_use]
    pub fn id(&self) -> &MigrationId {
        &self.id
    }

    /// Returns the forward action.
    #[must_use]
    pub fn forward(&self) -> &dyn Action {
        self.forward.as_ref()
    }

    /// Returns the reverse action, if any.
    #[must_use]
    pub fn reverse(&self) -> Option<&dyn Action> {
        self.reverse.as_deref()
    }

    /// Returns whether this migration can be reverted.
    #[must_use]
    pub fn is_reversible(&self) -> bool {
        self.reverse.is_some()
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("id", &self.id)
            .field("forward", &self.forward.describe())
            .field("reverse", &self.reverse.as_ref().map(|r| r.describe()))
            .finish()
    }
}

/// Removes collections by id. Ids that are already gone are skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropCollections {
    ids: Vec<String>,
}

impl DropCollections {
    /// Creates an action dropping `ids`, in order.
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }
}

impl Action for DropCollections {
    fn apply(&self, catalog: &mut Catalog) -> Result<()> {
        for id in &self.ids {
            if catalog.get(id).is_none() {
                debug!(collection = %id, "Collection already absent");
                continue;
            }
            catalog.delete(id)?;
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("drop {} collection(s)", self.ids.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ImportError, MigrateError};
    use crate::schema::CollectionSchema;

    #[test]
    fn test_parse_migration_id() {
        let id: MigrationId = "1730835288_collections_snapshot".parse().unwrap();
        assert_eq!(id.timestamp(), 1_730_835_288);
        assert_eq!(id.name(), "collections_snapshot");
        assert_eq!(id.to_string(), "1730835288_collections_snapshot");
    }

    #[test]
    fn test_parse_invalid_ids() {
        for bad in ["", "snapshot", "_name", "12_", "abc_name", "12_has space", "-1_x"] {
            assert!(bad.parse::<MigrationId>().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn test_ids_order_by_timestamp_then_name() {
        let mut ids: Vec<MigrationId> = ["20_a", "3_z", "20_0", "100_a"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        ids.sort();
        let ordered: Vec<String> = ids.iter().map(ToString::to_string).collect();
        assert_eq!(ordered, vec!["3_z", "20_0", "20_a", "100_a"]);
    }

    #[test]
    fn test_id_serde() {
        let id = MigrationId::new(5, "init").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"5_init\"");
        let back: MigrationId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<MigrationId>("\"nope\"").is_err());
    }

    #[test]
    fn test_closure_action() {
        let migration = Migration::new(MigrationId::new(1, "add").unwrap(), |c: &mut Catalog| -> Result<()> {
            c.create(CollectionSchema::new("posts", "posts"))?;
            Ok(())
        });
        assert!(!migration.is_reversible());

        let mut catalog = Catalog::default();
        migration.forward().apply(&mut catalog).unwrap();
        assert!(catalog.get("posts").is_some());
    }

    #[test]
    fn test_drop_collections() {
        let mut catalog = Catalog::new(vec![
            CollectionSchema::new("a", "a"),
            CollectionSchema::new("b", "b").system(),
        ]);

        DropCollections::new(["a", "missing"]).apply(&mut catalog).unwrap();
        assert!(catalog.get("a").is_none());

        let result = DropCollections::new(["b"]).apply(&mut catalog);
        assert!(matches!(
            result,
            Err(MigrateError::Import(ImportError::SystemCollection(_)))
        ));
    }
}
