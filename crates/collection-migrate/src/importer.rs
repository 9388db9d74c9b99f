//! Collection importer.
//!
//! Reconciles a desired set of collection schemas against the live catalog
//! and produces a [`ChangeSet`] of creates, updates and deletes. Collections
//! are matched by their stable id, never by name.
//!
//! Reconciliation runs in two passes. The structural pass stages every
//! desired collection (merging auth options and carrying field ids over).
//! The binding pass then resolves relation targets against the final catalog,
//! so a relation may point at a collection created in the same import.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::error::{ImportError, Result};
use crate::migration::Action;
use crate::schema::{validate, CollectionOptions, CollectionSchema, FieldDefinition, FieldKind};

/// Explicit field renames, keyed by collection id and then old field name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RenameHints(BTreeMap<String, BTreeMap<String, String>>);

impl RenameHints {
    /// Creates an empty set of hints.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares that field `from` of `collection_id` is now called `to`.
    #[must_use]
    pub fn rename(
        mut self,
        collection_id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Self {
        self.0
            .entry(collection_id.into())
            .or_default()
            .insert(from.into(), to.into());
        self
    }

    /// Returns whether no hints are declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.values().all(BTreeMap::is_empty)
    }

    /// Returns the old name of a field now called `new_name`.
    fn old_name(&self, collection_id: &str, new_name: &str) -> Option<&str> {
        self.0.get(collection_id)?.iter().find_map(|(from, to)| {
            to.eq_ignore_ascii_case(new_name).then_some(from.as_str())
        })
    }
}

/// Options for the importer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportOptions {
    /// Delete catalog collections that are absent from the desired set.
    pub delete_missing: bool,
    /// Explicit field renames.
    pub rename_hints: RenameHints,
    /// Treat a field id that reappears under a new name as a rename.
    pub match_field_ids: bool,
}

impl ImportOptions {
    /// Creates default options: nothing is deleted, renames only by hint.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables deleting collections absent from the desired set.
    #[must_use]
    pub fn delete_missing(mut self, enabled: bool) -> Self {
        self.delete_missing = enabled;
        self
    }

    /// Sets the rename hints.
    #[must_use]
    pub fn with_renames(mut self, hints: RenameHints) -> Self {
        self.rename_hints = hints;
        self
    }

    /// Enables rename detection by stable field id.
    #[must_use]
    pub fn match_field_ids(mut self, enabled: bool) -> Self {
        self.match_field_ids = enabled;
        self
    }
}

/// A field whose definition changed.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    /// Definition in the catalog.
    pub before: FieldDefinition,
    /// Desired definition.
    pub after: FieldDefinition,
}

impl FieldChange {
    /// Lists the attributes that differ, ignoring the name.
    #[must_use]
    pub fn changed_attributes(&self) -> Vec<&'static str> {
        let (a, b) = (&self.before, &self.after);
        let mut changed = Vec::new();
        if a.kind.type_name() != b.kind.type_name() {
            changed.push("type");
        } else if a.kind != b.kind {
            changed.push("options");
        }
        if a.required != b.required {
            changed.push("required");
        }
        if a.unique != b.unique {
            changed.push("unique");
        }
        if a.presentable != b.presentable {
            changed.push("presentable");
        }
        if a.system != b.system {
            changed.push("system");
        }
        if a.id != b.id {
            changed.push("id");
        }
        changed
    }
}

/// Field-level differences of an updated collection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldDiff {
    /// Fields only in the desired definition.
    pub added: Vec<FieldDefinition>,
    /// Fields only in the catalog.
    pub removed: Vec<FieldDefinition>,
    /// Fields present in both whose definition changed.
    pub changed: Vec<FieldChange>,
    /// Renamed fields as `(old, new)`.
    pub renamed: Vec<(String, String)>,
}

impl FieldDiff {
    /// Returns whether no field differs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.removed.is_empty()
            && self.changed.is_empty()
            && self.renamed.is_empty()
    }
}

/// An existing collection that will be replaced.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionUpdate {
    /// Definition in the catalog.
    pub previous: CollectionSchema,
    /// Definition after the import.
    pub next: CollectionSchema,
    /// Field differences.
    pub fields: FieldDiff,
    /// Collection-level properties that changed.
    pub changed_properties: Vec<&'static str>,
}

/// Number of changes of each kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChangeCounts {
    /// Collections to create.
    pub created: usize,
    /// Collections to update.
    pub updated: usize,
    /// Collections to delete.
    pub deleted: usize,
}

/// The result of a reconciliation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    /// Collections to create, in desired order.
    pub created: Vec<CollectionSchema>,
    /// Collections to update, in desired order.
    pub updated: Vec<CollectionUpdate>,
    /// Collections to delete, in catalog order.
    pub deleted: Vec<CollectionSchema>,
}

impl ChangeSet {
    /// Returns whether the import changes nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Returns the number of changes of each kind.
    #[must_use]
    pub fn counts(&self) -> ChangeCounts {
        ChangeCounts {
            created: self.created.len(),
            updated: self.updated.len(),
            deleted: self.deleted.len(),
        }
    }

    /// Applies the changes to `catalog`.
    ///
    /// Changes are staged on a copy; `catalog` is only replaced once every
    /// change succeeded, so a failure leaves it untouched.
    pub fn apply(&self, catalog: &mut Catalog) -> std::result::Result<(), ImportError> {
        let mut staged = catalog.clone();

        for collection in &self.deleted {
            debug!(collection = %collection.name, "Deleting collection");
            staged.delete(&collection.id)?;
        }
        for collection in &self.created {
            if staged.get(&collection.id).is_some() {
                return Err(ImportError::CollectionExists(collection.id.clone()));
            }
        }
        for update in &self.updated {
            if staged.get(&update.next.id).is_none() {
                return Err(ImportError::CollectionNotFound(update.next.id.clone()));
            }
        }

        let writes = self
            .created
            .iter()
            .cloned()
            .chain(self.updated.iter().map(|u| u.next.clone()));
        staged.save_all(writes)?;
        staged.bind_relations()?;

        *catalog = staged;
        Ok(())
    }
}

impl fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return writeln!(f, "No changes");
        }
        for c in &self.created {
            writeln!(f, "+ create {} ({}, {} fields)", c.name, c.kind, c.fields.len())?;
        }
        for u in &self.updated {
            writeln!(f, "~ update {}", u.next.name)?;
            for (old, new) in &u.fields.renamed {
                writeln!(f, "    > rename field {} -> {}", old, new)?;
            }
            for field in &u.fields.added {
                writeln!(f, "    + field {} ({})", field.name, field.kind.type_name())?;
            }
            for field in &u.fields.removed {
                writeln!(f, "    - field {}", field.name)?;
            }
            for change in &u.fields.changed {
                writeln!(
                    f,
                    "    ~ field {} ({}): {}",
                    change.after.name,
                    change.after.kind.type_name(),
                    change.changed_attributes().join(", ")
                )?;
            }
            if !u.changed_properties.is_empty() {
                writeln!(f, "    * {}", u.changed_properties.join(", "))?;
            }
        }
        for c in &self.deleted {
            writeln!(f, "- delete {}", c.name)?;
        }
        Ok(())
    }
}

/// A desired collection after the structural pass.
struct Staged<'a> {
    previous: Option<&'a CollectionSchema>,
    next: CollectionSchema,
}

/// Reconciles desired collections against a catalog.
#[derive(Debug, Clone, Default)]
pub struct Importer {
    options: ImportOptions,
}

impl Importer {
    /// Creates an importer with default options.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an importer with custom options.
    #[must_use]
    pub fn with_options(options: ImportOptions) -> Self {
        Self { options }
    }

    /// Returns the options.
    #[must_use]
    pub fn options(&self) -> &ImportOptions {
        &self.options
    }

    /// Computes the changes that turn `existing` into `desired`.
    pub fn reconcile(
        &self,
        desired: &[CollectionSchema],
        existing: &[CollectionSchema],
    ) -> std::result::Result<ChangeSet, ImportError> {
        check_desired(desired)?;

        let by_id: BTreeMap<&str, &CollectionSchema> =
            existing.iter().map(|c| (c.id.as_str(), c)).collect();

        let mut staged = Vec::with_capacity(desired.len());
        for collection in desired {
            staged.push(stage(collection, by_id.get(collection.id.as_str()).copied())?);
        }

        let desired_ids: BTreeSet<&str> = desired.iter().map(|c| c.id.as_str()).collect();
        let mut deleted = Vec::new();
        if self.options.delete_missing {
            for collection in existing.iter().filter(|c| !desired_ids.contains(c.id.as_str())) {
                if collection.system {
                    return Err(ImportError::SystemCollection(collection.name.clone()));
                }
                deleted.push(collection.clone());
            }
        }

        let survivors: Vec<&CollectionSchema> = existing
            .iter()
            .filter(|c| !desired_ids.contains(c.id.as_str()))
            .filter(|c| !deleted.iter().any(|d| d.id == c.id))
            .collect();
        bind(&mut staged, &survivors, &deleted)?;

        let mut changes = ChangeSet {
            deleted,
            ..ChangeSet::default()
        };
        for Staged { previous, mut next } in staged {
            match previous {
                None => changes.created.push(next),
                Some(previous) => {
                    let fields = self.diff_fields(&previous.id, &previous.fields, &mut next.fields);
                    if *previous == next {
                        continue;
                    }
                    let changed_properties = changed_properties(previous, &next, &fields);
                    changes.updated.push(CollectionUpdate {
                        previous: previous.clone(),
                        next,
                        fields,
                        changed_properties,
                    });
                }
            }
        }

        debug!(
            created = changes.created.len(),
            updated = changes.updated.len(),
            deleted = changes.deleted.len(),
            "Reconciled collections"
        );
        Ok(changes)
    }

    /// Pairs desired fields with catalog fields and records the differences.
    ///
    /// Desired fields without an id inherit the id of their counterpart.
    fn diff_fields(
        &self,
        collection_id: &str,
        previous: &[FieldDefinition],
        next: &mut [FieldDefinition],
    ) -> FieldDiff {
        let mut claimed = vec![false; previous.len()];
        let mut counterpart: Vec<Option<usize>> = vec![None; next.len()];

        for (ni, field) in next.iter().enumerate() {
            let Some(old) = self.options.rename_hints.old_name(collection_id, &field.name) else {
                continue;
            };
            if next.iter().any(|f| f.name.eq_ignore_ascii_case(old)) {
                debug!(collection = %collection_id, from = %old, "Ignoring rename of a field that still exists");
                continue;
            }
            if let Some(pi) = unclaimed(previous, &claimed, |p| p.name.eq_ignore_ascii_case(old)) {
                claimed[pi] = true;
                counterpart[ni] = Some(pi);
            }
        }

        if self.options.match_field_ids {
            for (ni, field) in next.iter().enumerate() {
                let Some(id) = field.id.as_deref() else {
                    continue;
                };
                if counterpart[ni].is_some() {
                    continue;
                }
                if let Some(pi) = unclaimed(previous, &claimed, |p| p.id.as_deref() == Some(id)) {
                    claimed[pi] = true;
                    counterpart[ni] = Some(pi);
                }
            }
        }

        for (ni, field) in next.iter().enumerate() {
            if counterpart[ni].is_some() {
                continue;
            }
            if let Some(pi) = unclaimed(previous, &claimed, |p| p.name.eq_ignore_ascii_case(&field.name)) {
                claimed[pi] = true;
                counterpart[ni] = Some(pi);
            }
        }

        let mut diff = FieldDiff::default();
        for (ni, matched) in counterpart.iter().enumerate() {
            let Some(pi) = *matched else {
                diff.added.push(next[ni].clone());
                continue;
            };
            let before = &previous[pi];
            let after = &mut next[ni];
            if after.id.is_none() {
                after.id.clone_from(&before.id);
            }
            if before.name != after.name {
                diff.renamed.push((before.name.clone(), after.name.clone()));
            }

            let mut comparable = before.clone();
            comparable.name.clone_from(&after.name);
            if !comparable.same_definition(after) || comparable.id != after.id {
                diff.changed.push(FieldChange {
                    before: before.clone(),
                    after: after.clone(),
                });
            }
        }

        diff.removed = previous
            .iter()
            .zip(&claimed)
            .filter(|(_, claimed)| !**claimed)
            .map(|(field, _)| field.clone())
            .collect();

        diff
    }
}

/// Reconciles with default rename policy.
pub fn reconcile(
    desired: &[CollectionSchema],
    existing: &[CollectionSchema],
    delete_missing: bool,
) -> std::result::Result<ChangeSet, ImportError> {
    Importer::with_options(ImportOptions::new().delete_missing(delete_missing))
        .reconcile(desired, existing)
}

fn unclaimed<F>(fields: &[FieldDefinition], claimed: &[bool], pred: F) -> Option<usize>
where
    F: Fn(&FieldDefinition) -> bool,
{
    fields
        .iter()
        .enumerate()
        .position(|(i, f)| !claimed[i] && pred(f))
}

fn check_desired(desired: &[CollectionSchema]) -> std::result::Result<(), ImportError> {
    let mut ids = HashSet::new();
    let mut names = HashSet::new();
    for collection in desired {
        validate(collection).map_err(|source| ImportError::Invalid {
            collection: collection.name.clone(),
            source,
        })?;
        if !ids.insert(collection.id.as_str()) {
            return Err(ImportError::DuplicateCollection(collection.id.clone()));
        }
        if !names.insert(collection.name.to_ascii_lowercase()) {
            return Err(ImportError::DuplicateName(collection.name.clone()));
        }
    }
    Ok(())
}

/// Prepares one desired collection against its catalog counterpart.
fn stage<'a>(
    desired: &CollectionSchema,
    previous: Option<&'a CollectionSchema>,
) -> std::result::Result<Staged<'a>, ImportError> {
    let mut next = desired.clone();
    if let Some(previous) = previous {
        if previous.kind != next.kind {
            return Err(ImportError::KindChange {
                collection: previous.name.clone(),
                from: previous.kind.to_string(),
                to: next.kind.to_string(),
            });
        }
        if let (CollectionOptions::Auth(wanted), Some(current)) = (&next.options, previous.auth_settings()) {
            next.options = CollectionOptions::Auth(wanted.merged_over(current));
        }
    }
    Ok(Staged { previous, next })
}

/// Resolves relation targets of staged collections to stable ids.
fn bind(
    staged: &mut [Staged<'_>],
    survivors: &[&CollectionSchema],
    deleted: &[CollectionSchema],
) -> std::result::Result<(), ImportError> {
    let directory: Vec<(String, String)> = survivors
        .iter()
        .map(|c| (c.id.clone(), c.name.clone()))
        .chain(staged.iter().map(|s| (s.next.id.clone(), s.next.name.clone())))
        .collect();

    let mut seen = HashSet::new();
    for (_, name) in &directory {
        if !seen.insert(name.to_ascii_lowercase()) {
            return Err(ImportError::DuplicateName(name.clone()));
        }
    }

    let resolve = |target: &str| -> Option<String> {
        directory
            .iter()
            .find(|(id, _)| id == target)
            .or_else(|| directory.iter().find(|(_, name)| name.eq_ignore_ascii_case(target)))
            .map(|(id, _)| id.clone())
    };

    for s in staged.iter_mut() {
        let owner = s.next.name.clone();
        for field in &mut s.next.fields {
            if let FieldKind::Relation(options) = &mut field.kind {
                match resolve(&options.collection_id) {
                    Some(id) => options.collection_id = id,
                    None => {
                        return Err(unresolved(&owner, &field.name, &options.collection_id, deleted));
                    }
                }
            }
        }
    }

    for collection in survivors {
        for (field, target) in collection.relations() {
            if resolve(target).is_none() {
                return Err(unresolved(&collection.name, &field.name, target, deleted));
            }
        }
    }
    Ok(())
}

fn unresolved(owner: &str, field: &str, target: &str, deleted: &[CollectionSchema]) -> ImportError {
    let gone = deleted
        .iter()
        .find(|c| c.id == target || c.name.eq_ignore_ascii_case(target));
    match gone {
        Some(collection) => ImportError::ReferencedCollection {
            collection: collection.name.clone(),
            referenced_by: owner.to_string(),
            field: field.to_string(),
        },
        None => ImportError::UnresolvedRelation {
            collection: owner.to_string(),
            field: field.to_string(),
            target: target.to_string(),
        },
    }
}

fn changed_properties(
    previous: &CollectionSchema,
    next: &CollectionSchema,
    fields: &FieldDiff,
) -> Vec<&'static str> {
    let mut changed = Vec::new();
    if previous.name != next.name {
        changed.push("name");
    }
    if previous.system != next.system {
        changed.push("system");
    }
    let (a, b) = (&previous.rules, &next.rules);
    for (label, before, after) in [
        ("listRule", &a.list_rule, &b.list_rule),
        ("viewRule", &a.view_rule, &b.view_rule),
        ("createRule", &a.create_rule, &b.create_rule),
        ("updateRule", &a.update_rule, &b.update_rule),
        ("deleteRule", &a.delete_rule, &b.delete_rule),
    ] {
        if before != after {
            changed.push(label);
        }
    }
    if previous.indexes != next.indexes {
        changed.push("indexes");
    }
    if previous.options != next.options {
        changed.push("options");
    }
    if fields.is_empty() && previous.fields != next.fields {
        changed.push("fieldOrder");
    }
    changed
}

/// Imports a fixed set of collections when run.
#[derive(Debug, Clone)]
pub struct ImportCollections {
    collections: Vec<CollectionSchema>,
    importer: Importer,
}

impl ImportCollections {
    /// Creates an import that keeps collections absent from `collections`.
    #[must_use]
    pub fn new(collections: Vec<CollectionSchema>) -> Self {
        Self {
            collections,
            importer: Importer::new(),
        }
    }

    /// Sets the importer options.
    #[must_use]
    pub fn with_options(mut self, options: ImportOptions) -> Self {
        self.importer = Importer::with_options(options);
        self
    }

    /// Returns the desired collections.
    #[must_use]
    pub fn collections(&self) -> &[CollectionSchema] {
        &self.collections
    }

    /// Returns the ids of the desired collections.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.collections.iter().map(|c| c.id.clone()).collect()
    }
}

impl Action for ImportCollections {
    fn apply(&self, catalog: &mut Catalog) -> Result<()> {
        let changes = self.importer.reconcile(&self.collections, catalog.collections())?;
        let counts = changes.counts();
        info!(
            created = counts.created,
            updated = counts.updated,
            deleted = counts.deleted,
            "Importing collections"
        );
        changes.apply(catalog)?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("import {} collection(s)", self.collections.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AccessRules, AuthOptions, CollectionKind};

    fn products() -> CollectionSchema {
        CollectionSchema::new("p1", "products")
            .field(FieldDefinition::new("title", FieldKind::text()).with_id("f_title").required())
            .field(FieldDefinition::new("price", FieldKind::number()).with_id("f_price"))
    }

    fn quotes(target: &str) -> CollectionSchema {
        CollectionSchema::new("q1", "quotes")
            .field(FieldDefinition::new("product", FieldKind::relation(target)).with_id("f_product"))
    }

    fn names(collections: &[CollectionSchema]) -> Vec<&str> {
        collections.iter().map(|c| c.name.as_str()).collect()
    }

    #[test]
    fn test_creates_into_empty_catalog() {
        let changes = reconcile(&[products(), quotes("p1")], &[], false).unwrap();
        assert_eq!(names(&changes.created), vec!["products", "quotes"]);
        assert!(changes.updated.is_empty());
        assert!(changes.deleted.is_empty());
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        let mut catalog = Catalog::default();
        let desired = vec![products(), quotes("products")];
        reconcile(&desired, &[], false)
            .unwrap()
            .apply(&mut catalog)
            .unwrap();

        let again = reconcile(&desired, catalog.collections(), false).unwrap();
        assert!(again.is_empty(), "unexpected changes:\n{again}");
    }

    #[test]
    fn test_relation_bound_by_name_to_id() {
        let changes = reconcile(&[quotes("PRODUCTS"), products()], &[], false).unwrap();
        let quotes = changes.created.iter().find(|c| c.id == "q1").unwrap();
        assert_eq!(quotes.fields[0].kind.relation_target(), Some("p1"));
    }

    #[test]
    fn test_relation_to_existing_collection() {
        let changes = reconcile(&[quotes("products")], &[products()], false).unwrap();
        assert_eq!(changes.created[0].fields[0].kind.relation_target(), Some("p1"));
    }

    #[test]
    fn test_unresolved_relation() {
        let result = reconcile(&[quotes("missing")], &[], false);
        assert_eq!(
            result,
            Err(ImportError::UnresolvedRelation {
                collection: "quotes".to_string(),
                field: "product".to_string(),
                target: "missing".to_string(),
            })
        );
    }

    #[test]
    fn test_update_adds_removes_and_changes_fields() {
        let desired = CollectionSchema::new("p1", "products")
            .field(FieldDefinition::new("title", FieldKind::text()).with_id("f_title"))
            .field(FieldDefinition::new("sku", FieldKind::text()));

        let changes = reconcile(&[desired], &[products()], false).unwrap();
        assert_eq!(changes.counts(), ChangeCounts { created: 0, updated: 1, deleted: 0 });

        let update = &changes.updated[0];
        assert_eq!(update.fields.added.len(), 1);
        assert_eq!(update.fields.added[0].name, "sku");
        assert_eq!(update.fields.removed.len(), 1);
        assert_eq!(update.fields.removed[0].name, "price");
        assert_eq!(update.fields.changed.len(), 1);
        assert_eq!(update.fields.changed[0].changed_attributes(), vec!["required"]);
    }

    #[test]
    fn test_field_ids_carried_over() {
        let desired = CollectionSchema::new("p1", "products")
            .field(FieldDefinition::new("title", FieldKind::text()).required())
            .field(FieldDefinition::new("price", FieldKind::number()));

        let changes = reconcile(&[desired], &[products()], false).unwrap();
        assert!(changes.is_empty(), "unexpected changes:\n{changes}");
    }

    #[test]
    fn test_rename_by_hint() {
        let desired = CollectionSchema::new("p1", "products")
            .field(FieldDefinition::new("name", FieldKind::text()).required())
            .field(FieldDefinition::new("price", FieldKind::number()));

        // Without a hint the field is dropped and re-added
        let plain = reconcile(std::slice::from_ref(&desired), &[products()], false).unwrap();
        assert_eq!(plain.updated[0].fields.removed.len(), 1);

        let options = ImportOptions::new().with_renames(RenameHints::new().rename("p1", "title", "name"));
        let changes = Importer::with_options(options)
            .reconcile(&[desired], &[products()])
            .unwrap();
        let fields = &changes.updated[0].fields;
        assert_eq!(fields.renamed, vec![("title".to_string(), "name".to_string())]);
        assert!(fields.added.is_empty());
        assert!(fields.removed.is_empty());
        assert_eq!(changes.updated[0].next.fields[0].id.as_deref(), Some("f_title"));
    }

    #[test]
    fn test_rename_by_field_id() {
        let desired = CollectionSchema::new("p1", "products")
            .field(FieldDefinition::new("name", FieldKind::text()).with_id("f_title").required())
            .field(FieldDefinition::new("price", FieldKind::number()).with_id("f_price"));

        let plain = reconcile(std::slice::from_ref(&desired), &[products()], false).unwrap();
        assert!(plain.updated[0].fields.renamed.is_empty());

        let changes = Importer::with_options(ImportOptions::new().match_field_ids(true))
            .reconcile(&[desired], &[products()])
            .unwrap();
        let fields = &changes.updated[0].fields;
        assert_eq!(fields.renamed, vec![("title".to_string(), "name".to_string())]);
        assert!(fields.changed.is_empty());
    }

    #[test]
    fn test_missing_collections_kept_by_default() {
        let legacy = CollectionSchema::new("l1", "legacy");
        let changes = reconcile(&[products()], &[products(), legacy.clone()], false).unwrap();
        assert!(changes.is_empty());

        let changes = reconcile(&[products()], &[products(), legacy], true).unwrap();
        assert_eq!(names(&changes.deleted), vec!["legacy"]);
    }

    #[test]
    fn test_cannot_delete_system_collection() {
        let users = CollectionSchema::new("_pb_users_auth_", "users").auth().system();
        let result = reconcile(&[products()], &[users], true);
        assert_eq!(result, Err(ImportError::SystemCollection("users".to_string())));
    }

    #[test]
    fn test_cannot_delete_referenced_collection() {
        let existing = vec![products(), quotes("p1")];
        let mut keep_quotes = quotes("p1");
        keep_quotes.rules = AccessRules::public();

        let result = reconcile(&[keep_quotes], &existing, true);
        assert_eq!(
            result,
            Err(ImportError::ReferencedCollection {
                collection: "products".to_string(),
                referenced_by: "quotes".to_string(),
                field: "product".to_string(),
            })
        );
    }

    #[test]
    fn test_name_collision_with_untouched_collection() {
        let existing = vec![CollectionSchema::new("x1", "products")];
        let result = reconcile(&[products()], &existing, false);
        assert_eq!(result, Err(ImportError::DuplicateName("products".to_string())));

        // Deleting the old one frees the name
        let changes = reconcile(&[products()], &existing, true).unwrap();
        assert_eq!(changes.counts(), ChangeCounts { created: 1, updated: 0, deleted: 1 });
    }

    #[test]
    fn test_duplicate_desired_collections() {
        let result = reconcile(&[products(), products()], &[], false);
        assert_eq!(result, Err(ImportError::DuplicateCollection("p1".to_string())));

        let result = reconcile(&[products(), CollectionSchema::new("p2", "Products")], &[], false);
        assert_eq!(result, Err(ImportError::DuplicateName("Products".to_string())));
    }

    #[test]
    fn test_invalid_desired_collection() {
        let bad = CollectionSchema::new("p1", "products")
            .field(FieldDefinition::new("id", FieldKind::text()));
        let result = reconcile(&[bad], &[], false);
        assert!(matches!(result, Err(ImportError::Invalid { .. })));
    }

    #[test]
    fn test_kind_change_rejected() {
        let result = reconcile(&[products().auth()], &[products()], false);
        assert!(matches!(result, Err(ImportError::KindChange { .. })));
    }

    #[test]
    fn test_auth_options_merged() {
        let existing = CollectionSchema::new("_pb_users_auth_", "users").auth_options(AuthOptions {
            min_password_length: Some(8),
            allow_oauth2_auth: Some(true),
            ..AuthOptions::default()
        });
        let desired = CollectionSchema::new("_pb_users_auth_", "users").auth_options(AuthOptions {
            allow_oauth2_auth: Some(false),
            ..AuthOptions::default()
        });

        let changes = reconcile(&[desired], &[existing], false).unwrap();
        let update = &changes.updated[0];
        assert_eq!(update.changed_properties, vec!["options"]);
        let merged = update.next.auth_settings().unwrap();
        assert_eq!(merged.min_password_length, Some(8));
        assert_eq!(merged.allow_oauth2_auth, Some(false));
        assert_eq!(update.next.kind, CollectionKind::Auth);
    }

    #[test]
    fn test_apply_is_all_or_nothing() {
        let mut catalog = Catalog::new(vec![products()]);
        let changes = reconcile(&[CollectionSchema::new("n1", "notes")], &[], false).unwrap();

        // A stale change set that deletes a missing collection fails as a whole
        let mut stale = changes.clone();
        stale.deleted.push(CollectionSchema::new("gone", "gone"));
        let before = catalog.clone();
        assert!(stale.apply(&mut catalog).is_err());
        assert_eq!(catalog, before);

        changes.apply(&mut catalog).unwrap();
        assert!(catalog.get("n1").is_some());
    }

    #[test]
    fn test_import_action() {
        let mut catalog = Catalog::default();
        let action = ImportCollections::new(vec![products(), quotes("products")]);
        action.apply(&mut catalog).unwrap();

        assert_eq!(catalog.collections().len(), 2);
        assert_eq!(
            catalog.get("q1").unwrap().fields[0].kind.relation_target(),
            Some("p1")
        );
        assert_eq!(action.describe(), "import 2 collection(s)");
    }

    #[test]
    fn test_display_summary() {
        let desired = CollectionSchema::new("p1", "products")
            .field(FieldDefinition::new("title", FieldKind::text()).with_id("f_title").required())
            .field(FieldDefinition::new("sku", FieldKind::text()));
        let changes = reconcile(&[desired, quotes("p1")], &[products()], false).unwrap();
        let text = changes.to_string();

        assert!(text.contains("+ create quotes (base, 1 fields)"));
        assert!(text.contains("~ update products"));
        assert!(text.contains("    + field sku (text)"));
        assert!(text.contains("    - field price"));
        assert_eq!(ChangeSet::default().to_string(), "No changes\n");
    }
}
