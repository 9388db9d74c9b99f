//! Working copy of the live collection catalog.
//!
//! A [`Catalog`] is loaded from a transaction, mutated synchronously by
//! migration actions, and flushed back into the same transaction. It tracks
//! which collections were written or removed so a flush only touches those.

use std::collections::{BTreeSet, HashSet};

use tracing::debug;

use crate::error::{ImportError, StoreResult};
use crate::schema::{validate, CollectionSchema, FieldKind};
use crate::store::Transaction;

/// The set of collections as seen by a migration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Catalog {
    collections: Vec<CollectionSchema>,
    touched: BTreeSet<String>,
    removed: BTreeSet<String>,
}

impl Catalog {
    /// Creates a catalog holding `collections`, with nothing marked as changed.
    #[must_use]
    pub fn new(collections: Vec<CollectionSchema>) -> Self {
        Self {
            collections,
            touched: BTreeSet::new(),
            removed: BTreeSet::new(),
        }
    }

    /// Loads every collection visible to `tx`.
    pub async fn load<T: Transaction>(tx: &mut T) -> StoreResult<Self> {
        Ok(Self::new(tx.all_collections().await?))
    }

    /// Writes touched collections and deletes removed ones through `tx`.
    pub async fn flush<T: Transaction>(&self, tx: &mut T) -> StoreResult<()> {
        for id in &self.removed {
            debug!(collection = %id, "Deleting collection");
            tx.delete_collection(id).await?;
        }
        for id in &self.touched {
            if let Some(collection) = self.get(id) {
                debug!(collection = %collection.name, "Saving collection");
                tx.put_collection(collection).await?;
            }
        }
        Ok(())
    }

    /// Returns all collections.
    #[must_use]
    pub fn collections(&self) -> &[CollectionSchema] {
        &self.collections
    }

    /// Returns whether anything needs to be flushed.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        !self.touched.is_empty() || !self.removed.is_empty()
    }

    /// Gets a collection by id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&CollectionSchema> {
        self.collections.iter().find(|c| c.id == id)
    }

    /// Gets a collection by id, falling back to a case-insensitive name match.
    #[must_use]
    pub fn find(&self, id_or_name: &str) -> Option<&CollectionSchema> {
        self.get(id_or_name).or_else(|| {
            self.collections
                .iter()
                .find(|c| c.name.eq_ignore_ascii_case(id_or_name))
        })
    }

    /// Adds a new collection.
    pub fn create(&mut self, collection: CollectionSchema) -> Result<(), ImportError> {
        check(&collection)?;
        if self.get(&collection.id).is_some() {
            return Err(ImportError::CollectionExists(collection.id));
        }
        self.check_name_free(&collection)?;

        self.removed.remove(&collection.id);
        self.touched.insert(collection.id.clone());
        self.collections.push(collection);
        Ok(())
    }

    /// Inserts or replaces a collection, keyed by id.
    pub fn save(&mut self, collection: CollectionSchema) -> Result<(), ImportError> {
        check(&collection)?;
        self.check_name_free(&collection)?;

        self.removed.remove(&collection.id);
        self.touched.insert(collection.id.clone());
        match self.collections.iter_mut().find(|c| c.id == collection.id) {
            Some(existing) => *existing = collection,
            None => self.collections.push(collection),
        }
        Ok(())
    }

    /// Inserts or replaces several collections at once.
    ///
    /// Name uniqueness is checked against the result, so collections may swap
    /// names. Nothing is changed if any collection is rejected.
    pub fn save_all<I>(&mut self, collections: I) -> Result<(), ImportError>
    where
        I: IntoIterator<Item = CollectionSchema>,
    {
        let mut next = self.clone();
        for collection in collections {
            check(&collection)?;
            next.removed.remove(&collection.id);
            next.touched.insert(collection.id.clone());
            match next.collections.iter_mut().find(|c| c.id == collection.id) {
                Some(existing) => *existing = collection,
                None => next.collections.push(collection),
            }
        }

        let mut seen = HashSet::new();
        for collection in &next.collections {
            if !seen.insert(collection.name.to_ascii_lowercase()) {
                return Err(ImportError::DuplicateName(collection.name.clone()));
            }
        }

        *self = next;
        Ok(())
    }

    /// Edits a collection in place. The edit is discarded if the result is invalid.
    pub fn update<F>(&mut self, id: &str, edit: F) -> Result<(), ImportError>
    where
        F: FnOnce(&mut CollectionSchema),
    {
        let mut collection = self
            .get(id)
            .cloned()
            .ok_or_else(|| ImportError::CollectionNotFound(id.to_string()))?;
        edit(&mut collection);
        if collection.id != id {
            return Err(ImportError::CollectionNotFound(collection.id));
        }
        self.save(collection)
    }

    /// Removes a collection and returns it.
    pub fn delete(&mut self, id: &str) -> Result<CollectionSchema, ImportError> {
        let idx = self
            .collections
            .iter()
            .position(|c| c.id == id)
            .ok_or_else(|| ImportError::CollectionNotFound(id.to_string()))?;
        if self.collections[idx].system {
            return Err(ImportError::SystemCollection(self.collections[idx].name.clone()));
        }

        let removed = self.collections.remove(idx);
        self.touched.remove(id);
        self.removed.insert(removed.id.clone());
        Ok(removed)
    }

    /// Resolves every relation target to a stable collection id.
    ///
    /// Targets given by name are rewritten to the id. A target that names a
    /// collection removed from this catalog is reported as still referenced.
    pub fn bind_relations(&mut self) -> Result<(), ImportError> {
        let mut rewrites = Vec::new();
        for (ci, collection) in self.collections.iter().enumerate() {
            for (fi, field) in collection.fields.iter().enumerate() {
                let Some(target) = field.kind.relation_target() else {
                    continue;
                };
                match self.find(target) {
                    Some(resolved) if resolved.id == target => {}
                    Some(resolved) => rewrites.push((ci, fi, resolved.id.clone())),
                    None if self.removed.contains(target) => {
                        return Err(ImportError::ReferencedCollection {
                            collection: target.to_string(),
                            referenced_by: collection.name.clone(),
                            field: field.name.clone(),
                        });
                    }
                    None => {
                        return Err(ImportError::UnresolvedRelation {
                            collection: collection.name.clone(),
                            field: field.name.clone(),
                            target: target.to_string(),
                        });
                    }
                }
            }
        }

        for (ci, fi, id) in rewrites {
            let collection = &mut self.collections[ci];
            if let FieldKind::Relation(options) = &mut collection.fields[fi].kind {
                options.collection_id = id;
            }
            self.touched.insert(collection.id.clone());
        }
        Ok(())
    }

    fn check_name_free(&self, collection: &CollectionSchema) -> Result<(), ImportError> {
        let taken = self
            .collections
            .iter()
            .any(|c| c.id != collection.id && c.name.eq_ignore_ascii_case(&collection.name));
        if taken {
            return Err(ImportError::DuplicateName(collection.name.clone()));
        }
        Ok(())
    }
}

fn check(collection: &CollectionSchema) -> Result<(), ImportError> {
    validate(collection).map_err(|source| ImportError::Invalid {
        collection: collection.name.clone(),
        source,
    })
}
