//! Per-collection identity map.
//!
//! # Invariants
//! - At most one live object per document id.
//! - `objects` and `ids` are always inverse of each other.

use crate::error::{StoreError, StoreResult};
use crate::model::document::Document;
use crate::model::entity::{EntityRef, ObjectKey};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub(crate) struct IdentityMap {
    objects: HashMap<i64, EntityRef>,
    ids: HashMap<ObjectKey, i64>,
    documents: HashMap<i64, Document>,
}

impl IdentityMap {
    pub(crate) fn id_of(&self, key: ObjectKey) -> Option<i64> {
        self.ids.get(&key).copied()
    }

    pub(crate) fn contains(&self, key: ObjectKey) -> bool {
        self.ids.contains_key(&key)
    }

    pub(crate) fn entity(&self, id: i64) -> Option<&EntityRef> {
        self.objects.get(&id)
    }

    pub(crate) fn document(&self, id: i64) -> Option<&Document> {
        self.documents.get(&id)
    }

    /// Attaches `entity` under `id`. Re-attaching the same object is a no-op;
    /// attaching a different object under a tracked id is an error.
    pub(crate) fn add_entity(&mut self, id: i64, entity: EntityRef) -> StoreResult<()> {
        let key = entity.key();
        if let Some(existing) = self.objects.get(&id) {
            if existing.key() == key {
                return Ok(());
            }
            return Err(StoreError::invalid_operation(format!(
                "another instance of document {id} is already tracked by this session"
            )));
        }
        if let Some(previous) = self.ids.insert(key, id) {
            self.objects.remove(&previous);
            self.documents.remove(&previous);
        }
        self.objects.insert(id, entity);
        Ok(())
    }

    /// Records (or replaces) the last-known persisted document.
    pub(crate) fn add_document(&mut self, document: Document) {
        self.documents.insert(document.id, document);
    }

    pub(crate) fn remove(&mut self, id: i64, key: ObjectKey) {
        if self.ids.get(&key) == Some(&id) {
            self.ids.remove(&key);
        }
        if self.objects.get(&id).map(EntityRef::key) == Some(key) {
            self.objects.remove(&id);
        }
        self.documents.remove(&id);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.objects.len()
    }

    pub(crate) fn clear(&mut self) {
        self.objects.clear();
        self.ids.clear();
        self.documents.clear();
    }
}
