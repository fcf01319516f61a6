//! Staged work of one collection inside a session.

use super::identity_map::IdentityMap;
use crate::model::descriptor::IndexDescriptor;
use crate::model::entity::{EntityRef, ObjectKey};
use crate::model::index::IndexRow;
use std::collections::HashSet;

/// Insertion-ordered set of objects keyed by identity.
#[derive(Debug, Default)]
pub(crate) struct ObjectSet {
    entries: Vec<EntityRef>,
    keys: HashSet<ObjectKey>,
}

impl ObjectSet {
    pub(crate) fn insert(&mut self, entity: EntityRef) -> bool {
        if !self.keys.insert(entity.key()) {
            return false;
        }
        self.entries.push(entity);
        true
    }

    pub(crate) fn remove(&mut self, key: ObjectKey) -> bool {
        if !self.keys.remove(&key) {
            return false;
        }
        self.entries.retain(|entry| entry.key() != key);
        true
    }

    pub(crate) fn contains(&self, key: ObjectKey) -> bool {
        self.keys.contains(&key)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of the members, in insertion order.
    pub(crate) fn to_vec(&self) -> Vec<EntityRef> {
        self.entries.clone()
    }

    pub(crate) fn drain(&mut self) -> Vec<EntityRef> {
        self.keys.clear();
        std::mem::take(&mut self.entries)
    }

    pub(crate) fn clear(&mut self) {
        self.keys.clear();
        self.entries.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MapState {
    New,
    /// Contribution kept as-is, folded in through `ReduceIndex::update`. The
    /// session's own remapping stages `Delete` + `New` instead.
    #[cfg_attr(not(test), allow(dead_code))]
    Update,
    Delete,
}

/// One staged reduce index entry and the document it comes from.
#[derive(Debug, Clone)]
pub(crate) struct MapDelta {
    pub(crate) row: IndexRow,
    pub(crate) document_id: i64,
    pub(crate) state: MapState,
}

/// All staged deltas of one reduce descriptor.
#[derive(Debug)]
pub(crate) struct StagedIndex {
    pub(crate) descriptor: IndexDescriptor,
    pub(crate) deltas: Vec<MapDelta>,
}

#[derive(Debug, Default)]
pub(crate) struct SessionState {
    pub(crate) saved: ObjectSet,
    pub(crate) updated: ObjectSet,
    pub(crate) tracked: ObjectSet,
    pub(crate) deleted: ObjectSet,
    /// Document ids whose updates are concurrency-checked.
    pub(crate) concurrent: HashSet<i64>,
    /// Reduce deltas by descriptor, in first-staged order.
    pub(crate) maps: Vec<StagedIndex>,
    pub(crate) identity_map: IdentityMap,
}

impl SessionState {
    pub(crate) fn has_work(&self) -> bool {
        !(self.saved.is_empty()
            && self.updated.is_empty()
            && self.tracked.is_empty()
            && self.deleted.is_empty())
    }

    pub(crate) fn stage(&mut self, descriptor: &IndexDescriptor, delta: MapDelta) {
        match self
            .maps
            .iter_mut()
            .find(|staged| staged.descriptor.same_target(descriptor))
        {
            Some(staged) => staged.deltas.push(delta),
            None => self.maps.push(StagedIndex {
                descriptor: descriptor.clone(),
                deltas: vec![delta],
            }),
        }
    }

    /// Drops an object from every staged set.
    pub(crate) fn unstage(&mut self, key: ObjectKey) {
        self.saved.remove(key);
        self.updated.remove(key);
        self.tracked.remove(key);
        self.deleted.remove(key);
    }

    /// Moves saved and updated objects to tracked, drops deleted ones and
    /// clears flush state.
    pub(crate) fn finish_flush(&mut self) {
        for entity in self.saved.drain() {
            self.tracked.insert(entity);
        }
        for entity in self.updated.drain() {
            self.tracked.insert(entity);
        }
        for entity in self.deleted.drain() {
            self.tracked.remove(entity.key());
        }
        self.maps.clear();
    }

    /// Discards the unit of work; the identity map survives.
    pub(crate) fn release(&mut self) {
        self.saved.clear();
        self.updated.clear();
        self.tracked.clear();
        self.deleted.clear();
        self.concurrent.clear();
        self.maps.clear();
    }
}
