//! Per-collection flush steps: turn staged objects into document commands
//! and index deltas.

use super::reduce::PersistedReductions;
use super::state::{MapDelta, MapState, SessionState};
use crate::command::{Command, IndexLinks};
use crate::error::{StoreError, StoreResult};
use crate::model::descriptor::IndexDescriptor;
use crate::model::document::Document;
use crate::model::entity::EntityRef;
use crate::model::index::IndexRow;
use crate::store::Store;
use rusqlite::Connection;
use serde_json::Value;
use std::any::{Any, TypeId};

pub(super) struct FlushContext<'a> {
    pub(super) store: &'a Store,
    pub(super) conn: &'a Connection,
    pub(super) session_indexes: &'a [IndexDescriptor],
    pub(super) commands: &'a mut Vec<Command>,
}

impl FlushContext<'_> {
    /// Runs the tracked, updated, saved and deleted steps in that order.
    pub(super) fn apply_collection(
        &mut self,
        collection: &str,
        state: &mut SessionState,
    ) -> StoreResult<()> {
        for entity in state.tracked.to_vec() {
            if !state.deleted.contains(entity.key()) {
                self.update_entity(collection, state, &entity, true)?;
            }
        }
        for entity in state.updated.to_vec() {
            if !state.deleted.contains(entity.key()) {
                self.update_entity(collection, state, &entity, false)?;
            }
        }
        for entity in state.saved.to_vec() {
            self.save_entity(collection, state, &entity)?;
        }
        for entity in state.deleted.to_vec() {
            self.delete_entity(collection, state, &entity)?;
        }
        Ok(())
    }

    /// Store descriptors plus session descriptors for another target.
    fn descriptors(&self, type_id: TypeId, collection: &str) -> Vec<IndexDescriptor> {
        let mut descriptors = self.store.descriptors(type_id, collection);
        for descriptor in self.session_indexes {
            if descriptor.applies_to(type_id, collection)
                && !descriptors
                    .iter()
                    .any(|existing| existing.same_target(descriptor))
            {
                descriptors.push(descriptor.clone());
            }
        }
        descriptors
    }

    fn fetch_document(&self, collection: &str, id: i64) -> StoreResult<Option<Document>> {
        let documents = self.store.read_documents(self.conn, collection, &[id])?;
        Ok(documents.into_iter().find(|document| document.id == id))
    }

    fn serialize(&self, entity: &EntityRef) -> StoreResult<String> {
        self.store.serializer().serialize(&entity.to_value()?)
    }

    fn save_entity(
        &mut self,
        collection: &str,
        state: &mut SessionState,
        entity: &EntityRef,
    ) -> StoreResult<()> {
        let id = state.identity_map.id_of(entity.key()).ok_or_else(|| {
            StoreError::invalid_operation("the object to save was not found in the identity map")
        })?;

        let version = match entity.version() {
            Some(version) if version != 0 => version,
            _ => 1,
        };
        entity.set_version(version);

        let document = Document {
            id,
            type_name: entity.entity_type().name().to_string(),
            content: self.serialize(entity)?,
            version,
        };
        self.commands.push(Command::CreateDocument {
            collection: collection.to_string(),
            documents: vec![document.clone()],
        });
        state.identity_map.add_document(document);

        self.map_new(collection, state, entity, id)
    }

    fn update_entity(
        &mut self,
        collection: &str,
        state: &mut SessionState,
        entity: &EntityRef,
        tracked: bool,
    ) -> StoreResult<()> {
        let id = state.identity_map.id_of(entity.key()).ok_or_else(|| {
            StoreError::invalid_operation("the object to update was not found in the identity map")
        })?;

        let old = match state.identity_map.document(id) {
            Some(document) => document.clone(),
            None => self.fetch_document(collection, id)?.ok_or_else(|| {
                StoreError::invalid_operation(format!(
                    "cannot update document {id}: it does not exist; \
                     a new object must not be saved with an explicit id"
                ))
            })?,
        };

        let mut content = self.serialize(entity)?;
        if tracked && content == old.content {
            return Ok(());
        }

        let mut version = old.version;
        let mut expected_version = None;
        if state.concurrent.contains(&id) {
            let local = entity.version().unwrap_or(0);
            expected_version = Some(if local != 0 { local } else { old.version });
            version = old.version + 1;
            if entity.entity_type().has_version_accessor() {
                entity.set_version(version);
                content = self.serialize(entity)?;
            }
        }

        let serializer = self.store.serializer();
        let old_object = entity
            .entity_type()
            .from_value(serializer.deserialize(&old.content)?)?;
        self.remap(collection, state, entity, &*old_object, id)?;

        let document = Document {
            id,
            type_name: entity.entity_type().name().to_string(),
            content,
            version,
        };
        state.identity_map.add_document(document.clone());
        self.commands.push(Command::UpdateDocument {
            collection: collection.to_string(),
            document,
            expected_version,
        });
        Ok(())
    }

    fn delete_entity(
        &mut self,
        collection: &str,
        state: &mut SessionState,
        entity: &EntityRef,
    ) -> StoreResult<()> {
        let key = entity.key();
        let id = match state.identity_map.id_of(key) {
            Some(id) => id,
            None => entity.id().filter(|id| *id > 0).ok_or_else(|| {
                StoreError::invalid_operation("could not delete an object without an id")
            })?,
        };

        let Some(document) = self.fetch_document(collection, id)? else {
            return Ok(());
        };
        state.identity_map.remove(id, key);

        let persisted = entity
            .entity_type()
            .from_value(self.store.serializer().deserialize(&document.content)?)?;
        self.map_deleted(collection, state, entity.entity_type().rust_type_id(), &*persisted, id)?;

        self.commands.push(Command::DeleteDocument {
            collection: collection.to_string(),
            document_ids: vec![id],
        });
        Ok(())
    }

    fn map_new(
        &mut self,
        collection: &str,
        state: &mut SessionState,
        entity: &EntityRef,
        document_id: i64,
    ) -> StoreResult<()> {
        for descriptor in self.descriptors(entity.entity_type().rust_type_id(), collection) {
            let rows = descriptor.map_object(entity.object())?;
            if descriptor.is_reduce() {
                for row in rows {
                    state.stage(&descriptor, delta(row, document_id, MapState::New));
                }
            } else {
                self.create_map_rows(collection, rows, document_id);
            }
        }
        Ok(())
    }

    fn map_deleted(
        &mut self,
        collection: &str,
        state: &mut SessionState,
        type_id: TypeId,
        object: &dyn Any,
        document_id: i64,
    ) -> StoreResult<()> {
        for descriptor in self.descriptors(type_id, collection) {
            if descriptor.is_reduce() {
                for row in descriptor.map_object(object)? {
                    state.stage(&descriptor, delta(row, document_id, MapState::Delete));
                }
            } else {
                self.delete_map_rows(collection, &descriptor, document_id);
            }
        }
        Ok(())
    }

    /// Re-maps an updated document. Map rows are replaced; for reduce
    /// indexes every old entry is staged `Delete` and every new entry `New`.
    fn remap(
        &mut self,
        collection: &str,
        state: &mut SessionState,
        entity: &EntityRef,
        old_object: &dyn Any,
        document_id: i64,
    ) -> StoreResult<()> {
        for descriptor in self.descriptors(entity.entity_type().rust_type_id(), collection) {
            let new_rows = descriptor.map_object(entity.object())?;
            if !descriptor.is_reduce() {
                self.delete_map_rows(collection, &descriptor, document_id);
                self.create_map_rows(collection, new_rows, document_id);
                continue;
            }

            for row in descriptor.map_object(old_object)? {
                state.stage(&descriptor, delta(row, document_id, MapState::Delete));
            }
            for row in new_rows {
                state.stage(&descriptor, delta(row, document_id, MapState::New));
            }
        }
        Ok(())
    }

    fn create_map_rows(&mut self, collection: &str, rows: Vec<IndexRow>, document_id: i64) {
        for row in rows {
            self.commands.push(Command::CreateIndex {
                collection: collection.to_string(),
                row,
                links: IndexLinks::Document(document_id),
            });
        }
    }

    fn delete_map_rows(&mut self, collection: &str, descriptor: &IndexDescriptor, document_id: i64) {
        self.commands.push(Command::DeleteMapIndex {
            collection: collection.to_string(),
            index_type: descriptor.index_type(),
            document_ids: vec![document_id],
        });
    }
}

fn delta(row: IndexRow, document_id: i64, state: MapState) -> MapDelta {
    MapDelta {
        row,
        document_id,
        state,
    }
}

impl PersistedReductions for FlushContext<'_> {
    fn find_reduced(
        &mut self,
        descriptor: &IndexDescriptor,
        group_key: &str,
        group_value: &Value,
    ) -> StoreResult<Option<IndexRow>> {
        self.store
            .read_reduced(self.conn, descriptor, group_key, group_value)
    }
}
