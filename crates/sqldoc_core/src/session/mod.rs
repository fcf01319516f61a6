//! Unit of work over one connection and one transaction.
//!
//! # Responsibility
//! - Track saved, updated, deleted and loaded objects per collection.
//! - Turn staged changes into ordered commands on `flush`.
//! - Own the connection and the transaction lifecycle.
//!
//! # Invariants
//! - At most one live instance per document id per collection.
//! - Any flush error cancels the session: the transaction is rolled back and
//!   staged work is discarded.
//! - `dispose`/`Drop` never fail; errors are logged and swallowed.
//! - Every public operation after `dispose` fails with `StoreError::Disposed`.

mod flush;
mod identity_map;
mod reduce;
mod state;

use crate::command::{batch_commands, execute_all, Command, CommandContext};
use crate::db::naming::validate_identifier;
use crate::error::{StoreError, StoreResult};
use crate::model::descriptor::IndexDescriptor;
use crate::model::document::{document_columns, parse_document_row, Document};
use crate::model::entity::{Entity, EntityRef, Handle, ObjectKey};
use crate::store::Store;
use flush::FlushContext;
use log::{debug, error, info, trace, warn};
use reduce::reduce_collection;
use rusqlite::{params, Connection, TransactionBehavior};
use state::SessionState;
use std::any::TypeId;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// Options of [`Session::save_with`].
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Check the document version on update even if the type is not
    /// registered as concurrent.
    pub check_concurrency: bool,
    /// Target collection; empty is the default collection.
    pub collection: String,
}

/// Options of [`Session::import`].
#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    /// Document id; `0` reads it through the id accessor.
    pub id: i64,
    /// Last known version; `0` reads it through the version accessor.
    pub version: i64,
    pub collection: String,
}

/// A unit of work. Create with [`Store::create_session`]; finish with
/// [`Session::commit`].
///
/// Sessions are single-threaded; use one session per thread.
pub struct Session {
    id: Uuid,
    store: Arc<Store>,
    connection: Option<Connection>,
    in_transaction: bool,
    states: BTreeMap<String, SessionState>,
    indexes: Vec<IndexDescriptor>,
    commands: Vec<Command>,
    executed_commands: usize,
    flushing: bool,
    cancelled: bool,
    disposed: bool,
}

fn check_collection(collection: &str) -> StoreResult<()> {
    if collection.is_empty() {
        Ok(())
    } else {
        validate_identifier(collection)
    }
}

fn begin_statement(behavior: TransactionBehavior) -> &'static str {
    match behavior {
        TransactionBehavior::Immediate => "BEGIN IMMEDIATE;",
        TransactionBehavior::Exclusive => "BEGIN EXCLUSIVE;",
        _ => "BEGIN DEFERRED;",
    }
}

impl Session {
    pub(crate) fn new(store: Arc<Store>) -> Self {
        let id = Uuid::new_v4();
        debug!("event=session_open module=session status=ok session_id={id}");
        Self {
            id,
            store,
            connection: None,
            in_transaction: false,
            states: BTreeMap::new(),
            indexes: Vec::new(),
            commands: Vec::new(),
            executed_commands: 0,
            flushing: false,
            cancelled: false,
            disposed: false,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Total commands executed by this session's flushes.
    pub fn executed_commands(&self) -> usize {
        self.executed_commands
    }

    fn check_disposed(&self) -> StoreResult<()> {
        if self.disposed {
            Err(StoreError::Disposed)
        } else {
            Ok(())
        }
    }

    fn state_mut(&mut self, collection: &str) -> &mut SessionState {
        self.states.entry(collection.to_string()).or_default()
    }

    fn has_work(&self) -> bool {
        self.states.values().any(SessionState::has_work)
    }

    /// Adds session-scoped index descriptors, used alongside the store's.
    pub fn register_indexes(
        &mut self,
        descriptors: impl IntoIterator<Item = IndexDescriptor>,
    ) -> StoreResult<()> {
        self.check_disposed()?;
        for descriptor in descriptors {
            descriptor.validate()?;
            self.indexes.push(descriptor);
        }
        Ok(())
    }

    /// Stages `entity` in the default collection.
    pub fn save<T: Entity>(&mut self, entity: &Handle<T>) -> StoreResult<()> {
        self.save_with(entity, SaveOptions::default())
    }

    /// Stages `entity` for insert (new object) or update (known object).
    ///
    /// New objects get an id from the id generator, written back through the
    /// id accessor. Objects with a positive id are attached as existing
    /// documents. Saving an already staged object is a no-op.
    pub fn save_with<T: Entity>(
        &mut self,
        entity: &Handle<T>,
        options: SaveOptions,
    ) -> StoreResult<()> {
        self.check_disposed()?;
        check_collection(&options.collection)?;
        let store = Arc::clone(&self.store);
        let entity = EntityRef::new(entity, store.entity_type::<T>());
        let key = entity.key();
        let check_concurrency =
            options.check_concurrency || store.is_concurrent(TypeId::of::<T>());
        let state = self.state_mut(&options.collection);

        if state.saved.contains(key) || state.updated.contains(key) {
            return Ok(());
        }
        state.tracked.remove(key);

        let id = if let Some(id) = state.identity_map.id_of(key) {
            state.updated.insert(entity);
            id
        } else if let Some(id) = entity.id().filter(|id| *id > 0) {
            state.identity_map.add_entity(id, entity.clone())?;
            state.updated.insert(entity);
            id
        } else {
            let id = store.next_id(&options.collection)?;
            entity.set_id(id);
            state.identity_map.add_entity(id, entity.clone())?;
            state.saved.insert(entity);
            id
        };

        if check_concurrency {
            state.concurrent.insert(id);
        }
        trace!(
            "event=session_save module=session status=ok session_id={} type={} id={}",
            self.id,
            T::TYPE_NAME,
            id
        );
        Ok(())
    }

    /// Attaches an object whose persisted state is already known, without a
    /// database read, and stages it for update.
    ///
    /// Returns `false` when the object is already tracked.
    pub fn import<T: Entity>(
        &mut self,
        entity: &Handle<T>,
        options: ImportOptions,
    ) -> StoreResult<bool> {
        self.check_disposed()?;
        check_collection(&options.collection)?;
        if self
            .state_mut(&options.collection)
            .identity_map
            .contains(ObjectKey::of(entity))
        {
            return Ok(false);
        }
        let store = Arc::clone(&self.store);
        let entity = EntityRef::new(entity, store.entity_type::<T>());
        let state = self.state_mut(&options.collection);

        let id = if options.id != 0 {
            options.id
        } else {
            entity.id().filter(|id| *id > 0).ok_or_else(|| {
                StoreError::invalid_operation(format!(
                    "cannot import a `{}` without an id",
                    T::TYPE_NAME
                ))
            })?
        };
        let version = if options.version != 0 {
            options.version
        } else {
            entity.version().unwrap_or(0)
        };
        let content = store.serializer().serialize(&entity.to_value()?)?;

        state.identity_map.add_entity(id, entity.clone())?;
        state.identity_map.add_document(Document {
            id,
            type_name: T::TYPE_NAME.to_string(),
            content,
            version,
        });
        state.updated.insert(entity);
        if store.is_concurrent(TypeId::of::<T>()) {
            state.concurrent.insert(id);
        }
        Ok(true)
    }

    /// Stages `entity` for deletion from the default collection.
    pub fn delete<T: Entity>(&mut self, entity: &Handle<T>) -> StoreResult<()> {
        self.delete_in(entity, "")
    }

    /// Stages `entity` for deletion. Deleting an object that was saved but
    /// never flushed discards it.
    pub fn delete_in<T: Entity>(&mut self, entity: &Handle<T>, collection: &str) -> StoreResult<()> {
        self.check_disposed()?;
        check_collection(collection)?;
        let entity = EntityRef::new(entity, self.store.entity_type::<T>());
        let key = entity.key();
        let state = self.state_mut(collection);

        if state.saved.remove(key) {
            if let Some(id) = state.identity_map.id_of(key) {
                state.identity_map.remove(id, key);
                state.concurrent.remove(&id);
            }
            return Ok(());
        }

        if state.identity_map.id_of(key).is_none() && entity.id().filter(|id| *id > 0).is_none() {
            return Err(StoreError::invalid_operation(format!(
                "could not delete a `{}` without an id",
                T::TYPE_NAME
            )));
        }
        state.deleted.insert(entity);
        Ok(())
    }

    /// Stops tracking `entity`: it leaves every staged set and the identity
    /// map.
    pub fn detach<T: Entity>(&mut self, entity: &Handle<T>, collection: &str) -> StoreResult<()> {
        self.check_disposed()?;
        let key = ObjectKey::of(entity);
        let state = self.state_mut(collection);
        state.unstage(key);
        if let Some(id) = state.identity_map.id_of(key) {
            state.identity_map.remove(id, key);
        }
        Ok(())
    }

    /// Opens the connection and the transaction if not open yet.
    fn demand(&mut self) -> StoreResult<()> {
        self.check_disposed()?;
        if self.connection.is_none() {
            self.connection = Some(self.store.connect()?);
        }
        if !self.in_transaction {
            let behavior = self.store.config().transaction_behavior();
            if let Some(conn) = &self.connection {
                conn.execute_batch(begin_statement(behavior))?;
            }
            self.in_transaction = true;
            debug!(
                "event=transaction_begin module=session status=ok session_id={} statement={}",
                self.id,
                begin_statement(behavior)
            );
        }
        Ok(())
    }

    fn connection(&self) -> StoreResult<&Connection> {
        self.connection
            .as_ref()
            .ok_or_else(|| StoreError::invalid_operation("session has no open connection"))
    }

    /// Writes all staged changes inside the session transaction.
    ///
    /// # Errors
    /// Any error cancels the session before it is returned.
    pub fn flush(&mut self) -> StoreResult<()> {
        self.check_disposed()?;
        if self.flushing || !self.has_work() {
            return Ok(());
        }

        self.flushing = true;
        let started_at = Instant::now();
        let result = self.flush_work();

        for state in self.states.values_mut() {
            state.finish_flush();
        }
        self.commands.clear();
        self.flushing = false;

        match result {
            Ok(executed) => {
                self.executed_commands += executed;
                debug!(
                    "event=session_flush module=session status=ok session_id={} commands={} duration_ms={}",
                    self.id,
                    executed,
                    started_at.elapsed().as_millis()
                );
                Ok(())
            }
            Err(err) => {
                error!(
                    "event=session_flush module=session status=error session_id={} duration_ms={} error={}",
                    self.id,
                    started_at.elapsed().as_millis(),
                    err
                );
                self.cancel_work();
                Err(err)
            }
        }
    }

    fn flush_work(&mut self) -> StoreResult<usize> {
        self.demand()?;
        let Self {
            store,
            connection,
            states,
            indexes,
            commands,
            ..
        } = self;
        let store: &Store = store;
        let conn: &Connection = match connection {
            Some(conn) => conn,
            None => {
                return Err(StoreError::invalid_operation(
                    "session has no open connection",
                ))
            }
        };

        let mut context = FlushContext {
            store,
            conn,
            session_indexes: indexes,
            commands,
        };
        for (collection, state) in states.iter_mut() {
            context.apply_collection(collection, state)?;
        }
        for (collection, state) in states.iter() {
            let reduced = reduce_collection(collection, &state.maps, &mut context)?;
            context.commands.extend(reduced);
        }

        let pending = std::mem::take(context.commands);
        let batched = batch_commands(pending, store.config().commands_page_size());
        execute_all(batched, &CommandContext { store, conn })
    }

    /// Flushes and commits. A cancelled session rolls back instead.
    ///
    /// The connection is released afterwards; the session can start a new
    /// unit of work.
    pub fn commit(&mut self) -> StoreResult<()> {
        self.check_disposed()?;
        if !self.cancelled {
            if let Err(err) = self.flush() {
                self.release_connection();
                self.cancelled = false;
                return Err(err);
            }
        }

        let result = self.end_transaction();
        self.release_connection();
        self.cancelled = false;
        result
    }

    fn end_transaction(&mut self) -> StoreResult<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.in_transaction = false;
        let Some(conn) = &self.connection else {
            return Ok(());
        };

        if self.cancelled {
            conn.execute_batch("ROLLBACK;")?;
            info!(
                "event=transaction_rollback module=session status=ok session_id={}",
                self.id
            );
        } else {
            conn.execute_batch("COMMIT;")?;
            info!(
                "event=transaction_commit module=session status=ok session_id={} commands={}",
                self.id, self.executed_commands
            );
        }
        Ok(())
    }

    /// Rolls back the open transaction and discards staged work. A later
    /// `commit` rolls back as well.
    pub fn cancel(&mut self) -> StoreResult<()> {
        self.check_disposed()?;
        self.cancel_work();
        Ok(())
    }

    fn cancel_work(&mut self) {
        self.cancelled = true;
        if self.in_transaction {
            self.in_transaction = false;
            if let Some(conn) = &self.connection {
                if let Err(err) = conn.execute_batch("ROLLBACK;") {
                    warn!(
                        "event=transaction_rollback module=session status=error session_id={} error={}",
                        self.id, err
                    );
                }
            }
        }
        for state in self.states.values_mut() {
            state.release();
        }
        self.commands.clear();
        debug!(
            "event=session_cancel module=session status=ok session_id={}",
            self.id
        );
    }

    fn release_connection(&mut self) {
        for state in self.states.values_mut() {
            state.release();
        }
        self.commands.clear();
        self.in_transaction = false;
        self.connection = None;
    }

    /// Loads documents by id from the default collection.
    pub fn get<T: Entity>(&mut self, ids: &[i64]) -> StoreResult<Vec<Handle<T>>> {
        self.get_in(ids, "")
    }

    /// Loads documents by id, in request order. Tracked objects are returned
    /// as-is; missing ids and documents of another type are skipped.
    pub fn get_in<T: Entity>(&mut self, ids: &[i64], collection: &str) -> StoreResult<Vec<Handle<T>>> {
        self.check_disposed()?;
        check_collection(collection)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        self.flush()?;
        self.demand()?;

        let missing = {
            let state = self.state_mut(collection);
            let mut seen = HashSet::new();
            ids.iter()
                .copied()
                .filter(|id| state.identity_map.entity(*id).is_none() && seen.insert(*id))
                .collect::<Vec<_>>()
        };

        if !missing.is_empty() {
            let read = self
                .connection()
                .and_then(|conn| self.store.read_documents(conn, collection, &missing));
            match read {
                Ok(documents) => self.attach_documents::<T>(collection, documents)?,
                Err(err) => {
                    self.cancel_work();
                    return Err(err);
                }
            }
        }

        let state = self.state_mut(collection);
        Ok(ids
            .iter()
            .filter_map(|id| state.identity_map.entity(*id))
            .filter_map(EntityRef::downcast::<T>)
            .collect())
    }

    /// Lists documents of type `T` in the default collection ordered by id.
    pub fn list<T: Entity>(&mut self, offset: i64, limit: i64) -> StoreResult<Vec<Handle<T>>> {
        self.list_in(offset, limit, "")
    }

    /// Lists one page of documents of type `T` ordered by id.
    pub fn list_in<T: Entity>(
        &mut self,
        offset: i64,
        limit: i64,
        collection: &str,
    ) -> StoreResult<Vec<Handle<T>>> {
        self.check_disposed()?;
        check_collection(collection)?;
        self.flush()?;
        self.demand()?;

        let read = self
            .connection()
            .and_then(|conn| self.read_page(conn, T::TYPE_NAME, offset, limit, collection));
        let documents = match read {
            Ok(documents) => documents,
            Err(err) => {
                self.cancel_work();
                return Err(err);
            }
        };
        let ids = documents.iter().map(|document| document.id).collect::<Vec<_>>();
        self.attach_documents::<T>(collection, documents)?;

        let state = self.state_mut(collection);
        Ok(ids
            .iter()
            .filter_map(|id| state.identity_map.entity(*id))
            .filter_map(EntityRef::downcast::<T>)
            .collect())
    }

    fn read_page(
        &self,
        conn: &Connection,
        type_name: &str,
        offset: i64,
        limit: i64,
        collection: &str,
    ) -> StoreResult<Vec<Document>> {
        let dialect = self.store.dialect();
        let mut sql = format!(
            "SELECT {} FROM {} WHERE {} = ? ORDER BY {}",
            document_columns(dialect),
            dialect.quote_for_table_name(&self.store.document_table(collection)),
            dialect.quote_for_column_name("Type"),
            dialect.quote_for_column_name("Id"),
        );
        dialect.page(&mut sql);
        sql.push(';');

        trace!("event=sql module=session sql={}", sql);
        let mut stmt = conn.prepare(&sql)?;
        let mut rows = stmt.query(params![type_name, limit.max(0), offset.max(0)])?;
        let mut documents = Vec::new();
        while let Some(row) = rows.next()? {
            documents.push(parse_document_row(row)?);
        }
        Ok(documents)
    }

    /// Deserializes loaded documents of type `T` into the identity map.
    fn attach_documents<T: Entity>(
        &mut self,
        collection: &str,
        documents: Vec<Document>,
    ) -> StoreResult<()> {
        let store = Arc::clone(&self.store);
        let entity_type = store.entity_type::<T>();
        let state = self.state_mut(collection);

        for document in documents {
            if state.identity_map.entity(document.id).is_some()
                || document.type_name != T::TYPE_NAME
            {
                continue;
            }
            let value = store.serializer().deserialize(&document.content)?;
            let entity = EntityRef::from_object(
                entity_type.from_value(value)?,
                Arc::clone(&entity_type),
            );
            entity.set_id(document.id);
            state.identity_map.add_entity(document.id, entity)?;
            state.identity_map.add_document(document);
        }
        Ok(())
    }

    /// Best-effort flush, then commit (or roll back when cancelled), then
    /// release everything. Never fails.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }

        if !self.cancelled && self.has_work() {
            if let Err(err) = self.flush() {
                warn!(
                    "event=session_dispose module=session status=error session_id={} stage=flush error={}",
                    self.id, err
                );
            }
        }
        if let Err(err) = self.end_transaction() {
            warn!(
                "event=session_dispose module=session status=error session_id={} stage=end_transaction error={}",
                self.id, err
            );
        }

        self.disposed = true;
        self.release_connection();
        for state in self.states.values_mut() {
            state.identity_map.clear();
        }
        self.indexes.clear();
        debug!(
            "event=session_dispose module=session status=ok session_id={}",
            self.id
        );
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.dispose();
    }
}
