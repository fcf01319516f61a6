//! Process-wide store: configuration, resolved type cache and shared reads.
//!
//! # Responsibility
//! - Validate and own the store configuration and its collaborators.
//! - Resolve entity accessors once per type.
//! - Run document and reduce-row reads through single-flight coordinators.
//! - Create sessions.
//!
//! # Invariants
//! - `Store` is `Send + Sync`; sessions hold it through an `Arc`.
//! - Every table name is `<table_prefix><convention name>`.

use crate::db::dialect::{SqlDialect, SqliteDialect};
use crate::db::naming::{validate_identifier, DefaultTableNameConvention, TableNameConvention};
use crate::db::{ConnectionFactory, SqliteConnectionFactory};
use crate::error::{StoreError, StoreResult};
use crate::id_generator::{DefaultIdGenerator, IdGenerator};
use crate::model::descriptor::IndexDescriptor;
use crate::model::document::{document_columns, parse_document_row, Document};
use crate::model::entity::{Entity, EntityType};
use crate::model::index::{json_to_sql, IndexRow, ID_COLUMN};
use crate::serializer::{ContentSerializer, JsonContentSerializer};
use crate::session::Session;
use crate::single_flight::SingleFlight;
use log::{error, info, trace};
use rusqlite::{params_from_iter, Connection, TransactionBehavior};
use serde_json::Value;
use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

const DEFAULT_COMMANDS_PAGE_SIZE: usize = 500;

/// Store configuration built with chained `with_*` calls.
///
/// ```ignore
/// let config = StoreConfig::sqlite(path)
///     .with_table_prefix("app_")
///     .with_index(IndexDescriptor::reduce(map_post_stats))
///     .concurrent::<Post>();
/// ```
pub struct StoreConfig {
    connection_factory: Arc<dyn ConnectionFactory>,
    dialect: Arc<dyn SqlDialect>,
    naming: Arc<dyn TableNameConvention>,
    serializer: Arc<dyn ContentSerializer>,
    id_generator: Arc<dyn IdGenerator>,
    table_prefix: String,
    commands_page_size: usize,
    transaction_behavior: TransactionBehavior,
    collections: Vec<String>,
    concurrent_types: HashSet<TypeId>,
    indexes: Vec<IndexDescriptor>,
}

impl StoreConfig {
    /// Configuration with SQLite defaults for every collaborator but the
    /// connection factory.
    pub fn new(connection_factory: impl ConnectionFactory + 'static) -> Self {
        Self {
            connection_factory: Arc::new(connection_factory),
            dialect: Arc::new(SqliteDialect),
            naming: Arc::new(DefaultTableNameConvention),
            serializer: Arc::new(JsonContentSerializer),
            id_generator: Arc::new(DefaultIdGenerator::new()),
            table_prefix: String::new(),
            commands_page_size: DEFAULT_COMMANDS_PAGE_SIZE,
            transaction_behavior: TransactionBehavior::Deferred,
            collections: Vec::new(),
            concurrent_types: HashSet::new(),
            indexes: Vec::new(),
        }
    }

    /// Configuration for one SQLite database file.
    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Self::new(SqliteConnectionFactory::new(path))
    }

    pub fn with_dialect(mut self, dialect: impl SqlDialect + 'static) -> Self {
        self.dialect = Arc::new(dialect);
        self
    }

    pub fn with_table_naming(mut self, naming: impl TableNameConvention + 'static) -> Self {
        self.naming = Arc::new(naming);
        self
    }

    pub fn with_serializer(mut self, serializer: impl ContentSerializer + 'static) -> Self {
        self.serializer = Arc::new(serializer);
        self
    }

    pub fn with_id_generator(mut self, id_generator: impl IdGenerator + 'static) -> Self {
        self.id_generator = Arc::new(id_generator);
        self
    }

    pub fn with_table_prefix(mut self, table_prefix: impl Into<String>) -> Self {
        self.table_prefix = table_prefix.into();
        self
    }

    /// Maximum documents per batched create/delete statement.
    pub fn with_commands_page_size(mut self, commands_page_size: usize) -> Self {
        self.commands_page_size = commands_page_size;
        self
    }

    pub fn with_transaction_behavior(mut self, behavior: TransactionBehavior) -> Self {
        self.transaction_behavior = behavior;
        self
    }

    /// Adds a named collection whose id counter is seeded by
    /// [`Store::initialize`].
    pub fn with_collection(mut self, collection: impl Into<String>) -> Self {
        self.collections.push(collection.into());
        self
    }

    /// Checks concurrency on every update of `T`.
    pub fn concurrent<T: Entity>(mut self) -> Self {
        self.concurrent_types.insert(TypeId::of::<T>());
        self
    }

    pub fn with_index(mut self, descriptor: IndexDescriptor) -> Self {
        self.indexes.push(descriptor);
        self
    }

    pub fn table_prefix(&self) -> &str {
        &self.table_prefix
    }

    pub fn commands_page_size(&self) -> usize {
        self.commands_page_size
    }

    pub fn transaction_behavior(&self) -> TransactionBehavior {
        self.transaction_behavior
    }

    fn validate(&self) -> StoreResult<()> {
        if !self.table_prefix.is_empty() {
            validate_identifier(&self.table_prefix)?;
        }
        if self.commands_page_size == 0 {
            return Err(StoreError::Config(
                "commands_page_size must be at least 1".to_string(),
            ));
        }
        for collection in &self.collections {
            validate_identifier(collection)?;
        }
        for descriptor in &self.indexes {
            descriptor.validate()?;
        }
        Ok(())
    }
}

/// Resolved per-type metadata, filled on first use.
#[derive(Default)]
struct TypeCache {
    entity_types: RwLock<HashMap<TypeId, Arc<EntityType>>>,
}

impl TypeCache {
    fn entity_type<T: Entity>(&self) -> Arc<EntityType> {
        let type_id = TypeId::of::<T>();
        if let Some(entity_type) = self
            .entity_types
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&type_id)
        {
            return Arc::clone(entity_type);
        }

        let mut entity_types = self
            .entity_types
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            entity_types
                .entry(type_id)
                .or_insert_with(|| Arc::new(EntityType::of::<T>())),
        )
    }
}

/// Shared document store. Create with [`Store::open`], then hand out
/// sessions with [`Store::create_session`].
pub struct Store {
    config: StoreConfig,
    types: TypeCache,
    document_reads: SingleFlight<Vec<Document>>,
    reduce_reads: SingleFlight<Option<IndexRow>>,
}

impl Store {
    /// Validates `config` and builds the store. No connection is opened.
    pub fn open(config: StoreConfig) -> StoreResult<Arc<Self>> {
        if let Err(err) = config.validate() {
            error!(
                "event=store_open module=store status=error error_code=invalid_config error={}",
                err
            );
            return Err(err);
        }
        info!(
            "event=store_open module=store status=ok dialect={} table_prefix={} indexes={} page_size={}",
            config.dialect.name(),
            config.table_prefix,
            config.indexes.len(),
            config.commands_page_size
        );

        Ok(Arc::new(Self {
            config,
            types: TypeCache::default(),
            document_reads: SingleFlight::new(),
            reduce_reads: SingleFlight::new(),
        }))
    }

    /// Seeds the id generator for the default collection, every configured
    /// collection and every collection an index is registered in.
    ///
    /// Document tables must already exist, see [`crate::SchemaBuilder`].
    pub fn initialize(&self) -> StoreResult<()> {
        let conn = self.connect()?;
        let mut collections = vec![String::new()];
        collections.extend(self.config.collections.iter().cloned());
        collections.extend(
            self.config
                .indexes
                .iter()
                .map(|descriptor| descriptor.collection().to_string()),
        );

        let mut seen = HashSet::new();
        for collection in collections {
            if !seen.insert(collection.clone()) {
                continue;
            }
            self.config.id_generator.initialize_collection(
                &conn,
                self.dialect(),
                &collection,
                &self.document_table(&collection),
            )?;
        }
        info!(
            "event=store_initialize module=store status=ok collections={}",
            seen.len()
        );
        Ok(())
    }

    /// Opens a new connection through the configured factory.
    pub fn connect(&self) -> StoreResult<Connection> {
        self.config.connection_factory.create_connection()
    }

    pub fn create_session(self: &Arc<Self>) -> Session {
        Session::new(Arc::clone(self))
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn dialect(&self) -> &dyn SqlDialect {
        self.config.dialect.as_ref()
    }

    pub fn document_table(&self, collection: &str) -> String {
        format!(
            "{}{}",
            self.config.table_prefix,
            self.config.naming.document_table(collection)
        )
    }

    pub fn index_table(&self, index_type: &str, collection: &str) -> String {
        format!(
            "{}{}",
            self.config.table_prefix,
            self.config.naming.index_table(index_type, collection)
        )
    }

    pub fn bridge_table(&self, index_type: &str, collection: &str) -> String {
        format!(
            "{}{}",
            self.config.table_prefix,
            self.config.naming.bridge_table(index_type, collection)
        )
    }

    pub(crate) fn serializer(&self) -> &dyn ContentSerializer {
        self.config.serializer.as_ref()
    }

    pub(crate) fn next_id(&self, collection: &str) -> StoreResult<i64> {
        self.config.id_generator.next_id(collection)
    }

    pub(crate) fn entity_type<T: Entity>(&self) -> Arc<EntityType> {
        self.types.entity_type::<T>()
    }

    pub(crate) fn is_concurrent(&self, type_id: TypeId) -> bool {
        self.config.concurrent_types.contains(&type_id)
    }

    /// Store-level descriptors for one entity type and collection.
    pub(crate) fn descriptors(&self, type_id: TypeId, collection: &str) -> Vec<IndexDescriptor> {
        self.config
            .indexes
            .iter()
            .filter(|descriptor| descriptor.applies_to(type_id, collection))
            .cloned()
            .collect()
    }

    /// Loads documents by id, in no particular order.
    pub(crate) fn read_documents(
        &self,
        conn: &Connection,
        collection: &str,
        ids: &[i64],
    ) -> StoreResult<Vec<Document>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let dialect = self.dialect();
        let table = self.document_table(collection);
        let sql = format!(
            "SELECT {} FROM {} WHERE {} {};",
            document_columns(dialect),
            dialect.quote_for_table_name(&table),
            dialect.quote_for_column_name(ID_COLUMN),
            dialect.in_operator(ids.len())
        );
        let key = format!("read_documents|{table}|{ids:?}");

        self.document_reads.run(key, || {
            trace!("event=sql module=store sql={}", sql);
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params_from_iter(ids.iter()))?;
            let mut documents = Vec::new();
            while let Some(row) = rows.next()? {
                documents.push(parse_document_row(row)?);
            }
            Ok(documents)
        })
    }

    /// Loads the persisted reduce row for one group-key value.
    pub(crate) fn read_reduced(
        &self,
        conn: &Connection,
        descriptor: &IndexDescriptor,
        group_key: &str,
        group_value: &Value,
    ) -> StoreResult<Option<IndexRow>> {
        let dialect = self.dialect();
        let index_type = descriptor.index_type();
        let table = self.index_table(index_type, descriptor.collection());
        let sql = format!(
            "SELECT * FROM {} WHERE {} = ? LIMIT 1;",
            dialect.quote_for_table_name(&table),
            dialect.quote_for_column_name(group_key)
        );
        let parameter = json_to_sql(group_key, group_value)?;
        let key = format!("read_reduced|{table}|{group_key}={group_value}");

        self.reduce_reads.run(key, || {
            trace!("event=sql module=store sql={}", sql);
            let mut stmt = conn.prepare(&sql)?;
            let column_names = stmt
                .column_names()
                .into_iter()
                .map(str::to_string)
                .collect::<Vec<_>>();
            let mut rows = stmt.query([parameter])?;
            match rows.next()? {
                Some(row) => Ok(Some(IndexRow::from_sql_row(
                    index_type,
                    row,
                    &column_names,
                )?)),
                None => Ok(None),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{Store, StoreConfig};
    use crate::error::StoreError;

    #[test]
    fn table_names_carry_prefix() {
        let store = Store::open(StoreConfig::sqlite("unused.db").with_table_prefix("app_")).unwrap();
        assert_eq!(store.document_table(""), "app_Document");
        assert_eq!(store.index_table("PostStats", "Drafts"), "app_Drafts_PostStats");
        assert_eq!(
            store.bridge_table("PostStats", ""),
            "app_PostStats_Document"
        );
    }

    #[test]
    fn invalid_configuration_is_rejected() {
        let err = Store::open(StoreConfig::sqlite("unused.db").with_commands_page_size(0))
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::Config(_)));

        let err = Store::open(StoreConfig::sqlite("unused.db").with_table_prefix("bad-prefix"))
            .err()
            .unwrap();
        assert!(matches!(err, StoreError::Config(_)));
    }
}
