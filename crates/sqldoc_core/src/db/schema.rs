//! DDL for document, index and bridge tables.
//!
//! # Responsibility
//! - Create the physical tables the session engine reads and writes.
//!
//! # Invariants
//! - Every statement is idempotent (`IF NOT EXISTS`).
//! - Index rows reference documents through foreign keys, which is what the
//!   command execution order relies on.

use crate::db::dialect::{ColumnType, SqlDialect};
use crate::db::naming::{bridge_index_column, validate_identifier};
use crate::error::StoreResult;
use crate::model::index::{DOCUMENT_ID_COLUMN, ID_COLUMN};
use crate::store::Store;
use log::info;
use rusqlite::Connection;

/// Data column of an index table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub column_type: ColumnType,
}

impl Column {
    pub const fn integer(name: &'static str) -> Self {
        Self {
            name,
            column_type: ColumnType::Integer,
        }
    }

    pub const fn real(name: &'static str) -> Self {
        Self {
            name,
            column_type: ColumnType::Real,
        }
    }

    pub const fn text(name: &'static str) -> Self {
        Self {
            name,
            column_type: ColumnType::Text,
        }
    }
}

/// Creates tables for one store on one connection.
pub struct SchemaBuilder<'a> {
    store: &'a Store,
    conn: &'a Connection,
}

impl<'a> SchemaBuilder<'a> {
    pub fn new(store: &'a Store, conn: &'a Connection) -> Self {
        Self { store, conn }
    }

    fn dialect(&self) -> &dyn SqlDialect {
        self.store.dialect()
    }

    pub fn create_document_table(&self, collection: &str) -> StoreResult<()> {
        let dialect = self.dialect();
        let table = self.store.document_table(collection);
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {table_q} (
                {id} INTEGER PRIMARY KEY,
                {ty} TEXT NOT NULL,
                {content} TEXT NOT NULL,
                {version} INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS {index_q} ON {table_q} ({ty});",
            table_q = dialect.quote_for_table_name(&table),
            index_q = dialect.quote_for_table_name(&format!("IDX_{table}_Type")),
            id = dialect.quote_for_column_name(ID_COLUMN),
            ty = dialect.quote_for_column_name("Type"),
            content = dialect.quote_for_column_name("Content"),
            version = dialect.quote_for_column_name("Version"),
        );
        self.conn.execute_batch(&sql)?;
        info!("event=schema_create module=db status=ok table={table}");
        Ok(())
    }

    /// Creates a map index table with a `DocumentId` link.
    pub fn create_map_index_table(
        &self,
        index_type: &str,
        collection: &str,
        columns: &[Column],
    ) -> StoreResult<()> {
        validate_identifier(index_type)?;
        let dialect = self.dialect();
        let table = self.store.index_table(index_type, collection);
        let document_table = self.store.document_table(collection);
        let document_id = dialect.quote_for_column_name(DOCUMENT_ID_COLUMN);

        let mut definitions = vec![
            format!(
                "{} {}",
                dialect.quote_for_column_name(ID_COLUMN),
                dialect.identity_column()
            ),
            format!(
                "{document_id} INTEGER NOT NULL REFERENCES {}({})",
                dialect.quote_for_table_name(&document_table),
                dialect.quote_for_column_name(ID_COLUMN)
            ),
        ];
        definitions.extend(self.column_definitions(columns)?);

        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {table_q} ({});
            CREATE INDEX IF NOT EXISTS {index_q} ON {table_q} ({document_id});",
            definitions.join(", "),
            table_q = dialect.quote_for_table_name(&table),
            index_q = dialect.quote_for_table_name(&format!("IDX_FK_{table}")),
        );
        self.conn.execute_batch(&sql)?;
        info!("event=schema_create module=db status=ok table={table} kind=map");
        Ok(())
    }

    /// Creates a reduce index table and its bridge table.
    pub fn create_reduce_index_table(
        &self,
        index_type: &str,
        collection: &str,
        columns: &[Column],
    ) -> StoreResult<()> {
        validate_identifier(index_type)?;
        let dialect = self.dialect();
        let table = self.store.index_table(index_type, collection);
        let bridge = self.store.bridge_table(index_type, collection);
        let document_table = self.store.document_table(collection);
        let id = dialect.quote_for_column_name(ID_COLUMN);
        let index_id = dialect.quote_for_column_name(&bridge_index_column(index_type));
        let document_id = dialect.quote_for_column_name(DOCUMENT_ID_COLUMN);

        let mut definitions = vec![format!("{id} {}", dialect.identity_column())];
        definitions.extend(self.column_definitions(columns)?);

        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {table_q} ({definitions});
            CREATE TABLE IF NOT EXISTS {bridge_q} (
                {index_id} INTEGER NOT NULL REFERENCES {table_q}({id}),
                {document_id} INTEGER NOT NULL REFERENCES {document_q}({id})
            );
            CREATE INDEX IF NOT EXISTS {bridge_index_q} ON {bridge_q} ({index_id});
            CREATE INDEX IF NOT EXISTS {bridge_document_q} ON {bridge_q} ({document_id});",
            definitions = definitions.join(", "),
            table_q = dialect.quote_for_table_name(&table),
            bridge_q = dialect.quote_for_table_name(&bridge),
            document_q = dialect.quote_for_table_name(&document_table),
            bridge_index_q = dialect.quote_for_table_name(&format!("IDX_FK_{bridge}_Index")),
            bridge_document_q =
                dialect.quote_for_table_name(&format!("IDX_FK_{bridge}_Document")),
        );
        self.conn.execute_batch(&sql)?;
        info!("event=schema_create module=db status=ok table={table} kind=reduce bridge={bridge}");
        Ok(())
    }

    fn column_definitions(&self, columns: &[Column]) -> StoreResult<Vec<String>> {
        let dialect = self.dialect();
        columns
            .iter()
            .map(|column| {
                validate_identifier(column.name)?;
                Ok(format!(
                    "{} {}",
                    dialect.quote_for_column_name(column.name),
                    dialect.column_type(column.column_type)
                ))
            })
            .collect()
    }
}
