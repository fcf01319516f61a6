//! Physical document row.

use crate::db::dialect::SqlDialect;
use crate::error::StoreResult;
use rusqlite::Row;

const DOCUMENT_COLUMN_NAMES: [&str; 4] = ["Id", "Type", "Content", "Version"];

/// One persisted object: serialized content plus type name and version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub id: i64,
    /// Entity type name, see [`crate::Entity::TYPE_NAME`].
    pub type_name: String,
    /// Output of the configured content serializer.
    pub content: String,
    /// Starts at 1; bumped on every concurrency-checked update.
    pub version: i64,
}

pub(crate) fn parse_document_row(row: &Row<'_>) -> StoreResult<Document> {
    Ok(Document {
        id: row.get(0)?,
        type_name: row.get(1)?,
        content: row.get(2)?,
        version: row.get(3)?,
    })
}

/// Quoted column list in the order expected by [`parse_document_row`].
pub(crate) fn document_columns(dialect: &dyn SqlDialect) -> String {
    DOCUMENT_COLUMN_NAMES
        .iter()
        .map(|column| dialect.quote_for_column_name(column))
        .collect::<Vec<_>>()
        .join(", ")
}
