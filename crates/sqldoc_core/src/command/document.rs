//! Document table statements.

use super::CommandContext;
use crate::error::{StoreError, StoreResult};
use crate::model::document::Document;
use crate::model::index::ID_COLUMN;
use log::trace;
use rusqlite::params_from_iter;
use rusqlite::types::Value as SqlValue;

pub(super) fn create_documents(
    ctx: &CommandContext<'_>,
    collection: &str,
    documents: &[Document],
) -> StoreResult<()> {
    if documents.is_empty() {
        return Ok(());
    }
    let dialect = ctx.store.dialect();
    let table = ctx.store.document_table(collection);
    let rows = vec!["(?, ?, ?, ?)"; documents.len()].join(", ");
    let sql = format!(
        "INSERT INTO {} ({}, {}, {}, {}) VALUES {rows};",
        dialect.quote_for_table_name(&table),
        dialect.quote_for_column_name(ID_COLUMN),
        dialect.quote_for_column_name("Type"),
        dialect.quote_for_column_name("Content"),
        dialect.quote_for_column_name("Version"),
    );

    let mut values = Vec::with_capacity(documents.len() * 4);
    for document in documents {
        values.push(SqlValue::Integer(document.id));
        values.push(SqlValue::Text(document.type_name.clone()));
        values.push(SqlValue::Text(document.content.clone()));
        values.push(SqlValue::Integer(document.version));
    }

    trace!("event=sql module=command sql={}", sql);
    ctx.conn.execute(&sql, params_from_iter(values))?;
    Ok(())
}

/// Rewrites content and version. With `expected_version`, a row at any
/// other version is a concurrency conflict.
pub(super) fn update_document(
    ctx: &CommandContext<'_>,
    collection: &str,
    document: &Document,
    expected_version: Option<i64>,
) -> StoreResult<()> {
    let dialect = ctx.store.dialect();
    let table = ctx.store.document_table(collection);
    let id = dialect.quote_for_column_name(ID_COLUMN);
    let version = dialect.quote_for_column_name("Version");
    let mut sql = format!(
        "UPDATE {} SET {} = ?, {version} = ? WHERE {id} = ?",
        dialect.quote_for_table_name(&table),
        dialect.quote_for_column_name("Content"),
    );
    let mut values = vec![
        SqlValue::Text(document.content.clone()),
        SqlValue::Integer(document.version),
        SqlValue::Integer(document.id),
    ];
    if let Some(expected) = expected_version {
        sql.push_str(&format!(" AND {version} = ?"));
        values.push(SqlValue::Integer(expected));
    }
    sql.push(';');

    trace!("event=sql module=command sql={}", sql);
    let affected = ctx.conn.execute(&sql, params_from_iter(values))?;
    if let Some(expected) = expected_version {
        if affected == 0 {
            return Err(StoreError::ConcurrencyConflict {
                document_id: document.id,
                expected_version: expected,
            });
        }
    }
    Ok(())
}

pub(super) fn delete_documents(
    ctx: &CommandContext<'_>,
    collection: &str,
    document_ids: &[i64],
) -> StoreResult<()> {
    if document_ids.is_empty() {
        return Ok(());
    }
    let dialect = ctx.store.dialect();
    let table = ctx.store.document_table(collection);
    let sql = format!(
        "DELETE FROM {} WHERE {} {};",
        dialect.quote_for_table_name(&table),
        dialect.quote_for_column_name(ID_COLUMN),
        dialect.in_operator(document_ids.len())
    );

    trace!("event=sql module=command sql={}", sql);
    ctx.conn.execute(&sql, params_from_iter(document_ids.iter()))?;
    Ok(())
}
