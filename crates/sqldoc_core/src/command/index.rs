//! Index and bridge table statements.

use super::{CommandContext, IndexLinks};
use crate::db::naming::bridge_index_column;
use crate::error::StoreResult;
use crate::model::index::{IndexRow, DOCUMENT_ID_COLUMN, ID_COLUMN};
use log::trace;
use rusqlite::params_from_iter;
use rusqlite::types::Value as SqlValue;

pub(super) fn delete_map_index(
    ctx: &CommandContext<'_>,
    collection: &str,
    index_type: &str,
    document_ids: &[i64],
) -> StoreResult<()> {
    if document_ids.is_empty() {
        return Ok(());
    }
    let dialect = ctx.store.dialect();
    let table = ctx.store.index_table(index_type, collection);
    let sql = format!(
        "DELETE FROM {} WHERE {} {};",
        dialect.quote_for_table_name(&table),
        dialect.quote_for_column_name(DOCUMENT_ID_COLUMN),
        dialect.in_operator(document_ids.len())
    );

    trace!("event=sql module=command sql={}", sql);
    ctx.conn.execute(&sql, params_from_iter(document_ids.iter()))?;
    Ok(())
}

/// Removes a reduce row and all of its bridge links.
pub(super) fn delete_reduce_index(
    ctx: &CommandContext<'_>,
    collection: &str,
    index_type: &str,
    index_id: i64,
) -> StoreResult<()> {
    let dialect = ctx.store.dialect();
    let table = ctx.store.index_table(index_type, collection);
    let bridge = ctx.store.bridge_table(index_type, collection);

    let bridge_sql = format!(
        "DELETE FROM {} WHERE {} = ?;",
        dialect.quote_for_table_name(&bridge),
        dialect.quote_for_column_name(&bridge_index_column(index_type))
    );
    trace!("event=sql module=command sql={}", bridge_sql);
    ctx.conn.execute(&bridge_sql, [index_id])?;

    let sql = format!(
        "DELETE FROM {} WHERE {} = ?;",
        dialect.quote_for_table_name(&table),
        dialect.quote_for_column_name(ID_COLUMN)
    );
    trace!("event=sql module=command sql={}", sql);
    ctx.conn.execute(&sql, [index_id])?;
    Ok(())
}

pub(super) fn create_index(
    ctx: &CommandContext<'_>,
    collection: &str,
    row: &IndexRow,
    links: &IndexLinks,
) -> StoreResult<()> {
    let dialect = ctx.store.dialect();
    let index_type = row.index_type();
    let table = ctx.store.index_table(index_type, collection);

    let mut columns = Vec::new();
    let mut values = Vec::new();
    if let IndexLinks::Document(document_id) = links {
        columns.push(dialect.quote_for_column_name(DOCUMENT_ID_COLUMN));
        values.push(SqlValue::Integer(*document_id));
    }
    for (column, value) in row.sql_values()? {
        columns.push(dialect.quote_for_column_name(column));
        values.push(value);
    }

    let table_q = dialect.quote_for_table_name(&table);
    let sql = if columns.is_empty() {
        format!("INSERT INTO {table_q} DEFAULT VALUES;")
    } else {
        format!(
            "INSERT INTO {table_q} ({}) VALUES ({});",
            columns.join(", "),
            vec!["?"; values.len()].join(", ")
        )
    };
    trace!("event=sql module=command sql={}", sql);
    ctx.conn.execute(&sql, params_from_iter(values))?;

    if let IndexLinks::Bridge(document_ids) = links {
        let index_id = ctx.conn.last_insert_rowid();
        add_links(ctx, collection, index_type, index_id, document_ids)?;
    }
    Ok(())
}

/// Rewrites a persisted reduce row in place and applies the net bridge
/// changes.
pub(super) fn update_index(
    ctx: &CommandContext<'_>,
    collection: &str,
    row: &IndexRow,
    added: &[i64],
    removed: &[i64],
) -> StoreResult<()> {
    let dialect = ctx.store.dialect();
    let index_type = row.index_type();
    let table = ctx.store.index_table(index_type, collection);

    let sql_values = row.sql_values()?;
    if !sql_values.is_empty() {
        let assignments = sql_values
            .iter()
            .map(|(column, _)| format!("{} = ?", dialect.quote_for_column_name(column)))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE {} SET {assignments} WHERE {} = ?;",
            dialect.quote_for_table_name(&table),
            dialect.quote_for_column_name(ID_COLUMN)
        );
        let mut values = sql_values
            .into_iter()
            .map(|(_, value)| value)
            .collect::<Vec<_>>();
        values.push(SqlValue::Integer(row.id()));

        trace!("event=sql module=command sql={}", sql);
        ctx.conn.execute(&sql, params_from_iter(values))?;
    }

    add_links(ctx, collection, index_type, row.id(), added)?;
    remove_links(ctx, collection, index_type, row.id(), removed)
}

fn add_links(
    ctx: &CommandContext<'_>,
    collection: &str,
    index_type: &str,
    index_id: i64,
    document_ids: &[i64],
) -> StoreResult<()> {
    if document_ids.is_empty() {
        return Ok(());
    }
    let dialect = ctx.store.dialect();
    let bridge = ctx.store.bridge_table(index_type, collection);
    let sql = format!(
        "INSERT INTO {} ({}, {}) VALUES (?, ?);",
        dialect.quote_for_table_name(&bridge),
        dialect.quote_for_column_name(&bridge_index_column(index_type)),
        dialect.quote_for_column_name(DOCUMENT_ID_COLUMN)
    );

    trace!("event=sql module=command sql={}", sql);
    let mut stmt = ctx.conn.prepare_cached(&sql)?;
    for document_id in document_ids {
        stmt.execute([index_id, *document_id])?;
    }
    Ok(())
}

fn remove_links(
    ctx: &CommandContext<'_>,
    collection: &str,
    index_type: &str,
    index_id: i64,
    document_ids: &[i64],
) -> StoreResult<()> {
    if document_ids.is_empty() {
        return Ok(());
    }
    let dialect = ctx.store.dialect();
    let bridge = ctx.store.bridge_table(index_type, collection);
    let sql = format!(
        "DELETE FROM {} WHERE {} = ? AND {} {};",
        dialect.quote_for_table_name(&bridge),
        dialect.quote_for_column_name(&bridge_index_column(index_type)),
        dialect.quote_for_column_name(DOCUMENT_ID_COLUMN),
        dialect.in_operator(document_ids.len())
    );

    let mut values = Vec::with_capacity(document_ids.len() + 1);
    values.push(index_id);
    values.extend_from_slice(document_ids);

    trace!("event=sql module=command sql={}", sql);
    ctx.conn.execute(&sql, params_from_iter(values))?;
    Ok(())
}
