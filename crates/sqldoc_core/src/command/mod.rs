//! Deferred mutations queued by a session flush.
//!
//! # Responsibility
//! - Represent every write a flush performs as a typed command.
//! - Coalesce same-kind document/map-index commands into page-bounded
//!   batches.
//! - Execute in the fixed dependency order.
//!
//! # Invariants
//! - Execution is a stable sort by [`Command::execution_order`]: documents
//!   exist before index rows reference them, and index rows referencing a
//!   document are gone before the document row is deleted.
//! - A write rejected because the transaction's snapshot is stale is a
//!   concurrency conflict when the batch holds a version-checked update.

mod document;
mod index;

use crate::error::{StoreError, StoreResult};
use crate::model::document::Document;
use crate::model::index::IndexRow;
use crate::store::Store;
use log::trace;
use rusqlite::{ffi, Connection};

/// Store and connection a command runs against.
pub(crate) struct CommandContext<'a> {
    pub(crate) store: &'a Store,
    pub(crate) conn: &'a Connection,
}

/// How a created index row is linked to documents.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum IndexLinks {
    /// Map index row owned by one document.
    Document(i64),
    /// Reduce index row linked through the bridge table.
    Bridge(Vec<i64>),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Command {
    CreateDocument {
        collection: String,
        documents: Vec<Document>,
    },
    UpdateDocument {
        collection: String,
        document: Document,
        /// Required prior version of a concurrency-checked update.
        expected_version: Option<i64>,
    },
    DeleteDocument {
        collection: String,
        document_ids: Vec<i64>,
    },
    DeleteMapIndex {
        collection: String,
        index_type: &'static str,
        document_ids: Vec<i64>,
    },
    DeleteReduceIndex {
        collection: String,
        index_type: &'static str,
        index_id: i64,
    },
    CreateIndex {
        collection: String,
        row: IndexRow,
        links: IndexLinks,
    },
    UpdateIndex {
        collection: String,
        row: IndexRow,
        added: Vec<i64>,
        removed: Vec<i64>,
    },
}

impl Command {
    pub(crate) fn execution_order(&self) -> u8 {
        match self {
            Self::CreateDocument { .. } => 0,
            Self::DeleteMapIndex { .. } | Self::DeleteReduceIndex { .. } => 1,
            Self::UpdateDocument { .. } => 2,
            Self::CreateIndex { .. } => 3,
            Self::UpdateIndex { .. } => 4,
            Self::DeleteDocument { .. } => 5,
        }
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Self::CreateDocument { .. } => "create_document",
            Self::UpdateDocument { .. } => "update_document",
            Self::DeleteDocument { .. } => "delete_document",
            Self::DeleteMapIndex { .. } => "delete_map_index",
            Self::DeleteReduceIndex { .. } => "delete_reduce_index",
            Self::CreateIndex { .. } => "create_index",
            Self::UpdateIndex { .. } => "update_index",
        }
    }

    pub(crate) fn execute(&self, ctx: &CommandContext<'_>) -> StoreResult<()> {
        trace!(
            "event=command_execute module=command status=start kind={}",
            self.kind()
        );
        match self {
            Self::CreateDocument {
                collection,
                documents,
            } => document::create_documents(ctx, collection, documents),
            Self::UpdateDocument {
                collection,
                document,
                expected_version,
            } => document::update_document(ctx, collection, document, *expected_version),
            Self::DeleteDocument {
                collection,
                document_ids,
            } => document::delete_documents(ctx, collection, document_ids),
            Self::DeleteMapIndex {
                collection,
                index_type,
                document_ids,
            } => index::delete_map_index(ctx, collection, index_type, document_ids),
            Self::DeleteReduceIndex {
                collection,
                index_type,
                index_id,
            } => index::delete_reduce_index(ctx, collection, index_type, *index_id),
            Self::CreateIndex {
                collection,
                row,
                links,
            } => index::create_index(ctx, collection, row, links),
            Self::UpdateIndex {
                collection,
                row,
                added,
                removed,
            } => index::update_index(ctx, collection, row, added, removed),
        }
    }
}

/// Coalesces document creations, document deletions and map index deletions
/// into batches of at most `page_size` documents per collection (and index
/// type). Other commands keep their relative order.
pub(crate) fn batch_commands(commands: Vec<Command>, page_size: usize) -> Vec<Command> {
    let page_size = page_size.max(1);
    let mut batched = Vec::with_capacity(commands.len());
    let mut creates: Vec<(String, Vec<Document>)> = Vec::new();
    let mut deletes: Vec<(String, Vec<i64>)> = Vec::new();
    let mut map_deletes: Vec<((String, &'static str), Vec<i64>)> = Vec::new();

    for command in commands {
        match command {
            Command::CreateDocument {
                collection,
                documents,
            } => group_into(&mut creates, collection, documents),
            Command::DeleteDocument {
                collection,
                document_ids,
            } => group_into(&mut deletes, collection, document_ids),
            Command::DeleteMapIndex {
                collection,
                index_type,
                document_ids,
            } => group_into(&mut map_deletes, (collection, index_type), document_ids),
            other => batched.push(other),
        }
    }

    for (collection, documents) in creates {
        for page in documents.chunks(page_size) {
            batched.push(Command::CreateDocument {
                collection: collection.clone(),
                documents: page.to_vec(),
            });
        }
    }
    for (collection, document_ids) in deletes {
        for page in document_ids.chunks(page_size) {
            batched.push(Command::DeleteDocument {
                collection: collection.clone(),
                document_ids: page.to_vec(),
            });
        }
    }
    for ((collection, index_type), document_ids) in map_deletes {
        for page in document_ids.chunks(page_size) {
            batched.push(Command::DeleteMapIndex {
                collection: collection.clone(),
                index_type,
                document_ids: page.to_vec(),
            });
        }
    }

    batched
}

fn group_into<K: PartialEq, V>(groups: &mut Vec<(K, Vec<V>)>, key: K, values: Vec<V>) {
    match groups.iter_mut().find(|(existing, _)| *existing == key) {
        Some((_, group)) => group.extend(values),
        None => groups.push((key, values)),
    }
}

/// Executes commands in execution order; returns how many ran.
pub(crate) fn execute_all(mut commands: Vec<Command>, ctx: &CommandContext<'_>) -> StoreResult<usize> {
    commands.sort_by_key(Command::execution_order);
    for command in &commands {
        if let Err(err) = command.execute(ctx) {
            return Err(stale_snapshot_conflict(err, &commands));
        }
    }
    Ok(commands.len())
}

/// Reports `SQLITE_BUSY_SNAPSHOT` as a conflict on the first version-checked
/// document update of the batch. Other errors pass through unchanged.
fn stale_snapshot_conflict(err: StoreError, commands: &[Command]) -> StoreError {
    let stale = matches!(
        &err,
        StoreError::Db(rusqlite::Error::SqliteFailure(failure, _))
            if failure.extended_code == ffi::SQLITE_BUSY_SNAPSHOT
    );
    if !stale {
        return err;
    }

    let conflict = commands.iter().find_map(|command| match command {
        Command::UpdateDocument {
            document,
            expected_version: Some(expected_version),
            ..
        } => Some(StoreError::ConcurrencyConflict {
            document_id: document.id,
            expected_version: *expected_version,
        }),
        _ => None,
    });
    conflict.unwrap_or(err)
}
