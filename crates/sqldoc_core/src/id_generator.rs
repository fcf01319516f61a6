//! Document id generation contract.
//!
//! # Invariants
//! - Ids are positive and strictly increasing per collection within one
//!   process.
//! - A collection is seeded from the highest persisted id before use;
//!   allocating in an unseeded collection is a configuration error.

use crate::db::dialect::SqlDialect;
use crate::error::{StoreError, StoreResult};
use log::debug;
use rusqlite::Connection;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Allocates document ids per collection.
pub trait IdGenerator: Send + Sync {
    /// Seeds `collection` from its (prefixed, unquoted) document table.
    fn initialize_collection(
        &self,
        conn: &Connection,
        dialect: &dyn SqlDialect,
        collection: &str,
        document_table: &str,
    ) -> StoreResult<()>;

    fn next_id(&self, collection: &str) -> StoreResult<i64>;
}

/// In-process counters seeded from `MAX(Id)`.
#[derive(Debug, Default)]
pub struct DefaultIdGenerator {
    seeds: Mutex<HashMap<String, i64>>,
}

impl DefaultIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for DefaultIdGenerator {
    fn initialize_collection(
        &self,
        conn: &Connection,
        dialect: &dyn SqlDialect,
        collection: &str,
        document_table: &str,
    ) -> StoreResult<()> {
        let sql = format!(
            "SELECT MAX({}) FROM {};",
            dialect.quote_for_column_name("Id"),
            dialect.quote_for_table_name(document_table)
        );
        let max_id: Option<i64> = conn.query_row(&sql, [], |row| row.get(0))?;
        let seed = max_id.unwrap_or(0);

        let mut seeds = self.seeds.lock().unwrap_or_else(PoisonError::into_inner);
        let current = seeds.entry(collection.to_string()).or_insert(0);
        *current = (*current).max(seed);
        debug!(
            "event=id_seed module=id_generator status=ok collection={} seed={}",
            collection, *current
        );
        Ok(())
    }

    fn next_id(&self, collection: &str) -> StoreResult<i64> {
        let mut seeds = self.seeds.lock().unwrap_or_else(PoisonError::into_inner);
        let current = seeds.get_mut(collection).ok_or_else(|| {
            StoreError::Config(format!(
                "collection `{collection}` was not initialized; register it with `with_collection`"
            ))
        })?;
        *current += 1;
        Ok(*current)
    }
}
