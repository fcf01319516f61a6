//! Session-based document store with map/reduce secondary indexes over
//! SQLite.
//!
//! Objects are persisted as serialized documents. Index descriptors map each
//! document to typed index rows; reduce indexes aggregate rows that share a
//! group key into one persisted row.

mod command;
pub mod db;
pub mod error;
pub mod id_generator;
pub mod logging;
pub mod model;
pub mod serializer;
pub mod session;
mod single_flight;
pub mod store;

pub use db::{
    open_connection, Column, ColumnType, ConnectionFactory, DefaultTableNameConvention,
    SchemaBuilder, SqlDialect, SqliteConnectionFactory, SqliteDialect, TableNameConvention,
};
pub use error::{StoreError, StoreResult};
pub use id_generator::{DefaultIdGenerator, IdGenerator};
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::descriptor::IndexDescriptor;
pub use model::document::Document;
pub use model::entity::{handle, Accessor, Entity, EntityType, Handle};
pub use model::index::{Index, IndexRow, ReduceIndex};
pub use rusqlite::TransactionBehavior;
pub use serializer::{ContentSerializer, JsonContentSerializer};
pub use session::{ImportOptions, SaveOptions, Session};
pub use store::{Store, StoreConfig};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
