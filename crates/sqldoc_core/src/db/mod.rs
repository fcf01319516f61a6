//! SQL-engine collaborators consumed by the store.
//!
//! # Responsibility
//! - Open and configure connections.
//! - Provide dialect fragments and table naming.
//! - Create document/index/bridge tables.
//!
//! # Invariants
//! - Sessions never share a connection; each gets one from the factory.
//! - Every table name passes through the naming convention and table prefix.

pub mod dialect;
pub mod naming;
mod open;
pub mod schema;

pub use dialect::{ColumnType, SqlDialect, SqliteDialect};
pub use naming::{validate_identifier, DefaultTableNameConvention, TableNameConvention};
pub use open::{open_connection, ConnectionFactory, SqliteConnectionFactory};
pub use schema::{Column, SchemaBuilder};
