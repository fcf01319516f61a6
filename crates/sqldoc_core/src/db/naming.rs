//! Table naming convention and identifier validation.

use crate::error::{StoreError, StoreResult};
use once_cell::sync::Lazy;
use regex::Regex;

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid identifier regex"));

/// Rejects names that cannot be used as table, column or collection names.
pub fn validate_identifier(name: &str) -> StoreResult<()> {
    if IDENTIFIER_RE.is_match(name) {
        Ok(())
    } else {
        Err(StoreError::Config(format!("`{name}` is not a valid identifier")))
    }
}

/// Maps collections and index types to unprefixed table names.
///
/// The empty collection is the default one.
pub trait TableNameConvention: Send + Sync {
    fn document_table(&self, collection: &str) -> String;

    fn index_table(&self, index_type: &str, collection: &str) -> String;

    /// Many-to-many table between a reduce index and the document table.
    fn bridge_table(&self, index_type: &str, collection: &str) -> String {
        format!(
            "{}_{}",
            self.index_table(index_type, collection),
            self.document_table(collection)
        )
    }
}

/// `Document` / `<collection>_Document` and `<IndexType>` /
/// `<collection>_<IndexType>`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTableNameConvention;

impl TableNameConvention for DefaultTableNameConvention {
    fn document_table(&self, collection: &str) -> String {
        if collection.is_empty() {
            "Document".to_string()
        } else {
            format!("{collection}_Document")
        }
    }

    fn index_table(&self, index_type: &str, collection: &str) -> String {
        if collection.is_empty() {
            index_type.to_string()
        } else {
            format!("{collection}_{index_type}")
        }
    }
}

/// Bridge column holding the reduce row id.
pub(crate) fn bridge_index_column(index_type: &str) -> String {
    format!("{index_type}Id")
}
