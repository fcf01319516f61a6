//! SQL dialect contract and the SQLite implementation.

/// Column storage class used by schema generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Integer,
    Real,
    Text,
}

/// Dialect-specific SQL fragments consumed by commands and queries.
pub trait SqlDialect: Send + Sync {
    fn name(&self) -> &'static str;

    fn quote_for_table_name(&self, name: &str) -> String;

    fn quote_for_column_name(&self, name: &str) -> String;

    /// Returns `IN (...)` with one positional parameter per value.
    fn in_operator(&self, parameter_count: usize) -> String;

    /// Appends a pagination clause; parameters are bound by the caller in
    /// the order returned (limit first, then offset).
    fn page(&self, sql: &mut String);

    fn column_type(&self, column_type: ColumnType) -> &'static str;

    /// Column definition of a generated row id.
    fn identity_column(&self) -> &'static str;
}

/// SQLite dialect: double-quoted identifiers, `LIMIT ? OFFSET ?`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl SqlDialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn quote_for_table_name(&self, name: &str) -> String {
        quote(name)
    }

    fn quote_for_column_name(&self, name: &str) -> String {
        quote(name)
    }

    fn in_operator(&self, parameter_count: usize) -> String {
        let placeholders = vec!["?"; parameter_count.max(1)].join(", ");
        format!("IN ({placeholders})")
    }

    fn page(&self, sql: &mut String) {
        sql.push_str(" LIMIT ? OFFSET ?");
    }

    fn column_type(&self, column_type: ColumnType) -> &'static str {
        match column_type {
            ColumnType::Integer => "INTEGER",
            ColumnType::Real => "REAL",
            ColumnType::Text => "TEXT",
        }
    }

    fn identity_column(&self) -> &'static str {
        "INTEGER PRIMARY KEY AUTOINCREMENT"
    }
}

fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::{SqlDialect, SqliteDialect};

    #[test]
    fn quotes_and_escapes_identifiers() {
        let dialect = SqliteDialect;
        assert_eq!(dialect.quote_for_table_name("Document"), "\"Document\"");
        assert_eq!(dialect.quote_for_column_name("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn in_operator_has_one_placeholder_per_value() {
        assert_eq!(SqliteDialect.in_operator(3), "IN (?, ?, ?)");
    }
}
