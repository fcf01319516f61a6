//! Index value contracts and their row representation.
//!
//! # Responsibility
//! - Define the traits user index types implement.
//! - Convert typed index values to and from flat column rows.
//!
//! # Invariants
//! - Rows only hold scalar JSON values (number, string, bool, null).
//! - Column names are plain identifiers; `DocumentId` is reserved.
//! - The `Id` field of a value is the row id and never a data column.

use crate::db::naming::validate_identifier;
use crate::error::{StoreError, StoreResult};
use rusqlite::types::{Value as SqlValue, ValueRef};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Number, Value};

pub(crate) const ID_COLUMN: &str = "Id";
pub(crate) const DOCUMENT_ID_COLUMN: &str = "DocumentId";

/// A secondary index value stored in its own table.
///
/// `INDEX_TYPE` is the base table name; serialized fields are the columns.
pub trait Index: Serialize + DeserializeOwned + 'static {
    const INDEX_TYPE: &'static str;
}

/// An index aggregated over every document sharing the same `GROUP_KEY`.
///
/// # Contract
/// - `reduce` merges a non-empty group that shares one key value into a single
///   value; returning `None` is a contract violation reported at flush time.
/// - `delete` removes the contribution of `removed`; `None` drops the row.
/// - `update` folds in entries staged as unchanged contributions. An updated
///   document is re-mapped as deleted old entries plus new entries, so
///   session flushes never stage such entries.
pub trait ReduceIndex: Index {
    const GROUP_KEY: &'static str;

    fn reduce(group: Vec<Self>) -> Option<Self>;

    fn delete(self, removed: Vec<Self>) -> Option<Self>;

    fn update(self, updated: Vec<Self>) -> Self {
        let _ = updated;
        self
    }
}

/// Type-erased index value: index type, row id (0 when not persisted) and
/// column values.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexRow {
    index_type: &'static str,
    id: i64,
    values: Map<String, Value>,
}

impl IndexRow {
    pub(crate) fn encode<I: Index>(index: &I) -> StoreResult<Self> {
        let Value::Object(mut values) = serde_json::to_value(index)? else {
            return Err(StoreError::InvalidIndex(format!(
                "`{}` must serialize to an object",
                I::INDEX_TYPE
            )));
        };

        let id = values
            .remove(ID_COLUMN)
            .and_then(|value| value.as_i64())
            .unwrap_or(0);

        for (column, value) in &values {
            if column == DOCUMENT_ID_COLUMN {
                return Err(StoreError::InvalidIndex(format!(
                    "`{}` uses reserved column `{DOCUMENT_ID_COLUMN}`",
                    I::INDEX_TYPE
                )));
            }
            if validate_identifier(column).is_err() {
                return Err(StoreError::InvalidIndex(format!(
                    "`{}` has invalid column name `{column}`",
                    I::INDEX_TYPE
                )));
            }
            if value.is_array() || value.is_object() {
                return Err(StoreError::InvalidIndex(format!(
                    "`{}.{column}` must be a scalar value",
                    I::INDEX_TYPE
                )));
            }
        }

        Ok(Self {
            index_type: I::INDEX_TYPE,
            id,
            values,
        })
    }

    pub(crate) fn decode<I: Index>(&self) -> StoreResult<I> {
        let mut values = self.values.clone();
        values.insert(ID_COLUMN.to_string(), Value::from(self.id));
        let index = serde_json::from_value(Value::Object(values))?;
        Ok(index)
    }

    /// Builds a row from a `SELECT *` result of an index table.
    pub(crate) fn from_sql_row(
        index_type: &'static str,
        row: &rusqlite::Row<'_>,
        column_names: &[String],
    ) -> StoreResult<Self> {
        let mut id = 0;
        let mut values = Map::new();
        for (position, column) in column_names.iter().enumerate() {
            let value = sql_to_json(index_type, column, row.get_ref(position)?)?;
            if column == ID_COLUMN {
                id = value.as_i64().ok_or_else(|| {
                    StoreError::InvalidData(format!("`{index_type}.Id` is not an integer"))
                })?;
            } else if column != DOCUMENT_ID_COLUMN {
                values.insert(column.clone(), value);
            }
        }

        Ok(Self {
            index_type,
            id,
            values,
        })
    }

    pub fn index_type(&self) -> &'static str {
        self.index_type
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn value(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    pub(crate) fn with_id(mut self, id: i64) -> Self {
        self.id = id;
        self
    }

    /// Returns the group-key value, failing when the column is missing.
    pub(crate) fn group_value(&self, group_key: &str) -> StoreResult<&Value> {
        self.values.get(group_key).ok_or_else(|| {
            StoreError::invalid_operation(format!(
                "reduce index `{}` has no group key column `{group_key}`",
                self.index_type
            ))
        })
    }

    /// Column/value pairs in a stable (sorted) column order.
    pub(crate) fn sql_values(&self) -> StoreResult<Vec<(&str, SqlValue)>> {
        self.values
            .iter()
            .map(|(column, value)| Ok((column.as_str(), json_to_sql(column, value)?)))
            .collect()
    }
}

pub(crate) fn json_to_sql(column: &str, value: &Value) -> StoreResult<SqlValue> {
    match value {
        Value::Null => Ok(SqlValue::Null),
        Value::Bool(flag) => Ok(SqlValue::Integer(i64::from(*flag))),
        Value::Number(number) => {
            if let Some(integer) = number.as_i64() {
                Ok(SqlValue::Integer(integer))
            } else if let Some(real) = number.as_f64() {
                Ok(SqlValue::Real(real))
            } else {
                Err(StoreError::InvalidIndex(format!(
                    "`{column}` value {number} does not fit a SQL number"
                )))
            }
        }
        Value::String(text) => Ok(SqlValue::Text(text.clone())),
        Value::Array(_) | Value::Object(_) => Err(StoreError::InvalidIndex(format!(
            "`{column}` must be a scalar value"
        ))),
    }
}

fn sql_to_json(index_type: &str, column: &str, value: ValueRef<'_>) -> StoreResult<Value> {
    match value {
        ValueRef::Null => Ok(Value::Null),
        ValueRef::Integer(integer) => Ok(Value::from(integer)),
        ValueRef::Real(real) => Ok(Number::from_f64(real).map_or(Value::Null, Value::Number)),
        ValueRef::Text(bytes) => std::str::from_utf8(bytes)
            .map(|text| Value::String(text.to_string()))
            .map_err(|_| {
                StoreError::InvalidData(format!("`{index_type}.{column}` is not valid UTF-8"))
            }),
        ValueRef::Blob(_) => Err(StoreError::InvalidData(format!(
            "`{index_type}.{column}` holds an unsupported blob"
        ))),
    }
}

/// Stable grouping key for a group-key value.
pub(crate) fn group_key_of(value: &Value) -> String {
    value.to_string()
}
