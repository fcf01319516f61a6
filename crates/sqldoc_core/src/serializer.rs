//! Content serializer contract.

use crate::error::StoreResult;
use serde_json::Value;

/// Turns entity values into document content and back.
///
/// Entities reach the serializer as `serde_json::Value`, so implementations
/// only choose the textual representation.
pub trait ContentSerializer: Send + Sync {
    fn serialize(&self, value: &Value) -> StoreResult<String>;

    fn deserialize(&self, content: &str) -> StoreResult<Value>;
}

/// Compact JSON content.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonContentSerializer;

impl ContentSerializer for JsonContentSerializer {
    fn serialize(&self, value: &Value) -> StoreResult<String> {
        Ok(serde_json::to_string(value)?)
    }

    fn deserialize(&self, content: &str) -> StoreResult<Value> {
        Ok(serde_json::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::{ContentSerializer, JsonContentSerializer};
    use crate::error::StoreError;
    use serde_json::json;

    #[test]
    fn json_content_is_compact_and_reversible() {
        let serializer = JsonContentSerializer;
        let content = serializer.serialize(&json!({"a": 1, "b": "x"})).unwrap();
        assert_eq!(content, r#"{"a":1,"b":"x"}"#);
        assert_eq!(serializer.deserialize(&content).unwrap()["b"], "x");
    }

    #[test]
    fn malformed_content_is_a_serialization_error() {
        let err = JsonContentSerializer.deserialize("{oops").unwrap_err();
        assert!(matches!(err, StoreError::Serialization(_)));
    }
}
