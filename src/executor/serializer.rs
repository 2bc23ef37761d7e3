/// Document serialization at the executor boundary
use crate::error::{DriverError, DriverResult};
use bytes::Bytes;
use serde_json::Value;

/// Converts command and reply documents to and from payload bytes
pub trait DocumentSerializer: Send + Sync {
    fn serialize(&self, document: &Value) -> DriverResult<Bytes>;

    fn deserialize(&self, payload: &[u8]) -> DriverResult<Value>;
}

/// UTF-8 JSON payloads
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl DocumentSerializer for JsonSerializer {
    fn serialize(&self, document: &Value) -> DriverResult<Bytes> {
        serde_json::to_vec(document)
            .map(Bytes::from)
            .map_err(|e| DriverError::encoding(format!("failed to serialize document: {}", e)))
    }

    fn deserialize(&self, payload: &[u8]) -> DriverResult<Value> {
        serde_json::from_slice(payload)
            .map_err(|e| DriverError::encoding(format!("failed to parse reply document: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_serializer() {
        let serializer = JsonSerializer;
        let bytes = serializer.serialize(&json!({"b": 1, "a": 2})).unwrap();
        assert_eq!(&bytes[..], br#"{"b":1,"a":2}"#);

        assert_eq!(serializer.deserialize(br#"{"ok":1}"#).unwrap(), json!({"ok": 1}));
        assert!(matches!(
            serializer.deserialize(b"not json"),
            Err(DriverError::Encoding { .. })
        ));
    }
}
