//! Payload serialization seam.
//!
//! The core never assumes a wire format. Producers hand typed values to the
//! publisher, which converts them through a [`Serializer`] into opaque bytes
//! stored on the outbox row; consumers get the bytes back and decode on their
//! side of the seam. The shipped [`JsonSerializer`] round-trips through
//! `serde_json` and is the default for local development.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

/// Result type for serializer operations.
pub type Result<T> = std::result::Result<T, SerializerError>;

/// Errors that can occur while encoding or decoding payloads.
#[derive(Debug, thiserror::Error)]
pub enum SerializerError {
    #[error("Encode failed: {0}")]
    Encode(String),

    #[error("Decode failed: {0}")]
    Decode(String),
}

/// Converts between in-memory values and payload bytes.
///
/// Implementations must round-trip: `from_bytes(to_bytes(v)) == v`. The
/// interchange type is `serde_json::Value` so the trait stays object-safe;
/// typed entry points are provided as free functions.
pub trait Serializer: Send + Sync {
    /// MIME-style tag recorded in message headers.
    fn content_type(&self) -> &'static str;

    /// Encode a value tree to payload bytes.
    fn to_bytes(&self, value: &Value) -> Result<Vec<u8>>;

    /// Decode payload bytes back to a value tree.
    fn from_bytes(&self, bytes: &[u8]) -> Result<Value>;
}

/// Serialize a typed message through a serializer.
pub fn serialize_message<T: Serialize>(
    serializer: &dyn Serializer,
    message: &T,
) -> Result<Vec<u8>> {
    let value = serde_json::to_value(message).map_err(|e| SerializerError::Encode(e.to_string()))?;
    serializer.to_bytes(&value)
}

/// Deserialize payload bytes into a typed message.
pub fn deserialize_message<T: DeserializeOwned>(
    serializer: &dyn Serializer,
    bytes: &[u8],
) -> Result<T> {
    let value = serializer.from_bytes(bytes)?;
    serde_json::from_value(value).map_err(|e| SerializerError::Decode(e.to_string()))
}

/// JSON serializer backed by `serde_json`.
#[derive(Debug, Clone, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn to_bytes(&self, value: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| SerializerError::Encode(e.to_string()))
    }

    fn from_bytes(&self, bytes: &[u8]) -> Result<Value> {
        serde_json::from_slice(bytes).map_err(|e| SerializerError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct OrderPlaced {
        order_id: String,
        total_cents: u64,
    }

    #[test]
    fn test_json_round_trip() {
        let serializer = JsonSerializer;
        let message = OrderPlaced {
            order_id: "ord-1".to_string(),
            total_cents: 1299,
        };

        let bytes = serialize_message(&serializer, &message).unwrap();
        let decoded: OrderPlaced = deserialize_message(&serializer, &bytes).unwrap();

        assert_eq!(decoded, message);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let serializer = JsonSerializer;
        let result = serializer.from_bytes(&[0xFF, 0xFE]);
        assert!(matches!(result, Err(SerializerError::Decode(_))));
    }

    #[test]
    fn test_content_type() {
        assert_eq!(JsonSerializer.content_type(), "application/json");
    }
}
