//! Byte-level encoding of session values.
//!
//! Every value written to a [`Database`](crate::storage::Database) goes
//! through a [`Transcoder`]. The file backend also uses it for the
//! expiration timestamps it keeps next to each session.

use crate::core::{Result, SessionError, Value};
use lazy_static::lazy_static;
use std::sync::Arc;

/// Value serialization strategy.
pub trait Transcoder: Send + Sync {
    fn marshal(&self, value: &Value) -> Result<Vec<u8>>;
    fn unmarshal(&self, bytes: &[u8]) -> Result<Value>;
}

/// MessagePack encoding via `rmp-serde`. The default.
#[derive(Debug, Default, Clone, Copy)]
pub struct MsgPackTranscoder;

impl Transcoder for MsgPackTranscoder {
    fn marshal(&self, value: &Value) -> Result<Vec<u8>> {
        rmp_serde::to_vec(value)
            .map_err(|e| SessionError::Serialization(format!("Failed to encode value: {}", e)))
    }

    fn unmarshal(&self, bytes: &[u8]) -> Result<Value> {
        rmp_serde::from_slice(bytes)
            .map_err(|e| SessionError::Serialization(format!("Failed to decode value: {}", e)))
    }
}

/// JSON encoding via `serde_json`. Larger than MessagePack but readable
/// when inspecting a store by hand.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonTranscoder;

impl Transcoder for JsonTranscoder {
    fn marshal(&self, value: &Value) -> Result<Vec<u8>> {
        serde_json::to_vec(value)
            .map_err(|e| SessionError::Serialization(format!("Failed to encode value: {}", e)))
    }

    fn unmarshal(&self, bytes: &[u8]) -> Result<Value> {
        serde_json::from_slice(bytes)
            .map_err(|e| SessionError::Serialization(format!("Failed to decode value: {}", e)))
    }
}

// Process-wide default used by backends that are not given a transcoder
lazy_static! {
    pub static ref DEFAULT_TRANSCODER: Arc<dyn Transcoder> = Arc::new(MsgPackTranscoder);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn samples() -> Vec<Value> {
        vec![
            Value::Null,
            Value::Integer(-17),
            Value::Float(2.5),
            Value::Text("iris".into()),
            Value::Boolean(true),
            Value::Timestamp(Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap()),
            Value::Json(serde_json::json!({ "cart": [1, 2, 3], "vip": false })),
        ]
    }

    #[test]
    fn test_msgpack_preserves_values() {
        let transcoder = MsgPackTranscoder;
        for value in samples() {
            let bytes = transcoder.marshal(&value).unwrap();
            assert_eq!(transcoder.unmarshal(&bytes).unwrap(), value);
        }
    }

    #[test]
    fn test_json_preserves_values() {
        let transcoder = JsonTranscoder;
        for value in samples() {
            let bytes = transcoder.marshal(&value).unwrap();
            assert_eq!(transcoder.unmarshal(&bytes).unwrap(), value);
        }
    }

    #[test]
    fn test_garbage_is_a_serialization_error() {
        let err = DEFAULT_TRANSCODER.unmarshal(&[0xc1, 0xff, 0x00]).unwrap_err();
        assert!(matches!(err, SessionError::Serialization(_)));
    }
}
