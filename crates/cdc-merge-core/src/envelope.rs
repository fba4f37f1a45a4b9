//! Envelope decoding
//!
//! Turns raw CDC envelopes (`before`, `after`, `op`, `ts_ms`) into typed
//! [`ChangeRecord`]s. Decoding is a pure transform; rejected payloads are the
//! caller's to log and drop.

use crate::error::{Result, SyncError};
use crate::record::{ChangeOperation, ChangeRecord, EntityKey, RawChange};
use serde::Deserialize;
use serde_json::Value;

/// Logical envelope fields consumed by the decoder
#[derive(Debug, Deserialize)]
struct WireEnvelope {
    #[serde(default)]
    before: Option<Value>,
    #[serde(default)]
    after: Option<Value>,
    #[serde(default)]
    op: Option<String>,
    #[serde(default)]
    ts_ms: Option<Value>,
}

/// Decoder for change envelopes
#[derive(Debug, Clone)]
pub struct EnvelopeDecoder {
    key_fields: Vec<String>,
}

impl Default for EnvelopeDecoder {
    fn default() -> Self {
        Self::new(vec!["id".to_string()])
    }
}

impl EnvelopeDecoder {
    /// Create a decoder resolving keys from the given primary-key fields
    pub fn new(key_fields: Vec<String>) -> Self {
        Self { key_fields }
    }

    /// Decode a raw change.
    ///
    /// Returns `Ok(None)` for tombstones (empty or `null` payloads), which
    /// carry no change of their own.
    pub fn decode(&self, raw: &RawChange) -> Result<Option<ChangeRecord>> {
        if raw.payload.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        let value: Value = serde_json::from_slice(&raw.payload)
            .map_err(|e| SyncError::malformed_with_source("Payload is not valid JSON", e))?;

        let value = match unwrap_schema(value) {
            Value::Null => return Ok(None),
            v => v,
        };

        if !value.is_object() {
            return Err(SyncError::malformed("Envelope is not a JSON object"));
        }

        let wire: WireEnvelope = serde_json::from_value(value)
            .map_err(|e| SyncError::malformed_with_source("Unexpected envelope shape", e))?;

        let code = wire
            .op
            .as_deref()
            .ok_or_else(|| SyncError::malformed("Missing op"))?;
        let operation = ChangeOperation::from_code(code)
            .ok_or_else(|| SyncError::malformed(format!("Unrecognized op code '{}'", code)))?;

        let after = wire.after.filter(|v| !v.is_null());
        let before = wire.before.filter(|v| !v.is_null());

        if operation.is_upsert() && !after.as_ref().is_some_and(Value::is_object) {
            return Err(SyncError::malformed(format!(
                "Operation '{}' requires an after image",
                code
            )));
        }

        let key = after
            .as_ref()
            .and_then(|image| self.resolve_key(image))
            .or_else(|| before.as_ref().and_then(|image| self.resolve_key(image)))
            .ok_or_else(|| SyncError::unresolvable_key(&self.key_fields))?;

        let source_timestamp = match wire.ts_ms {
            None | Some(Value::Null) => None,
            Some(ts) => Some(parse_timestamp(&ts)?),
        };

        Ok(Some(ChangeRecord {
            key,
            operation,
            after: if operation.is_upsert() { after } else { None },
            before,
            source_timestamp,
            position: raw.position,
        }))
    }

    /// Resolve the entity key from one row image
    fn resolve_key(&self, image: &Value) -> Option<EntityKey> {
        let object = image.as_object()?;
        let mut parts = self
            .key_fields
            .iter()
            .map(|field| object.get(field).and_then(EntityKey::from_json))
            .collect::<Option<Vec<_>>>()?;

        match parts.len() {
            0 => None,
            1 => parts.pop(),
            _ => Some(EntityKey::Composite(parts)),
        }
    }
}

/// Strip the `{"schema": .., "payload": ..}` wrapper added by JSON converters
/// with schemas enabled.
fn unwrap_schema(value: Value) -> Value {
    match value {
        Value::Object(mut map) if map.contains_key("schema") && map.contains_key("payload") => {
            map.remove("payload").unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn parse_timestamp(value: &Value) -> Result<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| SyncError::malformed(format!("ts_ms out of range: {}", n))),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|e| SyncError::malformed_with_source(format!("ts_ms not numeric: '{}'", s), e)),
        other => Err(SyncError::malformed(format!("ts_ms has unexpected type: {}", other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::SourcePosition;
    use serde_json::json;

    fn decode(value: Value) -> Result<Option<ChangeRecord>> {
        EnvelopeDecoder::default().decode(&RawChange::from_json(9, &value))
    }

    #[test]
    fn test_decode_create() {
        let record = decode(json!({
            "before": null,
            "after": {"id": 1, "name": "A", "email": "a@example.com"},
            "op": "c",
            "ts_ms": 1700000000000i64
        }))
        .unwrap()
        .unwrap();

        assert_eq!(record.key, EntityKey::Int(1));
        assert_eq!(record.operation, ChangeOperation::Create);
        assert_eq!(record.after.unwrap()["email"], "a@example.com");
        assert_eq!(record.source_timestamp, Some(1_700_000_000_000));
        assert_eq!(record.position, SourcePosition(9));
    }

    #[test]
    fn test_delete_key_from_before() {
        let record = decode(json!({
            "before": {"id": 2, "name": "B"},
            "after": null,
            "op": "d",
            "ts_ms": "1700000000001"
        }))
        .unwrap()
        .unwrap();

        assert_eq!(record.key, EntityKey::Int(2));
        assert_eq!(record.operation, ChangeOperation::Delete);
        assert!(record.after.is_none());
        assert_eq!(record.source_timestamp, Some(1_700_000_000_001));
    }

    #[test]
    fn test_snapshot_read_is_upsert() {
        let record = decode(json!({"after": {"id": "u-7"}, "op": "r"}))
            .unwrap()
            .unwrap();
        assert_eq!(record.operation, ChangeOperation::SnapshotRead);
        assert_eq!(record.key, EntityKey::from("u-7"));
        assert!(record.source_timestamp.is_none());
    }

    #[test]
    fn test_unrecognized_op_is_malformed() {
        let err = decode(json!({"after": {"id": 1}, "op": "t"})).unwrap_err();
        assert!(matches!(err, SyncError::MalformedEnvelope { .. }));

        let err = decode(json!({"after": {"id": 1}})).unwrap_err();
        assert!(matches!(err, SyncError::MalformedEnvelope { .. }));
    }

    #[test]
    fn test_missing_key_is_unresolvable() {
        let err = decode(json!({"before": {"name": "x"}, "op": "d"})).unwrap_err();
        assert!(matches!(err, SyncError::UnresolvableKey { .. }));

        let err = decode(json!({"after": {"id": null, "name": "x"}, "op": "u"})).unwrap_err();
        assert!(matches!(err, SyncError::UnresolvableKey { .. }));
    }

    #[test]
    fn test_upsert_without_after_is_malformed() {
        let err = decode(json!({"before": {"id": 1}, "op": "u"})).unwrap_err();
        assert!(matches!(err, SyncError::MalformedEnvelope { .. }));
    }

    #[test]
    fn test_invalid_payloads() {
        let decoder = EnvelopeDecoder::default();
        let err = decoder.decode(&RawChange::new(1, "{not json")).unwrap_err();
        assert!(err.is_record_level());

        let err = decode(json!([1, 2, 3])).unwrap_err();
        assert!(matches!(err, SyncError::MalformedEnvelope { .. }));

        let err = decode(json!({"after": {"id": 1}, "op": "c", "ts_ms": "soon"})).unwrap_err();
        assert!(matches!(err, SyncError::MalformedEnvelope { .. }));
    }

    #[test]
    fn test_tombstones() {
        let decoder = EnvelopeDecoder::default();
        assert!(decoder.decode(&RawChange::new(1, "")).unwrap().is_none());
        assert!(decoder.decode(&RawChange::new(1, "null")).unwrap().is_none());
        assert!(decode(json!({"schema": {}, "payload": null})).unwrap().is_none());
    }

    #[test]
    fn test_schema_wrapped_envelope() {
        let record = decode(json!({
            "schema": {"type": "struct", "name": "users.Envelope"},
            "payload": {"after": {"id": 5, "name": "E"}, "op": "u", "ts_ms": 10}
        }))
        .unwrap()
        .unwrap();
        assert_eq!(record.key, EntityKey::Int(5));
        assert_eq!(record.operation, ChangeOperation::Update);
    }

    #[test]
    fn test_composite_key() {
        let decoder = EnvelopeDecoder::new(vec!["tenant".into(), "id".into()]);
        let raw = RawChange::from_json(
            1,
            &json!({"after": {"tenant": "acme", "id": 4}, "op": "c"}),
        );
        let record = decoder.decode(&raw).unwrap().unwrap();
        assert_eq!(record.key.document_id(), "acme:4");

        // Partial composite keys do not resolve
        let raw = RawChange::from_json(2, &json!({"after": {"id": 4}, "op": "c"}));
        assert!(matches!(
            decoder.decode(&raw).unwrap_err(),
            SyncError::UnresolvableKey { .. }
        ));
    }
}
