//! Record types for the CDC merge engine
//!
//! Defines the raw change and typed change record structures that flow
//! from the transport through decoding and planning.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Offset of a record in the upstream stream.
///
/// Positions are opaque to everything but ordering: the checkpoint only ever
/// stores the greatest position known to be applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourcePosition(pub u64);

impl SourcePosition {
    pub fn new(offset: u64) -> Self {
        Self(offset)
    }

    pub fn offset(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for SourcePosition {
    fn from(offset: u64) -> Self {
        Self(offset)
    }
}

/// Identity of a target document, derived from the source row's primary key
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityKey {
    Int(i64),
    Str(String),
    /// Multi-column primary key, components in configured field order
    Composite(Vec<EntityKey>),
}

impl EntityKey {
    /// Resolve a single key component from a JSON value.
    ///
    /// Only integers and strings identify rows; everything else is rejected.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Self::Int),
            Value::String(s) => Some(Self::Str(s.clone())),
            _ => None,
        }
    }

    /// Document id used by the target store.
    ///
    /// Distinct keys always map to distinct ids. Integers and plain strings
    /// keep their natural form. Backslashes and colons inside strings are
    /// backslash-escaped, and strings that parse as integers get a `\s`
    /// prefix. Composite components are joined with `:`; a composite that is
    /// nested or has fewer than two parts gets a `\c` prefix.
    pub fn document_id(&self) -> String {
        self.to_string()
    }

    fn write_component(&self, out: &mut String) {
        match self {
            Self::Int(i) => out.push_str(&i.to_string()),
            Self::Str(s) => {
                if s.parse::<i64>().is_ok() {
                    out.push_str("\\s");
                }
                escape_into(s, out);
            }
            Self::Composite(_) => {
                out.push_str("\\c");
                escape_into(&self.encode(), out);
            }
        }
    }

    fn encode(&self) -> String {
        let mut out = String::new();
        match self {
            Self::Composite(parts) => {
                if parts.len() < 2 {
                    out.push_str("\\c");
                }
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        out.push(':');
                    }
                    part.write_component(&mut out);
                }
            }
            _ => self.write_component(&mut out),
        }
        out
    }
}

fn escape_into(s: &str, out: &mut String) {
    for ch in s.chars() {
        if ch == '\\' || ch == ':' {
            out.push('\\');
        }
        out.push(ch);
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

impl From<i64> for EntityKey {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for EntityKey {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

/// Row-level change operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOperation {
    /// Row inserted
    Create,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
    /// Row read during the connector's initial snapshot
    SnapshotRead,
}

impl ChangeOperation {
    /// Parse the envelope `op` code
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "c" => Some(Self::Create),
            "u" => Some(Self::Update),
            "d" => Some(Self::Delete),
            "r" => Some(Self::SnapshotRead),
            _ => None,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Create => "c",
            Self::Update => "u",
            Self::Delete => "d",
            Self::SnapshotRead => "r",
        }
    }

    /// Whether the resulting target document should exist
    pub fn is_upsert(&self) -> bool {
        !matches!(self, Self::Delete)
    }
}

impl fmt::Display for ChangeOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::SnapshotRead => "snapshot_read",
        };
        f.write_str(name)
    }
}

/// Decoded unit of work
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeRecord {
    pub key: EntityKey,
    pub operation: ChangeOperation,
    /// Row state after the change; `None` for deletes
    pub after: Option<Value>,
    /// Row state before the change, if the connector captured it
    pub before: Option<Value>,
    /// Source commit time in epoch millis (`ts_ms`)
    pub source_timestamp: Option<i64>,
    pub position: SourcePosition,
}

impl ChangeRecord {
    /// Create an upserting record (create/update/snapshot read)
    pub fn upsert(
        operation: ChangeOperation,
        key: impl Into<EntityKey>,
        after: Value,
        position: u64,
    ) -> Self {
        Self {
            key: key.into(),
            operation,
            after: Some(after),
            before: None,
            source_timestamp: None,
            position: SourcePosition(position),
        }
    }

    /// Create a delete record
    pub fn delete(key: impl Into<EntityKey>, position: u64) -> Self {
        Self {
            key: key.into(),
            operation: ChangeOperation::Delete,
            after: None,
            before: None,
            source_timestamp: None,
            position: SourcePosition(position),
        }
    }

    /// Builder: set source timestamp
    pub fn with_timestamp(mut self, ts_ms: i64) -> Self {
        self.source_timestamp = Some(ts_ms);
        self
    }
}

/// Undecoded payload as delivered by the transport
#[derive(Debug, Clone)]
pub struct RawChange {
    pub position: SourcePosition,
    pub payload: Bytes,
}

impl RawChange {
    pub fn new(position: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            position: SourcePosition(position),
            payload: payload.into(),
        }
    }

    /// Build from a JSON value (mainly for tests and tooling)
    pub fn from_json(position: u64, value: &Value) -> Self {
        Self::new(position, Bytes::from(value.to_string()))
    }
}

/// Ordered group of raw changes delivered together by the scheduler
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub id: u64,
    changes: Vec<RawChange>,
}

impl Batch {
    pub fn new(id: u64, changes: Vec<RawChange>) -> Self {
        Self { id, changes }
    }

    pub fn empty(id: u64) -> Self {
        Self::new(id, Vec::new())
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RawChange> {
        self.changes.iter()
    }

    /// Greatest position delivered in this batch
    pub fn max_position(&self) -> Option<SourcePosition> {
        self.changes.iter().map(|c| c.position).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operation_codes() {
        for op in [
            ChangeOperation::Create,
            ChangeOperation::Update,
            ChangeOperation::Delete,
            ChangeOperation::SnapshotRead,
        ] {
            assert_eq!(ChangeOperation::from_code(op.code()), Some(op));
        }
        assert_eq!(ChangeOperation::from_code("t"), None);
        assert!(ChangeOperation::SnapshotRead.is_upsert());
        assert!(!ChangeOperation::Delete.is_upsert());
    }

    #[test]
    fn test_key_from_json() {
        assert_eq!(EntityKey::from_json(&json!(7)), Some(EntityKey::Int(7)));
        assert_eq!(EntityKey::from_json(&json!("u-1")), Some(EntityKey::from("u-1")));
        assert_eq!(EntityKey::from_json(&json!(1.5)), None);
        assert_eq!(EntityKey::from_json(&Value::Null), None);
        assert_eq!(EntityKey::from_json(&json!({"id": 1})), None);
    }

    #[test]
    fn test_composite_document_id() {
        let key = EntityKey::Composite(vec![EntityKey::Int(3), EntityKey::from("eu")]);
        assert_eq!(key.document_id(), "3:eu");
    }

    #[test]
    fn test_document_ids_do_not_collide() {
        let int = EntityKey::Int(1);
        let text = EntityKey::from("1");
        assert_eq!(int.document_id(), "1");
        assert_eq!(text.document_id(), "\\s1");
        assert_ne!(int.document_id(), text.document_id());

        let left = EntityKey::Composite(vec![EntityKey::from("a:b"), EntityKey::from("c")]);
        let right = EntityKey::Composite(vec![EntityKey::from("a"), EntityKey::from("b:c")]);
        assert_eq!(left.document_id(), "a\\:b:c");
        assert_eq!(right.document_id(), "a:b\\:c");

        let keys = [
            int,
            text,
            left,
            right,
            EntityKey::from("a:b:c"),
            EntityKey::from("a\\:b:c"),
            EntityKey::from(""),
            EntityKey::Composite(vec![EntityKey::Int(1)]),
            EntityKey::Composite(vec![]),
            EntityKey::Composite(vec![EntityKey::Int(1), EntityKey::Int(2)]),
            EntityKey::Composite(vec![EntityKey::Int(1), EntityKey::from("2")]),
            EntityKey::Composite(vec![
                EntityKey::Composite(vec![EntityKey::Int(1), EntityKey::Int(2)]),
                EntityKey::Int(3),
            ]),
            EntityKey::Composite(vec![
                EntityKey::Int(1),
                EntityKey::Composite(vec![EntityKey::Int(2), EntityKey::Int(3)]),
            ]),
            EntityKey::Composite(vec![EntityKey::Int(1), EntityKey::Int(2), EntityKey::Int(3)]),
        ];
        let ids: std::collections::HashSet<String> = keys.iter().map(EntityKey::document_id).collect();
        assert_eq!(ids.len(), keys.len());
    }

    #[test]
    fn test_batch_max_position() {
        let batch = Batch::new(
            1,
            vec![
                RawChange::new(12, "a"),
                RawChange::new(10, "b"),
                RawChange::new(11, "c"),
            ],
        );
        assert_eq!(batch.max_position(), Some(SourcePosition(12)));
        assert_eq!(Batch::empty(2).max_position(), None);
    }
}
