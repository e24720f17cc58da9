//! The attachment value tree and its deep-merge semantics.
//!
//! Attachments are dynamically typed, string-keyed trees the handler builds
//! up incrementally over the life of an invocation. They are the payload
//! carried into the terminal wide event.

use std::collections::BTreeMap;

use serde::Serialize;

/// One node of an attachment tree: a record, a list, or a scalar.
///
/// `Record` uses a `BTreeMap` so serialized output has stable key order,
/// which keeps wide-event snapshots diffable across runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttachmentValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<AttachmentValue>),
    Record(BTreeMap<String, AttachmentValue>),
}

impl AttachmentValue {
    pub fn record() -> Self {
        AttachmentValue::Record(BTreeMap::new())
    }

    pub fn is_record(&self) -> bool {
        matches!(self, AttachmentValue::Record(_))
    }

    /// Merge `new` into `self` per the attach contract: record-vs-record
    /// merges recursively key by key; anything else is a full replace.
    /// Arrays are never merged even if both sides are lists.
    pub fn merge(&mut self, new: AttachmentValue) {
        match (&mut *self, new) {
            (AttachmentValue::Record(existing), AttachmentValue::Record(incoming)) => {
                for (key, value) in incoming {
                    match existing.get_mut(&key) {
                        Some(current) => current.merge(value),
                        None => {
                            existing.insert(key, value);
                        }
                    }
                }
            }
            (slot, incoming) => *slot = incoming,
        }
    }

    /// A cheap estimate of serialized size, used only to evaluate the
    /// attachment byte-size warning threshold — not a real serializer.
    pub fn estimated_size(&self) -> usize {
        match self {
            AttachmentValue::Null => 4,
            AttachmentValue::Bool(_) => 5,
            AttachmentValue::Number(_) => 8,
            AttachmentValue::String(s) => s.len() + 2,
            AttachmentValue::Bytes(b) => b.len(),
            AttachmentValue::List(items) => {
                items.iter().map(AttachmentValue::estimated_size).sum::<usize>() + 2
            }
            AttachmentValue::Record(map) => {
                map.iter()
                    .map(|(k, v)| k.len() + v.estimated_size() + 2)
                    .sum::<usize>()
                    + 2
            }
        }
    }
}

impl From<&str> for AttachmentValue {
    fn from(value: &str) -> Self {
        AttachmentValue::String(value.to_string())
    }
}

impl From<String> for AttachmentValue {
    fn from(value: String) -> Self {
        AttachmentValue::String(value)
    }
}

impl From<f64> for AttachmentValue {
    fn from(value: f64) -> Self {
        AttachmentValue::Number(value)
    }
}

impl From<bool> for AttachmentValue {
    fn from(value: bool) -> Self {
        AttachmentValue::Bool(value)
    }
}

impl From<serde_json::Value> for AttachmentValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => AttachmentValue::Null,
            serde_json::Value::Bool(b) => AttachmentValue::Bool(b),
            serde_json::Value::Number(n) => AttachmentValue::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => AttachmentValue::String(s),
            serde_json::Value::Array(items) => {
                AttachmentValue::List(items.into_iter().map(AttachmentValue::from).collect())
            }
            serde_json::Value::Object(map) => AttachmentValue::Record(
                map.into_iter()
                    .map(|(k, v)| (k, AttachmentValue::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Serialize `value` to an [`AttachmentValue`] tree via `serde_json`,
/// falling back to `Null` if serialization fails (it never should for a
/// well-behaved handler output/input type).
pub fn to_attachment<T: serde::Serialize>(value: &T) -> AttachmentValue {
    serde_json::to_value(value)
        .map(AttachmentValue::from)
        .unwrap_or(AttachmentValue::Null)
}
