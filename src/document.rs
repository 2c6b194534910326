//! Store-native document model.
//!
//! A [`Document`] is an ordered map of field name to [`Value`]. The value
//! model follows what managed document stores expose: JSON-like scalars plus
//! a native timestamp type and a server-timestamp sentinel that the store
//! resolves at commit time.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// A stored document's fields.
pub type Document = BTreeMap<String, Value>;

/// A single field value as the store understands it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Double(f64),
    String(String),
    Timestamp(DateTime<Utc>),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// Placeholder replaced with the commit time by the store.
    ServerTimestamp,
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(ts) => Some(*ts),
            _ => None,
        }
    }

    /// Rank of the value's type in the store's cross-type ordering.
    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Integer(_) | Value::Double(_) => 2,
            Value::Timestamp(_) | Value::ServerTimestamp => 3,
            Value::String(_) => 4,
            Value::Array(_) => 5,
            Value::Map(_) => 6,
        }
    }

    /// Total ordering used for sorting and range filters.
    ///
    /// Values of different types order by type rank; integers and doubles
    /// compare numerically.
    pub fn total_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Integer(a), Value::Integer(b)) => a.cmp(b),
            (Value::Integer(a), Value::Double(b)) => (*a as f64).total_cmp(b),
            (Value::Double(a), Value::Integer(b)) => a.total_cmp(&(*b as f64)),
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    let ord = x.total_cmp(y);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            (Value::Map(a), Value::Map(b)) => {
                for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                    let ord = ka.cmp(kb).then_with(|| va.total_cmp(vb));
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                a.len().cmp(&b.len())
            }
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }

    /// Equality as the store's `==` filter sees it (numeric across int/double).
    pub fn loose_eq(&self, other: &Value) -> bool {
        self.type_rank() == other.type_rank() && self.total_cmp(other) == Ordering::Equal
    }

    /// Convert a JSON value into a store value.
    pub fn from_json(json: serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Integer(i),
                None => Value::Double(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert a store value into JSON.
    ///
    /// Timestamps become RFC 3339 strings with nanosecond precision so that
    /// chrono round-trips them exactly. An unresolved server timestamp has
    /// no JSON form and maps to `null`.
    pub fn into_json(self) -> serde_json::Value {
        match self {
            Value::Null | Value::ServerTimestamp => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Integer(i) => serde_json::Value::from(i),
            Value::Double(d) => serde_json::Number::from_f64(d)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s),
            Value::Timestamp(ts) => {
                serde_json::Value::String(ts.to_rfc3339_opts(SecondsFormat::AutoSi, true))
            }
            Value::Array(items) => {
                serde_json::Value::Array(items.into_iter().map(Value::into_json).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.into_iter().map(|(k, v)| (k, v.into_json())).collect(),
            ),
        }
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v as i64)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        i64::try_from(v)
            .map(Value::Integer)
            .unwrap_or(Value::Double(v as f64))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Timestamp(v)
    }
}

impl<V: Into<Value>> From<Vec<V>> for Value {
    fn from(v: Vec<V>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

impl<V: Into<Value>> From<Option<V>> for Value {
    fn from(v: Option<V>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Replace every server-timestamp sentinel in `doc`, at any depth, with `at`.
pub fn resolve_server_timestamps(doc: &mut Document, at: DateTime<Utc>) {
    doc.values_mut().for_each(|v| resolve_value(v, at));
}

fn resolve_value(value: &mut Value, at: DateTime<Utc>) {
    match value {
        Value::ServerTimestamp => *value = Value::Timestamp(at),
        Value::Array(items) => items.iter_mut().for_each(|v| resolve_value(v, at)),
        Value::Map(map) => map.values_mut().for_each(|v| resolve_value(v, at)),
        _ => {}
    }
}

/// Look up a possibly dotted field path (`"dimensions.width"`).
pub fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let first = parts.next()?;
    let mut current = doc.get(first)?;
    for part in parts {
        match current {
            Value::Map(map) => current = map.get(part)?,
            _ => return None,
        }
    }
    Some(current)
}

/// Convert a JSON object into a document. Non-objects are rejected.
pub fn document_from_json(json: serde_json::Value) -> Option<Document> {
    match Value::from_json(json) {
        Value::Map(map) => Some(map),
        _ => None,
    }
}

/// Convert a document into a JSON object.
pub fn document_into_json(doc: Document) -> serde_json::Value {
    Value::Map(doc).into_json()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_numeric_ordering_across_types() {
        assert_eq!(Value::Integer(2).total_cmp(&Value::Double(2.5)), Ordering::Less);
        assert!(Value::Integer(3).loose_eq(&Value::Double(3.0)));
        assert!(!Value::Integer(3).loose_eq(&Value::String("3".into())));
    }

    #[test]
    fn test_type_rank_ordering() {
        assert_eq!(Value::Null.total_cmp(&Value::Bool(false)), Ordering::Less);
        assert_eq!(Value::String("a".into()).total_cmp(&Value::Integer(9)), Ordering::Greater);
    }

    #[test]
    fn test_dotted_path_lookup() {
        let doc = document_from_json(serde_json::json!({
            "dimensions": { "width": 10, "height": 4 },
            "name": "Widget"
        }))
        .unwrap();

        assert_eq!(get_path(&doc, "dimensions.width"), Some(&Value::Integer(10)));
        assert_eq!(get_path(&doc, "name.length"), None);
        assert_eq!(get_path(&doc, "missing"), None);
    }

    #[test]
    fn test_timestamp_json_keeps_nanos() {
        let ts = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        let json = Value::Timestamp(ts).into_json();
        let parsed: DateTime<Utc> = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, ts);
    }

    #[test]
    fn test_large_unsigned_becomes_double() {
        assert_eq!(Value::from(u64::MAX), Value::Double(u64::MAX as f64));
        assert_eq!(Value::from(7u64), Value::Integer(7));
    }
}
