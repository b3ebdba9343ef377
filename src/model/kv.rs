//! Key/value pairs
//!
//! A [`KvPair`] is the unit every tier reads and writes: a namespaced key
//! plus a field map. Opaque string values are carried as a single
//! [`DEFAULT_FIELD`] entry so that every tier sees the same shape.

use std::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Field map carried by a pair. Insertion order is preserved.
pub type FieldMap = Map<String, Value>;

/// Field used for opaque string values.
pub const DEFAULT_FIELD: &str = "_DEFAULT_";

/// Id that asks the engine to generate a fresh key.
pub const WILDCARD_ID: &str = "*";

/// Namespace for ordinary data keys.
pub const DATA_TYPE: &str = "data";

/// Namespace reserved for routing metadata records.
pub const INFO_TYPE: &str = "info";

/// Namespace reserved for async failure records.
pub const TRACE_TYPE: &str = "trace";

/// One addressable unit of data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KvPair {
    /// Key id
    pub id: String,
    /// Namespace (`data`, `query`, ...)
    #[serde(rename = "type")]
    pub kind: String,
    /// Decoded field map
    #[serde(default)]
    pub data: FieldMap,
    /// Set when the id was generated from a `*` request
    #[serde(skip)]
    pub generated: bool,
    /// Value replaced by a get-and-set
    #[serde(skip)]
    pub previous: Option<FieldMap>,
}

impl KvPair {
    /// Create an empty pair. An id of `*` is replaced by a generated one.
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        let id = id.into();
        let (id, generated) = if id == WILDCARD_ID {
            (uuid::Uuid::new_v4().simple().to_string(), true)
        } else {
            (id, false)
        };

        Self {
            id,
            kind: kind.into(),
            data: FieldMap::new(),
            generated,
            previous: None,
        }
    }

    /// Create a pair carrying a field map.
    pub fn with_data(kind: impl Into<String>, id: impl Into<String>, data: FieldMap) -> Self {
        let mut pair = Self::new(kind, id);
        pair.data = data;
        pair
    }

    /// Create a pair carrying an opaque string value.
    pub fn with_text(
        kind: impl Into<String>,
        id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let mut pair = Self::new(kind, id);
        pair.data
            .insert(DEFAULT_FIELD.to_string(), Value::String(text.into()));
        pair
    }

    /// Opaque string value, if this pair carries one.
    pub fn text(&self) -> Option<&str> {
        self.data.get(DEFAULT_FIELD).and_then(Value::as_str)
    }

    /// `type:id`, used as the local cache key.
    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.kind, self.id)
    }

    /// True when no field has been loaded or submitted.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Merge fields into the pair, overwriting existing values.
    pub fn merge(&mut self, fields: &FieldMap) {
        for (name, value) in fields {
            self.data.insert(name.clone(), value.clone());
        }
    }

    /// Response shape handed back to the request layer.
    pub fn to_response(&self) -> Value {
        json!({ "key": self.id, "data": self.data })
    }
}

/// Encode a field map into hash fields (JSON-encoded values).
pub fn encode_fields(data: &FieldMap) -> Vec<(String, String)> {
    data.iter()
        .map(|(name, value)| (name.clone(), value.to_string()))
        .collect()
}

/// Decode hash fields. Values that are not valid JSON are kept as strings.
pub fn decode_fields(fields: Vec<(String, String)>) -> FieldMap {
    fields
        .into_iter()
        .map(|(name, raw)| {
            let value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
            (name, value)
        })
        .collect()
}

/// Ordered batch of pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KvPairs(Vec<KvPair>);

impl KvPairs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Response shapes for every pair.
    pub fn to_response(&self) -> Vec<Value> {
        self.0.iter().map(KvPair::to_response).collect()
    }

    pub fn into_inner(self) -> Vec<KvPair> {
        self.0
    }
}

impl From<Vec<KvPair>> for KvPairs {
    fn from(pairs: Vec<KvPair>) -> Self {
        Self(pairs)
    }
}

impl From<KvPair> for KvPairs {
    fn from(pair: KvPair) -> Self {
        Self(vec![pair])
    }
}

impl Deref for KvPairs {
    type Target = Vec<KvPair>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for KvPairs {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_pair_uses_default_field() {
        let pair = KvPair::with_text(DATA_TYPE, "foo", "bar");
        assert_eq!(pair.text(), Some("bar"));
        assert_eq!(
            pair.to_response(),
            json!({"key": "foo", "data": {"_DEFAULT_": "bar"}})
        );
    }

    #[test]
    fn test_wildcard_generates_id() {
        let pair = KvPair::new(DATA_TYPE, WILDCARD_ID);
        assert!(pair.generated);
        assert_ne!(pair.id, WILDCARD_ID);
        assert_eq!(pair.id.len(), 32);

        let plain = KvPair::new(DATA_TYPE, "k1");
        assert!(!plain.generated);
        assert_eq!(plain.cache_key(), "data:k1");
    }

    #[test]
    fn test_field_encoding_keeps_types() {
        let mut data = FieldMap::new();
        data.insert("a".into(), json!(1));
        data.insert("b".into(), json!("two"));
        data.insert("c".into(), json!(true));

        let encoded = encode_fields(&data);
        assert_eq!(encoded[0], ("a".to_string(), "1".to_string()));
        assert_eq!(encoded[1], ("b".to_string(), "\"two\"".to_string()));

        assert_eq!(decode_fields(encoded), data);
    }

    #[test]
    fn test_decode_tolerates_raw_strings() {
        let decoded = decode_fields(vec![("name".into(), "plain text".into())]);
        assert_eq!(decoded.get("name"), Some(&json!("plain text")));
    }

    #[test]
    fn test_decode_keeps_field_order() {
        let raw = vec![
            ("zeta".to_string(), "1".to_string()),
            ("alpha".to_string(), "2".to_string()),
            ("mid".to_string(), "3".to_string()),
        ];
        let decoded = decode_fields(raw);
        let names: Vec<&str> = decoded.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_merge_overwrites() {
        let mut pair = KvPair::with_text(DATA_TYPE, "k", "v");
        let mut patch = FieldMap::new();
        patch.insert(DEFAULT_FIELD.into(), json!("w"));
        patch.insert("extra".into(), json!(3));
        pair.merge(&patch);

        assert_eq!(pair.text(), Some("w"));
        assert_eq!(pair.data.len(), 2);
    }
}
