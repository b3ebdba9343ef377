//! Loose value comparison and row diffing
//!
//! Rows read back from the relational tier rarely carry the same JSON types
//! a client submitted (`"42"` vs `42`, `true` vs `1`). Updates only write
//! fields that differ under this type-tolerant equality.

use serde_json::Value;

use crate::model::FieldMap;

/// Numeric view of a scalar, if it has one.
fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::String(s) => {
            let s = s.trim();
            match s.to_ascii_lowercase().as_str() {
                "true" => Some(1.0),
                "false" => Some(0.0),
                _ => s.parse::<f64>().ok(),
            }
        }
        _ => None,
    }
}

/// Textual view of a value.
fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Type-tolerant equality: numeric, boolean and string spellings of the
/// same value compare equal. `null` only equals `null`.
pub fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        _ => match (as_number(a), as_number(b)) {
            (Some(x), Some(y)) => x == y,
            _ => as_text(a) == as_text(b),
        },
    }
}

/// Result of comparing a submitted map against a known row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldDiff {
    /// Fields whose value differs from the row
    pub changes: FieldMap,
    /// Submitted fields the row does not have
    pub unknown: Vec<String>,
}

impl FieldDiff {
    pub fn is_unchanged(&self) -> bool {
        self.changes.is_empty() && self.unknown.is_empty()
    }
}

/// Compare `submitted` against `known`, keeping submission order.
pub fn diff_fields(submitted: &FieldMap, known: &FieldMap) -> FieldDiff {
    let mut diff = FieldDiff::default();
    for (name, value) in submitted {
        match known.get(name) {
            Some(current) if loose_eq(current, value) => {}
            Some(_) => {
                diff.changes.insert(name.clone(), value.clone());
            }
            None => diff.unknown.push(name.clone()),
        }
    }
    diff
}
