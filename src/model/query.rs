//! Declarative filter conditions
//!
//! A filter maps field names to a [`Condition`], which in turn maps
//! comparison operators to an ordered, duplicate-free list of values.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Comparison operator of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    In,
    NotIn,
    Like,
}

impl Operator {
    /// Canonical textual form, also used as the serialized map key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "!=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::In => "in",
            Operator::NotIn => "not in",
            Operator::Like => "like",
        }
    }

    /// SQL spelling of the operator.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::Ne => "<>",
            Operator::Gt => ">",
            Operator::Ge => ">=",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::In => "IN",
            Operator::NotIn => "NOT IN",
            Operator::Like => "LIKE",
        }
    }

    /// Set operators accept one or more values; all others exactly one.
    pub fn is_set(&self) -> bool {
        matches!(self, Operator::In | Operator::NotIn)
    }

    /// Operators that pin a field and cannot be combined with others.
    pub fn is_exclusive(&self) -> bool {
        matches!(self, Operator::Eq | Operator::In)
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Operator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "=" | "==" | "eq" => Ok(Operator::Eq),
            "!=" | "<>" | "ne" => Ok(Operator::Ne),
            ">" | "gt" => Ok(Operator::Gt),
            ">=" | "ge" => Ok(Operator::Ge),
            "<" | "lt" => Ok(Operator::Lt),
            "<=" | "le" => Ok(Operator::Le),
            "in" => Ok(Operator::In),
            "not in" | "nin" => Ok(Operator::NotIn),
            "like" => Ok(Operator::Like),
            other => Err(format!("unknown operator '{}'", other)),
        }
    }
}

/// Operator → values mapping for a single field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, Vec<String>>",
    into = "BTreeMap<String, Vec<String>>"
)]
pub struct Condition {
    ops: BTreeMap<Operator, Vec<String>>,
}

impl Condition {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for a single `=` condition.
    pub fn equals(value: impl Into<String>) -> Self {
        Self::new().with(Operator::Eq, value)
    }

    /// Builder form of [`Condition::push`].
    pub fn with(mut self, op: Operator, value: impl Into<String>) -> Self {
        self.push(op, value);
        self
    }

    /// Append a value to an operator, skipping duplicates.
    pub fn push(&mut self, op: Operator, value: impl Into<String>) {
        let value = value.into();
        let values = self.ops.entry(op).or_default();
        if !values.contains(&value) {
            values.push(value);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Operator, &Vec<String>)> {
        self.ops.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

impl TryFrom<BTreeMap<String, Vec<String>>> for Condition {
    type Error = String;

    fn try_from(raw: BTreeMap<String, Vec<String>>) -> Result<Self, Self::Error> {
        let mut condition = Condition::new();
        for (op, values) in raw {
            let op: Operator = op.parse()?;
            if values.is_empty() {
                condition.ops.entry(op).or_default();
            }
            for value in values {
                condition.push(op, value);
            }
        }
        Ok(condition)
    }
}

impl From<Condition> for BTreeMap<String, Vec<String>> {
    fn from(condition: Condition) -> Self {
        condition
            .ops
            .into_iter()
            .map(|(op, values)| (op.as_str().to_string(), values))
            .collect()
    }
}

/// Field name → condition.
pub type Filter = BTreeMap<String, Condition>;

/// A declarative query binding a key to rows of a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryInfo {
    pub table: String,
    #[serde(default)]
    pub filter: Filter,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl QueryInfo {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            filter: Filter::new(),
            limit: None,
        }
    }

    /// Add a condition to a field, merging with any existing one.
    pub fn when(
        mut self,
        field: impl Into<String>,
        op: Operator,
        value: impl Into<String>,
    ) -> Self {
        self.filter.entry(field.into()).or_default().push(op, value);
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Canonical form of table + conditions + limit.
    ///
    /// Two queries with the same key select the same rows.
    pub fn key(&self) -> String {
        let conditions: Vec<String> = self
            .filter
            .iter()
            .flat_map(|(field, condition)| {
                condition
                    .iter()
                    .map(move |(op, values)| format!("{} {} ({})", field, op, values.join(",")))
            })
            .collect();

        match self.limit {
            Some(limit) => format!("{}|{}|limit={}", self.table, conditions.join("&"), limit),
            None => format!("{}|{}", self.table, conditions.join("&")),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
