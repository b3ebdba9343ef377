//! Dynamic SQL
//!
//! Turns declarative filters and field maps into parameterized statements.
//!
//! # Components
//!
//! - [`QueryBuilder`] - select/insert/update/delete statement construction
//! - [`compare`] - loose equality and row diffing for updates
//! - [`TableMeta`] - table schema as reported by the relational adapter

mod builder;
pub mod compare;

pub use builder::QueryBuilder;
pub use compare::{diff_fields, loose_eq, FieldDiff};

use serde_json::Value;

use crate::error::{Error, Result};
use crate::model::FieldMap;

/// Maximum identifier length accepted by the builder.
pub const MAX_IDENTIFIER_LEN: usize = 64;

/// SQL dialect of the relational adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    MySql,
}

impl Dialect {
    /// Quote an identifier that already passed [`check_identifier`].
    pub fn quote(&self, ident: &str) -> String {
        match self {
            Dialect::Sqlite => format!("\"{}\"", ident),
            Dialect::MySql => format!("`{}`", ident),
        }
    }

    /// Whether `UPDATE`/`DELETE` accept a `LIMIT` clause.
    pub fn limits_mutations(&self) -> bool {
        matches!(self, Dialect::MySql)
    }
}

/// Validate a table or column name.
pub fn check_identifier(name: &str) -> Result<&str> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid_start && valid_rest && name.len() <= MAX_IDENTIFIER_LEN {
        Ok(name)
    } else {
        Err(Error::InvalidIdentifier(name.to_string()))
    }
}

/// A parameterized WHERE body and its bound values.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlClause {
    pub sql: String,
    pub params: Vec<Value>,
}

/// A complete statement ready for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// Outcome of a mutating statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Executed {
    /// Rows changed
    pub affected: u64,
    /// Generated auto-increment value of an insert
    pub last_insert_id: Option<i64>,
}

/// One table column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMeta {
    pub name: String,
    pub auto_increment: bool,
}

/// Table schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMeta {
    pub name: String,
    pub columns: Vec<ColumnMeta>,
    /// Primary key columns in key order
    pub primary_key: Vec<String>,
    /// Declared unique indexes
    pub unique_keys: Vec<Vec<String>>,
}

impl TableMeta {
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }

    /// Generated column, if any.
    pub fn auto_increment(&self) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.auto_increment)
            .map(|c| c.name.as_str())
    }

    /// Columns identifying one row: the primary key, else the first
    /// unique index.
    pub fn key_columns(&self) -> Vec<String> {
        if !self.primary_key.is_empty() {
            return self.primary_key.clone();
        }
        self.unique_keys.first().cloned().unwrap_or_default()
    }

    /// Submitted fields the table does not have.
    pub fn unknown_fields(&self, fields: &FieldMap) -> Vec<String> {
        fields
            .keys()
            .filter(|name| !self.has_column(name))
            .cloned()
            .collect()
    }
}
