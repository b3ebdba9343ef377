//! Error types for tierkv

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while routing keys across the cache tiers
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    // =========================================================================
    // Client Errors
    // =========================================================================
    /// Filter condition is malformed or ambiguous
    #[error("Invalid condition on field '{field}': {reason}")]
    InvalidCondition { field: String, reason: String },

    /// Identifier (table or column) is not a plain SQL identifier
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Attempt to change an established table or query binding
    #[error("Key {key} is bound to {established}, cannot rebind to {requested}")]
    BindingConflict {
        key: String,
        established: String,
        requested: String,
    },

    /// Target table does not exist
    #[error("Unknown table: {0}")]
    UnknownTable(String),

    /// Submitted fields are not part of the target table
    #[error("Fields {fields:?} do not exist in table {table}")]
    SchemaMismatch { table: String, fields: Vec<String> },

    /// Expiration policy string could not be parsed
    #[error("Invalid expire policy: {0}")]
    InvalidExpire(String),

    /// Required body, key or clause is missing
    #[error("Missing input: {0}")]
    MissingInput(String),

    // =========================================================================
    // Lookup Errors
    // =========================================================================
    /// Key absent from every tier
    #[error("Key not found: {0}")]
    NotFound(String),

    // =========================================================================
    // Tier Errors
    // =========================================================================
    /// Distributed cache error
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Relational store error
    #[error("SQL error: {0}")]
    Sql(#[from] rusqlite::Error),

    /// Value encoding error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metrics registry error
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Background work queue no longer accepts tasks
    #[error("Task queue closed")]
    QueueClosed,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for errors caused by the request rather than by a tier.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidCondition { .. }
                | Error::InvalidIdentifier(_)
                | Error::BindingConflict { .. }
                | Error::UnknownTable(_)
                | Error::SchemaMismatch { .. }
                | Error::InvalidExpire(_)
                | Error::MissingInput(_)
        )
    }

    /// HTTP-equivalent status for the request layer.
    pub fn status_code(&self) -> u16 {
        if self.is_client_error() {
            400
        } else if matches!(self, Error::NotFound(_)) {
            404
        } else {
            500
        }
    }

    /// Errors that the relational repository may answer by retrying
    /// the operation against the default table.
    pub fn allows_fallback(&self) -> bool {
        matches!(
            self,
            Error::Sql(_) | Error::UnknownTable(_) | Error::SchemaMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let err = Error::InvalidCondition {
            field: "age".into(),
            reason: "empty".into(),
        };
        assert_eq!(err.status_code(), 400);
        assert!(err.is_client_error());

        assert_eq!(Error::NotFound("foo".into()).status_code(), 404);
        assert_eq!(Error::Internal("boom".into()).status_code(), 500);
        assert_eq!(Error::QueueClosed.status_code(), 500);
    }

    #[test]
    fn test_fallback_classification() {
        let mismatch = Error::SchemaMismatch {
            table: "users".into(),
            fields: vec!["c".into()],
        };
        assert!(mismatch.allows_fallback());
        assert!(Error::UnknownTable("users".into()).allows_fallback());
        assert!(!Error::BindingConflict {
            key: "k".into(),
            established: "a".into(),
            requested: "b".into(),
        }
        .allows_fallback());
    }

    #[test]
    fn test_display() {
        let err = Error::SchemaMismatch {
            table: "users".into(),
            fields: vec!["c".into()],
        };
        assert_eq!(err.to_string(), "Fields [\"c\"] do not exist in table users");
    }
}
