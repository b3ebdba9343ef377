//! Domain Ports (Port/Adapter Pattern)
//!
//! This module defines the abstractions the tier repositories depend on.
//! Infrastructure adapters implement these traits to provide concrete
//! stores.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Domain Layer                            │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  DistributedStore │ SqlExecutor │ EventPublisher    │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Infrastructure Layer                       │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                  Adapters (Impls)                    │    │
//! │  │  RedisStore │ InMemoryStore │ SqliteExecutor        │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::error::Result;
use crate::expire::ScheduleMode;
use crate::model::FieldMap;
use crate::sql::{Dialect, Executed, Statement, TableMeta};

use super::events::TierEvent;

// =============================================================================
// Value Objects
// =============================================================================

/// Storage tier enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Process-local cache
    Local,
    /// Shared cache store
    Distributed,
    /// Backing database
    Relational,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Local => "local",
            Tier::Distributed => "distributed",
            Tier::Relational => "relational",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Names of keys whose TTL ran out, as reported by the store.
pub type ExpiredKeys = BoxStream<'static, String>;

// =============================================================================
// Distributed Store Port
// =============================================================================

/// Port for the shared key/value cache.
///
/// Values are hashes of JSON fields. Absent hashes read back as empty maps.
#[async_trait]
pub trait DistributedStore: Send + Sync {
    /// Read every field of a hash.
    async fn hash_get_all(&self, key: &str) -> Result<FieldMap>;

    /// Read one field of a hash.
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Value>>;

    /// Merge fields into a hash.
    async fn hash_set(&self, key: &str, fields: &FieldMap) -> Result<()>;

    /// Replace a hash with exactly `fields`.
    async fn hash_replace(&self, key: &str, fields: &FieldMap) -> Result<()>;

    /// Atomically replace a hash and return its previous fields.
    async fn hash_swap(&self, key: &str, fields: &FieldMap) -> Result<FieldMap>;

    /// Remove a single field. Returns whether it existed.
    async fn hash_delete_field(&self, key: &str, field: &str) -> Result<bool>;

    /// Delete keys of any kind. Returns how many existed.
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    /// Check whether a key exists.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// List keys matching a glob pattern.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Register, replace or cancel the expiration marker of a key.
    ///
    /// `pointer` names the live marker. Returns whether the store changed.
    async fn schedule_expire(
        &self,
        marker: &str,
        pointer: &str,
        mode: ScheduleMode,
        ttl: Duration,
    ) -> Result<bool>;

    /// Take a lock if it is free.
    async fn acquire_lock(&self, key: &str, token: &str, timeout: Duration) -> Result<bool>;

    /// Release a lock if it is still held with `token`.
    async fn release_lock(&self, key: &str, token: &str) -> Result<bool>;

    /// Feed of keys that expired.
    async fn subscribe_expired(&self) -> Result<ExpiredKeys>;

    /// Check connectivity.
    async fn health_check(&self) -> Result<bool>;
}

// =============================================================================
// SQL Executor Port
// =============================================================================

/// Port for the relational backing store.
#[async_trait]
pub trait SqlExecutor: Send + Sync {
    /// Dialect used to build statements for this executor.
    fn dialect(&self) -> Dialect;

    /// Run a query and return its rows.
    async fn query(&self, statement: &Statement) -> Result<Vec<FieldMap>>;

    /// Run a mutating statement.
    async fn execute(&self, statement: &Statement) -> Result<Executed>;

    /// Schema of a table, `None` if it does not exist.
    async fn table_meta(&self, table: &str) -> Result<Option<TableMeta>>;

    /// Check connectivity.
    async fn health_check(&self) -> Result<bool>;
}

// =============================================================================
// Event Publisher Port
// =============================================================================

/// Port for publishing tier events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a single event.
    async fn publish(&self, event: TierEvent) -> Result<()>;

    /// Publish multiple events.
    async fn publish_all(&self, events: Vec<TierEvent>) -> Result<()>;
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_display() {
        assert_eq!(Tier::Local.to_string(), "local");
        assert_eq!(Tier::Distributed.to_string(), "distributed");
        assert_eq!(Tier::Relational.to_string(), "relational");
    }
}
