//! tierkv - tiered cache consistency middleware
//!
//! Keeps a process-local cache, a Redis-compatible distributed cache and a
//! SQL store consistent for the same keys. Reads fall through the tiers and
//! promote what they find; writes land in the tier the operation names, and
//! per-key expire policies migrate or refresh values between the cache and
//! relational tiers.
//!
//! # Architecture
//!
//! ```text
//! Engine ──▶ RoutingRepository ──▶ local / distributed / relational
//!    │ ──▶ DistributedRepository ──▶ local cache, DistributedStore
//!    │ ──▶ RelationalRepository  ──▶ SqlExecutor
//!    └──▶ ExpireScheduler ◀── ExpireListener ◀── expiration feed
//! ```
//!
//! # Modules
//!
//! - [`adapters`] - Redis, in-memory and SQLite implementations of the ports
//! - [`config`] - Engine and local cache settings
//! - [`domain`] - Ports and tier events
//! - [`error`] - Error types
//! - [`expire`] - Expire policies, scheduling and the expiration listener
//! - [`local`] - Process-local TTL caches
//! - [`metrics`] - Prometheus counters
//! - [`model`] - Pairs, routing metadata and execution context
//! - [`ops`] - The engine and its background worker pool
//! - [`repository`] - Per-tier repositories
//! - [`sql`] - Query builder and schema metadata

pub mod adapters;
pub mod config;
pub mod domain;
pub mod error;
pub mod expire;
pub mod local;
pub mod metrics;
pub mod model;
pub mod ops;
pub mod repository;
pub mod sql;

// Re-export commonly used types
pub use config::{EngineConfig, LocalCacheConfig};
pub use error::{Error, Result};
pub use expire::ExpirePolicy;
pub use metrics::EngineMetrics;
pub use model::{AnyKey, Context, ExecMode, FieldMap, KeyInfo, KvPair, KvPairs, QueryInfo};
pub use ops::{Background, Engine, EngineBuilder};

/// Crate version
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
