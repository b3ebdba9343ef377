//! Infrastructure Adapters
//!
//! This module contains adapter implementations for the domain ports,
//! following the Port/Adapter (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │     DistributedStore │ SqlExecutor │ EventPublisher        │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ RedisStore │ InMemoryStore │ SqliteExecutor                │ │
//! │  │ LoggingEventPublisher │ InMemoryEventCollector             │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use tierkv::adapters::{RedisStore, SqliteExecutor};
//!
//! let store = RedisStore::connect("redis://127.0.0.1:6379").await?;
//! let sql = SqliteExecutor::open("tierkv.db")?;
//! ```

mod event_publisher;
mod memory;
mod redis_store;
mod sqlite;

pub use event_publisher::{InMemoryEventCollector, LoggingEventPublisher};
pub use memory::InMemoryStore;
pub use redis_store::{RedisStore, EXPIRED_CHANNEL};
pub use sqlite::SqliteExecutor;
