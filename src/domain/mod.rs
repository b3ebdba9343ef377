//! Domain Layer
//!
//! # Architecture
//!
//! The domain layer is organized into:
//!
//! - **Ports** (`ports.rs`) - Trait abstractions for the stores behind each tier
//! - **Events** (`events.rs`) - Tier events for audit and decoupling
//!
//! # Usage
//!
//! ```ignore
//! use tierkv::domain::ports::{DistributedStore, SqlExecutor};
//!
//! async fn warm<S: DistributedStore, E: SqlExecutor>(store: &S, sql: &E) -> Result<()> {
//!     let rows = sql.query(&statement).await?;
//!     store.hash_set("app::data:foo", &rows[0]).await
//! }
//! ```

pub mod events;
pub mod ports;

pub use events::TierEvent;
pub use ports::{DistributedStore, EventPublisher, ExpiredKeys, SqlExecutor, Tier};
