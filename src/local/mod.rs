//! Process-local cache tier
//!
//! # Components
//!
//! - [`LocalCache`] - concurrent TTL map with refresh and watermark eviction
//! - [`CacheService`] - the routing, data and schema caches of one engine

mod cache;
mod entry;
mod service;

pub use cache::{LocalCache, RecycleStats};
pub use entry::{Entry, RefreshFn};
pub use service::CacheService;
