//! Tier repositories
//!
//! - [`RoutingRepository`] - per-key routing records across all tiers
//! - [`DistributedRepository`] - values in the distributed cache, fronted by
//!   the process-local cache
//! - [`RelationalRepository`] - table rows and default-table records

mod distributed;
mod relational;
mod routing;

pub use distributed::DistributedRepository;
pub use relational::RelationalRepository;
pub use routing::{decode_record, RoutingRepository};
