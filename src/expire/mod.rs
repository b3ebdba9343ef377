//! Key expiration
//!
//! Keys carry an expire policy in their routing record. Scheduling writes a
//! marker key with a TTL into the distributed store; when the store reports
//! the marker expired, the [`ExpireListener`] hands an [`ExpireEvent`] to the
//! [`ExpireScheduler`], which migrates or refreshes the key under a lock.

mod listener;
mod policy;
mod scheduler;

pub use listener::ExpireListener;
pub use policy::{ExpirePolicy, ScheduleMode};
pub use scheduler::{ExpireOutcome, ExpireScheduler};

use crate::model::KeySpace;

/// A fired expiration marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpireEvent {
    pub kind: String,
    pub id: String,
    /// Trace id of the operation that registered the marker
    pub trace_id: String,
}

impl ExpireEvent {
    pub fn new(
        kind: impl Into<String>,
        id: impl Into<String>,
        trace_id: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            trace_id: trace_id.into(),
        }
    }

    /// Decode an expired key name; `None` if it is not one of our markers.
    pub fn parse(keys: &KeySpace, expired: &str) -> Option<Self> {
        keys.parse_marker(expired)
            .map(|(kind, id, trace_id)| Self::new(kind, id, trace_id))
    }

    /// `type:id`
    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.kind, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_event() {
        let keys = KeySpace::new("app");
        let marker = keys.marker("data", "foo", "t1");

        let event = ExpireEvent::parse(&keys, &marker).unwrap();
        assert_eq!(event, ExpireEvent::new("data", "foo", "t1"));
        assert_eq!(event.cache_key(), "data:foo");

        assert!(ExpireEvent::parse(&keys, &keys.data("data", "foo")).is_none());
        assert!(ExpireEvent::parse(&KeySpace::new("other"), &marker).is_none());
    }
}
