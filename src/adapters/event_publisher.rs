//! Event Publisher Adapters
//!
//! `LoggingEventPublisher` turns tier events into tracing records and is the
//! engine's default sink. `InMemoryEventCollector` keeps them for assertions.

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::domain::events::TierEvent;
use crate::domain::ports::EventPublisher;
use crate::error::Result;

/// Writes tier events to the log.
///
/// Fallbacks and failed background tasks log at warn, cache movement at
/// debug.
#[derive(Debug, Clone, Default)]
pub struct LoggingEventPublisher;

impl LoggingEventPublisher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, event: TierEvent) -> Result<()> {
        let key = event.key().unwrap_or("-");
        match &event {
            TierEvent::FallbackUsed { table, reason, .. } => {
                warn!(key, table = %table, "Default table used: {}", reason);
            }
            TierEvent::AsyncTaskFailed {
                trace_id,
                label,
                reason,
                ..
            } => {
                warn!(
                    trace_id = %trace_id,
                    label = %label,
                    "Background tier task failed: {}",
                    reason
                );
            }
            _ => debug!(key, event_type = event.event_type(), "Tier event"),
        }
        Ok(())
    }

    async fn publish_all(&self, events: Vec<TierEvent>) -> Result<()> {
        for event in events {
            self.publish(event).await?;
        }
        Ok(())
    }
}

/// Collects published events in memory.
#[derive(Debug, Default)]
pub struct InMemoryEventCollector {
    events: RwLock<Vec<TierEvent>>,
}

impl InMemoryEventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TierEvent> {
        self.events.read().clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Events whose `event_type()` is `event_type`, e.g. `"FallbackUsed"`.
    pub fn events_of_type(&self, event_type: &str) -> Vec<TierEvent> {
        self.matching(|event| event.event_type() == event_type)
    }

    /// Events about one cache key (`<type>:<id>`).
    pub fn events_for_key(&self, key: &str) -> Vec<TierEvent> {
        self.matching(|event| event.key() == Some(key))
    }

    fn matching(&self, keep: impl Fn(&TierEvent) -> bool) -> Vec<TierEvent> {
        self.events
            .read()
            .iter()
            .filter(|event| keep(event))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventCollector {
    async fn publish(&self, event: TierEvent) -> Result<()> {
        self.events.write().push(event);
        Ok(())
    }

    async fn publish_all(&self, events: Vec<TierEvent>) -> Result<()> {
        self.events.write().extend(events);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::Tier;

    #[tokio::test]
    async fn test_logging_publisher_accepts_every_kind() {
        let publisher = LoggingEventPublisher::new();
        publisher
            .publish_all(vec![
                TierEvent::evicted("data:foo"),
                TierEvent::fallback("user:1", "users", "unknown column nickname"),
                TierEvent::async_failed("t-1", "upsert", "connection reset"),
            ])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_collector_filters_by_type_and_key() {
        let collector = InMemoryEventCollector::new();
        assert!(collector.is_empty());

        collector
            .publish_all(vec![
                TierEvent::promoted("data:a", Tier::Relational, Tier::Distributed),
                TierEvent::promoted("data:b", Tier::Relational, Tier::Distributed),
                TierEvent::evicted("data:a"),
            ])
            .await
            .unwrap();

        assert_eq!(collector.len(), 3);
        assert_eq!(collector.events_of_type("KeyPromoted").len(), 2);

        let about_a = collector.events_for_key("data:a");
        assert_eq!(about_a.len(), 2);
        assert_eq!(about_a[1].event_type(), "KeyEvicted");
        assert!(collector.events_for_key("data:zzz").is_empty());
    }
}
