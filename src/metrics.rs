//! Prometheus metrics
//!
//! Engine counters live in their own [`Registry`] so several engines (or
//! tests) in one process do not collide on registration.

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::domain::ports::Tier;
use crate::error::Result;

/// Outcome label values for `tierkv_expire_events_total`.
pub mod outcome {
    pub const WRITTEN_BACK: &str = "written_back";
    pub const EVICTED: &str = "evicted";
    pub const REFRESHED: &str = "refreshed";
    pub const MISSING: &str = "missing";
    pub const SKIPPED: &str = "skipped";
    pub const LOCKED: &str = "locked";
    pub const UNROUTED: &str = "unrouted";
    pub const FAILED: &str = "failed";
}

/// Engine metrics.
#[derive(Clone)]
pub struct EngineMetrics {
    registry: Registry,
    tier_hits: IntCounterVec,
    tier_misses: IntCounterVec,
    expire_events: IntCounterVec,
    fallbacks: IntCounter,
    async_failures: IntCounter,
    local_entries: IntGaugeVec,
}

impl EngineMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let tier_hits = IntCounterVec::new(
            Opts::new("tierkv_tier_hits_total", "Reads answered by a tier"),
            &["tier"],
        )?;
        let tier_misses = IntCounterVec::new(
            Opts::new("tierkv_tier_misses_total", "Reads a tier could not answer"),
            &["tier"],
        )?;
        let expire_events = IntCounterVec::new(
            Opts::new("tierkv_expire_events_total", "Handled expiration events"),
            &["outcome"],
        )?;
        let fallbacks = IntCounter::new(
            "tierkv_fallbacks_total",
            "Table operations retried against the default table",
        )?;
        let async_failures = IntCounter::new(
            "tierkv_async_failures_total",
            "Background tier operations that failed",
        )?;
        let local_entries = IntGaugeVec::new(
            Opts::new("tierkv_local_cache_entries", "Entries held by each local cache"),
            &["cache"],
        )?;

        registry.register(Box::new(tier_hits.clone()))?;
        registry.register(Box::new(tier_misses.clone()))?;
        registry.register(Box::new(expire_events.clone()))?;
        registry.register(Box::new(fallbacks.clone()))?;
        registry.register(Box::new(async_failures.clone()))?;
        registry.register(Box::new(local_entries.clone()))?;

        Ok(Self {
            registry,
            tier_hits,
            tier_misses,
            expire_events,
            fallbacks,
            async_failures,
            local_entries,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn hit(&self, tier: Tier) {
        self.tier_hits.with_label_values(&[tier.as_str()]).inc();
    }

    pub fn miss(&self, tier: Tier) {
        self.tier_misses.with_label_values(&[tier.as_str()]).inc();
    }

    pub fn expire_event(&self, outcome: &str) {
        self.expire_events.with_label_values(&[outcome]).inc();
    }

    pub fn fallback(&self) {
        self.fallbacks.inc();
    }

    pub fn async_failure(&self) {
        self.async_failures.inc();
    }

    pub fn set_local_entries(&self, cache: &str, entries: usize) {
        self.local_entries
            .with_label_values(&[cache])
            .set(entries as i64);
    }

    pub fn hits(&self, tier: Tier) -> u64 {
        self.tier_hits.with_label_values(&[tier.as_str()]).get()
    }

    pub fn misses(&self, tier: Tier) -> u64 {
        self.tier_misses.with_label_values(&[tier.as_str()]).get()
    }

    pub fn expire_events(&self, outcome: &str) -> u64 {
        self.expire_events.with_label_values(&[outcome]).get()
    }

    pub fn fallbacks(&self) -> u64 {
        self.fallbacks.get()
    }

    pub fn async_failures(&self) -> u64 {
        self.async_failures.get()
    }

    /// Text exposition format.
    pub fn encode(&self) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }
}

impl std::fmt::Debug for EngineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineMetrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = EngineMetrics::new().unwrap();
        metrics.hit(Tier::Distributed);
        metrics.hit(Tier::Distributed);
        metrics.miss(Tier::Local);
        metrics.expire_event(outcome::WRITTEN_BACK);
        metrics.fallback();

        assert_eq!(metrics.hits(Tier::Distributed), 2);
        assert_eq!(metrics.misses(Tier::Local), 1);
        assert_eq!(metrics.expire_events(outcome::WRITTEN_BACK), 1);
        assert_eq!(metrics.fallbacks(), 1);
        assert_eq!(metrics.async_failures(), 0);
    }

    #[test]
    fn test_encode() {
        let metrics = EngineMetrics::new().unwrap();
        metrics.set_local_entries("data", 3);
        metrics.hit(Tier::Relational);

        let (content_type, body) = metrics.encode().unwrap();
        let body = String::from_utf8(body).unwrap();
        assert!(content_type.starts_with("text/plain"));
        assert!(body.contains("tierkv_local_cache_entries{cache=\"data\"} 3"));
        assert!(body.contains("tierkv_tier_hits_total{tier=\"relational\"} 1"));
    }
}
