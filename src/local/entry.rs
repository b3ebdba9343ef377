//! Local cache entries

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::Result;

/// Recomputes a cached value when it times out.
pub type RefreshFn<V> = Arc<dyn Fn() -> BoxFuture<'static, Result<V>> + Send + Sync>;

/// A cached value with its lifetime.
///
/// Entries are immutable apart from the access timestamp; renewing an
/// entry replaces it in the map.
pub struct Entry<V> {
    pub(crate) value: V,
    created: Instant,
    ttl: Duration,
    last_access: Mutex<Instant>,
    pub(crate) refresh: Option<RefreshFn<V>>,
}

impl<V: Clone> Entry<V> {
    pub fn new(value: V, ttl: Duration, refresh: Option<RefreshFn<V>>) -> Self {
        let now = Instant::now();
        Self {
            value,
            created: now,
            ttl,
            last_access: Mutex::new(now),
            refresh,
        }
    }

    /// Fresh entry carrying a new value with the same TTL and refresh fn.
    pub fn renewed(&self, value: V) -> Self {
        Self::new(value, self.ttl, self.refresh.clone())
    }

    /// Same lifetime baseline, different value.
    pub fn with_value(&self, value: V) -> Self {
        Self {
            value,
            created: self.created,
            ttl: self.ttl,
            last_access: Mutex::new(Instant::now()),
            refresh: self.refresh.clone(),
        }
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created)
    }

    /// Past the full TTL.
    pub fn timed_out(&self, now: Instant) -> bool {
        self.age(now) >= self.ttl
    }

    /// Past three quarters of the TTL; due for a background refresh.
    pub fn refresh_due(&self, now: Instant) -> bool {
        self.age(now) >= self.ttl.mul_f64(0.75)
    }

    pub fn is_refreshable(&self) -> bool {
        self.refresh.is_some()
    }

    pub fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    pub fn last_access(&self) -> Instant {
        *self.last_access.lock()
    }
}

impl<V> std::fmt::Debug for Entry<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("created", &self.created)
            .field("ttl", &self.ttl)
            .field("refreshable", &self.refresh.is_some())
            .finish()
    }
}
