//! Process-local TTL cache
//!
//! A striped concurrent map of string keys to [`Entry`] values.
//!
//! # Eviction
//!
//! Reads drop timed-out entries lazily. The periodic [`LocalCache::recycle`]
//! pass does the rest:
//!
//! 1. evict entries past their full TTL
//! 2. refresh refreshable entries past 3/4 of their TTL
//! 3. above the high watermark (3/4 of capacity), evict by ascending last
//!    access, non-refreshable entries first, until back at the watermark

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::entry::{Entry, RefreshFn};

/// Outcome of one recycle pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecycleStats {
    pub expired: usize,
    pub refreshed: usize,
    pub evicted: usize,
}

/// Concurrent TTL cache.
pub struct LocalCache<V> {
    name: &'static str,
    entries: DashMap<String, Arc<Entry<V>>>,
    ttl: Duration,
    max_entries: usize,
}

impl<V: Clone + Send + Sync + 'static> LocalCache<V> {
    pub fn new(name: &'static str, ttl: Duration, max_entries: usize) -> Self {
        Self {
            name,
            entries: DashMap::new(),
            ttl,
            max_entries,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Size above which the recycler evicts.
    pub fn high_watermark(&self) -> usize {
        self.max_entries * 3 / 4
    }

    fn current(&self, key: &str) -> Option<Arc<Entry<V>>> {
        self.entries.get(key).map(|e| Arc::clone(e.value()))
    }

    /// Replace `key` only if it still holds `expected`.
    fn swap_if_current(&self, key: &str, expected: &Arc<Entry<V>>, entry: Entry<V>) {
        if let Some(mut slot) = self.entries.get_mut(key) {
            if Arc::ptr_eq(slot.value(), expected) {
                *slot.value_mut() = Arc::new(entry);
            }
        }
    }

    fn remove_if_current(&self, key: &str, expected: &Arc<Entry<V>>) -> bool {
        self.entries
            .remove_if(key, |_, current| Arc::ptr_eq(current, expected))
            .is_some()
    }

    /// Run the refresh fn of a timed-out entry. Evicts on failure.
    async fn renew(&self, key: &str, entry: &Arc<Entry<V>>) -> Option<V> {
        let refresh = entry.refresh.as_ref()?;
        match refresh().await {
            Ok(value) => {
                self.swap_if_current(key, entry, entry.renewed(value.clone()));
                Some(value)
            }
            Err(e) => {
                warn!(cache = self.name, key = %key, "Refresh failed, evicting: {}", e);
                self.remove_if_current(key, entry);
                None
            }
        }
    }

    /// Cached value, refreshing or evicting it if timed out.
    pub async fn get(&self, key: &str) -> Option<V> {
        let entry = self.current(key)?;

        if !entry.timed_out(Instant::now()) {
            entry.touch();
            return Some(entry.value.clone());
        }

        if entry.is_refreshable() {
            return self.renew(key, &entry).await;
        }

        self.remove_if_current(key, &entry);
        None
    }

    pub fn put(&self, key: impl Into<String>, value: V) {
        self.put_with_ttl(key, value, self.ttl);
    }

    pub fn put_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        self.entries
            .insert(key.into(), Arc::new(Entry::new(value, ttl, None)));
    }

    /// Cache a value that is recomputed instead of dropped when it times out.
    pub fn put_with_refresh(&self, key: impl Into<String>, value: V, refresh: RefreshFn<V>) {
        self.entries
            .insert(key.into(), Arc::new(Entry::new(value, self.ttl, Some(refresh))));
    }

    /// Modify a cached value in place without moving its TTL baseline.
    ///
    /// A timed-out entry is refreshed first, or evicted if it cannot be.
    /// Returns false if nothing was cached.
    pub async fn update(&self, key: &str, patch: impl FnOnce(&mut V)) -> bool {
        let Some(mut entry) = self.current(key) else {
            return false;
        };

        if entry.timed_out(Instant::now()) {
            if !entry.is_refreshable() {
                self.remove_if_current(key, &entry);
                return false;
            }
            if self.renew(key, &entry).await.is_none() {
                return false;
            }
            match self.current(key) {
                Some(fresh) => entry = fresh,
                None => return false,
            }
        }

        let mut value = entry.value.clone();
        patch(&mut value);
        self.swap_if_current(key, &entry, entry.with_value(value));
        true
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        self.entries.remove(key).map(|(_, e)| e.value.clone())
    }

    /// True if a live (not timed-out) entry exists.
    pub fn contains(&self, key: &str) -> bool {
        self.current(key)
            .is_some_and(|e| !e.timed_out(Instant::now()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// One eviction and refresh pass.
    pub async fn recycle(&self) -> RecycleStats {
        let mut stats = RecycleStats::default();
        let now = Instant::now();

        let snapshot: Vec<(String, Arc<Entry<V>>)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        // Timed out
        let mut live = Vec::with_capacity(snapshot.len());
        for (key, entry) in snapshot {
            if entry.timed_out(now) {
                if self.remove_if_current(&key, &entry) {
                    stats.expired += 1;
                }
            } else {
                live.push((key, entry));
            }
        }

        // Refresh ahead of expiry
        let due: Vec<&(String, Arc<Entry<V>>)> = live
            .iter()
            .filter(|(_, e)| e.is_refreshable() && e.refresh_due(now))
            .collect();
        let refreshed = join_all(due.iter().map(|(key, entry)| self.renew(key, entry))).await;
        stats.refreshed = refreshed.iter().filter(|v| v.is_some()).count();

        // Watermark
        let watermark = self.high_watermark();
        if self.entries.len() > watermark {
            let mut candidates: Vec<(bool, Instant, String, Arc<Entry<V>>)> = self
                .entries
                .iter()
                .map(|e| {
                    let entry = Arc::clone(e.value());
                    (entry.is_refreshable(), entry.last_access(), e.key().clone(), entry)
                })
                .collect();
            candidates.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

            for (_, _, key, entry) in candidates {
                if self.entries.len() <= watermark {
                    break;
                }
                if self.remove_if_current(&key, &entry) {
                    stats.evicted += 1;
                }
            }
        }

        if stats != RecycleStats::default() {
            debug!(
                cache = self.name,
                expired = stats.expired,
                refreshed = stats.refreshed,
                evicted = stats.evicted,
                remaining = self.entries.len(),
                "Recycled local cache"
            );
        }
        stats
    }
}

// =============================================================================
// Tests
// =============================================================================
