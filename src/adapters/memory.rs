//! In-Memory Distributed Store
//!
//! Implements the `DistributedStore` port inside the process. Key TTLs run
//! on tokio timers, so tests can drive expiry with a paused clock.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::trace;

use crate::domain::ports::{DistributedStore, ExpiredKeys};
use crate::error::{Error, Result};
use crate::expire::ScheduleMode;
use crate::model::FieldMap;

#[derive(Debug, Clone)]
enum Stored {
    Hash(FieldMap),
    Text(String),
}

#[derive(Debug)]
struct Slot {
    value: Stored,
    /// Bumped on every write so stale TTL timers do nothing
    generation: u64,
}

#[derive(Debug, Default)]
struct Shared {
    entries: Mutex<HashMap<String, Slot>>,
    next_generation: Mutex<u64>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<String>>>,
}

impl Shared {
    fn generation(&self) -> u64 {
        let mut next = self.next_generation.lock();
        *next += 1;
        *next
    }

    fn notify_expired(&self, key: &str) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(key.to_string()).is_ok());
    }
}

/// Distributed store held in process memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    shared: Arc<Shared>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.shared.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Plain string value of a key.
    pub fn get_text(&self, key: &str) -> Option<String> {
        match self.shared.entries.lock().get(key) {
            Some(Slot {
                value: Stored::Text(text),
                ..
            }) => Some(text.clone()),
            _ => None,
        }
    }

    fn contains(&self, key: &str) -> bool {
        self.shared.entries.lock().contains_key(key)
    }

    /// Store a string value through an entries guard the caller holds.
    fn put_text(
        &self,
        entries: &mut HashMap<String, Slot>,
        key: &str,
        text: String,
        ttl: Option<Duration>,
    ) {
        let generation = self.shared.generation();
        entries.insert(
            key.to_string(),
            Slot {
                value: Stored::Text(text),
                generation,
            },
        );

        if let Some(ttl) = ttl {
            let shared = Arc::clone(&self.shared);
            let key = key.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(ttl).await;
                let expired = {
                    let mut entries = shared.entries.lock();
                    match entries.get(&key) {
                        Some(slot) if slot.generation == generation => {
                            entries.remove(&key);
                            true
                        }
                        _ => false,
                    }
                };
                if expired {
                    trace!(key = %key, "Key expired");
                    shared.notify_expired(&key);
                }
            });
        }
    }

    fn remove(&self, key: &str) -> bool {
        self.shared.entries.lock().remove(key).is_some()
    }

    /// Apply `f` to the hash at `key`, creating it if needed.
    fn with_hash<T>(&self, key: &str, f: impl FnOnce(&mut FieldMap) -> T) -> Result<T> {
        let generation = self.shared.generation();
        let mut entries = self.shared.entries.lock();
        let slot = entries.entry(key.to_string()).or_insert_with(|| Slot {
            value: Stored::Hash(FieldMap::new()),
            generation,
        });
        let (out, emptied) = match &mut slot.value {
            Stored::Hash(fields) => {
                let out = f(fields);
                (out, fields.is_empty())
            }
            Stored::Text(_) => return Err(wrong_type(key)),
        };
        if emptied {
            entries.remove(key);
        }
        Ok(out)
    }
}

fn wrong_type(key: &str) -> Error {
    Error::Internal(format!("WRONGTYPE operation against key {}", key))
}

/// Glob matching with `*` and `?`.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

#[async_trait]
impl DistributedStore for InMemoryStore {
    async fn hash_get_all(&self, key: &str) -> Result<FieldMap> {
        match self.shared.entries.lock().get(key) {
            Some(Slot {
                value: Stored::Hash(fields),
                ..
            }) => Ok(fields.clone()),
            Some(_) => Err(wrong_type(key)),
            None => Ok(FieldMap::new()),
        }
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Value>> {
        Ok(self.hash_get_all(key).await?.remove(field))
    }

    async fn hash_set(&self, key: &str, fields: &FieldMap) -> Result<()> {
        self.with_hash(key, |hash| {
            for (name, value) in fields {
                hash.insert(name.clone(), value.clone());
            }
        })
    }

    async fn hash_replace(&self, key: &str, fields: &FieldMap) -> Result<()> {
        self.remove(key);
        self.hash_set(key, fields).await
    }

    async fn hash_swap(&self, key: &str, fields: &FieldMap) -> Result<FieldMap> {
        let previous = self.hash_get_all(key).await?;
        self.hash_replace(key, fields).await?;
        Ok(previous)
    }

    async fn hash_delete_field(&self, key: &str, field: &str) -> Result<bool> {
        if !self.contains(key) {
            return Ok(false);
        }
        self.with_hash(key, |hash| hash.remove(field).is_some())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        Ok(keys.iter().filter(|key| self.remove(key)).count() as u64)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.contains(key))
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .shared
            .entries
            .lock()
            .keys()
            .filter(|key| glob_match(pattern, key))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn schedule_expire(
        &self,
        marker: &str,
        pointer: &str,
        mode: ScheduleMode,
        ttl: Duration,
    ) -> Result<bool> {
        let mut entries = self.shared.entries.lock();
        let live = match entries.get(pointer) {
            Some(Slot {
                value: Stored::Text(name),
                ..
            }) => Some(name.clone()),
            _ => None,
        };

        match mode {
            ScheduleMode::Cancel => {
                let Some(live) = live else {
                    return Ok(false);
                };
                entries.remove(&live);
                entries.remove(pointer);
                Ok(true)
            }
            ScheduleMode::IfAbsent => {
                if live.is_some_and(|name| entries.contains_key(&name)) {
                    return Ok(false);
                }
                self.put_text(&mut entries, marker, "1".to_string(), Some(ttl));
                self.put_text(&mut entries, pointer, marker.to_string(), Some(ttl));
                Ok(true)
            }
            ScheduleMode::Overwrite => {
                if let Some(live) = live {
                    entries.remove(&live);
                }
                self.put_text(&mut entries, marker, "1".to_string(), Some(ttl));
                self.put_text(&mut entries, pointer, marker.to_string(), Some(ttl));
                Ok(true)
            }
        }
    }

    async fn acquire_lock(&self, key: &str, token: &str, timeout: Duration) -> Result<bool> {
        let mut entries = self.shared.entries.lock();
        if entries.contains_key(key) {
            return Ok(false);
        }
        self.put_text(&mut entries, key, token.to_string(), Some(timeout));
        Ok(true)
    }

    async fn release_lock(&self, key: &str, token: &str) -> Result<bool> {
        let mut entries = self.shared.entries.lock();
        match entries.get(key) {
            Some(Slot {
                value: Stored::Text(held),
                ..
            }) if held == token => Ok(entries.remove(key).is_some()),
            _ => Ok(false),
        }
    }

    async fn subscribe_expired(&self) -> Result<ExpiredKeys> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.subscribers.lock().push(tx);

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|key| (key, rx))
        });
        Ok(stream.boxed())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> FieldMap {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("app::*", "app::data:foo"));
        assert!(glob_match("*foo", "app::data:foo"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("app::*", "other::data:foo"));
        assert!(glob_match("*", ""));
    }

    #[tokio::test]
    async fn test_hash_operations() {
        let store = InMemoryStore::new();
        store.hash_set("h", &fields(json!({"a": 1}))).await.unwrap();
        store.hash_set("h", &fields(json!({"b": 2}))).await.unwrap();
        assert_eq!(store.hash_get("h", "b").await.unwrap(), Some(json!(2)));
        assert_eq!(store.hash_get("h", "z").await.unwrap(), None);
        assert_eq!(store.hash_get_all("h").await.unwrap(), fields(json!({"a": 1, "b": 2})));

        let old = store.hash_swap("h", &fields(json!({"c": 3}))).await.unwrap();
        assert_eq!(old.len(), 2);
        assert_eq!(store.hash_get_all("h").await.unwrap(), fields(json!({"c": 3})));

        assert!(store.hash_delete_field("h", "c").await.unwrap());
        assert!(!store.exists("h").await.unwrap());
        assert!(store.hash_get_all("missing").await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_if_absent_keeps_first_marker() {
        let store = InMemoryStore::new();
        let ttl = Duration::from_secs(30);

        assert!(store
            .schedule_expire("m1", "p", ScheduleMode::IfAbsent, ttl)
            .await
            .unwrap());
        assert!(!store
            .schedule_expire("m2", "p", ScheduleMode::IfAbsent, ttl)
            .await
            .unwrap());
        assert_eq!(store.get_text("p").as_deref(), Some("m1"));

        assert!(store
            .schedule_expire("m2", "p", ScheduleMode::Overwrite, ttl)
            .await
            .unwrap());
        assert!(!store.exists("m1").await.unwrap());
        assert_eq!(store.get_text("p").as_deref(), Some("m2"));

        assert!(store
            .schedule_expire("", "p", ScheduleMode::Cancel, ttl)
            .await
            .unwrap());
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_markers_are_published() {
        let store = InMemoryStore::new();
        let mut expired = store.subscribe_expired().await.unwrap();

        store
            .schedule_expire("m1", "p", ScheduleMode::IfAbsent, Duration::from_secs(5))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        let mut seen = vec![expired.next().await.unwrap(), expired.next().await.unwrap()];
        seen.sort();
        assert_eq!(seen, vec!["m1".to_string(), "p".to_string()]);
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_is_exclusive_and_token_checked() {
        let store = InMemoryStore::new();
        let timeout = Duration::from_secs(10);

        assert!(store.acquire_lock("l", "t1", timeout).await.unwrap());
        assert!(!store.acquire_lock("l", "t2", timeout).await.unwrap());
        assert!(!store.release_lock("l", "t2").await.unwrap());
        assert!(store.release_lock("l", "t1").await.unwrap());

        assert!(store.acquire_lock("l", "t2", timeout).await.unwrap());
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(store.acquire_lock("l", "t3", timeout).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_racing_lock_and_schedule_have_one_winner() {
        let store = InMemoryStore::new();
        let timeout = Duration::from_secs(60);

        let locks = (0..8).map(|n| {
            let store = store.clone();
            tokio::spawn(async move {
                let token = format!("t{n}");
                store.acquire_lock("l", &token, timeout).await
            })
        });
        let schedules = (0..8).map(|n| {
            let store = store.clone();
            tokio::spawn(async move {
                let marker = format!("m{n}");
                store
                    .schedule_expire(&marker, "p", ScheduleMode::IfAbsent, timeout)
                    .await
            })
        });

        let mut locked = 0;
        for handle in futures::future::join_all(locks).await {
            locked += usize::from(handle.unwrap().unwrap());
        }
        let mut scheduled = 0;
        for handle in futures::future::join_all(schedules).await {
            scheduled += usize::from(handle.unwrap().unwrap());
        }

        assert_eq!(locked, 1);
        assert_eq!(scheduled, 1);
        assert_eq!(store.keys("m*").await.unwrap().len(), 1);
    }
}
