//! Distributed tier repository
//!
//! Data hashes live at `<prefix>::<type>:<id>`. Reads go through the local
//! data cache first; every write keeps the local copy in step.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::domain::{DistributedStore, Tier};
use crate::error::Result;
use crate::expire::ScheduleMode;
use crate::local::CacheService;
use crate::metrics::EngineMetrics;
use crate::model::{FieldMap, KeySpace, KvPair, KvPairs};

pub struct DistributedRepository {
    keys: KeySpace,
    store: Arc<dyn DistributedStore>,
    cache: Arc<CacheService>,
    metrics: Arc<EngineMetrics>,
}

impl DistributedRepository {
    pub fn new(
        keys: KeySpace,
        store: Arc<dyn DistributedStore>,
        cache: Arc<CacheService>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            keys,
            store,
            cache,
            metrics,
        }
    }

    fn data_key(&self, pair: &KvPair) -> String {
        self.keys.data(&pair.kind, &pair.id)
    }

    /// Load a pair from the local copy or the store. Returns false on miss.
    #[instrument(skip_all, fields(key = %pair.cache_key()))]
    pub async fn find(&self, pair: &mut KvPair) -> Result<bool> {
        let cache_key = pair.cache_key();
        if let Some(fields) = self.cache.data().get(&cache_key).await {
            self.metrics.hit(Tier::Local);
            pair.data = fields;
            return Ok(true);
        }
        self.metrics.miss(Tier::Local);

        if self.find_remote(pair).await? {
            self.cache.data().put(cache_key, pair.data.clone());
            return Ok(true);
        }
        Ok(false)
    }

    /// Load a pair from the store only, bypassing the local copy.
    pub async fn find_remote(&self, pair: &mut KvPair) -> Result<bool> {
        let fields = self.store.hash_get_all(&self.data_key(pair)).await?;
        if fields.is_empty() {
            self.metrics.miss(Tier::Distributed);
            return Ok(false);
        }

        self.metrics.hit(Tier::Distributed);
        pair.data = fields;
        Ok(true)
    }

    /// Replace the stored value with the pair's fields.
    pub async fn save(&self, pair: &KvPair) -> Result<()> {
        self.store
            .hash_replace(&self.data_key(pair), &pair.data)
            .await?;
        self.cache.data().put(pair.cache_key(), pair.data.clone());
        debug!(key = %pair.cache_key(), fields = pair.data.len(), "Saved to distributed tier");
        Ok(())
    }

    /// Merge fields into the stored value. Returns whether a value existed.
    pub async fn update(&self, pair: &KvPair, changes: &FieldMap) -> Result<bool> {
        let key = self.data_key(pair);
        let existed = self.store.exists(&key).await?;
        if !existed {
            return Ok(false);
        }

        self.store.hash_set(&key, changes).await?;
        self.cache
            .data()
            .update(&pair.cache_key(), |fields| {
                for (name, value) in changes {
                    fields.insert(name.clone(), value.clone());
                }
            })
            .await;
        Ok(true)
    }

    /// Atomically replace the stored value, returning the previous fields.
    pub async fn find_and_save(&self, pair: &KvPair) -> Result<FieldMap> {
        let previous = self
            .store
            .hash_swap(&self.data_key(pair), &pair.data)
            .await?;
        self.cache.data().put(pair.cache_key(), pair.data.clone());
        Ok(previous)
    }

    pub async fn if_exist(&self, pair: &KvPair) -> Result<bool> {
        if self.cache.data().contains(&pair.cache_key()) {
            return Ok(true);
        }
        self.store.exists(&self.data_key(pair)).await
    }

    /// Load every pair. Returns true only if all were found.
    pub async fn find_batch(&self, pairs: &mut KvPairs) -> Result<bool> {
        let mut all = true;
        for pair in pairs.iter_mut() {
            all &= self.find(pair).await?;
        }
        Ok(all)
    }

    pub async fn save_batch(&self, pairs: &KvPairs) -> Result<()> {
        for pair in pairs.iter() {
            self.save(pair).await?;
        }
        Ok(())
    }

    /// Remove the value, its expiration schedule and the local copy.
    #[instrument(skip_all, fields(key = %pair.cache_key()))]
    pub async fn delete(&self, pair: &KvPair) -> Result<bool> {
        self.cache.data().remove(&pair.cache_key());
        self.store
            .schedule_expire(
                "",
                &self.keys.pointer(&pair.kind, &pair.id),
                ScheduleMode::Cancel,
                std::time::Duration::ZERO,
            )
            .await?;
        Ok(self.store.delete(&[self.data_key(pair)]).await? > 0)
    }
}

impl std::fmt::Debug for DistributedRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedRepository")
            .field("prefix", &self.keys.prefix())
            .finish_non_exhaustive()
    }
}
