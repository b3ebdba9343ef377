//! Routing record repository
//!
//! A key's [`KeyInfo`] is looked up local cache first, then in the routing
//! hash of its namespace, then as an `info` record in the default table.
//! Records found in a slower tier are copied into the faster ones.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::domain::{DistributedStore, Tier};
use crate::error::Result;
use crate::local::CacheService;
use crate::metrics::EngineMetrics;
use crate::model::{AnyKey, Context, FieldMap, KeyInfo, KeySpace, KvPair, KvPairs, INFO_TYPE};
use crate::ops::TaskPool;

use super::relational::RelationalRepository;

pub struct RoutingRepository {
    keys: KeySpace,
    store: Arc<dyn DistributedStore>,
    relational: Arc<RelationalRepository>,
    cache: Arc<CacheService>,
    pool: Arc<TaskPool>,
    metrics: Arc<EngineMetrics>,
}

impl RoutingRepository {
    pub fn new(
        keys: KeySpace,
        store: Arc<dyn DistributedStore>,
        relational: Arc<RelationalRepository>,
        cache: Arc<CacheService>,
        pool: Arc<TaskPool>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            keys,
            store,
            relational,
            cache,
            pool,
            metrics,
        }
    }

    /// Persisted routing record of a pair, if any.
    #[instrument(skip_all, fields(key = %pair.cache_key()))]
    pub async fn find(&self, ctx: &Context, pair: &KvPair) -> Result<Option<KeyInfo>> {
        if pair.generated {
            return Ok(None);
        }
        let _stage = ctx.stage("routing.find");
        let cache_key = pair.cache_key();

        if let Some(info) = self.cache.routes().get(&cache_key).await {
            self.metrics.hit(Tier::Local);
            return Ok(Some(info));
        }

        let routing_key = self.keys.routing(&pair.kind);
        if let Some(value) = self.store.hash_get(&routing_key, &pair.id).await? {
            let info = decode_record(value)?;
            self.metrics.hit(Tier::Distributed);
            self.cache.routes().put(cache_key, info.clone());
            return Ok(Some(info));
        }
        self.metrics.miss(Tier::Distributed);

        let Some(value) = self.relational.load_record(INFO_TYPE, &cache_key).await? else {
            return Ok(None);
        };
        let info = decode_record(value)?;
        debug!(key = %cache_key, "Routing record restored from relational tier");

        self.cache.routes().put(cache_key, info.clone());
        let store = Arc::clone(&self.store);
        let fields = Self::field(&pair.id, &info)?;
        let backfill = async move { store.hash_set(&routing_key, &fields).await };
        if ctx.is_sync() {
            backfill.await?;
        } else {
            self.pool.submit(ctx, "routing.backfill", backfill).await?;
        }
        Ok(Some(info))
    }

    /// Merge a request's routing metadata with the persisted record.
    ///
    /// With no persisted record the request's metadata is taken as new.
    pub fn resolve(
        &self,
        requested: &KeyInfo,
        found: Option<KeyInfo>,
        pair: &KvPair,
    ) -> Result<KeyInfo> {
        match found {
            Some(found) => found.reconcile(requested, &pair.cache_key()),
            None => Ok(KeyInfo {
                is_new: true,
                ..requested.clone()
            }),
        }
    }

    /// Look up and resolve the routing record of a pair in one step.
    pub async fn resolve_for(
        &self,
        ctx: &Context,
        pair: &KvPair,
        requested: &KeyInfo,
    ) -> Result<KeyInfo> {
        let found = self.find(ctx, pair).await?;
        self.resolve(requested, found, pair)
    }

    /// Persist a record that is new or changed, then mark it clean.
    #[instrument(skip_all, fields(key = %pair.cache_key()))]
    pub async fn save(&self, ctx: &Context, pair: &KvPair, info: &mut KeyInfo) -> Result<()> {
        if !info.is_new {
            return Ok(());
        }
        let _stage = ctx.stage("routing.save");
        info.is_new = false;

        let cache_key = pair.cache_key();
        self.cache.routes().put(cache_key.clone(), info.clone());

        let store = Arc::clone(&self.store);
        let relational = Arc::clone(&self.relational);
        let routing_key = self.keys.routing(&pair.kind);
        let fields = Self::field(&pair.id, info)?;
        let record = serde_json::to_value(&*info)?;
        let persist_record = !info.no_db;

        let persist = async move {
            store.hash_set(&routing_key, &fields).await?;
            if persist_record {
                relational.store_record(INFO_TYPE, &cache_key, &record).await?;
            }
            Ok(())
        };

        if ctx.is_sync() {
            persist.await
        } else {
            self.pool.submit(ctx, "routing.save", persist).await
        }
    }

    /// Save the routing record of every pair of a batch.
    pub async fn save_batch(
        &self,
        ctx: &Context,
        pairs: &KvPairs,
        keys: &mut AnyKey,
    ) -> Result<()> {
        keys.ensure_aligned(pairs)?;
        for (pair, info) in pairs.iter().zip(keys.iter_mut()) {
            self.save(ctx, pair, info).await?;
        }
        Ok(())
    }

    /// Drop the cached copies. The relational record is kept.
    pub async fn delete(&self, pair: &KvPair) -> Result<()> {
        self.cache.routes().remove(&pair.cache_key());
        let removed = self
            .store
            .hash_delete_field(&self.keys.routing(&pair.kind), &pair.id)
            .await?;
        if !removed {
            warn!(key = %pair.cache_key(), "No distributed routing record to remove");
        }
        Ok(())
    }

    fn field(id: &str, info: &KeyInfo) -> Result<FieldMap> {
        let mut fields = FieldMap::new();
        fields.insert(id.to_string(), serde_json::to_value(info)?);
        Ok(fields)
    }
}

impl std::fmt::Debug for RoutingRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingRepository")
            .field("prefix", &self.keys.prefix())
            .finish_non_exhaustive()
    }
}

/// Decode a routing record value.
pub fn decode_record(value: Value) -> Result<KeyInfo> {
    Ok(serde_json::from_value(value)?)
}
