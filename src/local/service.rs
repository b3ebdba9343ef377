//! Local cache service
//!
//! Owns the three process-local caches and their recycler loop. One
//! instance is created per engine and injected where needed.

use std::sync::Arc;

use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use super::cache::{LocalCache, RecycleStats};
use crate::config::LocalCacheConfig;
use crate::metrics::EngineMetrics;
use crate::model::{FieldMap, KeyInfo};
use crate::sql::TableMeta;

/// Routing, data and schema caches.
pub struct CacheService {
    routes: LocalCache<KeyInfo>,
    data: LocalCache<FieldMap>,
    tables: LocalCache<Arc<TableMeta>>,
    config: LocalCacheConfig,
    metrics: Option<Arc<EngineMetrics>>,
}

impl CacheService {
    pub fn new(config: LocalCacheConfig) -> Self {
        Self {
            routes: LocalCache::new("routing", config.routing_ttl(), config.max_entries),
            data: LocalCache::new("data", config.data_ttl(), config.max_entries),
            tables: LocalCache::new("schema", config.schema_ttl(), config.max_entries),
            config,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Routing records keyed by `type:id`.
    pub fn routes(&self) -> &LocalCache<KeyInfo> {
        &self.routes
    }

    /// Field maps keyed by `type:id`.
    pub fn data(&self) -> &LocalCache<FieldMap> {
        &self.data
    }

    /// Table schemas keyed by table name.
    pub fn tables(&self) -> &LocalCache<Arc<TableMeta>> {
        &self.tables
    }

    /// Recycle every cache once.
    pub async fn recycle(&self) -> RecycleStats {
        let (routes, data, tables) =
            tokio::join!(self.routes.recycle(), self.data.recycle(), self.tables.recycle());

        if let Some(metrics) = &self.metrics {
            metrics.set_local_entries(self.routes.name(), self.routes.len());
            metrics.set_local_entries(self.data.name(), self.data.len());
            metrics.set_local_entries(self.tables.name(), self.tables.len());
        }

        RecycleStats {
            expired: routes.expired + data.expired + tables.expired,
            refreshed: routes.refreshed + data.refreshed + tables.refreshed,
            evicted: routes.evicted + data.evicted + tables.evicted,
        }
    }

    /// Run the recycler until cancelled.
    #[instrument(skip(self, token))]
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        info!(
            "Starting local cache recycler every {:?}",
            self.config.recycle_interval()
        );

        let mut tick = interval(self.config.recycle_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Local cache recycler shutting down");
                    break;
                }
                _ = tick.tick() => {
                    self.recycle().await;
                }
            }
        }
    }
}

impl std::fmt::Debug for CacheService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheService")
            .field("routes", &self.routes.len())
            .field("data", &self.data.len())
            .field("tables", &self.tables.len())
            .finish()
    }
}
