//! Tier engine
//!
//! The entry point callers use. Every operation resolves routing metadata
//! first, then drives the distributed and relational repositories in the
//! order the operation needs, and finishes by applying the key's expire
//! policy.
//!
//! # Execution modes
//!
//! A synchronous [`Context`] runs every tier call inline and returns tier
//! errors. An asynchronous one runs the reads the response needs inline and
//! queues the writes on the [`TaskPool`]; their failures go to the
//! [`TraceLog`]. Client errors are detected before anything is queued.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument};

use super::pool::TaskPool;
use super::trace::{TraceLog, TraceRecord};
use crate::adapters::LoggingEventPublisher;
use crate::config::EngineConfig;
use crate::domain::{DistributedStore, EventPublisher, SqlExecutor, Tier, TierEvent};
use crate::error::{Error, Result};
use crate::expire::{ExpireListener, ExpireScheduler};
use crate::local::CacheService;
use crate::metrics::EngineMetrics;
use crate::model::{
    AnyKey, Context, FieldMap, KeyInfo, KeySpace, KvPair, KvPairs, DATA_TYPE, INFO_TYPE,
    TRACE_TYPE,
};
use crate::repository::{DistributedRepository, RelationalRepository, RoutingRepository};

/// Tier work applied to one pair after routing is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Write {
    /// Routing and expire policy only
    Touch,
    /// Copy a relational value into the distributed tier
    Promote,
    Save,
    Insert,
    Update,
    Delete,
}

impl Write {
    fn label(&self) -> &'static str {
        match self {
            Write::Touch => "touch",
            Write::Promote => "promote",
            Write::Save => "save",
            Write::Insert => "insert",
            Write::Update => "update",
            Write::Delete => "delete",
        }
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Wires an [`Engine`] from its stores.
pub struct EngineBuilder {
    config: EngineConfig,
    store: Arc<dyn DistributedStore>,
    sql: Arc<dyn SqlExecutor>,
    metrics: Option<Arc<EngineMetrics>>,
    events: Option<Arc<dyn EventPublisher>>,
}

impl EngineBuilder {
    pub fn metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    /// Validate the configuration and create the default table.
    pub async fn build(self) -> Result<Engine> {
        self.config.validate()?;

        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(EngineMetrics::new()?),
        };
        let events: Arc<dyn EventPublisher> = match self.events {
            Some(events) => events,
            None => Arc::new(LoggingEventPublisher::new()),
        };
        let keys = KeySpace::new(self.config.prefix.clone());

        let cache = Arc::new(
            CacheService::new(self.config.local.clone()).with_metrics(Arc::clone(&metrics)),
        );
        let relational = Arc::new(RelationalRepository::new(
            Arc::clone(&self.sql),
            Arc::clone(&cache),
            Arc::clone(&metrics),
            Arc::clone(&events),
            self.config.default_table.clone(),
            self.config.fallback_to_default,
        ));
        relational.init().await?;

        let trace = Arc::new(TraceLog::new(Arc::clone(&relational)));
        let pool = TaskPool::new(
            self.config.workers,
            self.config.queue_capacity,
            Arc::clone(&trace),
            Arc::clone(&metrics),
            Arc::clone(&events),
        );
        let routing = Arc::new(RoutingRepository::new(
            keys.clone(),
            Arc::clone(&self.store),
            Arc::clone(&relational),
            Arc::clone(&cache),
            Arc::clone(&pool),
            Arc::clone(&metrics),
        ));
        let distributed = Arc::new(DistributedRepository::new(
            keys.clone(),
            Arc::clone(&self.store),
            Arc::clone(&cache),
            Arc::clone(&metrics),
        ));
        let scheduler = Arc::new(ExpireScheduler::new(
            keys.clone(),
            Arc::clone(&self.store),
            Arc::clone(&routing),
            Arc::clone(&distributed),
            Arc::clone(&relational),
            self.config.lock_timeout(),
            Arc::clone(&metrics),
            Arc::clone(&events),
        ));

        info!(
            prefix = %self.config.prefix,
            default_table = %self.config.default_table,
            workers = self.config.workers,
            "Engine ready"
        );

        Ok(Engine {
            config: Arc::new(self.config),
            keys,
            store: self.store,
            sql: self.sql,
            cache,
            routing,
            distributed,
            relational,
            scheduler,
            pool,
            trace,
            metrics,
            events,
        })
    }
}

// =============================================================================
// Background Loops
// =============================================================================

/// Handles of the loops started by [`Engine::start`].
pub struct Background {
    token: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl Background {
    /// Cancel every loop and wait for it. Queued pool work is drained first.
    pub async fn shutdown(self) {
        self.token.cancel();
        for (name, handle) in self.handles {
            if let Err(e) = handle.await {
                error!(task = name, "Background task panicked: {}", e);
            }
        }
        info!("Background tasks stopped");
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Tiered key/value engine. Cloning shares all state.
#[derive(Clone)]
pub struct Engine {
    config: Arc<EngineConfig>,
    keys: KeySpace,
    store: Arc<dyn DistributedStore>,
    sql: Arc<dyn SqlExecutor>,
    cache: Arc<CacheService>,
    routing: Arc<RoutingRepository>,
    distributed: Arc<DistributedRepository>,
    relational: Arc<RelationalRepository>,
    scheduler: Arc<ExpireScheduler>,
    pool: Arc<TaskPool>,
    trace: Arc<TraceLog>,
    metrics: Arc<EngineMetrics>,
    events: Arc<dyn EventPublisher>,
}

impl Engine {
    pub fn builder(
        config: EngineConfig,
        store: Arc<dyn DistributedStore>,
        sql: Arc<dyn SqlExecutor>,
    ) -> EngineBuilder {
        EngineBuilder {
            config,
            store,
            sql,
            metrics: None,
            events: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }

    pub fn cache(&self) -> &Arc<CacheService> {
        &self.cache
    }

    pub fn pool(&self) -> &Arc<TaskPool> {
        &self.pool
    }

    pub fn scheduler(&self) -> &Arc<ExpireScheduler> {
        &self.scheduler
    }

    /// Spawn the worker pool, the local cache recycler and the expiration
    /// listener.
    pub fn start(&self, token: CancellationToken) -> Background {
        let pool = tokio::spawn(Arc::clone(&self.pool).run(token.clone()));
        let recycler = tokio::spawn(Arc::clone(&self.cache).run(token.clone()));

        let listener = Arc::new(ExpireListener::new(
            self.keys.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.scheduler),
            Arc::clone(&self.pool),
        ));
        let listener_token = token.clone();
        let listener = tokio::spawn(async move {
            if let Err(e) = listener.run(listener_token).await {
                error!("Expire listener stopped: {}", e);
            }
        });

        Background {
            token,
            handles: vec![("pool", pool), ("recycler", recycler), ("listener", listener)],
        }
    }

    /// True if both backing stores answer.
    pub async fn health_check(&self) -> Result<bool> {
        Ok(self.store.health_check().await? && self.sql.health_check().await?)
    }

    /// Failures recorded for an async-mode operation.
    pub async fn trace(&self, trace_id: &str) -> Result<Vec<TraceRecord>> {
        self.trace.records(trace_id).await
    }

    // =========================================================================
    // Routing
    // =========================================================================

    /// Resolve every pair's routing record in place of the requested one.
    async fn prepare(&self, ctx: &Context, pairs: &KvPairs, keys: &mut AnyKey) -> Result<()> {
        keys.ensure_aligned(pairs)?;

        for (pair, requested) in pairs.iter().zip(keys.iter_mut()) {
            if pair.kind == INFO_TYPE || pair.kind == TRACE_TYPE {
                return Err(Error::InvalidIdentifier(format!(
                    "'{}' is a reserved namespace",
                    pair.kind
                )));
            }
            if pair.id.is_empty() || pair.kind.is_empty() {
                return Err(Error::MissingInput("key type and id are required".into()));
            }
            requested.expire_policy()?;

            let mut resolved = self.routing.resolve_for(ctx, pair, requested).await?;
            if resolved.expire.is_empty() && !self.config.default_expire.is_empty() {
                resolved.expire = self.config.default_expire.clone();
                resolved.is_new = true;
            }
            *requested = resolved;
        }
        Ok(())
    }

    fn require_values(pairs: &KvPairs) -> Result<()> {
        match pairs.iter().find(|pair| pair.is_empty()) {
            Some(pair) => Err(Error::MissingInput(format!(
                "no value for {}",
                pair.cache_key()
            ))),
            None => Ok(()),
        }
    }

    /// Reject writes the relational schema cannot take.
    async fn validate(&self, pairs: &KvPairs, keys: &mut AnyKey) -> Result<()> {
        for (pair, info) in pairs.iter().zip(keys.iter_mut()) {
            if !info.no_db {
                self.relational.validate(pair, info).await?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Tier Work
    // =========================================================================

    /// Run tier work inline or queue it, depending on the mode.
    async fn write(
        &self,
        ctx: &Context,
        op: Write,
        pair: &mut KvPair,
        info: &mut KeyInfo,
    ) -> Result<bool> {
        if ctx.is_sync() {
            return self.apply(ctx, op, pair, info).await;
        }

        let engine = self.clone();
        let inline = ctx.inline();
        let mut queued_pair = pair.clone();
        let mut queued_info = info.clone();
        self.pool
            .submit(ctx, op.label(), async move {
                engine
                    .apply(&inline, op, &mut queued_pair, &mut queued_info)
                    .await
                    .map(|_| ())
            })
            .await?;

        info.is_new = false;
        Ok(true)
    }

    async fn apply(
        &self,
        ctx: &Context,
        op: Write,
        pair: &mut KvPair,
        info: &mut KeyInfo,
    ) -> Result<bool> {
        let done = match op {
            Write::Touch => true,
            Write::Promote => {
                self.distributed.save(pair).await?;
                self.publish(TierEvent::promoted(
                    pair.cache_key(),
                    Tier::Relational,
                    Tier::Distributed,
                ))
                .await;
                true
            }
            Write::Save => {
                self.distributed.save(pair).await?;
                true
            }
            Write::Insert => {
                if !info.no_db {
                    self.relational.insert(ctx, pair, info).await?;
                }
                self.distributed.save(pair).await?;
                true
            }
            Write::Update => {
                let changes = pair.data.clone();
                let stored = !info.no_db && self.relational.update(ctx, pair, info).await?;
                let cached = self.distributed.update(pair, &changes).await?;
                if cached && !stored {
                    self.distributed.find(pair).await?;
                }
                stored || cached
            }
            Write::Delete => {
                let stored = !info.no_db && self.relational.delete(ctx, pair, info).await?;
                let cached = self.distributed.delete(pair).await?;
                self.routing.delete(pair).await?;
                return Ok(stored || cached);
            }
        };

        if done {
            self.routing.save(ctx, pair, info).await?;
            self.scheduler.schedule(ctx, pair, info).await?;
        }
        Ok(done)
    }

    async fn publish(&self, event: TierEvent) {
        if let Err(e) = self.events.publish(event).await {
            error!("Failed to publish tier event: {}", e);
        }
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Load every pair. Returns true if all were found.
    ///
    /// Values found only in the relational tier are promoted into the
    /// distributed tier.
    #[instrument(skip_all, fields(trace_id = %ctx.trace_id(), keys = pairs.len()))]
    pub async fn find(
        &self,
        ctx: &Context,
        pairs: &mut KvPairs,
        keys: &mut AnyKey,
    ) -> Result<bool> {
        self.prepare(ctx, pairs, keys).await?;

        let mut all = true;
        for (pair, info) in pairs.iter_mut().zip(keys.iter_mut()) {
            all &= self.find_one(ctx, pair, info).await?;
        }
        ctx.finish();
        Ok(all)
    }

    async fn find_one(&self, ctx: &Context, pair: &mut KvPair, info: &mut KeyInfo) -> Result<bool> {
        if self.distributed.find(pair).await? {
            if info.is_new || info.expire_policy()?.schedule_mode().is_some() {
                self.write(ctx, Write::Touch, pair, info).await?;
            }
            return Ok(true);
        }

        if info.no_db || !self.relational.find(ctx, pair, info).await? {
            return Ok(false);
        }
        self.write(ctx, Write::Promote, pair, info).await?;
        Ok(true)
    }

    /// Write every pair to the distributed tier.
    ///
    /// The relational tier receives the value when a one-shot expire fires.
    #[instrument(skip_all, fields(trace_id = %ctx.trace_id(), keys = pairs.len()))]
    pub async fn save(
        &self,
        ctx: &Context,
        pairs: &mut KvPairs,
        keys: &mut AnyKey,
    ) -> Result<bool> {
        Self::require_values(pairs)?;
        self.prepare(ctx, pairs, keys).await?;

        let mut all = true;
        for (pair, info) in pairs.iter_mut().zip(keys.iter_mut()) {
            all &= self.write(ctx, Write::Save, pair, info).await?;
        }
        ctx.finish();
        Ok(all)
    }

    /// Save every pair, leaving its previous value in `KvPair::previous`.
    #[instrument(skip_all, fields(trace_id = %ctx.trace_id(), keys = pairs.len()))]
    pub async fn get_and_set(
        &self,
        ctx: &Context,
        pairs: &mut KvPairs,
        keys: &mut AnyKey,
    ) -> Result<bool> {
        Self::require_values(pairs)?;
        self.prepare(ctx, pairs, keys).await?;

        for (pair, info) in pairs.iter_mut().zip(keys.iter_mut()) {
            let previous = self.distributed.find_and_save(pair).await?;
            pair.previous = if !previous.is_empty() {
                Some(previous)
            } else if info.no_db {
                None
            } else {
                let mut stored = KvPair::new(pair.kind.clone(), pair.id.clone());
                self.relational
                    .find(ctx, &mut stored, info)
                    .await?
                    .then_some(stored.data)
            };
            self.write(ctx, Write::Touch, pair, info).await?;
        }
        ctx.finish();
        Ok(true)
    }

    /// Insert every pair into the relational tier, then cache it.
    ///
    /// A generated auto-increment key is written back into the pair.
    #[instrument(skip_all, fields(trace_id = %ctx.trace_id(), keys = pairs.len()))]
    pub async fn insert(
        &self,
        ctx: &Context,
        pairs: &mut KvPairs,
        keys: &mut AnyKey,
    ) -> Result<bool> {
        Self::require_values(pairs)?;
        self.prepare(ctx, pairs, keys).await?;
        self.validate(pairs, keys).await?;

        let mut all = true;
        for (pair, info) in pairs.iter_mut().zip(keys.iter_mut()) {
            all &= self.write(ctx, Write::Insert, pair, info).await?;
        }
        ctx.finish();
        Ok(all)
    }

    /// Apply each pair's fields to the stored value.
    ///
    /// Returns false if any pair had no stored value in either tier.
    #[instrument(skip_all, fields(trace_id = %ctx.trace_id(), keys = pairs.len()))]
    pub async fn update(
        &self,
        ctx: &Context,
        pairs: &mut KvPairs,
        keys: &mut AnyKey,
    ) -> Result<bool> {
        Self::require_values(pairs)?;
        self.prepare(ctx, pairs, keys).await?;
        self.validate(pairs, keys).await?;

        let mut all = true;
        for (pair, info) in pairs.iter_mut().zip(keys.iter_mut()) {
            all &= self.write(ctx, Write::Update, pair, info).await?;
        }
        ctx.finish();
        Ok(all)
    }

    /// Remove every pair from all tiers.
    #[instrument(skip_all, fields(trace_id = %ctx.trace_id(), keys = pairs.len()))]
    pub async fn delete(
        &self,
        ctx: &Context,
        pairs: &mut KvPairs,
        keys: &mut AnyKey,
    ) -> Result<bool> {
        self.prepare(ctx, pairs, keys).await?;

        let mut all = true;
        for (pair, info) in pairs.iter_mut().zip(keys.iter_mut()) {
            all &= self.write(ctx, Write::Delete, pair, info).await?;
        }
        ctx.finish();
        Ok(all)
    }

    /// True if every pair is held by the distributed tier.
    pub async fn exists(
        &self,
        ctx: &Context,
        pairs: &mut KvPairs,
        keys: &mut AnyKey,
    ) -> Result<bool> {
        keys.ensure_aligned(pairs)?;
        let _stage = ctx.stage("exists");

        for pair in pairs.iter() {
            if !self.distributed.if_exist(pair).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    // =========================================================================
    // Single Key
    // =========================================================================

    /// Read one `data` key. Field maps come back JSON-encoded.
    pub async fn get(&self, ctx: &Context, id: &str) -> Result<Option<String>> {
        let mut pairs = KvPairs::from(KvPair::new(DATA_TYPE, id));
        let mut keys = AnyKey::from(KeyInfo::new());

        if !self.find(ctx, &mut pairs, &mut keys).await? {
            return Ok(None);
        }
        let pair = &pairs[0];
        Ok(Some(match pair.text() {
            Some(text) if pair.data.len() == 1 => text.to_string(),
            _ => serde_json::to_string(&pair.data)?,
        }))
    }

    /// Write one opaque `data` value with an expire policy.
    pub async fn set(
        &self,
        ctx: &Context,
        id: &str,
        value: impl Into<String>,
        expire: &str,
    ) -> Result<bool> {
        let mut pairs = KvPairs::from(KvPair::with_text(DATA_TYPE, id, value));
        let mut keys = AnyKey::from(KeyInfo::new().with_expire(expire));
        self.save(ctx, &mut pairs, &mut keys).await
    }

    /// Write one `data` field map with an expire policy.
    pub async fn set_fields(
        &self,
        ctx: &Context,
        id: &str,
        fields: FieldMap,
        expire: &str,
    ) -> Result<bool> {
        let mut pairs = KvPairs::from(KvPair::with_data(DATA_TYPE, id, fields));
        let mut keys = AnyKey::from(KeyInfo::new().with_expire(expire));
        self.save(ctx, &mut pairs, &mut keys).await
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("cache", &self.cache)
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}
