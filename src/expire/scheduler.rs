//! Expiration scheduling and handling
//!
//! # Handling a fired marker
//!
//! 1. Take the per-marker lock; a held lock means another instance is
//!    already handling the event.
//! 2. Re-read the routing record, since the policy may have changed.
//! 3. One-shot: write the distributed value back to the relational tier
//!    (unless the key is cache-only), then drop the value and its routing
//!    from the cache tiers.
//! 4. Repeating: reload the value from the relational tier into the
//!    distributed tier and register the next event.
//! 5. Release the lock.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use super::{ExpireEvent, ExpirePolicy};
use crate::domain::{DistributedStore, EventPublisher, TierEvent};
use crate::error::Result;
use crate::metrics::{outcome, EngineMetrics};
use crate::model::{Context, ExecMode, KeyInfo, KeySpace, KvPair};
use crate::repository::{DistributedRepository, RelationalRepository, RoutingRepository};

/// What handling one event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpireOutcome {
    /// Value migrated to the relational tier and evicted from the caches
    WrittenBack,
    /// Evicted from the caches without a write
    Evicted,
    /// Reloaded from the relational tier and rescheduled
    Refreshed,
    /// Repeating key with no relational value; not rescheduled
    Missing,
    /// Another handler holds the lock
    Locked,
    /// No routing record for the key
    Unrouted,
    /// Policy no longer schedules anything
    Skipped,
}

impl ExpireOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpireOutcome::WrittenBack => outcome::WRITTEN_BACK,
            ExpireOutcome::Evicted => outcome::EVICTED,
            ExpireOutcome::Refreshed => outcome::REFRESHED,
            ExpireOutcome::Missing => outcome::MISSING,
            ExpireOutcome::Locked => outcome::LOCKED,
            ExpireOutcome::Unrouted => outcome::UNROUTED,
            ExpireOutcome::Skipped => outcome::SKIPPED,
        }
    }
}

impl fmt::Display for ExpireOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registers expiration markers and handles them when they fire.
pub struct ExpireScheduler {
    keys: KeySpace,
    store: Arc<dyn DistributedStore>,
    routing: Arc<RoutingRepository>,
    distributed: Arc<DistributedRepository>,
    relational: Arc<RelationalRepository>,
    lock_timeout: Duration,
    metrics: Arc<EngineMetrics>,
    events: Arc<dyn EventPublisher>,
}

impl ExpireScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        keys: KeySpace,
        store: Arc<dyn DistributedStore>,
        routing: Arc<RoutingRepository>,
        distributed: Arc<DistributedRepository>,
        relational: Arc<RelationalRepository>,
        lock_timeout: Duration,
        metrics: Arc<EngineMetrics>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            keys,
            store,
            routing,
            distributed,
            relational,
            lock_timeout,
            metrics,
            events,
        }
    }

    /// Apply a key's expire policy. Returns whether the store changed.
    #[instrument(skip_all, fields(key = %pair.cache_key(), expire = %info.expire))]
    pub async fn schedule(&self, ctx: &Context, pair: &KvPair, info: &KeyInfo) -> Result<bool> {
        let policy = info.expire_policy()?;
        let Some(mode) = policy.schedule_mode() else {
            return Ok(false);
        };

        let marker = self.keys.marker(&pair.kind, &pair.id, ctx.trace_id());
        let pointer = self.keys.pointer(&pair.kind, &pair.id);
        let ttl = policy.delay().unwrap_or_default();

        let changed = self.store.schedule_expire(&marker, &pointer, mode, ttl).await?;
        if changed {
            debug!(mode = mode.as_str(), ttl_secs = ttl.as_secs(), "Expiration scheduled");
        }
        Ok(changed)
    }

    /// Handle a fired marker under its lock.
    #[instrument(skip(self), fields(key = %event.cache_key()))]
    pub async fn handle(&self, event: ExpireEvent) -> Result<ExpireOutcome> {
        let lock = self.keys.lock(&event.kind, &event.id, &event.trace_id);
        let token = uuid::Uuid::new_v4().simple().to_string();

        if !self.store.acquire_lock(&lock, &token, self.lock_timeout).await? {
            debug!("Expiration already being handled");
            self.metrics.expire_event(outcome::LOCKED);
            return Ok(ExpireOutcome::Locked);
        }

        let result = self.migrate(&event).await;

        if let Err(e) = self.store.release_lock(&lock, &token).await {
            warn!("Failed to release expiration lock: {}", e);
        }

        match &result {
            Ok(done) => {
                info!(outcome = %done, "Expiration handled");
                self.metrics.expire_event(done.as_str());
            }
            Err(e) => {
                warn!("Expiration handling failed: {}", e);
                self.metrics.expire_event(outcome::FAILED);
            }
        }
        result
    }

    async fn migrate(&self, event: &ExpireEvent) -> Result<ExpireOutcome> {
        let ctx = Context::with_trace_id(event.trace_id.clone(), ExecMode::Sync);
        let mut pair = KvPair::new(event.kind.clone(), event.id.clone());

        let Some(mut info) = self.routing.find(&ctx, &pair).await? else {
            return Ok(ExpireOutcome::Unrouted);
        };

        match info.expire_policy()? {
            policy if policy.is_one_shot() => self.write_back(&ctx, &mut pair, &mut info).await,
            ExpirePolicy::Repeat(period) => self.refresh(&ctx, &mut pair, &mut info, period).await,
            _ => Ok(ExpireOutcome::Skipped),
        }
    }

    async fn write_back(
        &self,
        ctx: &Context,
        pair: &mut KvPair,
        info: &mut KeyInfo,
    ) -> Result<ExpireOutcome> {
        let found = self.distributed.find_remote(pair).await?;

        let outcome = if found && !info.no_db {
            self.relational.upsert(ctx, pair, info).await?;
            self.publish(TierEvent::written_back(pair.cache_key(), info.table.clone()))
                .await;
            ExpireOutcome::WrittenBack
        } else {
            self.publish(TierEvent::evicted(pair.cache_key())).await;
            ExpireOutcome::Evicted
        };

        self.distributed.delete(pair).await?;
        self.routing.delete(pair).await?;
        Ok(outcome)
    }

    async fn refresh(
        &self,
        ctx: &Context,
        pair: &mut KvPair,
        info: &mut KeyInfo,
        period: u64,
    ) -> Result<ExpireOutcome> {
        if !self.relational.find(ctx, pair, info).await? {
            debug!("Repeating key has no relational value, not rescheduling");
            return Ok(ExpireOutcome::Missing);
        }

        self.distributed.save(pair).await?;
        self.routing.save(ctx, pair, info).await?;
        self.schedule(ctx, pair, info).await?;

        self.publish(TierEvent::refreshed(pair.cache_key(), period)).await;
        Ok(ExpireOutcome::Refreshed)
    }

    async fn publish(&self, event: TierEvent) {
        if let Err(e) = self.events.publish(event).await {
            warn!("Failed to publish expiration event: {}", e);
        }
    }
}

impl std::fmt::Debug for ExpireScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpireScheduler")
            .field("prefix", &self.keys.prefix())
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}
