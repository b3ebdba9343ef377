//! Expired-key listener
//!
//! Subscribes to the store's expiration feed and queues a handler task for
//! every marker of our prefix. Other expired keys are ignored.

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::{ExpireEvent, ExpireScheduler};
use crate::domain::DistributedStore;
use crate::error::Result;
use crate::model::{Context, ExecMode, KeySpace};
use crate::ops::TaskPool;

pub struct ExpireListener {
    keys: KeySpace,
    store: Arc<dyn DistributedStore>,
    scheduler: Arc<ExpireScheduler>,
    pool: Arc<TaskPool>,
}

impl ExpireListener {
    pub fn new(
        keys: KeySpace,
        store: Arc<dyn DistributedStore>,
        scheduler: Arc<ExpireScheduler>,
        pool: Arc<TaskPool>,
    ) -> Self {
        Self {
            keys,
            store,
            scheduler,
            pool,
        }
    }

    /// Consume the expiration feed until cancelled or the feed ends.
    #[instrument(skip(self, token))]
    pub async fn run(self: Arc<Self>, token: CancellationToken) -> Result<()> {
        let mut feed = self.store.subscribe_expired().await?;
        info!(prefix = %self.keys.prefix(), "Listening for expired markers");

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Expire listener shutting down");
                    break;
                }
                expired = feed.next() => {
                    let Some(expired) = expired else {
                        warn!("Expiration feed ended");
                        break;
                    };
                    let Some(event) = ExpireEvent::parse(&self.keys, &expired) else {
                        continue;
                    };
                    debug!(key = %event.cache_key(), trace_id = %event.trace_id, "Marker expired");

                    if let Err(e) = self.dispatch(event).await {
                        error!("Failed to queue expiration handler: {}", e);
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    async fn dispatch(&self, event: ExpireEvent) -> Result<()> {
        let ctx = Context::with_trace_id(event.trace_id.clone(), ExecMode::Async);
        let scheduler = Arc::clone(&self.scheduler);
        self.pool
            .submit(&ctx, "expire", async move {
                scheduler.handle(event).await.map(|_| ())
            })
            .await
    }
}

impl std::fmt::Debug for ExpireListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExpireListener")
            .field("prefix", &self.keys.prefix())
            .finish_non_exhaustive()
    }
}
