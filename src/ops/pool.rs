//! Worker pool for async-mode tier writes
//!
//! Tasks are queued on a bounded channel and run with at most `workers` in
//! flight. A task that fails is logged, counted and appended to the
//! [`TraceLog`] under the trace id of the operation that queued it.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use tokio::sync::{mpsc, Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

use super::trace::TraceLog;
use crate::domain::{EventPublisher, TierEvent};
use crate::error::{Error, Result};
use crate::metrics::EngineMetrics;
use crate::model::Context;

/// A queued unit of background work.
struct PoolTask {
    task_id: u64,
    trace_id: String,
    label: &'static str,
    work: BoxFuture<'static, Result<()>>,
}

/// Bounded worker pool.
pub struct TaskPool {
    workers: usize,
    semaphore: Arc<Semaphore>,
    task_tx: RwLock<Option<mpsc::Sender<PoolTask>>>,
    task_rx: Mutex<mpsc::Receiver<PoolTask>>,
    tracker: TaskTracker,
    next_task_id: AtomicU64,
    pending: AtomicUsize,
    idle: Notify,
    trace: Arc<TraceLog>,
    metrics: Arc<EngineMetrics>,
    events: Arc<dyn EventPublisher>,
}

impl TaskPool {
    pub fn new(
        workers: usize,
        capacity: usize,
        trace: Arc<TraceLog>,
        metrics: Arc<EngineMetrics>,
        events: Arc<dyn EventPublisher>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(capacity.max(1));

        Arc::new(Self {
            workers: workers.max(1),
            semaphore: Arc::new(Semaphore::new(workers.max(1))),
            task_tx: RwLock::new(Some(tx)),
            task_rx: Mutex::new(rx),
            tracker: TaskTracker::new(),
            next_task_id: AtomicU64::new(0),
            pending: AtomicUsize::new(0),
            idle: Notify::new(),
            trace,
            metrics,
            events,
        })
    }

    /// Queue work under the trace id of `ctx`.
    ///
    /// Waits for queue space. Fails once the pool is closed.
    pub async fn submit<F>(&self, ctx: &Context, label: &'static str, work: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let sender = self.task_tx.read().clone().ok_or(Error::QueueClosed)?;
        let task = PoolTask {
            task_id: self.next_task_id.fetch_add(1, Ordering::SeqCst),
            trace_id: ctx.trace_id().to_string(),
            label,
            work: work.boxed(),
        };

        self.pending.fetch_add(1, Ordering::SeqCst);
        if sender.send(task).await.is_err() {
            self.finish_one();
            return Err(Error::QueueClosed);
        }
        Ok(())
    }

    /// Stop accepting work. Queued tasks still run.
    pub fn close(&self) {
        if self.task_tx.write().take().is_some() {
            debug!("Task pool closed for new work");
        }
    }

    /// Close the queue and wait for queued and running work.
    ///
    /// Requires [`TaskPool::run`] to be running.
    pub async fn shutdown(&self) {
        self.close();
        self.wait_idle().await;
    }

    pub fn is_closed(&self) -> bool {
        self.task_tx.read().is_none()
    }

    /// Queued plus running tasks.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Wait until every submitted task has finished.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn finish_one(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Run queued tasks until the pool is closed and drained, or cancelled.
    ///
    /// On cancellation, tasks already queued are still run to completion.
    #[instrument(skip(self, token))]
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        info!("Starting task pool with {} workers", self.workers);
        let mut rx = self.task_rx.lock().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("Task pool shutting down, draining queue");
                    rx.close();
                    while let Some(task) = rx.recv().await {
                        self.spawn_task(task).await;
                    }
                    break;
                }
                task = rx.recv() => match task {
                    Some(task) => self.spawn_task(task).await,
                    None => break,
                }
            }
        }

        self.tracker.close();
        self.tracker.wait().await;
        info!("Task pool stopped");
    }

    async fn spawn_task(self: &Arc<Self>, task: PoolTask) {
        let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(e) => {
                error!("Task pool semaphore closed: {}", e);
                self.finish_one();
                return;
            }
        };

        let pool = Arc::clone(self);
        self.tracker.spawn(async move {
            let _permit = permit;
            let PoolTask {
                task_id,
                trace_id,
                label,
                work,
            } = task;

            if let Err(e) = work.await {
                pool.report_failure(task_id, &trace_id, label, e).await;
            }
            pool.finish_one();
        });
    }

    async fn report_failure(
        &self,
        task_id: u64,
        trace_id: &str,
        label: &'static str,
        error: Error,
    ) {
        warn!(task_id, trace_id, label, "Background task failed: {}", error);
        self.metrics.async_failure();

        let reason = error.to_string();
        if let Err(e) = self.trace.record(trace_id, label, &reason).await {
            error!(trace_id, "Failed to record task failure: {}", e);
        }
        if let Err(e) = self
            .events
            .publish(TierEvent::async_failed(trace_id, label, reason))
            .await
        {
            warn!("Failed to publish task failure: {}", e);
        }
    }
}

impl std::fmt::Debug for TaskPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskPool")
            .field("workers", &self.workers)
            .field("pending", &self.pending())
            .field("closed", &self.is_closed())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryEventCollector, SqliteExecutor};
    use crate::config::LocalCacheConfig;
    use crate::local::CacheService;
    use crate::repository::RelationalRepository;
    use assert_matches::assert_matches;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct Fixture {
        pool: Arc<TaskPool>,
        trace: Arc<TraceLog>,
        metrics: Arc<EngineMetrics>,
        events: Arc<InMemoryEventCollector>,
    }

    async fn fixture(workers: usize) -> Fixture {
        let metrics = Arc::new(EngineMetrics::new().unwrap());
        let events = Arc::new(InMemoryEventCollector::new());
        let relational = Arc::new(RelationalRepository::new(
            Arc::new(SqliteExecutor::in_memory().unwrap()),
            Arc::new(CacheService::new(LocalCacheConfig::default())),
            Arc::clone(&metrics),
            events.clone(),
            "kv_default",
            true,
        ));
        relational.init().await.unwrap();
        let trace = Arc::new(TraceLog::new(relational));
        let pool = TaskPool::new(
            workers,
            16,
            Arc::clone(&trace),
            Arc::clone(&metrics),
            events.clone(),
        );

        Fixture {
            pool,
            trace,
            metrics,
            events,
        }
    }

    #[tokio::test]
    async fn test_runs_submitted_tasks() {
        let fx = fixture(2).await;
        let token = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&fx.pool).run(token.clone()));

        let counter = Arc::new(AtomicU32::new(0));
        let ctx = Context::asynchronous();
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            fx.pool
                .submit(&ctx, "count", async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();
        }

        fx.pool.wait_idle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);

        token.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_failures_are_traced() {
        let fx = fixture(1).await;
        let handle = tokio::spawn(Arc::clone(&fx.pool).run(CancellationToken::new()));

        let ctx = Context::with_trace_id("req-7", crate::model::ExecMode::Async);
        fx.pool
            .submit(&ctx, "distributed.save", async {
                Err(Error::Internal("store unavailable".into()))
            })
            .await
            .unwrap();
        fx.pool.wait_idle().await;

        let records = fx.trace.records("req-7").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].label, "distributed.save");
        assert!(records[0].error.contains("store unavailable"));
        assert_eq!(fx.metrics.async_failures(), 1);
        assert_eq!(fx.events.events_of_type("AsyncTaskFailed").len(), 1);

        fx.pool.close();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_drains_then_rejects() {
        let fx = fixture(1).await;
        let counter = Arc::new(AtomicU32::new(0));
        let ctx = Context::asynchronous();

        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            fx.pool
                .submit(&ctx, "slow", async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
                .unwrap();
        }
        fx.pool.close();
        assert_matches!(
            fx.pool.submit(&ctx, "late", async { Ok(()) }).await,
            Err(Error::QueueClosed)
        );

        Arc::clone(&fx.pool).run(CancellationToken::new()).await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(fx.pool.pending(), 0);
    }
}
