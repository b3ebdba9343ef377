//! Per-operation execution context

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::debug;

/// How tier work is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecMode {
    /// Caller waits for every tier to settle
    #[default]
    Sync,
    /// Writes to slower tiers run on the worker pool
    Async,
}

/// A named, timed stage of an operation.
#[derive(Debug, Clone)]
pub struct Stage {
    pub name: &'static str,
    pub elapsed: Duration,
}

/// Execution state created once per inbound operation.
///
/// Cloning is cheap; clones share the timing log so background work
/// reports into the operation that spawned it.
#[derive(Debug, Clone)]
pub struct Context {
    trace_id: Arc<str>,
    mode: ExecMode,
    batch: bool,
    started: Instant,
    stages: Arc<Mutex<Vec<Stage>>>,
}

impl Context {
    /// Create a context with a generated trace id.
    pub fn new(mode: ExecMode) -> Self {
        Self::with_trace_id(uuid::Uuid::new_v4().simple().to_string(), mode)
    }

    /// Create a context with a client-supplied trace id.
    pub fn with_trace_id(trace_id: impl Into<String>, mode: ExecMode) -> Self {
        Self {
            trace_id: Arc::from(trace_id.into()),
            mode,
            batch: false,
            started: Instant::now(),
            stages: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn sync() -> Self {
        Self::new(ExecMode::Sync)
    }

    pub fn asynchronous() -> Self {
        Self::new(ExecMode::Async)
    }

    pub fn batch(mut self, batch: bool) -> Self {
        self.batch = batch;
        self
    }

    /// Same trace and timing log, with every tier settled inline.
    ///
    /// Work already running on the worker pool uses this so it never
    /// queues behind itself.
    pub fn inline(&self) -> Self {
        Self {
            mode: ExecMode::Sync,
            ..self.clone()
        }
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    pub fn mode(&self) -> ExecMode {
        self.mode
    }

    pub fn is_sync(&self) -> bool {
        self.mode == ExecMode::Sync
    }

    pub fn is_batch(&self) -> bool {
        self.batch
    }

    /// Start timing a stage; the stage is recorded when the guard drops.
    pub fn stage(&self, name: &'static str) -> StageTimer {
        StageTimer {
            name,
            start: Instant::now(),
            stages: Arc::clone(&self.stages),
        }
    }

    /// Record a stage measured elsewhere.
    pub fn record(&self, name: &'static str, elapsed: Duration) {
        self.stages.lock().push(Stage { name, elapsed });
    }

    /// Snapshot of recorded stages.
    pub fn stages(&self) -> Vec<Stage> {
        self.stages.lock().clone()
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Flush timing data at the end of the operation.
    pub fn finish(&self) {
        let stages = self.stages();
        let breakdown: Vec<String> = stages
            .iter()
            .map(|s| format!("{}={}us", s.name, s.elapsed.as_micros()))
            .collect();
        debug!(
            trace_id = %self.trace_id,
            mode = ?self.mode,
            total_us = self.elapsed().as_micros() as u64,
            stages = %breakdown.join(","),
            "Operation finished"
        );
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::sync()
    }
}

/// Guard returned by [`Context::stage`].
pub struct StageTimer {
    name: &'static str,
    start: Instant,
    stages: Arc<Mutex<Vec<Stage>>>,
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.stages.lock().push(Stage {
            name: self.name,
            elapsed: self.start.elapsed(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_trace_ids_differ() {
        let a = Context::sync();
        let b = Context::sync();
        assert_ne!(a.trace_id(), b.trace_id());
        assert!(a.is_sync());
        assert!(!Context::asynchronous().is_sync());
    }

    #[test]
    fn test_client_trace_id_and_batch() {
        let ctx = Context::with_trace_id("req-42", ExecMode::Async).batch(true);
        assert_eq!(ctx.trace_id(), "req-42");
        assert!(ctx.is_batch());
        assert_eq!(ctx.mode(), ExecMode::Async);

        let inline = ctx.inline();
        assert!(inline.is_sync());
        assert_eq!(inline.trace_id(), "req-42");
    }

    #[test]
    fn test_stage_timer_records_on_drop() {
        let ctx = Context::sync();
        {
            let _timer = ctx.stage("routing");
        }
        let clone = ctx.clone();
        clone.record("store", Duration::from_millis(2));

        let stages = ctx.stages();
        assert_eq!(stages.len(), 2);
        assert_eq!(stages[0].name, "routing");
        assert_eq!(stages[1].elapsed, Duration::from_millis(2));
        ctx.finish();
    }
}
