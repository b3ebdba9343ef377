//! Failure log for background work
//!
//! Async-mode writes cannot report errors to their caller. Each failure is
//! appended to a `trace` record in the default table under the trace id of
//! the operation that queued it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::Result;
use crate::model::TRACE_TYPE;
use crate::repository::RelationalRepository;

/// One failed background task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceRecord {
    pub trace_id: String,
    pub label: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Append-only failure records keyed by trace id.
pub struct TraceLog {
    relational: Arc<RelationalRepository>,
    // Serializes read-modify-write of a record within this process
    writer: Mutex<()>,
}

impl TraceLog {
    pub fn new(relational: Arc<RelationalRepository>) -> Self {
        Self {
            relational,
            writer: Mutex::new(()),
        }
    }

    pub async fn record(&self, trace_id: &str, label: &str, error: &str) -> Result<()> {
        let _guard = self.writer.lock().await;

        let mut records = self.records(trace_id).await?;
        records.push(TraceRecord {
            trace_id: trace_id.to_string(),
            label: label.to_string(),
            error: error.to_string(),
            at: Utc::now(),
        });

        let value = serde_json::to_value(&records)?;
        self.relational
            .store_record(TRACE_TYPE, trace_id, &value)
            .await
    }

    /// Failures recorded for a trace id, oldest first.
    pub async fn records(&self, trace_id: &str) -> Result<Vec<TraceRecord>> {
        match self.relational.load_record(TRACE_TYPE, trace_id).await? {
            Some(value @ Value::Array(_)) => Ok(serde_json::from_value(value)?),
            _ => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{LoggingEventPublisher, SqliteExecutor};
    use crate::config::LocalCacheConfig;
    use crate::local::CacheService;
    use crate::metrics::EngineMetrics;

    #[tokio::test]
    async fn test_records_accumulate_per_trace() {
        let relational = Arc::new(RelationalRepository::new(
            Arc::new(SqliteExecutor::in_memory().unwrap()),
            Arc::new(CacheService::new(LocalCacheConfig::default())),
            Arc::new(EngineMetrics::new().unwrap()),
            Arc::new(LoggingEventPublisher::new()),
            "kv_default",
            true,
        ));
        relational.init().await.unwrap();
        let log = TraceLog::new(relational);

        log.record("t1", "save", "redis down").await.unwrap();
        log.record("t1", "routing.save", "redis down").await.unwrap();
        log.record("t2", "insert", "constraint").await.unwrap();

        let records = log.records("t1").await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].label, "save");
        assert_eq!(records[1].label, "routing.save");
        assert_eq!(log.records("t2").await.unwrap().len(), 1);
        assert!(log.records("t3").await.unwrap().is_empty());
    }
}
