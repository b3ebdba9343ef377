//! Tier Events
//!
//! Immutable records of data moving between tiers. Events are used for
//! audit logging and for observing the engine in tests.
//!
//! # Example
//!
//! ```ignore
//! let event = TierEvent::promoted("data:foo", Tier::Relational, Tier::Distributed);
//! event_publisher.publish(event).await?;
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ports::Tier;

/// Something that happened to a key across the tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TierEvent {
    // =========================================================================
    // Movement Events
    // =========================================================================
    /// A value was copied into a faster tier after a miss.
    KeyPromoted {
        key: String,
        from_tier: String,
        to_tier: String,
        timestamp: DateTime<Utc>,
    },

    /// A one-shot expiry wrote the cached value to the relational tier.
    KeyWrittenBack {
        key: String,
        table: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A one-shot expiry removed the key from the cache tiers.
    KeyEvicted {
        key: String,
        timestamp: DateTime<Utc>,
    },

    /// A repeating expiry reloaded the key from the relational tier.
    KeyRefreshed {
        key: String,
        period_secs: u64,
        timestamp: DateTime<Utc>,
    },

    // =========================================================================
    // Fault Events
    // =========================================================================
    /// A relational operation was retried against the default table.
    FallbackUsed {
        key: String,
        table: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A background tier operation failed.
    AsyncTaskFailed {
        trace_id: String,
        label: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl TierEvent {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            TierEvent::KeyPromoted { timestamp, .. }
            | TierEvent::KeyWrittenBack { timestamp, .. }
            | TierEvent::KeyEvicted { timestamp, .. }
            | TierEvent::KeyRefreshed { timestamp, .. }
            | TierEvent::FallbackUsed { timestamp, .. }
            | TierEvent::AsyncTaskFailed { timestamp, .. } => *timestamp,
        }
    }

    /// Get the event type name.
    pub fn event_type(&self) -> &'static str {
        match self {
            TierEvent::KeyPromoted { .. } => "KeyPromoted",
            TierEvent::KeyWrittenBack { .. } => "KeyWrittenBack",
            TierEvent::KeyEvicted { .. } => "KeyEvicted",
            TierEvent::KeyRefreshed { .. } => "KeyRefreshed",
            TierEvent::FallbackUsed { .. } => "FallbackUsed",
            TierEvent::AsyncTaskFailed { .. } => "AsyncTaskFailed",
        }
    }

    /// Get the key if applicable.
    pub fn key(&self) -> Option<&str> {
        match self {
            TierEvent::KeyPromoted { key, .. }
            | TierEvent::KeyWrittenBack { key, .. }
            | TierEvent::KeyEvicted { key, .. }
            | TierEvent::KeyRefreshed { key, .. }
            | TierEvent::FallbackUsed { key, .. } => Some(key),
            TierEvent::AsyncTaskFailed { .. } => None,
        }
    }
}

// =============================================================================
// Event Builders
// =============================================================================

impl TierEvent {
    pub fn promoted(key: impl Into<String>, from: Tier, to: Tier) -> Self {
        TierEvent::KeyPromoted {
            key: key.into(),
            from_tier: from.to_string(),
            to_tier: to.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn written_back(key: impl Into<String>, table: Option<String>) -> Self {
        TierEvent::KeyWrittenBack {
            key: key.into(),
            table,
            timestamp: Utc::now(),
        }
    }

    pub fn evicted(key: impl Into<String>) -> Self {
        TierEvent::KeyEvicted {
            key: key.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn refreshed(key: impl Into<String>, period_secs: u64) -> Self {
        TierEvent::KeyRefreshed {
            key: key.into(),
            period_secs,
            timestamp: Utc::now(),
        }
    }

    pub fn fallback(
        key: impl Into<String>,
        table: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        TierEvent::FallbackUsed {
            key: key.into(),
            table: table.into(),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn async_failed(
        trace_id: impl Into<String>,
        label: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        TierEvent::AsyncTaskFailed {
            trace_id: trace_id.into(),
            label: label.into(),
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }
}
