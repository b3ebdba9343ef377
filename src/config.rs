//! Engine configuration
//!
//! Every field has a default so a YAML file only needs the values it
//! changes. Command-line flags are applied on top by the binary.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::expire::ExpirePolicy;
use crate::sql::check_identifier;

/// Tier orchestration settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Namespace for every distributed store key
    pub prefix: String,
    /// Generic id/type/value table
    pub default_table: String,
    /// Retry failed table operations against the default table
    pub fallback_to_default: bool,
    /// Policy applied when a request carries none
    pub default_expire: String,
    /// Expiry handler lock lifetime in seconds
    pub lock_timeout_secs: u64,
    /// Background workers
    pub workers: usize,
    /// Pending background tasks before submitters wait
    pub queue_capacity: usize,
    /// Process-local cache settings
    pub local: LocalCacheConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            prefix: "tierkv".to_string(),
            default_table: "kv_default".to_string(),
            fallback_to_default: true,
            default_expire: String::new(),
            lock_timeout_secs: 30,
            workers: 4,
            queue_capacity: 1000,
            local: LocalCacheConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.prefix.is_empty() || self.prefix.contains("::") {
            return Err(Error::Config(format!("invalid key prefix '{}'", self.prefix)));
        }
        check_identifier(&self.default_table)
            .map_err(|_| {
                Error::Config(format!("invalid default table '{}'", self.default_table))
            })?;
        ExpirePolicy::parse(&self.default_expire).map_err(|_| {
            Error::Config(format!("invalid default expire '{}'", self.default_expire))
        })?;
        if self.workers == 0 || self.queue_capacity == 0 {
            return Err(Error::Config("workers and queue_capacity must be positive".into()));
        }
        if self.lock_timeout_secs == 0 {
            return Err(Error::Config("lock_timeout_secs must be positive".into()));
        }
        self.local.validate()
    }
}

/// Process-local cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalCacheConfig {
    /// Lifetime of cached field maps
    pub data_ttl_secs: u64,
    /// Lifetime of cached routing records
    pub routing_ttl_secs: u64,
    /// Lifetime of cached table schemas (refreshed in the background)
    pub schema_ttl_secs: u64,
    /// Entries per cache before the recycler evicts
    pub max_entries: usize,
    /// Recycler period
    pub recycle_interval_secs: u64,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            data_ttl_secs: 60,
            routing_ttl_secs: 300,
            schema_ttl_secs: 600,
            max_entries: 10_000,
            recycle_interval_secs: 10,
        }
    }
}

impl LocalCacheConfig {
    pub fn data_ttl(&self) -> Duration {
        Duration::from_secs(self.data_ttl_secs)
    }

    pub fn routing_ttl(&self) -> Duration {
        Duration::from_secs(self.routing_ttl_secs)
    }

    pub fn schema_ttl(&self) -> Duration {
        Duration::from_secs(self.schema_ttl_secs)
    }

    pub fn recycle_interval(&self) -> Duration {
        Duration::from_secs(self.recycle_interval_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.max_entries == 0 || self.recycle_interval_secs == 0 {
            return Err(Error::Config(
                "max_entries and recycle_interval_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}
