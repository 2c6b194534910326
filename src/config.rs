//! Repository configuration.
//!
//! Every struct here can be built in code with `with_*` methods or loaded
//! from TOML; durations are expressed in milliseconds so the file format
//! stays plain.
//!
//! ```
//! use repo_kit::config::RepositoryConfig;
//!
//! let config = RepositoryConfig::from_toml_str(r#"
//!     collection = "products"
//!     required_fields = ["name", "sku"]
//!
//!     [cache]
//!     ttl_ms = 60000
//!     max_items = 500
//!
//!     [transaction]
//!     max_attempts = 3
//! "#).unwrap();
//!
//! assert_eq!(config.collection, "products");
//! assert_eq!(config.cache.max_items, 500);
//! assert_eq!(config.transaction.max_attempts, 3);
//! assert!(config.soft_delete);
//! ```

use crate::error::{Error, Result};
use serde::Deserialize;
use std::time::Duration;

/// Cache settings (TTL, capacity, sweep period).
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub ttl_ms: u64,
    pub max_items: usize,
    pub sweep_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            enabled: true,
            ttl_ms: 5 * 60 * 1000,
            max_items: 1000,
            sweep_interval_ms: 60 * 1000,
        }
    }
}

impl CacheConfig {
    pub fn disabled() -> Self {
        CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl_ms = ttl.as_millis() as u64;
        self
    }

    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = max_items;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Transaction executor settings.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Overall deadline for one `run_transaction` call, retries included.
    pub timeout_ms: u64,
    /// Base delay of the exponential backoff between attempts.
    pub retry_backoff_ms: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        TransactionConfig {
            max_attempts: 5,
            timeout_ms: 30_000,
            retry_backoff_ms: 20,
        }
    }
}

impl TransactionConfig {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff_ms = backoff.as_millis() as u64;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delay before attempt `attempt + 1` (attempts are 1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1).min(16));
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

/// Batch executor settings.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Writes per physical commit; capped by the store's own limit.
    pub chunk_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig { chunk_size: 500 }
    }
}

/// Resilience queue settings.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub drain_interval_ms: u64,
    /// Items processed per drain in normal conditions.
    pub batch_size: usize,
    /// Items processed per drain while degraded.
    pub degraded_batch_size: usize,
    pub default_max_retries: u32,
    /// Retry budgets are multiplied by this while degraded.
    pub degraded_retry_multiplier: f64,
    /// Consecutive failures that switch the queue into the degraded state.
    pub failure_threshold: u32,
    /// Permanently failed items remembered for inspection.
    pub dead_letter_capacity: usize,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        ResilienceConfig {
            drain_interval_ms: 5_000,
            batch_size: 10,
            degraded_batch_size: 3,
            default_max_retries: 3,
            degraded_retry_multiplier: 2.0,
            failure_threshold: 5,
            dead_letter_capacity: 100,
        }
    }
}

impl ResilienceConfig {
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }

    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_batch_sizes(mut self, normal: usize, degraded: usize) -> Self {
        self.batch_size = normal;
        self.degraded_batch_size = degraded;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }
}

/// Configuration of one repository (one collection).
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    pub collection: String,
    /// Delete marks entities instead of removing them.
    pub soft_delete: bool,
    /// Maintain a `version` counter on every write.
    pub versioning: bool,
    /// Fields that must be present and non-null on create.
    pub required_fields: Vec<String>,
    /// Entity fields, besides the metadata timestamps, stored as native
    /// timestamps.
    pub timestamp_fields: Vec<String>,
    /// Stamp `createdAt`/`updatedAt` with the store's commit time instead
    /// of the client clock.
    pub server_timestamps: bool,
    /// `find` results larger than this are not cached individually.
    pub find_cache_threshold: usize,
    /// Field holding the tenant id for tenant-scoped repositories.
    pub tenant_field: String,
    pub cache: CacheConfig,
    pub transaction: TransactionConfig,
    pub batch: BatchConfig,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        RepositoryConfig {
            collection: String::new(),
            soft_delete: true,
            versioning: true,
            required_fields: Vec::new(),
            timestamp_fields: Vec::new(),
            server_timestamps: false,
            find_cache_threshold: 100,
            tenant_field: "organizationId".to_string(),
            cache: CacheConfig::default(),
            transaction: TransactionConfig::default(),
            batch: BatchConfig::default(),
        }
    }
}

impl RepositoryConfig {
    pub fn new(collection: impl Into<String>) -> Self {
        RepositoryConfig {
            collection: collection.into(),
            ..RepositoryConfig::default()
        }
    }

    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` on malformed TOML.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        Ok(toml::from_str(input)?)
    }

    pub fn with_soft_delete(mut self, enabled: bool) -> Self {
        self.soft_delete = enabled;
        self
    }

    pub fn with_versioning(mut self, enabled: bool) -> Self {
        self.versioning = enabled;
        self
    }

    pub fn with_required_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timestamp_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.timestamp_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_server_timestamps(mut self, enabled: bool) -> Self {
        self.server_timestamps = enabled;
        self
    }

    pub fn with_find_cache_threshold(mut self, threshold: usize) -> Self {
        self.find_cache_threshold = threshold;
        self
    }

    pub fn with_tenant_field(mut self, field: impl Into<String>) -> Self {
        self.tenant_field = field.into();
        self
    }

    pub fn with_cache(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_transaction(mut self, transaction: TransactionConfig) -> Self {
        self.transaction = transaction;
        self
    }

    pub fn with_batch_chunk_size(mut self, chunk_size: usize) -> Self {
        self.batch.chunk_size = chunk_size;
        self
    }

    /// Reject configurations the repository cannot honour.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.collection.is_empty() {
            return Err(Error::Config("collection name must not be empty".into()));
        }
        if self.collection.contains('/') {
            return Err(Error::Config(format!(
                "collection name {:?} must not contain '/'",
                self.collection
            )));
        }
        if self.cache.enabled && self.cache.max_items == 0 {
            return Err(Error::Config("cache.max_items must be at least 1".into()));
        }
        if self.cache.enabled && self.cache.sweep_interval_ms == 0 {
            return Err(Error::Config("cache.sweep_interval_ms must be positive".into()));
        }
        if self.transaction.max_attempts == 0 {
            return Err(Error::Config("transaction.max_attempts must be at least 1".into()));
        }
        if self.batch.chunk_size == 0 {
            return Err(Error::Config("batch.chunk_size must be at least 1".into()));
        }
        if self.tenant_field.is_empty() {
            return Err(Error::Config("tenant_field must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RepositoryConfig::new("products");
        assert!(config.soft_delete);
        assert!(config.versioning);
        assert_eq!(config.find_cache_threshold, 100);
        assert_eq!(config.transaction.max_attempts, 5);
        assert_eq!(config.batch.chunk_size, 500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(RepositoryConfig::default().validate().is_err());
        assert!(RepositoryConfig::new("a/b").validate().is_err());
        assert!(RepositoryConfig::new("p")
            .with_cache(CacheConfig::default().with_max_items(0))
            .validate()
            .is_err());
        assert!(RepositoryConfig::new("p")
            .with_cache(CacheConfig::disabled().with_max_items(0))
            .validate()
            .is_ok());
        assert!(RepositoryConfig::new("p")
            .with_batch_chunk_size(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_backoff_doubles() {
        let tx = TransactionConfig::default().with_retry_backoff(Duration::from_millis(10));
        assert_eq!(tx.backoff(1), Duration::from_millis(10));
        assert_eq!(tx.backoff(3), Duration::from_millis(40));
    }

    #[test]
    fn test_malformed_toml() {
        let err = RepositoryConfig::from_toml_str("collection = [").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
