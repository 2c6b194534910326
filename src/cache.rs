//! Bounded TTL + LRU entity cache.
//!
//! Uses DashMap for sharded concurrent access. Entries hold postcard-encoded
//! [`Snapshot`]s (see [`crate::serialization`]) with an absolute expiry and a
//! logical last-access tick.
//!
//! - Expiry is pull-based: `get`/`has` drop an expired entry before
//!   answering. A background sweeper additionally purges expired entries on
//!   a fixed period so keys that are never read again do not linger.
//! - Capacity is fixed: inserting a new key into a full cache evicts exactly
//!   one entry, the one with the oldest last access. `get` refreshes the
//!   access tick, which makes eviction LRU rather than FIFO.
//! - A disabled cache answers every read with a miss and ignores writes.
//!
//! Time is read from `tokio::time::Instant`, so tests can drive expiry with
//! a paused clock.

use crate::config::CacheConfig;
use crate::serialization::{decode_snapshot, encode_snapshot};
use crate::store::Snapshot;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct CacheEntry {
    data: Vec<u8>,
    expires_at: Instant,
    last_accessed: u64,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Thread-safe in-memory snapshot cache with TTL expiry and LRU eviction.
///
/// # Example
///
/// ```no_run
/// use repo_kit::cache::EntityCache;
/// use repo_kit::config::CacheConfig;
/// use std::time::Duration;
///
/// let cache = EntityCache::new(
///     CacheConfig::default()
///         .with_ttl(Duration::from_secs(300))
///         .with_max_items(1_000),
/// );
/// assert_eq!(cache.size(), 0);
/// ```
pub struct EntityCache {
    entries: DashMap<String, CacheEntry>,
    enabled: bool,
    ttl: Duration,
    max_items: usize,
    sweep_interval: Duration,
    access_clock: AtomicU64,
    // Serializes inserts so the capacity check and the insert are one step.
    insert_gate: Mutex<()>,
}

impl EntityCache {
    /// Create a cache from its configuration.
    pub fn new(config: CacheConfig) -> Self {
        EntityCache {
            entries: DashMap::new(),
            enabled: config.enabled,
            ttl: config.ttl(),
            max_items: config.max_items,
            sweep_interval: config.sweep_interval(),
            access_clock: AtomicU64::new(0),
            insert_gate: Mutex::new(()),
        }
    }

    /// A cache that never stores anything.
    pub fn disabled() -> Self {
        Self::new(CacheConfig::disabled())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn tick(&self) -> u64 {
        self.access_clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look up a live entry and mark it as most recently used.
    pub fn get(&self, key: &str) -> Option<Snapshot> {
        if !self.enabled {
            return None;
        }

        let now = Instant::now();
        let bytes = match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.last_accessed = self.tick();
                Some(entry.data.clone())
            }
            _ => None,
        };

        let Some(bytes) = bytes else {
            if self.entries.remove_if(key, |_, e| e.is_expired(now)).is_some() {
                debug!("✓ Cache GET {} -> EXPIRED", key);
            } else {
                debug!("✓ Cache GET {} -> MISS", key);
            }
            return None;
        };

        match decode_snapshot(&bytes) {
            Ok(snapshot) => {
                debug!("✓ Cache GET {} -> HIT", key);
                Some(snapshot)
            }
            Err(e) => {
                warn!("Evicting unreadable cache entry {}: {}", key, e);
                self.entries.remove(key);
                None
            }
        }
    }

    /// Insert or replace an entry, evicting the least recently used entry
    /// first when a new key would exceed capacity.
    pub fn set(&self, key: &str, snapshot: &Snapshot) {
        if !self.enabled {
            return;
        }

        let data = match encode_snapshot(snapshot) {
            Ok(data) => data,
            Err(e) => {
                warn!("Skipping cache SET {}: {}", key, e);
                return;
            }
        };

        let _gate = self.insert_gate.lock();
        if !self.entries.contains_key(key) && self.entries.len() >= self.max_items {
            self.evict_lru();
        }
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                data,
                expires_at: Instant::now() + self.ttl,
                last_accessed: self.tick(),
            },
        );
        debug!("✓ Cache SET {} (TTL: {:?})", key, self.ttl);
    }

    fn evict_lru(&self) {
        let victim = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().last_accessed)
            .map(|entry| entry.key().clone());

        if let Some(key) = victim {
            self.entries.remove(&key);
            debug!("✓ Cache EVICT {} (capacity {})", key, self.max_items);
        }
    }

    /// Whether a live entry exists. Does not count as an access.
    pub fn has(&self, key: &str) -> bool {
        if !self.enabled {
            return false;
        }

        let now = Instant::now();
        let live = match self.entries.get(key) {
            Some(entry) => !entry.is_expired(now),
            None => return false,
        };
        if !live {
            self.entries.remove_if(key, |_, e| e.is_expired(now));
        }
        live
    }

    /// Remove an entry. Returns whether one was present.
    pub fn delete(&self, key: &str) -> bool {
        if !self.enabled {
            return false;
        }
        let removed = self.entries.remove(key).is_some();
        debug!("✓ Cache DELETE {}", key);
        removed
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.clear();
        warn!("⚠ Cache CLEAR executed - all entries dropped!");
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!("✓ Cache SWEEP removed {} expired entries", removed);
        }
        removed
    }

    /// Memory statistics.
    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        CacheStats {
            total_entries: self.entries.len(),
            expired_entries: self.entries.iter().filter(|e| e.is_expired(now)).count(),
            total_bytes: self.entries.iter().map(|e| e.data.len()).sum(),
        }
    }

    /// Start the periodic sweep on the current tokio runtime.
    ///
    /// The task holds only a weak reference and stops once the cache is
    /// dropped or the returned handle is dropped. Returns `None` when the
    /// cache is disabled or no runtime is available.
    pub fn spawn_sweeper(self: &Arc<Self>) -> Option<SweeperHandle> {
        if !self.enabled {
            return None;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No tokio runtime; cache sweeper not started");
            return None;
        };

        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.sweep_interval;
        let task = runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                match weak.upgrade() {
                    Some(cache) => {
                        cache.purge_expired();
                    }
                    None => break,
                }
            }
        });
        Some(SweeperHandle { task })
    }
}

/// Aborts the background sweep when dropped.
pub struct SweeperHandle {
    task: JoinHandle<()>,
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Cache statistics.
#[derive(Clone, Debug)]
pub struct CacheStats {
    pub total_entries: usize,
    pub expired_entries: usize,
    pub total_bytes: usize,
}
