//! Cache strategies for point reads.
//!
//! `find_by_id` consults the entity cache according to a [`CacheStrategy`]
//! instead of a pile of boolean flags.
//!
//! | Strategy | Cache hit | Cache miss | Use case |
//! |----------|-----------|------------|----------|
//! | **Refresh** | Return | Read store, fill cache | Default |
//! | **Fresh** | Return | Return `None` | Cache-only lookups, no store traffic |
//! | **Invalidate** | Evict, read store | Read store, fill cache | Caller knows the entry is stale |
//! | **Bypass** | Ignored | Read store, fill cache | Reads that must observe the store |
//!
//! ```
//! use repo_kit::strategy::CacheStrategy;
//!
//! assert_eq!(CacheStrategy::default(), CacheStrategy::Refresh);
//! assert!(CacheStrategy::Refresh.reads_cache());
//! assert!(!CacheStrategy::Bypass.reads_cache());
//! ```

/// Strategy controlling how a point read uses the entity cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum CacheStrategy {
    /// Cache only. A miss is reported as "not found" without touching the
    /// store.
    Fresh,

    /// Cache first, store on miss; the store result is cached.
    #[default]
    Refresh,

    /// Evict the entry, then read the store and re-cache.
    Invalidate,

    /// Skip the cache lookup and read the store. The result is still cached
    /// for later readers.
    Bypass,
}

impl CacheStrategy {
    /// Whether a cached entry may satisfy the read.
    pub fn reads_cache(self) -> bool {
        matches!(self, CacheStrategy::Fresh | CacheStrategy::Refresh)
    }

    /// Whether a cache miss falls through to the store.
    pub fn reads_store(self) -> bool {
        !matches!(self, CacheStrategy::Fresh)
    }
}

impl std::fmt::Display for CacheStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheStrategy::Fresh => write!(f, "Fresh"),
            CacheStrategy::Refresh => write!(f, "Refresh"),
            CacheStrategy::Invalidate => write!(f, "Invalidate"),
            CacheStrategy::Bypass => write!(f, "Bypass"),
        }
    }
}
