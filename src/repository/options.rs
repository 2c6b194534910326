//! Per-call options for repository operations.

use crate::query::{Direction, OrderBy};
use crate::strategy::CacheStrategy;

/// Options for `find_by_id`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReadOptions {
    pub strategy: CacheStrategy,
    /// Return soft-deleted entities instead of treating them as absent.
    pub include_deleted: bool,
    /// Fail with `Error::NotFound` instead of returning `None`.
    pub throw_if_not_found: bool,
}

impl ReadOptions {
    pub fn with_strategy(mut self, strategy: CacheStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_include_deleted(mut self, include: bool) -> Self {
        self.include_deleted = include;
        self
    }

    pub fn with_throw_if_not_found(mut self, throw: bool) -> Self {
        self.throw_if_not_found = throw;
        self
    }
}

/// Options for `find`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryOptions {
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    /// Cursor: resume after the entity with this id.
    pub start_after: Option<String>,
    pub include_deleted: bool,
}

impl QueryOptions {
    pub fn with_order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_start_after(mut self, id: impl Into<String>) -> Self {
        self.start_after = Some(id.into());
        self
    }

    pub fn with_include_deleted(mut self, include: bool) -> Self {
        self.include_deleted = include;
        self
    }
}

/// Options for `create`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateOptions {
    /// Caller-supplied id; a store-generated id is used when `None`.
    pub id: Option<String>,
    /// Starting version when versioning is enabled (default 1).
    pub initial_version: Option<u64>,
    /// Insert the new entity into the cache (default `true`).
    pub populate_cache: bool,
    /// Override the repository's server-timestamp setting.
    pub server_timestamps: Option<bool>,
}

impl Default for CreateOptions {
    fn default() -> Self {
        CreateOptions {
            id: None,
            initial_version: None,
            populate_cache: true,
            server_timestamps: None,
        }
    }
}

impl CreateOptions {
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_initial_version(mut self, version: u64) -> Self {
        self.initial_version = Some(version);
        self
    }

    pub fn with_populate_cache(mut self, populate: bool) -> Self {
        self.populate_cache = populate;
        self
    }

    pub fn with_server_timestamps(mut self, enabled: bool) -> Self {
        self.server_timestamps = Some(enabled);
        self
    }
}

/// Options for `update`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Allow updating a soft-deleted entity.
    pub bypass_soft_delete_check: bool,
    /// Bump `version` (default `true`; ignored when versioning is off).
    pub increment_version: bool,
    /// Fail with `ConcurrencyConflict` unless the stored version matches.
    pub expected_version: Option<u64>,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        UpdateOptions {
            bypass_soft_delete_check: false,
            increment_version: true,
            expected_version: None,
        }
    }
}

impl UpdateOptions {
    pub fn with_bypass_soft_delete_check(mut self, bypass: bool) -> Self {
        self.bypass_soft_delete_check = bypass;
        self
    }

    pub fn with_increment_version(mut self, increment: bool) -> Self {
        self.increment_version = increment;
        self
    }

    pub fn with_expected_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

/// Options for `delete`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    /// Soft or hard delete; the repository's setting when `None`.
    pub soft_delete: Option<bool>,
    /// Hard-delete even if the entity is already soft-deleted.
    pub force: bool,
}

impl DeleteOptions {
    pub fn soft() -> Self {
        DeleteOptions {
            soft_delete: Some(true),
            force: false,
        }
    }

    pub fn hard() -> Self {
        DeleteOptions {
            soft_delete: Some(false),
            force: false,
        }
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }
}
