//! Error types for the repository framework.

use crate::batch::BatchItemError;
use crate::store::StoreError;
use std::time::Duration;

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the repository framework.
///
/// All repository operations return `Result<T>`. Validation and not-found
/// errors always carry the collection (and id where one exists) so the
/// message is useful once it reaches an HTTP layer. Store failures keep the
/// original [`StoreError`] as their `source()`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Entity is absent, or soft-deleted and the caller did not ask for
    /// deleted entities.
    #[error("{collection}/{id} not found")]
    NotFound { collection: String, id: String },

    /// Id is empty, contains a path separator, or exceeds the key limit.
    #[error("invalid id {id:?}: {reason}")]
    InvalidId { id: String, reason: String },

    /// One or more required fields are absent or null.
    ///
    /// `fields` lists every missing field, not just the first one found.
    #[error("{collection}: missing required fields: {}", fields.join(", "))]
    MissingField {
        collection: String,
        fields: Vec<String>,
    },

    /// A caller-supplied id already exists in the collection.
    #[error("{collection}/{id} already exists")]
    DuplicateId { collection: String, id: String },

    /// Delete requested on an entity that is already soft-deleted.
    #[error("{collection}/{id} is already deleted")]
    AlreadyDeleted { collection: String, id: String },

    /// Mutation attempted on a soft-deleted entity.
    #[error("{collection}/{id} is soft-deleted")]
    SoftDeleted { collection: String, id: String },

    /// Optimistic version clash, or a store-detected transaction conflict
    /// that survived every retry.
    #[error("concurrency conflict on {collection}{}: {detail}", id.as_ref().map(|id| format!("/{}", id)).unwrap_or_default())]
    ConcurrencyConflict {
        collection: String,
        id: Option<String>,
        detail: String,
    },

    /// Transaction exceeded its overall deadline.
    #[error("transaction on {collection} timed out after {timeout:?}")]
    TransactionTimeout {
        collection: String,
        timeout: Duration,
    },

    /// Batch finished with per-item failures.
    ///
    /// Batch operations never return this on their own; it is produced by
    /// [`crate::batch::BatchResult::into_result`] when a caller decides that
    /// partial application is not acceptable.
    #[error("batch on {collection} failed for {} item(s)", failures.len())]
    BatchPartialFailure {
        collection: String,
        failures: Vec<BatchItemError>,
    },

    /// Malformed query or pagination arguments.
    #[error("invalid query on {collection}: {reason}")]
    InvalidQuery { collection: String, reason: String },

    /// Entity could not be mapped to or from its stored document.
    #[error("conversion failed for {collection}{}: {message}", id.as_ref().map(|id| format!("/{}", id)).unwrap_or_default())]
    Conversion {
        collection: String,
        id: Option<String>,
        message: String,
    },

    /// Snapshot could not be encoded for the cache.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Cached snapshot could not be decoded.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Cached bytes do not carry the expected envelope.
    #[error("invalid cache entry: {0}")]
    InvalidCacheEntry(String),

    /// Cached snapshot was written by a different schema version.
    #[error("cache version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),

    /// The underlying document store failed.
    #[error("store error on {collection}{}: {source}", id.as_ref().map(|id| format!("/{}", id)).unwrap_or_default())]
    Store {
        collection: String,
        id: Option<String>,
        #[source]
        source: StoreError,
    },
}

impl Error {
    /// Wrap a store error with collection and optional id context.
    pub fn store(collection: &str, id: Option<&str>, source: StoreError) -> Self {
        Error::Store {
            collection: collection.to_string(),
            id: id.map(str::to_string),
            source,
        }
    }

    pub(crate) fn not_found(collection: &str, id: &str) -> Self {
        Error::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }

    /// True for errors caused by the caller's input rather than the store.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Error::NotFound { .. }
                | Error::InvalidId { .. }
                | Error::MissingField { .. }
                | Error::DuplicateId { .. }
                | Error::AlreadyDeleted { .. }
                | Error::SoftDeleted { .. }
                | Error::InvalidQuery { .. }
        )
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}
