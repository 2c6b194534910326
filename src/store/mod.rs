//! Document store abstraction.
//!
//! The repository layer treats the underlying database as a black box that
//! offers point reads, filtered queries, an optional count aggregate and
//! atomic multi-document commits guarded by preconditions. Transactions and
//! batches are both built from those primitives (see [`crate::transaction`]
//! and [`crate::batch`]).
//!
//! Implementations: [`MemoryStore`] (in-process, default feature). A
//! managed store client implements the same trait by mapping `commit` onto
//! its native transaction / batched-write API.

use crate::document::Document;
use crate::query::Query;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;

#[cfg(feature = "memory")]
pub mod memory;

#[cfg(feature = "memory")]
pub use memory::MemoryStore;

/// Result type for raw store calls.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors reported by a document store.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StoreError {
    #[error("document {path} not found")]
    NotFound { path: String },

    #[error("document {path} already exists")]
    AlreadyExists { path: String },

    /// A commit precondition no longer holds (write-write conflict).
    #[error("commit conflict: {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal store error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Conflicts and transient outages may succeed when retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict(_) | StoreError::Unavailable(_))
    }
}

/// A document as read from the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: String,
    pub data: Document,
    /// Store-assigned revision, bumped on every write of this document.
    pub revision: u64,
    pub update_time: DateTime<Utc>,
}

/// One write inside an atomic commit.
#[derive(Clone, Debug, PartialEq)]
pub enum Write {
    /// Create a document; fails with `AlreadyExists` if present.
    Create {
        collection: String,
        id: String,
        data: Document,
    },
    /// Create or replace a document.
    Set {
        collection: String,
        id: String,
        data: Document,
    },
    /// Shallow-merge fields into an existing document; fails with `NotFound`.
    Update {
        collection: String,
        id: String,
        data: Document,
    },
    /// Remove a document. Deleting a missing document is not an error.
    Delete { collection: String, id: String },
}

impl Write {
    pub fn collection(&self) -> &str {
        match self {
            Write::Create { collection, .. }
            | Write::Set { collection, .. }
            | Write::Update { collection, .. }
            | Write::Delete { collection, .. } => collection,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Write::Create { id, .. }
            | Write::Set { id, .. }
            | Write::Update { id, .. }
            | Write::Delete { id, .. } => id,
        }
    }
}

/// Outcome of one write in a successful commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WriteResult {
    /// Revision of the document after the commit; `None` when it was deleted.
    pub revision: Option<u64>,
}

/// Outcome of a successful commit.
#[derive(Clone, Debug, PartialEq)]
pub struct CommitResult {
    /// Time the commit was applied; server-timestamp sentinels resolve to it.
    pub commit_time: DateTime<Utc>,
    /// One entry per write, in the order the writes were given.
    pub write_results: Vec<WriteResult>,
}

/// Condition checked atomically before a commit applies its writes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Precondition {
    pub collection: String,
    pub id: String,
    /// `Some(rev)`: document must exist at exactly this revision.
    /// `None`: document must not exist.
    pub expected_revision: Option<u64>,
}

/// Trait for document store implementations.
///
/// All methods take `&self`; implementations use interior mutability or a
/// remote service. Returned futures are `Send` so repository operations can
/// be spawned onto a multi-threaded runtime.
pub trait DocumentStore: Send + Sync + 'static {
    /// Point read. `Ok(None)` when the document does not exist.
    fn get(
        &self,
        collection: &str,
        id: &str,
    ) -> impl Future<Output = StoreResult<Option<Snapshot>>> + Send;

    /// Run a filtered query.
    ///
    /// Stores without native offset support (see [`Self::supports_offset`])
    /// may ignore `query.offset`.
    fn query(
        &self,
        collection: &str,
        query: &Query,
    ) -> impl Future<Output = StoreResult<Vec<Snapshot>>> + Send;

    /// Count aggregate. `Ok(None)` when the store has no native count, in
    /// which case callers fall back to counting materialized results.
    fn count(
        &self,
        _collection: &str,
        _query: &Query,
    ) -> impl Future<Output = StoreResult<Option<u64>>> + Send {
        async { Ok(None) }
    }

    /// Atomically check every precondition and apply every write, or
    /// apply nothing.
    ///
    /// # Errors
    /// - `Conflict` when a precondition fails
    /// - `AlreadyExists` / `NotFound` from `Create` / `Update` writes
    fn commit(
        &self,
        writes: Vec<Write>,
        preconditions: Vec<Precondition>,
    ) -> impl Future<Output = StoreResult<CommitResult>> + Send;

    /// Generate a fresh document id.
    fn generate_id(&self) -> String {
        uuid::Uuid::now_v7().simple().to_string()
    }

    /// Maximum writes accepted by a single commit.
    fn max_batch_size(&self) -> usize {
        500
    }

    /// Maximum id length in bytes.
    fn max_id_len(&self) -> usize {
        1500
    }

    /// Whether `query` honours `Query::offset` natively.
    fn supports_offset(&self) -> bool {
        true
    }
}
