//! In-memory document store (default feature, thread-safe, async).
//!
//! Implements the full [`DocumentStore`] contract: revisions, preconditions,
//! atomic commits, server timestamps, filtered/sorted queries with offset
//! and cursor, and a count aggregate. Native offset and count can be
//! switched off to exercise the repository's client-side fallbacks.

use super::{
    CommitResult, DocumentStore, Precondition, Snapshot, StoreError, StoreResult, Write, WriteResult,
};
use crate::document::{get_path, resolve_server_timestamps, Document};
use crate::key::KeyBuilder;
use crate::query::{Direction, Query};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

#[derive(Clone)]
struct StoredDocument {
    data: Document,
    revision: u64,
    update_time: DateTime<Utc>,
}

type Collections = HashMap<String, BTreeMap<String, StoredDocument>>;

/// Thread-safe in-memory document store.
///
/// Clones share the same underlying data.
///
/// Every call yields to the scheduler once before touching state, so two
/// operations issued concurrently on one task interleave the way they would
/// against a remote store.
///
/// # Example
///
/// ```no_run
/// use repo_kit::store::{DocumentStore, MemoryStore, Write};
/// use repo_kit::document::{Document, Value};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = MemoryStore::new();
///     let mut data = Document::new();
///     data.insert("name".to_string(), Value::from("Widget"));
///
///     store
///         .commit(
///             vec![Write::Create { collection: "products".into(), id: "w1".into(), data }],
///             vec![],
///         )
///         .await?;
///
///     assert!(store.get("products", "w1").await?.is_some());
///     Ok(())
/// }
/// ```
#[derive(Clone)]
pub struct MemoryStore {
    collections: Arc<RwLock<Collections>>,
    revision_clock: Arc<AtomicU64>,
    commits: Arc<AtomicU64>,
    fail_next_commits: Arc<AtomicUsize>,
    native_offset: bool,
    native_count: bool,
    max_batch_size: usize,
}

impl MemoryStore {
    /// Create an empty store with native offset and count support.
    pub fn new() -> Self {
        MemoryStore {
            collections: Arc::new(RwLock::new(HashMap::new())),
            revision_clock: Arc::new(AtomicU64::new(0)),
            commits: Arc::new(AtomicU64::new(0)),
            fail_next_commits: Arc::new(AtomicUsize::new(0)),
            native_offset: true,
            native_count: true,
            max_batch_size: 500,
        }
    }

    /// Behave like a store that ignores `Query::offset`.
    pub fn without_offset(mut self) -> Self {
        self.native_offset = false;
        self
    }

    /// Behave like a store without a count aggregate.
    pub fn without_count(mut self) -> Self {
        self.native_count = false;
        self
    }

    /// Override the per-commit write limit.
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Make the next `n` commits fail with `Unavailable`.
    pub fn fail_next_commits(&self, n: usize) {
        self.fail_next_commits.store(n, AtomicOrdering::SeqCst);
    }

    /// Number of commits attempted (including injected failures).
    pub fn commit_count(&self) -> u64 {
        self.commits.load(AtomicOrdering::SeqCst)
    }

    /// Number of documents in a collection.
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    /// Whether a collection holds no documents.
    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    /// Raw fields of a stored document, bypassing the async API.
    pub fn document(&self, collection: &str, id: &str) -> Option<Document> {
        self.collections
            .read()
            .get(collection)
            .and_then(|c| c.get(id))
            .map(|d| d.data.clone())
    }

    /// Remove every document from every collection.
    pub fn clear(&self) {
        self.collections.write().clear();
        warn!("⚠ MemoryStore CLEAR executed - all documents removed!");
    }

    fn snapshot(id: &str, doc: &StoredDocument) -> Snapshot {
        Snapshot {
            id: id.to_string(),
            data: doc.data.clone(),
            revision: doc.revision,
            update_time: doc.update_time,
        }
    }

    fn matching(&self, collection: &str, query: &Query) -> StoreResult<Vec<Snapshot>> {
        let guard = self.collections.read();
        let Some(docs) = guard.get(collection) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<Snapshot> = docs
            .iter()
            .filter(|(_, d)| query.matches(&d.data))
            .map(|(id, d)| Self::snapshot(id, d))
            .collect();
        drop(guard);

        if let Some(order) = &query.order_by {
            // Documents without the sort field are excluded from ordered results.
            hits.retain(|s| get_path(&s.data, &order.field).is_some());
            hits.sort_by(|a, b| {
                let ord = compare_field(&a.data, &b.data, &order.field).then_with(|| a.id.cmp(&b.id));
                match order.direction {
                    Direction::Ascending => ord,
                    Direction::Descending => ord.reverse(),
                }
            });
        }

        if let Some(cursor) = &query.start_after {
            let pos = hits.iter().position(|s| &s.id == cursor).ok_or_else(|| {
                StoreError::InvalidArgument(format!(
                    "cursor document {} is not part of the result set",
                    KeyBuilder::document_path(collection, cursor)
                ))
            })?;
            hits.drain(..=pos);
        }

        Ok(hits)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn compare_field(a: &Document, b: &Document, field: &str) -> Ordering {
    match (get_path(a, field), get_path(b, field)) {
        (Some(x), Some(y)) => x.total_cmp(y),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

fn resolve_document(mut doc: Document, now: DateTime<Utc>) -> Document {
    resolve_server_timestamps(&mut doc, now);
    doc
}

impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Snapshot>> {
        tokio::task::yield_now().await;

        let result = self
            .collections
            .read()
            .get(collection)
            .and_then(|c| c.get(id))
            .map(|d| Self::snapshot(id, d));

        debug!(
            "✓ MemoryStore GET {} -> {}",
            KeyBuilder::document_path(collection, id),
            if result.is_some() { "FOUND" } else { "ABSENT" }
        );
        Ok(result)
    }

    async fn query(&self, collection: &str, query: &Query) -> StoreResult<Vec<Snapshot>> {
        tokio::task::yield_now().await;

        let mut hits = self.matching(collection, query)?;
        if self.native_offset {
            if let Some(offset) = query.offset {
                hits.drain(..offset.min(hits.len()));
            }
        }
        if let Some(limit) = query.limit {
            hits.truncate(limit);
        }

        debug!(
            "✓ MemoryStore QUERY {} ({} filters) -> {} docs",
            collection,
            query.filters.len(),
            hits.len()
        );
        Ok(hits)
    }

    async fn count(&self, collection: &str, query: &Query) -> StoreResult<Option<u64>> {
        tokio::task::yield_now().await;

        if !self.native_count {
            return Ok(None);
        }
        let mut total = self.matching(collection, query)?.len();
        if let Some(limit) = query.limit {
            total = total.min(limit);
        }
        Ok(Some(total as u64))
    }

    async fn commit(
        &self,
        writes: Vec<Write>,
        preconditions: Vec<Precondition>,
    ) -> StoreResult<CommitResult> {
        tokio::task::yield_now().await;

        self.commits.fetch_add(1, AtomicOrdering::SeqCst);
        let injected = self
            .fail_next_commits
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            warn!("✗ MemoryStore COMMIT failed (injected)");
            return Err(StoreError::Unavailable("injected commit failure".to_string()));
        }

        if writes.len() > self.max_batch_size {
            return Err(StoreError::InvalidArgument(format!(
                "commit of {} writes exceeds limit of {}",
                writes.len(),
                self.max_batch_size
            )));
        }

        let now = Utc::now();
        let mut guard = self.collections.write();

        for pre in &preconditions {
            let current = guard
                .get(&pre.collection)
                .and_then(|c| c.get(&pre.id))
                .map(|d| d.revision);
            if current != pre.expected_revision {
                let path = KeyBuilder::document_path(&pre.collection, &pre.id);
                debug!(
                    "✗ MemoryStore COMMIT conflict on {} (expected {:?}, found {:?})",
                    path, pre.expected_revision, current
                );
                return Err(StoreError::Conflict(format!("{} changed since it was read", path)));
            }
        }

        // Stage every write first so a failing write leaves the store untouched.
        let mut staged: HashMap<(String, String), Option<Document>> = HashMap::new();
        for write in &writes {
            let key = (write.collection().to_string(), write.id().to_string());
            let current = match staged.get(&key) {
                Some(doc) => doc.clone(),
                None => guard
                    .get(&key.0)
                    .and_then(|c| c.get(&key.1))
                    .map(|d| d.data.clone()),
            };
            let path = KeyBuilder::document_path(&key.0, &key.1);

            let next = match write {
                Write::Create { data, .. } => {
                    if current.is_some() {
                        return Err(StoreError::AlreadyExists { path });
                    }
                    Some(resolve_document(data.clone(), now))
                }
                Write::Set { data, .. } => Some(resolve_document(data.clone(), now)),
                Write::Update { data, .. } => {
                    let Some(mut merged) = current else {
                        return Err(StoreError::NotFound { path });
                    };
                    merged.extend(resolve_document(data.clone(), now));
                    Some(merged)
                }
                Write::Delete { .. } => None,
            };
            staged.insert(key, next);
        }

        let count = staged.len();
        let mut revisions: HashMap<(String, String), Option<u64>> = HashMap::with_capacity(count);
        for ((collection, id), doc) in staged {
            let key = (collection.clone(), id.clone());
            match doc {
                Some(data) => {
                    let revision = self.revision_clock.fetch_add(1, AtomicOrdering::SeqCst) + 1;
                    guard.entry(collection).or_default().insert(
                        id,
                        StoredDocument {
                            data,
                            revision,
                            update_time: now,
                        },
                    );
                    revisions.insert(key, Some(revision));
                }
                None => {
                    if let Some(c) = guard.get_mut(&collection) {
                        c.remove(&id);
                    }
                    revisions.insert(key, None);
                }
            }
        }
        drop(guard);

        let write_results = writes
            .iter()
            .map(|w| WriteResult {
                revision: revisions
                    .get(&(w.collection().to_string(), w.id().to_string()))
                    .copied()
                    .flatten(),
            })
            .collect();

        debug!(
            "✓ MemoryStore COMMIT {} writes ({} documents, {} preconditions)",
            writes.len(),
            count,
            preconditions.len()
        );
        Ok(CommitResult {
            commit_time: now,
            write_results,
        })
    }

    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    fn supports_offset(&self) -> bool {
        self.native_offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{document_from_json, Value};
    use crate::query::{Filter, FilterOp};
    use serde_json::json;

    fn doc(v: serde_json::Value) -> Document {
        document_from_json(v).unwrap()
    }

    fn create(id: &str, v: serde_json::Value) -> Write {
        Write::Create {
            collection: "products".to_string(),
            id: id.to_string(),
            data: doc(v),
        }
    }

    async fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .commit(
                vec![
                    create("a", json!({"price": 30, "cat": "x"})),
                    create("b", json!({"price": 10, "cat": "x"})),
                    create("c", json!({"price": 20, "cat": "y"})),
                    create("d", json!({"cat": "x"})),
                ],
                vec![],
            )
            .await
            .expect("seed commit");
        store
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let store = seeded().await;
        let snap = store.get("products", "a").await.unwrap().unwrap();
        assert_eq!(snap.data.get("price"), Some(&Value::Integer(30)));
        assert!(store.get("products", "zz").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_existing_fails_atomically() {
        let store = seeded().await;
        let err = store
            .commit(
                vec![create("new", json!({})), create("a", json!({}))],
                vec![],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::AlreadyExists { .. }));
        assert!(store.get("products", "new").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_merges_and_bumps_revision() {
        let store = seeded().await;
        let before = store.get("products", "a").await.unwrap().unwrap();
        store
            .commit(
                vec![Write::Update {
                    collection: "products".into(),
                    id: "a".into(),
                    data: doc(json!({"price": 31})),
                }],
                vec![],
            )
            .await
            .unwrap();

        let after = store.get("products", "a").await.unwrap().unwrap();
        assert_eq!(after.data.get("price"), Some(&Value::Integer(31)));
        assert_eq!(after.data.get("cat"), Some(&Value::from("x")));
        assert!(after.revision > before.revision);
    }

    #[tokio::test]
    async fn test_update_missing_fails() {
        let store = MemoryStore::new();
        let err = store
            .commit(
                vec![Write::Update {
                    collection: "products".into(),
                    id: "nope".into(),
                    data: Document::new(),
                }],
                vec![],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_precondition_conflict() {
        let store = seeded().await;
        let snap = store.get("products", "a").await.unwrap().unwrap();
        let guarded = |rev| Precondition {
            collection: "products".into(),
            id: "a".into(),
            expected_revision: Some(rev),
        };

        store
            .commit(vec![create("e", json!({}))], vec![guarded(snap.revision)])
            .await
            .expect("first commit succeeds");
        store
            .commit(
                vec![Write::Update {
                    collection: "products".into(),
                    id: "a".into(),
                    data: doc(json!({"price": 1})),
                }],
                vec![],
            )
            .await
            .unwrap();

        let err = store
            .commit(vec![create("f", json!({}))], vec![guarded(snap.revision)])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert!(store.get("products", "f").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_server_timestamp_resolved() {
        let store = MemoryStore::new();
        let mut data = Document::new();
        data.insert("createdAt".into(), Value::ServerTimestamp);
        store
            .commit(
                vec![Write::Set {
                    collection: "products".into(),
                    id: "t".into(),
                    data,
                }],
                vec![],
            )
            .await
            .unwrap();

        let snap = store.get("products", "t").await.unwrap().unwrap();
        assert_eq!(
            snap.data.get("createdAt").and_then(Value::as_timestamp),
            Some(snap.update_time)
        );
    }

    #[tokio::test]
    async fn test_query_order_offset_limit() {
        let store = seeded().await;
        let q = Query::new()
            .filter(Filter::eq("cat", "x"))
            .order_by("price", Direction::Descending)
            .offset(1)
            .limit(5);

        let ids: Vec<String> = store
            .query("products", &q)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        // "d" has no price and is excluded from the ordered result.
        assert_eq!(ids, vec!["b"]);
    }

    #[tokio::test]
    async fn test_query_without_native_offset_ignores_offset() {
        let store = seeded().await.without_offset();
        let q = Query::new().order_by("price", Direction::Ascending).offset(2);
        let hits = store.query("products", &q).await.unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[tokio::test]
    async fn test_query_cursor() {
        let store = seeded().await;
        let q = Query::new()
            .order_by("price", Direction::Ascending)
            .start_after("b");
        let ids: Vec<String> = store
            .query("products", &q)
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["c", "a"]);
    }

    #[tokio::test]
    async fn test_count_and_disabled_count() {
        let store = seeded().await;
        let q = Query::new().filter(Filter::new("price", FilterOp::Gte, 20));
        assert_eq!(store.count("products", &q).await.unwrap(), Some(2));

        let no_count = store.clone().without_count();
        assert_eq!(no_count.count("products", &q).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryStore::new();
        store.fail_next_commits(1);
        let err = store
            .commit(vec![create("x", json!({}))], vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));

        store
            .commit(vec![create("x", json!({}))], vec![])
            .await
            .expect("second commit succeeds");
        assert_eq!(store.commit_count(), 2);
    }

    #[tokio::test]
    async fn test_commit_over_limit_rejected() {
        let store = MemoryStore::new().with_max_batch_size(1);
        let err = store
            .commit(vec![create("x", json!({})), create("y", json!({}))], vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_commit_reports_revisions() {
        let store = seeded().await;
        let result = store
            .commit(
                vec![
                    create("n", json!({})),
                    Write::Delete {
                        collection: "products".into(),
                        id: "a".into(),
                    },
                ],
                vec![],
            )
            .await
            .expect("commit succeeds");

        let snap = store.get("products", "n").await.unwrap().unwrap();
        assert_eq!(result.write_results.len(), 2);
        assert_eq!(result.write_results[0].revision, Some(snap.revision));
        assert_eq!(result.write_results[1].revision, None);
        assert_eq!(snap.update_time, result.commit_time);
    }
}
