//! Chunked batch writes.
//!
//! A batch is split into chunks no larger than the store accepts in one
//! commit, and each chunk is committed on its own. Chunks that committed
//! stay committed when a later chunk fails; the outcome of every item is
//! reported in a [`BatchResult`] rather than as an error.

use crate::error::{Error, Result};
use crate::store::{DocumentStore, Precondition, Write};
use serde::Serialize;
use std::sync::Arc;

/// Aggregate outcome of a batch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    /// Every item was written.
    Success,
    /// Some chunks failed at the store after others committed.
    Partial,
    /// Items were rejected, or nothing was written.
    Error,
}

/// Failure of a single batch item.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BatchItemError {
    /// Position of the item in the caller's input.
    pub index: usize,
    pub id: Option<String>,
    pub message: String,
}

/// Outcome report of a batch operation.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub status: BatchStatus,
    pub written_count: usize,
    pub error_count: usize,
    pub errors: Vec<BatchItemError>,
    /// Ids of the written items, in input order.
    #[serde(skip)]
    pub written_ids: Vec<String>,
    #[serde(skip)]
    rejected: bool,
}

impl Default for BatchResult {
    fn default() -> Self {
        BatchResult {
            status: BatchStatus::Success,
            written_count: 0,
            error_count: 0,
            errors: Vec::new(),
            written_ids: Vec::new(),
            rejected: false,
        }
    }
}

impl BatchResult {
    pub fn is_success(&self) -> bool {
        self.status == BatchStatus::Success
    }

    /// Convert into an error when any item failed.
    ///
    /// # Errors
    ///
    /// Returns `Error::BatchPartialFailure` carrying every item failure.
    pub fn into_result(self, collection: &str) -> Result<BatchResult> {
        if self.errors.is_empty() {
            Ok(self)
        } else {
            Err(Error::BatchPartialFailure {
                collection: collection.to_string(),
                failures: self.errors,
            })
        }
    }

    /// Record an item refused before reaching the store.
    pub(crate) fn reject(&mut self, index: usize, id: Option<String>, error: &Error) {
        self.rejected = true;
        self.push_error(index, id, error.to_string());
    }

    fn push_error(&mut self, index: usize, id: Option<String>, message: String) {
        self.error_count += 1;
        self.errors.push(BatchItemError { index, id, message });
    }

    fn finish(mut self) -> Self {
        self.errors.sort_by_key(|e| e.index);
        self.status = if self.errors.is_empty() {
            BatchStatus::Success
        } else if self.rejected || self.written_count == 0 {
            BatchStatus::Error
        } else {
            BatchStatus::Partial
        };
        self
    }
}

/// A write tagged with its position in the caller's input.
#[derive(Clone, Debug)]
pub struct BatchItem {
    pub index: usize,
    pub write: Write,
    /// Revision the item was prepared against; a mismatch fails its chunk.
    pub precondition: Option<Precondition>,
}

impl BatchItem {
    pub fn new(index: usize, write: Write) -> Self {
        BatchItem {
            index,
            write,
            precondition: None,
        }
    }

    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.precondition = Some(precondition);
        self
    }
}

/// Commits writes in store-sized chunks.
pub struct BatchExecutor<S> {
    store: Arc<S>,
    collection: String,
    chunk_size: usize,
}

impl<S: DocumentStore> BatchExecutor<S> {
    pub fn new(store: Arc<S>, collection: impl Into<String>, chunk_size: usize) -> Self {
        BatchExecutor {
            store,
            collection: collection.into(),
            chunk_size,
        }
    }

    /// Effective chunk size: the configured size capped by the store limit.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size.min(self.store.max_batch_size()).max(1)
    }

    /// Commit `items` chunk by chunk, continuing past failed chunks.
    ///
    /// `result` may already hold item rejections gathered by the caller;
    /// the returned result includes them in its status.
    pub async fn run(&self, items: Vec<BatchItem>, mut result: BatchResult) -> BatchResult {
        let chunk_size = self.chunk_size();
        let total_chunks = items.len().div_ceil(chunk_size);

        for (n, chunk) in items.chunks(chunk_size).enumerate() {
            let writes: Vec<Write> = chunk.iter().map(|item| item.write.clone()).collect();
            let preconditions: Vec<Precondition> = chunk
                .iter()
                .filter_map(|item| item.precondition.clone())
                .collect();

            match self.store.commit(writes, preconditions).await {
                Ok(_) => {
                    debug!(
                        "✓ Batch chunk {}/{} on {} committed ({} writes)",
                        n + 1,
                        total_chunks,
                        self.collection,
                        chunk.len()
                    );
                    result.written_count += chunk.len();
                    result
                        .written_ids
                        .extend(chunk.iter().map(|item| item.write.id().to_string()));
                }
                Err(e) => {
                    warn!(
                        "✗ Batch chunk {}/{} on {} failed: {}",
                        n + 1,
                        total_chunks,
                        self.collection,
                        e
                    );
                    for item in chunk {
                        result.push_error(
                            item.index,
                            Some(item.write.id().to_string()),
                            format!("chunk {}/{} failed: {}", n + 1, total_chunks, e),
                        );
                    }
                }
            }
        }

        let result = result.finish();
        info!(
            "Batch on {}: {:?} ({} written, {} failed)",
            self.collection, result.status, result.written_count, result.error_count
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Document, Value};
    use crate::store::MemoryStore;

    fn create(index: usize, id: &str) -> BatchItem {
        let mut data = Document::new();
        data.insert("n".to_string(), Value::Integer(index as i64));
        BatchItem::new(
            index,
            Write::Create {
                collection: "items".to_string(),
                id: id.to_string(),
                data,
            },
        )
    }

    #[tokio::test]
    async fn test_chunks_capped_by_store_limit() {
        let store = MemoryStore::new().with_max_batch_size(2);
        let exec = BatchExecutor::new(Arc::new(store.clone()), "items", 500);
        assert_eq!(exec.chunk_size(), 2);

        let items = (0..5).map(|i| create(i, &format!("i{}", i))).collect();
        let result = exec.run(items, BatchResult::default()).await;

        assert_eq!(result.status, BatchStatus::Success);
        assert_eq!(result.written_count, 5);
        assert_eq!(store.commit_count(), 3);
        assert_eq!(store.len("items"), 5);
    }

    #[tokio::test]
    async fn test_failed_chunk_does_not_stop_batch() {
        let store = MemoryStore::new();
        let exec = BatchExecutor::new(Arc::new(store.clone()), "items", 2);

        store.fail_next_commits(1);
        let items = (0..4).map(|i| create(i, &format!("i{}", i))).collect();
        let result = exec.run(items, BatchResult::default()).await;

        assert_eq!(result.status, BatchStatus::Partial);
        assert_eq!(result.written_count, 2);
        assert_eq!(result.error_count, 2);
        assert_eq!(result.errors[0].index, 0);
        assert_eq!(result.errors[0].id.as_deref(), Some("i0"));
        assert_eq!(result.written_ids, vec!["i2", "i3"]);
        assert_eq!(store.len("items"), 2);
    }

    #[tokio::test]
    async fn test_rejections_make_status_error() {
        let store = MemoryStore::new();
        let exec = BatchExecutor::new(Arc::new(store), "items", 500);

        let mut pre = BatchResult::default();
        pre.reject(1, None, &Error::Config("bad item".to_string()));
        let result = exec
            .run(vec![create(0, "a"), create(2, "c")], pre)
            .await;

        assert_eq!(result.status, BatchStatus::Error);
        assert_eq!(result.written_count, 2);
        assert_eq!(result.error_count, 1);
        assert_eq!(result.written_ids, vec!["a", "c"]);

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["writtenCount"], 2);
    }

    #[tokio::test]
    async fn test_into_result() {
        let mut result = BatchResult::default();
        result.reject(0, Some("x".to_string()), &Error::Config("bad".to_string()));
        let err = result.finish().into_result("items").unwrap_err();
        assert!(matches!(err, Error::BatchPartialFailure { failures, .. } if failures.len() == 1));
    }
}
