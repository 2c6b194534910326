//! Optimistic transactions over a [`DocumentStore`].
//!
//! A [`Transaction`] records the revision of every document it reads and
//! buffers every write. On commit the buffered writes are sent to the store
//! together with one precondition per read, so the commit applies only if
//! nothing the callback observed has changed since. A failed precondition
//! surfaces as `StoreError::Conflict`, and [`TransactionExecutor::run`]
//! re-runs the whole callback with exponential backoff until it commits,
//! runs out of attempts, or hits the overall deadline.
//!
//! Reads observe committed store state; a transaction does not see its own
//! buffered writes.

use crate::config::TransactionConfig;
use crate::document::Document;
use crate::error::{Error, Result};
use crate::store::{
    CommitResult, DocumentStore, Precondition, Snapshot, StoreError, StoreResult, Write,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

#[derive(Default)]
struct TxState {
    /// (collection, id) -> revision observed (`None`: observed absent).
    reads: HashMap<(String, String), Option<u64>>,
    writes: Vec<Write>,
}

/// Handle scoping reads and buffered writes of one transaction attempt.
///
/// Cheap to clone; clones share the same attempt state.
pub struct Transaction<S> {
    store: Arc<S>,
    state: Arc<Mutex<TxState>>,
}

impl<S> Clone for Transaction<S> {
    fn clone(&self) -> Self {
        Transaction {
            store: Arc::clone(&self.store),
            state: Arc::clone(&self.state),
        }
    }
}

impl<S: DocumentStore> Transaction<S> {
    fn new(store: Arc<S>) -> Self {
        Transaction {
            store,
            state: Arc::new(Mutex::new(TxState::default())),
        }
    }

    /// Read a document and pin its revision for the commit.
    ///
    /// Reading the same document twice must observe the same revision;
    /// otherwise the attempt is aborted with `Conflict`.
    pub async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Snapshot>> {
        let snapshot = self.store.get(collection, id).await?;
        let observed = snapshot.as_ref().map(|s| s.revision);

        let mut state = self.state.lock();
        let key = (collection.to_string(), id.to_string());
        match state.reads.get(&key) {
            Some(previous) if *previous != observed => Err(StoreError::Conflict(format!(
                "{}/{} changed during transaction",
                collection, id
            ))),
            _ => {
                state.reads.insert(key, observed);
                Ok(snapshot)
            }
        }
    }

    pub fn create(&self, collection: &str, id: &str, data: Document) {
        self.push(Write::Create {
            collection: collection.to_string(),
            id: id.to_string(),
            data,
        });
    }

    pub fn set(&self, collection: &str, id: &str, data: Document) {
        self.push(Write::Set {
            collection: collection.to_string(),
            id: id.to_string(),
            data,
        });
    }

    pub fn update(&self, collection: &str, id: &str, data: Document) {
        self.push(Write::Update {
            collection: collection.to_string(),
            id: id.to_string(),
            data,
        });
    }

    pub fn delete(&self, collection: &str, id: &str) {
        self.push(Write::Delete {
            collection: collection.to_string(),
            id: id.to_string(),
        });
    }

    /// Number of buffered writes.
    pub fn pending_writes(&self) -> usize {
        self.state.lock().writes.len()
    }

    fn push(&self, write: Write) {
        self.state.lock().writes.push(write);
    }

    fn take(&self) -> (Vec<Write>, Vec<Precondition>) {
        let mut state = self.state.lock();
        let writes = std::mem::take(&mut state.writes);
        let preconditions = state
            .reads
            .drain()
            .map(|((collection, id), expected_revision)| Precondition {
                collection,
                id,
                expected_revision,
            })
            .collect();
        (writes, preconditions)
    }
}

/// Runs callbacks inside retried, deadline-bounded transactions.
pub struct TransactionExecutor<S> {
    store: Arc<S>,
    collection: String,
    config: TransactionConfig,
}

impl<S: DocumentStore> TransactionExecutor<S> {
    pub fn new(store: Arc<S>, collection: impl Into<String>, config: TransactionConfig) -> Self {
        TransactionExecutor {
            store,
            collection: collection.into(),
            config,
        }
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Run `f` in a transaction.
    ///
    /// `f` may be invoked several times and must be idempotent apart from
    /// its transaction writes.
    ///
    /// # Errors
    ///
    /// - `Error::ConcurrencyConflict`: conflicts persisted through every attempt
    /// - `Error::TransactionTimeout`: the overall deadline passed
    /// - any error returned by `f` that is not a store conflict
    pub async fn run<R, F, Fut>(&self, f: F) -> Result<R>
    where
        F: FnMut(Transaction<S>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        self.run_with_commit(f).await.map(|(value, _)| value)
    }

    /// Like [`Self::run`], also returning the store's commit result.
    ///
    /// The commit result is `None` when the callback neither read nor wrote.
    pub async fn run_with_commit<R, F, Fut>(&self, mut f: F) -> Result<(R, Option<CommitResult>)>
    where
        F: FnMut(Transaction<S>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let timeout = self.config.timeout();
        match tokio::time::timeout(timeout, self.run_attempts(&mut f)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Transaction on {} timed out after {:?}",
                    self.collection, timeout
                );
                Err(Error::TransactionTimeout {
                    collection: self.collection.clone(),
                    timeout,
                })
            }
        }
    }

    async fn run_attempts<R, F, Fut>(&self, f: &mut F) -> Result<(R, Option<CommitResult>)>
    where
        F: FnMut(Transaction<S>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempts = 0;

        loop {
            attempts += 1;

            let conflict = match self.attempt(f).await {
                Ok(value) => return Ok(value),
                Err(AttemptError::Conflict(detail)) => detail,
                Err(AttemptError::Fatal(e)) => return Err(e),
            };

            if attempts >= max_attempts {
                info!(
                    "✗ Transaction on {} gave up after {} attempts: {}",
                    self.collection, attempts, conflict
                );
                return Err(Error::ConcurrencyConflict {
                    collection: self.collection.clone(),
                    id: None,
                    detail: format!("{} (after {} attempts)", conflict, attempts),
                });
            }

            debug!(
                "Transaction conflict on {} (attempt {}/{}), retrying...",
                self.collection, attempts, max_attempts
            );
            tokio::time::sleep(self.config.backoff(attempts)).await;
        }
    }

    async fn attempt<R, F, Fut>(
        &self,
        f: &mut F,
    ) -> std::result::Result<(R, Option<CommitResult>), AttemptError>
    where
        F: FnMut(Transaction<S>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let tx = Transaction::new(Arc::clone(&self.store));
        let value = f(tx.clone()).await.map_err(AttemptError::from)?;

        let (writes, preconditions) = tx.take();
        if writes.is_empty() && preconditions.is_empty() {
            return Ok((value, None));
        }

        match self.store.commit(writes, preconditions).await {
            Ok(commit) => Ok((value, Some(commit))),
            Err(StoreError::Conflict(detail)) => Err(AttemptError::Conflict(detail)),
            Err(e) => Err(AttemptError::Fatal(Error::store(&self.collection, None, e))),
        }
    }
}

enum AttemptError {
    Conflict(String),
    Fatal(Error),
}

impl From<Error> for AttemptError {
    fn from(e: Error) -> Self {
        match e {
            Error::Store {
                source: StoreError::Conflict(detail),
                ..
            } => AttemptError::Conflict(detail),
            other => AttemptError::Fatal(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Value;
    use crate::store::MemoryStore;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn doc(n: i64) -> Document {
        let mut d = BTreeMap::new();
        d.insert("n".to_string(), Value::Integer(n));
        d
    }

    fn executor(store: &MemoryStore, attempts: u32) -> TransactionExecutor<MemoryStore> {
        TransactionExecutor::new(
            Arc::new(store.clone()),
            "counters",
            TransactionConfig::default()
                .with_max_attempts(attempts)
                .with_retry_backoff(Duration::from_millis(1)),
        )
    }

    #[tokio::test]
    async fn test_commit_applies_buffered_writes() {
        let store = MemoryStore::new();
        let exec = executor(&store, 5);

        exec.run(|tx| async move {
            tx.create("counters", "a", doc(1));
            tx.create("counters", "b", doc(2));
            Ok(())
        })
        .await
        .expect("transaction should commit");

        assert_eq!(store.len("counters"), 2);
    }

    #[tokio::test]
    async fn test_callback_error_discards_writes() {
        let store = MemoryStore::new();
        let exec = executor(&store, 5);

        let result: Result<()> = exec
            .run(|tx| async move {
                tx.create("counters", "a", doc(1));
                Err(Error::Config("abort".to_string()))
            })
            .await;

        assert!(matches!(result, Err(Error::Config(_))));
        assert!(store.is_empty("counters"));
    }

    #[tokio::test]
    async fn test_conflict_is_retried() {
        let store = MemoryStore::new();
        store
            .commit(
                vec![Write::Create {
                    collection: "counters".into(),
                    id: "a".into(),
                    data: doc(0),
                }],
                vec![],
            )
            .await
            .unwrap();

        let exec = executor(&store, 5);
        let calls = Arc::new(AtomicU32::new(0));
        let outside = store.clone();

        let calls_in = Arc::clone(&calls);
        exec.run(move |tx| {
            let calls = Arc::clone(&calls_in);
            let outside = outside.clone();
            async move {
                let current = tx.get("counters", "a").await.map_err(|e| {
                    Error::store("counters", Some("a"), e)
                })?;
                let n = current
                    .and_then(|s| s.data.get("n").and_then(Value::as_i64))
                    .unwrap_or(0);

                // A competing writer sneaks in on the first attempt only.
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    outside
                        .commit(
                            vec![Write::Set {
                                collection: "counters".into(),
                                id: "a".into(),
                                data: doc(100),
                            }],
                            vec![],
                        )
                        .await
                        .unwrap();
                }

                tx.set("counters", "a", doc(n + 1));
                Ok(())
            }
        })
        .await
        .expect("second attempt should commit");

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            store.document("counters", "a").unwrap()["n"],
            Value::Integer(101)
        );
    }

    #[tokio::test]
    async fn test_conflict_exhausts_attempts() {
        let store = MemoryStore::new();
        let exec = executor(&store, 2);
        let outside = store.clone();

        let result: Result<()> = exec
            .run(move |tx| {
                let outside = outside.clone();
                async move {
                    tx.get("counters", "a")
                        .await
                        .map_err(|e| Error::store("counters", Some("a"), e))?;
                    // Always invalidate the "must not exist" read.
                    outside
                        .commit(
                            vec![Write::Set {
                                collection: "counters".into(),
                                id: "a".into(),
                                data: doc(1),
                            }],
                            vec![],
                        )
                        .await
                        .unwrap();
                    tx.set("counters", "a", doc(2));
                    Ok(())
                }
            })
            .await;

        assert!(matches!(result, Err(Error::ConcurrencyConflict { .. })));
    }

    #[tokio::test]
    async fn test_reads_do_not_see_buffered_writes() {
        let store = MemoryStore::new();
        let exec = executor(&store, 1);

        let seen = exec
            .run(|tx| async move {
                tx.set("counters", "a", doc(1));
                let snap = tx
                    .get("counters", "a")
                    .await
                    .map_err(|e| Error::store("counters", Some("a"), e))?;
                Ok(snap.is_some())
            })
            .await
            .expect("transaction should commit");

        assert!(!seen);
        assert_eq!(store.len("counters"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let store = MemoryStore::new();
        let exec = TransactionExecutor::new(
            Arc::new(store),
            "counters",
            TransactionConfig::default().with_timeout(Duration::from_millis(50)),
        );

        let result: Result<()> = exec
            .run(|_tx| async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(Error::TransactionTimeout { .. })));
    }
}
