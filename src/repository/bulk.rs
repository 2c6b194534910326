//! Batch create, update and delete.
//!
//! Items that fail validation are rejected up front and never reach the
//! store; the rest are committed in chunks by [`BatchExecutor`]. Updates
//! and deletes are committed against the revision they were prepared from,
//! so a concurrent writer fails the affected chunk instead of being
//! overwritten.
//!
//! An id repeated within one batch is prepared against the state its
//! earlier occurrence leaves behind. Both writes carry the revision of the
//! committed read, so occurrences split across chunks make the later chunk
//! conflict.
//!
//! [`BatchExecutor`]: crate::batch::BatchExecutor

use super::{CreateOptions, DeleteOptions, Repository, UpdateOptions};
use crate::batch::{BatchItem, BatchResult};
use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::store::{DocumentStore, Precondition, Snapshot, Write};
use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::time::Instant;

impl<T: Entity, S: DocumentStore> Repository<T, S> {
    /// Create many entities with store-generated ids.
    ///
    /// Timestamps come from the client clock. Invalid items are reported in
    /// the result with their input index.
    pub async fn create_batch(&self, items: Vec<T>) -> BatchResult {
        let now = Utc::now();
        let mut result = BatchResult::default();
        let mut writes = Vec::with_capacity(items.len());

        for (index, data) in items.into_iter().enumerate() {
            let prepared = self
                .prepare_create(data, &CreateOptions::default(), now)
                .and_then(|(id, doc)| {
                    self.validator()
                        .validate_required_fields(&doc, &self.config().required_fields)?;
                    Ok((id, doc))
                });
            match prepared {
                Ok((id, data)) => writes.push(BatchItem::new(
                    index,
                    Write::Create {
                        collection: self.collection().to_string(),
                        id,
                        data,
                    },
                )),
                Err(e) => {
                    debug!("Rejected batch create #{} on {}: {}", index, self.collection(), e);
                    result.reject(index, None, &e);
                }
            }
        }

        self.commit_batch(writes, result).await
    }

    /// Apply partial updates to many entities.
    ///
    /// Each `(id, patch)` pair follows the rules of [`Repository::update`].
    pub async fn update_batch(
        &self,
        updates: Vec<(String, serde_json::Value)>,
        opts: UpdateOptions,
    ) -> BatchResult {
        let mut result = BatchResult::default();
        let mut pending = Vec::with_capacity(updates.len());

        for (index, (id, patch)) in updates.into_iter().enumerate() {
            match self
                .validator()
                .validate_id(&id)
                .and_then(|()| self.patch_document(&id, &patch))
            {
                Ok(doc) => pending.push((index, id, doc)),
                Err(e) => result.reject(index, Some(id), &e),
            }
        }

        let ids: Vec<String> = pending.iter().map(|(_, id, _)| id.clone()).collect();
        let current = self.read_many(&ids).await;
        let now = Utc::now();
        let mut writes = Vec::with_capacity(pending.len());

        let mut staged: HashMap<String, Option<Snapshot>> = HashMap::new();

        for ((index, id, patch), read) in pending.into_iter().zip(current) {
            let prepared = self.staged_or(&staged, &id, read).and_then(|snapshot| {
                let prepared = self.prepare_update(&id, &snapshot.data, &patch, &opts, now)?;
                Ok((snapshot, prepared))
            });
            match prepared {
                Ok((mut snapshot, prepared)) => {
                    writes.push(
                        BatchItem::new(
                            index,
                            Write::Update {
                                collection: self.collection().to_string(),
                                id: id.clone(),
                                data: prepared.changes,
                            },
                        )
                        .with_precondition(self.precondition(&id, snapshot.revision)),
                    );
                    snapshot.data = prepared.merged;
                    staged.insert(id, Some(snapshot));
                }
                Err(e) => result.reject(index, Some(id), &e),
            }
        }

        self.commit_batch(writes, result).await
    }

    /// Soft- or hard-delete many entities.
    ///
    /// Each id follows the rules of [`Repository::delete`].
    pub async fn delete_batch(&self, ids: Vec<String>, opts: DeleteOptions) -> BatchResult {
        let mut result = BatchResult::default();
        let mut pending = Vec::with_capacity(ids.len());

        for (index, id) in ids.into_iter().enumerate() {
            match self.validator().validate_id(&id) {
                Ok(()) => pending.push((index, id)),
                Err(e) => result.reject(index, Some(id), &e),
            }
        }

        let ids: Vec<String> = pending.iter().map(|(_, id)| id.clone()).collect();
        let current = self.read_many(&ids).await;
        let now = Utc::now();
        let mut writes = Vec::with_capacity(pending.len());

        let mut staged: HashMap<String, Option<Snapshot>> = HashMap::new();

        for ((index, id), read) in pending.into_iter().zip(current) {
            let prepared = self.staged_or(&staged, &id, read).and_then(|snapshot| {
                let changes = self.prepare_delete(&id, &snapshot.data, &opts, now)?;
                Ok((snapshot, changes))
            });
            let collection = self.collection().to_string();
            match prepared {
                Ok((mut snapshot, changes)) => {
                    let precondition = self.precondition(&id, snapshot.revision);
                    let (write, next) = match changes {
                        Some(data) => {
                            snapshot.data.extend(data.clone());
                            let write = Write::Update {
                                collection,
                                id: id.clone(),
                                data,
                            };
                            (write, Some(snapshot))
                        }
                        None => {
                            let write = Write::Delete {
                                collection,
                                id: id.clone(),
                            };
                            (write, None)
                        }
                    };
                    writes.push(BatchItem::new(index, write).with_precondition(precondition));
                    staged.insert(id, next);
                }
                Err(e) => result.reject(index, Some(id), &e),
            }
        }

        self.commit_batch(writes, result).await
    }

    /// Read the current snapshot of every id concurrently; absent ids map
    /// to `NotFound`.
    async fn read_many(&self, ids: &[String]) -> Vec<Result<Snapshot>> {
        join_all(ids.iter().map(|id| async move {
            self.read_snapshot(id)
                .await?
                .ok_or_else(|| Error::not_found(self.collection(), id))
        }))
        .await
    }

    /// State an earlier item of the same batch leaves `id` in, falling back
    /// to the committed read. `None` in `staged` means hard-deleted.
    fn staged_or(
        &self,
        staged: &HashMap<String, Option<Snapshot>>,
        id: &str,
        read: Result<Snapshot>,
    ) -> Result<Snapshot> {
        match staged.get(id) {
            Some(Some(snapshot)) => Ok(snapshot.clone()),
            Some(None) => Err(Error::not_found(self.collection(), id)),
            None => read,
        }
    }

    fn precondition(&self, id: &str, revision: u64) -> Precondition {
        Precondition {
            collection: self.collection().to_string(),
            id: id.to_string(),
            expected_revision: Some(revision),
        }
    }

    async fn commit_batch(&self, items: Vec<BatchItem>, result: BatchResult) -> BatchResult {
        for item in &items {
            self.cache().delete(&self.cache_key(item.write.id()));
        }

        let timer = Instant::now();
        let result = self.batches().run(items, result).await;
        if result.written_count > 0 {
            self.record_writes(result.written_count as u64, timer);
        }
        if !result.errors.is_empty() {
            self.record_error(&format!(
                "batch on {}: {} items failed",
                self.collection(),
                result.error_count
            ));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BatchStatus;
    use crate::config::RepositoryConfig;
    use crate::repository::ReadOptions;
    use crate::store::MemoryStore;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Task {
        title: Option<String>,
        done: bool,
    }

    impl Entity for Task {
        fn collection() -> &'static str {
            "tasks"
        }
    }

    fn task(title: &str) -> Task {
        Task {
            title: Some(title.to_string()),
            done: false,
        }
    }

    fn repo(store: MemoryStore) -> Repository<Task, MemoryStore> {
        Repository::new(
            store,
            RepositoryConfig::new("tasks").with_required_fields(["title"]),
        )
        .expect("valid config")
    }

    async fn seed(repo: &Repository<Task, MemoryStore>, ids: &[&str]) {
        for id in ids {
            repo.create(task(id), CreateOptions::default().with_id(*id))
                .await
                .expect("seed");
        }
    }

    #[tokio::test]
    async fn test_update_batch_reports_missing_and_deleted() {
        let repo = repo(MemoryStore::new());
        seed(&repo, &["a", "b", "c"]).await;
        repo.delete("c", DeleteOptions::soft()).await.unwrap();

        let result = repo
            .update_batch(
                vec![
                    ("a".to_string(), json!({"done": true})),
                    ("missing".to_string(), json!({"done": true})),
                    ("c".to_string(), json!({"done": true})),
                    ("b".to_string(), json!({"done": true})),
                ],
                UpdateOptions::default(),
            )
            .await;

        assert_eq!(result.status, BatchStatus::Error);
        assert_eq!(result.written_count, 2);
        let failed: Vec<usize> = result.errors.iter().map(|e| e.index).collect();
        assert_eq!(failed, vec![1, 2]);

        let a = repo.get("a").await.unwrap();
        assert!(a.done);
        assert_eq!(a.version, Some(2));
    }

    #[tokio::test]
    async fn test_update_batch_evicts_cache() {
        let repo = repo(MemoryStore::new());
        seed(&repo, &["a"]).await;
        assert!(repo.cache().has(&repo.cache_key("a")));

        let result = repo
            .update_batch(
                vec![("a".to_string(), json!({"title": "renamed"}))],
                UpdateOptions::default(),
            )
            .await;
        assert!(result.is_success());

        let a = repo.find_by_id("a", ReadOptions::default()).await.unwrap();
        assert_eq!(a.unwrap().title.as_deref(), Some("renamed"));
    }

    #[tokio::test]
    async fn test_delete_batch_soft_and_hard() {
        let store = MemoryStore::new();
        let repo = repo(store.clone());
        seed(&repo, &["a", "b"]).await;

        let soft = repo
            .delete_batch(vec!["a".to_string()], DeleteOptions::soft())
            .await;
        assert!(soft.is_success());
        assert!(!repo.exists("a").await.unwrap());
        assert_eq!(store.len("tasks"), 2);

        let hard = repo
            .delete_batch(
                vec!["a".to_string(), "b".to_string()],
                DeleteOptions::hard().with_force(true),
            )
            .await;
        assert!(hard.is_success());
        assert_eq!(hard.written_count, 2);
        assert!(store.is_empty("tasks"));
    }

    #[tokio::test]
    async fn test_delete_batch_already_deleted() {
        let repo = repo(MemoryStore::new());
        seed(&repo, &["a"]).await;
        repo.delete("a", DeleteOptions::soft()).await.unwrap();

        let result = repo
            .delete_batch(vec!["a".to_string()], DeleteOptions::soft())
            .await;
        assert_eq!(result.status, BatchStatus::Error);
        assert_eq!(result.errors[0].id.as_deref(), Some("a"));
        assert_eq!(repo.get_stats().errors, 1);
    }

    #[tokio::test]
    async fn test_update_batch_repeated_id_bumps_version_per_item() {
        let repo = repo(MemoryStore::new());
        seed(&repo, &["a"]).await;

        let result = repo
            .update_batch(
                vec![
                    ("a".to_string(), json!({"done": true})),
                    ("a".to_string(), json!({"title": "second"})),
                ],
                UpdateOptions::default(),
            )
            .await;
        assert!(result.is_success());
        assert_eq!(result.written_count, 2);

        let a = repo.get("a").await.unwrap();
        assert!(a.done);
        assert_eq!(a.title.as_deref(), Some("second"));
        assert_eq!(a.version, Some(3));
    }

    #[tokio::test]
    async fn test_delete_batch_repeated_id_already_deleted() {
        let repo = repo(MemoryStore::new());
        seed(&repo, &["a"]).await;

        let result = repo
            .delete_batch(vec!["a".to_string(), "a".to_string()], DeleteOptions::soft())
            .await;
        assert_eq!(result.status, BatchStatus::Error);
        assert_eq!(result.written_count, 1);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].index, 1);
        assert!(result.errors[0].message.contains("already deleted"));

        let a = repo
            .find_by_id("a", ReadOptions::default().with_include_deleted(true))
            .await
            .unwrap()
            .unwrap();
        assert!(a.is_deleted);
        assert_eq!(a.version, Some(2));
    }

    #[tokio::test]
    async fn test_delete_batch_repeated_id_after_hard_delete() {
        let store = MemoryStore::new();
        let repo = repo(store.clone());
        seed(&repo, &["a"]).await;

        let result = repo
            .delete_batch(
                vec!["a".to_string(), "a".to_string()],
                DeleteOptions::hard(),
            )
            .await;
        assert_eq!(result.written_count, 1);
        assert_eq!(result.errors[0].index, 1);
        assert!(store.is_empty("tasks"));
    }
}
