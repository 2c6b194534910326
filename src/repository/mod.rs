//! Generic versioned, cached CRUD repository.
//!
//! A [`Repository`] owns one collection of one entity type and composes the
//! lower layers: the [`Validator`] checks ids and required fields, the
//! [`EntityCache`] serves point reads, the store holds the data, the
//! [`Converter`] maps documents to [`Record`]s, and the transaction and
//! batch executors apply writes.
//!
//! Entity lifecycle:
//!
//! ```text
//! nonexistent ──create──▶ active ──delete(soft)──▶ soft-deleted
//!      ▲                   │  ▲                        │
//!      │                   │  └────────restore─────────┤
//!      └──delete(hard)─────┘                           │
//!      └───────────────delete(force)───────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use repo_kit::{CreateOptions, Entity, Repository, RepositoryConfig, UpdateOptions};
//! use repo_kit::store::MemoryStore;
//! use serde::{Deserialize, Serialize};
//! use serde_json::json;
//!
//! #[derive(Clone, Debug, Serialize, Deserialize)]
//! struct Product {
//!     name: String,
//!     sku: String,
//! }
//!
//! impl Entity for Product {
//!     fn collection() -> &'static str {
//!         "products"
//!     }
//! }
//!
//! # async fn run() -> repo_kit::Result<()> {
//! let repo: Repository<Product, MemoryStore> =
//!     Repository::new(MemoryStore::new(), RepositoryConfig::new("products"))?;
//!
//! let widget = repo
//!     .create(
//!         Product { name: "Widget".into(), sku: "W1".into() },
//!         CreateOptions::default().with_id("w1"),
//!     )
//!     .await?;
//! assert_eq!(widget.version, Some(1));
//!
//! let renamed = repo
//!     .update("w1", &json!({"name": "Gadget"}), UpdateOptions::default())
//!     .await?;
//! assert_eq!(renamed.version, Some(2));
//! # Ok(())
//! # }
//! ```

mod bulk;
mod options;
mod tenant;
mod tx;

pub use options::{CreateOptions, DeleteOptions, QueryOptions, ReadOptions, UpdateOptions};
pub use tenant::TenantRepository;
pub use tx::RepositoryTransaction;

use crate::batch::BatchExecutor;
use crate::cache::{EntityCache, SweeperHandle};
use crate::config::RepositoryConfig;
use crate::convert::Converter;
use crate::document::{resolve_server_timestamps, Document, Value};
use crate::entity::{
    Entity, Record, CREATED_AT_FIELD, DELETED_AT_FIELD, IS_DELETED_FIELD, RESERVED_FIELDS,
    UPDATED_AT_FIELD, VERSION_FIELD,
};
use crate::error::{Error, Result};
use crate::key::KeyBuilder;
use crate::observability::{NoOpMetrics, RepositoryMetrics, RepositoryStats, StatsCounters};
use crate::pagination::Page;
use crate::query::{Filter, Query};
use crate::resilience::{ResilienceQueue, Submission};
use crate::store::{CommitResult, DocumentStore, Snapshot, StoreError, Write};
use crate::strategy::CacheStrategy;
use crate::transaction::TransactionExecutor;
use crate::validate::Validator;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Instant;

struct Inner<T, S> {
    store: Arc<S>,
    config: RepositoryConfig,
    cache: Arc<EntityCache>,
    _sweeper: Option<SweeperHandle>,
    converter: Converter<T>,
    validator: Validator,
    transactions: TransactionExecutor<S>,
    batches: BatchExecutor<S>,
    stats: StatsCounters,
    metrics: Box<dyn RepositoryMetrics>,
    resilience: Option<ResilienceQueue>,
}

/// Repository over one collection. Cheap to clone; clones share the cache,
/// counters and store handle.
pub struct Repository<T, S> {
    inner: Arc<Inner<T, S>>,
}

impl<T, S> Clone for Repository<T, S> {
    fn clone(&self) -> Self {
        Repository {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Builder for [`Repository`] with optional metrics and resilience queue.
pub struct RepositoryBuilder<T, S> {
    store: Arc<S>,
    config: RepositoryConfig,
    metrics: Box<dyn RepositoryMetrics>,
    resilience: Option<ResilienceQueue>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity, S: DocumentStore> RepositoryBuilder<T, S> {
    /// Set custom metrics handler.
    pub fn with_metrics(mut self, metrics: Box<dyn RepositoryMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Attach a resilience queue for best-effort writes.
    pub fn with_resilience(mut self, queue: ResilienceQueue) -> Self {
        self.resilience = Some(queue);
        self
    }

    /// Validate the configuration and start the cache sweeper (when a tokio
    /// runtime is available).
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an invalid configuration.
    pub fn build(self) -> Result<Repository<T, S>> {
        self.config.validate()?;

        let config = self.config;
        let collection = config.collection.clone();
        let cache = Arc::new(EntityCache::new(config.cache.clone()));
        let sweeper = cache.spawn_sweeper();
        let validator =
            Validator::new(collection.clone()).with_max_id_len(self.store.max_id_len());

        info!(
            "✓ Repository for {} ready (soft_delete={}, versioning={}, cache={})",
            collection,
            config.soft_delete,
            config.versioning,
            if config.cache.enabled { "on" } else { "off" }
        );

        Ok(Repository {
            inner: Arc::new(Inner {
                converter: Converter::new(collection.clone(), &config.timestamp_fields),
                transactions: TransactionExecutor::new(
                    Arc::clone(&self.store),
                    collection.clone(),
                    config.transaction.clone(),
                ),
                batches: BatchExecutor::new(
                    Arc::clone(&self.store),
                    collection,
                    config.batch.chunk_size,
                ),
                store: self.store,
                config,
                cache,
                _sweeper: sweeper,
                validator,
                stats: StatsCounters::default(),
                metrics: self.metrics,
                resilience: self.resilience,
            }),
        })
    }
}

/// Metadata changes to apply to a stored document, plus the merged result.
pub(crate) struct PreparedUpdate {
    pub(crate) changes: Document,
    pub(crate) merged: Document,
}

impl<T: Entity, S: DocumentStore> Repository<T, S> {
    /// Create a repository with default metrics and no resilience queue.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an invalid configuration.
    pub fn new(store: S, config: RepositoryConfig) -> Result<Self> {
        Self::builder(store, config).build()
    }

    /// Repository for `T::collection()` with default settings.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the collection name is invalid.
    pub fn for_entity(store: S) -> Result<Self> {
        Self::new(store, RepositoryConfig::new(T::collection()))
    }

    pub fn builder(store: S, config: RepositoryConfig) -> RepositoryBuilder<T, S> {
        Self::builder_shared(Arc::new(store), config)
    }

    /// Builder over a store handle shared with other repositories.
    pub fn builder_shared(store: Arc<S>, config: RepositoryConfig) -> RepositoryBuilder<T, S> {
        RepositoryBuilder {
            store,
            config,
            metrics: Box::new(NoOpMetrics),
            resilience: None,
            _entity: PhantomData,
        }
    }

    pub fn collection(&self) -> &str {
        &self.inner.config.collection
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &S {
        &self.inner.store
    }

    pub fn cache(&self) -> &EntityCache {
        &self.inner.cache
    }

    pub fn resilience(&self) -> Option<&ResilienceQueue> {
        self.inner.resilience.as_ref()
    }

    /// Snapshot of the operation counters.
    pub fn get_stats(&self) -> RepositoryStats {
        self.inner.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.inner.stats.reset();
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Point read.
    ///
    /// Soft-deleted entities are reported as absent unless
    /// `opts.include_deleted` is set.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidId`
    /// - `Error::NotFound` when absent and `opts.throw_if_not_found` is set
    /// - `Error::Store` / `Error::Conversion`
    pub async fn find_by_id(&self, id: &str, opts: ReadOptions) -> Result<Option<Record<T>>> {
        let result = self.load(id, &opts).await.and_then(|snapshot| {
            snapshot
                .map(|s| self.inner.converter.from_storage(&s))
                .transpose()
        });
        let result = match result {
            Ok(None) if opts.throw_if_not_found => Err(Error::not_found(self.collection(), id)),
            other => other,
        };
        self.observe(result)
    }

    /// Point read that fails with `Error::NotFound` when absent.
    ///
    /// # Errors
    ///
    /// See [`Self::find_by_id`].
    pub async fn get(&self, id: &str) -> Result<Record<T>> {
        let opts = ReadOptions::default().with_throw_if_not_found(true);
        self.find_by_id(id, opts)
            .await?
            .ok_or_else(|| Error::not_found(self.collection(), id))
    }

    /// Whether an active entity with this id exists.
    ///
    /// # Errors
    ///
    /// See [`Self::find_by_id`].
    pub async fn exists(&self, id: &str) -> Result<bool> {
        Ok(self.find_by_id(id, ReadOptions::default()).await?.is_some())
    }

    /// Load a snapshot according to the read options, applying the
    /// soft-delete visibility rule.
    pub(crate) async fn load(&self, id: &str, opts: &ReadOptions) -> Result<Option<Snapshot>> {
        self.inner.validator.validate_id(id)?;
        let key = self.cache_key(id);
        let cache = &self.inner.cache;

        if opts.strategy == CacheStrategy::Invalidate {
            cache.delete(&key);
        }

        let cached = if cache.is_enabled() && opts.strategy.reads_cache() {
            let hit = cache.get(&key);
            if hit.is_some() {
                self.inner.stats.cache_hit();
                self.inner.metrics.record_cache_hit(&key);
            } else {
                self.inner.stats.cache_miss();
                self.inner.metrics.record_cache_miss(&key);
            }
            hit
        } else {
            None
        };

        let snapshot = match cached {
            Some(snapshot) => Some(snapshot),
            None if opts.strategy.reads_store() => {
                let snapshot = self.read_snapshot(id).await?;
                if let Some(s) = &snapshot {
                    cache.set(&key, s);
                }
                snapshot
            }
            None => None,
        };

        Ok(snapshot.filter(|s| opts.include_deleted || !is_deleted(&s.data)))
    }

    /// Filtered query.
    ///
    /// Soft-deleted entities are excluded unless `opts.include_deleted` is
    /// set. Results are cached individually when there are at most
    /// `find_cache_threshold` of them.
    ///
    /// # Errors
    ///
    /// `Error::Store` (including an unknown `start_after` cursor) or
    /// `Error::Conversion`.
    pub async fn find(&self, filters: Vec<Filter>, opts: QueryOptions) -> Result<Vec<Record<T>>> {
        let result = self.find_inner(filters, opts).await;
        self.observe(result)
    }

    async fn find_inner(&self, filters: Vec<Filter>, opts: QueryOptions) -> Result<Vec<Record<T>>> {
        let mut query = self.base_query(filters, opts.include_deleted);
        query.order_by = opts.order_by;
        query.start_after = opts.start_after;

        let snapshots = self.query_window(query, opts.offset, opts.limit).await?;
        self.cache_results(&snapshots);
        self.to_records(&snapshots)
    }

    /// Count entities matching `filters`, excluding soft-deleted ones.
    ///
    /// Uses the store's count aggregate when it has one, otherwise counts
    /// materialized results.
    ///
    /// # Errors
    ///
    /// `Error::Store`.
    pub async fn count(&self, filters: Vec<Filter>) -> Result<u64> {
        let query = self.base_query(filters, false);
        let result = self.count_query(&query).await;
        self.observe(result)
    }

    /// Page `page` (1-based) of `page_size` entities matching `filters`.
    ///
    /// # Errors
    ///
    /// `Error::InvalidQuery` when `page` or `page_size` is zero, otherwise
    /// as [`Self::find`].
    pub async fn paginate(
        &self,
        filters: Vec<Filter>,
        page: u64,
        page_size: u64,
    ) -> Result<Page<Record<T>>> {
        self.paginate_with(filters, page, page_size, QueryOptions::default())
            .await
    }

    /// [`Self::paginate`] honouring `opts.order_by` and
    /// `opts.include_deleted`; limit, offset and cursor are derived from the
    /// page.
    ///
    /// # Errors
    ///
    /// See [`Self::paginate`].
    pub async fn paginate_with(
        &self,
        filters: Vec<Filter>,
        page: u64,
        page_size: u64,
        opts: QueryOptions,
    ) -> Result<Page<Record<T>>> {
        let result = self.paginate_inner(filters, page, page_size, opts).await;
        self.observe(result)
    }

    async fn paginate_inner(
        &self,
        filters: Vec<Filter>,
        page: u64,
        page_size: u64,
        opts: QueryOptions,
    ) -> Result<Page<Record<T>>> {
        if page == 0 || page_size == 0 {
            return Err(Error::InvalidQuery {
                collection: self.collection().to_string(),
                reason: format!(
                    "page and page size must be at least 1 (got page {}, size {})",
                    page, page_size
                ),
            });
        }

        let mut query = self.base_query(filters, opts.include_deleted);
        query.order_by = opts.order_by;
        let offset = Page::<()>::offset(page, page_size) as usize;

        let (total, snapshots) = futures::try_join!(
            self.count_query(&query),
            self.query_window(query.clone(), Some(offset), Some(page_size as usize)),
        )?;

        self.cache_results(&snapshots);
        let items = self.to_records(&snapshots)?;
        Ok(Page::new(items, total, page, page_size))
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Create an entity.
    ///
    /// Stamps `createdAt = updatedAt = now`, `isDeleted = false` and, with
    /// versioning, `version = initial_version ?? 1`.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidId` for a malformed custom id
    /// - `Error::MissingField` listing every absent required field
    /// - `Error::DuplicateId` when the custom id already exists
    /// - errors from [`Entity::validate`]
    pub async fn create(&self, data: T, opts: CreateOptions) -> Result<Record<T>> {
        let result = self.create_with_fields(data, opts, Document::new()).await;
        self.observe(result)
    }

    /// Create with extra stored fields forced onto the document.
    pub(crate) async fn create_with_fields(
        &self,
        data: T,
        opts: CreateOptions,
        forced: Document,
    ) -> Result<Record<T>> {
        let server_timestamps = opts
            .server_timestamps
            .unwrap_or(self.inner.config.server_timestamps);
        let (id, mut doc) = self.prepare_create(data, &opts, Utc::now())?;
        doc.extend(forced);
        self.inner
            .validator
            .validate_required_fields(&doc, &self.inner.config.required_fields)?;
        if server_timestamps {
            doc.insert(CREATED_AT_FIELD.to_string(), Value::ServerTimestamp);
            doc.insert(UPDATED_AT_FIELD.to_string(), Value::ServerTimestamp);
        }

        let timer = Instant::now();
        let write = Write::Create {
            collection: self.collection().to_string(),
            id: id.clone(),
            data: doc.clone(),
        };
        let commit = self
            .inner
            .store
            .commit(vec![write], Vec::new())
            .await
            .map_err(|e| match e {
                StoreError::AlreadyExists { .. } => Error::DuplicateId {
                    collection: self.collection().to_string(),
                    id: id.clone(),
                },
                e => self.store_error(Some(&id), e),
            })?;
        self.record_writes(1, timer);

        let snapshot = committed_snapshot(&id, doc, Some(&commit), 0);
        let record = self.inner.converter.from_storage(&snapshot)?;
        if opts.populate_cache {
            self.inner.cache.set(&self.cache_key(&id), &snapshot);
        }

        debug!(
            "✓ Created {} (version {:?})",
            KeyBuilder::document_path(self.collection(), &id),
            record.version
        );
        Ok(record)
    }

    /// Apply a partial update.
    ///
    /// `patch` must serialize to a JSON object. Repository-managed fields
    /// (`id`, `createdAt`, `updatedAt`, `isDeleted`, `deletedAt`, `version`)
    /// in the patch are ignored. Runs in a transaction, so concurrent
    /// updates of the same id are serialized by the store's conflict
    /// detection and retried.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound`
    /// - `Error::SoftDeleted` unless `bypass_soft_delete_check` is set
    /// - `Error::ConcurrencyConflict` on an `expected_version` mismatch or
    ///   when conflicts outlast the retry budget
    /// - `Error::TransactionTimeout`
    pub async fn update<P>(&self, id: &str, patch: &P, opts: UpdateOptions) -> Result<Record<T>>
    where
        P: Serialize + ?Sized,
    {
        let result = self.update_inner(id, patch, &opts).await;
        self.observe(result)
    }

    async fn update_inner<P>(&self, id: &str, patch: &P, opts: &UpdateOptions) -> Result<Record<T>>
    where
        P: Serialize + ?Sized,
    {
        self.inner.validator.validate_id(id)?;
        let patch = self.patch_document(id, patch)?;
        let key = self.cache_key(id);
        self.inner.cache.delete(&key);

        let timer = Instant::now();
        let collection = self.collection();
        let (merged, commit) = self
            .inner
            .transactions
            .run_with_commit(|tx| {
                let patch = &patch;
                async move {
                    let current = self.tx_read(&tx, id).await?;
                    let prepared = self.prepare_update(id, &current.data, patch, opts, Utc::now())?;
                    tx.update(collection, id, prepared.changes);
                    Ok(prepared.merged)
                }
            })
            .await
            .map_err(|e| with_conflict_id(e, id))?;
        self.record_writes(1, timer);

        let snapshot = committed_snapshot(id, merged, commit.as_ref(), 0);
        let record = self.inner.converter.from_storage(&snapshot)?;
        self.inner.cache.set(&key, &snapshot);

        debug!(
            "✓ Updated {} (version {:?})",
            KeyBuilder::document_path(collection, id),
            record.version
        );
        Ok(record)
    }

    /// Delete an entity.
    ///
    /// A soft delete sets `isDeleted`, `deletedAt` and `updatedAt` and bumps
    /// the version; a hard delete (`soft_delete: Some(false)`, the
    /// repository default when soft deletes are off, or `force`) removes the
    /// document.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound`
    /// - `Error::AlreadyDeleted` when already soft-deleted and `force` is
    ///   not set
    pub async fn delete(&self, id: &str, opts: DeleteOptions) -> Result<()> {
        let result = self.delete_inner(id, &opts).await;
        self.observe(result)
    }

    async fn delete_inner(&self, id: &str, opts: &DeleteOptions) -> Result<()> {
        self.inner.validator.validate_id(id)?;
        let timer = Instant::now();
        let collection = self.collection();

        let hard = self
            .inner
            .transactions
            .run(|tx| async move {
                let current = self.tx_read(&tx, id).await?;
                match self.prepare_delete(id, &current.data, opts, Utc::now())? {
                    Some(changes) => {
                        tx.update(collection, id, changes);
                        Ok(false)
                    }
                    None => {
                        tx.delete(collection, id);
                        Ok(true)
                    }
                }
            })
            .await
            .map_err(|e| with_conflict_id(e, id))?;
        self.record_writes(1, timer);
        self.inner.cache.delete(&self.cache_key(id));

        debug!(
            "✓ {} {}",
            if hard { "Hard-deleted" } else { "Soft-deleted" },
            KeyBuilder::document_path(collection, id)
        );
        Ok(())
    }

    /// Bring a soft-deleted entity back to the active state.
    ///
    /// Restoring an active entity returns it unchanged.
    ///
    /// # Errors
    ///
    /// `Error::NotFound` when the document does not exist.
    pub async fn restore(&self, id: &str) -> Result<Record<T>> {
        let result = self.restore_inner(id).await;
        self.observe(result)
    }

    async fn restore_inner(&self, id: &str) -> Result<Record<T>> {
        self.inner.validator.validate_id(id)?;
        let key = self.cache_key(id);
        self.inner.cache.delete(&key);

        let timer = Instant::now();
        let collection = self.collection();
        let (outcome, commit) = self
            .inner
            .transactions
            .run_with_commit(|tx| async move {
                let current = self.tx_read(&tx, id).await?;
                if !is_deleted(&current.data) {
                    return Ok(Err(current));
                }

                let now = Utc::now();
                let mut changes = Document::new();
                changes.insert(IS_DELETED_FIELD.to_string(), Value::Bool(false));
                changes.insert(DELETED_AT_FIELD.to_string(), Value::Null);
                changes.insert(UPDATED_AT_FIELD.to_string(), Value::Timestamp(now));
                if let Some(version) = self.next_version(&current.data, true) {
                    changes.insert(VERSION_FIELD.to_string(), version);
                }

                let mut merged = current.data;
                merged.extend(changes.clone());
                tx.update(collection, id, changes);
                Ok(Ok(merged))
            })
            .await
            .map_err(|e| with_conflict_id(e, id))?;

        let snapshot = match outcome {
            Ok(merged) => {
                self.record_writes(1, timer);
                info!("Restored {}", KeyBuilder::document_path(collection, id));
                committed_snapshot(id, merged, commit.as_ref(), 0)
            }
            Err(current) => current,
        };
        self.inner.cache.set(&key, &snapshot);
        self.inner.converter.from_storage(&snapshot)
    }

    /// Run `f` inside a transaction bound to this repository.
    ///
    /// `f` may run several times when the store reports conflicts. Cache
    /// entries for every id the transaction touched are evicted afterwards.
    ///
    /// # Errors
    ///
    /// Errors returned by `f`, `Error::ConcurrencyConflict` after the
    /// retry budget, or `Error::TransactionTimeout`.
    pub async fn run_transaction<R, F, Fut>(&self, mut f: F) -> Result<R>
    where
        F: FnMut(RepositoryTransaction<T, S>) -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let touched: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let timer = Instant::now();

        let result = self
            .inner
            .transactions
            .run_with_commit(|tx| {
                f(RepositoryTransaction::new(
                    self.clone(),
                    tx,
                    Arc::clone(&touched),
                ))
            })
            .await;

        for id in touched.lock().drain() {
            self.inner.cache.delete(&self.cache_key(&id));
        }

        let result = result.map_err(|e| self.duplicate_id(e)).map(|(value, commit)| {
            let writes = commit.map_or(0, |c| c.write_results.len());
            if writes > 0 {
                self.record_writes(writes as u64, timer);
            }
            value
        });
        self.observe(result)
    }

    /// Queue an update through the resilience queue.
    ///
    /// Priority 1 runs immediately and reports failure; other priorities may
    /// be deferred and, after exhausting their retries, dropped with only a
    /// log line and a dead-letter record. Use only for writes that may be
    /// lost.
    ///
    /// # Errors
    ///
    /// `Error::Config` when no resilience queue is attached; otherwise the
    /// update's own error for priority 1, or when the queue's retry budget
    /// is a single attempt.
    pub async fn update_best_effort(
        &self,
        id: &str,
        patch: serde_json::Value,
        priority: u8,
    ) -> Result<Submission> {
        let queue = self.inner.resilience.clone().ok_or_else(|| {
            Error::Config(format!(
                "no resilience queue configured for {}",
                self.collection()
            ))
        })?;

        let name = format!("update {}", KeyBuilder::document_path(self.collection(), id));
        let repo = self.clone();
        let id = id.to_string();
        queue
            .submit(&name, priority, move || {
                let repo = repo.clone();
                let id = id.clone();
                let patch = patch.clone();
                async move {
                    repo.update(&id, &patch, UpdateOptions::default())
                        .await
                        .map(|_| ())
                }
            })
            .await
    }

    // ------------------------------------------------------------------
    // Shared building blocks
    // ------------------------------------------------------------------

    pub(crate) fn cache_key(&self, id: &str) -> String {
        KeyBuilder::cache_key(self.collection(), id)
    }

    pub(crate) fn converter(&self) -> &Converter<T> {
        &self.inner.converter
    }

    pub(crate) fn validator(&self) -> &Validator {
        &self.inner.validator
    }

    pub(crate) fn batches(&self) -> &BatchExecutor<S> {
        &self.inner.batches
    }

    pub(crate) fn store_error(&self, id: Option<&str>, e: StoreError) -> Error {
        Error::store(self.collection(), id, e)
    }

    /// Count errors and report them to the metrics hook.
    pub(crate) fn observe<R>(&self, result: Result<R>) -> Result<R> {
        if let Err(e) = &result {
            self.record_error(&e.to_string());
        }
        result
    }

    /// Report a transactional create that hit an existing document of this
    /// collection as `DuplicateId`.
    fn duplicate_id(&self, e: Error) -> Error {
        if let Error::Store {
            source: StoreError::AlreadyExists { path },
            ..
        } = &e
        {
            if let Some((collection, id)) = KeyBuilder::parse_document_path(path) {
                if collection == self.collection() {
                    return Error::DuplicateId {
                        collection: collection.to_string(),
                        id: id.to_string(),
                    };
                }
            }
        }
        e
    }

    pub(crate) fn record_error(&self, message: &str) {
        self.inner.stats.error();
        self.inner.metrics.record_error(self.collection(), message);
    }

    pub(crate) fn record_writes(&self, n: u64, timer: Instant) {
        self.inner.stats.writes(n);
        self.inner.metrics.record_write(self.collection(), timer.elapsed());
    }

    fn record_read(&self, timer: Instant) {
        self.inner.stats.read();
        self.inner.metrics.record_read(self.collection(), timer.elapsed());
    }

    pub(crate) async fn read_snapshot(&self, id: &str) -> Result<Option<Snapshot>> {
        let timer = Instant::now();
        let snapshot = self
            .inner
            .store
            .get(self.collection(), id)
            .await
            .map_err(|e| self.store_error(Some(id), e))?;
        self.record_read(timer);
        Ok(snapshot)
    }

    /// Transactional read that fails with `NotFound` when absent.
    pub(crate) async fn tx_read(
        &self,
        tx: &crate::transaction::Transaction<S>,
        id: &str,
    ) -> Result<Snapshot> {
        let timer = Instant::now();
        let snapshot = tx
            .get(self.collection(), id)
            .await
            .map_err(|e| self.store_error(Some(id), e))?;
        self.record_read(timer);
        snapshot.ok_or_else(|| Error::not_found(self.collection(), id))
    }

    /// Query with the soft-delete filter applied unless deleted entities
    /// are requested.
    pub(crate) fn base_query(&self, filters: Vec<Filter>, include_deleted: bool) -> Query {
        let mut query = Query::with_filters(filters);
        if self.inner.config.soft_delete && !include_deleted {
            query = query.filter(Filter::eq(IS_DELETED_FIELD, false));
        }
        query
    }

    /// Run `query` restricted to `offset`/`limit`.
    ///
    /// Stores without native offset get `limit + offset` rows and the first
    /// `offset` are dropped here. That costs O(offset) rows per call, so deep
    /// pages get linearly slower on such stores.
    pub(crate) async fn query_window(
        &self,
        mut query: Query,
        offset: Option<usize>,
        limit: Option<usize>,
    ) -> Result<Vec<Snapshot>> {
        let timer = Instant::now();
        let native = self.inner.store.supports_offset();
        let skip = offset.unwrap_or(0);

        if native {
            query.offset = offset;
            query.limit = limit;
        } else {
            query.offset = None;
            query.limit = limit.map(|l| l.saturating_add(skip));
            if skip > 0 {
                debug!(
                    "Client-side offset on {}: fetching {} extra rows",
                    self.collection(),
                    skip
                );
            }
        }

        let mut snapshots = self
            .inner
            .store
            .query(self.collection(), &query)
            .await
            .map_err(|e| self.store_error(None, e))?;
        self.record_read(timer);

        if !native {
            snapshots.drain(..skip.min(snapshots.len()));
        }
        Ok(snapshots)
    }

    pub(crate) async fn count_query(&self, query: &Query) -> Result<u64> {
        let timer = Instant::now();
        let native = self
            .inner
            .store
            .count(self.collection(), query)
            .await
            .map_err(|e| self.store_error(None, e))?;

        let total = match native {
            Some(total) => total,
            None => {
                debug!(
                    "No native count on {}, counting materialized results",
                    self.collection()
                );
                let mut all = query.clone();
                all.limit = None;
                all.offset = None;
                self.inner
                    .store
                    .query(self.collection(), &all)
                    .await
                    .map_err(|e| self.store_error(None, e))?
                    .len() as u64
            }
        };
        self.record_read(timer);
        Ok(total)
    }

    fn cache_results(&self, snapshots: &[Snapshot]) {
        let cache = &self.inner.cache;
        if !cache.is_enabled() || snapshots.len() > self.inner.config.find_cache_threshold {
            return;
        }
        for snapshot in snapshots {
            cache.set(&self.cache_key(&snapshot.id), snapshot);
        }
    }

    fn to_records(&self, snapshots: &[Snapshot]) -> Result<Vec<Record<T>>> {
        snapshots
            .iter()
            .map(|s| self.inner.converter.from_storage(s))
            .collect()
    }

    /// Turn a serializable patch into stored fields, minus reserved keys.
    pub(crate) fn patch_document<P>(&self, id: &str, patch: &P) -> Result<Document>
    where
        P: Serialize + ?Sized,
    {
        let json = serde_json::to_value(patch).map_err(|e| Error::Conversion {
            collection: self.collection().to_string(),
            id: Some(id.to_string()),
            message: e.to_string(),
        })?;
        let mut doc = self.inner.converter.patch_to_storage(id, json)?;
        for field in RESERVED_FIELDS {
            if doc.remove(field).is_some() {
                debug!("Ignoring reserved field {} in update of {}", field, id);
            }
        }
        Ok(doc)
    }

    /// Build the document for a new entity. Returns the id and document.
    pub(crate) fn prepare_create(
        &self,
        data: T,
        opts: &CreateOptions,
        now: DateTime<Utc>,
    ) -> Result<(String, Document)> {
        data.validate()?;
        let id = match &opts.id {
            Some(id) => {
                self.inner.validator.validate_id(id)?;
                id.clone()
            }
            None => self.inner.store.generate_id(),
        };

        let record = Record {
            id,
            created_at: now,
            updated_at: now,
            is_deleted: false,
            deleted_at: None,
            version: self
                .inner
                .config
                .versioning
                .then(|| opts.initial_version.unwrap_or(1)),
            data,
        };
        let doc = self.inner.converter.to_storage(&record)?;
        Ok((record.id, doc))
    }

    /// Validate an update against the stored document and compute the
    /// changes to write.
    pub(crate) fn prepare_update(
        &self,
        id: &str,
        current: &Document,
        patch: &Document,
        opts: &UpdateOptions,
        now: DateTime<Utc>,
    ) -> Result<PreparedUpdate> {
        if is_deleted(current) && !opts.bypass_soft_delete_check {
            return Err(Error::SoftDeleted {
                collection: self.collection().to_string(),
                id: id.to_string(),
            });
        }

        if let Some(expected) = opts.expected_version {
            let found = stored_version(current);
            if found != Some(expected) {
                return Err(Error::ConcurrencyConflict {
                    collection: self.collection().to_string(),
                    id: Some(id.to_string()),
                    detail: format!("expected version {}, found {:?}", expected, found),
                });
            }
        }

        let mut changes = patch.clone();
        changes.insert(UPDATED_AT_FIELD.to_string(), Value::Timestamp(now));
        if let Some(version) = self.next_version(current, opts.increment_version) {
            changes.insert(VERSION_FIELD.to_string(), version);
        }

        let mut merged = current.clone();
        merged.extend(changes.clone());
        Ok(PreparedUpdate { changes, merged })
    }

    /// Changes for a soft delete, or `None` when the document should be
    /// removed outright.
    pub(crate) fn prepare_delete(
        &self,
        id: &str,
        current: &Document,
        opts: &DeleteOptions,
        now: DateTime<Utc>,
    ) -> Result<Option<Document>> {
        if is_deleted(current) && !opts.force {
            return Err(Error::AlreadyDeleted {
                collection: self.collection().to_string(),
                id: id.to_string(),
            });
        }

        let soft = opts.soft_delete.unwrap_or(self.inner.config.soft_delete);
        if opts.force || !soft {
            return Ok(None);
        }

        let mut changes = Document::new();
        changes.insert(IS_DELETED_FIELD.to_string(), Value::Bool(true));
        changes.insert(DELETED_AT_FIELD.to_string(), Value::Timestamp(now));
        changes.insert(UPDATED_AT_FIELD.to_string(), Value::Timestamp(now));
        if let Some(version) = self.next_version(current, true) {
            changes.insert(VERSION_FIELD.to_string(), version);
        }
        Ok(Some(changes))
    }

    fn next_version(&self, current: &Document, increment: bool) -> Option<Value> {
        if !self.inner.config.versioning || !increment {
            return None;
        }
        let version = stored_version(current).unwrap_or(0) + 1;
        Some(Value::Integer(version as i64))
    }
}

pub(crate) fn is_deleted(doc: &Document) -> bool {
    doc.get(IS_DELETED_FIELD)
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

fn stored_version(doc: &Document) -> Option<u64> {
    doc.get(VERSION_FIELD)
        .and_then(Value::as_i64)
        .and_then(|v| u64::try_from(v).ok())
}

/// Snapshot of a document as written by `commit`, with server timestamps
/// resolved to the commit time.
pub(crate) fn committed_snapshot(
    id: &str,
    mut data: Document,
    commit: Option<&CommitResult>,
    index: usize,
) -> Snapshot {
    let (revision, update_time) = match commit {
        Some(c) => (
            c.write_results
                .get(index)
                .and_then(|w| w.revision)
                .unwrap_or_default(),
            c.commit_time,
        ),
        None => (0, Utc::now()),
    };
    resolve_server_timestamps(&mut data, update_time);
    Snapshot {
        id: id.to_string(),
        data,
        revision,
        update_time,
    }
}

/// Attach the entity id to a conflict raised by the transaction executor.
fn with_conflict_id(e: Error, id: &str) -> Error {
    match e {
        Error::ConcurrencyConflict {
            collection,
            id: None,
            detail,
        } => Error::ConcurrencyConflict {
            collection,
            id: Some(id.to_string()),
            detail,
        },
        other => other,
    }
}
