//! Entity-level transaction handle.

use super::{is_deleted, CreateOptions, DeleteOptions, Repository, UpdateOptions};
use crate::entity::{Entity, Record};
use crate::error::Result;
use crate::store::DocumentStore;
use crate::transaction::Transaction;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

/// Transaction scoped to one repository, passed to
/// [`Repository::run_transaction`] callbacks.
///
/// Writes are buffered and applied atomically when the callback returns
/// `Ok`. Reads see committed state only, never this transaction's own
/// buffered writes. Methods that return a record return the state the
/// write will produce.
pub struct RepositoryTransaction<T, S> {
    repo: Repository<T, S>,
    tx: Transaction<S>,
    touched: Arc<Mutex<HashSet<String>>>,
}

impl<T: Entity, S: DocumentStore> RepositoryTransaction<T, S> {
    pub(crate) fn new(
        repo: Repository<T, S>,
        tx: Transaction<S>,
        touched: Arc<Mutex<HashSet<String>>>,
    ) -> Self {
        RepositoryTransaction { repo, tx, touched }
    }

    /// Transactional read. Soft-deleted entities are returned as-is; check
    /// [`Record::is_active`].
    ///
    /// # Errors
    ///
    /// `Error::InvalidId`, `Error::Store`, `Error::Conversion`.
    pub async fn get(&self, id: &str) -> Result<Option<Record<T>>> {
        self.repo.validator().validate_id(id)?;
        let snapshot = self
            .tx
            .get(self.repo.collection(), id)
            .await
            .map_err(|e| self.repo.store_error(Some(id), e))?;
        snapshot
            .map(|s| self.repo.converter().from_storage(&s))
            .transpose()
    }

    /// Buffer a create. Timestamps are taken from the client clock.
    ///
    /// The returned record has no store revision yet; the id is final.
    ///
    /// # Errors
    ///
    /// Validation errors as [`Repository::create`]. A duplicate id fails
    /// the whole transaction with `Error::DuplicateId`.
    pub fn create(&self, data: T, opts: CreateOptions) -> Result<Record<T>> {
        let now = Utc::now();
        let (id, doc) = self.repo.prepare_create(data, &opts, now)?;
        self.repo
            .validator()
            .validate_required_fields(&doc, &self.repo.config().required_fields)?;

        let record = self
            .repo
            .converter()
            .from_storage(&super::committed_snapshot(&id, doc.clone(), None, 0))?;
        self.tx.create(self.repo.collection(), &id, doc);
        self.touch(&id);
        Ok(record)
    }

    /// Read, validate and buffer a partial update.
    ///
    /// # Errors
    ///
    /// As [`Repository::update`].
    pub async fn update<P>(&self, id: &str, patch: &P, opts: UpdateOptions) -> Result<Record<T>>
    where
        P: Serialize + ?Sized,
    {
        let patch = self.repo.patch_document(id, patch)?;
        let current = self.repo.tx_read(&self.tx, id).await?;
        let prepared = self
            .repo
            .prepare_update(id, &current.data, &patch, &opts, Utc::now())?;

        self.tx.update(self.repo.collection(), id, prepared.changes);
        self.touch(id);
        let mut snapshot = current;
        snapshot.data = prepared.merged;
        self.repo.converter().from_storage(&snapshot)
    }

    /// Read and buffer a soft or hard delete.
    ///
    /// # Errors
    ///
    /// As [`Repository::delete`].
    pub async fn delete(&self, id: &str, opts: DeleteOptions) -> Result<()> {
        let current = self.repo.tx_read(&self.tx, id).await?;
        match self
            .repo
            .prepare_delete(id, &current.data, &opts, Utc::now())?
        {
            Some(changes) => self.tx.update(self.repo.collection(), id, changes),
            None => self.tx.delete(self.repo.collection(), id),
        }
        self.touch(id);
        Ok(())
    }

    /// Whether `id` exists and is not soft-deleted, as of committed state.
    ///
    /// # Errors
    ///
    /// `Error::Store`.
    pub async fn exists(&self, id: &str) -> Result<bool> {
        let snapshot = self
            .tx
            .get(self.repo.collection(), id)
            .await
            .map_err(|e| self.repo.store_error(Some(id), e))?;
        Ok(snapshot.is_some_and(|s| !is_deleted(&s.data)))
    }

    /// Number of writes buffered so far.
    pub fn pending_writes(&self) -> usize {
        self.tx.pending_writes()
    }

    fn touch(&self, id: &str) {
        self.touched.lock().insert(id.to_string());
    }
}
