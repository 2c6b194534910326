//! Tenant-scoped repository.
//!
//! Every operation is restricted to documents whose tenant field (by
//! default `organizationId`) equals the caller's tenant. A document owned by
//! another tenant is indistinguishable from a missing one.

use super::{CreateOptions, DeleteOptions, QueryOptions, ReadOptions, Repository, UpdateOptions};
use crate::document::{Document, Value};
use crate::entity::{Entity, Record};
use crate::error::{Error, Result};
use crate::observability::RepositoryStats;
use crate::pagination::Page;
use crate::query::Filter;
use crate::store::{DocumentStore, Snapshot};
use serde::Serialize;

/// Repository wrapper that scopes every call to one tenant at a time.
pub struct TenantRepository<T, S> {
    repo: Repository<T, S>,
    tenant_field: String,
}

impl<T, S> Clone for TenantRepository<T, S> {
    fn clone(&self) -> Self {
        TenantRepository {
            repo: self.repo.clone(),
            tenant_field: self.tenant_field.clone(),
        }
    }
}

impl<T: Entity, S: DocumentStore> TenantRepository<T, S> {
    /// Wrap `repo`, using its configured tenant field.
    pub fn new(repo: Repository<T, S>) -> Self {
        let tenant_field = repo.config().tenant_field.clone();
        TenantRepository { repo, tenant_field }
    }

    pub fn collection(&self) -> &str {
        self.repo.collection()
    }

    pub fn tenant_field(&self) -> &str {
        &self.tenant_field
    }

    pub fn get_stats(&self) -> RepositoryStats {
        self.repo.get_stats()
    }

    /// Point read within `tenant`.
    ///
    /// # Errors
    ///
    /// As [`Repository::find_by_id`]; an entity owned by another tenant is
    /// reported as not found.
    pub async fn find_by_id_for_tenant(
        &self,
        tenant: &str,
        id: &str,
        opts: ReadOptions,
    ) -> Result<Option<Record<T>>> {
        let result = self.load_owned(tenant, id, &opts).await.and_then(|snapshot| {
            snapshot
                .map(|s| self.repo.converter().from_storage(&s))
                .transpose()
        });
        let result = match result {
            Ok(None) if opts.throw_if_not_found => {
                Err(Error::not_found(self.collection(), id))
            }
            other => other,
        };
        self.repo.observe(result)
    }

    /// [`Repository::find`] restricted to `tenant`.
    ///
    /// # Errors
    ///
    /// As [`Repository::find`].
    pub async fn find_for_tenant(
        &self,
        tenant: &str,
        filters: Vec<Filter>,
        opts: QueryOptions,
    ) -> Result<Vec<Record<T>>> {
        self.repo.find(self.scoped(tenant, filters), opts).await
    }

    /// [`Repository::count`] restricted to `tenant`.
    ///
    /// # Errors
    ///
    /// As [`Repository::count`].
    pub async fn count_for_tenant(&self, tenant: &str, filters: Vec<Filter>) -> Result<u64> {
        self.repo.count(self.scoped(tenant, filters)).await
    }

    /// [`Repository::paginate`] restricted to `tenant`.
    ///
    /// # Errors
    ///
    /// As [`Repository::paginate`].
    pub async fn paginate_for_tenant(
        &self,
        tenant: &str,
        filters: Vec<Filter>,
        page: u64,
        page_size: u64,
    ) -> Result<Page<Record<T>>> {
        self.repo
            .paginate(self.scoped(tenant, filters), page, page_size)
            .await
    }

    /// Create an entity owned by `tenant`. Any tenant value in `data` is
    /// overwritten.
    ///
    /// # Errors
    ///
    /// As [`Repository::create`].
    pub async fn create_for_tenant(
        &self,
        tenant: &str,
        data: T,
        opts: CreateOptions,
    ) -> Result<Record<T>> {
        let mut owner = Document::new();
        owner.insert(self.tenant_field.clone(), Value::from(tenant));
        let result = self.repo.create_with_fields(data, opts, owner).await;
        self.repo.observe(result)
    }

    /// Update an entity owned by `tenant`. The tenant field cannot be
    /// changed through a patch.
    ///
    /// # Errors
    ///
    /// As [`Repository::update`], with `NotFound` for other tenants'
    /// entities.
    pub async fn update_for_tenant<P>(
        &self,
        tenant: &str,
        id: &str,
        patch: &P,
        opts: UpdateOptions,
    ) -> Result<Record<T>>
    where
        P: Serialize + ?Sized,
    {
        self.ensure_owned(tenant, id).await?;

        let mut patch = serde_json::to_value(patch).map_err(|e| Error::Conversion {
            collection: self.collection().to_string(),
            id: Some(id.to_string()),
            message: e.to_string(),
        })?;
        if let Some(map) = patch.as_object_mut() {
            if map.remove(&self.tenant_field).is_some() {
                warn!(
                    "Ignoring {} in update of {}/{} for tenant {}",
                    self.tenant_field,
                    self.collection(),
                    id,
                    tenant
                );
            }
        }
        self.repo.update(id, &patch, opts).await
    }

    /// Delete an entity owned by `tenant`.
    ///
    /// # Errors
    ///
    /// As [`Repository::delete`], with `NotFound` for other tenants'
    /// entities.
    pub async fn delete_for_tenant(&self, tenant: &str, id: &str, opts: DeleteOptions) -> Result<()> {
        self.ensure_owned(tenant, id).await?;
        self.repo.delete(id, opts).await
    }

    /// Restore a soft-deleted entity owned by `tenant`.
    ///
    /// # Errors
    ///
    /// As [`Repository::restore`].
    pub async fn restore_for_tenant(&self, tenant: &str, id: &str) -> Result<Record<T>> {
        self.ensure_owned(tenant, id).await?;
        self.repo.restore(id).await
    }

    fn scoped(&self, tenant: &str, mut filters: Vec<Filter>) -> Vec<Filter> {
        filters.insert(0, Filter::eq(self.tenant_field.as_str(), tenant));
        filters
    }

    fn owns(&self, tenant: &str, snapshot: &Snapshot) -> bool {
        snapshot
            .data
            .get(&self.tenant_field)
            .and_then(Value::as_str)
            == Some(tenant)
    }

    async fn load_owned(
        &self,
        tenant: &str,
        id: &str,
        opts: &ReadOptions,
    ) -> Result<Option<Snapshot>> {
        let snapshot = self.repo.load(id, opts).await?;
        Ok(snapshot.filter(|s| {
            let owned = self.owns(tenant, s);
            if !owned {
                debug!(
                    "{}/{} is not visible to tenant {}",
                    self.collection(),
                    id,
                    tenant
                );
            }
            owned
        }))
    }

    /// Ownership check against committed state, soft-deleted included.
    async fn ensure_owned(&self, tenant: &str, id: &str) -> Result<()> {
        let opts = ReadOptions::default().with_include_deleted(true);
        let result = match self.load_owned(tenant, id, &opts).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(Error::not_found(self.collection(), id)),
            Err(e) => Err(e),
        };
        self.repo.observe(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepositoryConfig;
    use crate::store::MemoryStore;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Clone, Debug, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct Invoice {
        number: String,
        #[serde(default)]
        organization_id: Option<String>,
    }

    impl Entity for Invoice {
        fn collection() -> &'static str {
            "invoices"
        }
    }

    fn invoice(number: &str) -> Invoice {
        Invoice {
            number: number.to_string(),
            organization_id: None,
        }
    }

    fn tenant_repo() -> TenantRepository<Invoice, MemoryStore> {
        let repo = Repository::new(MemoryStore::new(), RepositoryConfig::new("invoices"))
            .expect("valid config");
        TenantRepository::new(repo)
    }

    #[tokio::test]
    async fn test_create_injects_tenant() {
        let repo = tenant_repo();
        let created = repo
            .create_for_tenant("acme", invoice("1"), CreateOptions::default().with_id("i1"))
            .await
            .unwrap();
        assert_eq!(created.organization_id.as_deref(), Some("acme"));
    }

    #[tokio::test]
    async fn test_other_tenant_sees_nothing() {
        let repo = tenant_repo();
        repo.create_for_tenant("acme", invoice("1"), CreateOptions::default().with_id("i1"))
            .await
            .unwrap();

        let found = repo
            .find_by_id_for_tenant("globex", "i1", ReadOptions::default())
            .await
            .unwrap();
        assert!(found.is_none());

        let err = repo
            .update_for_tenant("globex", "i1", &json!({"number": "2"}), UpdateOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));

        let err = repo
            .delete_for_tenant("globex", "i1", DeleteOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_patch_cannot_move_tenant() {
        let repo = tenant_repo();
        repo.create_for_tenant("acme", invoice("1"), CreateOptions::default().with_id("i1"))
            .await
            .unwrap();

        let updated = repo
            .update_for_tenant(
                "acme",
                "i1",
                &json!({"number": "2", "organizationId": "globex"}),
                UpdateOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(updated.number, "2");
        assert_eq!(updated.organization_id.as_deref(), Some("acme"));
    }
}
