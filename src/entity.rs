//! Entity trait and the metadata envelope every stored entity carries.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::ops::{Deref, DerefMut};

/// Field names owned by the repository. Update patches never overwrite them.
pub const ID_FIELD: &str = "id";
pub const CREATED_AT_FIELD: &str = "createdAt";
pub const UPDATED_AT_FIELD: &str = "updatedAt";
pub const IS_DELETED_FIELD: &str = "isDeleted";
pub const DELETED_AT_FIELD: &str = "deletedAt";
pub const VERSION_FIELD: &str = "version";

/// Metadata keys an update patch may not touch (`updatedAt` is stamped by
/// the repository instead).
pub const RESERVED_FIELDS: [&str; 6] = [
    ID_FIELD,
    CREATED_AT_FIELD,
    UPDATED_AT_FIELD,
    IS_DELETED_FIELD,
    DELETED_AT_FIELD,
    VERSION_FIELD,
];

/// Trait for entity payloads managed by a [`crate::Repository`].
///
/// The payload holds only business fields; `id`, timestamps, soft-delete
/// flags and the version counter live in the surrounding [`Record`].
///
/// # Example
///
/// ```
/// use serde::{Deserialize, Serialize};
/// use repo_kit::Entity;
///
/// #[derive(Clone, Debug, Serialize, Deserialize)]
/// pub struct Product {
///     pub name: String,
///     pub sku: String,
/// }
///
/// impl Entity for Product {
///     fn collection() -> &'static str {
///         "products"
///     }
/// }
/// ```
///
/// Payload field names must not collide with the metadata fields, and the
/// payload must not use `#[serde(deny_unknown_fields)]` (it is flattened into
/// the record).
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Default collection name for this entity type.
    fn collection() -> &'static str;

    /// Optional: business validation run before every create.
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

/// An entity together with its repository-managed metadata.
///
/// Serializes flat, e.g.
/// `{"id":"w1","createdAt":..,"updatedAt":..,"isDeleted":false,"version":1,"name":"Widget"}`.
/// Derefs to the payload so business fields read naturally (`record.name`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record<T> {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    /// Present iff versioning is enabled for the collection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(flatten)]
    pub data: T,
}

impl<T> Record<T> {
    pub fn is_active(&self) -> bool {
        !self.is_deleted
    }

    pub fn into_data(self) -> T {
        self.data
    }
}

impl<T> Deref for Record<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.data
    }
}

impl<T> DerefMut for Record<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
    struct Product {
        name: String,
        sku: String,
    }

    impl Entity for Product {
        fn collection() -> &'static str {
            "products"
        }
    }

    #[test]
    fn test_record_serializes_flat() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let record = Record {
            id: "w1".to_string(),
            created_at: ts,
            updated_at: ts,
            is_deleted: false,
            deleted_at: None,
            version: Some(1),
            data: Product {
                name: "Widget".to_string(),
                sku: "W1".to_string(),
            },
        };

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(
            value,
            json!({
                "id": "w1",
                "createdAt": "2024-05-01T12:00:00Z",
                "updatedAt": "2024-05-01T12:00:00Z",
                "isDeleted": false,
                "version": 1,
                "name": "Widget",
                "sku": "W1"
            })
        );
        assert_eq!(record.name, "Widget");
        assert_eq!(Product::collection(), "products");
    }

    #[test]
    fn test_record_defaults_for_missing_metadata() {
        let record: Record<Product> = serde_json::from_value(json!({
            "id": "w1",
            "createdAt": "2024-05-01T12:00:00Z",
            "updatedAt": "2024-05-01T12:00:00Z",
            "name": "Widget",
            "sku": "W1"
        }))
        .unwrap();

        assert!(record.is_active());
        assert_eq!(record.deleted_at, None);
        assert_eq!(record.version, None);
    }
}
