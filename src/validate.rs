//! Id and required-field validation.

use crate::document::{get_path, Document};
use crate::error::{Error, Result};

/// Default store key length limit in bytes.
pub const MAX_ID_BYTES: usize = 1500;

/// Validates ids and required fields for one collection.
#[derive(Clone, Debug)]
pub struct Validator {
    collection: String,
    max_id_len: usize,
}

impl Validator {
    pub fn new(collection: impl Into<String>) -> Self {
        Validator {
            collection: collection.into(),
            max_id_len: MAX_ID_BYTES,
        }
    }

    pub fn with_max_id_len(mut self, max_id_len: usize) -> Self {
        self.max_id_len = max_id_len;
        self
    }

    /// Reject empty ids, ids with path separators, the reserved `.`/`..`
    /// names, and ids longer than the store's key limit.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidId`.
    pub fn validate_id(&self, id: &str) -> Result<()> {
        let reason = if id.is_empty() {
            Some("id must not be empty".to_string())
        } else if id.contains('/') || id.contains('\\') {
            Some("id must not contain path separators".to_string())
        } else if id == "." || id == ".." {
            Some("id must not be '.' or '..'".to_string())
        } else if id.len() > self.max_id_len {
            Some(format!(
                "id is {} bytes, limit is {}",
                id.len(),
                self.max_id_len
            ))
        } else {
            None
        };

        match reason {
            Some(reason) => Err(Error::InvalidId {
                id: id.to_string(),
                reason,
            }),
            None => Ok(()),
        }
    }

    /// Fail with every required field that is absent or null.
    ///
    /// # Errors
    ///
    /// Returns `Error::MissingField` listing all missing fields in the order
    /// they were declared.
    pub fn validate_required_fields(&self, doc: &Document, required: &[String]) -> Result<()> {
        let missing: Vec<String> = required
            .iter()
            .filter(|field| get_path(doc, field).map_or(true, |v| v.is_null()))
            .cloned()
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::MissingField {
                collection: self.collection.clone(),
                fields: missing,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::document_from_json;
    use serde_json::json;

    #[test]
    fn test_valid_ids() {
        let v = Validator::new("products");
        assert!(v.validate_id("w1").is_ok());
        assert!(v.validate_id("sku:42").is_ok());
    }

    #[test]
    fn test_invalid_ids() {
        let v = Validator::new("products").with_max_id_len(8);
        for id in ["", "a/b", "a\\b", ".", "..", "123456789"] {
            assert!(
                matches!(v.validate_id(id), Err(Error::InvalidId { .. })),
                "id {:?} should be rejected",
                id
            );
        }
    }

    #[test]
    fn test_missing_fields_reports_all() {
        let v = Validator::new("products");
        let doc = document_from_json(json!({"name": "Widget", "sku": null})).unwrap();
        let required = vec!["name".to_string(), "sku".to_string(), "price".to_string()];

        match v.validate_required_fields(&doc, &required) {
            Err(Error::MissingField { collection, fields }) => {
                assert_eq!(collection, "products");
                assert_eq!(fields, vec!["sku", "price"]);
            }
            other => panic!("expected MissingField, got {:?}", other),
        }
    }

    #[test]
    fn test_required_fields_present() {
        let v = Validator::new("products");
        let doc = document_from_json(json!({"name": "Widget", "sku": "W1"})).unwrap();
        assert!(v
            .validate_required_fields(&doc, &["name".to_string(), "sku".to_string()])
            .is_ok());
    }
}
