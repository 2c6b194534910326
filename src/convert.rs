//! Mapping between [`Record`]s and store documents.
//!
//! `to_storage` drops the `id` (it is the document key, not a field) and
//! turns timestamp fields into native [`Value::Timestamp`]s; `from_storage`
//! does the inverse and injects the snapshot id. Every other field passes
//! through serde unchanged, so `from_storage(to_storage(r))` reproduces `r`.

use crate::document::{document_from_json, document_into_json, Document, Value};
use crate::entity::{Entity, Record, CREATED_AT_FIELD, DELETED_AT_FIELD, ID_FIELD, UPDATED_AT_FIELD};
use crate::error::{Error, Result};
use crate::store::Snapshot;
use chrono::{DateTime, Utc};
use std::marker::PhantomData;

/// Converts records of one entity type to and from store documents.
#[derive(Debug)]
pub struct Converter<T> {
    collection: String,
    timestamp_fields: Vec<String>,
    _entity: PhantomData<fn() -> T>,
}

impl<T> Clone for Converter<T> {
    fn clone(&self) -> Self {
        Converter {
            collection: self.collection.clone(),
            timestamp_fields: self.timestamp_fields.clone(),
            _entity: PhantomData,
        }
    }
}

impl<T: Entity> Converter<T> {
    /// `extra_timestamp_fields` names top-level payload fields that hold
    /// dates and should be stored as native timestamps.
    pub fn new(collection: impl Into<String>, extra_timestamp_fields: &[String]) -> Self {
        let mut timestamp_fields: Vec<String> = [CREATED_AT_FIELD, UPDATED_AT_FIELD, DELETED_AT_FIELD]
            .iter()
            .map(|f| f.to_string())
            .collect();
        for field in extra_timestamp_fields {
            if !timestamp_fields.contains(field) {
                timestamp_fields.push(field.clone());
            }
        }

        Converter {
            collection: collection.into(),
            timestamp_fields,
            _entity: PhantomData,
        }
    }

    /// Record to document.
    ///
    /// # Errors
    ///
    /// Returns `Error::Conversion` if the payload does not serialize to a
    /// JSON object.
    pub fn to_storage(&self, record: &Record<T>) -> Result<Document> {
        let json = serde_json::to_value(record)
            .map_err(|e| self.conversion_error(Some(&record.id), e.to_string()))?;
        let mut doc = document_from_json(json).ok_or_else(|| {
            self.conversion_error(Some(&record.id), "entity did not serialize to an object")
        })?;
        doc.remove(ID_FIELD);
        self.normalize_timestamps(&mut doc);
        Ok(doc)
    }

    /// Snapshot to record.
    ///
    /// # Errors
    ///
    /// Returns `Error::Conversion` when the stored fields do not match the
    /// entity's shape.
    pub fn from_storage(&self, snapshot: &Snapshot) -> Result<Record<T>> {
        let mut json = document_into_json(snapshot.data.clone());
        if let serde_json::Value::Object(map) = &mut json {
            map.insert(
                ID_FIELD.to_string(),
                serde_json::Value::String(snapshot.id.clone()),
            );
        }
        serde_json::from_value(json).map_err(|e| {
            debug!(
                "✗ Conversion of {}/{} failed: {}",
                self.collection, snapshot.id, e
            );
            self.conversion_error(Some(&snapshot.id), e.to_string())
        })
    }

    /// Convert an update patch (a JSON object) into document fields,
    /// applying the same timestamp normalization as `to_storage`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Conversion` if `patch` is not a JSON object.
    pub fn patch_to_storage(&self, id: &str, patch: serde_json::Value) -> Result<Document> {
        let mut doc = document_from_json(patch)
            .ok_or_else(|| self.conversion_error(Some(id), "update patch must be a JSON object"))?;
        self.normalize_timestamps(&mut doc);
        Ok(doc)
    }

    fn normalize_timestamps(&self, doc: &mut Document) {
        for field in &self.timestamp_fields {
            if let Some(value) = doc.get_mut(field) {
                if let Some(ts) = value.as_str().and_then(parse_timestamp) {
                    *value = Value::Timestamp(ts);
                }
            }
        }
    }

    fn conversion_error(&self, id: Option<&str>, message: impl Into<String>) -> Error {
        Error::Conversion {
            collection: self.collection.clone(),
            id: id.map(str::to_string),
            message: message.into(),
        }
    }
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}
