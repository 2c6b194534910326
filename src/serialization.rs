//! Postcard snapshot encoding with versioned envelopes.
//!
//! Cached entities are held as encoded [`Snapshot`]s rather than live
//! values, so nothing a caller does to a returned entity can leak back into
//! the cache. Every entry follows this format:
//!
//! ```text
//! ┌─────────────────┬─────────────────┬──────────────────────────┐
//! │  MAGIC (4 bytes)│VERSION (varint) │POSTCARD PAYLOAD (N bytes)│
//! └─────────────────┴─────────────────┴──────────────────────────┘
//!   "RKIT"              u32                postcard(Snapshot)
//! ```
//!
//! A magic or version mismatch is reported as an error so the cache can
//! evict the entry and fall back to the store.

use crate::error::{Error, Result};
use crate::store::Snapshot;
use serde::{Deserialize, Serialize};

/// Magic header for encoded snapshots.
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"RKIT";

/// Current snapshot schema version.
///
/// Increment when the [`Snapshot`] or [`crate::document::Value`] layout
/// changes; older entries are then rejected instead of misread.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// Versioned envelope around an encoded payload.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SnapshotEnvelope<T> {
    pub magic: [u8; 4],
    pub version: u32,
    pub payload: T,
}

impl<T> SnapshotEnvelope<T> {
    pub fn new(payload: T) -> Self {
        Self {
            magic: SNAPSHOT_MAGIC,
            version: CURRENT_SCHEMA_VERSION,
            payload,
        }
    }
}

/// Encode a snapshot for the cache.
///
/// # Errors
///
/// Returns `Error::Serialization` if postcard encoding fails.
pub fn encode_snapshot(snapshot: &Snapshot) -> Result<Vec<u8>> {
    postcard::to_allocvec(&SnapshotEnvelope::new(snapshot)).map_err(|e| {
        error!("Snapshot serialization failed: {}", e);
        Error::Serialization(e.to_string())
    })
}

/// Decode a cached snapshot, validating magic and schema version.
///
/// # Errors
///
/// - `Error::Deserialization`: corrupted payload
/// - `Error::InvalidCacheEntry`: wrong magic header
/// - `Error::VersionMismatch`: written by another schema version
pub fn decode_snapshot(bytes: &[u8]) -> Result<Snapshot> {
    let envelope: SnapshotEnvelope<Snapshot> = postcard::from_bytes(bytes).map_err(|e| {
        error!("Snapshot deserialization failed: {}", e);
        Error::Deserialization(e.to_string())
    })?;

    if envelope.magic != SNAPSHOT_MAGIC {
        warn!(
            "Invalid cache entry: expected magic {:?}, got {:?}",
            SNAPSHOT_MAGIC, envelope.magic
        );
        return Err(Error::InvalidCacheEntry(format!(
            "expected magic {:?}, got {:?}",
            SNAPSHOT_MAGIC, envelope.magic
        )));
    }

    if envelope.version != CURRENT_SCHEMA_VERSION {
        warn!(
            "Snapshot version mismatch: expected {}, got {}",
            CURRENT_SCHEMA_VERSION, envelope.version
        );
        return Err(Error::VersionMismatch {
            expected: CURRENT_SCHEMA_VERSION,
            found: envelope.version,
        });
    }

    Ok(envelope.payload)
}
