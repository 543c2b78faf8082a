//! State storage for sentinel.
//!
//! All governed state lives in a key-value [`StateStore`] where keys are
//! relative paths (`observations/<slug>.json`, `constraints/<state>/<id>.json`,
//! `.circuit-state.json`, ...) and values are schema-versioned JSON documents.
//!
//! Two backends:
//!
//! - [`FsStateStore`]: production backend; every write is atomic
//!   (write-to-temp-then-rename), never a partial file
//! - [`MemStateStore`]: in-memory test double on DashMap
//!
//! Modelling the constraint directories as an explicit store (rather than
//! filesystem globals) keeps every component testable without a disk.

pub mod fs;
pub mod mem;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub use fs::FsStateStore;
pub use mem::MemStateStore;

/// Result type for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Current on-disk schema version for all sentinel documents.
pub const SCHEMA_VERSION: u32 = 1;

/// Key-value state store with atomic writes and key moves.
///
/// Keys are relative paths. Implementations must guarantee that `put` is
/// all-or-nothing: a reader never sees a partially written value.
pub trait StateStore: Send + Sync {
    /// Read a value. `Ok(None)` if the key does not exist.
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Write a value atomically, creating parent locations as needed.
    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()>;

    /// Write a value only if the key does not exist yet, atomically.
    ///
    /// Returns whether the write happened. The check and the write are one
    /// operation: of any number of concurrent callers on a missing key,
    /// exactly one gets `true`. Lock acquisition depends on this.
    fn put_if_absent(&self, key: &str, value: &[u8]) -> StoreResult<bool>;

    /// Delete a key. Returns whether it existed.
    fn remove(&self, key: &str) -> StoreResult<bool>;

    /// List all keys with the given prefix, sorted.
    fn list(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Atomically move a value from one key to another.
    ///
    /// Used when a constraint file moves between state directories.
    fn move_key(&self, from: &str, to: &str) -> StoreResult<()>;

    /// Check if a key exists.
    fn contains(&self, key: &str) -> StoreResult<bool> {
        self.get(key).map(|v| v.is_some())
    }
}

// ---------------------------------------------------------------------------
// Schema-versioned documents
// ---------------------------------------------------------------------------

/// One entry in a document's migration history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migration {
    pub from_version: u32,
    pub to_version: u32,
    pub migrated_at: DateTime<Utc>,
}

/// Envelope for every persisted JSON document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document<T> {
    pub schema_version: u32,
    pub migration_history: Vec<Migration>,
    pub data: T,
}

impl<T> Document<T> {
    /// Wrap a payload at the current schema version.
    pub fn new(data: T) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            migration_history: Vec::new(),
            data,
        }
    }
}

/// Borrowed counterpart of [`Document`] so encoding never clones the payload.
#[derive(Serialize)]
struct DocumentRef<'a, T> {
    schema_version: u32,
    migration_history: &'a [Migration],
    data: &'a T,
}

/// Serialize a payload into a versioned document.
pub fn encode_doc<T: Serialize>(key: &str, data: &T) -> StoreResult<Vec<u8>> {
    let doc = DocumentRef {
        schema_version: SCHEMA_VERSION,
        migration_history: &[],
        data,
    };
    serde_json::to_vec_pretty(&doc).map_err(|e| StoreError::Serialization {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Deserialize a versioned document, upgrading old schema versions in place.
///
/// Version 1 is the only schema so far; the upgrade path just records the
/// migration so future versions have an audit trail to append to.
pub fn decode_doc<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> StoreResult<Document<T>> {
    let mut doc: Document<T> =
        serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization {
            key: key.to_string(),
            message: e.to_string(),
        })?;
    if doc.schema_version < SCHEMA_VERSION {
        doc.migration_history.push(Migration {
            from_version: doc.schema_version,
            to_version: SCHEMA_VERSION,
            migrated_at: Utc::now(),
        });
        doc.schema_version = SCHEMA_VERSION;
    }
    Ok(doc)
}

/// Read and decode a document payload. `Ok(None)` if the key does not exist.
pub fn get_doc<T: DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> StoreResult<Option<T>> {
    match store.get(key)? {
        Some(bytes) => Ok(Some(decode_doc(key, &bytes)?.data)),
        None => Ok(None),
    }
}

/// Encode and write a document payload atomically.
pub fn put_doc<T: Serialize>(store: &dyn StateStore, key: &str, data: &T) -> StoreResult<()> {
    let bytes = encode_doc(key, data)?;
    store.put(key, &bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        name: String,
        count: u32,
    }

    #[test]
    fn document_roundtrip() {
        let store = MemStateStore::new();
        let payload = Payload {
            name: "git-force-push".into(),
            count: 3,
        };
        put_doc(&store, "observations/git-force-push.json", &payload).unwrap();

        let loaded: Payload = get_doc(&store, "observations/git-force-push.json")
            .unwrap()
            .unwrap();
        assert_eq!(loaded, payload);
    }

    #[test]
    fn document_carries_schema_version() {
        let bytes = encode_doc("k", &Payload { name: "x".into(), count: 1 }).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["schema_version"], SCHEMA_VERSION);
        assert!(value["migration_history"].as_array().unwrap().is_empty());
    }

    #[test]
    fn old_schema_version_records_migration() {
        let json = r#"{"schema_version":0,"migration_history":[],"data":{"name":"x","count":1}}"#;
        let doc: Document<Payload> = decode_doc("k", json.as_bytes()).unwrap();
        assert_eq!(doc.schema_version, SCHEMA_VERSION);
        assert_eq!(doc.migration_history.len(), 1);
        assert_eq!(doc.migration_history[0].from_version, 0);
    }

    #[test]
    fn missing_doc_is_none() {
        let store = MemStateStore::new();
        let loaded: Option<Payload> = get_doc(&store, "nope.json").unwrap();
        assert!(loaded.is_none());
    }
}
