//! Evidence store: durable, immutable records of observed failures.
//!
//! Every raw occurrence of a failure or pattern is written exactly once with
//! full provenance (source location, session, user, timestamp) and is never
//! mutated or deleted afterwards. Observations reference evidence by ID,
//! never by copy, so the raw record always survives aggregation decisions.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EvidenceError;
use crate::store::{StateStore, get_doc, put_doc};

/// Result type for evidence operations.
pub type EvidenceResult<T> = std::result::Result<T, EvidenceError>;

/// Opaque identifier of an evidence record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EvidenceId(u64);

impl EvidenceId {
    /// Construct from a raw value (used when restoring from disk).
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw numeric value.
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EvidenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ev-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Content hashing boundary
// ---------------------------------------------------------------------------

/// External content-hashing / evidence-packet service.
///
/// Injected capability: production wires a real digest/signature service,
/// tests use a deterministic stub.
pub trait ContentHasher: Send + Sync {
    /// Produce a verifiable digest for the given bytes.
    fn hash(&self, bytes: &[u8]) -> String;

    /// Verify a digest against a detached signature.
    fn verify(&self, digest: &str, signature: &str) -> bool;
}

// ---------------------------------------------------------------------------
// Evidence record
// ---------------------------------------------------------------------------

/// A single immutable failure/pattern occurrence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub id: EvidenceId,
    /// Free-text description of what happened.
    pub description: String,
    /// Provenance: `file:line` or an event reference.
    pub source: String,
    pub session_id: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    /// Digest of the description bytes from the injected hasher, if any.
    pub digest: Option<String>,
}

impl Evidence {
    /// The provenance tuple recorded on the owning observation:
    /// source + session + date.
    pub fn provenance(&self) -> String {
        format!(
            "{}|{}|{}",
            self.source,
            self.session_id,
            self.timestamp.format("%Y-%m-%d")
        )
    }
}

/// Fields supplied by the caller when appending evidence.
#[derive(Debug, Clone)]
pub struct NewEvidence {
    pub description: String,
    pub source: String,
    pub session_id: String,
    pub user_id: String,
}

// ---------------------------------------------------------------------------
// Evidence store
// ---------------------------------------------------------------------------

const SEQUENCE_KEY: &str = "evidence/.sequence.json";

/// Append-only store of evidence records.
pub struct EvidenceStore {
    store: Arc<dyn StateStore>,
    next_id: AtomicU64,
    hasher: Option<Arc<dyn ContentHasher>>,
}

impl EvidenceStore {
    /// Open the evidence store, resuming the ID sequence from disk.
    pub fn open(
        store: Arc<dyn StateStore>,
        hasher: Option<Arc<dyn ContentHasher>>,
    ) -> EvidenceResult<Self> {
        let next: u64 = get_doc(store.as_ref(), SEQUENCE_KEY)?.unwrap_or(1);
        Ok(Self {
            store,
            next_id: AtomicU64::new(next),
            hasher,
        })
    }

    /// Append a new evidence record. Rejects empty descriptions.
    pub fn append(&self, new: NewEvidence, now: DateTime<Utc>) -> EvidenceResult<Evidence> {
        if new.description.trim().is_empty() {
            return Err(EvidenceError::EmptyDescription);
        }

        let id = EvidenceId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let digest = self
            .hasher
            .as_ref()
            .map(|h| h.hash(new.description.as_bytes()));

        let evidence = Evidence {
            id,
            description: new.description,
            source: new.source,
            session_id: new.session_id,
            user_id: new.user_id,
            timestamp: now,
            digest,
        };

        put_doc(self.store.as_ref(), &Self::key(id), &evidence)?;
        put_doc(
            self.store.as_ref(),
            SEQUENCE_KEY,
            &self.next_id.load(Ordering::SeqCst),
        )?;
        Ok(evidence)
    }

    /// Look up an evidence record by ID.
    pub fn get(&self, id: EvidenceId) -> EvidenceResult<Evidence> {
        get_doc(self.store.as_ref(), &Self::key(id))?
            .ok_or(EvidenceError::NotFound { id: id.get() })
    }

    /// Verify a record's digest against a detached signature.
    ///
    /// Returns `false` when no hasher is wired or the record has no digest.
    pub fn verify(&self, evidence: &Evidence, signature: &str) -> bool {
        match (&self.hasher, &evidence.digest) {
            (Some(hasher), Some(digest)) => hasher.verify(digest, signature),
            _ => false,
        }
    }

    fn key(id: EvidenceId) -> String {
        format!("evidence/{id}.json")
    }
}

impl std::fmt::Debug for EvidenceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvidenceStore")
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStateStore;

    struct StubHasher;

    impl ContentHasher for StubHasher {
        fn hash(&self, bytes: &[u8]) -> String {
            format!("stub-{}", bytes.len())
        }

        fn verify(&self, digest: &str, signature: &str) -> bool {
            signature == format!("sig:{digest}")
        }
    }

    fn new_evidence(description: &str) -> NewEvidence {
        NewEvidence {
            description: description.into(),
            source: "src/push.rs:42".into(),
            session_id: "session-1".into(),
            user_id: "alice".into(),
        }
    }

    #[test]
    fn append_and_get() {
        let store = Arc::new(MemStateStore::new());
        let evidence_store = EvidenceStore::open(store, Some(Arc::new(StubHasher))).unwrap();

        let ev = evidence_store
            .append(new_evidence("force push to main"), Utc::now())
            .unwrap();
        assert_eq!(ev.digest.as_deref(), Some("stub-18"));

        let loaded = evidence_store.get(ev.id).unwrap();
        assert_eq!(loaded, ev);
    }

    #[test]
    fn empty_description_rejected() {
        let store = Arc::new(MemStateStore::new());
        let evidence_store = EvidenceStore::open(store, None).unwrap();

        let err = evidence_store
            .append(new_evidence("   "), Utc::now())
            .unwrap_err();
        assert!(matches!(err, EvidenceError::EmptyDescription));
    }

    #[test]
    fn unknown_id_is_not_found() {
        let store = Arc::new(MemStateStore::new());
        let evidence_store = EvidenceStore::open(store, None).unwrap();
        let err = evidence_store.get(EvidenceId::new(99)).unwrap_err();
        assert!(matches!(err, EvidenceError::NotFound { id: 99 }));
    }

    #[test]
    fn sequence_resumes_after_reopen() {
        let store = Arc::new(MemStateStore::new());
        {
            let evidence_store = EvidenceStore::open(store.clone(), None).unwrap();
            evidence_store
                .append(new_evidence("first"), Utc::now())
                .unwrap();
            evidence_store
                .append(new_evidence("second"), Utc::now())
                .unwrap();
        }

        let reopened = EvidenceStore::open(store, None).unwrap();
        let ev = reopened.append(new_evidence("third"), Utc::now()).unwrap();
        assert_eq!(ev.id.get(), 3);
    }

    #[test]
    fn digest_verification() {
        let store = Arc::new(MemStateStore::new());
        let evidence_store = EvidenceStore::open(store, Some(Arc::new(StubHasher))).unwrap();

        let ev = evidence_store
            .append(new_evidence("force push"), Utc::now())
            .unwrap();
        let digest = ev.digest.clone().unwrap();
        assert!(evidence_store.verify(&ev, &format!("sig:{digest}")));
        assert!(!evidence_store.verify(&ev, "sig:wrong"));
    }

    #[test]
    fn provenance_tuple_shape() {
        let ts = "2026-08-23T10:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let ev = Evidence {
            id: EvidenceId::new(1),
            description: "x".into(),
            source: "ci:run-9".into(),
            session_id: "s1".into(),
            user_id: "bob".into(),
            timestamp: ts,
            digest: None,
        };
        assert_eq!(ev.provenance(), "ci:run-9|s1|2026-08-23");
    }
}
