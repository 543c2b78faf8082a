//! Observation aggregator: groups evidence into recurring observations.
//!
//! New evidence is matched against existing observations of the same kind
//! through the injected [`Similarity`] capability. A match above the
//! severity-equivalent threshold links the evidence (recurrence +1, new
//! provenance tuple, tier recompute); a miss creates a fresh observation.
//!
//! Human decisions arrive as confirm/disconfirm events. Confirmations are
//! deduplicated per user so one enthusiastic reviewer cannot push an
//! observation over the eligibility bar alone.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::constraint::{ConstraintId, Severity};
use crate::error::ObservationError;
use crate::evidence::{Evidence, EvidenceId};
use crate::store::{StateStore, get_doc, put_doc};

/// Result type for observation operations.
pub type ObservationResult<T> = std::result::Result<T, ObservationError>;

// ---------------------------------------------------------------------------
// Similarity boundary
// ---------------------------------------------------------------------------

/// External semantic-similarity capability.
///
/// Scores whether two free-text failure descriptions are the same underlying
/// issue, in `[0, 1]`. Production wires an LLM-backed scorer; tests use a
/// deterministic stub.
pub trait Similarity: Send + Sync {
    fn score(&self, a: &str, b: &str) -> f64;
}

/// Deterministic lexical fallback: Jaccard index over lowercase word sets.
///
/// Used by the CLI when no semantic scorer is configured, and by tests.
#[derive(Debug, Default)]
pub struct LexicalSimilarity;

impl Similarity for LexicalSimilarity {
    fn score(&self, a: &str, b: &str) -> f64 {
        let words = |s: &str| -> BTreeSet<String> {
            s.split(|c: char| !c.is_alphanumeric())
                .filter(|w| !w.is_empty())
                .map(|w| w.to_lowercase())
                .collect()
        };
        let a = words(a);
        let b = words(b);
        if a.is_empty() && b.is_empty() {
            return 0.0;
        }
        let intersection = a.intersection(&b).count() as f64;
        let union = a.union(&b).count() as f64;
        intersection / union
    }
}

/// Per-severity-equivalent similarity thresholds for evidence matching.
///
/// Configuration, not hardcoded law.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct MatchThresholds {
    pub critical: f64,
    pub important: f64,
    pub minor: f64,
}

impl Default for MatchThresholds {
    fn default() -> Self {
        Self {
            critical: 0.85,
            important: 0.80,
            minor: 0.70,
        }
    }
}

impl MatchThresholds {
    /// Threshold for the given severity equivalent.
    pub fn for_severity(&self, severity: Severity) -> f64 {
        match severity {
            Severity::Critical => self.critical,
            Severity::Important => self.important,
            Severity::Minor => self.minor,
        }
    }
}

// ---------------------------------------------------------------------------
// Observation model
// ---------------------------------------------------------------------------

/// What kind of recurring thing this observation tracks.
///
/// Only failures can ever produce constraints; patterns are informational.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservationKind {
    Failure,
    Pattern,
}

/// Evidence strength classification, a pure function of the recurrence count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvidenceTier {
    Weak,
    Emerging,
    Strong,
    Established,
}

impl EvidenceTier {
    /// Derive the tier from a recurrence count.
    pub fn from_recurrence(r_count: u32) -> Self {
        match r_count {
            0 | 1 => Self::Weak,
            2 => Self::Emerging,
            3 | 4 => Self::Strong,
            _ => Self::Established,
        }
    }
}

/// Aggregated record of a recurring failure or pattern with R/C/D counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub slug: String,
    pub kind: ObservationKind,
    /// Canonical description (the first linked evidence's text); the anchor
    /// that later evidence is similarity-matched against.
    pub description: String,
    /// Recurrence count.
    pub r_count: u32,
    /// Confirmation count (unique users only).
    pub c_count: u32,
    /// Disconfirmation count.
    pub d_count: u32,
    pub c_unique_users: BTreeSet<String>,
    /// Provenance tuples (source + session + date).
    pub sources: BTreeSet<String>,
    pub tier: EvidenceTier,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set once a draft constraint has been derived; at most one per observation.
    pub constraint_id: Option<ConstraintId>,
    pub evidence: Vec<EvidenceId>,
}

impl Observation {
    fn from_evidence(slug: String, kind: ObservationKind, evidence: &Evidence) -> Self {
        Self {
            slug,
            kind,
            description: evidence.description.clone(),
            r_count: 1,
            c_count: 0,
            d_count: 0,
            c_unique_users: BTreeSet::new(),
            sources: BTreeSet::from([evidence.provenance()]),
            tier: EvidenceTier::Weak,
            created_at: evidence.timestamp,
            updated_at: evidence.timestamp,
            constraint_id: None,
            evidence: vec![evidence.id],
        }
    }

    fn link_evidence(&mut self, evidence: &Evidence) {
        self.r_count += 1;
        self.sources.insert(evidence.provenance());
        self.evidence.push(evidence.id);
        self.tier = EvidenceTier::from_recurrence(self.r_count);
        self.updated_at = evidence.timestamp;
    }

    /// `d / (c + d)`, or 0 when there are no decisions yet (non-blocking).
    pub fn disconfirm_ratio(&self) -> f64 {
        let decisions = self.c_count + self.d_count;
        if decisions == 0 {
            0.0
        } else {
            f64::from(self.d_count) / f64::from(decisions)
        }
    }
}

/// Outcome of a confirm/disconfirm decision.
#[derive(Debug, Clone)]
pub struct Decision {
    pub observation: Observation,
    /// Whether the decision moved a counter (repeat confirmations do not).
    pub counted: bool,
    /// Whether the decision latency was suspiciously short.
    pub fast_decision: bool,
}

// ---------------------------------------------------------------------------
// Aggregator
// ---------------------------------------------------------------------------

/// Decisions faster than this emit a bias-mitigation warning (never blocking).
pub const FAST_DECISION_FLOOR_SECS: i64 = 5;

/// Groups evidence into observations and applies human decisions.
pub struct Aggregator {
    store: Arc<dyn StateStore>,
    index: DashMap<String, Observation>,
    similarity: Arc<dyn Similarity>,
    thresholds: MatchThresholds,
}

impl Aggregator {
    /// Open the aggregator, loading all live observations from the store.
    ///
    /// The in-memory index is loaded once and kept current only by this
    /// instance's own writes. Two long-lived aggregators on one store root
    /// will drift even under the governance lock, since the lock serializes
    /// writes but does not refresh a stale index. Run one engine per store
    /// root; concurrent access from separate processes must reopen per
    /// operation (the CLI model).
    pub fn open(
        store: Arc<dyn StateStore>,
        similarity: Arc<dyn Similarity>,
        thresholds: MatchThresholds,
    ) -> ObservationResult<Self> {
        let index = DashMap::new();
        for key in store.list("observations/")? {
            if key.starts_with("observations/archive/") {
                continue;
            }
            if let Some(obs) = get_doc::<Observation>(store.as_ref(), &key)? {
                index.insert(obs.slug.clone(), obs);
            }
        }
        Ok(Self {
            store,
            index,
            similarity,
            thresholds,
        })
    }

    /// Record evidence: link it to the best-matching observation of the same
    /// kind, or create a new observation.
    ///
    /// Returns the (possibly new) observation and whether a match occurred.
    pub fn record(
        &self,
        evidence: &Evidence,
        kind: ObservationKind,
        severity_hint: Severity,
    ) -> ObservationResult<(Observation, bool)> {
        let threshold = self.thresholds.for_severity(severity_hint);

        let best = self
            .index
            .iter()
            .filter(|entry| entry.value().kind == kind)
            .map(|entry| {
                let score = self
                    .similarity
                    .score(&evidence.description, &entry.value().description);
                (entry.key().clone(), score)
            })
            .max_by(|a, b| a.1.total_cmp(&b.1));

        if let Some((slug, score)) = best
            && score >= threshold
        {
            let mut entry = self
                .index
                .get_mut(&slug)
                .ok_or_else(|| ObservationError::NotFound { slug: slug.clone() })?;
            entry.link_evidence(evidence);
            let obs = entry.value().clone();
            drop(entry);
            tracing::debug!(slug = %obs.slug, score, r_count = obs.r_count, "evidence matched observation");
            self.persist(&obs)?;
            return Ok((obs, true));
        }

        let slug = self.unique_slug(&evidence.description);
        let obs = Observation::from_evidence(slug.clone(), kind, evidence);
        self.index.insert(slug, obs.clone());
        tracing::debug!(slug = %obs.slug, "new observation created");
        self.persist(&obs)?;
        Ok((obs, false))
    }

    /// Apply a confirmation from a user.
    ///
    /// The same user confirming twice does not double-count. Latencies under
    /// the fast-decision floor emit a warning (bias signal only).
    pub fn confirm(
        &self,
        slug: &str,
        user_id: &str,
        decision_latency: Duration,
        now: DateTime<Utc>,
    ) -> ObservationResult<Decision> {
        self.decide(slug, user_id, decision_latency, now, true)
    }

    /// Apply a disconfirmation from a user.
    pub fn disconfirm(
        &self,
        slug: &str,
        user_id: &str,
        decision_latency: Duration,
        now: DateTime<Utc>,
    ) -> ObservationResult<Decision> {
        self.decide(slug, user_id, decision_latency, now, false)
    }

    fn decide(
        &self,
        slug: &str,
        user_id: &str,
        decision_latency: Duration,
        now: DateTime<Utc>,
        confirmed: bool,
    ) -> ObservationResult<Decision> {
        if user_id.trim().is_empty() {
            return Err(ObservationError::InvalidInput {
                message: "decision requires a user identity".into(),
            });
        }

        let fast_decision = decision_latency < Duration::seconds(FAST_DECISION_FLOOR_SECS);
        if fast_decision {
            tracing::warn!(
                slug,
                user_id,
                latency_ms = decision_latency.num_milliseconds(),
                "fast decision: latency under {FAST_DECISION_FLOOR_SECS}s, possible rubber-stamping"
            );
        }

        let mut entry = self
            .index
            .get_mut(slug)
            .ok_or_else(|| ObservationError::NotFound { slug: slug.into() })?;

        let counted = if confirmed {
            if entry.c_unique_users.insert(user_id.to_string()) {
                entry.c_count += 1;
                true
            } else {
                false
            }
        } else {
            entry.d_count += 1;
            true
        };

        if counted {
            entry.updated_at = now;
        }
        let obs = entry.value().clone();
        drop(entry);
        if counted {
            self.persist(&obs)?;
        }
        Ok(Decision {
            observation: obs,
            counted,
            fast_decision,
        })
    }

    /// Look up an observation by slug.
    pub fn get(&self, slug: &str) -> ObservationResult<Observation> {
        self.index
            .get(slug)
            .map(|r| r.value().clone())
            .ok_or_else(|| ObservationError::NotFound { slug: slug.into() })
    }

    /// All live observations.
    pub fn all(&self) -> Vec<Observation> {
        self.index.iter().map(|r| r.value().clone()).collect()
    }

    /// Record the constraint derived from an observation.
    pub fn link_constraint(
        &self,
        slug: &str,
        constraint_id: ConstraintId,
        now: DateTime<Utc>,
    ) -> ObservationResult<Observation> {
        let mut entry = self
            .index
            .get_mut(slug)
            .ok_or_else(|| ObservationError::NotFound { slug: slug.into() })?;
        entry.constraint_id = Some(constraint_id);
        entry.updated_at = now;
        let obs = entry.value().clone();
        drop(entry);
        self.persist(&obs)?;
        Ok(obs)
    }

    /// Move an observation's document under `observations/archive/` and drop
    /// it from the live index.
    pub fn archive(&self, slug: &str) -> ObservationResult<()> {
        if self.index.remove(slug).is_none() {
            return Err(ObservationError::NotFound { slug: slug.into() });
        }
        self.store.move_key(
            &format!("observations/{slug}.json"),
            &format!("observations/archive/{slug}.json"),
        )?;
        Ok(())
    }

    fn persist(&self, obs: &Observation) -> ObservationResult<()> {
        put_doc(
            self.store.as_ref(),
            &format!("observations/{}.json", obs.slug),
            obs,
        )?;
        Ok(())
    }

    fn unique_slug(&self, description: &str) -> String {
        let base = slugify(description);
        if !self.index.contains_key(&base) {
            return base;
        }
        let mut n = 2;
        loop {
            let candidate = format!("{base}-{n}");
            if !self.index.contains_key(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }
}

impl std::fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregator")
            .field("observations", &self.index.len())
            .finish()
    }
}

/// Derive a slug from the first words of a description.
pub fn slugify(description: &str) -> String {
    let slug: Vec<String> = description
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .take(6)
        .map(|w| w.to_lowercase())
        .collect();
    if slug.is_empty() {
        "unnamed".to_string()
    } else {
        slug.join("-")
    }
}
