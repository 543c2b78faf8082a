//! Engine facade wiring every subsystem together.
//!
//! The engine owns the state store and runs each mutating flow under the
//! governance lock: acquire, apply, persist, release. Reads (status,
//! dashboard) never take the lock and may observe a snapshot that changes
//! mid-read.
//!
//! Run one engine per store root. The in-memory indices load at open and
//! are kept current only by this instance's writes; a second long-lived
//! engine on the same root works from stale counters between its own
//! operations even though the lock serializes each write.
//!
//! Candidacy is evaluated after every counter mutation; an observation whose
//! eligibility flips to true gets a draft constraint immediately, and never
//! anything past draft.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::circuit::{CheckDecision, CircuitBreaker, CircuitConfig, CircuitState};
use crate::constraint::{
    Constraint, ConstraintId, Enforcement, LifecycleMachine, Override, Severity, TransitionKind,
};
use crate::eligibility::{self, EligibilityConfig, EligibilityReport};
use crate::error::{CircuitError, EngineError, GovernanceError, SentinelError, SentinelResult};
use crate::evidence::{ContentHasher, Evidence, EvidenceStore, NewEvidence};
use crate::governance::{
    Alert, AlertThresholds, BulkMode, BulkReport, GovernanceCoordinator, GovernanceLock,
    HealthReport, LockManager,
};
use crate::observation::{
    Aggregator, Decision, MatchThresholds, Observation, ObservationKind, Similarity,
};
use crate::store::{FsStateStore, StateStore};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Engine configuration, loadable from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root of the persisted state tree.
    pub data_dir: PathBuf,
    /// Identity used when taking the governance lock.
    pub holder_id: String,
    pub lock_ttl_secs: i64,
    pub match_thresholds: MatchThresholds,
    pub eligibility: EligibilityConfig,
    pub circuit: CircuitConfig,
    /// Per-constraint circuit overrides, keyed by constraint ID.
    pub circuit_overrides: BTreeMap<String, CircuitConfig>,
    pub alerts: AlertThresholds,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".sentinel"),
            holder_id: "sentinel".to_string(),
            lock_ttl_secs: crate::governance::DEFAULT_LOCK_TTL_SECS,
            match_thresholds: MatchThresholds::default(),
            eligibility: EligibilityConfig::default(),
            circuit: CircuitConfig::default(),
            circuit_overrides: BTreeMap::new(),
            alerts: AlertThresholds::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: &Path) -> SentinelResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| EngineError::InvalidConfig {
            message: format!("cannot read {}: {e}", path.display()),
        })?;
        let config = toml::from_str(&text).map_err(|e| EngineError::InvalidConfig {
            message: format!("cannot parse {}: {e}", path.display()),
        })?;
        Ok(config)
    }

    fn validate(&self) -> SentinelResult<()> {
        if self.lock_ttl_secs <= 0 {
            return Err(EngineError::InvalidConfig {
                message: "lock_ttl_secs must be positive".into(),
            }
            .into());
        }
        if self.circuit.trip_threshold == 0 {
            return Err(EngineError::InvalidConfig {
                message: "circuit.trip_threshold must be at least 1".into(),
            }
            .into());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Result of recording a failure occurrence end to end.
#[derive(Debug, Clone)]
pub struct RecordOutcome {
    pub evidence: Evidence,
    pub observation: Observation,
    /// Whether the evidence matched an existing observation.
    pub matched: bool,
    /// The draft constraint, when this mutation flipped eligibility.
    pub drafted: Option<Constraint>,
}

/// Result of a confirm/disconfirm decision.
#[derive(Debug, Clone)]
pub struct DecisionOutcome {
    pub decision: Decision,
    pub eligibility: EligibilityReport,
    pub drafted: Option<Constraint>,
}

/// Result of a pre-action check.
#[derive(Debug, Clone)]
pub enum ActionCheck {
    Allowed,
    /// An OPEN circuit was bypassed by a valid emergency override.
    AllowedByOverride { approver: String },
    /// The constraint is in a state that is never evaluated against actions.
    NotEnforced,
}

/// Result of reporting a violating action.
#[derive(Debug, Clone)]
pub enum ViolationOutcome {
    /// Active constraint: the action is refused.
    Blocked(CircuitState),
    /// Retiring constraint: logged and recorded, not refused.
    Warned(CircuitState),
    /// The constraint is not enforced; nothing was recorded.
    NotEnforced,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The failure-anchored constraint memory and enforcement engine.
pub struct Engine {
    config: EngineConfig,
    evidence: EvidenceStore,
    aggregator: Arc<Aggregator>,
    lifecycle: Arc<LifecycleMachine>,
    breaker: Arc<CircuitBreaker>,
    coordinator: GovernanceCoordinator,
    locks: LockManager,
}

impl Engine {
    /// Open the engine against a filesystem state directory.
    pub fn new(
        config: EngineConfig,
        similarity: Arc<dyn Similarity>,
        hasher: Option<Arc<dyn ContentHasher>>,
    ) -> SentinelResult<Self> {
        config.validate()?;
        let store = Arc::new(FsStateStore::open(&config.data_dir).map_err(|_| {
            EngineError::StateDir {
                path: config.data_dir.display().to_string(),
            }
        })?);
        Self::with_store(config, store, similarity, hasher)
    }

    /// Open the engine against an arbitrary state store.
    pub fn with_store(
        config: EngineConfig,
        store: Arc<dyn StateStore>,
        similarity: Arc<dyn Similarity>,
        hasher: Option<Arc<dyn ContentHasher>>,
    ) -> SentinelResult<Self> {
        config.validate()?;
        let breaker = Arc::new(CircuitBreaker::new(
            store.clone(),
            config.circuit,
            config.circuit_overrides.clone(),
        ));
        let lifecycle = Arc::new(LifecycleMachine::open(store.clone(), breaker.clone())?);
        let aggregator = Arc::new(Aggregator::open(
            store.clone(),
            similarity,
            config.match_thresholds,
        )?);
        let evidence = EvidenceStore::open(store.clone(), hasher)?;
        let coordinator = GovernanceCoordinator::new(
            store.clone(),
            lifecycle.clone(),
            breaker.clone(),
            aggregator.clone(),
            config.alerts,
        );
        let locks = LockManager::new(store, config.lock_ttl_secs);
        Ok(Self {
            config,
            evidence,
            aggregator,
            lifecycle,
            breaker,
            coordinator,
            locks,
        })
    }

    /// Run a mutation under the governance lock.
    ///
    /// Fail-fast on contention; the lock is released best-effort afterwards
    /// (an expired or stolen lock does not mask the operation's result).
    fn locked<T>(
        &self,
        now: DateTime<Utc>,
        f: impl FnOnce() -> SentinelResult<T>,
    ) -> SentinelResult<T> {
        self.locks
            .acquire(&self.config.holder_id, now)
            .map_err(SentinelError::from)?;
        let result = f();
        if let Err(err) = self.locks.release(&self.config.holder_id) {
            tracing::debug!(%err, "governance lock release skipped");
        }
        result
    }

    // -----------------------------------------------------------------------
    // Evidence and observations
    // -----------------------------------------------------------------------

    /// Record one failure or pattern occurrence.
    ///
    /// Appends immutable evidence, aggregates it into an observation, and
    /// drafts a constraint if this mutation made the observation eligible.
    pub fn record_failure(
        &self,
        new: NewEvidence,
        kind: ObservationKind,
        severity_hint: Severity,
        now: DateTime<Utc>,
    ) -> SentinelResult<RecordOutcome> {
        self.locked(now, || {
            let evidence = self.evidence.append(new, now)?;
            let (observation, matched) = self.aggregator.record(&evidence, kind, severity_hint)?;
            let drafted = self.draft_if_eligible(&observation, now)?;
            let observation = if drafted.is_some() {
                self.aggregator.get(&observation.slug)?
            } else {
                observation
            };
            Ok(RecordOutcome {
                evidence,
                observation,
                matched,
                drafted,
            })
        })
    }

    /// Apply a human confirmation to an observation.
    pub fn confirm(
        &self,
        slug: &str,
        user_id: &str,
        decision_latency: Duration,
        now: DateTime<Utc>,
    ) -> SentinelResult<DecisionOutcome> {
        self.locked(now, || {
            let decision = self.aggregator.confirm(slug, user_id, decision_latency, now)?;
            let drafted = self.draft_if_eligible(&decision.observation, now)?;
            let observation = self.aggregator.get(slug)?;
            Ok(DecisionOutcome {
                eligibility: eligibility::evaluate(&observation, &self.config.eligibility),
                decision,
                drafted,
            })
        })
    }

    /// Apply a human disconfirmation to an observation.
    pub fn disconfirm(
        &self,
        slug: &str,
        user_id: &str,
        decision_latency: Duration,
        now: DateTime<Utc>,
    ) -> SentinelResult<DecisionOutcome> {
        self.locked(now, || {
            let decision = self
                .aggregator
                .disconfirm(slug, user_id, decision_latency, now)?;
            Ok(DecisionOutcome {
                eligibility: eligibility::evaluate(&decision.observation, &self.config.eligibility),
                decision,
                drafted: None,
            })
        })
    }

    /// Draft a constraint when the observation just became eligible.
    fn draft_if_eligible(
        &self,
        observation: &Observation,
        now: DateTime<Utc>,
    ) -> SentinelResult<Option<Constraint>> {
        if observation.constraint_id.is_some()
            || !eligibility::is_eligible(observation, &self.config.eligibility)
        {
            return Ok(None);
        }

        let severity = Severity::from_tier(observation.tier);
        let constraint = self.lifecycle.create_draft(
            observation,
            observation.description.clone(),
            severity,
            "eligibility-engine",
            now,
        )?;
        self.aggregator
            .link_constraint(&observation.slug, constraint.id.clone(), now)?;
        tracing::info!(
            slug = %observation.slug,
            constraint_id = %constraint.id,
            ?severity,
            "observation became eligible, draft constraint created"
        );
        Ok(Some(constraint))
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub fn activate(
        &self,
        id: &ConstraintId,
        actor: &str,
        now: DateTime<Utc>,
    ) -> SentinelResult<Constraint> {
        self.transition(id, TransitionKind::Activate, actor, None, now)
    }

    pub fn retire(
        &self,
        id: &ConstraintId,
        actor: &str,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> SentinelResult<Constraint> {
        self.transition(id, TransitionKind::Retire, actor, reason, now)
    }

    pub fn emergency_retire(
        &self,
        id: &ConstraintId,
        actor: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> SentinelResult<Constraint> {
        self.transition(id, TransitionKind::EmergencyRetire, actor, Some(reason), now)
    }

    pub fn rollback(
        &self,
        id: &ConstraintId,
        actor: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> SentinelResult<Constraint> {
        self.transition(id, TransitionKind::Rollback, actor, Some(reason), now)
    }

    pub fn complete_retire(
        &self,
        id: &ConstraintId,
        actor: &str,
        now: DateTime<Utc>,
    ) -> SentinelResult<Constraint> {
        self.transition(id, TransitionKind::CompleteRetire, actor, None, now)
    }

    pub fn reactivate(
        &self,
        id: &ConstraintId,
        actor: &str,
        now: DateTime<Utc>,
    ) -> SentinelResult<Constraint> {
        self.transition(id, TransitionKind::Reactivate, actor, None, now)
    }

    pub fn delete_draft(
        &self,
        id: &ConstraintId,
        actor: &str,
        now: DateTime<Utc>,
    ) -> SentinelResult<Constraint> {
        self.transition(id, TransitionKind::Delete, actor, None, now)
    }

    fn transition(
        &self,
        id: &ConstraintId,
        kind: TransitionKind,
        actor: &str,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> SentinelResult<Constraint> {
        self.locked(now, || {
            Ok(self.lifecycle.transition(id, kind, actor, reason, now)?)
        })
    }

    // -----------------------------------------------------------------------
    // Enforcement
    // -----------------------------------------------------------------------

    /// Check whether an action governed by a constraint may proceed.
    ///
    /// An OPEN circuit on an active constraint refuses the action unless a
    /// valid emergency override consumes the check; retiring constraints
    /// never refuse.
    pub fn check_action(&self, id: &ConstraintId, now: DateTime<Utc>) -> SentinelResult<ActionCheck> {
        let constraint = self.lifecycle.get(id)?;
        if constraint.state.enforcement() == Enforcement::None {
            return Ok(ActionCheck::NotEnforced);
        }

        // A check can move OPEN -> HALF_OPEN or consume an override, so it
        // runs under the lock like any other mutation.
        self.locked(now, || {
            let decision = self.breaker.check(id.as_str(), now)?;
            match (constraint.state.enforcement(), decision) {
                (_, CheckDecision::Allowed) => Ok(ActionCheck::Allowed),
                (Enforcement::Warn, CheckDecision::Blocked { .. }) => {
                    tracing::warn!(constraint_id = %id, "circuit OPEN on retiring constraint (warn only)");
                    Ok(ActionCheck::Allowed)
                }
                (
                    _,
                    CheckDecision::Blocked {
                        cooldown_remaining_secs,
                    },
                ) => match self.lifecycle.consume_override(id, now)? {
                    Some(over) => {
                        tracing::warn!(
                            constraint_id = %id,
                            approver = %over.approver,
                            reason = %over.reason,
                            "OPEN circuit bypassed by emergency override"
                        );
                        Ok(ActionCheck::AllowedByOverride {
                            approver: over.approver,
                        })
                    }
                    // An override that exists but is expired or spent gives
                    // the sharper error than a plain block.
                    None if self.lifecycle.get_override(id)?.is_some() => {
                        Err(GovernanceError::RecoveryExpired {
                            constraint_id: id.to_string(),
                        }
                        .into())
                    }
                    None => Err(CircuitError::ThresholdBlocked {
                        constraint_id: id.to_string(),
                        cooldown_remaining_secs,
                    }
                    .into()),
                },
            }
        })
    }

    /// Report that an action violated a constraint.
    pub fn report_violation(
        &self,
        id: &ConstraintId,
        action_ref: &str,
        now: DateTime<Utc>,
    ) -> SentinelResult<ViolationOutcome> {
        let constraint = self.lifecycle.get(id)?;
        match constraint.state.enforcement() {
            Enforcement::None => {
                tracing::debug!(
                    constraint_id = %id,
                    state = %constraint.state,
                    "violation against non-enforced constraint ignored"
                );
                Ok(ViolationOutcome::NotEnforced)
            }
            Enforcement::Block => self.locked(now, || {
                let state = self.breaker.record(id.as_str(), action_ref, now)?;
                Ok(ViolationOutcome::Blocked(state))
            }),
            Enforcement::Warn => self.locked(now, || {
                let state = self.breaker.record(id.as_str(), action_ref, now)?;
                tracing::warn!(constraint_id = %id, action_ref, "violation on retiring constraint");
                Ok(ViolationOutcome::Warned(state))
            }),
        }
    }

    /// Report a non-violating action (closes a HALF_OPEN probe).
    pub fn report_success(&self, id: &ConstraintId, now: DateTime<Utc>) -> SentinelResult<CircuitState> {
        self.locked(now, || Ok(self.breaker.record_success(id.as_str(), now)?))
    }

    /// Create a time-boxed emergency override for an OPEN circuit.
    pub fn emergency_override(
        &self,
        id: &ConstraintId,
        approver: &str,
        reason: &str,
        valid_for: Duration,
        single_use: bool,
        now: DateTime<Utc>,
    ) -> SentinelResult<Override> {
        if reason.trim().is_empty() {
            return Err(GovernanceError::ReasonRequired {
                constraint_id: id.to_string(),
            }
            .into());
        }
        // The constraint must exist; overrides on retired constraints are
        // invalidated anyway.
        self.lifecycle.get(id)?;

        let over = Override {
            constraint_id: id.clone(),
            approver: approver.to_string(),
            reason: reason.to_string(),
            expires_at: now + valid_for,
            single_use,
            used: false,
        };
        self.locked(now, || {
            self.lifecycle.put_override(over.clone())?;
            Ok(())
        })?;
        tracing::warn!(constraint_id = %id, approver, reason, "emergency override granted");
        Ok(over)
    }

    /// Manually reset a circuit to CLOSED, with an audit entry.
    pub fn reset_circuit(
        &self,
        id: &ConstraintId,
        actor: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> SentinelResult<CircuitState> {
        self.locked(now, || {
            let state = self.breaker.reset(id.as_str(), actor, reason, now)?;
            self.lifecycle
                .append_audit(id, actor, "circuit_reset", reason, now)?;
            Ok(state)
        })
    }

    // -----------------------------------------------------------------------
    // Governance
    // -----------------------------------------------------------------------

    pub fn bulk_retire(
        &self,
        dormant_days: i64,
        mode: BulkMode,
        actor: &str,
        now: DateTime<Utc>,
    ) -> SentinelResult<BulkReport> {
        self.locked(now, || {
            Ok(self.coordinator.bulk_retire(dormant_days, mode, actor, now)?)
        })
    }

    pub fn archive_observations(
        &self,
        older_than_days: i64,
        mode: BulkMode,
        now: DateTime<Utc>,
    ) -> SentinelResult<BulkReport> {
        self.locked(now, || {
            Ok(self
                .coordinator
                .archive_observations(older_than_days, mode, now)?)
        })
    }

    /// Scan health metrics and emit edge-triggered alerts.
    pub fn scan_alerts(&self, now: DateTime<Utc>) -> SentinelResult<Vec<Alert>> {
        self.locked(now, || Ok(self.coordinator.scan_alerts(now)?))
    }

    // -----------------------------------------------------------------------
    // Reads (lock-free)
    // -----------------------------------------------------------------------

    /// On-demand dashboard view over the same state the alert scanner reads.
    pub fn dashboard(&self, now: DateTime<Utc>) -> SentinelResult<HealthReport> {
        Ok(self.coordinator.health(now)?)
    }

    pub fn observation(&self, slug: &str) -> SentinelResult<Observation> {
        Ok(self.aggregator.get(slug)?)
    }

    pub fn observations(&self) -> Vec<Observation> {
        let mut all = self.aggregator.all();
        all.sort_by(|a, b| a.slug.cmp(&b.slug));
        all
    }

    pub fn constraint(&self, id: &ConstraintId) -> SentinelResult<Constraint> {
        Ok(self.lifecycle.get(id)?)
    }

    pub fn constraints(&self) -> SentinelResult<Vec<Constraint>> {
        Ok(self.lifecycle.all()?)
    }

    pub fn eligibility(&self, slug: &str) -> SentinelResult<EligibilityReport> {
        let observation = self.aggregator.get(slug)?;
        Ok(eligibility::evaluate(&observation, &self.config.eligibility))
    }

    pub fn circuit(&self, id: &ConstraintId) -> SentinelResult<Option<CircuitState>> {
        Ok(self.breaker.get(id.as_str())?)
    }

    pub fn lock_status(&self, now: DateTime<Utc>) -> SentinelResult<Option<GovernanceLock>> {
        Ok(self.locks.current(now)?)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("data_dir", &self.config.data_dir)
            .field("holder_id", &self.config.holder_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStateStore;

    struct ExactSimilarity;

    impl Similarity for ExactSimilarity {
        fn score(&self, a: &str, b: &str) -> f64 {
            if a == b { 1.0 } else { 0.0 }
        }
    }

    fn engine() -> Engine {
        Engine::with_store(
            EngineConfig::default(),
            Arc::new(MemStateStore::new()),
            Arc::new(ExactSimilarity),
            None,
        )
        .unwrap()
    }

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn failure(description: &str, source: &str, user: &str) -> NewEvidence {
        NewEvidence {
            description: description.into(),
            source: source.into(),
            session_id: format!("session-{user}"),
            user_id: user.into(),
        }
    }

    /// Three recurrences from two sources/users, then two confirmations.
    fn eligible_draft(engine: &Engine, now: DateTime<Utc>) -> ConstraintId {
        let desc = "git force push to main";
        for (source, user) in [("a.rs:1", "alice"), ("b.rs:2", "bob"), ("a.rs:1", "alice")] {
            engine
                .record_failure(
                    failure(desc, source, user),
                    ObservationKind::Failure,
                    Severity::Important,
                    now,
                )
                .unwrap();
        }
        engine
            .confirm("git-force-push-to-main", "alice", Duration::seconds(30), now)
            .unwrap();
        let outcome = engine
            .confirm("git-force-push-to-main", "bob", Duration::seconds(30), now)
            .unwrap();
        outcome.drafted.expect("eligibility flip drafts").id
    }

    #[test]
    fn eligibility_flip_creates_draft_once() {
        let engine = engine();
        let now = at("2026-08-23T10:00:00Z");
        let id = eligible_draft(&engine, now);
        assert_eq!(id.as_str(), "cns-git-force-push-to-main");

        let observation = engine.observation("git-force-push-to-main").unwrap();
        assert_eq!(observation.constraint_id, Some(id.clone()));

        // Further confirmations do not draft again.
        let outcome = engine
            .confirm("git-force-push-to-main", "carol", Duration::seconds(30), now)
            .unwrap();
        assert!(outcome.drafted.is_none());
    }

    #[test]
    fn sources_gate_blocks_single_origin_failures() {
        let engine = engine();
        let now = at("2026-08-23T10:00:00Z");
        // Three recurrences, but all from the same source/session/user.
        for _ in 0..3 {
            engine
                .record_failure(
                    failure("flaky dns in ci", "ci.rs:1", "alice"),
                    ObservationKind::Failure,
                    Severity::Minor,
                    now,
                )
                .unwrap();
        }
        engine
            .confirm("flaky-dns-in-ci", "alice", Duration::seconds(30), now)
            .unwrap();
        let outcome = engine
            .confirm("flaky-dns-in-ci", "bob", Duration::seconds(30), now)
            .unwrap();
        assert!(outcome.drafted.is_none());
        assert!(!outcome.eligibility.sources_met);
    }

    #[test]
    fn blocked_action_allows_override_then_consumes_it() {
        let engine = engine();
        let now = at("2026-08-23T10:00:00Z");
        let id = eligible_draft(&engine, now);
        engine.activate(&id, "alice", now).unwrap();

        for i in 0..5 {
            engine
                .report_violation(&id, &format!("push-{i}"), now + Duration::minutes(i))
                .unwrap();
        }
        let later = now + Duration::hours(1);
        let err = engine.check_action(&id, later).unwrap_err();
        assert!(matches!(
            err,
            SentinelError::Circuit(CircuitError::ThresholdBlocked { .. })
        ));

        engine
            .emergency_override(&id, "carol", "hotfix window", Duration::hours(1), true, later)
            .unwrap();
        let check = engine.check_action(&id, later).unwrap();
        assert!(matches!(check, ActionCheck::AllowedByOverride { ref approver } if approver == "carol"));

        // Single-use: the spent override no longer authorizes anything.
        let err = engine.check_action(&id, later).unwrap_err();
        assert!(matches!(
            err,
            SentinelError::Governance(GovernanceError::RecoveryExpired { .. })
        ));
    }

    #[test]
    fn expired_override_reports_recovery_expired() {
        let engine = engine();
        let now = at("2026-08-23T10:00:00Z");
        let id = eligible_draft(&engine, now);
        engine.activate(&id, "alice", now).unwrap();
        for i in 0..5 {
            engine
                .report_violation(&id, &format!("push-{i}"), now + Duration::minutes(i))
                .unwrap();
        }

        engine
            .emergency_override(&id, "carol", "hotfix window", Duration::minutes(10), false, now)
            .unwrap();
        let err = engine
            .check_action(&id, now + Duration::hours(1))
            .unwrap_err();
        assert!(matches!(
            err,
            SentinelError::Governance(GovernanceError::RecoveryExpired { .. })
        ));
    }

    #[test]
    fn reset_circuit_appends_audit_entry() {
        let engine = engine();
        let now = at("2026-08-23T10:00:00Z");
        let id = eligible_draft(&engine, now);
        engine.activate(&id, "alice", now).unwrap();
        for i in 0..5 {
            engine
                .report_violation(&id, &format!("push-{i}"), now + Duration::minutes(i))
                .unwrap();
        }

        let state = engine
            .reset_circuit(&id, "ops", "confirmed false positives", now + Duration::hours(1))
            .unwrap();
        assert!(state.violations.is_empty());

        let constraint = engine.constraint(&id).unwrap();
        let last = constraint.audit_log.last().unwrap();
        assert_eq!(last.action, "circuit_reset");
        assert_eq!(last.reason.as_deref(), Some("confirmed false positives"));
    }

    #[test]
    fn retiring_constraint_warns_instead_of_blocking() {
        let engine = engine();
        let now = at("2026-08-23T10:00:00Z");
        let id = eligible_draft(&engine, now);
        engine.activate(&id, "alice", now).unwrap();
        engine.retire(&id, "alice", None, now).unwrap();

        for i in 0..5 {
            let outcome = engine
                .report_violation(&id, &format!("push-{i}"), now + Duration::minutes(i))
                .unwrap();
            assert!(matches!(outcome, ViolationOutcome::Warned(_)));
        }
        // Even with the circuit tripped, a retiring constraint never refuses.
        let check = engine.check_action(&id, now + Duration::hours(1)).unwrap();
        assert!(matches!(check, ActionCheck::Allowed));
    }

    #[test]
    fn violations_against_drafts_are_ignored() {
        let engine = engine();
        let now = at("2026-08-23T10:00:00Z");
        let id = eligible_draft(&engine, now);

        let outcome = engine.report_violation(&id, "push-1", now).unwrap();
        assert!(matches!(outcome, ViolationOutcome::NotEnforced));
        let check = engine.check_action(&id, now).unwrap();
        assert!(matches!(check, ActionCheck::NotEnforced));
    }

    #[test]
    fn invalid_config_rejected() {
        let config = EngineConfig {
            lock_ttl_secs: 0,
            ..EngineConfig::default()
        };
        let err = Engine::with_store(
            config,
            Arc::new(MemStateStore::new()),
            Arc::new(ExactSimilarity),
            None,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SentinelError::Engine(EngineError::InvalidConfig { .. })
        ));
    }
}
