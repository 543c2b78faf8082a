//! Constraint lifecycle state machine.
//!
//! A constraint is an enforceable rule derived from an eligible observation.
//! Its state moves only along a fixed transition table; every transition
//! carries an actor and appends to an immutable audit log. Constraint
//! documents live under `constraints/<state>/<id>.json` and are moved between
//! state directories on transition.
//!
//! Side effects owned here:
//! - entering `active` or `retiring` ensures a CLOSED circuit exists,
//! - entering `retired` archives the circuit and invalidates all overrides.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::circuit::CircuitBreaker;
use crate::error::LifecycleError;
use crate::observation::{EvidenceTier, Observation};
use crate::store::{StateStore, get_doc, put_doc};

/// Result type for lifecycle operations.
pub type LifecycleResult<T> = std::result::Result<T, LifecycleError>;

const OVERRIDES_KEY: &str = ".overrides.json";

// ---------------------------------------------------------------------------
// Identifiers and severity
// ---------------------------------------------------------------------------

/// Identifier of a constraint: `cns-` plus the source observation's slug.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ConstraintId(String);

impl ConstraintId {
    pub fn from_slug(slug: &str) -> Self {
        Self(format!("cns-{slug}"))
    }

    /// Wrap an already-formed `cns-...` identifier.
    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConstraintId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How bad violating the constraint is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Critical,
    Important,
    Minor,
}

impl Severity {
    /// Initial severity for a drafted constraint, from the evidence tier of
    /// its source observation.
    pub fn from_tier(tier: EvidenceTier) -> Self {
        match tier {
            EvidenceTier::Established => Self::Critical,
            EvidenceTier::Strong => Self::Important,
            EvidenceTier::Weak | EvidenceTier::Emerging => Self::Minor,
        }
    }
}

// ---------------------------------------------------------------------------
// States and transitions
// ---------------------------------------------------------------------------

/// Lifecycle state. `retired` and `deleted` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintState {
    Draft,
    Active,
    Retiring,
    Retired,
    Deleted,
}

impl ConstraintState {
    /// Directory segment under `constraints/`.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Retiring => "retiring",
            Self::Retired => "retired",
            Self::Deleted => "deleted",
        }
    }

    /// Transitions legal from this state.
    pub fn allowed_transitions(&self) -> &'static [TransitionKind] {
        match self {
            Self::Draft => &[TransitionKind::Activate, TransitionKind::Delete],
            Self::Active => &[
                TransitionKind::Retire,
                TransitionKind::EmergencyRetire,
                TransitionKind::Rollback,
            ],
            Self::Retiring => &[TransitionKind::CompleteRetire, TransitionKind::Reactivate],
            Self::Retired | Self::Deleted => &[],
        }
    }

    /// How actions are checked against a constraint in this state.
    pub fn enforcement(&self) -> Enforcement {
        match self {
            Self::Active => Enforcement::Block,
            Self::Retiring => Enforcement::Warn,
            Self::Draft | Self::Retired | Self::Deleted => Enforcement::None,
        }
    }

    fn parse_dir(segment: &str) -> Option<Self> {
        match segment {
            "draft" => Some(Self::Draft),
            "active" => Some(Self::Active),
            "retiring" => Some(Self::Retiring),
            "retired" => Some(Self::Retired),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

impl fmt::Display for ConstraintState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Enforcement semantics of a lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enforcement {
    /// Violating actions are refused.
    Block,
    /// Violations are logged and recorded but not refused.
    Warn,
    /// The constraint is never evaluated against actions.
    None,
}

/// A named edge in the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Activate,
    Delete,
    Retire,
    EmergencyRetire,
    Rollback,
    CompleteRetire,
    Reactivate,
}

impl TransitionKind {
    /// State the edge leaves from.
    pub fn from_state(&self) -> ConstraintState {
        match self {
            Self::Activate | Self::Delete => ConstraintState::Draft,
            Self::Retire | Self::EmergencyRetire | Self::Rollback => ConstraintState::Active,
            Self::CompleteRetire | Self::Reactivate => ConstraintState::Retiring,
        }
    }

    /// State the edge arrives at.
    pub fn to_state(&self) -> ConstraintState {
        match self {
            Self::Activate | Self::Reactivate => ConstraintState::Active,
            Self::Delete => ConstraintState::Deleted,
            Self::Retire => ConstraintState::Retiring,
            Self::EmergencyRetire | Self::CompleteRetire => ConstraintState::Retired,
            Self::Rollback => ConstraintState::Draft,
        }
    }

    /// Destructive shortcuts must carry a non-empty reason.
    pub fn requires_reason(&self) -> bool {
        matches!(self, Self::EmergencyRetire | Self::Rollback)
    }

    /// Audit-log action name.
    pub fn action_name(&self) -> &'static str {
        match self {
            Self::Activate => "activate",
            Self::Delete => "delete",
            Self::Retire => "retire",
            Self::EmergencyRetire => "emergency_retire",
            Self::Rollback => "rollback",
            Self::CompleteRetire => "complete_retire",
            Self::Reactivate => "reactivate",
        }
    }
}

// ---------------------------------------------------------------------------
// Constraint record
// ---------------------------------------------------------------------------

/// One append-only entry in a constraint's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub from_state: Option<ConstraintState>,
    pub to_state: ConstraintState,
    pub reason: Option<String>,
}

/// An enforceable rule derived from an observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub id: ConstraintId,
    /// What the constraint forbids, in operator-facing text.
    pub scope_text: String,
    pub severity: Severity,
    pub state: ConstraintState,
    /// Slug of the observation this constraint was derived from.
    pub source_observation_id: String,
    /// Bumped on every mutation, including audit-only appends.
    pub version: u32,
    pub audit_log: Vec<AuditEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Constraint {
    /// When the constraint last entered `active`, from the audit log.
    pub fn activated_at(&self) -> Option<DateTime<Utc>> {
        self.audit_log
            .iter()
            .rev()
            .find(|e| e.to_state == ConstraintState::Active)
            .map(|e| e.timestamp)
    }
}

/// Time-boxed emergency bypass of an OPEN circuit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Override {
    pub constraint_id: ConstraintId,
    pub approver: String,
    pub reason: String,
    pub expires_at: DateTime<Utc>,
    pub single_use: bool,
    pub used: bool,
}

impl Override {
    /// Whether the override can still authorize an action at `now`.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at && !(self.single_use && self.used)
    }
}

// ---------------------------------------------------------------------------
// Lifecycle machine
// ---------------------------------------------------------------------------

/// Owns constraint state, the audit trail, and the override table.
pub struct LifecycleMachine {
    store: Arc<dyn StateStore>,
    breaker: Arc<CircuitBreaker>,
    /// id -> current state, rebuilt from the store layout at open.
    index: DashMap<String, ConstraintState>,
}

impl LifecycleMachine {
    /// Open the machine, indexing constraints from `constraints/<state>/`.
    pub fn open(
        store: Arc<dyn StateStore>,
        breaker: Arc<CircuitBreaker>,
    ) -> LifecycleResult<Self> {
        let index = DashMap::new();
        for key in store.list("constraints/")? {
            let mut parts = key.trim_start_matches("constraints/").split('/');
            let Some(state) = parts.next().and_then(ConstraintState::parse_dir) else {
                continue;
            };
            let Some(id) = parts.next().and_then(|f| f.strip_suffix(".json")) else {
                continue;
            };
            index.insert(id.to_string(), state);
        }
        Ok(Self {
            store,
            breaker,
            index,
        })
    }

    /// Create a `draft` constraint from an eligible observation.
    ///
    /// At most one constraint per observation, ever.
    pub fn create_draft(
        &self,
        obs: &Observation,
        scope_text: String,
        severity: Severity,
        actor: &str,
        now: DateTime<Utc>,
    ) -> LifecycleResult<Constraint> {
        let id = ConstraintId::from_slug(&obs.slug);
        if obs.constraint_id.is_some() || self.index.contains_key(id.as_str()) {
            return Err(LifecycleError::DuplicateConstraint {
                slug: obs.slug.clone(),
                constraint_id: id.to_string(),
            });
        }

        let constraint = Constraint {
            id: id.clone(),
            scope_text,
            severity,
            state: ConstraintState::Draft,
            source_observation_id: obs.slug.clone(),
            version: 1,
            audit_log: vec![AuditEntry {
                timestamp: now,
                actor: actor.to_string(),
                action: "create".to_string(),
                from_state: None,
                to_state: ConstraintState::Draft,
                reason: None,
            }],
            created_at: now,
            updated_at: now,
        };

        self.persist(&constraint)?;
        self.index
            .insert(id.as_str().to_string(), ConstraintState::Draft);
        tracing::info!(constraint_id = %id, slug = %obs.slug, "draft constraint created");
        Ok(constraint)
    }

    /// Apply a transition from the lifecycle table.
    ///
    /// Moves the document between state directories, appends the audit entry,
    /// and runs the circuit/override side effects of the target state.
    pub fn transition(
        &self,
        id: &ConstraintId,
        kind: TransitionKind,
        actor: &str,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> LifecycleResult<Constraint> {
        let mut constraint = self.get(id)?;
        let from = constraint.state;

        if kind.from_state() != from {
            let allowed = from
                .allowed_transitions()
                .iter()
                .map(|t| t.action_name())
                .collect::<Vec<_>>()
                .join(", ");
            return Err(LifecycleError::InvalidTransition {
                constraint_id: id.to_string(),
                from: from.to_string(),
                attempted: kind.action_name().to_string(),
                allowed: if allowed.is_empty() {
                    "(none)".to_string()
                } else {
                    allowed
                },
            });
        }

        let reason = reason.map(str::trim).filter(|r| !r.is_empty());
        if kind.requires_reason() && reason.is_none() {
            return Err(LifecycleError::ReasonRequired {
                constraint_id: id.to_string(),
                action: kind.action_name().to_string(),
            });
        }

        let to = kind.to_state();
        constraint.state = to;
        constraint.version += 1;
        constraint.updated_at = now;
        constraint.audit_log.push(AuditEntry {
            timestamp: now,
            actor: actor.to_string(),
            action: kind.action_name().to_string(),
            from_state: Some(from),
            to_state: to,
            reason: reason.map(str::to_string),
        });

        // Write to the new location first, remove the old one after.
        self.persist(&constraint)?;
        self.store.remove(&Self::key(id, from))?;
        self.index.insert(id.as_str().to_string(), to);

        match to {
            ConstraintState::Active | ConstraintState::Retiring => {
                self.breaker.ensure_enforced(id.as_str())?;
            }
            ConstraintState::Retired => {
                self.breaker.archive(id.as_str())?;
                self.invalidate_overrides(id)?;
            }
            _ => {}
        }

        tracing::info!(
            constraint_id = %id,
            action = kind.action_name(),
            from = %from,
            to = %to,
            actor,
            "constraint transitioned"
        );
        Ok(constraint)
    }

    /// Append an audit entry without a state change (e.g. a circuit reset).
    pub fn append_audit(
        &self,
        id: &ConstraintId,
        actor: &str,
        action: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> LifecycleResult<Constraint> {
        let mut constraint = self.get(id)?;
        constraint.version += 1;
        constraint.updated_at = now;
        constraint.audit_log.push(AuditEntry {
            timestamp: now,
            actor: actor.to_string(),
            action: action.to_string(),
            from_state: Some(constraint.state),
            to_state: constraint.state,
            reason: Some(reason.to_string()),
        });
        self.persist(&constraint)?;
        Ok(constraint)
    }

    /// Look up a constraint by ID.
    pub fn get(&self, id: &ConstraintId) -> LifecycleResult<Constraint> {
        let state = self
            .index
            .get(id.as_str())
            .map(|r| *r.value())
            .ok_or_else(|| LifecycleError::NotFound {
                constraint_id: id.to_string(),
            })?;
        get_doc(self.store.as_ref(), &Self::key(id, state))?.ok_or_else(|| {
            LifecycleError::NotFound {
                constraint_id: id.to_string(),
            }
        })
    }

    /// All constraints currently in the given state.
    pub fn by_state(&self, state: ConstraintState) -> LifecycleResult<Vec<Constraint>> {
        let mut out = Vec::new();
        for entry in self.index.iter().filter(|e| *e.value() == state) {
            out.push(self.get(&ConstraintId::from_raw(entry.key().clone()))?);
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    /// All constraints in any state.
    pub fn all(&self) -> LifecycleResult<Vec<Constraint>> {
        let mut out = Vec::new();
        for entry in self.index.iter() {
            let state = *entry.value();
            let key = format!("constraints/{}/{}.json", state.dir_name(), entry.key());
            if let Some(constraint) = get_doc::<Constraint>(self.store.as_ref(), &key)? {
                out.push(constraint);
            }
        }
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Overrides
    // -----------------------------------------------------------------------

    /// Record an emergency override, replacing any previous one.
    pub fn put_override(&self, over: Override) -> LifecycleResult<()> {
        let mut table = self.load_overrides()?;
        table.insert(over.constraint_id.to_string(), over);
        self.save_overrides(&table)
    }

    /// The current override for a constraint, if any.
    pub fn get_override(&self, id: &ConstraintId) -> LifecycleResult<Option<Override>> {
        Ok(self.load_overrides()?.get(id.as_str()).cloned())
    }

    /// Consume a valid override for one action.
    ///
    /// Marks single-use overrides as used. Returns the override that
    /// authorized the action, or `None` when no valid override exists.
    pub fn consume_override(
        &self,
        id: &ConstraintId,
        now: DateTime<Utc>,
    ) -> LifecycleResult<Option<Override>> {
        let mut table = self.load_overrides()?;
        let Some(over) = table.get_mut(id.as_str()) else {
            return Ok(None);
        };
        if !over.is_valid(now) {
            return Ok(None);
        }
        if over.single_use {
            over.used = true;
        }
        let consumed = over.clone();
        self.save_overrides(&table)?;
        Ok(Some(consumed))
    }

    fn invalidate_overrides(&self, id: &ConstraintId) -> LifecycleResult<()> {
        let mut table = self.load_overrides()?;
        if table.remove(id.as_str()).is_some() {
            self.save_overrides(&table)?;
            tracing::info!(constraint_id = %id, "overrides invalidated on retirement");
        }
        Ok(())
    }

    fn load_overrides(&self) -> LifecycleResult<BTreeMap<String, Override>> {
        Ok(get_doc(self.store.as_ref(), OVERRIDES_KEY)?.unwrap_or_default())
    }

    fn save_overrides(&self, table: &BTreeMap<String, Override>) -> LifecycleResult<()> {
        put_doc(self.store.as_ref(), OVERRIDES_KEY, table)?;
        Ok(())
    }

    fn persist(&self, constraint: &Constraint) -> LifecycleResult<()> {
        put_doc(
            self.store.as_ref(),
            &Self::key(&constraint.id, constraint.state),
            constraint,
        )?;
        Ok(())
    }

    fn key(id: &ConstraintId, state: ConstraintState) -> String {
        format!("constraints/{}/{}.json", state.dir_name(), id)
    }
}

impl std::fmt::Debug for LifecycleMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleMachine")
            .field("constraints", &self.index.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::{BreakerState, CircuitConfig};
    use crate::evidence::EvidenceId;
    use crate::observation::ObservationKind;
    use crate::store::MemStateStore;
    use chrono::Duration;
    use std::collections::BTreeSet;

    fn observation(slug: &str) -> Observation {
        let now = Utc::now();
        Observation {
            slug: slug.into(),
            kind: ObservationKind::Failure,
            description: "git force push to main".into(),
            r_count: 3,
            c_count: 2,
            d_count: 0,
            c_unique_users: BTreeSet::from(["alice".into(), "bob".into()]),
            sources: BTreeSet::from(["a|s1|2026-08-01".into(), "b|s2|2026-08-02".into()]),
            tier: EvidenceTier::Strong,
            created_at: now,
            updated_at: now,
            constraint_id: None,
            evidence: vec![EvidenceId::new(1), EvidenceId::new(2), EvidenceId::new(3)],
        }
    }

    fn machine() -> (LifecycleMachine, Arc<CircuitBreaker>, Arc<MemStateStore>) {
        let store = Arc::new(MemStateStore::new());
        let breaker = Arc::new(CircuitBreaker::new(
            store.clone(),
            CircuitConfig::default(),
            BTreeMap::new(),
        ));
        let machine = LifecycleMachine::open(store.clone(), breaker.clone()).unwrap();
        (machine, breaker, store)
    }

    fn drafted(machine: &LifecycleMachine) -> ConstraintId {
        let constraint = machine
            .create_draft(
                &observation("git-force-push"),
                "never force-push to main".into(),
                Severity::Important,
                "alice",
                Utc::now(),
            )
            .unwrap();
        constraint.id
    }

    #[test]
    fn create_draft_writes_audit_and_file() {
        let (machine, _, store) = machine();
        let id = drafted(&machine);

        let constraint = machine.get(&id).unwrap();
        assert_eq!(constraint.state, ConstraintState::Draft);
        assert_eq!(constraint.version, 1);
        assert_eq!(constraint.audit_log.len(), 1);
        assert_eq!(constraint.audit_log[0].action, "create");
        assert_eq!(constraint.audit_log[0].from_state, None);
        assert!(
            store
                .get("constraints/draft/cns-git-force-push.json")
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn duplicate_constraint_rejected() {
        let (machine, _, _) = machine();
        drafted(&machine);
        let err = machine
            .create_draft(
                &observation("git-force-push"),
                "again".into(),
                Severity::Minor,
                "bob",
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, LifecycleError::DuplicateConstraint { .. }));
    }

    #[test]
    fn activation_moves_file_and_creates_circuit() {
        let (machine, breaker, store) = machine();
        let id = drafted(&machine);

        let constraint = machine
            .transition(&id, TransitionKind::Activate, "alice", None, Utc::now())
            .unwrap();
        assert_eq!(constraint.state, ConstraintState::Active);
        assert_eq!(constraint.version, 2);
        assert!(
            store
                .get("constraints/draft/cns-git-force-push.json")
                .unwrap()
                .is_none()
        );
        assert!(
            store
                .get("constraints/active/cns-git-force-push.json")
                .unwrap()
                .is_some()
        );

        let circuit = breaker.get(id.as_str()).unwrap().unwrap();
        assert_eq!(circuit.state, BreakerState::Closed);
    }

    #[test]
    fn every_off_table_transition_fails() {
        let (machine, _, _) = machine();
        let id = drafted(&machine);
        let now = Utc::now();

        let all = [
            TransitionKind::Activate,
            TransitionKind::Delete,
            TransitionKind::Retire,
            TransitionKind::EmergencyRetire,
            TransitionKind::Rollback,
            TransitionKind::CompleteRetire,
            TransitionKind::Reactivate,
        ];

        // Walk the happy path, checking closure at each state.
        for kind in [
            TransitionKind::Activate,
            TransitionKind::Retire,
            TransitionKind::CompleteRetire,
        ] {
            let from = machine.get(&id).unwrap().state;
            for attempted in all {
                if from.allowed_transitions().contains(&attempted) {
                    continue;
                }
                let err = machine
                    .transition(&id, attempted, "alice", Some("reason"), now)
                    .unwrap_err();
                assert!(
                    matches!(err, LifecycleError::InvalidTransition { .. }),
                    "{attempted:?} from {from} must be invalid"
                );
            }
            machine
                .transition(&id, kind, "alice", Some("reason"), now)
                .unwrap();
        }

        // Retired is terminal.
        for attempted in all {
            let err = machine
                .transition(&id, attempted, "alice", Some("reason"), now)
                .unwrap_err();
            assert!(matches!(err, LifecycleError::InvalidTransition { .. }));
        }
    }

    #[test]
    fn emergency_retire_and_rollback_require_reason() {
        let (machine, _, _) = machine();
        let id = drafted(&machine);
        machine
            .transition(&id, TransitionKind::Activate, "alice", None, Utc::now())
            .unwrap();

        for kind in [TransitionKind::EmergencyRetire, TransitionKind::Rollback] {
            let err = machine
                .transition(&id, kind, "alice", None, Utc::now())
                .unwrap_err();
            assert!(matches!(err, LifecycleError::ReasonRequired { .. }));

            let err = machine
                .transition(&id, kind, "alice", Some("   "), Utc::now())
                .unwrap_err();
            assert!(matches!(err, LifecycleError::ReasonRequired { .. }));
        }
    }

    #[test]
    fn retirement_archives_circuit_and_invalidates_overrides() {
        let (machine, breaker, _) = machine();
        let id = drafted(&machine);
        let now = Utc::now();
        machine
            .transition(&id, TransitionKind::Activate, "alice", None, now)
            .unwrap();
        breaker.record(id.as_str(), "push-1", now).unwrap();
        machine
            .put_override(Override {
                constraint_id: id.clone(),
                approver: "carol".into(),
                reason: "hotfix window".into(),
                expires_at: now + Duration::hours(1),
                single_use: true,
                used: false,
            })
            .unwrap();

        machine
            .transition(&id, TransitionKind::Retire, "alice", None, now)
            .unwrap();
        machine
            .transition(&id, TransitionKind::CompleteRetire, "alice", None, now)
            .unwrap();

        assert!(breaker.get(id.as_str()).unwrap().is_none());
        let archived = breaker.archived(id.as_str()).unwrap().unwrap();
        assert_eq!(archived.violations.len(), 1);
        assert!(machine.get_override(&id).unwrap().is_none());
    }

    #[test]
    fn rollback_returns_to_draft_with_audit() {
        let (machine, _, _) = machine();
        let id = drafted(&machine);
        machine
            .transition(&id, TransitionKind::Activate, "alice", None, Utc::now())
            .unwrap();

        let constraint = machine
            .transition(
                &id,
                TransitionKind::Rollback,
                "bob",
                Some("scope text too broad"),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(constraint.state, ConstraintState::Draft);
        assert_eq!(constraint.version, 3);
        let last = constraint.audit_log.last().unwrap();
        assert_eq!(last.action, "rollback");
        assert_eq!(last.reason.as_deref(), Some("scope text too broad"));
    }

    #[test]
    fn single_use_override_consumed_once() {
        let (machine, _, _) = machine();
        let id = drafted(&machine);
        let now = Utc::now();
        machine
            .put_override(Override {
                constraint_id: id.clone(),
                approver: "carol".into(),
                reason: "hotfix".into(),
                expires_at: now + Duration::hours(1),
                single_use: true,
                used: false,
            })
            .unwrap();

        assert!(machine.consume_override(&id, now).unwrap().is_some());
        assert!(machine.consume_override(&id, now).unwrap().is_none());
    }

    #[test]
    fn expired_override_is_invalid() {
        let (machine, _, _) = machine();
        let id = drafted(&machine);
        let now = Utc::now();
        machine
            .put_override(Override {
                constraint_id: id.clone(),
                approver: "carol".into(),
                reason: "hotfix".into(),
                expires_at: now - Duration::seconds(1),
                single_use: false,
                used: false,
            })
            .unwrap();
        assert!(machine.consume_override(&id, now).unwrap().is_none());
    }

    #[test]
    fn index_rebuilt_from_store_layout() {
        let store = Arc::new(MemStateStore::new());
        let breaker = Arc::new(CircuitBreaker::new(
            store.clone(),
            CircuitConfig::default(),
            BTreeMap::new(),
        ));
        let id;
        {
            let machine = LifecycleMachine::open(store.clone(), breaker.clone()).unwrap();
            id = drafted(&machine);
            machine
                .transition(&id, TransitionKind::Activate, "alice", None, Utc::now())
                .unwrap();
        }

        let machine = LifecycleMachine::open(store, breaker).unwrap();
        let constraint = machine.get(&id).unwrap();
        assert_eq!(constraint.state, ConstraintState::Active);
        assert_eq!(machine.by_state(ConstraintState::Active).unwrap().len(), 1);
    }

    #[test]
    fn severity_from_tier() {
        assert_eq!(Severity::from_tier(EvidenceTier::Established), Severity::Critical);
        assert_eq!(Severity::from_tier(EvidenceTier::Strong), Severity::Important);
        assert_eq!(Severity::from_tier(EvidenceTier::Emerging), Severity::Minor);
        assert_eq!(Severity::from_tier(EvidenceTier::Weak), Severity::Minor);
    }
}
