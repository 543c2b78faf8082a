//! Per-constraint circuit breaker.
//!
//! Every enforced constraint (active or retiring) carries a breaker that
//! tracks violations in a trailing rolling window. Too many violations trip
//! the breaker OPEN: further actions are blocked until the cooldown elapses,
//! after which the first check probes HALF_OPEN. A clean probe closes the
//! circuit; a violating probe re-opens it with a fresh cooldown.
//!
//! All window math works on wall-clock timestamps stored with each event, so
//! trips and cooldowns survive restarts. The breaker never retries anything:
//! dedup and HALF_OPEN probing are deterministic state transitions.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CircuitError;
use crate::store::{StateStore, get_doc, put_doc};

/// Result type for circuit operations.
pub type CircuitResult<T> = std::result::Result<T, CircuitError>;

const LIVE_KEY: &str = ".circuit-state.json";
const ARCHIVE_KEY: &str = ".circuit-state-archive.json";

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// One recorded violation of a constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub timestamp: DateTime<Utc>,
    pub action_ref: String,
}

/// Runtime violation state for one enforced constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitState {
    pub constraint_id: String,
    pub state: BreakerState,
    pub violations: Vec<Violation>,
    /// Every time the breaker tripped OPEN; drives the trip-frequency alert.
    pub trips: Vec<DateTime<Utc>>,
    pub tripped_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl CircuitState {
    fn closed(constraint_id: &str) -> Self {
        Self {
            constraint_id: constraint_id.to_string(),
            state: BreakerState::Closed,
            violations: Vec::new(),
            trips: Vec::new(),
            tripped_at: None,
            cooldown_until: None,
        }
    }

    /// Violations inside the trailing window ending at `now`.
    pub fn violations_in_window(&self, now: DateTime<Utc>, window: Duration) -> usize {
        let cutoff = now - window;
        self.violations
            .iter()
            .filter(|v| v.timestamp > cutoff)
            .count()
    }

    /// Trips inside the trailing window ending at `now`.
    pub fn trips_in_window(&self, now: DateTime<Utc>, window: Duration) -> usize {
        let cutoff = now - window;
        self.trips.iter().filter(|t| **t > cutoff).count()
    }
}

/// Breaker thresholds. System defaults, per-constraint-overridable.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Violations inside the rolling window that trip the breaker.
    pub trip_threshold: u32,
    /// Rolling window length in days.
    pub window_days: i64,
    /// Cooldown after a trip, in hours.
    pub cooldown_hours: i64,
    /// Identical `action_ref`s inside this many minutes count once.
    pub dedup_minutes: i64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            trip_threshold: 5,
            window_days: 30,
            cooldown_hours: 24,
            dedup_minutes: 5,
        }
    }
}

impl CircuitConfig {
    pub fn window(&self) -> Duration {
        Duration::days(self.window_days)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::hours(self.cooldown_hours)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::minutes(self.dedup_minutes)
    }
}

/// Outcome of a pre-action check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckDecision {
    Allowed,
    Blocked { cooldown_remaining_secs: i64 },
}

// ---------------------------------------------------------------------------
// Breaker
// ---------------------------------------------------------------------------

/// Manages the circuit map at `.circuit-state.json` and its archive.
pub struct CircuitBreaker {
    store: Arc<dyn StateStore>,
    defaults: CircuitConfig,
    overrides: BTreeMap<String, CircuitConfig>,
}

impl CircuitBreaker {
    pub fn new(
        store: Arc<dyn StateStore>,
        defaults: CircuitConfig,
        overrides: BTreeMap<String, CircuitConfig>,
    ) -> Self {
        Self {
            store,
            defaults,
            overrides,
        }
    }

    /// Effective config for a constraint: per-constraint override or defaults.
    pub fn config_for(&self, constraint_id: &str) -> CircuitConfig {
        self.overrides
            .get(constraint_id)
            .copied()
            .unwrap_or(self.defaults)
    }

    /// Create a CLOSED circuit for a newly enforced constraint, if absent.
    pub fn ensure_enforced(&self, constraint_id: &str) -> CircuitResult<CircuitState> {
        let mut live = self.load_live()?;
        let state = live
            .entry(constraint_id.to_string())
            .or_insert_with(|| CircuitState::closed(constraint_id))
            .clone();
        self.save_live(&live)?;
        Ok(state)
    }

    /// Current circuit state, if the constraint is enforced.
    pub fn get(&self, constraint_id: &str) -> CircuitResult<Option<CircuitState>> {
        Ok(self.load_live()?.get(constraint_id).cloned())
    }

    /// All live circuit states.
    pub fn all(&self) -> CircuitResult<Vec<CircuitState>> {
        Ok(self.load_live()?.into_values().collect())
    }

    /// Pre-action check.
    ///
    /// OPEN blocks until the cooldown elapses; the first check afterwards
    /// moves to HALF_OPEN and allows a single probe. CLOSED and HALF_OPEN
    /// always allow.
    pub fn check(&self, constraint_id: &str, now: DateTime<Utc>) -> CircuitResult<CheckDecision> {
        let mut live = self.load_live()?;
        let circuit = live
            .get_mut(constraint_id)
            .ok_or_else(|| CircuitError::NotFound {
                constraint_id: constraint_id.to_string(),
            })?;

        match circuit.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(CheckDecision::Allowed),
            BreakerState::Open => {
                let cooldown_until = circuit.cooldown_until.unwrap_or(now);
                if now >= cooldown_until {
                    circuit.state = BreakerState::HalfOpen;
                    circuit.cooldown_until = None;
                    tracing::info!(constraint_id, "cooldown elapsed, probing HALF_OPEN");
                    self.save_live(&live)?;
                    Ok(CheckDecision::Allowed)
                } else {
                    Ok(CheckDecision::Blocked {
                        cooldown_remaining_secs: (cooldown_until - now).num_seconds(),
                    })
                }
            }
        }
    }

    /// Record a violation.
    ///
    /// Identical `action_ref`s inside the dedup window count once. Reaching
    /// the trip threshold inside the rolling window while CLOSED trips the
    /// breaker; any violation while HALF_OPEN re-opens it immediately.
    pub fn record(
        &self,
        constraint_id: &str,
        action_ref: &str,
        now: DateTime<Utc>,
    ) -> CircuitResult<CircuitState> {
        let config = self.config_for(constraint_id);
        let mut live = self.load_live()?;
        let circuit = live
            .get_mut(constraint_id)
            .ok_or_else(|| CircuitError::NotFound {
                constraint_id: constraint_id.to_string(),
            })?;

        let duplicate = circuit.violations.iter().any(|v| {
            v.action_ref == action_ref && (now - v.timestamp) < config.dedup_window()
        });
        if duplicate {
            tracing::debug!(constraint_id, action_ref, "violation deduplicated");
            return Ok(circuit.clone());
        }

        circuit.violations.push(Violation {
            timestamp: now,
            action_ref: action_ref.to_string(),
        });
        // Drop events that can no longer affect the window or dedup.
        let cutoff = now - config.window();
        circuit.violations.retain(|v| v.timestamp > cutoff);

        let in_window = circuit.violations_in_window(now, config.window());
        match circuit.state {
            BreakerState::Closed if in_window as u32 >= config.trip_threshold => {
                trip(circuit, now, config.cooldown());
                tracing::warn!(
                    constraint_id,
                    violations = in_window,
                    threshold = config.trip_threshold,
                    "circuit tripped OPEN"
                );
            }
            BreakerState::HalfOpen => {
                trip(circuit, now, config.cooldown());
                tracing::warn!(constraint_id, "violation during HALF_OPEN probe, re-opening");
            }
            _ => {}
        }

        let state = circuit.clone();
        self.save_live(&live)?;
        Ok(state)
    }

    /// Record a non-violating action. A successful HALF_OPEN probe closes
    /// the circuit and clears the violation window.
    pub fn record_success(
        &self,
        constraint_id: &str,
        now: DateTime<Utc>,
    ) -> CircuitResult<CircuitState> {
        let mut live = self.load_live()?;
        let circuit = live
            .get_mut(constraint_id)
            .ok_or_else(|| CircuitError::NotFound {
                constraint_id: constraint_id.to_string(),
            })?;

        if circuit.state == BreakerState::HalfOpen {
            circuit.state = BreakerState::Closed;
            circuit.violations.clear();
            circuit.tripped_at = None;
            circuit.cooldown_until = None;
            tracing::info!(constraint_id, at = %now, "HALF_OPEN probe succeeded, circuit CLOSED");
        }

        let state = circuit.clone();
        self.save_live(&live)?;
        Ok(state)
    }

    /// Manual reset to CLOSED. Requires a non-empty reason; the caller must
    /// append the matching audit entry on the owning constraint.
    pub fn reset(
        &self,
        constraint_id: &str,
        actor: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> CircuitResult<CircuitState> {
        if reason.trim().is_empty() {
            return Err(CircuitError::ReasonRequired {
                constraint_id: constraint_id.to_string(),
            });
        }

        let mut live = self.load_live()?;
        let circuit = live
            .get_mut(constraint_id)
            .ok_or_else(|| CircuitError::NotFound {
                constraint_id: constraint_id.to_string(),
            })?;

        circuit.state = BreakerState::Closed;
        circuit.violations.clear();
        circuit.tripped_at = None;
        circuit.cooldown_until = None;
        tracing::info!(constraint_id, actor, reason, at = %now, "circuit manually reset");

        let state = circuit.clone();
        self.save_live(&live)?;
        Ok(state)
    }

    /// Move a constraint's circuit to the archive store (on retirement).
    ///
    /// The live entry is removed; the archived copy keeps the full violation
    /// history for post-hoc analysis. No-op if the constraint has no circuit.
    pub fn archive(&self, constraint_id: &str) -> CircuitResult<()> {
        let mut live = self.load_live()?;
        let Some(state) = live.remove(constraint_id) else {
            return Ok(());
        };
        self.save_live(&live)?;

        let mut archive: BTreeMap<String, CircuitState> =
            get_doc(self.store.as_ref(), ARCHIVE_KEY)?.unwrap_or_default();
        archive.insert(constraint_id.to_string(), state);
        put_doc(self.store.as_ref(), ARCHIVE_KEY, &archive)?;
        tracing::info!(constraint_id, "circuit archived");
        Ok(())
    }

    /// Archived circuit state, if the constraint was retired.
    pub fn archived(&self, constraint_id: &str) -> CircuitResult<Option<CircuitState>> {
        let archive: BTreeMap<String, CircuitState> =
            get_doc(self.store.as_ref(), ARCHIVE_KEY)?.unwrap_or_default();
        Ok(archive.get(constraint_id).cloned())
    }

    fn load_live(&self) -> CircuitResult<BTreeMap<String, CircuitState>> {
        Ok(get_doc(self.store.as_ref(), LIVE_KEY)?.unwrap_or_default())
    }

    fn save_live(&self, live: &BTreeMap<String, CircuitState>) -> CircuitResult<()> {
        put_doc(self.store.as_ref(), LIVE_KEY, live)?;
        Ok(())
    }
}

fn trip(circuit: &mut CircuitState, now: DateTime<Utc>, cooldown: Duration) {
    circuit.state = BreakerState::Open;
    circuit.tripped_at = Some(now);
    circuit.cooldown_until = Some(now + cooldown);
    circuit.trips.push(now);
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("defaults", &self.defaults)
            .field("overrides", &self.overrides.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemStateStore;

    const ID: &str = "cns-git-force-push";

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(
            Arc::new(MemStateStore::new()),
            CircuitConfig::default(),
            BTreeMap::new(),
        )
    }

    fn at(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    #[test]
    fn starts_closed_and_allows() {
        let breaker = breaker();
        let now = at("2026-08-23T10:00:00Z");
        let state = breaker.ensure_enforced(ID).unwrap();
        assert_eq!(state.state, BreakerState::Closed);
        assert_eq!(breaker.check(ID, now).unwrap(), CheckDecision::Allowed);
    }

    #[test]
    fn five_distinct_violations_trip_four_do_not() {
        let breaker = breaker();
        breaker.ensure_enforced(ID).unwrap();
        let base = at("2026-08-23T10:00:00Z");

        for i in 0..4 {
            let state = breaker
                .record(ID, &format!("action-{i}"), base + Duration::minutes(i))
                .unwrap();
            assert_eq!(state.state, BreakerState::Closed, "still closed after {}", i + 1);
        }

        let state = breaker
            .record(ID, "action-4", base + Duration::minutes(4))
            .unwrap();
        assert_eq!(state.state, BreakerState::Open);
        assert_eq!(state.tripped_at, Some(base + Duration::minutes(4)));
        assert_eq!(
            state.cooldown_until,
            Some(base + Duration::minutes(4) + Duration::hours(24))
        );
    }

    #[test]
    fn identical_action_ref_within_dedup_window_counts_once() {
        let breaker = breaker();
        breaker.ensure_enforced(ID).unwrap();
        let base = at("2026-08-23T10:00:00Z");

        breaker.record(ID, "same-action", base).unwrap();
        let state = breaker
            .record(ID, "same-action", base + Duration::minutes(2))
            .unwrap();
        assert_eq!(state.violations.len(), 1, "2 minutes apart: one violation");

        let state = breaker
            .record(ID, "same-action", base + Duration::minutes(10))
            .unwrap();
        assert_eq!(state.violations.len(), 2, "10 minutes apart: two violations");
    }

    #[test]
    fn violations_outside_rolling_window_do_not_trip() {
        let breaker = breaker();
        breaker.ensure_enforced(ID).unwrap();
        let base = at("2026-01-01T00:00:00Z");

        // Four old violations, then one 40 days later: never five in a window.
        for i in 0..4 {
            breaker
                .record(ID, &format!("old-{i}"), base + Duration::hours(i))
                .unwrap();
        }
        let state = breaker
            .record(ID, "recent", base + Duration::days(40))
            .unwrap();
        assert_eq!(state.state, BreakerState::Closed);
    }

    #[test]
    fn open_blocks_until_cooldown_then_probes_half_open() {
        let breaker = breaker();
        breaker.ensure_enforced(ID).unwrap();
        let base = at("2026-08-23T10:00:00Z");
        for i in 0..5 {
            breaker
                .record(ID, &format!("action-{i}"), base + Duration::minutes(i))
                .unwrap();
        }
        let tripped_at = base + Duration::minutes(4);

        // Before cooldown: blocked, with remaining time reported.
        let decision = breaker.check(ID, tripped_at + Duration::hours(1)).unwrap();
        match decision {
            CheckDecision::Blocked {
                cooldown_remaining_secs,
            } => assert_eq!(cooldown_remaining_secs, 23 * 3600),
            CheckDecision::Allowed => panic!("must be blocked during cooldown"),
        }

        // After cooldown: first check transitions to HALF_OPEN and allows.
        let decision = breaker.check(ID, tripped_at + Duration::hours(25)).unwrap();
        assert_eq!(decision, CheckDecision::Allowed);
        assert_eq!(breaker.get(ID).unwrap().unwrap().state, BreakerState::HalfOpen);
    }

    #[test]
    fn half_open_violation_reopens_with_fresh_cooldown() {
        let breaker = breaker();
        breaker.ensure_enforced(ID).unwrap();
        let base = at("2026-08-23T10:00:00Z");
        for i in 0..5 {
            breaker
                .record(ID, &format!("action-{i}"), base + Duration::minutes(i))
                .unwrap();
        }

        let probe_time = base + Duration::hours(30);
        breaker.check(ID, probe_time).unwrap();
        let state = breaker.record(ID, "probe-violation", probe_time).unwrap();
        assert_eq!(state.state, BreakerState::Open);
        assert_eq!(state.cooldown_until, Some(probe_time + Duration::hours(24)));
        assert_eq!(state.trips.len(), 2);
    }

    #[test]
    fn half_open_success_closes_and_clears_window() {
        let breaker = breaker();
        breaker.ensure_enforced(ID).unwrap();
        let base = at("2026-08-23T10:00:00Z");
        for i in 0..5 {
            breaker
                .record(ID, &format!("action-{i}"), base + Duration::minutes(i))
                .unwrap();
        }

        let probe_time = base + Duration::hours(30);
        breaker.check(ID, probe_time).unwrap();
        let state = breaker.record_success(ID, probe_time).unwrap();
        assert_eq!(state.state, BreakerState::Closed);
        assert!(state.violations.is_empty());
        assert!(state.cooldown_until.is_none());
        // Trip history is preserved for the frequency alert.
        assert_eq!(state.trips.len(), 1);
    }

    #[test]
    fn reset_requires_reason() {
        let breaker = breaker();
        breaker.ensure_enforced(ID).unwrap();
        let now = at("2026-08-23T10:00:00Z");

        let err = breaker.reset(ID, "alice", "  ", now).unwrap_err();
        assert!(matches!(err, CircuitError::ReasonRequired { .. }));

        let state = breaker
            .reset(ID, "alice", "confirmed false positives", now)
            .unwrap();
        assert_eq!(state.state, BreakerState::Closed);
        assert!(state.violations.is_empty());
    }

    #[test]
    fn archive_moves_history_out_of_live() {
        let breaker = breaker();
        breaker.ensure_enforced(ID).unwrap();
        let now = at("2026-08-23T10:00:00Z");
        breaker.record(ID, "action-0", now).unwrap();

        breaker.archive(ID).unwrap();
        assert!(breaker.get(ID).unwrap().is_none());

        let archived = breaker.archived(ID).unwrap().unwrap();
        assert_eq!(archived.violations.len(), 1);
    }

    #[test]
    fn per_constraint_config_override() {
        let overrides = BTreeMap::from([(
            ID.to_string(),
            CircuitConfig {
                trip_threshold: 2,
                ..CircuitConfig::default()
            },
        )]);
        let breaker = CircuitBreaker::new(
            Arc::new(MemStateStore::new()),
            CircuitConfig::default(),
            overrides,
        );
        breaker.ensure_enforced(ID).unwrap();
        let base = at("2026-08-23T10:00:00Z");

        breaker.record(ID, "a", base).unwrap();
        let state = breaker.record(ID, "b", base + Duration::minutes(1)).unwrap();
        assert_eq!(state.state, BreakerState::Open, "tripped at the overridden threshold");
    }

    #[test]
    fn unknown_constraint_is_not_found() {
        let breaker = breaker();
        let now = at("2026-08-23T10:00:00Z");
        assert!(matches!(
            breaker.check("cns-missing", now).unwrap_err(),
            CircuitError::NotFound { .. }
        ));
        assert!(matches!(
            breaker.record("cns-missing", "a", now).unwrap_err(),
            CircuitError::NotFound { .. }
        ));
    }
}
