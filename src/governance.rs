//! Governance coordinator: single-writer locking, bulk operations, alerting.
//!
//! All mutating flows run under one TTL lock (`.governance.lock`). There is
//! no retry on contention: acquisition fails fast with the current holder and
//! expiry, and callers re-request explicitly. An expired lock is free for any
//! holder; expiry is the whole deadlock-recovery story.
//!
//! Bulk operations are dry-run by default and route every matched constraint
//! through the normal lifecycle transition, so audit trails and circuit
//! archival happen identically to single retirements.
//!
//! Alerting and the dashboard read the same [`HealthReport`]; alerts are
//! edge-triggered per breach episode, tracked in `.alert-episodes.json`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::circuit::CircuitBreaker;
use crate::constraint::{ConstraintState, LifecycleMachine, TransitionKind};
use crate::error::GovernanceError;
use crate::observation::Aggregator;
use crate::store::{StateStore, encode_doc, get_doc, put_doc};

/// Result type for governance operations.
pub type GovernanceResult<T> = std::result::Result<T, GovernanceError>;

const LOCK_KEY: &str = ".governance.lock";
const EPISODES_KEY: &str = ".alert-episodes.json";

/// Holders must heartbeat at least this often to keep the lock.
pub const HEARTBEAT_INTERVAL_SECS: i64 = 60;

/// Default lock TTL.
pub const DEFAULT_LOCK_TTL_SECS: i64 = 300;

// ---------------------------------------------------------------------------
// Lock manager
// ---------------------------------------------------------------------------

/// The single-writer mutual-exclusion token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernanceLock {
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Manages `.governance.lock`.
pub struct LockManager {
    store: Arc<dyn StateStore>,
    ttl: Duration,
}

impl LockManager {
    pub fn new(store: Arc<dyn StateStore>, ttl_secs: i64) -> Self {
        Self {
            store,
            ttl: Duration::seconds(ttl_secs),
        }
    }

    /// Acquire the lock, or fail fast if another holder has it.
    ///
    /// Re-acquisition by the current holder renews the TTL (same as a
    /// heartbeat). An expired lock is treated as free. The unheld path
    /// reserves via `put_if_absent`, so of any number of concurrent
    /// acquirers exactly one wins.
    pub fn acquire(&self, holder_id: &str, now: DateTime<Utc>) -> GovernanceResult<GovernanceLock> {
        let lock = GovernanceLock {
            holder_id: holder_id.to_string(),
            acquired_at: now,
            expires_at: now + self.ttl,
        };

        match self.load()? {
            None => {
                let bytes = encode_doc(LOCK_KEY, &lock)?;
                if !self.store.put_if_absent(LOCK_KEY, &bytes)? {
                    // Lost the reservation race. Report whoever won; if they
                    // already released, the caller re-requests as usual.
                    let (held_by, expires_at) = match self.load()? {
                        Some(winner) => (winner.holder_id, winner.expires_at.to_rfc3339()),
                        None => ("(released)".to_string(), now.to_rfc3339()),
                    };
                    return Err(GovernanceError::ConcurrentModification { held_by, expires_at });
                }
            }
            Some(held) if held.expires_at > now && held.holder_id != holder_id => {
                return Err(GovernanceError::ConcurrentModification {
                    held_by: held.holder_id,
                    expires_at: held.expires_at.to_rfc3339(),
                });
            }
            // Renewal by the current holder, or takeover of an expired lock.
            Some(_) => self.save(&lock)?,
        }

        tracing::debug!(holder_id, expires_at = %lock.expires_at, "governance lock acquired");
        Ok(lock)
    }

    /// Extend the TTL. The caller must be the current, non-expired holder.
    pub fn heartbeat(
        &self,
        holder_id: &str,
        now: DateTime<Utc>,
    ) -> GovernanceResult<GovernanceLock> {
        let held = self.load()?.filter(|l| l.expires_at > now);
        match held {
            Some(mut lock) if lock.holder_id == holder_id => {
                lock.expires_at = now + self.ttl;
                self.save(&lock)?;
                Ok(lock)
            }
            _ => Err(GovernanceError::LockNotHeld {
                holder_id: holder_id.to_string(),
            }),
        }
    }

    /// Release the lock. Only the recorded holder may release, even if the
    /// lock already expired (release is then a cleanup no-op for them).
    pub fn release(&self, holder_id: &str) -> GovernanceResult<()> {
        match self.load()? {
            Some(lock) if lock.holder_id == holder_id => {
                self.store.remove(LOCK_KEY)?;
                tracing::debug!(holder_id, "governance lock released");
                Ok(())
            }
            _ => Err(GovernanceError::LockNotHeld {
                holder_id: holder_id.to_string(),
            }),
        }
    }

    /// The current non-expired lock, if any.
    pub fn current(&self, now: DateTime<Utc>) -> GovernanceResult<Option<GovernanceLock>> {
        Ok(self.load()?.filter(|l| l.expires_at > now))
    }

    fn load(&self) -> GovernanceResult<Option<GovernanceLock>> {
        Ok(get_doc(self.store.as_ref(), LOCK_KEY)?)
    }

    fn save(&self, lock: &GovernanceLock) -> GovernanceResult<()> {
        put_doc(self.store.as_ref(), LOCK_KEY, lock)?;
        Ok(())
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockManager").field("ttl", &self.ttl).finish()
    }
}

// ---------------------------------------------------------------------------
// Bulk operations
// ---------------------------------------------------------------------------

/// Bulk operations preview by default; destruction needs an explicit confirm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkMode {
    DryRun,
    Confirm,
}

/// Outcome of a bulk operation.
///
/// Each item is its own atomic unit: a failure or cancellation mid-run leaves
/// already-applied items committed and the rest untouched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkReport {
    pub mode: BulkMode,
    pub matched: Vec<String>,
    pub applied: Vec<String>,
    /// Items that matched but failed to apply, with the error text.
    pub skipped: Vec<(String, String)>,
}

impl BulkReport {
    fn dry_run(matched: Vec<String>) -> Self {
        Self {
            mode: BulkMode::DryRun,
            matched,
            applied: Vec::new(),
            skipped: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Health and alerts
// ---------------------------------------------------------------------------

/// Alert thresholds. Defaults per the governance policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AlertThresholds {
    /// Days an active constraint may stay violation-free before it is dormant.
    pub dormancy_days: i64,
    /// Disconfirm ratio of the source observation that flags a false positive.
    pub false_positive_rate: f64,
    /// OPEN trips per 30-day window above which the constraint is thrashing.
    pub trips_per_window: usize,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            dormancy_days: 90,
            false_positive_rate: 0.2,
            trips_per_window: 3,
        }
    }
}

/// Monitored metric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertMetric {
    Dormancy,
    FalsePositiveRate,
    TripFrequency,
}

impl AlertMetric {
    /// Filename segment.
    pub fn slug(&self) -> &'static str {
        match self {
            Self::Dormancy => "dormancy",
            Self::FalsePositiveRate => "false-positive-rate",
            Self::TripFrequency => "trip-frequency",
        }
    }
}

/// One edge-triggered alert record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub metric: AlertMetric,
    pub current_value: f64,
    pub threshold: f64,
    pub constraint_id: String,
    pub created_at: DateTime<Utc>,
}

/// Per-constraint health snapshot, shared by alerts and the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintHealth {
    pub constraint_id: String,
    pub state: ConstraintState,
    /// Days since activation without a single violation, for active constraints.
    pub dormant_days: Option<i64>,
    /// Disconfirm ratio of the source observation.
    pub false_positive_rate: f64,
    pub violations_in_window: usize,
    pub trips_in_window: usize,
}

/// System health: one query used by the alert scanner and the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub constraints: Vec<ConstraintHealth>,
    pub observation_count: usize,
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Governs bulk state changes and monitors enforcement health.
pub struct GovernanceCoordinator {
    store: Arc<dyn StateStore>,
    lifecycle: Arc<LifecycleMachine>,
    breaker: Arc<CircuitBreaker>,
    aggregator: Arc<Aggregator>,
    thresholds: AlertThresholds,
}

impl GovernanceCoordinator {
    pub fn new(
        store: Arc<dyn StateStore>,
        lifecycle: Arc<LifecycleMachine>,
        breaker: Arc<CircuitBreaker>,
        aggregator: Arc<Aggregator>,
        thresholds: AlertThresholds,
    ) -> Self {
        Self {
            store,
            lifecycle,
            breaker,
            aggregator,
            thresholds,
        }
    }

    /// Retire active constraints that have been dormant for `dormant_days`.
    ///
    /// Dry-run reports matches without touching anything. Confirmed runs
    /// retire each match through `retire` + `complete_retire`, item by item.
    pub fn bulk_retire(
        &self,
        dormant_days: i64,
        mode: BulkMode,
        actor: &str,
        now: DateTime<Utc>,
    ) -> GovernanceResult<BulkReport> {
        let window = Duration::days(dormant_days);
        let mut matched = Vec::new();
        for constraint in self.lifecycle.by_state(ConstraintState::Active)? {
            let Some(activated_at) = constraint.activated_at() else {
                continue;
            };
            if now - activated_at < window {
                continue;
            }
            let quiet = match self.breaker.get(constraint.id.as_str())? {
                Some(circuit) => circuit.violations_in_window(now, window) == 0,
                None => true,
            };
            if quiet {
                matched.push(constraint.id.to_string());
            }
        }

        if mode == BulkMode::DryRun {
            tracing::info!(count = matched.len(), dormant_days, "bulk retire dry-run");
            return Ok(BulkReport::dry_run(matched));
        }

        let mut report = BulkReport {
            mode,
            matched: matched.clone(),
            applied: Vec::new(),
            skipped: Vec::new(),
        };
        for raw_id in matched {
            let id = crate::constraint::ConstraintId::from_raw(raw_id.clone());
            let reason = format!("dormant for {dormant_days} days");
            let result = self
                .lifecycle
                .transition(&id, TransitionKind::Retire, actor, Some(&reason), now)
                .and_then(|_| {
                    self.lifecycle.transition(
                        &id,
                        TransitionKind::CompleteRetire,
                        actor,
                        Some(&reason),
                        now,
                    )
                });
            match result {
                Ok(_) => report.applied.push(raw_id),
                Err(err) => {
                    tracing::warn!(constraint_id = %raw_id, %err, "bulk retire item failed");
                    report.skipped.push((raw_id, err.to_string()));
                }
            }
        }
        tracing::info!(
            matched = report.matched.len(),
            applied = report.applied.len(),
            "bulk retire applied"
        );
        Ok(report)
    }

    /// Archive observations not updated for `older_than_days` that never
    /// produced a constraint.
    pub fn archive_observations(
        &self,
        older_than_days: i64,
        mode: BulkMode,
        now: DateTime<Utc>,
    ) -> GovernanceResult<BulkReport> {
        let cutoff = now - Duration::days(older_than_days);
        let mut matched: Vec<String> = self
            .aggregator
            .all()
            .into_iter()
            .filter(|obs| obs.updated_at < cutoff && obs.constraint_id.is_none())
            .map(|obs| obs.slug)
            .collect();
        matched.sort();

        if mode == BulkMode::DryRun {
            return Ok(BulkReport::dry_run(matched));
        }

        let mut report = BulkReport {
            mode,
            matched: matched.clone(),
            applied: Vec::new(),
            skipped: Vec::new(),
        };
        for slug in matched {
            match self.aggregator.archive(&slug) {
                Ok(()) => report.applied.push(slug),
                Err(err) => report.skipped.push((slug, err.to_string())),
            }
        }
        Ok(report)
    }

    /// Compute the health snapshot consumed by alerts and the dashboard.
    pub fn health(&self, now: DateTime<Utc>) -> GovernanceResult<HealthReport> {
        let trip_window = Duration::days(30);
        let mut constraints = Vec::new();

        for constraint in self.lifecycle.all()? {
            let circuit = self.breaker.get(constraint.id.as_str())?;
            let (violations_in_window, trips_in_window, last_violation) = match &circuit {
                Some(c) => (
                    c.violations_in_window(now, trip_window),
                    c.trips_in_window(now, trip_window),
                    c.violations.last().map(|v| v.timestamp),
                ),
                None => (0, 0, None),
            };

            let dormant_days = match (constraint.state, constraint.activated_at()) {
                (ConstraintState::Active, Some(activated_at)) => {
                    let since = last_violation.unwrap_or(activated_at);
                    Some((now - since).num_days())
                }
                _ => None,
            };

            let false_positive_rate = self
                .aggregator
                .get(&constraint.source_observation_id)
                .map(|obs| obs.disconfirm_ratio())
                .unwrap_or(0.0);

            constraints.push(ConstraintHealth {
                constraint_id: constraint.id.to_string(),
                state: constraint.state,
                dormant_days,
                false_positive_rate,
                violations_in_window,
                trips_in_window,
            });
        }

        Ok(HealthReport {
            generated_at: now,
            constraints,
            observation_count: self.aggregator.all().len(),
        })
    }

    /// Scan health against the thresholds and emit edge-triggered alerts.
    ///
    /// One alert per breach episode: nothing is re-emitted while a metric
    /// stays breached, and recovery re-arms it. Episode state persists in
    /// `.alert-episodes.json`; each emitted alert is also written out as a
    /// JSON record and a markdown summary.
    pub fn scan_alerts(&self, now: DateTime<Utc>) -> GovernanceResult<Vec<Alert>> {
        let health = self.health(now)?;
        let mut episodes: BTreeMap<String, bool> =
            get_doc(self.store.as_ref(), EPISODES_KEY)?.unwrap_or_default();
        let mut emitted = Vec::new();

        for entry in &health.constraints {
            let checks = [
                (
                    AlertMetric::Dormancy,
                    entry.dormant_days.unwrap_or(0) as f64,
                    self.thresholds.dormancy_days as f64,
                    entry.state == ConstraintState::Active
                        && entry.dormant_days.unwrap_or(0) >= self.thresholds.dormancy_days,
                ),
                (
                    AlertMetric::FalsePositiveRate,
                    entry.false_positive_rate,
                    self.thresholds.false_positive_rate,
                    entry.false_positive_rate >= self.thresholds.false_positive_rate,
                ),
                (
                    AlertMetric::TripFrequency,
                    entry.trips_in_window as f64,
                    self.thresholds.trips_per_window as f64,
                    entry.trips_in_window > self.thresholds.trips_per_window,
                ),
            ];

            for (metric, current_value, threshold, breached) in checks {
                let key = format!("{}:{}", metric.slug(), entry.constraint_id);
                let was_breached = episodes.get(&key).copied().unwrap_or(false);
                if breached && !was_breached {
                    let alert = Alert {
                        metric,
                        current_value,
                        threshold,
                        constraint_id: entry.constraint_id.clone(),
                        created_at: now,
                    };
                    self.write_alert(&alert)?;
                    tracing::warn!(
                        constraint_id = %alert.constraint_id,
                        metric = metric.slug(),
                        current_value,
                        threshold,
                        "governance alert"
                    );
                    emitted.push(alert);
                }
                episodes.insert(key, breached);
            }
        }

        put_doc(self.store.as_ref(), EPISODES_KEY, &episodes)?;
        Ok(emitted)
    }

    fn write_alert(&self, alert: &Alert) -> GovernanceResult<()> {
        let stem = format!(
            "governance-alert-{}-{}-{}",
            alert.created_at.format("%Y-%m-%d"),
            alert.metric.slug(),
            alert.constraint_id,
        );
        put_doc(self.store.as_ref(), &format!("{stem}.json"), alert)?;

        let markdown = format!(
            "# Governance alert: {metric}\n\n\
             - **Constraint**: `{id}`\n\
             - **Current value**: {value}\n\
             - **Threshold**: {threshold}\n\
             - **Raised at**: {at}\n",
            metric = alert.metric.slug(),
            id = alert.constraint_id,
            value = alert.current_value,
            threshold = alert.threshold,
            at = alert.created_at.to_rfc3339(),
        );
        self.store.put(&format!("{stem}.md"), markdown.as_bytes())?;
        Ok(())
    }
}

impl std::fmt::Debug for GovernanceCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GovernanceCoordinator")
            .field("thresholds", &self.thresholds)
            .finish()
    }
}
