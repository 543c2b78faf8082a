//! Eligibility engine: the pure candidacy predicate.
//!
//! Decides whether an observation has accumulated enough independent evidence
//! and human agreement to become a constraint candidate. No side effects: the
//! engine facade re-evaluates on every counter mutation and reacts to the
//! false-to-true flip by drafting a constraint.
//!
//! Once eligible, an observation stays eligible unless disconfirmations grow:
//! every other counter is monotonic.

use serde::{Deserialize, Serialize};

use crate::observation::{Observation, ObservationKind};

/// Eligibility gates. Configuration, not hardcoded law.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EligibilityConfig {
    pub min_recurrence: u32,
    pub min_confirmations: u32,
    pub min_sources: usize,
    pub min_unique_users: usize,
    /// Disconfirm ratio `d/(c+d)` at or above this blocks candidacy.
    pub max_disconfirm_ratio: f64,
}

impl Default for EligibilityConfig {
    fn default() -> Self {
        Self {
            min_recurrence: 3,
            min_confirmations: 2,
            min_sources: 2,
            min_unique_users: 2,
            max_disconfirm_ratio: 0.2,
        }
    }
}

/// Per-criterion breakdown of an eligibility evaluation.
///
/// Consumed by the dashboard so operators can see exactly which gate an
/// observation is still missing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EligibilityReport {
    pub eligible: bool,
    pub is_failure_kind: bool,
    pub recurrence_met: bool,
    pub confirmations_met: bool,
    pub sources_met: bool,
    pub unique_users_met: bool,
    pub disconfirm_ratio: f64,
    pub ratio_ok: bool,
}

/// Evaluate every criterion. Pure function over the observation's counters.
pub fn evaluate(obs: &Observation, config: &EligibilityConfig) -> EligibilityReport {
    let is_failure_kind = obs.kind == ObservationKind::Failure;
    let recurrence_met = obs.r_count >= config.min_recurrence;
    let confirmations_met = obs.c_count >= config.min_confirmations;
    let sources_met = obs.sources.len() >= config.min_sources;
    let unique_users_met = obs.c_unique_users.len() >= config.min_unique_users;
    let disconfirm_ratio = obs.disconfirm_ratio();
    let ratio_ok = disconfirm_ratio < config.max_disconfirm_ratio;

    EligibilityReport {
        eligible: is_failure_kind
            && recurrence_met
            && confirmations_met
            && sources_met
            && unique_users_met
            && ratio_ok,
        is_failure_kind,
        recurrence_met,
        confirmations_met,
        sources_met,
        unique_users_met,
        disconfirm_ratio,
        ratio_ok,
    }
}

/// Whether the observation qualifies as a constraint candidate.
pub fn is_eligible(obs: &Observation, config: &EligibilityConfig) -> bool {
    evaluate(obs, config).eligible
}
