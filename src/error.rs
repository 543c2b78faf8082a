//! Rich diagnostic error types for the sentinel engine.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes, help text, and source chains so operators know exactly
//! what went wrong, what the allowed next steps are, and how to recover.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the sentinel engine.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain (error codes, help text, source spans) through to the caller.
#[derive(Debug, Error, Diagnostic)]
pub enum SentinelError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Evidence(#[from] EvidenceError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Observation(#[from] ObservationError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Circuit(#[from] CircuitError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Governance(#[from] GovernanceError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Engine(#[from] EngineError),
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("I/O error on {key}: {source}")]
    #[diagnostic(
        code(sentinel::store::io),
        help(
            "A filesystem operation failed. Check that the state directory exists, \
             has correct permissions, and that the disk is not full."
        )
    )]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error for {key}: {message}")]
    #[diagnostic(
        code(sentinel::store::serde),
        help(
            "Failed to serialize or deserialize a state document. \
             This usually means the file was edited by hand or written by an \
             incompatible version. Check the document's schema_version field."
        )
    )]
    Serialization { key: String, message: String },

    #[error("key not found: {key}")]
    #[diagnostic(
        code(sentinel::store::not_found),
        help("The requested state document does not exist. Verify the key is correct.")
    )]
    NotFound { key: String },

    #[error("invalid key: {key}")]
    #[diagnostic(
        code(sentinel::store::invalid_key),
        help("Keys are relative paths inside the state root and must not contain '..'.")
    )]
    InvalidKey { key: String },
}

// ---------------------------------------------------------------------------
// Evidence errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum EvidenceError {
    #[error("empty evidence description")]
    #[diagnostic(
        code(sentinel::evidence::empty_description),
        help(
            "Evidence must carry a non-empty free-text description of the failure \
             or pattern. Whitespace-only descriptions are rejected."
        )
    )]
    EmptyDescription,

    #[error("evidence not found: {id}")]
    #[diagnostic(
        code(sentinel::evidence::not_found),
        help("No evidence record exists with this ID. Evidence is never deleted, so check the ID.")
    )]
    NotFound { id: u64 },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Observation errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ObservationError {
    #[error("observation not found: \"{slug}\"")]
    #[diagnostic(
        code(sentinel::observation::not_found),
        help("No observation with this slug exists. List known observations with `sentinel status`.")
    )]
    NotFound { slug: String },

    #[error("invalid input: {message}")]
    #[diagnostic(
        code(sentinel::observation::invalid_input),
        help("Confirm/disconfirm requires a non-empty user identity and an existing slug.")
    )]
    InvalidInput { message: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Evidence(#[from] EvidenceError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Lifecycle errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum LifecycleError {
    #[error("invalid transition for {constraint_id}: {from} -> {attempted} (allowed: {allowed})")]
    #[diagnostic(
        code(sentinel::lifecycle::invalid_transition),
        help(
            "Constraint states move only along the lifecycle table: \
             draft -> active|deleted, active -> retiring|retired(emergency)|draft(rollback), \
             retiring -> retired|active. Terminal states accept no transitions."
        )
    )]
    InvalidTransition {
        constraint_id: String,
        from: String,
        attempted: String,
        allowed: String,
    },

    #[error("reason required for {action} on {constraint_id}")]
    #[diagnostic(
        code(sentinel::lifecycle::reason_required),
        help(
            "emergency_retire and rollback are destructive shortcuts and must carry \
             a non-empty reason for the audit trail."
        )
    )]
    ReasonRequired {
        constraint_id: String,
        action: String,
    },

    #[error("constraint not found: {constraint_id}")]
    #[diagnostic(
        code(sentinel::lifecycle::not_found),
        help("No constraint with this ID exists in any lifecycle state directory.")
    )]
    NotFound { constraint_id: String },

    #[error("observation \"{slug}\" already has constraint {constraint_id}")]
    #[diagnostic(
        code(sentinel::lifecycle::duplicate_constraint),
        help("At most one constraint may be derived from an observation.")
    )]
    DuplicateConstraint {
        slug: String,
        constraint_id: String,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Circuit(#[from] CircuitError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Circuit breaker errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum CircuitError {
    #[error("circuit OPEN for {constraint_id}: blocked for {cooldown_remaining_secs}s more")]
    #[diagnostic(
        code(sentinel::circuit::threshold_blocked),
        help(
            "The violation threshold was reached and the breaker tripped. Wait for the \
             cooldown to elapse (the first check afterwards probes HALF_OPEN), request an \
             emergency override from an approver, or reset the circuit with a reason."
        )
    )]
    ThresholdBlocked {
        constraint_id: String,
        cooldown_remaining_secs: i64,
    },

    #[error("no circuit state for constraint {constraint_id}")]
    #[diagnostic(
        code(sentinel::circuit::not_found),
        help(
            "Circuit state exists only for enforced constraints (active or retiring). \
             Activate the constraint first."
        )
    )]
    NotFound { constraint_id: String },

    #[error("reason required to reset circuit for {constraint_id}")]
    #[diagnostic(
        code(sentinel::circuit::reason_required),
        help("Manual circuit resets bypass the cooldown and must carry a non-empty reason.")
    )]
    ReasonRequired { constraint_id: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Governance errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum GovernanceError {
    #[error("governance lock held by \"{held_by}\" until {expires_at}")]
    #[diagnostic(
        code(sentinel::governance::concurrent_modification),
        help(
            "Another holder owns the single-writer lock. There is no implicit retry: \
             re-request explicitly once the holder releases or the TTL expires."
        )
    )]
    ConcurrentModification { held_by: String, expires_at: String },

    #[error("no governance lock held by \"{holder_id}\"")]
    #[diagnostic(
        code(sentinel::governance::lock_not_held),
        help("heartbeat() and release() require the caller to be the current lock holder.")
    )]
    LockNotHeld { holder_id: String },

    #[error("override for {constraint_id} expired or already used")]
    #[diagnostic(
        code(sentinel::governance::recovery_expired),
        help(
            "Emergency overrides are time-boxed and may be single-use. \
             Request a fresh override from an approver."
        )
    )]
    RecoveryExpired { constraint_id: String },

    #[error("reason required for override on {constraint_id}")]
    #[diagnostic(
        code(sentinel::governance::reason_required),
        help("Emergency overrides bypass enforcement and must carry a non-empty reason.")
    )]
    ReasonRequired { constraint_id: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Circuit(#[from] CircuitError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Engine errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error("invalid configuration: {message}")]
    #[diagnostic(
        code(sentinel::engine::invalid_config),
        help("Check the EngineConfig fields. {message}")
    )]
    InvalidConfig { message: String },

    #[error("state directory error: {path}")]
    #[diagnostic(
        code(sentinel::engine::state_dir),
        help(
            "The state directory could not be accessed. \
             Ensure the path exists and has read/write permissions."
        )
    )]
    StateDir { path: String },
}

/// Convenience alias for functions returning sentinel results.
pub type SentinelResult<T> = std::result::Result<T, SentinelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_converts_to_sentinel_error() {
        let err = StoreError::NotFound { key: "test".into() };
        let top: SentinelError = err.into();
        assert!(matches!(top, SentinelError::Store(StoreError::NotFound { .. })));
    }

    #[test]
    fn lifecycle_error_wraps_circuit_error() {
        let circuit = CircuitError::NotFound {
            constraint_id: "cns-x".into(),
        };
        let lifecycle: LifecycleError = circuit.into();
        assert!(matches!(lifecycle, LifecycleError::Circuit(CircuitError::NotFound { .. })));
    }

    #[test]
    fn governance_error_wraps_circuit_error() {
        // Health scans and bulk retire read circuit state directly.
        let circuit = CircuitError::NotFound {
            constraint_id: "cns-x".into(),
        };
        let governance: GovernanceError = circuit.into();
        assert!(matches!(
            governance,
            GovernanceError::Circuit(CircuitError::NotFound { .. })
        ));
    }

    #[test]
    fn blocked_error_reports_cooldown() {
        let err = CircuitError::ThresholdBlocked {
            constraint_id: "cns-git-force-push".into(),
            cooldown_remaining_secs: 3600,
        };
        let msg = format!("{err}");
        assert!(msg.contains("cns-git-force-push"));
        assert!(msg.contains("3600"));
    }

    #[test]
    fn invalid_transition_reports_allowed_set() {
        let err = LifecycleError::InvalidTransition {
            constraint_id: "cns-x".into(),
            from: "retired".into(),
            attempted: "active".into(),
            allowed: "(none)".into(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("retired"));
        assert!(msg.contains("(none)"));
    }
}
