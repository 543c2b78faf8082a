//! # sentinel
//!
//! A failure-anchored constraint memory and enforcement engine: repeatedly
//! observed agent failures become durable, auditable, automatically enforced
//! constraints, with a circuit breaker and a governed lifecycle protecting
//! against over-enforcement.
//!
//! ## Architecture
//!
//! - **Evidence store** (`evidence`): immutable failure records with provenance
//! - **Observation aggregator** (`observation`): similarity-matched grouping with R/C/D counters
//! - **Eligibility engine** (`eligibility`): pure candidacy predicate over the counters
//! - **Lifecycle state machine** (`constraint`): draft/active/retiring/retired/deleted with audit trail
//! - **Circuit breaker** (`circuit`): per-constraint CLOSED/OPEN/HALF_OPEN violation tracking
//! - **Governance** (`governance`): single-writer lock, bulk operations, edge-triggered alerts
//!
//! ## Library usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use chrono::Utc;
//! use sentinel::engine::{Engine, EngineConfig};
//! use sentinel::evidence::NewEvidence;
//! use sentinel::observation::{LexicalSimilarity, ObservationKind};
//! use sentinel::constraint::Severity;
//!
//! let engine = Engine::new(
//!     EngineConfig::default(),
//!     Arc::new(LexicalSimilarity),
//!     None,
//! ).unwrap();
//! let outcome = engine.record_failure(
//!     NewEvidence {
//!         description: "git force push to main".into(),
//!         source: "hooks/pre-push:1".into(),
//!         session_id: "session-1".into(),
//!         user_id: "alice".into(),
//!     },
//!     ObservationKind::Failure,
//!     Severity::Important,
//!     Utc::now(),
//! ).unwrap();
//! println!("{} (r={})", outcome.observation.slug, outcome.observation.r_count);
//! ```

pub mod circuit;
pub mod constraint;
pub mod eligibility;
pub mod engine;
pub mod error;
pub mod evidence;
pub mod governance;
pub mod observation;
pub mod store;
