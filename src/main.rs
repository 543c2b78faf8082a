//! sentinel CLI: failure-anchored constraint memory and enforcement engine.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use sentinel::constraint::ConstraintId;
use sentinel::engine::{ActionCheck, Engine, EngineConfig, ViolationOutcome};
use sentinel::evidence::NewEvidence;
use sentinel::governance::BulkMode;
use sentinel::observation::{LexicalSimilarity, ObservationKind};

#[derive(Parser)]
#[command(name = "sentinel", version, about = "Failure-anchored constraint memory")]
struct Cli {
    /// State directory for persisted observations, constraints, and circuits.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record a failure or pattern occurrence as evidence.
    Record {
        /// Free-text description of what happened.
        description: String,

        /// Provenance: file:line or an event reference.
        #[arg(long)]
        source: String,

        /// Session the occurrence happened in.
        #[arg(long)]
        session: String,

        /// User who observed it.
        #[arg(long)]
        user: String,

        /// Record a pattern instead of a failure (patterns never become constraints).
        #[arg(long)]
        pattern: bool,
    },

    /// Confirm an observation as a real recurring problem.
    Confirm {
        /// Observation slug.
        slug: String,

        /// Confirming user.
        #[arg(long)]
        user: String,

        /// Seconds the user spent deciding (bias signal).
        #[arg(long, default_value = "30")]
        latency_secs: i64,
    },

    /// Disconfirm an observation as noise or a false grouping.
    Disconfirm {
        /// Observation slug.
        slug: String,

        /// Disconfirming user.
        #[arg(long)]
        user: String,

        /// Seconds the user spent deciding (bias signal).
        #[arg(long, default_value = "30")]
        latency_secs: i64,
    },

    /// Manage constraint lifecycle state.
    Constraint {
        #[command(subcommand)]
        action: ConstraintAction,
    },

    /// Check whether a constrained action may proceed.
    Check {
        /// Constraint ID.
        constraint_id: String,
    },

    /// Report a violation of a constraint.
    Violation {
        /// Constraint ID.
        constraint_id: String,

        /// Reference to the violating action (commit hash, command, ...).
        #[arg(long)]
        action_ref: String,
    },

    /// Manually reset a constraint's circuit to CLOSED.
    CircuitReset {
        /// Constraint ID.
        constraint_id: String,

        /// Actor performing the reset.
        #[arg(long)]
        actor: String,

        /// Reason for the audit trail.
        #[arg(long)]
        reason: String,
    },

    /// Retire active constraints with no violations for the given period.
    BulkRetire {
        /// Days of violation-free activity that count as dormant.
        #[arg(long, default_value = "90")]
        dormant_days: i64,

        /// Apply the retirements instead of previewing them.
        #[arg(long)]
        confirm: bool,

        /// Actor recorded in the audit trails.
        #[arg(long, default_value = "governance")]
        actor: String,
    },

    /// List observations and constraints.
    Status,

    /// Health metrics per constraint (dormancy, false positives, trips).
    Dashboard,

    /// Scan health metrics and emit edge-triggered governance alerts.
    ScanAlerts,
}

#[derive(Subcommand)]
enum ConstraintAction {
    /// Activate a draft constraint (begins BLOCK enforcement).
    Activate { constraint_id: String },
    /// Begin graceful retirement (WARN enforcement).
    Retire { constraint_id: String },
    /// Immediately retire an active constraint. Requires a reason.
    EmergencyRetire {
        constraint_id: String,
        #[arg(long)]
        reason: String,
    },
    /// Send an active constraint back to draft. Requires a reason.
    Rollback {
        constraint_id: String,
        #[arg(long)]
        reason: String,
    },
    /// Finish a graceful retirement.
    CompleteRetire { constraint_id: String },
    /// Return a retiring constraint to active.
    Reactivate { constraint_id: String },
    /// Delete a draft that never went live.
    Delete { constraint_id: String },
    /// Show a constraint with its audit log.
    Show { constraint_id: String },
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_toml_file(path).into_diagnostic()?,
        None => EngineConfig::default(),
    };
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }

    // No semantic scorer is wired on the CLI; the lexical fallback keeps
    // matching deterministic.
    let engine = Engine::new(config, Arc::new(LexicalSimilarity), None).into_diagnostic()?;
    let actor_now = Utc::now();

    match cli.command {
        Commands::Record {
            description,
            source,
            session,
            user,
            pattern,
        } => {
            let kind = if pattern {
                ObservationKind::Pattern
            } else {
                ObservationKind::Failure
            };
            let outcome = engine
                .record_failure(
                    NewEvidence {
                        description,
                        source,
                        session_id: session,
                        user_id: user,
                    },
                    kind,
                    sentinel::constraint::Severity::Important,
                    actor_now,
                )
                .into_diagnostic()?;

            let verb = if outcome.matched { "matched" } else { "created" };
            println!(
                "{} observation \"{}\" (r={}, tier={:?})",
                verb, outcome.observation.slug, outcome.observation.r_count, outcome.observation.tier
            );
            if let Some(constraint) = outcome.drafted {
                println!("drafted constraint {} [{:?}]", constraint.id, constraint.severity);
            }
        }

        Commands::Confirm {
            slug,
            user,
            latency_secs,
        } => {
            let outcome = engine
                .confirm(&slug, &user, Duration::seconds(latency_secs), actor_now)
                .into_diagnostic()?;
            let obs = &outcome.decision.observation;
            println!(
                "\"{}\": c={}, d={}, ratio={:.2}{}",
                obs.slug,
                obs.c_count,
                obs.d_count,
                obs.disconfirm_ratio(),
                if outcome.decision.counted { "" } else { " (repeat, not counted)" }
            );
            if let Some(constraint) = outcome.drafted {
                println!("drafted constraint {} [{:?}]", constraint.id, constraint.severity);
            } else if !outcome.eligibility.eligible {
                println!("not yet eligible: {:?}", outcome.eligibility);
            }
        }

        Commands::Disconfirm {
            slug,
            user,
            latency_secs,
        } => {
            let outcome = engine
                .disconfirm(&slug, &user, Duration::seconds(latency_secs), actor_now)
                .into_diagnostic()?;
            let obs = &outcome.decision.observation;
            println!(
                "\"{}\": c={}, d={}, ratio={:.2}",
                obs.slug,
                obs.c_count,
                obs.d_count,
                obs.disconfirm_ratio()
            );
        }

        Commands::Constraint { action } => {
            let actor = whoami();
            match action {
                ConstraintAction::Activate { constraint_id } => {
                    let id = ConstraintId::from_raw(constraint_id);
                    let c = engine.activate(&id, &actor, actor_now).into_diagnostic()?;
                    println!("{} -> {} (v{})", c.id, c.state, c.version);
                }
                ConstraintAction::Retire { constraint_id } => {
                    let id = ConstraintId::from_raw(constraint_id);
                    let c = engine.retire(&id, &actor, None, actor_now).into_diagnostic()?;
                    println!("{} -> {} (v{})", c.id, c.state, c.version);
                }
                ConstraintAction::EmergencyRetire {
                    constraint_id,
                    reason,
                } => {
                    let id = ConstraintId::from_raw(constraint_id);
                    let c = engine
                        .emergency_retire(&id, &actor, &reason, actor_now)
                        .into_diagnostic()?;
                    println!("{} -> {} (v{})", c.id, c.state, c.version);
                }
                ConstraintAction::Rollback {
                    constraint_id,
                    reason,
                } => {
                    let id = ConstraintId::from_raw(constraint_id);
                    let c = engine
                        .rollback(&id, &actor, &reason, actor_now)
                        .into_diagnostic()?;
                    println!("{} -> {} (v{})", c.id, c.state, c.version);
                }
                ConstraintAction::CompleteRetire { constraint_id } => {
                    let id = ConstraintId::from_raw(constraint_id);
                    let c = engine
                        .complete_retire(&id, &actor, actor_now)
                        .into_diagnostic()?;
                    println!("{} -> {} (v{})", c.id, c.state, c.version);
                }
                ConstraintAction::Reactivate { constraint_id } => {
                    let id = ConstraintId::from_raw(constraint_id);
                    let c = engine.reactivate(&id, &actor, actor_now).into_diagnostic()?;
                    println!("{} -> {} (v{})", c.id, c.state, c.version);
                }
                ConstraintAction::Delete { constraint_id } => {
                    let id = ConstraintId::from_raw(constraint_id);
                    let c = engine.delete_draft(&id, &actor, actor_now).into_diagnostic()?;
                    println!("{} -> {} (v{})", c.id, c.state, c.version);
                }
                ConstraintAction::Show { constraint_id } => {
                    let id = ConstraintId::from_raw(constraint_id);
                    let c = engine.constraint(&id).into_diagnostic()?;
                    println!("{} [{:?}] {} (v{})", c.id, c.severity, c.state, c.version);
                    println!("  scope: {}", c.scope_text);
                    println!("  from observation: {}", c.source_observation_id);
                    println!("  audit log ({} entries):", c.audit_log.len());
                    for entry in &c.audit_log {
                        println!(
                            "    {} {} by {}{}",
                            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                            entry.action,
                            entry.actor,
                            entry
                                .reason
                                .as_deref()
                                .map(|r| format!(" ({r})"))
                                .unwrap_or_default()
                        );
                    }
                    if let Some(circuit) = engine.circuit(&id).into_diagnostic()? {
                        println!(
                            "  circuit: {:?}, {} violations on record",
                            circuit.state,
                            circuit.violations.len()
                        );
                    }
                }
            }
        }

        Commands::Check { constraint_id } => {
            let id = ConstraintId::from_raw(constraint_id);
            match engine.check_action(&id, actor_now).into_diagnostic()? {
                ActionCheck::Allowed => println!("allowed"),
                ActionCheck::AllowedByOverride { approver } => {
                    println!("allowed by emergency override (approver: {approver})")
                }
                ActionCheck::NotEnforced => println!("not enforced"),
            }
        }

        Commands::Violation {
            constraint_id,
            action_ref,
        } => {
            let id = ConstraintId::from_raw(constraint_id);
            match engine
                .report_violation(&id, &action_ref, actor_now)
                .into_diagnostic()?
            {
                ViolationOutcome::Blocked(state) => {
                    println!(
                        "recorded (BLOCK semantics); circuit {:?}, {} violations in window",
                        state.state,
                        state.violations.len()
                    );
                }
                ViolationOutcome::Warned(state) => {
                    println!(
                        "recorded (WARN semantics); circuit {:?}, {} violations in window",
                        state.state,
                        state.violations.len()
                    );
                }
                ViolationOutcome::NotEnforced => println!("constraint not enforced; ignored"),
            }
        }

        Commands::CircuitReset {
            constraint_id,
            actor,
            reason,
        } => {
            let id = ConstraintId::from_raw(constraint_id);
            let state = engine
                .reset_circuit(&id, &actor, &reason, actor_now)
                .into_diagnostic()?;
            println!("circuit for {} reset to {:?}", id, state.state);
        }

        Commands::BulkRetire {
            dormant_days,
            confirm,
            actor,
        } => {
            let mode = if confirm {
                BulkMode::Confirm
            } else {
                BulkMode::DryRun
            };
            let report = engine
                .bulk_retire(dormant_days, mode, &actor, actor_now)
                .into_diagnostic()?;
            if report.matched.is_empty() {
                println!("no dormant constraints (>= {dormant_days} days)");
            } else {
                println!("matched ({}):", report.matched.len());
                for id in &report.matched {
                    println!("  {id}");
                }
                match mode {
                    BulkMode::DryRun => println!("dry-run; pass --confirm to retire"),
                    BulkMode::Confirm => {
                        println!("retired: {}", report.applied.len());
                        for (id, err) in &report.skipped {
                            println!("  skipped {id}: {err}");
                        }
                    }
                }
            }
        }

        Commands::Status => {
            let observations = engine.observations();
            println!("Observations ({}):", observations.len());
            for obs in &observations {
                println!(
                    "  {} [{:?}] r={} c={} d={} tier={:?}{}",
                    obs.slug,
                    obs.kind,
                    obs.r_count,
                    obs.c_count,
                    obs.d_count,
                    obs.tier,
                    obs.constraint_id
                        .as_ref()
                        .map(|id| format!(" -> {id}"))
                        .unwrap_or_default()
                );
            }

            let constraints = engine.constraints().into_diagnostic()?;
            println!("Constraints ({}):", constraints.len());
            for c in &constraints {
                println!("  {} [{:?}] {} (v{})", c.id, c.severity, c.state, c.version);
            }

            if let Some(lock) = engine.lock_status(actor_now).into_diagnostic()? {
                println!(
                    "Governance lock: held by \"{}\" until {}",
                    lock.holder_id, lock.expires_at
                );
            }
        }

        Commands::Dashboard => {
            let health = engine.dashboard(actor_now).into_diagnostic()?;
            println!(
                "Health at {} ({} observations):",
                health.generated_at.format("%Y-%m-%d %H:%M:%S"),
                health.observation_count
            );
            for entry in &health.constraints {
                println!(
                    "  {} [{}] fp={:.2} violations(30d)={} trips(30d)={}{}",
                    entry.constraint_id,
                    entry.state,
                    entry.false_positive_rate,
                    entry.violations_in_window,
                    entry.trips_in_window,
                    entry
                        .dormant_days
                        .map(|d| format!(" dormant={d}d"))
                        .unwrap_or_default()
                );
            }
        }

        Commands::ScanAlerts => {
            let alerts = engine.scan_alerts(actor_now).into_diagnostic()?;
            if alerts.is_empty() {
                println!("no new alerts");
            } else {
                for alert in &alerts {
                    println!(
                        "ALERT {}: {} = {} (threshold {})",
                        alert.constraint_id,
                        alert.metric.slug(),
                        alert.current_value,
                        alert.threshold
                    );
                }
            }
        }
    }

    Ok(())
}

/// Actor identity for lifecycle commands, from the environment.
fn whoami() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "operator".to_string())
}
