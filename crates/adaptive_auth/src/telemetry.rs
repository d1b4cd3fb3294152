//! Telemetry hooks
//!
//! Every signal is recorded twice: through the `metrics` facade for whatever
//! exporter the host installs, and into in-process atomic counters that back
//! [`TelemetrySnapshot`].

use crate::config::TelemetryConfig;
use crate::error::{AdaptiveAuthError, AdaptiveAuthResult};
use crate::types::{RiskLevel, StepUpDecision};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::EnvFilter;

/// Metric names
pub mod names {
    /// Risk score histogram
    pub const RISK_SCORE: &str = "adaptive_auth_risk_score";
    /// Assessments produced without a baseline because of lookup failure
    pub const DEGRADED_ASSESSMENTS: &str = "adaptive_auth_degraded_assessments_total";
    /// Step-up decisions
    pub const STEP_UP: &str = "adaptive_auth_step_up_total";
    /// Blocked decisions
    pub const BLOCKED: &str = "adaptive_auth_blocked_total";
    /// Total step-up evaluations
    pub const DECISIONS: &str = "adaptive_auth_decisions_total";
    /// Replayed nonces
    pub const REPLAY_ATTEMPTS: &str = "adaptive_auth_replay_attempts_total";
    /// Policy reload outcomes
    pub const POLICY_RELOAD: &str = "adaptive_auth_policy_reload_total";
    /// Lockouts triggered
    pub const LOCKOUTS: &str = "adaptive_auth_lockouts_total";
    /// Terminal chain states
    pub const CHAIN_OUTCOMES: &str = "adaptive_auth_chain_outcomes_total";
}

/// Process-wide authentication counters
#[derive(Debug, Default)]
pub struct AuthMetrics {
    assessments: AtomicU64,
    degraded_assessments: AtomicU64,
    decisions: AtomicU64,
    step_ups: AtomicU64,
    blocked: AtomicU64,
    replay_attempts: AtomicU64,
    policy_reloads: AtomicU64,
    policy_reload_failures: AtomicU64,
    lockouts: AtomicU64,
    chains_succeeded: AtomicU64,
    chains_failed: AtomicU64,
}

impl AuthMetrics {
    /// Create zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished risk assessment
    pub fn record_assessment(&self, score: f64, level: RiskLevel, degraded: bool) {
        self.assessments.fetch_add(1, Ordering::Relaxed);
        metrics::histogram!(names::RISK_SCORE, "level" => level.as_str()).record(score);
        if degraded {
            self.degraded_assessments.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(names::DEGRADED_ASSESSMENTS).increment(1);
        }
    }

    /// Record a step-up decision
    pub fn record_decision(&self, decision: &StepUpDecision) {
        self.decisions.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(names::DECISIONS).increment(1);
        if decision.blocked {
            self.blocked.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(names::BLOCKED, "operation" => decision.policy_operation.clone())
                .increment(1);
        } else if decision.step_up_required {
            self.step_ups.fetch_add(1, Ordering::Relaxed);
            metrics::counter!(
                names::STEP_UP,
                "operation" => decision.policy_operation.clone(),
                "required_level" => decision.required_level.as_str()
            )
            .increment(1);
        }
    }

    /// Record a replayed nonce
    pub fn record_replay(&self) {
        self.replay_attempts.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(names::REPLAY_ATTEMPTS).increment(1);
    }

    /// Record a policy reload outcome
    pub fn record_policy_reload(&self, policy: &'static str, success: bool) {
        if success {
            self.policy_reloads.fetch_add(1, Ordering::Relaxed);
        } else {
            self.policy_reload_failures.fetch_add(1, Ordering::Relaxed);
        }
        let outcome = if success { "success" } else { "failure" };
        metrics::counter!(names::POLICY_RELOAD, "policy" => policy, "outcome" => outcome)
            .increment(1);
    }

    /// Record a lockout
    pub fn record_lockout(&self, factor_type: &'static str) {
        self.lockouts.fetch_add(1, Ordering::Relaxed);
        metrics::counter!(names::LOCKOUTS, "factor_type" => factor_type).increment(1);
    }

    /// Record a terminal chain state
    pub fn record_chain_outcome(&self, success: bool) {
        if success {
            self.chains_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.chains_failed.fetch_add(1, Ordering::Relaxed);
        }
        let outcome = if success { "success" } else { "failure" };
        metrics::counter!(names::CHAIN_OUTCOMES, "outcome" => outcome).increment(1);
    }

    /// Point-in-time copy of all counters
    #[must_use]
    pub fn snapshot(&self) -> TelemetrySnapshot {
        TelemetrySnapshot {
            assessments: self.assessments.load(Ordering::Relaxed),
            degraded_assessments: self.degraded_assessments.load(Ordering::Relaxed),
            decisions: self.decisions.load(Ordering::Relaxed),
            step_ups: self.step_ups.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            replay_attempts: self.replay_attempts.load(Ordering::Relaxed),
            policy_reloads: self.policy_reloads.load(Ordering::Relaxed),
            policy_reload_failures: self.policy_reload_failures.load(Ordering::Relaxed),
            lockouts: self.lockouts.load(Ordering::Relaxed),
            chains_succeeded: self.chains_succeeded.load(Ordering::Relaxed),
            chains_failed: self.chains_failed.load(Ordering::Relaxed),
        }
    }
}

/// Counter values at one instant
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetrySnapshot {
    /// Risk assessments produced
    pub assessments: u64,
    /// Assessments that fell back to no baseline
    pub degraded_assessments: u64,
    /// Step-up evaluations
    pub decisions: u64,
    /// Decisions requiring step-up
    pub step_ups: u64,
    /// Decisions that blocked
    pub blocked: u64,
    /// Replay attempts rejected
    pub replay_attempts: u64,
    /// Successful policy loads
    pub policy_reloads: u64,
    /// Failed policy loads
    pub policy_reload_failures: u64,
    /// Lockouts triggered
    pub lockouts: u64,
    /// Chains that completed
    pub chains_succeeded: u64,
    /// Chains that failed
    pub chains_failed: u64,
}

impl TelemetrySnapshot {
    /// Fraction of decisions that required step-up
    #[must_use]
    pub fn step_up_rate(&self) -> f64 {
        ratio(self.step_ups, self.decisions)
    }

    /// Fraction of decisions that blocked
    #[must_use]
    pub fn blocked_rate(&self) -> f64 {
        ratio(self.blocked, self.decisions)
    }
}

fn ratio(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64
    }
}

/// Install the global `tracing` subscriber
///
/// # Errors
///
/// Returns error if the filter directive is invalid or a subscriber is
/// already installed
pub fn init_tracing(config: &TelemetryConfig) -> AdaptiveAuthResult<()> {
    let filter = EnvFilter::try_new(&config.log_filter)
        .map_err(|e| AdaptiveAuthError::configuration("telemetry.log_filter", e.to_string()))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = if config.json_logs {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|e| AdaptiveAuthError::configuration("telemetry", e.to_string()))
}
