//! # Step-Up Authenticator
//!
//! Maps a risk assessment onto the authentication level an operation needs.
//!
//! - Per-operation requirements come from the active step-up policy, unknown
//!   operations use the default entry
//! - Only methods the user has registered are offered
//! - No usable method at critical risk blocks the request
//! - An authentication older than the operation's `max_age` counts as basic

use crate::error::{AdaptiveAuthError, AdaptiveAuthResult};
use crate::policy::{OperationPolicy, PolicyKind, PolicyStore, StepUpPolicy};
use crate::telemetry::{AuthMetrics, TelemetrySnapshot};
use crate::types::{AuthLevel, FactorType, RiskAssessment, RiskLevel, StepUpDecision};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Lookup of the MFA methods a user has enrolled
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegisteredMethodsProvider: Send + Sync {
    /// Enrolled factor types for `user_id`
    ///
    /// # Errors
    ///
    /// Returns a storage error if the lookup fails
    async fn registered_methods(&self, user_id: &str) -> AdaptiveAuthResult<HashSet<FactorType>>;
}

/// Registered methods held in memory
#[derive(Debug, Default)]
pub struct InMemoryRegisteredMethods {
    methods: DashMap<String, HashSet<FactorType>>,
}

impl InMemoryRegisteredMethods {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enroll `factor_type` for `user_id`
    pub fn register(&self, user_id: impl Into<String>, factor_type: FactorType) {
        self.methods
            .entry(user_id.into())
            .or_default()
            .insert(factor_type);
    }

    /// Remove an enrolled method; returns whether it existed
    pub fn unregister(&self, user_id: &str, factor_type: FactorType) -> bool {
        self.methods
            .get_mut(user_id)
            .is_some_and(|mut set| set.remove(&factor_type))
    }
}

#[async_trait]
impl RegisteredMethodsProvider for InMemoryRegisteredMethods {
    async fn registered_methods(&self, user_id: &str) -> AdaptiveAuthResult<HashSet<FactorType>> {
        Ok(self
            .methods
            .get(user_id)
            .map(|set| set.clone())
            .unwrap_or_default())
    }
}

/// Advisory threshold that the observed rate exceeds
#[derive(Debug, Clone, PartialEq)]
pub struct AdvisoryAlert {
    /// Signal name
    pub signal: &'static str,
    /// Observed rate
    pub observed: f64,
    /// Policy threshold
    pub threshold: f64,
}

/// Step-up decision maker
pub struct StepUpAuthenticator {
    policies: Arc<PolicyStore>,
    methods: Arc<dyn RegisteredMethodsProvider>,
    metrics: Arc<AuthMetrics>,
}

impl StepUpAuthenticator {
    /// Create authenticator
    #[must_use]
    pub fn new(
        policies: Arc<PolicyStore>,
        methods: Arc<dyn RegisteredMethodsProvider>,
        metrics: Arc<AuthMetrics>,
    ) -> Self {
        Self {
            policies,
            methods,
            metrics,
        }
    }

    /// Decide whether `operation` may proceed at `current_level`
    ///
    /// # Errors
    ///
    /// Returns `PolicyUnavailable` if no step-up policy is loaded, or the
    /// provider error when registered methods cannot be read
    pub async fn evaluate(
        &self,
        operation: &str,
        assessment: &RiskAssessment,
        current_level: AuthLevel,
    ) -> AdaptiveAuthResult<StepUpDecision> {
        self.evaluate_with_auth_time(operation, assessment, current_level, None)
            .await
    }

    /// Like [`evaluate`](Self::evaluate), also enforcing the operation's
    /// `max_age` against `authenticated_at`
    ///
    /// Age is measured at `assessment.evaluated_at`.
    ///
    /// # Errors
    ///
    /// Same as [`evaluate`](Self::evaluate)
    pub async fn evaluate_with_auth_time(
        &self,
        operation: &str,
        assessment: &RiskAssessment,
        current_level: AuthLevel,
        authenticated_at: Option<DateTime<Utc>>,
    ) -> AdaptiveAuthResult<StepUpDecision> {
        let policy = self.policies.current_step_up()?;
        let (policy_operation, entry) = lookup(&policy, operation)?;

        let effective = effective_level(entry, current_level, authenticated_at, assessment.evaluated_at);
        if effective < current_level {
            info!(
                "Authentication for {} is older than {:?}, treating as {}",
                assessment.user_id, entry.max_age, effective
            );
        }

        let required_level = entry.required_level(assessment.risk_level);
        let mut decision = StepUpDecision {
            operation: operation.to_string(),
            policy_operation: policy_operation.to_string(),
            risk_level: assessment.risk_level,
            current_level: effective,
            required_level,
            allowed_methods: Vec::new(),
            step_up_required: false,
            blocked: false,
        };

        if effective < required_level {
            let registered = self.methods.registered_methods(&assessment.user_id).await?;
            decision.allowed_methods = allowed_methods(required_level, &registered);
            decision.step_up_required = true;
            decision.blocked =
                decision.allowed_methods.is_empty() && assessment.risk_level == RiskLevel::Critical;
        }

        self.metrics.record_decision(&decision);
        if decision.blocked {
            warn!(
                "Blocked {} for {}: {} risk requires {} and no method is registered",
                operation, assessment.user_id, decision.risk_level, required_level
            );
        } else {
            debug!(
                "Step-up for {} on {} (policy {}): risk {} current {} required {} methods {:?}",
                assessment.user_id,
                operation,
                policy_operation,
                decision.risk_level,
                effective,
                required_level,
                decision.allowed_methods
            );
        }
        Ok(decision)
    }

    /// Compare observed rates against the policy's advisory thresholds
    ///
    /// Alerts are logged and returned; decisions are never affected.
    ///
    /// # Errors
    ///
    /// Returns `PolicyUnavailable` if no step-up policy is loaded
    pub fn advisory_alerts(&self, snapshot: &TelemetrySnapshot) -> AdaptiveAuthResult<Vec<AdvisoryAlert>> {
        let policy = self.policies.current_step_up()?;
        let mut alerts = Vec::new();

        let step_up_rate = snapshot.step_up_rate();
        if step_up_rate > policy.step_up_rate_threshold {
            alerts.push(AdvisoryAlert {
                signal: "step_up_rate",
                observed: step_up_rate,
                threshold: policy.step_up_rate_threshold,
            });
        }
        let blocked_rate = snapshot.blocked_rate();
        if blocked_rate > policy.blocked_operation_rate_threshold {
            alerts.push(AdvisoryAlert {
                signal: "blocked_operation_rate",
                observed: blocked_rate,
                threshold: policy.blocked_operation_rate_threshold,
            });
        }

        for alert in &alerts {
            warn!(
                "Advisory threshold exceeded: {} at {:.3} (threshold {:.3})",
                alert.signal, alert.observed, alert.threshold
            );
        }
        Ok(alerts)
    }
}

fn lookup<'a>(policy: &'a StepUpPolicy, operation: &str) -> AdaptiveAuthResult<(&'a str, &'a OperationPolicy)> {
    policy
        .operation(operation)
        .ok_or_else(|| AdaptiveAuthError::PolicyUnavailable {
            policy: PolicyKind::StepUp.to_string(),
        })
}

/// Current level after applying the operation's `max_age`
#[must_use]
pub fn effective_level(
    entry: &OperationPolicy,
    current_level: AuthLevel,
    authenticated_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> AuthLevel {
    match (entry.max_age, authenticated_at) {
        (Some(max_age), Some(at)) => {
            let age = now.signed_duration_since(at);
            if age > crate::clock::to_chrono(max_age) {
                AuthLevel::Basic
            } else {
                current_level
            }
        }
        _ => current_level,
    }
}

/// Methods of `required` the user has registered, in stable order
#[must_use]
pub fn allowed_methods(required: AuthLevel, registered: &HashSet<FactorType>) -> Vec<FactorType> {
    let mut methods: Vec<FactorType> = required
        .step_up_methods()
        .iter()
        .copied()
        .filter(|m| registered.contains(m))
        .collect();
    methods.sort();
    methods
}
