//! # Behavioral Risk Engine
//!
//! Turns an [`AuthContext`] into a [`RiskAssessment`].
//!
//! - [`BehavioralRiskEngine`] is the pure scorer
//! - [`RiskAssessor`] fetches the user's baseline under a deadline, applies
//!   the active policy snapshot, and degrades to a new-user assessment when
//!   the baseline is late or unavailable (unless strict mode is on)

pub mod engine;
pub mod geo;

pub use engine::{validate_context, BehavioralRiskEngine};

use crate::error::{AdaptiveAuthError, AdaptiveAuthResult};
use crate::policy::PolicyStore;
use crate::retry::RetryPolicy;
use crate::telemetry::AuthMetrics;
use crate::types::{AuthContext, RiskAssessment, UserBehavioralBaseline};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Source of user baselines
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BaselineRepository: Send + Sync {
    /// Baseline for `user_id`, `None` for a user with no history
    ///
    /// # Errors
    ///
    /// Returns a storage error if the lookup fails
    async fn get_baseline(&self, user_id: &str) -> AdaptiveAuthResult<Option<UserBehavioralBaseline>>;
}

/// Baselines held in memory
#[derive(Debug, Default)]
pub struct InMemoryBaselineRepository {
    baselines: DashMap<String, UserBehavioralBaseline>,
}

impl InMemoryBaselineRepository {
    /// Empty repository
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or replace the baseline for `user_id`
    pub fn insert(&self, user_id: impl Into<String>, baseline: UserBehavioralBaseline) {
        self.baselines.insert(user_id.into(), baseline);
    }
}

#[async_trait]
impl BaselineRepository for InMemoryBaselineRepository {
    async fn get_baseline(&self, user_id: &str) -> AdaptiveAuthResult<Option<UserBehavioralBaseline>> {
        Ok(self.baselines.get(user_id).map(|b| b.clone()))
    }
}

/// Settings for [`RiskAssessor`]
#[derive(Debug, Clone)]
pub struct AssessorSettings {
    /// Deadline for the whole baseline lookup, retries included
    pub baseline_deadline: Duration,
    /// Fail instead of degrading when the baseline is late or unavailable
    pub strict_mode: bool,
    /// Retry policy for transient lookup failures
    pub retry: RetryPolicy,
}

/// Risk scoring entry point
pub struct RiskAssessor {
    engine: BehavioralRiskEngine,
    policies: Arc<PolicyStore>,
    baselines: Arc<dyn BaselineRepository>,
    settings: AssessorSettings,
    metrics: Arc<AuthMetrics>,
}

impl RiskAssessor {
    /// Create assessor
    #[must_use]
    pub fn new(
        policies: Arc<PolicyStore>,
        baselines: Arc<dyn BaselineRepository>,
        settings: AssessorSettings,
        metrics: Arc<AuthMetrics>,
    ) -> Self {
        Self {
            engine: BehavioralRiskEngine::new(),
            policies,
            baselines,
            settings,
            metrics,
        }
    }

    /// Assess one authentication context against the active policy
    ///
    /// The policy snapshot is taken once at the start, so a reload that
    /// publishes mid-call does not affect this assessment.
    ///
    /// # Errors
    ///
    /// Returns `InvalidContext` if `user_id` is missing, `PolicyUnavailable`
    /// if no risk policy has loaded, and in strict mode `Timeout` or the
    /// repository error when the baseline cannot be fetched
    pub async fn assess_risk(&self, ctx: &AuthContext) -> AdaptiveAuthResult<RiskAssessment> {
        validate_context(ctx)?;
        let policy = self.policies.current_risk()?;

        let (baseline, degraded) = match self.fetch_baseline(&ctx.user_id).await {
            Ok(baseline) => (baseline, false),
            Err(e) if self.settings.strict_mode => {
                warn!("Baseline lookup for {} failed in strict mode: {}", ctx.user_id, e);
                return Err(e);
            }
            Err(e) => {
                warn!(
                    "Baseline lookup for {} failed, assessing as new user: {}",
                    ctx.user_id, e
                );
                (None, true)
            }
        };

        let mut assessment = self.engine.assess(ctx, baseline.as_ref(), &policy)?;
        assessment.degraded = degraded;

        self.metrics
            .record_assessment(assessment.risk_score, assessment.risk_level, degraded);
        debug!(
            "Risk for {}: score {:.3} level {} confidence {:.2} factors {:?} policy {}",
            assessment.user_id,
            assessment.risk_score,
            assessment.risk_level,
            assessment.confidence,
            assessment.contributions.keys().collect::<Vec<_>>(),
            assessment.policy_version
        );
        Ok(assessment)
    }

    async fn fetch_baseline(
        &self,
        user_id: &str,
    ) -> AdaptiveAuthResult<Option<UserBehavioralBaseline>> {
        let deadline = self.settings.baseline_deadline;
        let lookup = self
            .settings
            .retry
            .run("baseline_fetch", || self.baselines.get_baseline(user_id));

        match tokio::time::timeout(deadline, lookup).await {
            Ok(result) => result,
            Err(_) => Err(AdaptiveAuthError::timeout("baseline_lookup", deadline)),
        }
    }
}
