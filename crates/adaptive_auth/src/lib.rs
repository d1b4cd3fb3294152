//! # Adaptive Authentication Core
//!
//! Risk-based authentication decisions for an identity provider.
//!
//! ## Features
//!
//! - **Policy Store**: YAML risk and step-up policies, validated and published
//!   as immutable snapshots, hot reloaded with last-known-good fallback
//! - **Behavioral Risk Engine**: weighted factor scoring against the user's
//!   baseline, with a confidence value and deadline-bounded baseline lookup
//! - **Step-Up Authenticator**: per-operation assurance requirements by risk
//!   level, intersected with the user's registered methods
//! - **MFA Chain Orchestrator**: ordered factor chains with single-use nonces,
//!   expiry, lockout and audit
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use adaptive_auth::{AdaptiveAuth, Collaborators};
//! use adaptive_auth::config::AdaptiveAuthConfig;
//! use adaptive_auth::types::{AuthContext, AuthLevel};
//!
//! # async fn run(collaborators: Collaborators) -> adaptive_auth::error::AdaptiveAuthResult<()> {
//! let auth = AdaptiveAuth::new(AdaptiveAuthConfig::new_production(), collaborators)?;
//! auth.load_policies().await?;
//!
//! let ctx = AuthContext::new("alice", chrono::Utc::now()).with_operation("transfer_funds");
//! let outcome = auth.authorize(&ctx, AuthLevel::Basic).await?;
//! println!("{:?}", outcome.verdict);
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    bad_style,
    dead_code,
    improper_ctypes,
    non_shorthand_field_patterns,
    no_mangle_generic_items,
    overflowing_literals,
    path_statements,
    patterns_in_fns_without_body,
    unconditional_recursion,
    unused,
    unused_allocation,
    unused_comparisons,
    unused_parens,
    while_true
)]

pub mod audit;
pub mod clock;
pub mod config;
pub mod error;
pub mod mfa;
pub mod policy;
pub mod retry;
pub mod risk;
pub mod step_up;
pub mod telemetry;
pub mod types;

use crate::audit::AuditSink;
use crate::clock::SharedClock;
use crate::config::AdaptiveAuthConfig;
use crate::error::AdaptiveAuthResult;
use crate::mfa::{ChainStart, MfaOrchestrator, OrchestratorSettings, SessionStore, ValidatorRegistry};
use crate::policy::{HotReloadHandle, PolicySource, PolicyStore};
use crate::risk::{AssessorSettings, BaselineRepository, RiskAssessor};
use crate::step_up::{RegisteredMethodsProvider, StepUpAuthenticator};
use crate::telemetry::AuthMetrics;
use crate::types::{AuthContext, AuthLevel, RiskAssessment, StepUpDecision};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use crate::error::AdaptiveAuthError;

/// External systems the core talks to
pub struct Collaborators {
    /// Policy documents
    pub policy_source: Arc<dyn PolicySource>,
    /// User baselines
    pub baselines: Arc<dyn BaselineRepository>,
    /// Enrolled MFA methods
    pub methods: Arc<dyn RegisteredMethodsProvider>,
    /// Chain sessions and lockouts
    pub sessions: Arc<dyn SessionStore>,
    /// Factor validators
    pub validators: ValidatorRegistry,
    /// Audit destination
    pub audit: Arc<dyn AuditSink>,
    /// Time source
    pub clock: SharedClock,
}

/// What the caller should do with the request
#[derive(Debug, Clone)]
pub enum Verdict {
    /// Proceed
    Allow,
    /// Complete the started chain first
    StepUp(ChainStart),
    /// Step-up is required but the user has no usable method
    StepUpUnavailable,
    /// Deny
    Block,
}

/// Full result of [`AdaptiveAuth::authorize`]
#[derive(Debug, Clone)]
pub struct AuthorizationOutcome {
    /// Risk assessment
    pub assessment: RiskAssessment,
    /// Step-up decision
    pub decision: StepUpDecision,
    /// Resulting action
    pub verdict: Verdict,
}

/// Wired-up adaptive authentication core
pub struct AdaptiveAuth {
    config: AdaptiveAuthConfig,
    metrics: Arc<AuthMetrics>,
    policies: Arc<PolicyStore>,
    assessor: RiskAssessor,
    step_up: StepUpAuthenticator,
    mfa: MfaOrchestrator,
}

impl AdaptiveAuth {
    /// Build every component from `config` and `collaborators`
    ///
    /// No policy is loaded yet; call [`load_policies`](Self::load_policies).
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn new(config: AdaptiveAuthConfig, collaborators: Collaborators) -> AdaptiveAuthResult<Self> {
        config.validate()?;

        let metrics = Arc::new(AuthMetrics::new());
        let retry = config.retry_policy();
        let policies = Arc::new(PolicyStore::new(
            collaborators.policy_source,
            retry.clone(),
            Arc::clone(&metrics),
        ));
        let assessor = RiskAssessor::new(
            Arc::clone(&policies),
            collaborators.baselines,
            AssessorSettings {
                baseline_deadline: config.baseline_deadline(),
                strict_mode: config.risk.strict_mode,
                retry,
            },
            Arc::clone(&metrics),
        );
        let step_up = StepUpAuthenticator::new(
            Arc::clone(&policies),
            collaborators.methods,
            Arc::clone(&metrics),
        );
        let mfa = MfaOrchestrator::new(
            collaborators.sessions,
            collaborators.validators,
            collaborators.audit,
            collaborators.clock,
            OrchestratorSettings::from(&config.mfa),
            Arc::clone(&metrics),
        );

        info!(
            "Adaptive auth initialized (strict_mode={}, baseline deadline {:?})",
            config.risk.strict_mode,
            config.baseline_deadline()
        );

        Ok(Self {
            config,
            metrics,
            policies,
            assessor,
            step_up,
            mfa,
        })
    }

    /// Load both policy families
    ///
    /// # Errors
    ///
    /// Returns the first load error
    pub async fn load_policies(&self) -> AdaptiveAuthResult<()> {
        self.policies.reload_all().await
    }

    /// Start polling the policy source at the configured interval
    #[must_use]
    pub fn spawn_hot_reload(&self) -> HotReloadHandle {
        self.policies.spawn_hot_reload(self.config.reload_interval())
    }

    /// Assess, decide, and start a chain when step-up is needed
    ///
    /// Uses `ctx.operation`, or the policy's default operation when absent.
    ///
    /// # Errors
    ///
    /// Propagates assessment, decision and chain start errors; callers must
    /// fail closed on any error
    pub async fn authorize(
        &self,
        ctx: &AuthContext,
        current_level: AuthLevel,
    ) -> AdaptiveAuthResult<AuthorizationOutcome> {
        self.authorize_with_auth_time(ctx, current_level, None).await
    }

    /// Like [`authorize`](Self::authorize), also enforcing the operation's
    /// `max_age` against `authenticated_at`
    ///
    /// # Errors
    ///
    /// Same as [`authorize`](Self::authorize)
    pub async fn authorize_with_auth_time(
        &self,
        ctx: &AuthContext,
        current_level: AuthLevel,
        authenticated_at: Option<DateTime<Utc>>,
    ) -> AdaptiveAuthResult<AuthorizationOutcome> {
        let assessment = self.assessor.assess_risk(ctx).await?;
        let operation = match &ctx.operation {
            Some(operation) => operation.clone(),
            None => self.policies.current_step_up()?.default_operation.clone(),
        };
        let decision = self
            .step_up
            .evaluate_with_auth_time(&operation, &assessment, current_level, authenticated_at)
            .await?;

        let verdict = if decision.blocked {
            warn!(
                "Blocking {} for {} at {} risk",
                operation, ctx.user_id, assessment.risk_level
            );
            Verdict::Block
        } else if !decision.step_up_required {
            Verdict::Allow
        } else {
            match decision
                .allowed_methods
                .iter()
                .copied()
                .find(|m| self.mfa.supports(*m))
            {
                Some(method) => Verdict::StepUp(self.mfa.start_chain(&ctx.user_id, vec![method]).await?),
                None => {
                    debug!(
                        "No usable {} method for {} on {}",
                        decision.required_level, ctx.user_id, operation
                    );
                    Verdict::StepUpUnavailable
                }
            }
        };

        Ok(AuthorizationOutcome {
            assessment,
            decision,
            verdict,
        })
    }

    /// Active configuration
    #[must_use]
    pub const fn config(&self) -> &AdaptiveAuthConfig {
        &self.config
    }

    /// Shared counters
    #[must_use]
    pub fn metrics(&self) -> &Arc<AuthMetrics> {
        &self.metrics
    }

    /// Policy store
    #[must_use]
    pub fn policies(&self) -> &Arc<PolicyStore> {
        &self.policies
    }

    /// Risk assessor
    #[must_use]
    pub const fn assessor(&self) -> &RiskAssessor {
        &self.assessor
    }

    /// Step-up authenticator
    #[must_use]
    pub const fn step_up(&self) -> &StepUpAuthenticator {
        &self.step_up
    }

    /// MFA orchestrator
    #[must_use]
    pub const fn mfa(&self) -> &MfaOrchestrator {
        &self.mfa
    }
}
