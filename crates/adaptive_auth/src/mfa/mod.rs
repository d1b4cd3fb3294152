//! # MFA Chain Orchestrator
//!
//! Drives a user through an ordered list of factors.
//!
//! ## Features
//!
//! - **Single-use nonces**: each challenge carries a UUIDv7 nonce consumed by
//!   a conditional write; the losers of a race see a replay
//! - **Expiry precedence**: an expired nonce fails before any validator runs
//! - **Lockout**: exhausting a factor's attempts locks that factor type for the
//!   user and invalidates the chain
//! - **Audit**: replays, lockouts and partial completions reach the audit sink
//!
//! Session writes other than nonce consumption use optimistic versioning with
//! bounded retry.

pub mod session;
pub mod store;
pub mod validator;

pub use session::{Challenge, FactorState, MfaFactor, MfaSession, SessionState};
pub use store::{InMemorySessionStore, NonceConsumption, SessionStore};
pub use validator::{FactorValidator, ValidatorRegistry};

use crate::audit::{AuditEntry, AuditEvent, AuditSink};
use crate::clock::{to_chrono, SharedClock};
use crate::config::{FactorSettingsTable, MfaConfig};
use crate::error::{AdaptiveAuthError, AdaptiveAuthResult};
use crate::telemetry::AuthMetrics;
use crate::types::FactorType;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Orchestrator settings
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Chain session lifetime
    pub session_ttl: Duration,
    /// Deadline for one validator call
    pub validator_deadline: Duration,
    /// Optimistic update attempts before giving up
    pub max_update_retries: u32,
    /// Per factor type nonce and lockout settings
    pub factors: FactorSettingsTable,
}

impl From<&MfaConfig> for OrchestratorSettings {
    fn from(config: &MfaConfig) -> Self {
        Self {
            session_ttl: Duration::from_secs(config.session_ttl_secs),
            validator_deadline: Duration::from_millis(config.validator_deadline_ms),
            max_update_retries: config.max_update_retries,
            factors: config.factors.clone(),
        }
    }
}

/// Newly started chain
#[derive(Debug, Clone)]
pub struct ChainStart {
    /// Stored session
    pub session: MfaSession,
    /// Challenge for the first factor
    pub challenge: Challenge,
}

/// Result of an accepted factor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationOutcome {
    /// Chain state after the factor
    pub state: SessionState,
    /// Challenge for the next factor, if any
    pub next_challenge: Option<Challenge>,
}

impl ValidationOutcome {
    /// Every required factor is complete
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.state == SessionState::ChainSuccess
    }
}

enum Mutation<T> {
    Write(T),
    Unchanged(T),
}

enum Rejection {
    Retry { attempts_remaining: u32 },
    Locked { locked_until: DateTime<Utc> },
    AlreadyAccepted,
}

/// MFA chain driver
pub struct MfaOrchestrator {
    store: Arc<dyn SessionStore>,
    validators: ValidatorRegistry,
    audit: Arc<dyn AuditSink>,
    clock: SharedClock,
    settings: OrchestratorSettings,
    metrics: Arc<AuthMetrics>,
}

impl std::fmt::Debug for MfaOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MfaOrchestrator")
            .field("validators", &self.validators)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl MfaOrchestrator {
    /// Create orchestrator
    #[must_use]
    pub fn new(
        store: Arc<dyn SessionStore>,
        validators: ValidatorRegistry,
        audit: Arc<dyn AuditSink>,
        clock: SharedClock,
        settings: OrchestratorSettings,
        metrics: Arc<AuthMetrics>,
    ) -> Self {
        Self {
            store,
            validators,
            audit,
            clock,
            settings,
            metrics,
        }
    }

    /// Start a chain for `user_id` over `required` factor types, in order
    ///
    /// # Errors
    ///
    /// Returns `InvalidContext` for a blank user or empty method list,
    /// `NoValidator` for an unsupported factor type, `Lockout` if any of the
    /// factor types is locked for the user
    pub async fn start_chain(&self, user_id: &str, required: Vec<FactorType>) -> AdaptiveAuthResult<ChainStart> {
        if user_id.trim().is_empty() {
            return Err(AdaptiveAuthError::invalid_context("user_id", "must not be empty"));
        }
        if required.is_empty() {
            return Err(AdaptiveAuthError::invalid_context(
                "required_methods",
                "at least one factor is required",
            ));
        }

        let now = self.clock.now();
        let distinct: BTreeSet<FactorType> = required.iter().copied().collect();
        for factor_type in distinct {
            self.validators.get(factor_type)?;
            self.ensure_not_locked(user_id, factor_type, now).await?;
        }

        let mut session = MfaSession::new(user_id, required, now, self.settings.session_ttl);
        session.transition(SessionState::FactorPending)?;
        let first = session.required[0];
        let factor_id = session.issue_next_factor(self.settings.factors.get(first), now)?;
        let challenge = session
            .factor(factor_id)
            .map(|f| session.challenge(f))
            .ok_or_else(|| AdaptiveAuthError::Internal {
                reason: "issued factor missing from session".to_string(),
            })?;

        self.store.insert(session.clone()).await?;
        self.audit(&session, AuditEvent::ChainStarted {
            required: session.required.clone(),
        });
        info!(
            "Started MFA chain {} for {} requiring {:?}",
            session.id, session.user_id, session.required
        );
        Ok(ChainStart { session, challenge })
    }

    /// Validate `credential` for one factor of a chain
    ///
    /// # Errors
    ///
    /// - `ReplayAttack` if the factor's nonce was already consumed
    /// - `SessionExpired`, `SessionTerminated` or `FactorNotActive` for a
    ///   session or factor that cannot accept credentials
    /// - `Lockout` while the factor type is locked for the user
    /// - `NonceExpired` if the challenge is past its expiry
    /// - `Timeout` or the validator's error if the check cannot complete
    /// - `FactorValidationFailed` for a wrong credential with attempts left
    pub async fn validate_factor(
        &self,
        session_id: Uuid,
        factor_id: Uuid,
        credential: &str,
    ) -> AdaptiveAuthResult<ValidationOutcome> {
        let now = self.clock.now();
        let loaded = self.load(session_id).await?;
        let factor = find_factor(&loaded, factor_id)?.clone();

        if factor.nonce_used_at.is_some() {
            return Err(self.replay_detected(&loaded.challenge(&factor)));
        }
        if loaded.is_expired(now) {
            return Err(AdaptiveAuthError::SessionExpired {
                session_id: session_id.to_string(),
            });
        }
        self.ensure_not_locked(&loaded.user_id, factor.factor_type, now)
            .await?;

        let begun = self
            .update_session(session_id, |s| {
                let f = find_factor(s, factor_id)?;
                if f.nonce_used_at.is_some() {
                    return Err(AdaptiveAuthError::ReplayAttack {
                        factor_id: factor_id.to_string(),
                    });
                }
                ensure_open(s)?;
                ensure_active(s, factor_id)?;
                if f.is_nonce_expired(now) {
                    return Err(AdaptiveAuthError::NonceExpired {
                        factor_id: factor_id.to_string(),
                        expired_at: f.nonce_expires_at,
                    });
                }
                let challenge = s.challenge(f);
                if s.state == SessionState::FactorValidating {
                    return Ok(Mutation::Unchanged(challenge));
                }
                s.transition(SessionState::FactorValidating)?;
                if let Some(f) = s.factor_mut(factor_id) {
                    f.state = FactorState::Validating;
                }
                Ok(Mutation::Write(challenge))
            })
            .await;

        let challenge = match begun {
            Ok((_, challenge)) => challenge,
            Err(AdaptiveAuthError::ReplayAttack { .. }) => {
                return Err(self.replay_detected(&loaded.challenge(&factor)));
            }
            Err(e) => return Err(e),
        };

        let validator = self.validators.get(challenge.factor_type)?;
        let deadline = self.settings.validator_deadline;
        let verdict = tokio::time::timeout(deadline, validator.validate(&challenge, credential)).await;

        match verdict {
            Err(_) => {
                warn!(
                    "Validator for {} timed out after {:?} on session {}",
                    challenge.factor_type, deadline, session_id
                );
                self.revert_validation(&challenge).await;
                Err(AdaptiveAuthError::timeout("factor_validation", deadline))
            }
            Ok(Err(e)) => {
                warn!(
                    "Validator for {} failed on session {}: {}",
                    challenge.factor_type, session_id, e
                );
                self.revert_validation(&challenge).await;
                Err(e)
            }
            Ok(Ok(true)) => self.accept(&challenge).await,
            Ok(Ok(false)) => self.reject(&challenge).await,
        }
    }

    /// Issue a fresh nonce for the active factor, typically after expiry
    ///
    /// The previous nonce stops being accepted.
    ///
    /// # Errors
    ///
    /// Returns `SessionExpired`, `SessionTerminated`, `Lockout` or
    /// `FactorNotActive` when no new challenge may be issued
    pub async fn reissue_challenge(&self, session_id: Uuid, factor_id: Uuid) -> AdaptiveAuthResult<Challenge> {
        let now = self.clock.now();
        let loaded = self.load(session_id).await?;
        let factor_type = find_factor(&loaded, factor_id)?.factor_type;
        if loaded.is_expired(now) {
            return Err(AdaptiveAuthError::SessionExpired {
                session_id: session_id.to_string(),
            });
        }
        self.ensure_not_locked(&loaded.user_id, factor_type, now).await?;

        let ttl = self.settings.factors.get(factor_type).nonce_ttl();
        let (_, challenge) = self
            .update_session(session_id, |s| {
                ensure_open(s)?;
                ensure_active(s, factor_id)?;
                if s.state == SessionState::FactorValidating {
                    return Err(AdaptiveAuthError::FactorNotActive {
                        factor_id: factor_id.to_string(),
                        reason: "validation in progress".to_string(),
                    });
                }
                let pending = s.state;
                s.transition(pending)?;
                let f = s.factor_mut(factor_id).ok_or_else(|| factor_not_found(factor_id))?;
                f.reissue_nonce(ttl, now);
                let f = find_factor(s, factor_id)?;
                Ok(Mutation::Write(s.challenge(f)))
            })
            .await?;

        debug!(
            "Re-issued challenge for factor {} on session {}",
            factor_id, session_id
        );
        Ok(challenge)
    }

    /// Challenge currently awaiting a credential
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown session, `SessionExpired` for an
    /// expired one
    pub async fn current_challenge(&self, session_id: Uuid) -> AdaptiveAuthResult<Option<Challenge>> {
        let session = self.load(session_id).await?;
        if session.is_expired(self.clock.now()) {
            return Err(AdaptiveAuthError::SessionExpired {
                session_id: session_id.to_string(),
            });
        }
        if session.state.is_terminal() {
            return Ok(None);
        }
        Ok(session.active_factor().map(|f| session.challenge(f)))
    }

    /// Invalidate a chain at the caller's request
    ///
    /// Cancelling an invalidated chain is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `SessionTerminated` for a chain that already succeeded
    pub async fn cancel_chain(&self, session_id: Uuid) -> AdaptiveAuthResult<MfaSession> {
        let (session, cancelled) = self
            .update_session(session_id, |s| match s.state {
                SessionState::SessionInvalidated => Ok(Mutation::Unchanged(false)),
                SessionState::ChainSuccess => Err(terminated(s)),
                _ => {
                    s.fail_chain(None)?;
                    Ok(Mutation::Write(true))
                }
            })
            .await?;

        if cancelled {
            self.audit(&session, AuditEvent::ChainCancelled);
            self.metrics.record_chain_outcome(false);
            info!("Cancelled MFA chain {} for {}", session.id, session.user_id);
        }
        Ok(session)
    }

    /// Whether a validator is registered for `factor_type`
    #[must_use]
    pub fn supports(&self, factor_type: FactorType) -> bool {
        self.validators.supports(factor_type)
    }

    /// Current session record
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for an unknown session
    pub async fn session(&self, session_id: Uuid) -> AdaptiveAuthResult<MfaSession> {
        self.load(session_id).await
    }

    async fn accept(&self, challenge: &Challenge) -> AdaptiveAuthResult<ValidationOutcome> {
        let now = self.clock.now();
        let consumption = self
            .store
            .consume_nonce(challenge.session_id, challenge.factor_id, challenge.nonce, now)
            .await?;

        match consumption {
            NonceConsumption::Consumed => {}
            NonceConsumption::AlreadyUsed => return Err(self.replay_detected(challenge)),
            NonceConsumption::Superseded => {
                let session = self.load(challenge.session_id).await?;
                if session.state.is_terminal() {
                    return Err(terminated(&session));
                }
                return Err(AdaptiveAuthError::NonceExpired {
                    factor_id: challenge.factor_id.to_string(),
                    expired_at: challenge.expires_at,
                });
            }
        }

        let (session, next_challenge) = self
            .update_session(challenge.session_id, |s| {
                if s.state.is_terminal() {
                    return Ok(Mutation::Unchanged(None));
                }
                if s.state.is_awaiting_factor() {
                    s.transition(SessionState::FactorValidating)?;
                }
                s.transition(SessionState::FactorSuccess)?;
                match s.next_required() {
                    Some(next) => {
                        let id = s.issue_next_factor(self.settings.factors.get(next), now)?;
                        s.transition(SessionState::NextFactorPending)?;
                        let f = find_factor(s, id)?;
                        Ok(Mutation::Write(Some(s.challenge(f))))
                    }
                    None => {
                        s.transition(SessionState::ChainSuccess)?;
                        Ok(Mutation::Write(None))
                    }
                }
            })
            .await?;

        if session.state == SessionState::ChainSuccess {
            self.audit(&session, AuditEvent::ChainSucceeded {
                completed: session.completed(),
            });
            self.metrics.record_chain_outcome(true);
            info!("MFA chain {} succeeded for {}", session.id, session.user_id);
        } else {
            debug!(
                "Factor {} accepted on session {}, state {}",
                challenge.factor_type, session.id, session.state
            );
        }

        Ok(ValidationOutcome {
            state: session.state,
            next_challenge,
        })
    }

    async fn reject(&self, challenge: &Challenge) -> AdaptiveAuthResult<ValidationOutcome> {
        let now = self.clock.now();
        let settings = *self.settings.factors.get(challenge.factor_type);
        let locked_until = now + to_chrono(settings.lockout_duration());

        let (session, rejection) = self
            .update_session(challenge.session_id, |s| {
                if find_factor(s, challenge.factor_id)?.nonce_used_at.is_some() {
                    return Ok(Mutation::Unchanged(Rejection::AlreadyAccepted));
                }
                if s.state.is_terminal() {
                    return Err(terminated(s));
                }
                let pending = s.pending_state();
                let f = s
                    .factor_mut(challenge.factor_id)
                    .ok_or_else(|| factor_not_found(challenge.factor_id))?;

                f.attempt_count += 1;
                if f.attempt_count >= f.max_attempts {
                    f.state = FactorState::Locked;
                    s.fail_chain(Some(challenge.factor_id))?;
                    return Ok(Mutation::Write(Rejection::Locked { locked_until }));
                }

                f.reissue_nonce(settings.nonce_ttl(), now);
                let attempts_remaining = f.attempts_remaining();
                if s.state == SessionState::FactorValidating {
                    s.transition(SessionState::FactorFailed)?;
                }
                s.transition(pending)?;
                Ok(Mutation::Write(Rejection::Retry { attempts_remaining }))
            })
            .await?;

        match rejection {
            Rejection::Retry { attempts_remaining } => {
                info!(
                    "Factor {} rejected on session {}, {} attempts remaining",
                    challenge.factor_type, session.id, attempts_remaining
                );
                Err(AdaptiveAuthError::FactorValidationFailed {
                    factor_id: challenge.factor_id.to_string(),
                    attempts_remaining,
                })
            }
            // A concurrent credential consumed the nonce first.
            Rejection::AlreadyAccepted => Err(self.replay_detected(challenge)),
            Rejection::Locked { locked_until } => {
                // Written only once the counted attempt reached the limit.
                self.store
                    .set_lockout(&session.user_id, challenge.factor_type, locked_until)
                    .await?;
                self.chain_locked(&session, challenge, locked_until);
                Err(AdaptiveAuthError::Lockout {
                    user_id: session.user_id.clone(),
                    factor_type: challenge.factor_type.to_string(),
                    locked_until,
                })
            }
        }
    }

    fn chain_locked(&self, session: &MfaSession, challenge: &Challenge, locked_until: DateTime<Utc>) {
        warn!(
            "Locked {} for {} until {} after exhausting attempts on session {}",
            challenge.factor_type, session.user_id, locked_until, session.id
        );
        self.metrics.record_lockout(challenge.factor_type.as_str());
        self.metrics.record_chain_outcome(false);
        self.audit(session, AuditEvent::LockoutTriggered {
            factor_type: challenge.factor_type,
            locked_until,
        });
        self.audit(session, AuditEvent::PartialCompletion {
            failed_factor: Some(challenge.factor_id),
            failed_type: Some(challenge.factor_type),
            completed: session.completed(),
            reason: "max_attempts_exceeded".to_string(),
        });
    }

    async fn revert_validation(&self, challenge: &Challenge) {
        let result = self
            .update_session(challenge.session_id, |s| {
                let still_validating = s.state == SessionState::FactorValidating
                    && s.factor(challenge.factor_id).is_some_and(|f| {
                        f.state == FactorState::Validating && f.nonce == challenge.nonce
                    });
                if !still_validating {
                    return Ok(Mutation::Unchanged(()));
                }
                let pending = s.pending_state();
                s.transition(pending)?;
                if let Some(f) = s.factor_mut(challenge.factor_id) {
                    f.state = FactorState::Pending;
                }
                Ok(Mutation::Write(()))
            })
            .await;
        if let Err(e) = result {
            error!(
                "Could not return session {} to pending: {}",
                challenge.session_id, e
            );
        }
    }

    async fn ensure_not_locked(
        &self,
        user_id: &str,
        factor_type: FactorType,
        now: DateTime<Utc>,
    ) -> AdaptiveAuthResult<()> {
        match self.store.lockout(user_id, factor_type).await? {
            Some(locked_until) if locked_until > now => Err(AdaptiveAuthError::Lockout {
                user_id: user_id.to_string(),
                factor_type: factor_type.to_string(),
                locked_until,
            }),
            _ => Ok(()),
        }
    }

    fn replay_detected(&self, challenge: &Challenge) -> AdaptiveAuthError {
        warn!(
            "Replay of {} nonce on session {} for {}",
            challenge.factor_type, challenge.session_id, challenge.user_id
        );
        self.metrics.record_replay();
        self.audit.record(AuditEntry {
            at: self.clock.now(),
            user_id: challenge.user_id.clone(),
            session_id: challenge.session_id,
            event: AuditEvent::ReplayAttempt {
                factor_id: challenge.factor_id,
                factor_type: challenge.factor_type,
            },
        });
        AdaptiveAuthError::ReplayAttack {
            factor_id: challenge.factor_id.to_string(),
        }
    }

    fn audit(&self, session: &MfaSession, event: AuditEvent) {
        self.audit.record(AuditEntry {
            at: self.clock.now(),
            user_id: session.user_id.clone(),
            session_id: session.id,
            event,
        });
    }

    async fn load(&self, session_id: Uuid) -> AdaptiveAuthResult<MfaSession> {
        self.store
            .get(session_id)
            .await?
            .ok_or_else(|| AdaptiveAuthError::not_found("mfa_session", session_id.to_string()))
    }

    async fn update_session<T, F>(&self, session_id: Uuid, mut mutate: F) -> AdaptiveAuthResult<(MfaSession, T)>
    where
        F: FnMut(&mut MfaSession) -> AdaptiveAuthResult<Mutation<T>> + Send,
        T: Send,
    {
        let mut expected = 0;
        for attempt in 1..=self.settings.max_update_retries {
            let mut session = self.load(session_id).await?;
            expected = session.version;
            match mutate(&mut session)? {
                Mutation::Unchanged(value) => return Ok((session, value)),
                Mutation::Write(value) => match self.store.update(session, expected).await {
                    Ok(stored) => return Ok((stored, value)),
                    Err(AdaptiveAuthError::VersionConflict { .. }) => {
                        debug!(
                            "Version conflict on session {} (attempt {})",
                            session_id, attempt
                        );
                    }
                    Err(e) => return Err(e),
                },
            }
        }
        Err(AdaptiveAuthError::VersionConflict {
            session_id: session_id.to_string(),
            expected,
        })
    }
}

fn find_factor(session: &MfaSession, factor_id: Uuid) -> AdaptiveAuthResult<&MfaFactor> {
    session
        .factor(factor_id)
        .ok_or_else(|| factor_not_found(factor_id))
}

fn factor_not_found(factor_id: Uuid) -> AdaptiveAuthError {
    AdaptiveAuthError::not_found("mfa_factor", factor_id.to_string())
}

fn terminated(session: &MfaSession) -> AdaptiveAuthError {
    AdaptiveAuthError::SessionTerminated {
        session_id: session.id.to_string(),
        state: session.state.to_string(),
    }
}

fn ensure_open(session: &MfaSession) -> AdaptiveAuthResult<()> {
    if session.state.is_terminal() {
        return Err(terminated(session));
    }
    Ok(())
}

fn ensure_active(session: &MfaSession, factor_id: Uuid) -> AdaptiveAuthResult<()> {
    match session.active_factor() {
        Some(active) if active.id == factor_id => Ok(()),
        Some(_) => Err(AdaptiveAuthError::FactorNotActive {
            factor_id: factor_id.to_string(),
            reason: "another factor is pending".to_string(),
        }),
        None => Err(AdaptiveAuthError::FactorNotActive {
            factor_id: factor_id.to_string(),
            reason: format!("session is {}", session.state),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::clock::ManualClock;
    use crate::config::FactorSettings;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use super::validator::MockFactorValidator;

    struct Harness {
        orchestrator: MfaOrchestrator,
        clock: ManualClock,
        audit: Arc<MemoryAuditSink>,
        metrics: Arc<AuthMetrics>,
    }

    fn settings() -> OrchestratorSettings {
        let short = FactorSettings {
            nonce_ttl_secs: 300,
            max_attempts: 3,
            lockout_duration_secs: 900,
        };
        OrchestratorSettings {
            session_ttl: Duration::from_secs(1_800),
            validator_deadline: Duration::from_millis(100),
            max_update_retries: 8,
            factors: FactorSettingsTable {
                otp: short,
                totp: short,
                magic_link: FactorSettings {
                    nonce_ttl_secs: 900,
                    ..short
                },
                webauthn: short,
                hardware_key: short,
            },
        }
    }

    fn accepting(code: &'static str) -> Arc<MockFactorValidator> {
        let mut validator = MockFactorValidator::new();
        validator
            .expect_validate()
            .returning(move |_, credential| Ok(credential == code));
        Arc::new(validator)
    }

    fn harness_with(validators: ValidatorRegistry, store: Arc<dyn SessionStore>) -> Harness {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap());
        let audit = Arc::new(MemoryAuditSink::new());
        let metrics = Arc::new(AuthMetrics::new());
        let orchestrator = MfaOrchestrator::new(
            store,
            validators,
            Arc::clone(&audit) as Arc<dyn AuditSink>,
            Arc::new(clock.clone()),
            settings(),
            Arc::clone(&metrics),
        );
        Harness {
            orchestrator,
            clock,
            audit,
            metrics,
        }
    }

    fn harness() -> Harness {
        let validators = ValidatorRegistry::new()
            .with(FactorType::Totp, accepting("123456"))
            .with(FactorType::WebAuthn, accepting("assertion"));
        harness_with(validators, Arc::new(InMemorySessionStore::new()))
    }

    #[tokio::test]
    async fn test_two_factor_chain_succeeds() -> AdaptiveAuthResult<()> {
        let h = harness();
        let start = h
            .orchestrator
            .start_chain("alice", vec![FactorType::Totp, FactorType::WebAuthn])
            .await?;
        assert_eq!(start.session.state, SessionState::FactorPending);
        assert_eq!(start.challenge.factor_type, FactorType::Totp);

        let first = h
            .orchestrator
            .validate_factor(start.session.id, start.challenge.factor_id, "123456")
            .await?;
        assert_eq!(first.state, SessionState::NextFactorPending);
        let next = first.next_challenge.unwrap();
        assert_eq!(next.factor_type, FactorType::WebAuthn);

        let second = h
            .orchestrator
            .validate_factor(start.session.id, next.factor_id, "assertion")
            .await?;
        assert!(second.is_complete());
        assert!(second.next_challenge.is_none());
        assert_eq!(h.metrics.snapshot().chains_succeeded, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_consumed_nonce_is_replay() -> AdaptiveAuthResult<()> {
        let h = harness();
        let start = h.orchestrator.start_chain("alice", vec![FactorType::Totp]).await?;
        let (sid, fid) = (start.session.id, start.challenge.factor_id);
        h.orchestrator.validate_factor(sid, fid, "123456").await?;

        let before = h.orchestrator.session(sid).await?;
        let replay = h.orchestrator.validate_factor(sid, fid, "123456").await;
        assert!(matches!(replay, Err(AdaptiveAuthError::ReplayAttack { .. })));

        assert_eq!(h.orchestrator.session(sid).await?, before);
        assert_eq!(h.metrics.snapshot().replay_attempts, 1);
        assert!(h
            .audit
            .for_session(sid)
            .iter()
            .any(|e| matches!(e.event, AuditEvent::ReplayAttempt { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_expired_nonce_rejected_before_validator() -> AdaptiveAuthResult<()> {
        let mut validator = MockFactorValidator::new();
        validator.expect_validate().times(0);
        let h = harness_with(
            ValidatorRegistry::new().with(FactorType::Totp, Arc::new(validator)),
            Arc::new(InMemorySessionStore::new()),
        );
        let start = h.orchestrator.start_chain("alice", vec![FactorType::Totp]).await?;
        h.clock.advance(Duration::from_secs(301));

        let result = h
            .orchestrator
            .validate_factor(start.session.id, start.challenge.factor_id, "123456")
            .await;
        assert!(matches!(result, Err(AdaptiveAuthError::NonceExpired { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn test_reissue_after_expiry() -> AdaptiveAuthResult<()> {
        let h = harness();
        let start = h.orchestrator.start_chain("alice", vec![FactorType::Totp]).await?;
        let (sid, fid) = (start.session.id, start.challenge.factor_id);
        h.clock.advance(Duration::from_secs(301));

        let fresh = h.orchestrator.reissue_challenge(sid, fid).await?;
        assert_ne!(fresh.nonce, start.challenge.nonce);
        assert_eq!(h.orchestrator.current_challenge(sid).await?, Some(fresh));

        let outcome = h.orchestrator.validate_factor(sid, fid, "123456").await?;
        assert!(outcome.is_complete());
        Ok(())
    }

    #[tokio::test]
    async fn test_wrong_credential_reissues_nonce() -> AdaptiveAuthResult<()> {
        let h = harness();
        let start = h.orchestrator.start_chain("alice", vec![FactorType::Totp]).await?;
        let (sid, fid) = (start.session.id, start.challenge.factor_id);

        let err = h
            .orchestrator
            .validate_factor(sid, fid, "000000")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            AdaptiveAuthError::FactorValidationFailed {
                factor_id: fid.to_string(),
                attempts_remaining: 2,
            }
        );

        let session = h.orchestrator.session(sid).await?;
        assert_eq!(session.state, SessionState::FactorPending);
        assert_ne!(session.factors[0].nonce, start.challenge.nonce);
        assert_eq!(session.factors[0].attempt_count, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_exhausted_attempts_lock_until_elapsed() -> AdaptiveAuthResult<()> {
        let h = harness();
        let start = h
            .orchestrator
            .start_chain("alice", vec![FactorType::Totp, FactorType::WebAuthn])
            .await?;
        let (sid, fid) = (start.session.id, start.challenge.factor_id);

        for _ in 0..2 {
            let err = h.orchestrator.validate_factor(sid, fid, "000000").await.unwrap_err();
            assert!(matches!(err, AdaptiveAuthError::FactorValidationFailed { .. }));
        }
        let err = h.orchestrator.validate_factor(sid, fid, "000000").await.unwrap_err();
        assert!(matches!(err, AdaptiveAuthError::Lockout { .. }));

        let again = h.orchestrator.validate_factor(sid, fid, "123456").await.unwrap_err();
        assert!(matches!(again, AdaptiveAuthError::Lockout { .. }));
        let restart = h.orchestrator.start_chain("alice", vec![FactorType::Totp]).await;
        assert!(matches!(restart, Err(AdaptiveAuthError::Lockout { .. })));

        let session = h.orchestrator.session(sid).await?;
        assert_eq!(session.state, SessionState::SessionInvalidated);
        assert_eq!(session.failed_factor, Some(fid));
        let partial = h
            .audit
            .for_session(sid)
            .into_iter()
            .find_map(|e| match e.event {
                AuditEvent::PartialCompletion { failed_type, .. } => failed_type,
                _ => None,
            });
        assert_eq!(partial, Some(FactorType::Totp));
        assert_eq!(h.metrics.snapshot().lockouts, 1);

        h.clock.advance(Duration::from_secs(901));
        let after = h.orchestrator.validate_factor(sid, fid, "123456").await.unwrap_err();
        assert!(matches!(after, AdaptiveAuthError::SessionTerminated { .. }));
        h.orchestrator.start_chain("alice", vec![FactorType::Totp]).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_start_chain_rejections() {
        let h = harness();
        assert!(matches!(
            h.orchestrator.start_chain("alice", vec![]).await,
            Err(AdaptiveAuthError::InvalidContext { .. })
        ));
        assert!(matches!(
            h.orchestrator.start_chain(" ", vec![FactorType::Totp]).await,
            Err(AdaptiveAuthError::InvalidContext { .. })
        ));
        assert!(matches!(
            h.orchestrator.start_chain("alice", vec![FactorType::HardwareKey]).await,
            Err(AdaptiveAuthError::NoValidator { .. })
        ));
    }

    #[tokio::test]
    async fn test_expired_session_is_rejected() -> AdaptiveAuthResult<()> {
        let h = harness();
        let start = h.orchestrator.start_chain("alice", vec![FactorType::Totp]).await?;
        h.clock.advance(Duration::from_secs(1_801));

        let result = h
            .orchestrator
            .validate_factor(start.session.id, start.challenge.factor_id, "123456")
            .await;
        assert!(matches!(result, Err(AdaptiveAuthError::SessionExpired { .. })));
        Ok(())
    }

    struct StalledValidator;

    #[async_trait]
    impl FactorValidator for StalledValidator {
        async fn validate(&self, _challenge: &Challenge, _credential: &str) -> AdaptiveAuthResult<bool> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(true)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_validator_timeout_returns_to_pending() -> AdaptiveAuthResult<()> {
        let h = harness_with(
            ValidatorRegistry::new().with(FactorType::Totp, Arc::new(StalledValidator)),
            Arc::new(InMemorySessionStore::new()),
        );
        let start = h.orchestrator.start_chain("alice", vec![FactorType::Totp]).await?;
        let (sid, fid) = (start.session.id, start.challenge.factor_id);

        let result = h.orchestrator.validate_factor(sid, fid, "123456").await;
        assert!(matches!(result, Err(AdaptiveAuthError::Timeout { .. })));

        let session = h.orchestrator.session(sid).await?;
        assert_eq!(session.state, SessionState::FactorPending);
        assert_eq!(session.factors[0].state, FactorState::Pending);
        assert_eq!(session.factors[0].attempt_count, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_validator_error_is_surfaced() -> AdaptiveAuthResult<()> {
        let mut validator = MockFactorValidator::new();
        validator.expect_validate().returning(|challenge, _| {
            Err(AdaptiveAuthError::Validator {
                factor_type: challenge.factor_type.to_string(),
                reason: "upstream unavailable".to_string(),
            })
        });
        let h = harness_with(
            ValidatorRegistry::new().with(FactorType::Totp, Arc::new(validator)),
            Arc::new(InMemorySessionStore::new()),
        );
        let start = h.orchestrator.start_chain("alice", vec![FactorType::Totp]).await?;

        let result = h
            .orchestrator
            .validate_factor(start.session.id, start.challenge.factor_id, "123456")
            .await;
        assert!(matches!(result, Err(AdaptiveAuthError::Validator { .. })));
        let session = h.orchestrator.session(start.session.id).await?;
        assert_eq!(session.state, SessionState::FactorPending);
        Ok(())
    }

    #[tokio::test]
    async fn test_cancel_chain() -> AdaptiveAuthResult<()> {
        let h = harness();
        let start = h.orchestrator.start_chain("alice", vec![FactorType::Totp]).await?;
        let (sid, fid) = (start.session.id, start.challenge.factor_id);

        let cancelled = h.orchestrator.cancel_chain(sid).await?;
        assert_eq!(cancelled.state, SessionState::SessionInvalidated);
        assert!(h.orchestrator.current_challenge(sid).await?.is_none());
        assert!(matches!(
            h.orchestrator.validate_factor(sid, fid, "123456").await,
            Err(AdaptiveAuthError::SessionTerminated { .. })
        ));
        h.orchestrator.cancel_chain(sid).await?;
        assert_eq!(h.metrics.snapshot().chains_failed, 1);
        Ok(())
    }

    struct SlowLockoutStore {
        inner: InMemorySessionStore,
        delay: Duration,
    }

    #[async_trait]
    impl SessionStore for SlowLockoutStore {
        async fn insert(&self, session: MfaSession) -> AdaptiveAuthResult<()> {
            self.inner.insert(session).await
        }

        async fn get(&self, session_id: Uuid) -> AdaptiveAuthResult<Option<MfaSession>> {
            self.inner.get(session_id).await
        }

        async fn update(&self, session: MfaSession, expected_version: u64) -> AdaptiveAuthResult<MfaSession> {
            self.inner.update(session, expected_version).await
        }

        async fn consume_nonce(
            &self,
            session_id: Uuid,
            factor_id: Uuid,
            expected_nonce: Uuid,
            used_at: DateTime<Utc>,
        ) -> AdaptiveAuthResult<NonceConsumption> {
            self.inner
                .consume_nonce(session_id, factor_id, expected_nonce, used_at)
                .await
        }

        async fn lockout(&self, user_id: &str, factor_type: FactorType) -> AdaptiveAuthResult<Option<DateTime<Utc>>> {
            self.inner.lockout(user_id, factor_type).await
        }

        async fn set_lockout(
            &self,
            user_id: &str,
            factor_type: FactorType,
            locked_until: DateTime<Utc>,
        ) -> AdaptiveAuthResult<()> {
            tokio::time::sleep(self.delay).await;
            self.inner.set_lockout(user_id, factor_type, locked_until).await
        }

        async fn remove(&self, session_id: Uuid) -> AdaptiveAuthResult<()> {
            self.inner.remove(session_id).await
        }
    }

    /// Accepts `code` after `delay`, rejects anything else at once
    struct DelayedAccept {
        code: &'static str,
        delay: Duration,
    }

    #[async_trait]
    impl FactorValidator for DelayedAccept {
        async fn validate(&self, _challenge: &Challenge, credential: &str) -> AdaptiveAuthResult<bool> {
            if credential != self.code {
                return Ok(false);
            }
            tokio::time::sleep(self.delay).await;
            Ok(true)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_racing_last_attempt_locks_only_a_failed_chain() -> AdaptiveAuthResult<()> {
        let store = Arc::new(SlowLockoutStore {
            inner: InMemorySessionStore::new(),
            delay: Duration::from_millis(150),
        });
        let validator = DelayedAccept {
            code: "123456",
            delay: Duration::from_millis(30),
        };
        let h = harness_with(
            ValidatorRegistry::new().with(FactorType::Totp, Arc::new(validator)),
            Arc::clone(&store) as Arc<dyn SessionStore>,
        );
        let start = h.orchestrator.start_chain("alice", vec![FactorType::Totp]).await?;
        let (sid, fid) = (start.session.id, start.challenge.factor_id);
        for _ in 0..2 {
            let err = h.orchestrator.validate_factor(sid, fid, "000000").await.unwrap_err();
            assert!(matches!(err, AdaptiveAuthError::FactorValidationFailed { .. }));
        }

        let (good, bad) = tokio::join!(
            h.orchestrator.validate_factor(sid, fid, "123456"),
            h.orchestrator.validate_factor(sid, fid, "000000"),
        );
        assert!(!matches!(
            bad,
            Err(AdaptiveAuthError::FactorValidationFailed { .. })
        ));

        let session = h.orchestrator.session(sid).await?;
        let lockout = store.lockout("alice", FactorType::Totp).await?;
        if good.is_ok() {
            assert_eq!(session.state, SessionState::ChainSuccess);
            assert!(lockout.is_none());
            assert!(matches!(bad, Err(AdaptiveAuthError::ReplayAttack { .. })));
            h.orchestrator.start_chain("alice", vec![FactorType::Totp]).await?;
        } else {
            assert_eq!(session.state, SessionState::SessionInvalidated);
            assert_eq!(session.factors[0].attempt_count, session.factors[0].max_attempts);
            assert!(lockout.is_some());
            assert!(matches!(bad, Err(AdaptiveAuthError::Lockout { .. })));
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_wrong_credential_after_acceptance_is_replay() -> AdaptiveAuthResult<()> {
        let h = harness();
        let start = h
            .orchestrator
            .start_chain("alice", vec![FactorType::Totp, FactorType::WebAuthn])
            .await?;
        let first = start.challenge.clone();
        h.orchestrator
            .validate_factor(first.session_id, first.factor_id, "123456")
            .await?;

        let err = h.orchestrator.reject(&first).await.unwrap_err();
        assert!(matches!(err, AdaptiveAuthError::ReplayAttack { .. }));
        let session = h.orchestrator.session(first.session_id).await?;
        assert_eq!(session.factors[0].attempt_count, 0);
        assert_eq!(session.state, SessionState::NextFactorPending);
        assert_eq!(h.metrics.snapshot().replay_attempts, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_persistent_version_conflicts_give_up() -> AdaptiveAuthResult<()> {
        let seeded = MfaSession::new("alice", vec![FactorType::Totp], Utc::now(), Duration::from_secs(60));
        let sid = seeded.id;

        let mut store = store::MockSessionStore::new();
        store
            .expect_get()
            .returning(move |_| Ok(Some(seeded.clone())));
        store.expect_update().times(8).returning(|session, expected| {
            Err(AdaptiveAuthError::VersionConflict {
                session_id: session.id.to_string(),
                expected,
            })
        });
        let h = harness_with(ValidatorRegistry::new(), Arc::new(store));

        let result = h.orchestrator.cancel_chain(sid).await;
        assert!(matches!(result, Err(AdaptiveAuthError::VersionConflict { .. })));
        Ok(())
    }
}
