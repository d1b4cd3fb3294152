//! MFA chain session and factor records

use crate::clock::to_chrono;
use crate::config::FactorSettings;
use crate::error::{AdaptiveAuthError, AdaptiveAuthResult};
use crate::types::FactorType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Chain state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Session allocated, no challenge yet
    Created,
    /// First factor challenge issued
    FactorPending,
    /// A validator call is in flight
    FactorValidating,
    /// Current factor accepted
    FactorSuccess,
    /// Later factor challenge issued
    NextFactorPending,
    /// Current factor rejected
    FactorFailed,
    /// Chain cannot complete
    ChainFailed,
    /// All required factors accepted
    ChainSuccess,
    /// Session is unusable
    SessionInvalidated,
}

impl SessionState {
    /// Stable snake_case name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::FactorPending => "factor_pending",
            Self::FactorValidating => "factor_validating",
            Self::FactorSuccess => "factor_success",
            Self::NextFactorPending => "next_factor_pending",
            Self::FactorFailed => "factor_failed",
            Self::ChainFailed => "chain_failed",
            Self::ChainSuccess => "chain_success",
            Self::SessionInvalidated => "session_invalidated",
        }
    }

    /// No further factor can be validated
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::ChainFailed | Self::ChainSuccess | Self::SessionInvalidated
        )
    }

    /// A challenge is waiting for a credential
    #[must_use]
    pub const fn is_awaiting_factor(self) -> bool {
        matches!(self, Self::FactorPending | Self::NextFactorPending)
    }

    /// Whether `next` is a legal successor
    ///
    /// Pending states may repeat when a challenge is re-issued, and a
    /// validating session returns to pending when the validator times out.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use SessionState::{
            ChainFailed, ChainSuccess, Created, FactorFailed, FactorPending, FactorSuccess,
            FactorValidating, NextFactorPending, SessionInvalidated,
        };
        matches!(
            (self, next),
            (Created, FactorPending)
                | (FactorPending | NextFactorPending, FactorValidating)
                | (FactorPending, FactorPending)
                | (NextFactorPending, NextFactorPending)
                | (
                    FactorValidating,
                    FactorSuccess | FactorFailed | FactorPending | NextFactorPending
                )
                | (FactorSuccess, NextFactorPending | ChainSuccess)
                | (FactorFailed, FactorPending | NextFactorPending | ChainFailed)
                | (Created | FactorPending | NextFactorPending | FactorValidating, ChainFailed)
                | (ChainFailed, SessionInvalidated)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-factor state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorState {
    /// Challenge outstanding
    Pending,
    /// Credential being checked
    Validating,
    /// Credential accepted, nonce consumed
    Succeeded,
    /// Attempts exhausted
    Locked,
    /// Nonce withdrawn because the chain ended
    Retired,
}

/// One factor of a chain, with its current nonce
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MfaFactor {
    /// Factor id, stable across nonce re-issue
    pub id: Uuid,
    /// Factor type
    pub factor_type: FactorType,
    /// Current challenge nonce
    pub nonce: Uuid,
    /// When the current nonce was issued
    pub nonce_issued_at: DateTime<Utc>,
    /// When the current nonce stops being accepted
    pub nonce_expires_at: DateTime<Utc>,
    /// When the current nonce was consumed
    pub nonce_used_at: Option<DateTime<Utc>>,
    /// Failed attempts so far
    pub attempt_count: u32,
    /// Failed attempts allowed before lockout
    pub max_attempts: u32,
    /// Factor state
    pub state: FactorState,
}

impl MfaFactor {
    fn issue(factor_type: FactorType, settings: &FactorSettings, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            factor_type,
            nonce: Uuid::now_v7(),
            nonce_issued_at: now,
            nonce_expires_at: now + to_chrono(settings.nonce_ttl()),
            nonce_used_at: None,
            attempt_count: 0,
            max_attempts: settings.max_attempts,
            state: FactorState::Pending,
        }
    }

    /// Replace the nonce with a fresh one
    pub fn reissue_nonce(&mut self, ttl: Duration, now: DateTime<Utc>) {
        self.nonce = Uuid::now_v7();
        self.nonce_issued_at = now;
        self.nonce_expires_at = now + to_chrono(ttl);
        self.nonce_used_at = None;
        self.state = FactorState::Pending;
    }

    /// Nonce is past its expiry
    #[must_use]
    pub fn is_nonce_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.nonce_expires_at
    }

    /// Failed attempts left before lockout
    #[must_use]
    pub const fn attempts_remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt_count)
    }
}

/// Challenge handed to the caller and to the factor validator
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    /// Session the challenge belongs to
    pub session_id: Uuid,
    /// Factor being challenged
    pub factor_id: Uuid,
    /// Factor type
    pub factor_type: FactorType,
    /// Nonce to bind the credential to
    pub nonce: Uuid,
    /// User being challenged
    pub user_id: String,
    /// Nonce expiry
    pub expires_at: DateTime<Utc>,
}

/// Multi-factor chain for one user
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MfaSession {
    /// Session id
    pub id: Uuid,
    /// Owner
    pub user_id: String,
    /// Factor types to complete, in order
    pub required: Vec<FactorType>,
    /// Factors issued so far; the active one is last
    pub factors: Vec<MfaFactor>,
    /// Chain state
    pub state: SessionState,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Session expiry
    pub expires_at: DateTime<Utc>,
    /// Optimistic concurrency version, bumped by the store on every write
    pub version: u64,
    /// Factor that failed the chain
    pub failed_factor: Option<Uuid>,
}

impl MfaSession {
    /// New session in `Created`; no challenge issued yet
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        required: Vec<FactorType>,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id: user_id.into(),
            required,
            factors: Vec::new(),
            state: SessionState::Created,
            created_at: now,
            expires_at: now + to_chrono(ttl),
            version: 0,
            failed_factor: None,
        }
    }

    /// Pending state matching the active factor's position in the chain
    #[must_use]
    pub fn pending_state(&self) -> SessionState {
        if self.factors.len() > 1 {
            SessionState::NextFactorPending
        } else {
            SessionState::FactorPending
        }
    }

    /// Session is past its expiry
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Move to `next`
    ///
    /// # Errors
    ///
    /// Returns `Internal` for an illegal transition
    pub fn transition(&mut self, next: SessionState) -> AdaptiveAuthResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(AdaptiveAuthError::Internal {
                reason: format!(
                    "session {} cannot move from {} to {}",
                    self.id, self.state, next
                ),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Factor by id
    #[must_use]
    pub fn factor(&self, factor_id: Uuid) -> Option<&MfaFactor> {
        self.factors.iter().find(|f| f.id == factor_id)
    }

    /// Mutable factor by id
    pub fn factor_mut(&mut self, factor_id: Uuid) -> Option<&mut MfaFactor> {
        self.factors.iter_mut().find(|f| f.id == factor_id)
    }

    /// Factor awaiting or undergoing validation
    #[must_use]
    pub fn active_factor(&self) -> Option<&MfaFactor> {
        self.factors
            .last()
            .filter(|f| matches!(f.state, FactorState::Pending | FactorState::Validating))
    }

    /// Factor types completed so far, in order
    #[must_use]
    pub fn completed(&self) -> Vec<FactorType> {
        self.factors
            .iter()
            .filter(|f| f.nonce_used_at.is_some())
            .map(|f| f.factor_type)
            .collect()
    }

    /// Next required factor type not yet issued
    #[must_use]
    pub fn next_required(&self) -> Option<FactorType> {
        self.required.get(self.factors.len()).copied()
    }

    /// Issue a challenge for the next required factor type
    ///
    /// # Errors
    ///
    /// Returns `Internal` if every required factor has been issued
    pub fn issue_next_factor(
        &mut self,
        settings: &FactorSettings,
        now: DateTime<Utc>,
    ) -> AdaptiveAuthResult<Uuid> {
        let factor_type = self.next_required().ok_or_else(|| AdaptiveAuthError::Internal {
            reason: format!("session {} has no further required factor", self.id),
        })?;
        let factor = MfaFactor::issue(factor_type, settings, now);
        let id = factor.id;
        self.factors.push(factor);
        Ok(id)
    }

    /// Challenge for a factor of this session
    #[must_use]
    pub fn challenge(&self, factor: &MfaFactor) -> Challenge {
        Challenge {
            session_id: self.id,
            factor_id: factor.id,
            factor_type: factor.factor_type,
            nonce: factor.nonce,
            user_id: self.user_id.clone(),
            expires_at: factor.nonce_expires_at,
        }
    }

    /// Withdraw every nonce once the chain has ended
    ///
    /// Consumed nonces stay marked used so a replay is still recognised.
    pub fn retire_nonces(&mut self) {
        for factor in &mut self.factors {
            if factor.state != FactorState::Locked {
                factor.state = FactorState::Retired;
            }
        }
    }

    /// Fail the chain from any non-terminal state and invalidate it
    ///
    /// # Errors
    ///
    /// Returns `Internal` if the session is already terminal
    pub fn fail_chain(&mut self, failed_factor: Option<Uuid>) -> AdaptiveAuthResult<()> {
        if self.state == SessionState::FactorValidating {
            self.transition(SessionState::FactorFailed)?;
        }
        self.transition(SessionState::ChainFailed)?;
        self.transition(SessionState::SessionInvalidated)?;
        self.failed_factor = failed_factor;
        self.retire_nonces();
        Ok(())
    }
}
