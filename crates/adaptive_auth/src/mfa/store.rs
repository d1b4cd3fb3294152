//! Session persistence
//!
//! Every session write is conditional: [`SessionStore::update`] compares the
//! stored version, [`SessionStore::consume_nonce`] compares the expected nonce
//! and its unused state. A shared datastore implements both as
//! conditional writes so correctness holds across service instances.

use super::session::{FactorState, MfaSession};
use crate::error::{AdaptiveAuthError, AdaptiveAuthResult};
use crate::types::FactorType;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

/// Result of a nonce consumption attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceConsumption {
    /// This caller consumed the nonce
    Consumed,
    /// The nonce was already consumed
    AlreadyUsed,
    /// The factor no longer carries this nonce, or was withdrawn
    Superseded,
}

/// Persistence for chain sessions and lockouts
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Store a new session
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write fails
    async fn insert(&self, session: MfaSession) -> AdaptiveAuthResult<()>;

    /// Load a session
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails
    async fn get(&self, session_id: Uuid) -> AdaptiveAuthResult<Option<MfaSession>>;

    /// Replace a session if its stored version equals `expected_version`
    ///
    /// Returns the stored record with its bumped version.
    ///
    /// # Errors
    ///
    /// Returns `VersionConflict` if the version moved, `NotFound` if the
    /// session is gone
    async fn update(&self, session: MfaSession, expected_version: u64) -> AdaptiveAuthResult<MfaSession>;

    /// Mark a factor's nonce used, only if it is still `expected_nonce` and unused
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the session or factor is gone
    async fn consume_nonce(
        &self,
        session_id: Uuid,
        factor_id: Uuid,
        expected_nonce: Uuid,
        used_at: DateTime<Utc>,
    ) -> AdaptiveAuthResult<NonceConsumption>;

    /// Lockout expiry for a user and factor type
    ///
    /// # Errors
    ///
    /// Returns a storage error if the read fails
    async fn lockout(&self, user_id: &str, factor_type: FactorType) -> AdaptiveAuthResult<Option<DateTime<Utc>>>;

    /// Record a lockout until `locked_until`
    ///
    /// # Errors
    ///
    /// Returns a storage error if the write fails
    async fn set_lockout(
        &self,
        user_id: &str,
        factor_type: FactorType,
        locked_until: DateTime<Utc>,
    ) -> AdaptiveAuthResult<()>;

    /// Delete a session
    ///
    /// # Errors
    ///
    /// Returns a storage error if the delete fails
    async fn remove(&self, session_id: Uuid) -> AdaptiveAuthResult<()>;
}

/// Sessions held in process memory
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<Uuid, MfaSession>,
    lockouts: DashMap<(String, FactorType), DateTime<Utc>>,
}

impl InMemorySessionStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Store holds no sessions
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop expired sessions and elapsed lockouts; returns sessions removed
    pub fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|_, session| !session.is_expired(now));
        self.lockouts.retain(|_, until| *until > now);
        let removed = before.saturating_sub(self.sessions.len());
        if removed > 0 {
            debug!("Purged {} expired MFA sessions", removed);
        }
        removed
    }
}

fn session_not_found(session_id: Uuid) -> AdaptiveAuthError {
    AdaptiveAuthError::not_found("mfa_session", session_id.to_string())
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn insert(&self, session: MfaSession) -> AdaptiveAuthResult<()> {
        self.sessions.insert(session.id, session);
        Ok(())
    }

    async fn get(&self, session_id: Uuid) -> AdaptiveAuthResult<Option<MfaSession>> {
        Ok(self.sessions.get(&session_id).map(|s| s.clone()))
    }

    async fn update(&self, mut session: MfaSession, expected_version: u64) -> AdaptiveAuthResult<MfaSession> {
        let mut stored = self
            .sessions
            .get_mut(&session.id)
            .ok_or_else(|| session_not_found(session.id))?;
        if stored.version != expected_version {
            return Err(AdaptiveAuthError::VersionConflict {
                session_id: session.id.to_string(),
                expected: expected_version,
            });
        }
        session.version = expected_version + 1;
        *stored = session.clone();
        Ok(session)
    }

    async fn consume_nonce(
        &self,
        session_id: Uuid,
        factor_id: Uuid,
        expected_nonce: Uuid,
        used_at: DateTime<Utc>,
    ) -> AdaptiveAuthResult<NonceConsumption> {
        let mut stored = self
            .sessions
            .get_mut(&session_id)
            .ok_or_else(|| session_not_found(session_id))?;
        let session = stored.value_mut();
        let factor = session
            .factor_mut(factor_id)
            .ok_or_else(|| AdaptiveAuthError::not_found("mfa_factor", factor_id.to_string()))?;

        if factor.nonce != expected_nonce {
            return Ok(NonceConsumption::Superseded);
        }
        if factor.nonce_used_at.is_some() {
            return Ok(NonceConsumption::AlreadyUsed);
        }
        if !matches!(factor.state, FactorState::Pending | FactorState::Validating) {
            return Ok(NonceConsumption::Superseded);
        }

        factor.nonce_used_at = Some(used_at);
        factor.state = FactorState::Succeeded;
        session.version += 1;
        Ok(NonceConsumption::Consumed)
    }

    async fn lockout(&self, user_id: &str, factor_type: FactorType) -> AdaptiveAuthResult<Option<DateTime<Utc>>> {
        Ok(self
            .lockouts
            .get(&(user_id.to_string(), factor_type))
            .map(|until| *until))
    }

    async fn set_lockout(
        &self,
        user_id: &str,
        factor_type: FactorType,
        locked_until: DateTime<Utc>,
    ) -> AdaptiveAuthResult<()> {
        self.lockouts
            .insert((user_id.to_string(), factor_type), locked_until);
        Ok(())
    }

    async fn remove(&self, session_id: Uuid) -> AdaptiveAuthResult<()> {
        self.sessions.remove(&session_id);
        Ok(())
    }
}
