//! Error types for adaptive authentication operations

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result type for adaptive authentication operations
pub type AdaptiveAuthResult<T> = Result<T, AdaptiveAuthError>;

/// Main error type for adaptive authentication operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdaptiveAuthError {
    /// Policy document could not be fetched, parsed or validated
    #[error("Policy load error: {policy} - {reason}")]
    PolicyLoad {
        /// Policy kind being loaded
        policy: String,
        /// Error description
        reason: String,
    },

    /// No valid policy has ever been published
    #[error("Policy unavailable: {policy}")]
    PolicyUnavailable {
        /// Policy kind that is missing
        policy: String,
    },

    /// A required authentication context field is missing or malformed
    #[error("Invalid context: {field} - {reason}")]
    InvalidContext {
        /// Context field that is invalid
        field: String,
        /// Validation error description
        reason: String,
    },

    /// Collaborator call exceeded its deadline
    #[error("Operation timed out: {operation} after {duration_ms}ms")]
    Timeout {
        /// Operation that timed out
        operation: String,
        /// Deadline in milliseconds
        duration_ms: u64,
    },

    /// Challenge nonce was already consumed
    #[error("Replay attack detected: factor '{factor_id}' nonce already used")]
    ReplayAttack {
        /// Factor whose nonce was replayed
        factor_id: String,
    },

    /// Challenge nonce is past its expiry
    #[error("Nonce expired: factor '{factor_id}' expired at {expired_at}")]
    NonceExpired {
        /// Factor whose nonce expired
        factor_id: String,
        /// Expiry timestamp
        expired_at: DateTime<Utc>,
    },

    /// Validator rejected the submitted credential
    #[error("Factor validation failed: '{factor_id}', {attempts_remaining} attempts remaining")]
    FactorValidationFailed {
        /// Factor that failed
        factor_id: String,
        /// Attempts left before lockout
        attempts_remaining: u32,
    },

    /// Factor type is locked for this user
    #[error("Locked out: {factor_type} for user '{user_id}' until {locked_until}")]
    Lockout {
        /// User that is locked out
        user_id: String,
        /// Locked factor type
        factor_type: String,
        /// End of the lockout window
        locked_until: DateTime<Utc>,
    },

    /// Resource not found
    #[error("Not found: {resource} '{identifier}'")]
    NotFound {
        /// Resource type
        resource: String,
        /// Resource identifier
        identifier: String,
    },

    /// Session is past its expiry
    #[error("Session expired: '{session_id}'")]
    SessionExpired {
        /// Expired session
        session_id: String,
    },

    /// Session already reached a terminal state
    #[error("Session terminated: '{session_id}' is {state}")]
    SessionTerminated {
        /// Session identifier
        session_id: String,
        /// Terminal state name
        state: String,
    },

    /// Factor is not the one currently awaiting a response
    #[error("Factor not active: '{factor_id}' - {reason}")]
    FactorNotActive {
        /// Factor identifier
        factor_id: String,
        /// Why the factor cannot be validated
        reason: String,
    },

    /// No validator registered for a factor type
    #[error("No validator registered for {factor_type}")]
    NoValidator {
        /// Factor type without validator
        factor_type: String,
    },

    /// Validator returned an error
    #[error("Validator error: {factor_type} - {reason}")]
    Validator {
        /// Factor type of the validator
        factor_type: String,
        /// Error description
        reason: String,
    },

    /// Session store or baseline repository errors
    #[error("Storage error: {operation} failed - {reason}")]
    Storage {
        /// Storage operation that failed
        operation: String,
        /// Error description
        reason: String,
        /// Whether the failure may succeed on retry
        transient: bool,
    },

    /// Optimistic version check failed on a session write
    #[error("Version conflict on session '{session_id}': expected {expected}")]
    VersionConflict {
        /// Session identifier
        session_id: String,
        /// Version the writer expected
        expected: u64,
    },

    /// Configuration errors
    #[error("Configuration error: {field} - {reason}")]
    Configuration {
        /// Configuration field that failed
        field: String,
        /// Error description
        reason: String,
    },

    /// Internal system errors
    #[error("Internal error: {reason}")]
    Internal {
        /// Internal error description
        reason: String,
    },
}

impl AdaptiveAuthError {
    /// Create a policy load error
    pub fn policy_load(policy: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::PolicyLoad {
            policy: policy.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid context error
    pub fn invalid_context(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidContext {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, duration: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Create a not found error
    pub fn not_found(resource: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
            identifier: identifier.into(),
        }
    }

    /// Create a transient storage error
    pub fn storage_transient(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            reason: reason.into(),
            transient: true,
        }
    }

    /// Create a permanent storage error
    pub fn storage(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            reason: reason.into(),
            transient: false,
        }
    }

    /// Create a configuration error
    pub fn configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Errors a caller must answer with a block decision
    #[must_use]
    pub const fn is_fail_closed(&self) -> bool {
        matches!(
            self,
            Self::PolicyUnavailable { .. }
                | Self::InvalidContext { .. }
                | Self::ReplayAttack { .. }
                | Self::Lockout { .. }
                | Self::SessionTerminated { .. }
        )
    }

    /// Errors that internal retry may absorb
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        match self {
            Self::Storage { transient, .. } => *transient,
            Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Security-relevant failures that must never be retried internally
    #[must_use]
    pub const fn is_security_event(&self) -> bool {
        matches!(
            self,
            Self::ReplayAttack { .. }
                | Self::NonceExpired { .. }
                | Self::Lockout { .. }
                | Self::FactorValidationFailed { .. }
        )
    }
}

impl From<serde_yaml::Error> for AdaptiveAuthError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::policy_load("document", err.to_string())
    }
}

impl From<toml::de::Error> for AdaptiveAuthError {
    fn from(err: toml::de::Error) -> Self {
        Self::configuration("toml", err.to_string())
    }
}

impl From<garde::Report> for AdaptiveAuthError {
    fn from(report: garde::Report) -> Self {
        Self::configuration("validation", report.to_string())
    }
}

impl From<std::io::Error> for AdaptiveAuthError {
    fn from(err: std::io::Error) -> Self {
        let transient = matches!(
            err.kind(),
            std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::WouldBlock
        );
        Self::Storage {
            operation: "io".to_string(),
            reason: err.to_string(),
            transient,
        }
    }
}
