//! Security audit trail for MFA chains

use crate::types::FactorType;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// Audit target used by [`TracingAuditSink`]
pub const AUDIT_TARGET: &str = "adaptive_auth::audit";

/// Audited security event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// A chain was started
    ChainStarted {
        /// Factor types required
        required: Vec<FactorType>,
    },
    /// A consumed nonce was presented again
    ReplayAttempt {
        /// Factor the nonce belonged to
        factor_id: Uuid,
        /// Factor type
        factor_type: FactorType,
    },
    /// Attempts exhausted for a factor type
    LockoutTriggered {
        /// Locked factor type
        factor_type: FactorType,
        /// Lockout expiry
        locked_until: DateTime<Utc>,
    },
    /// Chain failed after some factors may have succeeded
    PartialCompletion {
        /// Factor that failed the chain
        failed_factor: Option<Uuid>,
        /// Type of the failed factor
        failed_type: Option<FactorType>,
        /// Factor types completed before the failure
        completed: Vec<FactorType>,
        /// Failure cause
        reason: String,
    },
    /// All required factors succeeded
    ChainSucceeded {
        /// Factor types completed
        completed: Vec<FactorType>,
    },
    /// Caller cancelled the chain
    ChainCancelled,
}

impl AuditEvent {
    /// Event describes a possible attack
    #[must_use]
    pub const fn is_security_event(&self) -> bool {
        matches!(
            self,
            Self::ReplayAttempt { .. } | Self::LockoutTriggered { .. } | Self::PartialCompletion { .. }
        )
    }
}

/// One audit record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Record time
    pub at: DateTime<Utc>,
    /// Subject user
    pub user_id: String,
    /// Chain session
    pub session_id: Uuid,
    /// What happened
    #[serde(flatten)]
    pub event: AuditEvent,
}

/// Destination for audit records
pub trait AuditSink: Send + Sync {
    /// Persist one record; must not block the request path
    fn record(&self, entry: AuditEntry);
}

/// Writes audit records as `tracing` events on [`AUDIT_TARGET`]
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: AuditEntry) {
        let body = serde_json::to_string(&entry).unwrap_or_else(|e| format!("{entry:?} ({e})"));
        if entry.event.is_security_event() {
            warn!(target: AUDIT_TARGET, "{}", body);
        } else {
            info!(target: AUDIT_TARGET, "{}", body);
        }
    }
}

/// Keeps audit records in memory
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    /// Empty sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every record so far
    #[must_use]
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    /// Records for one session
    #[must_use]
    pub fn for_session(&self, session_id: Uuid) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, entry: AuditEntry) {
        self.entries.lock().push(entry);
    }
}
