//! Where policy documents come from

use crate::config::PolicyConfig;
use crate::error::{AdaptiveAuthError, AdaptiveAuthResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// Policy families held by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PolicyKind {
    /// `risk_scoring` section
    RiskScoring,
    /// `step_up` section
    StepUp,
}

impl PolicyKind {
    /// Section name in the document
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RiskScoring => "risk_scoring",
            Self::StepUp => "step_up",
        }
    }
}

impl fmt::Display for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw document provider
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PolicySource: Send + Sync {
    /// Fetch the YAML document holding `kind`
    ///
    /// # Errors
    ///
    /// Returns a transient storage error for retryable I/O failures
    async fn fetch(&self, kind: PolicyKind) -> AdaptiveAuthResult<String>;
}

/// Reads policy documents from YAML files
#[derive(Debug, Clone)]
pub struct FilePolicySource {
    risk_path: PathBuf,
    step_up_path: PathBuf,
}

impl FilePolicySource {
    /// Separate files for each family; both may point at one file
    pub fn new(risk_path: impl Into<PathBuf>, step_up_path: impl Into<PathBuf>) -> Self {
        Self {
            risk_path: risk_path.into(),
            step_up_path: step_up_path.into(),
        }
    }

    /// One file with both sections
    pub fn combined(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            risk_path: path.clone(),
            step_up_path: path,
        }
    }

    /// Source for the configured paths; a missing step-up path reuses the risk file
    ///
    /// # Errors
    ///
    /// Returns a configuration error if no risk policy path is set
    pub fn from_config(config: &PolicyConfig) -> AdaptiveAuthResult<Self> {
        let risk = config.risk_policy_path.clone().ok_or_else(|| {
            AdaptiveAuthError::configuration("policy.risk_policy_path", "no policy file configured")
        })?;
        let step_up = config.step_up_policy_path.clone().unwrap_or_else(|| risk.clone());
        Ok(Self::new(risk, step_up))
    }

    fn path(&self, kind: PolicyKind) -> &PathBuf {
        match kind {
            PolicyKind::RiskScoring => &self.risk_path,
            PolicyKind::StepUp => &self.step_up_path,
        }
    }
}

#[async_trait]
impl PolicySource for FilePolicySource {
    async fn fetch(&self, kind: PolicyKind) -> AdaptiveAuthResult<String> {
        let path = self.path(kind);
        tokio::fs::read_to_string(path).await.map_err(|e| {
            let transient = !matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            );
            AdaptiveAuthError::Storage {
                operation: format!("read {}", path.display()),
                reason: e.to_string(),
                transient,
            }
        })
    }
}

/// Documents held in memory, replaceable at runtime
#[derive(Debug, Default)]
pub struct InMemoryPolicySource {
    documents: RwLock<HashMap<PolicyKind, String>>,
}

impl InMemoryPolicySource {
    /// Empty source; fetches fail until a document is set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Source serving one combined document for both families
    pub fn combined(document: impl Into<String>) -> Self {
        let source = Self::new();
        source.set_combined(document);
        source
    }

    /// Replace the document for one family
    pub fn set(&self, kind: PolicyKind, document: impl Into<String>) {
        self.documents.write().insert(kind, document.into());
    }

    /// Replace both families with one combined document
    pub fn set_combined(&self, document: impl Into<String>) {
        let document = document.into();
        let mut documents = self.documents.write();
        documents.insert(PolicyKind::RiskScoring, document.clone());
        documents.insert(PolicyKind::StepUp, document);
    }
}

#[async_trait]
impl PolicySource for InMemoryPolicySource {
    async fn fetch(&self, kind: PolicyKind) -> AdaptiveAuthResult<String> {
        self.documents
            .read()
            .get(&kind)
            .cloned()
            .ok_or_else(|| AdaptiveAuthError::storage("fetch", format!("no {kind} document set")))
    }
}
