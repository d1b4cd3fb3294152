//! Pluggable factor validators

use super::session::Challenge;
use crate::error::{AdaptiveAuthError, AdaptiveAuthResult};
use crate::types::FactorType;
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Credential check for one factor type
///
/// `Ok(false)` means the credential was wrong; `Err` means the check could
/// not be performed.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FactorValidator: Send + Sync {
    /// Check `credential` against `challenge`
    ///
    /// # Errors
    ///
    /// Returns error if the backing service cannot answer
    async fn validate(&self, challenge: &Challenge, credential: &str) -> AdaptiveAuthResult<bool>;
}

/// Validators keyed by factor type
#[derive(Clone, Default)]
pub struct ValidatorRegistry {
    validators: HashMap<FactorType, Arc<dyn FactorValidator>>,
}

impl fmt::Debug for ValidatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.validators.keys().collect();
        types.sort();
        f.debug_struct("ValidatorRegistry")
            .field("factor_types", &types)
            .finish()
    }
}

impl ValidatorRegistry {
    /// Empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `validator` for `factor_type`, replacing any previous one
    #[must_use]
    pub fn with(mut self, factor_type: FactorType, validator: Arc<dyn FactorValidator>) -> Self {
        self.register(factor_type, validator);
        self
    }

    /// Register `validator` for `factor_type`, replacing any previous one
    pub fn register(&mut self, factor_type: FactorType, validator: Arc<dyn FactorValidator>) {
        self.validators.insert(factor_type, validator);
    }

    /// Whether a validator exists for `factor_type`
    #[must_use]
    pub fn supports(&self, factor_type: FactorType) -> bool {
        self.validators.contains_key(&factor_type)
    }

    /// Validator for `factor_type`
    ///
    /// # Errors
    ///
    /// Returns `NoValidator` if none is registered
    pub fn get(&self, factor_type: FactorType) -> AdaptiveAuthResult<Arc<dyn FactorValidator>> {
        self.validators
            .get(&factor_type)
            .cloned()
            .ok_or_else(|| AdaptiveAuthError::NoValidator {
                factor_type: factor_type.to_string(),
            })
    }
}
