//! Configuration for the adaptive authentication core
//!
//! Loaded from TOML, validated with `garde`, and optionally overridden from
//! `ADAPTIVE_AUTH_*` environment variables.

use crate::error::{AdaptiveAuthError, AdaptiveAuthResult};
use crate::retry::RetryPolicy;
use crate::types::FactorType;
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable prefix for overrides
pub const ENV_PREFIX: &str = "ADAPTIVE_AUTH_";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AdaptiveAuthConfig {
    /// Policy store settings
    #[garde(dive)]
    pub policy: PolicyConfig,

    /// Risk engine settings
    #[garde(dive)]
    pub risk: RiskConfig,

    /// Retry settings for transient collaborator I/O
    #[garde(dive)]
    pub retry: RetryConfig,

    /// MFA chain settings
    #[garde(dive)]
    pub mfa: MfaConfig,

    /// Logging settings
    #[garde(dive)]
    pub telemetry: TelemetryConfig,
}

/// Policy store configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PolicyConfig {
    /// YAML file holding the `risk_scoring` section
    #[garde(skip)]
    pub risk_policy_path: Option<PathBuf>,

    /// YAML file holding the `step_up` section, may equal the risk file
    #[garde(skip)]
    pub step_up_policy_path: Option<PathBuf>,

    /// Polling interval for hot reload (seconds)
    #[garde(range(min = 1, max = 86_400))]
    pub reload_interval_secs: u64,
}

/// Risk engine configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RiskConfig {
    /// Deadline for the baseline lookup (milliseconds)
    #[garde(range(min = 1, max = 60_000))]
    pub baseline_deadline_ms: u64,

    /// Fail with a timeout instead of degrading when the baseline is late
    #[garde(skip)]
    pub strict_mode: bool,
}

/// Retry configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RetryConfig {
    /// Total attempts including the first
    #[garde(range(min = 1, max = 10))]
    pub max_attempts: u32,

    /// First backoff delay (milliseconds)
    #[garde(range(min = 1, max = 10_000))]
    pub initial_delay_ms: u64,

    /// Backoff ceiling (milliseconds)
    #[garde(range(min = 1, max = 60_000))]
    pub max_delay_ms: u64,

    /// Exponential multiplier
    #[garde(range(min = 1.0, max = 10.0))]
    pub backoff_multiplier: f64,

    /// Randomize delays
    #[garde(skip)]
    pub enable_jitter: bool,
}

/// MFA configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MfaConfig {
    /// Lifetime of a chain session (seconds)
    #[garde(range(min = 30, max = 86_400))]
    pub session_ttl_secs: u64,

    /// Deadline for a single validator call (milliseconds)
    #[garde(range(min = 1, max = 60_000))]
    pub validator_deadline_ms: u64,

    /// Optimistic update retries on version conflicts
    #[garde(range(min = 1, max = 32))]
    pub max_update_retries: u32,

    /// Per factor type settings
    #[garde(dive)]
    pub factors: FactorSettingsTable,
}

/// Settings for each factor type
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct FactorSettingsTable {
    /// One-time password
    #[garde(dive)]
    pub otp: FactorSettings,
    /// Time-based one-time password
    #[garde(dive)]
    pub totp: FactorSettings,
    /// Magic link
    #[garde(dive)]
    pub magic_link: FactorSettings,
    /// `WebAuthn`
    #[garde(dive)]
    pub webauthn: FactorSettings,
    /// Hardware key
    #[garde(dive)]
    pub hardware_key: FactorSettings,
}

impl FactorSettingsTable {
    /// Settings for a factor type
    #[must_use]
    pub const fn get(&self, factor_type: FactorType) -> &FactorSettings {
        match factor_type {
            FactorType::Otp => &self.otp,
            FactorType::Totp => &self.totp,
            FactorType::MagicLink => &self.magic_link,
            FactorType::WebAuthn => &self.webauthn,
            FactorType::HardwareKey => &self.hardware_key,
        }
    }
}

/// Nonce and lockout settings for one factor type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Validate)]
pub struct FactorSettings {
    /// Challenge nonce lifetime (seconds)
    #[garde(range(min = 10, max = 86_400))]
    pub nonce_ttl_secs: u64,

    /// Failed attempts before lockout
    #[garde(range(min = 1, max = 20))]
    pub max_attempts: u32,

    /// Lockout length (seconds)
    #[garde(range(min = 1, max = 604_800))]
    pub lockout_duration_secs: u64,
}

impl FactorSettings {
    /// Five minute nonce, five attempts, fifteen minute lockout
    #[must_use]
    pub const fn short_lived() -> Self {
        Self {
            nonce_ttl_secs: 300,
            max_attempts: 5,
            lockout_duration_secs: 900,
        }
    }

    /// Nonce lifetime as a `Duration`
    #[must_use]
    pub const fn nonce_ttl(&self) -> Duration {
        Duration::from_secs(self.nonce_ttl_secs)
    }

    /// Lockout length as a `Duration`
    #[must_use]
    pub const fn lockout_duration(&self) -> Duration {
        Duration::from_secs(self.lockout_duration_secs)
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TelemetryConfig {
    /// `tracing-subscriber` env filter directive
    #[garde(length(min = 1))]
    pub log_filter: String,

    /// Emit JSON lines instead of human-readable output
    #[garde(skip)]
    pub json_logs: bool,
}

impl Default for AdaptiveAuthConfig {
    fn default() -> Self {
        Self::new_development()
    }
}

impl AdaptiveAuthConfig {
    /// Production defaults: strict baseline deadline, JSON logs
    #[must_use]
    pub fn new_production() -> Self {
        Self {
            policy: PolicyConfig {
                risk_policy_path: Some(PathBuf::from("/etc/adaptive-auth/policies.yaml")),
                step_up_policy_path: Some(PathBuf::from("/etc/adaptive-auth/policies.yaml")),
                reload_interval_secs: 300,
            },
            risk: RiskConfig {
                baseline_deadline_ms: 150,
                strict_mode: false,
            },
            retry: RetryConfig {
                max_attempts: 3,
                initial_delay_ms: 25,
                max_delay_ms: 500,
                backoff_multiplier: 2.0,
                enable_jitter: true,
            },
            mfa: MfaConfig {
                session_ttl_secs: 900,
                validator_deadline_ms: 2_000,
                max_update_retries: 8,
                factors: FactorSettingsTable {
                    otp: FactorSettings::short_lived(),
                    totp: FactorSettings::short_lived(),
                    magic_link: FactorSettings {
                        nonce_ttl_secs: 900,
                        max_attempts: 3,
                        lockout_duration_secs: 1_800,
                    },
                    webauthn: FactorSettings::short_lived(),
                    hardware_key: FactorSettings::short_lived(),
                },
            },
            telemetry: TelemetryConfig {
                log_filter: "info".to_string(),
                json_logs: true,
            },
        }
    }

    /// Development defaults: no policy paths, relaxed deadlines, text logs
    #[must_use]
    pub fn new_development() -> Self {
        let mut config = Self::new_production();
        config.policy.risk_policy_path = None;
        config.policy.step_up_policy_path = None;
        config.policy.reload_interval_secs = 30;
        config.risk.baseline_deadline_ms = 1_000;
        config.retry.enable_jitter = false;
        config.mfa.validator_deadline_ms = 5_000;
        config.telemetry.log_filter = "debug".to_string();
        config.telemetry.json_logs = false;
        config
    }

    /// Parse and validate a TOML document
    ///
    /// # Errors
    ///
    /// Returns error if the document is malformed or fails validation
    pub fn from_toml_str(raw: &str) -> AdaptiveAuthResult<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML file, apply environment overrides, then validate
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, parsed or validated
    pub fn from_file(path: impl AsRef<Path>) -> AdaptiveAuthResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AdaptiveAuthError::configuration(path.display().to_string(), e.to_string())
        })?;
        let mut config: Self = toml::from_str(&raw)?;
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `ADAPTIVE_AUTH_*` overrides from a lookup function
    ///
    /// # Errors
    ///
    /// Returns error if an override value cannot be parsed
    pub fn apply_overrides<F>(&mut self, lookup: F) -> AdaptiveAuthResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(path) = var("RISK_POLICY_PATH") {
            self.policy.risk_policy_path = Some(PathBuf::from(path));
        }
        if let Some(path) = var("STEP_UP_POLICY_PATH") {
            self.policy.step_up_policy_path = Some(PathBuf::from(path));
        }
        if let Some(raw) = var("RELOAD_INTERVAL_SECS") {
            self.policy.reload_interval_secs = parse_override("RELOAD_INTERVAL_SECS", &raw)?;
        }
        if let Some(raw) = var("STRICT_MODE") {
            self.risk.strict_mode = parse_override("STRICT_MODE", &raw)?;
        }
        if let Some(raw) = var("BASELINE_DEADLINE_MS") {
            self.risk.baseline_deadline_ms = parse_override("BASELINE_DEADLINE_MS", &raw)?;
        }
        if let Some(filter) = var("LOG_FILTER") {
            self.telemetry.log_filter = filter;
        }
        Ok(())
    }

    /// Validate field ranges and cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns error if any value is out of range
    pub fn validate(&self) -> AdaptiveAuthResult<()> {
        garde::Validate::validate(self, &())?;
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(AdaptiveAuthError::configuration(
                "retry.initial_delay_ms",
                "must not exceed retry.max_delay_ms",
            ));
        }
        Ok(())
    }

    /// Polling interval for hot reload
    #[must_use]
    pub const fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.policy.reload_interval_secs)
    }

    /// Deadline for the baseline lookup
    #[must_use]
    pub const fn baseline_deadline(&self) -> Duration {
        Duration::from_millis(self.risk.baseline_deadline_ms)
    }

    /// Deadline for a validator call
    #[must_use]
    pub const fn validator_deadline(&self) -> Duration {
        Duration::from_millis(self.mfa.validator_deadline_ms)
    }

    /// Chain session lifetime
    #[must_use]
    pub const fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.mfa.session_ttl_secs)
    }

    /// Retry policy built from the retry section
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_delay: Duration::from_millis(self.retry.initial_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            backoff_multiplier: self.retry.backoff_multiplier,
            enable_jitter: self.retry.enable_jitter,
        }
    }
}

fn parse_override<T: std::str::FromStr>(name: &str, raw: &str) -> AdaptiveAuthResult<T>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| {
        AdaptiveAuthError::configuration(format!("{ENV_PREFIX}{name}"), e.to_string())
    })
}
