//! Serialized policy document shapes
//!
//! These mirror the YAML a policy author writes. They are converted into the
//! validated [`RiskPolicy`](super::RiskPolicy) and
//! [`StepUpPolicy`](super::StepUpPolicy) before anything reads them.

use super::cidr::Cidr;
use crate::types::AuthLevel;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A policy file; either section may be absent when files are split
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyDocument {
    /// Risk scoring section
    #[serde(default)]
    pub risk_scoring: Option<RiskScoringDocument>,
    /// Step-up section
    #[serde(default)]
    pub step_up: Option<StepUpDocument>,
}

/// Supported risk factors
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFactorKind {
    /// Location not in the baseline
    NewLocation,
    /// Device not in the baseline
    NewDevice,
    /// VPN egress
    VpnDetected,
    /// Open proxy
    ProxyDetected,
    /// Tor exit node
    TorDetected,
    /// Local hour outside the typical window
    UnusualTime,
    /// Country on the high-risk list
    HighRiskCountry,
    /// Too many locations or impossible travel
    VelocityAnomaly,
}

impl RiskFactorKind {
    /// Stable snake_case name, used as contribution key
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NewLocation => "new_location",
            Self::NewDevice => "new_device",
            Self::VpnDetected => "vpn_detected",
            Self::ProxyDetected => "proxy_detected",
            Self::TorDetected => "tor_detected",
            Self::UnusualTime => "unusual_time",
            Self::HighRiskCountry => "high_risk_country",
            Self::VelocityAnomaly => "velocity_anomaly",
        }
    }
}

/// `risk_scoring` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskScoringDocument {
    /// Policy version label
    pub version: String,
    /// Factor name to weight and parameters
    pub risk_factors: BTreeMap<RiskFactorKind, RiskFactorDocument>,
    /// Lower bounds of each level
    pub risk_level_thresholds: ThresholdsDocument,
    /// Confidence tuning
    #[serde(default)]
    pub confidence: Option<ConfidenceDocument>,
}

/// One factor entry; parameters not used by the factor are ignored
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskFactorDocument {
    /// Contribution when active
    pub weight: f64,
    /// Free text
    #[serde(default)]
    pub description: String,
    /// `vpn_detected`: networks that get `trusted_weight`
    #[serde(default)]
    pub trusted_cidrs: Vec<Cidr>,
    /// `vpn_detected`: ASNs that get `trusted_weight`
    #[serde(default)]
    pub trusted_asns: Vec<u32>,
    /// `vpn_detected`: reduced weight for trusted networks
    #[serde(default)]
    pub trusted_weight: Option<f64>,
    /// `unusual_time`: first typical hour, inclusive
    #[serde(default)]
    pub typical_start_hour: Option<u8>,
    /// `unusual_time`: last typical hour, exclusive
    #[serde(default)]
    pub typical_end_hour: Option<u8>,
    /// `high_risk_country`: ISO country codes
    #[serde(default)]
    pub countries: Vec<String>,
    /// `velocity_anomaly`: trailing window
    #[serde(default)]
    pub window_minutes: Option<u64>,
    /// `velocity_anomaly`: distinct locations allowed in the window
    #[serde(default)]
    pub max_distinct_locations: Option<usize>,
    /// `velocity_anomaly`: travel speed ceiling
    #[serde(default)]
    pub max_travel_speed_kmh: Option<f64>,
}

/// Level thresholds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdsDocument {
    /// Low bracket lower bound
    pub low: f64,
    /// Medium bracket lower bound
    pub medium: f64,
    /// High bracket lower bound
    pub high: f64,
    /// Critical bracket lower bound
    pub critical: f64,
}

/// Confidence tuning overrides
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceDocument {
    /// Weight of the event-count term
    pub event_weight: Option<f64>,
    /// Weight of the baseline-age term
    pub age_weight: Option<f64>,
    /// Weight of the factor-coverage term
    pub coverage_weight: Option<f64>,
    /// Events at which the event term saturates
    pub event_cap: Option<u64>,
    /// Days at which the age term saturates
    pub age_cap_days: Option<u64>,
}

/// `step_up` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepUpDocument {
    /// Policy version label
    #[serde(default)]
    pub version: Option<String>,
    /// Entry used for unknown operations
    #[serde(default = "default_operation_name")]
    pub default_operation: String,
    /// Operation name to requirements
    pub operations: BTreeMap<String, OperationDocument>,
    /// Advisory alert threshold on the step-up rate
    pub step_up_rate_threshold: f64,
    /// Advisory alert threshold on the block rate
    pub blocked_operation_rate_threshold: f64,
}

fn default_operation_name() -> String {
    "default".to_string()
}

/// One operation entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDocument {
    /// Free text
    #[serde(default)]
    pub description: String,
    /// Required level per risk level
    pub risk_levels: RiskLevelsDocument,
    /// Maximum age of the current authentication
    #[serde(default)]
    pub max_age_secs: Option<u64>,
}

/// Required level per risk level; completeness is checked on conversion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskLevelsDocument {
    /// Requirement at low risk
    #[serde(default)]
    pub low: Option<AuthLevel>,
    /// Requirement at medium risk
    #[serde(default)]
    pub medium: Option<AuthLevel>,
    /// Requirement at high risk
    #[serde(default)]
    pub high: Option<AuthLevel>,
    /// Requirement at critical risk
    #[serde(default)]
    pub critical: Option<AuthLevel>,
}
