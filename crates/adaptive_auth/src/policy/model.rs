//! Validated policy snapshots
//!
//! A snapshot is built once from its document, checked in full, and then
//! shared read-only behind an `Arc`.

use super::cidr::Cidr;
use super::document::{
    ConfidenceDocument, OperationDocument, RiskFactorDocument, RiskFactorKind,
    RiskScoringDocument, StepUpDocument, ThresholdsDocument,
};
use crate::error::{AdaptiveAuthError, AdaptiveAuthResult};
use crate::types::{AuthLevel, RiskLevel};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

const RISK: &str = "risk_scoring";
const STEP_UP: &str = "step_up";

/// Default typical-hours window, local time
pub const DEFAULT_TYPICAL_HOURS: (u8, u8) = (7, 22);
/// Default velocity window
pub const DEFAULT_VELOCITY_WINDOW: Duration = Duration::from_secs(60 * 60);
/// Default distinct-location ceiling within the velocity window
pub const DEFAULT_MAX_DISTINCT_LOCATIONS: usize = 3;
/// Default travel speed ceiling (roughly a commercial flight)
pub const DEFAULT_MAX_TRAVEL_SPEED_KMH: f64 = 900.0;

/// Validated risk scoring policy
#[derive(Debug, Clone, PartialEq)]
pub struct RiskPolicy {
    /// Version label
    pub version: String,
    /// Configured factors
    pub factors: BTreeMap<RiskFactorKind, FactorRule>,
    /// Level lower bounds
    pub thresholds: RiskThresholds,
    /// Confidence formula settings
    pub confidence: ConfidenceWeights,
}

/// Weight and parameters of one factor
#[derive(Debug, Clone, PartialEq)]
pub struct FactorRule {
    /// Contribution when active
    pub weight: f64,
    /// Free text
    pub description: String,
    /// Factor specific parameters
    pub params: FactorParams,
}

/// Factor specific parameters
#[derive(Debug, Clone, PartialEq)]
pub enum FactorParams {
    /// No parameters
    None,
    /// Trusted-network exception for VPN egress
    Vpn {
        /// Networks that get the reduced weight
        trusted_cidrs: Vec<Cidr>,
        /// ASNs that get the reduced weight
        trusted_asns: HashSet<u32>,
        /// Reduced weight
        trusted_weight: f64,
    },
    /// Typical-hours window; wraps past midnight when `start > end`
    TypicalHours {
        /// First typical hour, inclusive
        start: u8,
        /// Last typical hour, exclusive
        end: u8,
    },
    /// Country list, upper-cased
    Countries(HashSet<String>),
    /// Velocity limits
    Velocity {
        /// Trailing window
        window: Duration,
        /// Distinct locations allowed in the window
        max_distinct_locations: usize,
        /// Travel speed ceiling
        max_travel_speed_kmh: f64,
    },
}

/// Ordered lower bounds of each risk level
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskThresholds {
    /// Low
    pub low: f64,
    /// Medium
    pub medium: f64,
    /// High
    pub high: f64,
    /// Critical
    pub critical: f64,
}

impl RiskThresholds {
    /// Highest level whose lower bound `score` meets
    #[must_use]
    pub fn level_for(&self, score: f64) -> RiskLevel {
        if score >= self.critical {
            RiskLevel::Critical
        } else if score >= self.high {
            RiskLevel::High
        } else if score >= self.medium {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

/// Confidence formula sub-weights and saturation caps
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceWeights {
    /// Weight of `min(events / event_cap, 1)`
    pub event_weight: f64,
    /// Weight of `min(age / age_cap, 1)`
    pub age_weight: f64,
    /// Weight of evaluable factors over configured factors
    pub coverage_weight: f64,
    /// Event count at saturation
    pub event_cap: u64,
    /// Baseline age at saturation
    pub age_cap: Duration,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            event_weight: 0.4,
            age_weight: 0.4,
            coverage_weight: 0.2,
            event_cap: 100,
            age_cap: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

impl TryFrom<RiskScoringDocument> for RiskPolicy {
    type Error = AdaptiveAuthError;

    fn try_from(doc: RiskScoringDocument) -> AdaptiveAuthResult<Self> {
        if doc.version.trim().is_empty() {
            return Err(invalid(RISK, "version must not be empty"));
        }
        if doc.risk_factors.is_empty() {
            return Err(invalid(RISK, "at least one risk factor is required"));
        }

        let mut factors = BTreeMap::new();
        for (kind, factor) in doc.risk_factors {
            factors.insert(kind, build_factor(kind, factor)?);
        }

        Ok(Self {
            version: doc.version,
            factors,
            thresholds: build_thresholds(doc.risk_level_thresholds)?,
            confidence: build_confidence(doc.confidence.unwrap_or_default())?,
        })
    }
}

fn build_factor(kind: RiskFactorKind, doc: RiskFactorDocument) -> AdaptiveAuthResult<FactorRule> {
    let name = kind.as_str();
    check_weight(name, "weight", doc.weight)?;

    let params = match kind {
        RiskFactorKind::VpnDetected => {
            let trusted_weight = doc.trusted_weight.unwrap_or(doc.weight / 2.0);
            check_weight(name, "trusted_weight", trusted_weight)?;
            if trusted_weight > doc.weight {
                return Err(invalid(
                    RISK,
                    format!("{name}.trusted_weight {trusted_weight} exceeds weight {}", doc.weight),
                ));
            }
            FactorParams::Vpn {
                trusted_cidrs: doc.trusted_cidrs,
                trusted_asns: doc.trusted_asns.into_iter().collect(),
                trusted_weight,
            }
        }
        RiskFactorKind::UnusualTime => {
            let start = doc.typical_start_hour.unwrap_or(DEFAULT_TYPICAL_HOURS.0);
            let end = doc.typical_end_hour.unwrap_or(DEFAULT_TYPICAL_HOURS.1);
            if start > 23 || end > 24 || start == end {
                return Err(invalid(
                    RISK,
                    format!("{name} typical hours {start}..{end} are not a valid window"),
                ));
            }
            FactorParams::TypicalHours { start, end }
        }
        RiskFactorKind::HighRiskCountry => {
            let countries: HashSet<String> = doc
                .countries
                .iter()
                .map(|c| c.trim().to_ascii_uppercase())
                .filter(|c| !c.is_empty())
                .collect();
            FactorParams::Countries(countries)
        }
        RiskFactorKind::VelocityAnomaly => {
            let window = doc
                .window_minutes
                .map_or(DEFAULT_VELOCITY_WINDOW, |m| Duration::from_secs(m.saturating_mul(60)));
            let speed = doc
                .max_travel_speed_kmh
                .unwrap_or(DEFAULT_MAX_TRAVEL_SPEED_KMH);
            if window.is_zero() {
                return Err(invalid(RISK, format!("{name}.window_minutes must be positive")));
            }
            if !speed.is_finite() || speed <= 0.0 {
                return Err(invalid(
                    RISK,
                    format!("{name}.max_travel_speed_kmh must be positive"),
                ));
            }
            FactorParams::Velocity {
                window,
                max_distinct_locations: doc
                    .max_distinct_locations
                    .unwrap_or(DEFAULT_MAX_DISTINCT_LOCATIONS)
                    .max(1),
                max_travel_speed_kmh: speed,
            }
        }
        RiskFactorKind::NewLocation
        | RiskFactorKind::NewDevice
        | RiskFactorKind::ProxyDetected
        | RiskFactorKind::TorDetected => FactorParams::None,
    };

    Ok(FactorRule {
        weight: doc.weight,
        description: doc.description,
        params,
    })
}

fn build_thresholds(doc: ThresholdsDocument) -> AdaptiveAuthResult<RiskThresholds> {
    let ordered = [
        ("low", doc.low),
        ("medium", doc.medium),
        ("high", doc.high),
        ("critical", doc.critical),
    ];
    for (name, value) in ordered {
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            return Err(invalid(
                RISK,
                format!("threshold {name}={value} must be within [0, 1]"),
            ));
        }
    }
    for pair in ordered.windows(2) {
        let (lower_name, lower) = pair[0];
        let (upper_name, upper) = pair[1];
        if lower >= upper {
            return Err(invalid(
                RISK,
                format!(
                    "thresholds must be strictly increasing: {lower_name}={lower} >= {upper_name}={upper}"
                ),
            ));
        }
    }
    Ok(RiskThresholds {
        low: doc.low,
        medium: doc.medium,
        high: doc.high,
        critical: doc.critical,
    })
}

fn build_confidence(doc: ConfidenceDocument) -> AdaptiveAuthResult<ConfidenceWeights> {
    let defaults = ConfidenceWeights::default();
    let weights = ConfidenceWeights {
        event_weight: doc.event_weight.unwrap_or(defaults.event_weight),
        age_weight: doc.age_weight.unwrap_or(defaults.age_weight),
        coverage_weight: doc.coverage_weight.unwrap_or(defaults.coverage_weight),
        event_cap: doc.event_cap.unwrap_or(defaults.event_cap),
        age_cap: doc
            .age_cap_days
            .map_or(defaults.age_cap, |d| Duration::from_secs(d.saturating_mul(24 * 60 * 60))),
    };

    for (field, value) in [
        ("event_weight", weights.event_weight),
        ("age_weight", weights.age_weight),
        ("coverage_weight", weights.coverage_weight),
    ] {
        check_weight("confidence", field, value)?;
    }
    let sum = weights.event_weight + weights.age_weight + weights.coverage_weight;
    if (sum - 1.0).abs() > 1e-6 {
        return Err(invalid(
            RISK,
            format!("confidence weights must sum to 1, got {sum}"),
        ));
    }
    if weights.event_cap == 0 || weights.age_cap.is_zero() {
        return Err(invalid(RISK, "confidence caps must be positive"));
    }
    Ok(weights)
}

fn check_weight(owner: &str, field: &str, value: f64) -> AdaptiveAuthResult<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(
            RISK,
            format!("{owner}.{field}={value} must be within [0, 1]"),
        ))
    }
}

/// Validated step-up policy
#[derive(Debug, Clone, PartialEq)]
pub struct StepUpPolicy {
    /// Version label
    pub version: String,
    /// Entry used for unknown operations; always present in `operations`
    pub default_operation: String,
    /// Requirements by operation
    pub operations: HashMap<String, OperationPolicy>,
    /// Advisory step-up rate alert threshold
    pub step_up_rate_threshold: f64,
    /// Advisory block rate alert threshold
    pub blocked_operation_rate_threshold: f64,
}

impl StepUpPolicy {
    /// Entry for `operation`, falling back to the default entry
    #[must_use]
    pub fn operation(&self, operation: &str) -> Option<(&str, &OperationPolicy)> {
        self.operations
            .get_key_value(operation)
            .or_else(|| self.operations.get_key_value(&self.default_operation))
            .map(|(name, policy)| (name.as_str(), policy))
    }
}

/// Requirements of one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationPolicy {
    requirements: [AuthLevel; 4],
    /// Maximum age of the current authentication
    pub max_age: Option<Duration>,
}

impl OperationPolicy {
    /// Build from explicit per-level requirements
    #[must_use]
    pub const fn new(
        low: AuthLevel,
        medium: AuthLevel,
        high: AuthLevel,
        critical: AuthLevel,
        max_age: Option<Duration>,
    ) -> Self {
        Self {
            requirements: [low, medium, high, critical],
            max_age,
        }
    }

    /// Required level at `risk`
    #[must_use]
    pub const fn required_level(&self, risk: RiskLevel) -> AuthLevel {
        match risk {
            RiskLevel::Low => self.requirements[0],
            RiskLevel::Medium => self.requirements[1],
            RiskLevel::High => self.requirements[2],
            RiskLevel::Critical => self.requirements[3],
        }
    }
}

impl TryFrom<StepUpDocument> for StepUpPolicy {
    type Error = AdaptiveAuthError;

    fn try_from(doc: StepUpDocument) -> AdaptiveAuthResult<Self> {
        for (name, value) in [
            ("step_up_rate_threshold", doc.step_up_rate_threshold),
            (
                "blocked_operation_rate_threshold",
                doc.blocked_operation_rate_threshold,
            ),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(invalid(
                    STEP_UP,
                    format!("{name}={value} must be within [0, 1]"),
                ));
            }
        }

        let mut operations = HashMap::with_capacity(doc.operations.len());
        for (name, op) in doc.operations {
            let policy = build_operation(&name, &op)?;
            operations.insert(name, policy);
        }

        if !operations.contains_key(&doc.default_operation) {
            return Err(invalid(
                STEP_UP,
                format!(
                    "default operation '{}' has no entry",
                    doc.default_operation
                ),
            ));
        }

        Ok(Self {
            version: doc.version.unwrap_or_else(|| "unversioned".to_string()),
            default_operation: doc.default_operation,
            operations,
            step_up_rate_threshold: doc.step_up_rate_threshold,
            blocked_operation_rate_threshold: doc.blocked_operation_rate_threshold,
        })
    }
}

fn build_operation(name: &str, doc: &OperationDocument) -> AdaptiveAuthResult<OperationPolicy> {
    let levels = doc.risk_levels;
    let mut missing = Vec::new();
    for (level, value) in [
        (RiskLevel::Low, levels.low),
        (RiskLevel::Medium, levels.medium),
        (RiskLevel::High, levels.high),
        (RiskLevel::Critical, levels.critical),
    ] {
        if value.is_none() {
            missing.push(level.as_str());
        }
    }

    match (levels.low, levels.medium, levels.high, levels.critical) {
        (Some(low), Some(medium), Some(high), Some(critical)) => Ok(OperationPolicy::new(
            low,
            medium,
            high,
            critical,
            doc.max_age_secs.map(Duration::from_secs),
        )),
        _ => Err(invalid(
            STEP_UP,
            format!(
                "operation '{name}' is missing risk levels: {}",
                missing.join(", ")
            ),
        )),
    }
}

fn invalid(policy: &str, reason: impl Into<String>) -> AdaptiveAuthError {
    AdaptiveAuthError::policy_load(policy, reason)
}
