//! Core types for adaptive authentication

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

/// Authenticator assurance level, ordered weakest to strongest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthLevel {
    /// Single factor (password or session)
    Basic,
    /// One additional factor
    Mfa,
    /// Phishing-resistant factor
    StrongMfa,
}

impl AuthLevel {
    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Basic => "basic",
            Self::Mfa => "mfa",
            Self::StrongMfa => "strong_mfa",
        }
    }

    /// Factor types that satisfy this level when used for step-up
    #[must_use]
    pub const fn step_up_methods(self) -> &'static [FactorType] {
        match self {
            Self::Basic => &[],
            Self::Mfa => &[FactorType::Otp, FactorType::Totp],
            Self::StrongMfa => &[FactorType::WebAuthn, FactorType::HardwareKey],
        }
    }
}

impl fmt::Display for AuthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Risk bracket derived from a score and policy thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    /// Below or at the low threshold
    Low,
    /// At or above the medium threshold
    Medium,
    /// At or above the high threshold
    High,
    /// At or above the critical threshold
    Critical,
}

impl RiskLevel {
    /// All levels in ascending order
    pub const ALL: [Self; 4] = [Self::Low, Self::Medium, Self::High, Self::Critical];

    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// MFA factor types
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactorType {
    /// One-time password delivered out of band
    Otp,
    /// Time-based one-time password
    Totp,
    /// Emailed magic link
    MagicLink,
    /// `WebAuthn` platform or roaming authenticator
    #[serde(rename = "webauthn")]
    WebAuthn,
    /// Hardware security key
    HardwareKey,
}

impl FactorType {
    /// Stable lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Otp => "otp",
            Self::Totp => "totp",
            Self::MagicLink => "magic_link",
            Self::WebAuthn => "webauthn",
            Self::HardwareKey => "hardware_key",
        }
    }

    /// Assurance level reached by completing this factor
    #[must_use]
    pub const fn level(self) -> AuthLevel {
        match self {
            Self::Otp | Self::Totp | Self::MagicLink => AuthLevel::Mfa,
            Self::WebAuthn | Self::HardwareKey => AuthLevel::StrongMfa,
        }
    }
}

impl fmt::Display for FactorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Geographic location of a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    /// ISO 3166-1 alpha-2 country code
    pub country_code: Option<String>,
    /// City name
    pub city: Option<String>,
    /// Latitude in degrees
    pub latitude: Option<f64>,
    /// Longitude in degrees
    pub longitude: Option<f64>,
    /// Local offset from UTC in minutes
    pub utc_offset_minutes: Option<i32>,
}

impl GeoLocation {
    /// Location with country and city only
    pub fn new(country_code: impl Into<String>, city: impl Into<String>) -> Self {
        Self {
            country_code: Some(country_code.into()),
            city: Some(city.into()),
            latitude: None,
            longitude: None,
            utc_offset_minutes: None,
        }
    }

    /// Set coordinates
    #[must_use]
    pub fn with_coordinates(mut self, latitude: f64, longitude: f64) -> Self {
        self.latitude = Some(latitude);
        self.longitude = Some(longitude);
        self
    }

    /// Set local UTC offset
    #[must_use]
    pub fn with_utc_offset(mut self, minutes: i32) -> Self {
        self.utc_offset_minutes = Some(minutes);
        self
    }

    /// Identity key used to compare against known locations
    ///
    /// `COUNTRY/City`, or whichever of the two is present. The country
    /// code is upper-cased.
    #[must_use]
    pub fn key(&self) -> Option<String> {
        let country = self
            .country_code
            .as_deref()
            .filter(|c| !c.is_empty())
            .map(str::to_ascii_uppercase);
        let city = self.city.as_deref().filter(|c| !c.is_empty());
        match (country, city) {
            (Some(country), Some(city)) => Some(format!("{country}/{city}")),
            (Some(country), None) => Some(country),
            (None, Some(city)) => Some(city.to_string()),
            (None, None) => None,
        }
    }

    /// Coordinates when both are present and finite
    #[must_use]
    pub fn coordinates(&self) -> Option<(f64, f64)> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lon))
                if lat.is_finite()
                    && lon.is_finite()
                    && (-90.0..=90.0).contains(&lat)
                    && (-180.0..=180.0).contains(&lon) =>
            {
                Some((lat, lon))
            }
            _ => None,
        }
    }
}

/// Network attributes of a request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    /// Client address
    pub ip: Option<IpAddr>,
    /// Autonomous system number
    pub asn: Option<u32>,
    /// Address classified as VPN egress
    pub is_vpn: bool,
    /// Address classified as open proxy
    pub is_proxy: bool,
    /// Address classified as Tor exit
    pub is_tor: bool,
}

/// Observable signals of one authentication attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthContext {
    /// Subject being authenticated
    pub user_id: String,
    /// Device fingerprint
    pub device_id: Option<String>,
    /// Network attributes
    #[serde(default)]
    pub network: NetworkInfo,
    /// Geographic location
    pub location: Option<GeoLocation>,
    /// Request time
    pub timestamp: DateTime<Utc>,
    /// Operation the request wants to perform
    pub operation: Option<String>,
}

impl AuthContext {
    /// Create a context with only the required fields
    pub fn new(user_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: None,
            network: NetworkInfo::default(),
            location: None,
            timestamp,
            operation: None,
        }
    }

    /// Set device fingerprint
    #[must_use]
    pub fn with_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    /// Set location
    #[must_use]
    pub fn with_location(mut self, location: GeoLocation) -> Self {
        self.location = Some(location);
        self
    }

    /// Set network attributes
    #[must_use]
    pub fn with_network(mut self, network: NetworkInfo) -> Self {
        self.network = network;
        self
    }

    /// Set requested operation
    #[must_use]
    pub fn with_operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = Some(operation.into());
        self
    }
}

/// A past location sighting used for velocity checks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationObservation {
    /// Where the user was seen
    pub location: GeoLocation,
    /// When the user was seen
    pub observed_at: DateTime<Utc>,
}

/// Historical norm for a user, owned by an external repository
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserBehavioralBaseline {
    /// Location keys seen before
    pub known_locations: HashSet<String>,
    /// Device fingerprints seen before
    pub known_devices: HashSet<String>,
    /// Assurance levels the user has reached before
    pub known_auth_levels: HashSet<AuthLevel>,
    /// Recent sightings, any order
    pub recent_locations: Vec<LocationObservation>,
    /// Number of authentication events in the baseline
    pub event_count: u64,
    /// Time since the first recorded event
    pub baseline_age: Duration,
}

impl UserBehavioralBaseline {
    /// Baseline with no history
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.event_count == 0
    }
}

/// Output of risk scoring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// Assessed user
    pub user_id: String,
    /// Score in `[0, 1]`
    pub risk_score: f64,
    /// Bracket of the score
    pub risk_level: RiskLevel,
    /// Confidence in `[0, 1]`
    pub confidence: f64,
    /// Weight contributed by each active factor
    pub contributions: BTreeMap<String, f64>,
    /// Version of the policy used
    pub policy_version: String,
    /// Baseline was unavailable and a new-user assessment was produced
    pub degraded: bool,
    /// Request time the assessment was computed for
    pub evaluated_at: DateTime<Utc>,
}

impl RiskAssessment {
    /// Whether a factor contributed to the score
    #[must_use]
    pub fn is_active(&self, factor: &str) -> bool {
        self.contributions.contains_key(factor)
    }
}

/// Output of step-up policy evaluation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepUpDecision {
    /// Evaluated operation
    pub operation: String,
    /// Policy entry actually used
    pub policy_operation: String,
    /// Risk level the decision was made for
    pub risk_level: RiskLevel,
    /// Level the caller already holds
    pub current_level: AuthLevel,
    /// Level the operation requires
    pub required_level: AuthLevel,
    /// Methods offered for step-up, sorted
    pub allowed_methods: Vec<FactorType>,
    /// Caller must complete an MFA chain
    pub step_up_required: bool,
    /// Request must be denied
    pub blocked: bool,
}

impl StepUpDecision {
    /// Request may proceed without further authentication
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        !self.step_up_required && !self.blocked
    }
}
