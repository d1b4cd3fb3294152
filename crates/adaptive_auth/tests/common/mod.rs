//! Shared fixtures for integration tests
#![allow(dead_code)]

use adaptive_auth::audit::MemoryAuditSink;
use adaptive_auth::clock::ManualClock;
use adaptive_auth::config::AdaptiveAuthConfig;
use adaptive_auth::error::AdaptiveAuthResult;
use adaptive_auth::mfa::{Challenge, FactorValidator, InMemorySessionStore, ValidatorRegistry};
use adaptive_auth::policy::InMemoryPolicySource;
use adaptive_auth::risk::InMemoryBaselineRepository;
use adaptive_auth::step_up::InMemoryRegisteredMethods;
use adaptive_auth::types::{
    AuthContext, FactorType, GeoLocation, LocationObservation, NetworkInfo, UserBehavioralBaseline,
};
use adaptive_auth::{AdaptiveAuth, Collaborators};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_POLICY: &str = include_str!("../../policies/default.yaml");

pub const USER: &str = "alice";
pub const DEVICE: &str = "laptop-7f3a";
pub const TOTP_CODE: &str = "246810";

/// 2026-05-01 12:00 UTC
pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 5, 1, 12, 0, 0).unwrap()
}

pub fn london() -> GeoLocation {
    GeoLocation::new("GB", "London")
        .with_coordinates(51.5074, -0.1278)
        .with_utc_offset(60)
}

pub fn new_york() -> GeoLocation {
    GeoLocation::new("US", "NewYork")
        .with_coordinates(40.7128, -74.0060)
        .with_utc_offset(-240)
}

pub fn moscow() -> GeoLocation {
    GeoLocation::new("RU", "Moscow")
        .with_coordinates(55.7558, 37.6173)
        .with_utc_offset(180)
}

pub fn home_network() -> NetworkInfo {
    NetworkInfo {
        ip: "81.2.69.142".parse().ok(),
        asn: Some(20_712),
        ..NetworkInfo::default()
    }
}

/// Mature baseline anchored at `home`, last seen there a day before `now`
pub fn mature_baseline(home: GeoLocation, now: DateTime<Utc>) -> UserBehavioralBaseline {
    let mut baseline = UserBehavioralBaseline {
        event_count: 500,
        baseline_age: Duration::from_secs(120 * 24 * 3600),
        ..UserBehavioralBaseline::default()
    };
    if let Some(key) = home.key() {
        baseline.known_locations.insert(key);
    }
    baseline.known_devices.insert(DEVICE.to_string());
    baseline.recent_locations.push(LocationObservation {
        location: home,
        observed_at: now - ChronoDuration::days(1),
    });
    baseline
}

/// Validator accepting one fixed code, optionally after a delay
#[derive(Debug)]
pub struct CodeValidator {
    code: String,
    delay: Duration,
    calls: AtomicUsize,
}

impl CodeValidator {
    pub fn new(code: &str) -> Self {
        Self::slow(code, Duration::ZERO)
    }

    pub fn slow(code: &str, delay: Duration) -> Self {
        Self {
            code: code.to_string(),
            delay,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FactorValidator for CodeValidator {
    async fn validate(&self, _challenge: &Challenge, credential: &str) -> AdaptiveAuthResult<bool> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(credential == self.code)
    }
}

/// A fully wired core over in-memory collaborators
pub struct TestBed {
    pub auth: AdaptiveAuth,
    pub clock: ManualClock,
    pub source: Arc<InMemoryPolicySource>,
    pub baselines: Arc<InMemoryBaselineRepository>,
    pub methods: Arc<InMemoryRegisteredMethods>,
    pub sessions: Arc<InMemorySessionStore>,
    pub audit: Arc<MemoryAuditSink>,
    pub totp: Arc<CodeValidator>,
}

impl TestBed {
    pub async fn new() -> AdaptiveAuthResult<Self> {
        Self::with_totp(CodeValidator::new(TOTP_CODE)).await
    }

    pub async fn with_totp(totp: CodeValidator) -> AdaptiveAuthResult<Self> {
        let clock = ManualClock::new(start_time());
        let source = Arc::new(InMemoryPolicySource::combined(DEFAULT_POLICY));
        let baselines = Arc::new(InMemoryBaselineRepository::new());
        let methods = Arc::new(InMemoryRegisteredMethods::new());
        let sessions = Arc::new(InMemorySessionStore::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let totp = Arc::new(totp);

        let validators = ValidatorRegistry::new().with(FactorType::Totp, totp.clone());
        let auth = AdaptiveAuth::new(
            AdaptiveAuthConfig::new_development(),
            Collaborators {
                policy_source: source.clone(),
                baselines: baselines.clone(),
                methods: methods.clone(),
                sessions: sessions.clone(),
                validators,
                audit: audit.clone(),
                clock: Arc::new(clock.clone()),
            },
        )?;
        auth.load_policies().await?;

        baselines.insert(USER, mature_baseline(london(), start_time()));
        methods.register(USER, FactorType::Totp);

        Ok(Self {
            auth,
            clock,
            source,
            baselines,
            methods,
            sessions,
            audit,
            totp,
        })
    }

    /// Known device on the home network at `location`
    pub fn context(&self, location: GeoLocation) -> AuthContext {
        AuthContext::new(USER, start_time())
            .with_device(DEVICE)
            .with_network(home_network())
            .with_location(location)
    }
}
