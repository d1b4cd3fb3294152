//! Pure risk scoring over a context, an optional baseline and a policy

use super::geo::haversine_km;
use crate::error::{AdaptiveAuthError, AdaptiveAuthResult};
use crate::policy::{FactorParams, FactorRule, RiskFactorKind, RiskPolicy};
use crate::types::{AuthContext, RiskAssessment, UserBehavioralBaseline};
use chrono::{Duration as ChronoDuration, Timelike};
use std::collections::{BTreeMap, HashSet};

/// Largest real-world UTC offset magnitude in minutes (UTC+14)
const MAX_UTC_OFFSET_MINUTES: i32 = 14 * 60;

/// Distance below which two simultaneous sightings count as the same place
const SAME_PLACE_KM: f64 = 1.0;

/// Outcome of one factor
#[derive(Debug, Clone, Copy, PartialEq)]
struct Signal {
    /// The inputs needed to judge the factor were present
    evaluable: bool,
    /// Weight contributed when active
    contribution: Option<f64>,
}

impl Signal {
    const UNKNOWN: Self = Self {
        evaluable: false,
        contribution: None,
    };

    const fn inactive() -> Self {
        Self {
            evaluable: true,
            contribution: None,
        }
    }

    const fn active(weight: f64) -> Self {
        Self {
            evaluable: true,
            contribution: Some(weight),
        }
    }

    const fn when(condition: bool, weight: f64) -> Self {
        if condition {
            Self::active(weight)
        } else {
            Self::inactive()
        }
    }
}

/// Stateless behavioral risk scorer
#[derive(Debug, Default, Clone, Copy)]
pub struct BehavioralRiskEngine;

impl BehavioralRiskEngine {
    /// Create engine
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Score one context
    ///
    /// A `None` or empty baseline is treated as a brand-new user. The result
    /// depends only on the arguments; `ctx.timestamp` is the time reference.
    ///
    /// # Errors
    ///
    /// Returns `InvalidContext` if `user_id` is missing
    pub fn assess(
        &self,
        ctx: &AuthContext,
        baseline: Option<&UserBehavioralBaseline>,
        policy: &RiskPolicy,
    ) -> AdaptiveAuthResult<RiskAssessment> {
        validate_context(ctx)?;
        let baseline = baseline.filter(|b| !b.is_empty());

        let mut contributions = BTreeMap::new();
        let mut evaluable = 0_usize;
        for (kind, rule) in &policy.factors {
            let signal = evaluate_factor(*kind, rule, ctx, baseline);
            if signal.evaluable {
                evaluable += 1;
            }
            if let Some(weight) = signal.contribution {
                contributions.insert(kind.as_str().to_string(), weight);
            }
        }

        let risk_score = contributions.values().sum::<f64>().clamp(0.0, 1.0);
        let confidence = confidence(policy, baseline, evaluable);

        Ok(RiskAssessment {
            user_id: ctx.user_id.clone(),
            risk_score,
            risk_level: policy.thresholds.level_for(risk_score),
            confidence,
            contributions,
            policy_version: policy.version.clone(),
            degraded: false,
            evaluated_at: ctx.timestamp,
        })
    }
}

/// Reject contexts missing required fields
///
/// # Errors
///
/// Returns `InvalidContext` if `user_id` is empty or blank
pub fn validate_context(ctx: &AuthContext) -> AdaptiveAuthResult<()> {
    if ctx.user_id.trim().is_empty() {
        return Err(AdaptiveAuthError::invalid_context(
            "user_id",
            "required field is missing",
        ));
    }
    Ok(())
}

fn evaluate_factor(
    kind: RiskFactorKind,
    rule: &FactorRule,
    ctx: &AuthContext,
    baseline: Option<&UserBehavioralBaseline>,
) -> Signal {
    match kind {
        RiskFactorKind::NewLocation => new_location(rule, ctx, baseline),
        RiskFactorKind::NewDevice => new_device(rule, ctx, baseline),
        RiskFactorKind::VpnDetected => vpn(rule, ctx),
        RiskFactorKind::ProxyDetected => Signal::when(ctx.network.is_proxy, rule.weight),
        RiskFactorKind::TorDetected => Signal::when(ctx.network.is_tor, rule.weight),
        RiskFactorKind::UnusualTime => unusual_time(rule, ctx),
        RiskFactorKind::HighRiskCountry => high_risk_country(rule, ctx),
        RiskFactorKind::VelocityAnomaly => velocity(rule, ctx, baseline),
    }
}

fn new_location(
    rule: &FactorRule,
    ctx: &AuthContext,
    baseline: Option<&UserBehavioralBaseline>,
) -> Signal {
    let Some(key) = ctx.location.as_ref().and_then(|l| l.key()) else {
        return Signal::UNKNOWN;
    };
    let known = baseline.is_some_and(|b| {
        b.known_locations
            .iter()
            .any(|known| known.eq_ignore_ascii_case(&key))
    });
    Signal::when(!known, rule.weight)
}

fn new_device(
    rule: &FactorRule,
    ctx: &AuthContext,
    baseline: Option<&UserBehavioralBaseline>,
) -> Signal {
    let Some(device) = ctx.device_id.as_deref().filter(|d| !d.is_empty()) else {
        return Signal::UNKNOWN;
    };
    let known = baseline.is_some_and(|b| b.known_devices.contains(device));
    Signal::when(!known, rule.weight)
}

fn vpn(rule: &FactorRule, ctx: &AuthContext) -> Signal {
    if !ctx.network.is_vpn {
        return Signal::inactive();
    }
    let weight = match &rule.params {
        FactorParams::Vpn {
            trusted_cidrs,
            trusted_asns,
            trusted_weight,
        } => {
            let by_cidr = ctx
                .network
                .ip
                .is_some_and(|ip| trusted_cidrs.iter().any(|c| c.contains(ip)));
            let by_asn = ctx.network.asn.is_some_and(|asn| trusted_asns.contains(&asn));
            if by_cidr || by_asn {
                *trusted_weight
            } else {
                rule.weight
            }
        }
        _ => rule.weight,
    };
    Signal::active(weight)
}

fn unusual_time(rule: &FactorRule, ctx: &AuthContext) -> Signal {
    let Some(offset) = ctx
        .location
        .as_ref()
        .and_then(|l| l.utc_offset_minutes)
        .filter(|o| o.abs() <= MAX_UTC_OFFSET_MINUTES)
    else {
        return Signal::UNKNOWN;
    };
    let FactorParams::TypicalHours { start, end } = rule.params else {
        return Signal::UNKNOWN;
    };

    let local = ctx.timestamp + ChronoDuration::minutes(i64::from(offset));
    let hour = u8::try_from(local.hour()).unwrap_or(0);
    let typical = if start < end {
        (start..end).contains(&hour)
    } else {
        hour >= start || hour < end
    };
    Signal::when(!typical, rule.weight)
}

fn high_risk_country(rule: &FactorRule, ctx: &AuthContext) -> Signal {
    let Some(country) = ctx
        .location
        .as_ref()
        .and_then(|l| l.country_code.as_deref())
        .map(str::trim)
        .filter(|c| !c.is_empty())
    else {
        return Signal::UNKNOWN;
    };
    match &rule.params {
        FactorParams::Countries(countries) => {
            Signal::when(countries.contains(&country.to_ascii_uppercase()), rule.weight)
        }
        _ => Signal::UNKNOWN,
    }
}

fn velocity(
    rule: &FactorRule,
    ctx: &AuthContext,
    baseline: Option<&UserBehavioralBaseline>,
) -> Signal {
    let Some(location) = ctx.location.as_ref() else {
        return Signal::UNKNOWN;
    };
    let current_key = location.key();
    let current_coords = location.coordinates();
    if current_key.is_none() && current_coords.is_none() {
        return Signal::UNKNOWN;
    }
    let FactorParams::Velocity {
        window,
        max_distinct_locations,
        max_travel_speed_kmh,
    } = rule.params
    else {
        return Signal::UNKNOWN;
    };
    let observations = baseline.map_or(&[][..], |b| b.recent_locations.as_slice());

    let window_start = ctx.timestamp - crate::clock::to_chrono(window);
    let mut distinct: HashSet<String> = observations
        .iter()
        .filter(|o| o.observed_at >= window_start && o.observed_at <= ctx.timestamp)
        .filter_map(|o| o.location.key())
        .map(|k| k.to_ascii_lowercase())
        .collect();
    if let Some(key) = &current_key {
        distinct.insert(key.to_ascii_lowercase());
    }
    if distinct.len() > max_distinct_locations {
        return Signal::active(rule.weight);
    }

    let last = observations
        .iter()
        .filter(|o| o.observed_at <= ctx.timestamp)
        .max_by_key(|o| o.observed_at);
    let impossible_travel = match (last.and_then(|o| o.location.coordinates()), current_coords) {
        (Some(from), Some(to)) => {
            let distance = haversine_km(from, to);
            let elapsed_secs = last.map_or(0, |o| (ctx.timestamp - o.observed_at).num_seconds());
            if elapsed_secs <= 0 {
                distance > SAME_PLACE_KM
            } else {
                distance / (elapsed_secs as f64 / 3600.0) > max_travel_speed_kmh
            }
        }
        _ => false,
    };
    Signal::when(impossible_travel, rule.weight)
}

fn confidence(
    policy: &RiskPolicy,
    baseline: Option<&UserBehavioralBaseline>,
    evaluable: usize,
) -> f64 {
    let weights = &policy.confidence;
    let (event_term, age_term) = baseline.map_or((0.0, 0.0), |b| {
        let events = (b.event_count as f64 / weights.event_cap as f64).min(1.0);
        let age = (b.baseline_age.as_secs_f64() / weights.age_cap.as_secs_f64()).min(1.0);
        (events, age)
    });
    let coverage = if policy.factors.is_empty() {
        0.0
    } else {
        evaluable as f64 / policy.factors.len() as f64
    };

    (weights.event_weight * event_term
        + weights.age_weight * age_term
        + weights.coverage_weight * coverage)
        .clamp(0.0, 1.0)
}
