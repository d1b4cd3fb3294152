//! Policy publication, hot reload and file-backed configuration
#![allow(clippy::unwrap_used)]

mod common;

use adaptive_auth::audit::MemoryAuditSink;
use adaptive_auth::clock::ManualClock;
use adaptive_auth::config::AdaptiveAuthConfig;
use adaptive_auth::error::{AdaptiveAuthError, AdaptiveAuthResult};
use adaptive_auth::mfa::{InMemorySessionStore, ValidatorRegistry};
use adaptive_auth::policy::{FilePolicySource, PolicyStore};
use adaptive_auth::risk::{BehavioralRiskEngine, InMemoryBaselineRepository};
use adaptive_auth::step_up::InMemoryRegisteredMethods;
use adaptive_auth::types::{AuthLevel, RiskLevel};
use adaptive_auth::{AdaptiveAuth, Collaborators, Verdict};
use common::{london, mature_baseline, new_york, start_time, TestBed, DEFAULT_POLICY, USER};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default policy with the medium threshold raised above a lone new location
fn raised_medium_threshold() -> String {
    DEFAULT_POLICY
        .replacen("version: \"1.0\"", "version: \"1.1\"", 1)
        .replace("    medium: 0.2\n", "    medium: 0.35\n")
}

async fn wait_for_risk_version(policies: &PolicyStore, version: &str) -> AdaptiveAuthResult<()> {
    for _ in 0..100 {
        if policies.current_risk()?.version == version {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Err(AdaptiveAuthError::Internal {
        reason: format!("risk policy {version} was never published"),
    })
}

#[tokio::test(start_paused = true)]
async fn test_reload_applies_to_later_assessments_only() -> AdaptiveAuthResult<()> {
    let bed = TestBed::new().await?;
    let baseline = mature_baseline(new_york(), start_time());
    bed.baselines.insert(USER, baseline.clone());
    let ctx = bed.context(london());

    let before = bed.auth.assessor().assess_risk(&ctx).await?;
    assert_eq!(before.risk_level, RiskLevel::Medium);
    assert_eq!(before.policy_version, "1.0");
    let in_flight = bed.auth.policies().current_risk()?;

    let worker = bed.auth.spawn_hot_reload();
    bed.source.set_combined(raised_medium_threshold());
    bed.auth.policies().notify_changed();
    wait_for_risk_version(bed.auth.policies(), "1.1").await?;

    let after = bed.auth.assessor().assess_risk(&ctx).await?;
    assert_eq!(after.risk_level, RiskLevel::Low);
    assert_eq!(after.policy_version, "1.1");
    assert!((after.risk_score - before.risk_score).abs() < f64::EPSILON);

    let pinned = BehavioralRiskEngine::new().assess(&ctx, Some(&baseline), &in_flight)?;
    assert_eq!(pinned.risk_level, RiskLevel::Medium);
    assert_eq!(pinned.policy_version, "1.0");

    worker.stop().await;
    Ok(())
}

/// Default policy relabelled `version` with its own medium and high bounds
fn risk_policy_variant(version: &str, medium: f64, high: f64) -> String {
    DEFAULT_POLICY
        .replacen("version: \"1.0\"", &format!("version: \"{version}\""), 1)
        .replace("    medium: 0.2\n", &format!("    medium: {medium}\n"))
        .replace("    high: 0.5\n", &format!("    high: {high}\n"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_readers_never_observe_mixed_policy() -> AdaptiveAuthResult<()> {
    const READERS: usize = 4;
    let variants = [("2.0", 0.25, 0.55), ("2.1", 0.3, 0.6)];
    let bed = TestBed::new().await?;
    let policies = Arc::clone(bed.auth.policies());
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..READERS)
        .map(|_| {
            let policies = Arc::clone(&policies);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let mut seen = Vec::new();
                while !done.load(Ordering::Acquire) {
                    let policy = policies.current_risk().unwrap();
                    seen.push((
                        policy.version.clone(),
                        policy.thresholds.medium,
                        policy.thresholds.high,
                    ));
                }
                seen
            })
        })
        .collect();

    for round in 0..200 {
        let (version, medium, high) = variants[round % variants.len()];
        bed.source.set_combined(risk_policy_variant(version, medium, high));
        policies.load_risk_policy().await?;
    }
    done.store(true, Ordering::Release);

    let mut observed = 0;
    for reader in readers {
        for (version, medium, high) in reader.join().unwrap() {
            observed += 1;
            let consistent = (version == "1.0" && medium == 0.2 && high == 0.5)
                || variants
                    .iter()
                    .any(|(v, m, h)| version == *v && medium == *m && high == *h);
            assert!(consistent, "mixed snapshot {version} medium={medium} high={high}");
        }
    }
    assert!(observed > 0);
    Ok(())
}

#[tokio::test]
async fn test_invalid_document_keeps_last_known_good() -> AdaptiveAuthResult<()> {
    let bed = TestBed::new().await?;
    let failures_before = bed.auth.metrics().snapshot().policy_reload_failures;

    bed.source.set_combined(
        DEFAULT_POLICY.replace("    critical: 0.8\n", "    critical: 0.4\n"),
    );
    let result = bed.auth.load_policies().await;

    assert!(matches!(result, Err(AdaptiveAuthError::PolicyLoad { .. })));
    assert_eq!(bed.auth.policies().current_risk()?.version, "1.0");
    assert_eq!(bed.auth.policies().current_risk()?.thresholds.critical, 0.8);
    assert!(bed.auth.metrics().snapshot().policy_reload_failures > failures_before);

    let outcome = bed.auth.authorize(&bed.context(london()), AuthLevel::Basic).await?;
    assert!(matches!(outcome.verdict, Verdict::Allow));
    Ok(())
}

#[tokio::test]
async fn test_core_runs_from_configuration_files() -> AdaptiveAuthResult<()> {
    let dir = tempfile::tempdir()?;
    let policy_path = dir.path().join("policies.yaml");
    std::fs::write(&policy_path, DEFAULT_POLICY)?;

    let mut config = AdaptiveAuthConfig::new_development();
    config.policy.risk_policy_path = Some(policy_path.clone());
    config.policy.step_up_policy_path = None;
    let config_path = dir.path().join("adaptive_auth.toml");
    std::fs::write(&config_path, toml::to_string(&config).unwrap())?;

    let config = AdaptiveAuthConfig::from_file(&config_path)?;
    let source = FilePolicySource::from_config(&config.policy)?;
    let baselines = Arc::new(InMemoryBaselineRepository::new());
    baselines.insert(USER, mature_baseline(london(), start_time()));

    let auth = AdaptiveAuth::new(
        config,
        Collaborators {
            policy_source: Arc::new(source),
            baselines,
            methods: Arc::new(InMemoryRegisteredMethods::new()),
            sessions: Arc::new(InMemorySessionStore::new()),
            validators: ValidatorRegistry::new(),
            audit: Arc::new(MemoryAuditSink::new()),
            clock: Arc::new(ManualClock::new(start_time())),
        },
    )?;
    tokio_test::assert_ok!(auth.load_policies().await);
    assert!(auth.policies().current_step_up()?.operation("transfer_funds").is_some());

    std::fs::write(&policy_path, raised_medium_threshold())?;
    auth.load_policies().await?;
    assert_eq!(auth.policies().current_risk()?.version, "1.1");
    Ok(())
}
