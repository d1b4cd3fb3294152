//! # Policy Store
//!
//! Loads, validates and publishes the risk scoring and step-up policies.
//!
//! ## Snapshot model
//!
//! - Each family is held as `Option<Arc<_>>` behind a `parking_lot::RwLock`;
//!   readers only clone the `Arc`, writers only swap it
//! - Reloads are serialized by an async mutex and never hold the snapshot
//!   lock while fetching or parsing
//! - A failed load leaves the last known-good snapshot in place
//! - Reloads run on a polling interval or on [`PolicyStore::notify_changed`]

pub mod cidr;
pub mod document;
pub mod model;
pub mod source;

pub use cidr::Cidr;
pub use document::{PolicyDocument, RiskFactorKind};
pub use model::{
    ConfidenceWeights, FactorParams, FactorRule, OperationPolicy, RiskPolicy, RiskThresholds,
    StepUpPolicy,
};
pub use source::{FilePolicySource, InMemoryPolicySource, PolicyKind, PolicySource};

use crate::error::{AdaptiveAuthError, AdaptiveAuthResult};
use crate::retry::RetryPolicy;
use crate::telemetry::AuthMetrics;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Holder of the active policy snapshots
pub struct PolicyStore {
    source: Arc<dyn PolicySource>,
    risk: RwLock<Option<Arc<RiskPolicy>>>,
    step_up: RwLock<Option<Arc<StepUpPolicy>>>,
    reload_lock: Mutex<()>,
    changed: Notify,
    retry: RetryPolicy,
    metrics: Arc<AuthMetrics>,
}

impl std::fmt::Debug for PolicyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyStore")
            .field("risk_version", &self.risk.read().as_ref().map(|p| p.version.clone()))
            .field(
                "step_up_version",
                &self.step_up.read().as_ref().map(|p| p.version.clone()),
            )
            .finish_non_exhaustive()
    }
}

impl PolicyStore {
    /// Create an empty store; nothing is published until a load succeeds
    #[must_use]
    pub fn new(
        source: Arc<dyn PolicySource>,
        retry: RetryPolicy,
        metrics: Arc<AuthMetrics>,
    ) -> Self {
        Self {
            source,
            risk: RwLock::new(None),
            step_up: RwLock::new(None),
            reload_lock: Mutex::new(()),
            changed: Notify::new(),
            retry,
            metrics,
        }
    }

    /// Active risk policy
    ///
    /// # Errors
    ///
    /// Returns `PolicyUnavailable` if no risk policy has ever loaded
    pub fn current_risk(&self) -> AdaptiveAuthResult<Arc<RiskPolicy>> {
        self.risk
            .read()
            .clone()
            .ok_or_else(|| AdaptiveAuthError::PolicyUnavailable {
                policy: PolicyKind::RiskScoring.to_string(),
            })
    }

    /// Active step-up policy
    ///
    /// # Errors
    ///
    /// Returns `PolicyUnavailable` if no step-up policy has ever loaded
    pub fn current_step_up(&self) -> AdaptiveAuthResult<Arc<StepUpPolicy>> {
        self.step_up
            .read()
            .clone()
            .ok_or_else(|| AdaptiveAuthError::PolicyUnavailable {
                policy: PolicyKind::StepUp.to_string(),
            })
    }

    /// Fetch, validate and publish one policy family; returns the new version
    ///
    /// # Errors
    ///
    /// Returns `PolicyLoad` if the document cannot be fetched, parsed or
    /// validated; the previous snapshot stays active
    pub async fn load(&self, kind: PolicyKind) -> AdaptiveAuthResult<String> {
        let _guard = self.reload_lock.lock().await;
        match kind {
            PolicyKind::RiskScoring => self.load_risk_locked().await.map(|p| p.version.clone()),
            PolicyKind::StepUp => self.load_step_up_locked().await.map(|p| p.version.clone()),
        }
    }

    /// Load and publish the risk scoring policy
    ///
    /// # Errors
    ///
    /// Returns `PolicyLoad` on failure; the previous snapshot stays active
    pub async fn load_risk_policy(&self) -> AdaptiveAuthResult<Arc<RiskPolicy>> {
        let _guard = self.reload_lock.lock().await;
        self.load_risk_locked().await
    }

    /// Load and publish the step-up policy
    ///
    /// # Errors
    ///
    /// Returns `PolicyLoad` on failure; the previous snapshot stays active
    pub async fn load_step_up_policy(&self) -> AdaptiveAuthResult<Arc<StepUpPolicy>> {
        let _guard = self.reload_lock.lock().await;
        self.load_step_up_locked().await
    }

    /// Reload both families; both are attempted even if the first fails
    ///
    /// # Errors
    ///
    /// Returns the first load error
    pub async fn reload_all(&self) -> AdaptiveAuthResult<()> {
        let _guard = self.reload_lock.lock().await;
        let risk = self.load_risk_locked().await;
        let step_up = self.load_step_up_locked().await;
        risk?;
        step_up?;
        Ok(())
    }

    /// Signal that the underlying documents changed
    pub fn notify_changed(&self) {
        self.changed.notify_one();
    }

    /// Start the hot-reload worker
    ///
    /// The worker reloads every `interval` and whenever
    /// [`notify_changed`](Self::notify_changed) is called.
    #[must_use]
    pub fn spawn_hot_reload(self: &Arc<Self>, interval: Duration) -> HotReloadHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
        let store = Arc::clone(self);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // First tick completes immediately; startup loads are the caller's job.
            ticker.tick().await;

            info!("Policy hot reload started, interval {:?}", interval);
            loop {
                let trigger = tokio::select! {
                    _ = ticker.tick() => "interval",
                    () = store.changed.notified() => "notification",
                    _ = &mut shutdown_rx => break,
                };
                debug!("Policy reload triggered by {}", trigger);
                if let Err(e) = store.reload_all().await {
                    warn!("Policy reload ({}) failed, keeping last known-good: {}", trigger, e);
                }
            }
            info!("Policy hot reload stopped");
        });

        HotReloadHandle {
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    async fn load_risk_locked(&self) -> AdaptiveAuthResult<Arc<RiskPolicy>> {
        let result = self.build(PolicyKind::RiskScoring).await.and_then(|doc| {
            doc.risk_scoring
                .ok_or_else(|| missing_section(PolicyKind::RiskScoring))
                .and_then(RiskPolicy::try_from)
        });

        match result {
            Ok(policy) => {
                let policy = Arc::new(policy);
                let previous = self.risk.write().replace(Arc::clone(&policy));
                self.metrics.record_policy_reload(PolicyKind::RiskScoring.as_str(), true);
                info!(
                    "Published risk policy version {} (previous {:?})",
                    policy.version,
                    previous.map(|p| p.version.clone())
                );
                Ok(policy)
            }
            Err(e) => {
                self.metrics.record_policy_reload(PolicyKind::RiskScoring.as_str(), false);
                warn!(
                    "Risk policy load failed, active version {:?}: {}",
                    self.risk.read().as_ref().map(|p| p.version.clone()),
                    e
                );
                Err(e)
            }
        }
    }

    async fn load_step_up_locked(&self) -> AdaptiveAuthResult<Arc<StepUpPolicy>> {
        let result = self.build(PolicyKind::StepUp).await.and_then(|doc| {
            doc.step_up
                .ok_or_else(|| missing_section(PolicyKind::StepUp))
                .and_then(StepUpPolicy::try_from)
        });

        match result {
            Ok(policy) => {
                let policy = Arc::new(policy);
                let previous = self.step_up.write().replace(Arc::clone(&policy));
                self.metrics.record_policy_reload(PolicyKind::StepUp.as_str(), true);
                info!(
                    "Published step-up policy version {} (previous {:?})",
                    policy.version,
                    previous.map(|p| p.version.clone())
                );
                Ok(policy)
            }
            Err(e) => {
                self.metrics.record_policy_reload(PolicyKind::StepUp.as_str(), false);
                warn!(
                    "Step-up policy load failed, active version {:?}: {}",
                    self.step_up.read().as_ref().map(|p| p.version.clone()),
                    e
                );
                Err(e)
            }
        }
    }

    async fn build(&self, kind: PolicyKind) -> AdaptiveAuthResult<PolicyDocument> {
        let raw = self
            .retry
            .run("policy_fetch", || self.source.fetch(kind))
            .await
            .map_err(|e| AdaptiveAuthError::policy_load(kind.as_str(), e.to_string()))?;

        serde_yaml::from_str::<PolicyDocument>(&raw)
            .map_err(|e| AdaptiveAuthError::policy_load(kind.as_str(), e.to_string()))
    }
}

fn missing_section(kind: PolicyKind) -> AdaptiveAuthError {
    AdaptiveAuthError::policy_load(kind.as_str(), format!("document has no {kind} section"))
}

/// Running hot-reload worker
#[derive(Debug)]
pub struct HotReloadHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl HotReloadHandle {
    /// Stop the worker and wait for it to exit
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!("Policy hot reload task ended abnormally: {}", e);
        }
    }
}

impl Drop for HotReloadHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::source::MockPolicySource;
    use crate::types::RiskLevel;

    const POLICY: &str = r#"
risk_scoring:
  version: "1.0"
  risk_factors:
    new_location: { weight: 0.3 }
    tor_detected: { weight: 0.5 }
  risk_level_thresholds: { low: 0.0, medium: 0.2, high: 0.5, critical: 0.8 }
step_up:
  version: "1.0"
  operations:
    default:
      risk_levels: { low: basic, medium: mfa, high: mfa, critical: strong_mfa }
  step_up_rate_threshold: 0.3
  blocked_operation_rate_threshold: 0.05
"#;

    fn store_with(source: Arc<dyn PolicySource>) -> PolicyStore {
        PolicyStore::new(
            source,
            RetryPolicy::fixed(3, Duration::from_millis(1)),
            Arc::new(AuthMetrics::new()),
        )
    }

    #[tokio::test]
    async fn test_unloaded_store_is_unavailable() {
        let store = store_with(Arc::new(InMemoryPolicySource::new()));
        assert!(matches!(
            store.current_risk(),
            Err(AdaptiveAuthError::PolicyUnavailable { .. })
        ));
        assert!(matches!(
            store.current_step_up(),
            Err(AdaptiveAuthError::PolicyUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_load_publishes_both_families() -> AdaptiveAuthResult<()> {
        let store = store_with(Arc::new(InMemoryPolicySource::combined(POLICY)));
        store.reload_all().await?;
        assert_eq!(store.current_risk()?.version, "1.0");
        assert_eq!(store.current_step_up()?.default_operation, "default");
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_reload_keeps_last_known_good() -> AdaptiveAuthResult<()> {
        let source = Arc::new(InMemoryPolicySource::combined(POLICY));
        let store = store_with(Arc::clone(&source) as Arc<dyn PolicySource>);
        store.reload_all().await?;
        let before = store.current_risk()?;

        source.set_combined(POLICY.replace("high: 0.5", "high: 0.1"));
        let err = store.load(PolicyKind::RiskScoring).await;
        assert!(matches!(err, Err(AdaptiveAuthError::PolicyLoad { .. })));
        assert!(Arc::ptr_eq(&before, &store.current_risk()?));

        source.set_combined("{ not yaml");
        assert!(store.reload_all().await.is_err());
        assert_eq!(store.current_risk()?.thresholds.high, 0.5);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_section_is_load_error() {
        let source = InMemoryPolicySource::new();
        source.set(PolicyKind::RiskScoring, "step_up: null");
        let store = store_with(Arc::new(source));
        assert!(matches!(
            store.load_risk_policy().await,
            Err(AdaptiveAuthError::PolicyLoad { .. })
        ));
    }

    #[tokio::test]
    async fn test_transient_fetch_failures_are_retried() -> AdaptiveAuthResult<()> {
        let mut source = MockPolicySource::new();
        let mut seq = mockall::Sequence::new();
        source
            .expect_fetch()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Err(AdaptiveAuthError::storage_transient("fetch", "reset")));
        source
            .expect_fetch()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(POLICY.to_string()));

        let store = store_with(Arc::new(source));
        let policy = store.load_risk_policy().await?;
        assert_eq!(policy.thresholds.level_for(0.85), RiskLevel::Critical);
        Ok(())
    }

    #[tokio::test]
    async fn test_permanent_fetch_failure_is_not_retried() {
        let mut source = MockPolicySource::new();
        source
            .expect_fetch()
            .times(1)
            .returning(|_| Err(AdaptiveAuthError::storage("fetch", "permission denied")));

        let store = store_with(Arc::new(source));
        assert!(store.load_step_up_policy().await.is_err());
    }

    #[tokio::test]
    async fn test_notification_triggers_reload() -> AdaptiveAuthResult<()> {
        let source = Arc::new(InMemoryPolicySource::combined(POLICY));
        let store = Arc::new(store_with(Arc::clone(&source) as Arc<dyn PolicySource>));
        store.reload_all().await?;

        let handle = store.spawn_hot_reload(Duration::from_secs(3600));
        source.set_combined(POLICY.replace("version: \"1.0\"", "version: \"2.0\""));
        store.notify_changed();

        let mut published = false;
        for _ in 0..100 {
            if store.current_risk()?.version == "2.0" && store.current_step_up()?.version == "2.0"
            {
                published = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.stop().await;
        assert!(published);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_triggers_reload() -> AdaptiveAuthResult<()> {
        let source = Arc::new(InMemoryPolicySource::combined(POLICY));
        let store = Arc::new(store_with(Arc::clone(&source) as Arc<dyn PolicySource>));
        store.reload_all().await?;

        let handle = store.spawn_hot_reload(Duration::from_secs(300));
        source.set_combined(POLICY.replace("version: \"1.0\"", "version: \"3.0\""));

        tokio::time::sleep(Duration::from_secs(301)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(store.current_risk()?.version, "3.0");
        handle.stop().await;
        Ok(())
    }
}
