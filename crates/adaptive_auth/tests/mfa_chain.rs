//! MFA chain behaviour over the in-memory session store
#![allow(clippy::unwrap_used)]

mod common;

use adaptive_auth::audit::AuditEvent;
use adaptive_auth::clock::Clock;
use adaptive_auth::error::{AdaptiveAuthError, AdaptiveAuthResult};
use adaptive_auth::mfa::SessionState;
use adaptive_auth::types::FactorType;
use common::{CodeValidator, TestBed, TOTP_CODE, USER};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_submissions_have_one_winner() -> AdaptiveAuthResult<()> {
    const SUBMISSIONS: usize = 16;
    let bed = Arc::new(TestBed::with_totp(CodeValidator::slow(TOTP_CODE, Duration::from_millis(20))).await?);
    let chain = bed.auth.mfa().start_chain(USER, vec![FactorType::Totp]).await?;
    let (session_id, factor_id) = (chain.session.id, chain.challenge.factor_id);

    let tasks: Vec<_> = (0..SUBMISSIONS)
        .map(|_| {
            let bed = Arc::clone(&bed);
            tokio::spawn(async move {
                bed.auth
                    .mfa()
                    .validate_factor(session_id, factor_id, TOTP_CODE)
                    .await
            })
        })
        .collect();

    let mut succeeded = 0;
    let mut replayed = 0;
    for task in futures::future::join_all(tasks).await {
        match task.unwrap() {
            Ok(outcome) => {
                assert!(outcome.is_complete());
                succeeded += 1;
            }
            Err(AdaptiveAuthError::ReplayAttack { .. }) => replayed += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(succeeded, 1);
    assert_eq!(replayed, SUBMISSIONS - 1);

    let session = bed.auth.mfa().session(session_id).await?;
    assert_eq!(session.state, SessionState::ChainSuccess);
    let snapshot = bed.auth.metrics().snapshot();
    assert_eq!(snapshot.replay_attempts, (SUBMISSIONS - 1) as u64);
    assert_eq!(snapshot.chains_succeeded, 1);

    let replays = bed
        .audit
        .for_session(session_id)
        .into_iter()
        .filter(|e| matches!(e.event, AuditEvent::ReplayAttempt { .. }))
        .count();
    assert_eq!(replays, SUBMISSIONS - 1);
    Ok(())
}

#[tokio::test]
async fn test_replay_after_success_is_rejected() -> AdaptiveAuthResult<()> {
    let bed = TestBed::new().await?;
    let chain = bed.auth.mfa().start_chain(USER, vec![FactorType::Totp]).await?;
    let factor_id = chain.challenge.factor_id;

    tokio_test::assert_ok!(
        bed.auth
            .mfa()
            .validate_factor(chain.session.id, factor_id, TOTP_CODE)
            .await
    );
    let replay = bed
        .auth
        .mfa()
        .validate_factor(chain.session.id, factor_id, TOTP_CODE)
        .await;

    assert!(matches!(replay, Err(AdaptiveAuthError::ReplayAttack { .. })));
    assert_eq!(bed.totp.calls(), 1);
    Ok(())
}

#[tokio::test]
async fn test_expired_nonce_fails_before_validation() -> AdaptiveAuthResult<()> {
    let bed = TestBed::new().await?;
    let chain = bed.auth.mfa().start_chain(USER, vec![FactorType::Totp]).await?;
    bed.clock.advance(Duration::from_secs(301));

    let result = bed
        .auth
        .mfa()
        .validate_factor(chain.session.id, chain.challenge.factor_id, TOTP_CODE)
        .await;

    assert!(matches!(result, Err(AdaptiveAuthError::NonceExpired { .. })));
    assert_eq!(bed.totp.calls(), 0);

    let fresh = bed
        .auth
        .mfa()
        .reissue_challenge(chain.session.id, chain.challenge.factor_id)
        .await?;
    assert_ne!(fresh.nonce, chain.challenge.nonce);
    assert!(fresh.expires_at > bed.clock.now());

    let outcome = bed
        .auth
        .mfa()
        .validate_factor(chain.session.id, fresh.factor_id, TOTP_CODE)
        .await?;
    assert!(outcome.is_complete());
    Ok(())
}

#[tokio::test]
async fn test_exhausted_attempts_lock_the_factor_type() -> AdaptiveAuthResult<()> {
    let bed = TestBed::new().await?;
    let chain = bed.auth.mfa().start_chain(USER, vec![FactorType::Totp]).await?;
    let (session_id, factor_id) = (chain.session.id, chain.challenge.factor_id);

    for remaining in (1..5).rev() {
        let result = bed.auth.mfa().validate_factor(session_id, factor_id, "000000").await;
        match result {
            Err(AdaptiveAuthError::FactorValidationFailed {
                attempts_remaining, ..
            }) => assert_eq!(attempts_remaining, remaining),
            other => panic!("expected a retryable failure, got {other:?}"),
        }
    }
    let fifth = bed.auth.mfa().validate_factor(session_id, factor_id, "000000").await;
    assert!(matches!(fifth, Err(AdaptiveAuthError::Lockout { .. })));

    let session = bed.auth.mfa().session(session_id).await?;
    assert_eq!(session.state, SessionState::SessionInvalidated);
    assert_eq!(session.failed_factor, Some(factor_id));

    // Locked even with the right code
    let retry = bed.auth.mfa().validate_factor(session_id, factor_id, TOTP_CODE).await;
    assert!(matches!(retry, Err(AdaptiveAuthError::Lockout { .. })));
    let restart = bed.auth.mfa().start_chain(USER, vec![FactorType::Totp]).await;
    assert!(matches!(restart, Err(AdaptiveAuthError::Lockout { .. })));

    let events: Vec<_> = bed.audit.for_session(session_id).into_iter().map(|e| e.event).collect();
    assert!(events
        .iter()
        .any(|e| matches!(e, AuditEvent::LockoutTriggered { factor_type: FactorType::Totp, .. })));
    assert!(events.iter().any(|e| matches!(e, AuditEvent::PartialCompletion { .. })));
    assert_eq!(bed.auth.metrics().snapshot().lockouts, 1);

    bed.clock.advance(Duration::from_secs(901));
    let restarted = bed.auth.mfa().start_chain(USER, vec![FactorType::Totp]).await?;
    assert_eq!(restarted.session.state, SessionState::FactorPending);
    Ok(())
}

#[tokio::test]
async fn test_cancelled_chain_rejects_credentials() -> AdaptiveAuthResult<()> {
    let bed = TestBed::new().await?;
    let chain = bed.auth.mfa().start_chain(USER, vec![FactorType::Totp]).await?;

    let cancelled = bed.auth.mfa().cancel_chain(chain.session.id).await?;
    assert_eq!(cancelled.state, SessionState::SessionInvalidated);
    assert!(bed.auth.mfa().current_challenge(chain.session.id).await?.is_none());

    let result = bed
        .auth
        .mfa()
        .validate_factor(chain.session.id, chain.challenge.factor_id, TOTP_CODE)
        .await;
    assert!(matches!(result, Err(AdaptiveAuthError::SessionTerminated { .. })));
    assert_eq!(bed.totp.calls(), 0);
    Ok(())
}
