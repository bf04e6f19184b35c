//! End-to-end session lifecycle through the client actor
//!
//! Time is paused in these tests: tokio advances the clock whenever every
//! task is idle, so hour-long token lifetimes run instantly.

mod common;

use common::{ScriptedBackend, init_tracing, options, session_payload};
use hasura_auth_session::machine::{ChangeOutcome, ChangeState, Failure, SignedOutState};
use hasura_auth_session::{
    AuthClient, AuthEvent, AuthState, BackendError, ChangeEmailOptions, ErrorCategory,
    FilePersistence, MemoryPersistence, PersistedSessionRecord, PersistenceAdapter,
};
use std::sync::Arc;
use std::time::Duration;

fn record(access_token: &str, refresh_token: &str, expires_in: u64) -> PersistedSessionRecord {
    let payload = session_payload(access_token, refresh_token, expires_in);
    PersistedSessionRecord {
        access_token: payload.access_token,
        access_token_expires_in: payload.access_token_expires_in,
        refresh_token: payload.refresh_token,
        refresh_token_id: payload.refresh_token_id.to_string(),
        user: payload.user,
        saved_at: None,
    }
}

fn client_with(
    backend: &Arc<ScriptedBackend>,
    persistence: &Arc<MemoryPersistence>,
) -> anyhow::Result<AuthClient> {
    init_tracing();
    Ok(AuthClient::builder(options())
        .backend(backend.clone())
        .persistence(persistence.clone())
        .build()?)
}

// ============================================================================
// Resume and refresh
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_resumed_session_refreshes_before_expiry() -> anyhow::Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    let persistence = Arc::new(MemoryPersistence::with_record(record(
        "access-0",
        "refresh-0",
        3600,
    )));
    let client = client_with(&backend, &persistence)?;

    let snapshot = client.wait_until_ready().await?;
    assert!(snapshot.state.matches("signedIn.refreshTimer.running.pending"));
    assert_eq!(client.access_token().as_deref(), Some("access-0"));

    // armed for 3600 - 60 seconds
    tokio::time::sleep(Duration::from_secs(3539)).await;
    assert_eq!(backend.count("refresh"), 0);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(backend.count("refresh"), 1);

    let snapshot = client.snapshot();
    assert_eq!(client.access_token().as_deref(), Some("access-1"));
    assert!(snapshot.state.matches("signedIn.refreshTimer.running.pending"));
    assert!(snapshot.context.armed_timer.is_some());
    assert_eq!(
        persistence.snapshot().map(|record| record.access_token),
        Some("access-1".to_string())
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_refresh_gives_up_after_repeated_network_failures() -> anyhow::Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    for _ in 0..3 {
        backend.script_refresh(Err(BackendError::network("connection refused")));
    }
    let persistence = Arc::new(MemoryPersistence::with_record(record(
        "access-0",
        "refresh-0",
        3600,
    )));
    let client = client_with(&backend, &persistence)?;
    client.wait_until_ready().await?;

    // first attempt at 3540s, retries 5s and 10s later
    tokio::time::sleep(Duration::from_secs(3600)).await;

    let snapshot = client.snapshot();
    assert_eq!(
        snapshot.state,
        AuthState::SignedOut(SignedOutState::Failed(Failure::Server))
    );
    assert!(snapshot.session().is_none());
    assert_eq!(
        snapshot.context.error.as_ref().map(|error| error.category),
        Some(ErrorCategory::Network)
    );
    assert_eq!(backend.count("refresh"), 3);
    assert!(persistence.snapshot().is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_rejected_refresh_signs_out_immediately() -> anyhow::Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    backend.script_refresh(Err(BackendError::new(
        401,
        "invalid-refresh-token",
        "Invalid or expired refresh token",
    )));
    let persistence = Arc::new(MemoryPersistence::with_record(record(
        "access-0",
        "refresh-0",
        3600,
    )));
    let client = client_with(&backend, &persistence)?;
    client.wait_until_ready().await?;

    let snapshot = client.refresh_session().await?;
    assert!(snapshot.state.matches("signedOut.failed.server"));
    assert_eq!(backend.count("refresh"), 1);
    assert!(persistence.snapshot().is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_expired_record_imports_refresh_token() -> anyhow::Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    backend.script_refresh(Err(BackendError::network("connection reset")));
    let persistence = Arc::new(MemoryPersistence::with_record(record(
        "access-0",
        "refresh-0",
        0,
    )));
    let client = client_with(&backend, &persistence)?;

    // the first import fails and is retried after the backoff
    let snapshot = client.wait_until_ready().await?;
    assert!(snapshot.is_authenticated());
    assert_eq!(backend.count("refresh"), 2);
    assert_eq!(client.access_token().as_deref(), Some("access-1"));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_revoked_refresh_token_at_start_signs_out_silently() -> anyhow::Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    backend.script_refresh(Err(BackendError::new(
        401,
        "invalid-refresh-token",
        "Invalid or expired refresh token",
    )));
    let persistence = Arc::new(MemoryPersistence::with_record(record(
        "access-0",
        "refresh-0",
        0,
    )));
    let client = client_with(&backend, &persistence)?;

    let snapshot = client.wait_until_ready().await?;
    assert_eq!(
        snapshot.state,
        AuthState::SignedOut(SignedOutState::NoErrors)
    );
    assert!(snapshot.context.error.is_none());
    assert!(persistence.snapshot().is_none());
    Ok(())
}

// ============================================================================
// Interactive flows
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_malformed_email_never_reaches_backend() -> anyhow::Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    let persistence = Arc::new(MemoryPersistence::new());
    let client = client_with(&backend, &persistence)?;
    client.wait_until_ready().await?;

    let snapshot = client
        .send(AuthEvent::SignInPassword {
            email: "bad-email".to_string(),
            password: "x".to_string(),
        })
        .await?;
    assert!(snapshot.state.matches("signedOut.failed.validation.email"));
    assert!(backend.calls().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_wrong_credentials_surface_server_error() -> anyhow::Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    backend.script_sign_in(Err(BackendError::new(
        401,
        "invalid-email-password",
        "Incorrect email or password",
    )));
    let persistence = Arc::new(MemoryPersistence::new());
    let client = client_with(&backend, &persistence)?;
    client.wait_until_ready().await?;

    let snapshot = client
        .sign_in_email_password("jane@example.com", "wrong-password")
        .await?;
    assert!(snapshot.state.matches("signedOut.failed.server"));
    let error = snapshot.context.error.expect("error recorded");
    assert_eq!(error.payload.error, "invalid-email-password");

    // the user retries with the right password
    let snapshot = client
        .sign_in_email_password("jane@example.com", "right-password")
        .await?;
    assert!(snapshot.is_authenticated());
    assert!(snapshot.context.error.is_none());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_unverified_user_needs_verification() -> anyhow::Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    backend.script_sign_in(Err(BackendError::new(
        401,
        "unverified-user",
        "Email is not verified",
    )));
    let persistence = Arc::new(MemoryPersistence::new());
    let client = client_with(&backend, &persistence)?;
    client.wait_until_ready().await?;

    let snapshot = client
        .sign_in_email_password("jane@example.com", "secret")
        .await?;
    assert_eq!(
        snapshot.state,
        AuthState::SignedOut(SignedOutState::NeedsVerification)
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_gate_waiters_share_the_new_token() -> anyhow::Result<()> {
    let backend = Arc::new(ScriptedBackend::new().with_sign_in_latency(Duration::from_secs(2)));
    let persistence = Arc::new(MemoryPersistence::new());
    let client = client_with(&backend, &persistence)?;
    client.wait_until_ready().await?;

    let snapshot = client
        .send(AuthEvent::SignInPassword {
            email: "jane@example.com".to_string(),
            password: "secret".to_string(),
        })
        .await?;
    assert!(snapshot.state.matches("authenticating.password"));

    let gate = client.token_gate();
    let waiters: Vec<_> = (0..3)
        .map(|_| {
            let gate = gate.clone();
            tokio::spawn(async move { gate.get_valid_access_token().await })
        })
        .collect();

    for token in futures::future::join_all(waiters).await {
        assert_eq!(token?.as_deref(), Some("access-1"));
    }
    assert_eq!(backend.count("sign_in"), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_gate_refreshes_expired_session_on_demand() -> anyhow::Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    let persistence = Arc::new(MemoryPersistence::new());
    let client = client_with(&backend, &persistence)?;
    client.wait_until_ready().await?;

    let snapshot = client
        .set_session(session_payload("access-0", "refresh-0", 0))
        .await?;
    assert!(snapshot.state.matches("signedIn.refreshTimer.idle"));

    let token = client.token_gate().get_valid_access_token().await;
    assert_eq!(token.as_deref(), Some("access-1"));
    assert_eq!(backend.count("refresh"), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_signed_out_gate_resolves_none() -> anyhow::Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    let persistence = Arc::new(MemoryPersistence::new());
    let client = client_with(&backend, &persistence)?;

    assert_eq!(client.token_gate().get_valid_access_token().await, None);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_change_email_and_password() -> anyhow::Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    let persistence = Arc::new(MemoryPersistence::new());
    let client = client_with(&backend, &persistence)?;
    client.wait_until_ready().await?;
    client
        .sign_in_email_password("jane@example.com", "secret")
        .await?;

    let snapshot = client
        .change_email("jane@new.example.com", ChangeEmailOptions::default())
        .await?;
    assert!(snapshot.state.matches("signedIn.changeEmail.idle.needsVerification"));

    let snapshot = client.change_password("password").await?;
    let regions = snapshot.state.signed_in().copied().expect("signed in");
    assert_eq!(
        regions.change_password,
        ChangeState::Idle(ChangeOutcome::FailedValidation)
    );

    let snapshot = client.change_password("s3cure-passphrase").await?;
    assert!(snapshot.state.matches("signedIn.changePassword.idle.success"));
    assert!(snapshot.is_authenticated());
    Ok(())
}

// ============================================================================
// Second factor, anonymous users and token import
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_mfa_ticket_is_answered_with_totp() -> anyhow::Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    backend.script_mfa("mfaTotp:ticket-1");
    let persistence = Arc::new(MemoryPersistence::new());
    let client = client_with(&backend, &persistence)?;
    client.wait_until_ready().await?;

    let snapshot = client
        .sign_in_email_password("jane@example.com", "secret")
        .await?;
    assert_eq!(snapshot.state, AuthState::SignedOut(SignedOutState::NeedsMfa));
    assert_eq!(
        snapshot.context.mfa.map(|mfa| mfa.ticket).as_deref(),
        Some("mfaTotp:ticket-1")
    );
    assert!(persistence.snapshot().is_none());

    // a wrong code keeps the ticket for another try
    let snapshot = client.sign_in_mfa_totp("000000", None).await?;
    assert!(snapshot.state.matches("signedOut.failed.server"));
    assert!(snapshot.context.mfa.is_some());

    let snapshot = client.sign_in_mfa_totp("123456", None).await?;
    assert!(snapshot.is_authenticated());
    assert!(snapshot.context.mfa.is_none());
    assert!(persistence.snapshot().is_some());
    assert_eq!(
        backend.totp_attempts(),
        vec![
            ("mfaTotp:ticket-1".to_string(), "000000".to_string()),
            ("mfaTotp:ticket-1".to_string(), "123456".to_string()),
        ]
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_totp_without_ticket_never_reaches_backend() -> anyhow::Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    let persistence = Arc::new(MemoryPersistence::new());
    let client = client_with(&backend, &persistence)?;
    client.wait_until_ready().await?;

    let snapshot = client.sign_in_mfa_totp("123456", None).await?;
    assert!(snapshot.state.matches("signedOut.failed.validation"));
    let error = snapshot.context.error.expect("error recorded");
    assert_eq!(error.category, ErrorCategory::Validation);
    assert_eq!(error.payload.error, "no-mfa-ticket");
    assert!(backend.calls().is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_anonymous_sign_in_persists_session() -> anyhow::Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    let persistence = Arc::new(MemoryPersistence::new());
    let client = client_with(&backend, &persistence)?;
    client.wait_until_ready().await?;

    let snapshot = client.sign_in_anonymous().await?;
    assert!(snapshot.state.matches("signedIn.refreshTimer.running.pending"));
    assert!(client.user().is_some_and(|user| user.is_anonymous));
    assert!(persistence.snapshot().is_some());
    assert_eq!(backend.calls(), vec!["anonymous"]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_import_while_signed_in_replaces_or_keeps_session() -> anyhow::Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    let persistence = Arc::new(MemoryPersistence::new());
    let client = client_with(&backend, &persistence)?;
    client.wait_until_ready().await?;
    client
        .sign_in_email_password("jane@example.com", "secret")
        .await?;
    assert_eq!(client.access_token().as_deref(), Some("access-1"));

    let snapshot = client.import_refresh_token("refresh-from-link").await?;
    assert!(snapshot.is_authenticated());
    assert_eq!(client.access_token().as_deref(), Some("access-2"));
    assert_eq!(
        persistence.snapshot().map(|record| record.refresh_token),
        Some("refresh-2".to_string())
    );

    backend.script_refresh(Err(BackendError::new(
        401,
        "invalid-refresh-token",
        "Invalid or expired refresh token",
    )));
    let snapshot = client.import_refresh_token("revoked").await?;
    assert!(snapshot.is_authenticated());
    assert_eq!(client.access_token().as_deref(), Some("access-2"));
    let error = snapshot.context.token_error.expect("token error recorded");
    assert_eq!(error.payload.error, "invalid-refresh-token");
    assert!(snapshot.context.error.is_none());
    assert_eq!(backend.count("refresh"), 2);
    Ok(())
}

// ============================================================================
// Sign-out
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_sign_out_twice_is_a_no_op() -> anyhow::Result<()> {
    let backend = Arc::new(ScriptedBackend::new());
    let persistence = Arc::new(MemoryPersistence::new());
    let client = client_with(&backend, &persistence)?;
    client.wait_until_ready().await?;
    client
        .sign_in_email_password("jane@example.com", "secret")
        .await?;
    assert!(persistence.snapshot().is_some());

    let first = client.sign_out(true).await?;
    let second = client.sign_out(true).await?;
    assert_eq!(first.state, AuthState::SignedOut(SignedOutState::NoErrors));
    assert_eq!(second, first);
    assert!(persistence.snapshot().is_none());

    // revocation runs in the background
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(backend.revoked(), vec![("refresh-1".to_string(), true)]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_sign_out_during_refresh_ignores_late_completion() -> anyhow::Result<()> {
    let backend = Arc::new(ScriptedBackend::new().with_refresh_latency(Duration::from_secs(10)));
    let persistence = Arc::new(MemoryPersistence::with_record(record(
        "access-0",
        "refresh-0",
        3600,
    )));
    let client = client_with(&backend, &persistence)?;
    client.wait_until_ready().await?;

    let snapshot = client.send(AuthEvent::RefreshSession).await?;
    assert!(snapshot.state.matches("signedIn.refreshTimer.running.refreshing"));

    let snapshot = client.sign_out(false).await?;
    assert_eq!(snapshot.state, AuthState::SignedOut(SignedOutState::NoErrors));

    tokio::time::sleep(Duration::from_secs(20)).await;
    let snapshot = client.snapshot();
    assert_eq!(snapshot.state, AuthState::SignedOut(SignedOutState::NoErrors));
    assert!(snapshot.session().is_none());
    assert!(persistence.snapshot().is_none());
    assert_eq!(backend.count("refresh"), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_waits_for_revocation() -> anyhow::Result<()> {
    let backend = Arc::new(ScriptedBackend::new().with_sign_out_latency(Duration::from_secs(5)));
    let persistence = Arc::new(MemoryPersistence::new());
    let client = client_with(&backend, &persistence)?;
    client.wait_until_ready().await?;
    client
        .sign_in_email_password("jane@example.com", "secret")
        .await?;

    client.sign_out(false).await?;
    assert!(backend.revoked().is_empty());

    client.shutdown().await;
    assert_eq!(backend.revoked(), vec![("refresh-1".to_string(), false)]);
    assert!(client.is_disposed());
    Ok(())
}

// ============================================================================
// File persistence
// ============================================================================

#[tokio::test]
async fn test_file_persistence_survives_restart() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("session.json");
    let backend = Arc::new(ScriptedBackend::new());

    let first = AuthClient::builder(options())
        .backend(backend.clone())
        .persistence(FilePersistence::with_path(&path))
        .build()?;
    first.wait_until_ready().await?;
    first
        .sign_in_email_password("jane@example.com", "secret")
        .await?;
    first.dispose();
    assert!(path.exists());

    let second = AuthClient::builder(options())
        .backend(backend.clone())
        .persistence(FilePersistence::with_path(&path))
        .build()?;
    let snapshot = second.wait_until_ready().await?;
    assert!(snapshot.is_authenticated());
    assert_eq!(second.access_token().as_deref(), Some("access-1"));
    assert_eq!(backend.count("refresh"), 0);

    second.sign_out(false).await?;
    assert!(FilePersistence::with_path(&path).load().await?.is_none());
    Ok(())
}
