//! Scripted backend shared by the integration suites

#![allow(dead_code)]

use async_trait::async_trait;
use hasura_auth_session::backend::BackendResult;
use hasura_auth_session::{
    AuthBackend, AuthOptions, BackendError, ChangeEmailOptions, EmailChange, MfaChallenge,
    PasswordlessOptions, RefreshTokenId, SessionPayload, SignInOutcome, SignUpOptions, User,
    UserId,
};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

/// Backend answering from per-endpoint scripts, recording every call
///
/// An empty sign-in script accepts any credentials; an empty refresh script
/// issues a fresh session each time.
#[derive(Default)]
pub struct ScriptedBackend {
    pub sign_in: Mutex<VecDeque<BackendResult<SignInOutcome>>>,
    pub refresh: Mutex<VecDeque<BackendResult<SessionPayload>>>,
    pub sign_in_latency: Duration,
    pub refresh_latency: Duration,
    pub sign_out_latency: Duration,
    totp: Mutex<Vec<(String, String)>>,
    calls: Mutex<Vec<&'static str>>,
    revoked: Mutex<Vec<(String, bool)>>,
    issued: Mutex<u32>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sign_in_latency(mut self, latency: Duration) -> Self {
        self.sign_in_latency = latency;
        self
    }

    pub fn with_refresh_latency(mut self, latency: Duration) -> Self {
        self.refresh_latency = latency;
        self
    }

    pub fn with_sign_out_latency(mut self, latency: Duration) -> Self {
        self.sign_out_latency = latency;
        self
    }

    pub fn script_refresh(&self, result: BackendResult<SessionPayload>) {
        self.refresh.lock().unwrap().push_back(result);
    }

    pub fn script_sign_in(&self, result: BackendResult<SignInOutcome>) {
        self.sign_in.lock().unwrap().push_back(result);
    }

    pub fn script_mfa(&self, ticket: &str) {
        self.script_sign_in(Ok(SignInOutcome::Mfa(MfaChallenge {
            ticket: ticket.to_string(),
        })));
    }

    /// Every `(ticket, otp)` pair sent to the TOTP endpoint
    pub fn totp_attempts(&self) -> Vec<(String, String)> {
        self.totp.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, endpoint: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| **call == endpoint)
            .count()
    }

    pub fn revoked(&self) -> Vec<(String, bool)> {
        self.revoked.lock().unwrap().clone()
    }

    fn record(&self, endpoint: &'static str) {
        self.calls.lock().unwrap().push(endpoint);
    }

    fn issue(&self) -> SessionPayload {
        let mut issued = self.issued.lock().unwrap();
        *issued += 1;
        let n = *issued;
        session_payload(&format!("access-{n}"), &format!("refresh-{n}"), 3600)
    }
}

#[async_trait]
impl AuthBackend for ScriptedBackend {
    async fn sign_in_email_password(
        &self,
        _email: &str,
        _password: &str,
    ) -> BackendResult<SignInOutcome> {
        self.record("sign_in");
        tokio::time::sleep(self.sign_in_latency).await;
        let scripted = self.sign_in.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(SignInOutcome::Session(self.issue())))
    }

    async fn sign_in_anonymous(&self) -> BackendResult<SessionPayload> {
        self.record("anonymous");
        let mut session = self.issue();
        session.user.is_anonymous = true;
        session.user.email = None;
        Ok(session)
    }

    async fn sign_in_mfa_totp(&self, ticket: &str, otp: &str) -> BackendResult<SessionPayload> {
        self.record("mfa_totp");
        self.totp
            .lock()
            .unwrap()
            .push((ticket.to_string(), otp.to_string()));
        if otp != "123456" {
            return Err(BackendError::new(401, "invalid-otp", "Invalid or expired OTP"));
        }
        Ok(self.issue())
    }

    async fn sign_in_passwordless_email(
        &self,
        _email: &str,
        _options: &PasswordlessOptions,
    ) -> BackendResult<()> {
        self.record("passwordless");
        Ok(())
    }

    async fn sign_up_email_password(
        &self,
        _email: &str,
        _password: &str,
        _options: &SignUpOptions,
    ) -> BackendResult<Option<SessionPayload>> {
        self.record("sign_up");
        Ok(Some(self.issue()))
    }

    async fn refresh_token(&self, _refresh_token: &str) -> BackendResult<SessionPayload> {
        self.record("refresh");
        tokio::time::sleep(self.refresh_latency).await;
        let scripted = self.refresh.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| Ok(self.issue()))
    }

    async fn sign_out(&self, refresh_token: &str, all: bool) -> BackendResult<()> {
        self.record("sign_out");
        tokio::time::sleep(self.sign_out_latency).await;
        self.revoked
            .lock()
            .unwrap()
            .push((refresh_token.to_string(), all));
        Ok(())
    }

    async fn change_email(
        &self,
        _access_token: &str,
        _new_email: &str,
        _options: &ChangeEmailOptions,
    ) -> BackendResult<EmailChange> {
        self.record("change_email");
        Ok(EmailChange::VerificationSent)
    }

    async fn change_password(&self, _access_token: &str, new_password: &str) -> BackendResult<()> {
        self.record("change_password");
        if new_password == "password" {
            return Err(BackendError::new(
                400,
                "password-in-hibp-database",
                "Password is in HIBP database",
            ));
        }
        Ok(())
    }
}

pub fn session_payload(access_token: &str, refresh_token: &str, expires_in: u64) -> SessionPayload {
    SessionPayload {
        access_token: access_token.to_string(),
        access_token_expires_in: expires_in,
        refresh_token: refresh_token.to_string(),
        refresh_token_id: RefreshTokenId::new("rt-1"),
        user: User {
            id: UserId::new("user-1"),
            email: Some("jane@example.com".to_string()),
            display_name: "Jane".to_string(),
            default_role: "user".to_string(),
            roles: ["user".to_string(), "me".to_string()].into_iter().collect(),
            ..Default::default()
        },
    }
}

pub fn options() -> AuthOptions {
    AuthOptions::builder()
        .backend_url("http://localhost:4000/v1")
        .build()
}

/// Route engine logs to the test harness; set `RUST_LOG` to see them
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
