//! Network contract consumed from the Hasura Auth service
//!
//! [`AuthBackend`] is the seam between the machine and the network. The
//! client actor calls it from spawned tasks and feeds the results back to
//! the machine as completions. [`HttpBackend`] talks to a real service;
//! tests substitute a scripted implementation.

pub mod http;

use async_trait::async_trait;
use std::sync::Arc;

pub use http::HttpBackend;

use crate::classify::BackendError;
use crate::types::{
    ChangeEmailOptions, MfaChallenge, PasswordlessOptions, SessionPayload, SignUpOptions,
};

/// Result of a backend call
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Outcome of an email and password sign-in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignInOutcome {
    /// A session was issued
    Session(SessionPayload),
    /// The password was accepted; a TOTP code must follow
    Mfa(MfaChallenge),
    /// Accepted without a session, the email is not verified yet
    Unverified,
}

/// Outcome of an email change request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailChange {
    /// The new address is active
    Changed,
    /// A confirmation link was sent to the new address
    VerificationSent,
}

/// Hasura Auth endpoints used by the session engine
#[async_trait]
pub trait AuthBackend: Send + Sync {
    /// `POST /signin/email-password`
    async fn sign_in_email_password(
        &self,
        email: &str,
        password: &str,
    ) -> BackendResult<SignInOutcome>;

    /// `POST /signin/anonymous`
    async fn sign_in_anonymous(&self) -> BackendResult<SessionPayload>;

    /// `POST /signin/mfa/totp`
    async fn sign_in_mfa_totp(&self, ticket: &str, otp: &str) -> BackendResult<SessionPayload>;

    /// `POST /signin/passwordless/email`
    async fn sign_in_passwordless_email(
        &self,
        email: &str,
        options: &PasswordlessOptions,
    ) -> BackendResult<()>;

    /// `POST /signup/email-password`
    ///
    /// `None` means the account was created but must be verified first.
    async fn sign_up_email_password(
        &self,
        email: &str,
        password: &str,
        options: &SignUpOptions,
    ) -> BackendResult<Option<SessionPayload>>;

    /// `POST /token`; must be safe to retry
    async fn refresh_token(&self, refresh_token: &str) -> BackendResult<SessionPayload>;

    /// `POST /signout`
    async fn sign_out(&self, refresh_token: &str, all: bool) -> BackendResult<()>;

    /// `POST /user/email/change`
    async fn change_email(
        &self,
        access_token: &str,
        new_email: &str,
        options: &ChangeEmailOptions,
    ) -> BackendResult<EmailChange>;

    /// `POST /user/password`
    async fn change_password(&self, access_token: &str, new_password: &str) -> BackendResult<()>;
}

#[async_trait]
impl<B: AuthBackend + ?Sized> AuthBackend for Arc<B> {
    async fn sign_in_email_password(
        &self,
        email: &str,
        password: &str,
    ) -> BackendResult<SignInOutcome> {
        (**self).sign_in_email_password(email, password).await
    }

    async fn sign_in_anonymous(&self) -> BackendResult<SessionPayload> {
        (**self).sign_in_anonymous().await
    }

    async fn sign_in_mfa_totp(&self, ticket: &str, otp: &str) -> BackendResult<SessionPayload> {
        (**self).sign_in_mfa_totp(ticket, otp).await
    }

    async fn sign_in_passwordless_email(
        &self,
        email: &str,
        options: &PasswordlessOptions,
    ) -> BackendResult<()> {
        (**self).sign_in_passwordless_email(email, options).await
    }

    async fn sign_up_email_password(
        &self,
        email: &str,
        password: &str,
        options: &SignUpOptions,
    ) -> BackendResult<Option<SessionPayload>> {
        (**self).sign_up_email_password(email, password, options).await
    }

    async fn refresh_token(&self, refresh_token: &str) -> BackendResult<SessionPayload> {
        (**self).refresh_token(refresh_token).await
    }

    async fn sign_out(&self, refresh_token: &str, all: bool) -> BackendResult<()> {
        (**self).sign_out(refresh_token, all).await
    }

    async fn change_email(
        &self,
        access_token: &str,
        new_email: &str,
        options: &ChangeEmailOptions,
    ) -> BackendResult<EmailChange> {
        (**self).change_email(access_token, new_email, options).await
    }

    async fn change_password(&self, access_token: &str, new_password: &str) -> BackendResult<()> {
        (**self).change_password(access_token, new_password).await
    }
}
