//! `reqwest` implementation of [`AuthBackend`]

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::time::Duration;

use super::{AuthBackend, BackendResult, EmailChange, SignInOutcome};
use crate::classify::{BackendError, NETWORK_ERROR_CODE};
use crate::error::Result;
use crate::types::{
    AuthOptions, ChangeEmailOptions, MfaChallenge, PasswordlessOptions, SessionPayload,
    SignUpOptions,
};
use crate::utils::truncate_for_display;

const BODY_PREVIEW_LIMIT: usize = 256;

/// Error code used when a successful response cannot be decoded
const INVALID_RESPONSE_ERROR: &str = "invalid-response";

/// HTTP client for a Hasura Auth service
#[derive(Debug, Clone)]
pub struct HttpBackend {
    http: reqwest::Client,
    // Pre-built endpoint URLs
    url_sign_in: String,
    url_anonymous: String,
    url_mfa_totp: String,
    url_passwordless_email: String,
    url_sign_up: String,
    url_token: String,
    url_sign_out: String,
    url_change_email: String,
    url_change_password: String,
}

impl HttpBackend {
    /// Create a client for the service at `backend_url`
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Http` if the HTTP client cannot be built.
    pub fn new(backend_url: &str, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(request_timeout).build()?;
        let base = backend_url.trim_end_matches('/');

        Ok(Self {
            http,
            url_sign_in: format!("{base}/signin/email-password"),
            url_anonymous: format!("{base}/signin/anonymous"),
            url_mfa_totp: format!("{base}/signin/mfa/totp"),
            url_passwordless_email: format!("{base}/signin/passwordless/email"),
            url_sign_up: format!("{base}/signup/email-password"),
            url_token: format!("{base}/token"),
            url_sign_out: format!("{base}/signout"),
            url_change_email: format!("{base}/user/email/change"),
            url_change_password: format!("{base}/user/password"),
        })
    }

    /// Create a client from engine options
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidConfig` for unusable options, or
    /// `AuthError::Http` if the HTTP client cannot be built.
    pub fn from_options(options: &AuthOptions) -> Result<Self> {
        options.validate()?;
        Self::new(&options.backend_url, options.request_timeout)
    }

    async fn post(
        &self,
        url: &str,
        body: serde_json::Value,
        access_token: Option<&str>,
    ) -> BackendResult<String> {
        let mut request = self.http.post(url).json(&body);
        if let Some(token) = access_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(from_reqwest)?;
        let status = response.status();
        let text = response.text().await.map_err(from_reqwest)?;

        tracing::trace!(url, status = status.as_u16(), "Backend responded");
        if status.is_success() {
            Ok(text)
        } else {
            Err(error_from_body(status.as_u16(), &text))
        }
    }
}

fn from_reqwest(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::new(NETWORK_ERROR_CODE, "timeout", err.to_string())
    } else {
        BackendError::network(err.to_string())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorBody {
    Wrapped { error: BackendError },
    Bare(BackendError),
}

fn error_from_body(status: u16, body: &str) -> BackendError {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody::Wrapped { error } | ErrorBody::Bare(error)) => BackendError {
            status: if error.status == NETWORK_ERROR_CODE {
                status
            } else {
                error.status
            },
            ..error
        },
        Err(_) => BackendError::new(
            status,
            "request-failed",
            truncate_for_display(body.trim(), BODY_PREVIEW_LIMIT),
        ),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SessionBody {
    Bare(SessionPayload),
    Wrapped {
        #[serde(default)]
        session: Option<SessionPayload>,
        #[serde(default)]
        mfa: Option<MfaChallenge>,
    },
}

fn decode<T: DeserializeOwned>(body: &str) -> BackendResult<T> {
    serde_json::from_str(body).map_err(|e| {
        BackendError::new(
            500,
            INVALID_RESPONSE_ERROR,
            format!(
                "{e}: {}",
                truncate_for_display(body.trim(), BODY_PREVIEW_LIMIT)
            ),
        )
    })
}

fn decode_sign_in(body: &str) -> BackendResult<SignInOutcome> {
    if body.trim().is_empty() {
        return Ok(SignInOutcome::Unverified);
    }
    Ok(match decode::<SessionBody>(body)? {
        SessionBody::Bare(session)
        | SessionBody::Wrapped {
            session: Some(session),
            ..
        } => SignInOutcome::Session(session),
        SessionBody::Wrapped {
            session: None,
            mfa: Some(challenge),
        } => SignInOutcome::Mfa(challenge),
        SessionBody::Wrapped {
            session: None,
            mfa: None,
        } => SignInOutcome::Unverified,
    })
}

fn decode_session(body: &str) -> BackendResult<Option<SessionPayload>> {
    match decode_sign_in(body)? {
        SignInOutcome::Session(session) => Ok(Some(session)),
        SignInOutcome::Unverified => Ok(None),
        SignInOutcome::Mfa(_) => Err(BackendError::new(
            500,
            INVALID_RESPONSE_ERROR,
            "Unexpected MFA challenge",
        )),
    }
}

fn require_session(body: &str) -> BackendResult<SessionPayload> {
    decode_session(body)?
        .ok_or_else(|| BackendError::new(500, INVALID_RESPONSE_ERROR, "Response has no session"))
}

#[async_trait]
impl AuthBackend for HttpBackend {
    async fn sign_in_email_password(
        &self,
        email: &str,
        password: &str,
    ) -> BackendResult<SignInOutcome> {
        let body = self
            .post(
                &self.url_sign_in,
                json!({ "email": email, "password": password }),
                None,
            )
            .await?;
        decode_sign_in(&body)
    }

    async fn sign_in_anonymous(&self) -> BackendResult<SessionPayload> {
        let body = self.post(&self.url_anonymous, json!({}), None).await?;
        require_session(&body)
    }

    async fn sign_in_mfa_totp(&self, ticket: &str, otp: &str) -> BackendResult<SessionPayload> {
        let body = self
            .post(
                &self.url_mfa_totp,
                json!({ "ticket": ticket, "otp": otp }),
                None,
            )
            .await?;
        require_session(&body)
    }

    async fn sign_in_passwordless_email(
        &self,
        email: &str,
        options: &PasswordlessOptions,
    ) -> BackendResult<()> {
        self.post(
            &self.url_passwordless_email,
            json!({ "email": email, "options": options }),
            None,
        )
        .await?;
        Ok(())
    }

    async fn sign_up_email_password(
        &self,
        email: &str,
        password: &str,
        options: &SignUpOptions,
    ) -> BackendResult<Option<SessionPayload>> {
        let body = self
            .post(
                &self.url_sign_up,
                json!({ "email": email, "password": password, "options": options }),
                None,
            )
            .await?;
        decode_session(&body)
    }

    async fn refresh_token(&self, refresh_token: &str) -> BackendResult<SessionPayload> {
        let body = self
            .post(
                &self.url_token,
                json!({ "refreshToken": refresh_token }),
                None,
            )
            .await?;
        require_session(&body)
    }

    async fn sign_out(&self, refresh_token: &str, all: bool) -> BackendResult<()> {
        self.post(
            &self.url_sign_out,
            json!({ "refreshToken": refresh_token, "all": all }),
            None,
        )
        .await?;
        Ok(())
    }

    async fn change_email(
        &self,
        access_token: &str,
        new_email: &str,
        options: &ChangeEmailOptions,
    ) -> BackendResult<EmailChange> {
        self.post(
            &self.url_change_email,
            json!({ "newEmail": new_email, "options": options }),
            Some(access_token),
        )
        .await?;
        // the service always confirms through a link sent to the new address
        Ok(EmailChange::VerificationSent)
    }

    async fn change_password(&self, access_token: &str, new_password: &str) -> BackendResult<()> {
        self.post(
            &self.url_change_password,
            json!({ "newPassword": new_password }),
            Some(access_token),
        )
        .await?;
        Ok(())
    }
}
