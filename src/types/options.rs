//! Configuration types for the session engine

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use typed_builder::TypedBuilder;

use crate::error::{AuthError, Result};

/// Default buffer subtracted from the token lifetime before refreshing
pub const DEFAULT_REFRESH_SAFETY_MARGIN: Duration = Duration::from_secs(60);
/// Default number of consecutive network failures tolerated by the refresh timer
pub const DEFAULT_MAX_REFRESH_ATTEMPTS: u32 = 3;
/// Default base of the exponential retry backoff
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_secs(5);
/// Default margin the token gate keeps before handing out a token
pub const DEFAULT_TOKEN_VALIDITY_MARGIN: Duration = Duration::from_secs(5);
/// Default timeout for a single backend request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// Default timeout for a single listener invocation
pub const DEFAULT_LISTENER_TIMEOUT: Duration = Duration::from_secs(60);

// ============================================================================
// Engine Options
// ============================================================================

/// Options for an [`AuthClient`](crate::AuthClient)
///
/// # Example
///
/// ```
/// use hasura_auth_session::AuthOptions;
/// use std::time::Duration;
///
/// let options = AuthOptions::builder()
///     .backend_url("https://auth.example.com/v1")
///     .client_url("https://app.example.com")
///     .refresh_safety_margin(Duration::from_secs(120))
///     .build();
/// assert!(options.auto_refresh_token);
/// ```
#[allow(clippy::struct_excessive_bools)]
#[derive(Debug, Clone, TypedBuilder)]
#[builder(
    builder_method(doc = "Create a new builder for AuthOptions"),
    builder_type(doc = "Builder for AuthOptions", vis = "pub"),
    build_method(doc = "Build the AuthOptions")
)]
pub struct AuthOptions {
    /// Base URL of the Hasura Auth service
    #[builder(setter(into))]
    pub backend_url: String,

    /// Base URL of the application, used to rewrite relative `redirectTo` values
    #[builder(default, setter(strip_option, into))]
    pub client_url: Option<String>,

    /// Whether the access token is refreshed automatically before it expires
    #[builder(default = true)]
    pub auto_refresh_token: bool,

    /// Whether the persisted session is resumed at start-up
    #[builder(default = true)]
    pub auto_sign_in: bool,

    /// Refresh token imported at start-up, taking precedence over persistence
    #[builder(default, setter(strip_option, into))]
    pub initial_refresh_token: Option<String>,

    /// Buffer subtracted from the access-token lifetime when arming the timer
    #[builder(default = DEFAULT_REFRESH_SAFETY_MARGIN)]
    pub refresh_safety_margin: Duration,

    /// Fixed interval that caps the refresh delay, regardless of token lifetime
    #[builder(default, setter(strip_option))]
    pub refresh_interval: Option<Duration>,

    /// Consecutive network failures before the refresh timer gives up
    #[builder(default = DEFAULT_MAX_REFRESH_ATTEMPTS)]
    pub max_refresh_attempts: u32,

    /// Base delay of the exponential retry backoff
    #[builder(default = DEFAULT_RETRY_BASE_DELAY)]
    pub retry_base_delay: Duration,

    /// Margin the token gate keeps before considering a token expired
    #[builder(default = DEFAULT_TOKEN_VALIDITY_MARGIN)]
    pub token_validity_margin: Duration,

    /// Timeout for a single backend request
    #[builder(default = DEFAULT_REQUEST_TIMEOUT)]
    pub request_timeout: Duration,

    /// Timeout for a single listener invocation
    #[builder(default = DEFAULT_LISTENER_TIMEOUT)]
    pub listener_timeout: Duration,
}

impl AuthOptions {
    /// Check the options for values the engine cannot work with
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidConfig` if the backend URL is empty or not
    /// HTTP(S), or if no refresh attempt would ever be made.
    pub fn validate(&self) -> Result<()> {
        let url = self.backend_url.trim();
        if url.is_empty() {
            return Err(AuthError::invalid_config("backend_url must not be empty"));
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(AuthError::invalid_config(format!(
                "backend_url must be an http(s) URL, got '{url}'"
            )));
        }
        if self.max_refresh_attempts == 0 {
            return Err(AuthError::invalid_config(
                "max_refresh_attempts must be at least 1",
            ));
        }
        Ok(())
    }

    /// Rewrite a relative `redirectTo` against `client_url`
    #[must_use]
    pub fn rewrite_redirect_to(&self, redirect_to: Option<&str>) -> Option<String> {
        rewrite_redirect_to(self.client_url.as_deref(), redirect_to)
    }
}

/// Prefix a relative (`/path`) redirect with the client URL
///
/// Absolute redirects, and any redirect when no client URL is configured,
/// pass through unchanged.
///
/// ```
/// use hasura_auth_session::types::rewrite_redirect_to;
///
/// assert_eq!(
///     rewrite_redirect_to(Some("https://app.example.com/"), Some("/verified")).as_deref(),
///     Some("https://app.example.com/verified")
/// );
/// assert_eq!(
///     rewrite_redirect_to(Some("https://app.example.com"), Some("https://other.example.com")).as_deref(),
///     Some("https://other.example.com")
/// );
/// ```
#[must_use]
pub fn rewrite_redirect_to(client_url: Option<&str>, redirect_to: Option<&str>) -> Option<String> {
    let redirect_to = redirect_to?;
    match client_url {
        Some(base) if redirect_to.starts_with('/') => {
            Some(format!("{}{redirect_to}", base.trim_end_matches('/')))
        }
        _ => Some(redirect_to.to_string()),
    }
}

// ============================================================================
// Per-Flow Options
// ============================================================================

/// Options sent along with a sign-up request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignUpOptions {
    /// Roles the new user may assume
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_roles: Option<Vec<String>>,
    /// Role used by default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_role: Option<String>,
    /// Display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Preferred locale
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    /// Custom user metadata
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
    /// Where the verification link should land
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_to: Option<String>,
}

impl SignUpOptions {
    /// Same options with a relative `redirect_to` made absolute
    #[must_use]
    pub fn with_client_url(mut self, client_url: Option<&str>) -> Self {
        self.redirect_to = rewrite_redirect_to(client_url, self.redirect_to.as_deref());
        self
    }
}

/// Options sent along with a passwordless (magic link) request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordlessOptions {
    /// Roles a newly created user may assume
    #[serde(skip_serializing_if = "Option::is_none")]
    pub allowed_roles: Option<Vec<String>>,
    /// Role used by default for a newly created user
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_role: Option<String>,
    /// Display name for a newly created user
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// Preferred locale
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    /// Where the magic link should land
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_to: Option<String>,
}

impl PasswordlessOptions {
    /// Same options with a relative `redirect_to` made absolute
    #[must_use]
    pub fn with_client_url(mut self, client_url: Option<&str>) -> Self {
        self.redirect_to = rewrite_redirect_to(client_url, self.redirect_to.as_deref());
        self
    }
}

/// Options sent along with an email change request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEmailOptions {
    /// Where the confirmation link should land
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redirect_to: Option<String>,
}

impl ChangeEmailOptions {
    /// Same options with a relative `redirect_to` made absolute
    #[must_use]
    pub fn with_client_url(mut self, client_url: Option<&str>) -> Self {
        self.redirect_to = rewrite_redirect_to(client_url, self.redirect_to.as_deref());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let options = AuthOptions::builder()
            .backend_url("http://localhost:4000")
            .build();
        assert!(options.auto_refresh_token);
        assert!(options.auto_sign_in);
        assert_eq!(options.refresh_safety_margin, Duration::from_secs(60));
        assert_eq!(options.max_refresh_attempts, 3);
        assert_eq!(options.retry_base_delay, Duration::from_secs(5));
        assert!(options.refresh_interval.is_none());
        assert!(options.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_url() {
        let options = AuthOptions::builder().backend_url("  ").build();
        assert!(matches!(
            options.validate(),
            Err(AuthError::InvalidConfig(_))
        ));

        let options = AuthOptions::builder().backend_url("ftp://auth").build();
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let options = AuthOptions::builder()
            .backend_url("https://auth.example.com")
            .max_refresh_attempts(0)
            .build();
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_rewrite_redirect_to() {
        assert_eq!(rewrite_redirect_to(None, Some("/welcome")).as_deref(), Some("/welcome"));
        assert_eq!(rewrite_redirect_to(Some("https://app.io"), None), None);

        let options = SignUpOptions {
            redirect_to: Some("/verify".to_string()),
            ..Default::default()
        }
        .with_client_url(Some("https://app.io/"));
        assert_eq!(options.redirect_to.as_deref(), Some("https://app.io/verify"));
    }

    #[test]
    fn test_sign_up_options_wire_format() {
        let options = SignUpOptions {
            display_name: Some("Jane".to_string()),
            allowed_roles: Some(vec!["user".to_string()]),
            ..Default::default()
        };
        let json = serde_json::to_value(&options).unwrap();
        assert_eq!(json["displayName"], "Jane");
        assert_eq!(json["allowedRoles"][0], "user");
        assert!(json.get("redirectTo").is_none());
    }
}
