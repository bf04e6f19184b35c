//! Session, user, and persisted-record types

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;

use super::identifiers::{RefreshTokenId, UserId};
use crate::error::{AuthError, Result};
use crate::utils::redact;

/// Namespace of the Hasura claims inside the access token payload
pub const HASURA_CLAIMS_NAMESPACE: &str = "https://hasura.io/jwt/claims";

/// Longest access-token lifetime taken at face value; larger values are clamped
pub const MAX_ACCESS_TOKEN_LIFETIME: Duration = Duration::from_secs(366 * 24 * 60 * 60);

// ============================================================================
// User
// ============================================================================

/// Authenticated user, as returned by the backend
///
/// Immutable from the engine's perspective: it is only replaced wholesale
/// when a new session arrives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    /// User ID
    pub id: UserId,
    /// Email address (absent for anonymous users)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Display name
    #[serde(default)]
    pub display_name: String,
    /// Roles the user may assume
    #[serde(default)]
    pub roles: BTreeSet<String>,
    /// Role used when the request does not ask for one
    #[serde(default)]
    pub default_role: String,
    /// Preferred locale
    #[serde(default)]
    pub locale: String,
    /// Whether the user signed in anonymously
    #[serde(default)]
    pub is_anonymous: bool,
    /// Avatar URL
    #[serde(default)]
    pub avatar_url: String,
}

// ============================================================================
// Wire payload
// ============================================================================

/// Session as sent by the backend (`{ session: ... }`)
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPayload {
    /// Bearer token for API calls
    pub access_token: String,
    /// Lifetime of the access token, in seconds
    pub access_token_expires_in: u64,
    /// Token exchanged for a new access token
    pub refresh_token: String,
    /// Server-side ID of the refresh token
    #[serde(default)]
    pub refresh_token_id: RefreshTokenId,
    /// The authenticated user
    pub user: User,
}

impl std::fmt::Debug for SessionPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPayload")
            .field("access_token", &redact(&self.access_token))
            .field("access_token_expires_in", &self.access_token_expires_in)
            .field("refresh_token", &redact(&self.refresh_token))
            .field("refresh_token_id", &self.refresh_token_id)
            .field("user", &self.user.id)
            .finish()
    }
}

/// Second-factor challenge returned by a sign-in instead of a session
///
/// The ticket is exchanged, together with a one-time password, at
/// `/signin/mfa/totp`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MfaChallenge {
    /// Opaque ticket, `mfaTotp:<uuid>`
    pub ticket: String,
}

impl std::fmt::Debug for MfaChallenge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MfaChallenge")
            .field("ticket", &redact(&self.ticket))
            .finish()
    }
}

// ============================================================================
// In-memory session
// ============================================================================

/// The authoritative in-memory session
///
/// Exactly one may exist per client at a time; its presence is what makes
/// the machine "signed in".
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    /// Bearer token for API calls
    pub access_token: String,
    /// Instant at which the access token stops being accepted
    pub access_token_expires_at: Instant,
    /// Token exchanged for a new access token
    pub refresh_token: String,
    /// Server-side ID of the refresh token
    pub refresh_token_id: RefreshTokenId,
    /// The authenticated user
    pub user: User,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &redact(&self.access_token))
            .field("access_token_expires_at", &self.access_token_expires_at)
            .field("refresh_token", &redact(&self.refresh_token))
            .field("refresh_token_id", &self.refresh_token_id)
            .field("user", &self.user.id)
            .finish()
    }
}

impl Session {
    /// Build a session from a backend payload received at `now`
    ///
    /// Lifetimes beyond [`MAX_ACCESS_TOKEN_LIFETIME`] are clamped to it.
    #[must_use]
    pub fn from_payload(payload: SessionPayload, now: Instant) -> Self {
        let lifetime =
            Duration::from_secs(payload.access_token_expires_in).min(MAX_ACCESS_TOKEN_LIFETIME);
        Self {
            access_token_expires_at: now.checked_add(lifetime).unwrap_or(now),
            access_token: payload.access_token,
            refresh_token: payload.refresh_token,
            refresh_token_id: payload.refresh_token_id,
            user: payload.user,
        }
    }

    /// Remaining access-token lifetime at `now` (zero once expired)
    #[must_use]
    pub fn expires_in(&self, now: Instant) -> Duration {
        self.access_token_expires_at.saturating_duration_since(now)
    }

    /// Whether the access token is still usable at `now` after keeping
    /// `margin` in reserve
    #[must_use]
    pub fn is_valid_at(&self, now: Instant, margin: Duration) -> bool {
        !self.access_token.is_empty() && self.expires_in(now) > margin
    }

    /// Whether a refresh token is available
    #[must_use]
    pub fn has_refresh_token(&self) -> bool {
        !self.refresh_token.is_empty()
    }

    /// Decode the access token payload
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidToken` if the token is not a JWT.
    pub fn decoded_access_token(&self) -> Result<DecodedAccessToken> {
        DecodedAccessToken::decode(&self.access_token)
    }
}

// ============================================================================
// Persisted record
// ============================================================================

/// Storage-medium agnostic serialized form of a [`Session`]
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedSessionRecord {
    /// Bearer token at the time of saving
    pub access_token: String,
    /// Remaining access-token lifetime at the time of saving, in seconds
    pub access_token_expires_in: u64,
    /// Token exchanged for a new access token
    pub refresh_token: String,
    /// Server-side ID of the refresh token
    #[serde(default)]
    pub refresh_token_id: String,
    /// The authenticated user
    pub user: User,
    /// Unix timestamp (seconds) of the save, used to age the record on load
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_at: Option<u64>,
}

impl std::fmt::Debug for PersistedSessionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistedSessionRecord")
            .field("access_token", &redact(&self.access_token))
            .field("access_token_expires_in", &self.access_token_expires_in)
            .field("refresh_token", &redact(&self.refresh_token))
            .field("refresh_token_id", &self.refresh_token_id)
            .field("user", &self.user.id)
            .field("saved_at", &self.saved_at)
            .finish()
    }
}

impl PersistedSessionRecord {
    /// Snapshot a session for storage
    #[must_use]
    pub fn from_session(session: &Session, now: Instant) -> Self {
        Self {
            access_token: session.access_token.clone(),
            access_token_expires_in: session.expires_in(now).as_secs(),
            refresh_token: session.refresh_token.clone(),
            refresh_token_id: session.refresh_token_id.to_string(),
            user: session.user.clone(),
            saved_at: Some(unix_now()),
        }
    }

    /// Seconds elapsed since the record was saved (zero if unknown)
    #[must_use]
    pub fn age_secs(&self) -> u64 {
        self.saved_at
            .map_or(0, |saved_at| unix_now().saturating_sub(saved_at))
    }

    /// Access-token lifetime left after `age_secs` have passed
    #[must_use]
    pub fn remaining_secs(&self, age_secs: u64) -> u64 {
        self.access_token_expires_in.saturating_sub(age_secs)
    }

    /// Rebuild the wire payload with the lifetime reduced by `age_secs`
    #[must_use]
    pub fn to_payload(&self, age_secs: u64) -> SessionPayload {
        SessionPayload {
            access_token: self.access_token.clone(),
            access_token_expires_in: self.remaining_secs(age_secs),
            refresh_token: self.refresh_token.clone(),
            refresh_token_id: RefreshTokenId::new(self.refresh_token_id.clone()),
            user: self.user.clone(),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

// ============================================================================
// Access token claims
// ============================================================================

/// Decoded (not verified) access token payload
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct DecodedAccessToken {
    /// Subject (user ID)
    #[serde(default)]
    pub sub: Option<String>,
    /// Expiry, unix seconds
    #[serde(default)]
    pub exp: Option<u64>,
    /// Issued-at, unix seconds
    #[serde(default)]
    pub iat: Option<u64>,
    /// Hasura claims namespace
    #[serde(rename = "https://hasura.io/jwt/claims", default)]
    pub hasura_claims: Option<HashMap<String, serde_json::Value>>,
}

impl DecodedAccessToken {
    /// Decode the payload segment of a JWT
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidToken` if the token has no payload segment
    /// or the payload is not base64url-encoded JSON.
    pub fn decode(token: &str) -> Result<Self> {
        let payload = token
            .split('.')
            .nth(1)
            .ok_or_else(|| AuthError::invalid_token("missing payload segment"))?;
        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| AuthError::invalid_token(format!("payload is not base64url: {e}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| AuthError::invalid_token(format!("payload is not JSON: {e}")))
    }

    /// Look up a Hasura claim, with or without the `x-hasura-` prefix
    #[must_use]
    pub fn hasura_claim(&self, name: &str) -> Option<&serde_json::Value> {
        let claims = self.hasura_claims.as_ref()?;
        let key = name.to_ascii_lowercase();
        let key = if key.starts_with("x-hasura-") {
            key
        } else {
            format!("x-hasura-{key}")
        };
        claims.get(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(expires_in: u64) -> SessionPayload {
        SessionPayload {
            access_token: "access-1".to_string(),
            access_token_expires_in: expires_in,
            refresh_token: "refresh-1".to_string(),
            refresh_token_id: RefreshTokenId::new("rt-1"),
            user: User {
                id: UserId::new("user-1"),
                email: Some("jane@example.com".to_string()),
                roles: ["user".to_string(), "me".to_string()].into_iter().collect(),
                default_role: "user".to_string(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_payload_wire_format() {
        let json = serde_json::json!({
            "accessToken": "a",
            "accessTokenExpiresIn": 900,
            "refreshToken": "r",
            "refreshTokenId": "rid",
            "user": {
                "id": "u",
                "email": "u@example.com",
                "displayName": "U",
                "roles": ["user"],
                "defaultRole": "user",
                "locale": "en",
                "isAnonymous": false,
                "avatarUrl": ""
            }
        });
        let parsed: SessionPayload = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.access_token_expires_in, 900);
        assert_eq!(parsed.user.display_name, "U");
        assert!(parsed.user.roles.contains("user"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_validity_window() {
        let now = Instant::now();
        let session = Session::from_payload(payload(3600), now);
        assert_eq!(session.expires_in(now), Duration::from_secs(3600));
        assert!(session.is_valid_at(now, Duration::from_secs(60)));
        assert!(!session.is_valid_at(now + Duration::from_secs(3541), Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_lifetime_is_clamped() {
        let now = Instant::now();
        let session = Session::from_payload(payload(u64::MAX), now);
        assert_eq!(session.expires_in(now), MAX_ACCESS_TOKEN_LIFETIME);
        assert!(session.is_valid_at(now, Duration::from_secs(60)));

        let record = PersistedSessionRecord::from_session(&session, now);
        assert_eq!(
            record.access_token_expires_in,
            MAX_ACCESS_TOKEN_LIFETIME.as_secs()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_ages_by_saved_at() {
        let now = Instant::now();
        let session = Session::from_payload(payload(3600), now);
        let mut record = PersistedSessionRecord::from_session(&session, now);
        assert_eq!(record.access_token_expires_in, 3600);
        assert_eq!(record.refresh_token_id, "rt-1");

        record.saved_at = Some(unix_now() - 600);
        let age = record.age_secs();
        assert!((600..=601).contains(&age));
        assert_eq!(record.to_payload(600).access_token_expires_in, 3000);

        record.saved_at = None;
        assert_eq!(record.age_secs(), 0);
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let rendered = format!("{:?}", payload(10));
        assert!(!rendered.contains("refresh-1"));
        assert!(!rendered.contains("access-1"));

        let challenge = MfaChallenge {
            ticket: "mfaTotp:0b6c7a52-93f1-4a0e-8d7b-3f1e2c4d5a6b".to_string(),
        };
        assert!(!format!("{challenge:?}").contains("0b6c7a52-93f1"));
    }

    #[test]
    fn test_decode_hasura_claims() {
        let claims = serde_json::json!({
            "sub": "user-1",
            "exp": 1_700_000_000u64,
            "https://hasura.io/jwt/claims": {
                "x-hasura-user-id": "user-1",
                "x-hasura-default-role": "user",
                "x-hasura-allowed-roles": ["user", "me"]
            }
        });
        let token = format!(
            "header.{}.signature",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap())
        );
        let decoded = DecodedAccessToken::decode(&token).unwrap();
        assert_eq!(decoded.sub.as_deref(), Some("user-1"));
        assert_eq!(
            decoded.hasura_claim("default-role"),
            Some(&serde_json::json!("user"))
        );
        assert_eq!(
            decoded.hasura_claim("x-hasura-user-id"),
            Some(&serde_json::json!("user-1"))
        );
    }

    #[test]
    fn test_decode_rejects_opaque_token() {
        assert!(matches!(
            DecodedAccessToken::decode("opaque"),
            Err(AuthError::InvalidToken(_))
        ));
    }
}
