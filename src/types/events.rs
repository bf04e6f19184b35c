//! External events accepted by the machine and the notifications it emits

use super::options::{ChangeEmailOptions, PasswordlessOptions, SignUpOptions};
use super::session::{Session, SessionPayload};
use crate::utils::redact;

/// Event sent to the auth machine by the application
///
/// Internal events (timer fires, request completions) never appear here;
/// they are produced by the client actor itself.
#[derive(Clone, PartialEq)]
pub enum AuthEvent {
    /// `SIGNIN_PASSWORD`
    SignInPassword {
        /// Email address
        email: String,
        /// Password
        password: String,
    },
    /// `SIGNIN_PASSWORDLESS_EMAIL`
    SignInPasswordlessEmail {
        /// Email address receiving the magic link
        email: String,
        /// Request options
        options: PasswordlessOptions,
    },
    /// `SIGNIN_ANONYMOUS`: create a session for a new anonymous user
    SignInAnonymous,
    /// `SIGNIN_MFA_TOTP`: complete a sign-in that asked for a second factor
    SignInMfaTotp {
        /// Ticket from the challenge; the last one received is used when `None`
        ticket: Option<String>,
        /// One-time password from the authenticator app
        otp: String,
    },
    /// `REGISTER`
    Register {
        /// Email address
        email: String,
        /// Password
        password: String,
        /// Request options
        options: SignUpOptions,
    },
    /// `TRY_TOKEN`: exchange a refresh token for a session
    ///
    /// While signed in, a successful exchange replaces the session and a
    /// failed one leaves it in place.
    TryToken {
        /// Refresh token to import
        refresh_token: String,
    },
    /// `SESSION_UPDATE`: replace the session with one obtained elsewhere
    SessionUpdate {
        /// The new session
        session: SessionPayload,
    },
    /// `CHANGE_EMAIL`
    ChangeEmail {
        /// New email address
        new_email: String,
        /// Request options
        options: ChangeEmailOptions,
    },
    /// `CHANGE_PASSWORD`
    ChangePassword {
        /// New password
        new_password: String,
    },
    /// `SIGNOUT`
    SignOut {
        /// Revoke every refresh token of the user, not only this one
        all: bool,
    },
    /// Refresh the access token now instead of waiting for the timer
    RefreshSession,
}

impl AuthEvent {
    /// Wire name of the event, used in logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::SignInPassword { .. } => "SIGNIN_PASSWORD",
            Self::SignInPasswordlessEmail { .. } => "SIGNIN_PASSWORDLESS_EMAIL",
            Self::SignInAnonymous => "SIGNIN_ANONYMOUS",
            Self::SignInMfaTotp { .. } => "SIGNIN_MFA_TOTP",
            Self::Register { .. } => "REGISTER",
            Self::TryToken { .. } => "TRY_TOKEN",
            Self::SessionUpdate { .. } => "SESSION_UPDATE",
            Self::ChangeEmail { .. } => "CHANGE_EMAIL",
            Self::ChangePassword { .. } => "CHANGE_PASSWORD",
            Self::SignOut { .. } => "SIGNOUT",
            Self::RefreshSession => "REFRESH_SESSION",
        }
    }

    /// Whether the event starts an authentication attempt
    #[must_use]
    pub fn is_authentication(&self) -> bool {
        matches!(
            self,
            Self::SignInPassword { .. }
                | Self::SignInPasswordlessEmail { .. }
                | Self::SignInAnonymous
                | Self::SignInMfaTotp { .. }
                | Self::Register { .. }
                | Self::TryToken { .. }
        )
    }
}

impl std::fmt::Debug for AuthEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SignInPassword { email, .. } => f
                .debug_struct("SignInPassword")
                .field("email", email)
                .finish_non_exhaustive(),
            Self::SignInPasswordlessEmail { email, options } => f
                .debug_struct("SignInPasswordlessEmail")
                .field("email", email)
                .field("options", options)
                .finish(),
            Self::SignInAnonymous => f.write_str("SignInAnonymous"),
            Self::SignInMfaTotp { ticket, .. } => f
                .debug_struct("SignInMfaTotp")
                .field("ticket", &ticket.as_deref().map(redact))
                .finish_non_exhaustive(),
            Self::Register { email, options, .. } => f
                .debug_struct("Register")
                .field("email", email)
                .field("options", options)
                .finish_non_exhaustive(),
            Self::TryToken { refresh_token } => f
                .debug_struct("TryToken")
                .field("refresh_token", &redact(refresh_token))
                .finish(),
            Self::SessionUpdate { session } => f
                .debug_struct("SessionUpdate")
                .field("session", session)
                .finish(),
            Self::ChangeEmail { new_email, options } => f
                .debug_struct("ChangeEmail")
                .field("new_email", new_email)
                .field("options", options)
                .finish(),
            Self::ChangePassword { .. } => f.debug_struct("ChangePassword").finish_non_exhaustive(),
            Self::SignOut { all } => f.debug_struct("SignOut").field("all", all).finish(),
            Self::RefreshSession => f.write_str("RefreshSession"),
        }
    }
}

/// Kind of auth change delivered to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthChangeEvent {
    /// A session was established
    SignedIn,
    /// The session was dropped
    SignedOut,
    /// The access token of the current session changed
    TokenChanged,
}

impl std::fmt::Display for AuthChangeEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::SignedIn => "SIGNED_IN",
            Self::SignedOut => "SIGNED_OUT",
            Self::TokenChanged => "TOKEN_CHANGED",
        };
        f.write_str(name)
    }
}

/// Auth change notification with the session at the time of the change
#[derive(Debug, Clone, PartialEq)]
pub struct AuthChange {
    /// What happened
    pub event: AuthChangeEvent,
    /// Session after the change (`None` once signed out)
    pub session: Option<Session>,
}
