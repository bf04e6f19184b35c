//! Hierarchical auth state as a tagged union
//!
//! Every leaf has a dotted path (`signedIn.refreshTimer.running.pending`);
//! [`AuthState::matches`] tests a state against a path prefix, the way the
//! UI asks "are we in `signedOut.failed`?".

use crate::classify::{ClassifiedError, ErrorCategory, ErrorField};

/// Top-level auth state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AuthState {
    /// Initial; resolving persisted state
    #[default]
    Starting,
    /// No session exists
    SignedOut(SignedOutState),
    /// A single authentication attempt is in flight
    Authenticating(AuthenticatingState),
    /// A sign-up attempt is in flight
    Registering,
    /// A session exists
    SignedIn(SignedInState),
}

/// Sub-states of `signedOut`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SignedOutState {
    /// Nothing to report
    #[default]
    NoErrors,
    /// The last request was accepted (e.g. a magic link was sent)
    Success,
    /// The user must verify their email before signing in
    NeedsVerification,
    /// Credentials were accepted; a second factor is required
    NeedsMfa,
    /// The last attempt failed
    Failed(Failure),
    /// Local session state is being torn down
    SigningOut,
}

/// Why an attempt ended in `failed`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Rejected by the backend, or unreachable
    Server,
    /// Rejected locally, optionally pinned to a field
    Validation(Option<ErrorField>),
}

impl Failure {
    /// Failure sub-state matching a classified error
    #[must_use]
    pub fn for_error(error: &ClassifiedError) -> Self {
        match error.category {
            ErrorCategory::Validation => Self::Validation(error.field),
            ErrorCategory::Server | ErrorCategory::Network => Self::Server,
        }
    }

    fn path(self) -> &'static str {
        match self {
            Self::Server => "failed.server",
            Self::Validation(None) => "failed.validation",
            Self::Validation(Some(ErrorField::Email)) => "failed.validation.email",
            Self::Validation(Some(ErrorField::Password)) => "failed.validation.password",
        }
    }
}

/// Sub-states of `authenticating`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticatingState {
    /// Email and password sign-in
    Password,
    /// Magic link request
    PasswordlessEmail,
    /// Anonymous sign-in
    Anonymous,
    /// One-time password for a second-factor challenge
    MfaTotp,
    /// Refresh token import
    Token,
}

/// The three orthogonal regions of `signedIn`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignedInState {
    /// Proactive token refresh
    pub refresh_timer: RefreshTimerState,
    /// Email change
    pub change_email: ChangeState,
    /// Password change
    pub change_password: ChangeState,
}

/// Refresh timer region
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RefreshTimerState {
    /// Automatic refresh is turned off
    Disabled,
    /// The session has no refresh token
    Stopped,
    /// No timer armed; refreshes happen on demand only
    #[default]
    Idle,
    /// Timer armed, waiting
    Pending,
    /// Refresh request in flight
    Refreshing,
}

impl RefreshTimerState {
    fn path(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Stopped => "stopped",
            Self::Idle => "idle",
            Self::Pending => "running.pending",
            Self::Refreshing => "running.refreshing",
        }
    }
}

/// Change-email and change-password regions
///
/// `NeedsVerification` is only ever entered by the email region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeState {
    /// No change in flight
    Idle(ChangeOutcome),
    /// Change request in flight
    Running,
}

impl Default for ChangeState {
    fn default() -> Self {
        Self::Idle(ChangeOutcome::NoErrors)
    }
}

/// Outcome remembered by an idle change region
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChangeOutcome {
    /// Nothing to report
    #[default]
    NoErrors,
    /// Change applied
    Success,
    /// Change awaits confirmation by email
    NeedsVerification,
    /// Change was rejected by the backend
    FailedServer,
    /// Change was rejected locally
    FailedValidation,
}

impl ChangeState {
    fn path(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Idle(ChangeOutcome::NoErrors) => "idle.noErrors",
            Self::Idle(ChangeOutcome::Success) => "idle.success",
            Self::Idle(ChangeOutcome::NeedsVerification) => "idle.needsVerification",
            Self::Idle(ChangeOutcome::FailedServer) => "idle.failed.server",
            Self::Idle(ChangeOutcome::FailedValidation) => "idle.failed.validation",
        }
    }

    /// Whether a change request is in flight
    #[must_use]
    pub fn is_running(self) -> bool {
        matches!(self, Self::Running)
    }
}

impl AuthState {
    /// Dotted paths of every active leaf (three while signed in, one otherwise)
    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        match self {
            Self::Starting => vec!["starting".to_string()],
            Self::SignedOut(sub) => {
                let leaf = match sub {
                    SignedOutState::NoErrors => "noErrors",
                    SignedOutState::Success => "success",
                    SignedOutState::NeedsVerification => "needsVerification",
                    SignedOutState::NeedsMfa => "needsMfa",
                    SignedOutState::Failed(failure) => failure.path(),
                    SignedOutState::SigningOut => "signingOut",
                };
                vec![format!("signedOut.{leaf}")]
            }
            Self::Authenticating(sub) => {
                let leaf = match sub {
                    AuthenticatingState::Password => "password",
                    AuthenticatingState::PasswordlessEmail => "passwordlessEmail",
                    AuthenticatingState::Anonymous => "anonymous",
                    AuthenticatingState::MfaTotp => "mfa.totp",
                    AuthenticatingState::Token => "token",
                };
                vec![format!("authenticating.{leaf}")]
            }
            Self::Registering => vec!["registering".to_string()],
            Self::SignedIn(regions) => vec![
                format!("signedIn.refreshTimer.{}", regions.refresh_timer.path()),
                format!("signedIn.changeEmail.{}", regions.change_email.path()),
                format!("signedIn.changePassword.{}", regions.change_password.path()),
            ],
        }
    }

    /// Whether any active leaf is `pattern` or lies below it
    ///
    /// ```
    /// use hasura_auth_session::machine::{AuthState, Failure, SignedOutState};
    ///
    /// let state = AuthState::SignedOut(SignedOutState::Failed(Failure::Server));
    /// assert!(state.matches("signedOut"));
    /// assert!(state.matches("signedOut.failed"));
    /// assert!(!state.matches("signedOut.fail"));
    /// ```
    #[must_use]
    pub fn matches(&self, pattern: &str) -> bool {
        self.paths().iter().any(|path| {
            path == pattern
                || (path.starts_with(pattern) && path.as_bytes().get(pattern.len()) == Some(&b'.'))
        })
    }

    /// Whether the state is `signedIn.*`
    #[must_use]
    pub fn is_signed_in(&self) -> bool {
        matches!(self, Self::SignedIn(_))
    }

    /// Whether the state is `signedOut.*`
    #[must_use]
    pub fn is_signed_out(&self) -> bool {
        matches!(self, Self::SignedOut(_))
    }

    /// Whether an authentication outcome is still being decided
    #[must_use]
    pub fn is_loading(&self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Authenticating(_) | Self::Registering
        )
    }

    /// Whether no request started by the last event is still in flight
    ///
    /// Background refreshes do not count: a signed-in client with a refresh
    /// in flight is settled.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        match self {
            Self::SignedIn(regions) => {
                !regions.change_email.is_running() && !regions.change_password.is_running()
            }
            Self::SignedOut(sub) => *sub != SignedOutState::SigningOut,
            Self::Starting | Self::Authenticating(_) | Self::Registering => false,
        }
    }

    /// Signed-in regions, if signed in
    #[must_use]
    pub fn signed_in(&self) -> Option<&SignedInState> {
        match self {
            Self::SignedIn(regions) => Some(regions),
            _ => None,
        }
    }
}

impl std::fmt::Display for AuthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.paths().join(", "))
    }
}
