//! Machine context: the data the state machine carries between events

use super::state::AuthState;
use crate::classify::ClassifiedError;
use crate::types::{MfaChallenge, Session};

/// Identifies one request issued by the machine
///
/// Completions carry the ID back; a completion whose ID the context no longer
/// holds is stale and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId(u64);

impl OperationId {
    /// Wrap a raw ID
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op-{}", self.0)
    }
}

/// Identifies one arming of the refresh timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

impl TimerId {
    /// Wrap a raw ID
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for TimerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "timer-{}", self.0)
    }
}

/// Where an imported refresh token came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    /// Persisted record or configured initial token, at start-up
    Startup,
    /// `TRY_TOKEN`
    Explicit,
}

/// Tag of the main in-flight request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Email and password sign-in
    SignInPassword,
    /// Magic link request
    SignInPasswordlessEmail,
    /// Anonymous sign-in
    SignInAnonymous,
    /// Second-factor sign-in
    SignInMfaTotp,
    /// Sign-up
    Register,
    /// Refresh token import
    ImportToken,
    /// Access token refresh while signed in
    Refresh,
}

/// The main in-flight request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingOperation {
    /// Request ID
    pub id: OperationId,
    /// What it is
    pub kind: OperationKind,
}

/// Refresh token import in progress, kept across retries
#[derive(Clone, PartialEq, Eq)]
pub struct TokenImport {
    /// Token being exchanged
    pub refresh_token: String,
    /// Where it came from
    pub source: TokenSource,
    /// Failed attempts so far
    pub attempts: u32,
}

impl std::fmt::Debug for TokenImport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenImport")
            .field("refresh_token", &crate::utils::redact(&self.refresh_token))
            .field("source", &self.source)
            .field("attempts", &self.attempts)
            .finish()
    }
}

/// Data owned by the machine; only transitions write it
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineContext {
    /// Current session; present exactly while signed in
    pub session: Option<Session>,
    /// Error of the last authentication, registration or refresh
    pub error: Option<ClassifiedError>,
    /// Error of the last email change
    pub change_email_error: Option<ClassifiedError>,
    /// Error of the last password change
    pub change_password_error: Option<ClassifiedError>,
    /// Consecutive failed refresh attempts
    pub refresh_attempts: u32,
    /// Main in-flight request
    pub pending_operation: Option<PendingOperation>,
    /// In-flight email change request
    pub change_email_operation: Option<OperationId>,
    /// In-flight password change request
    pub change_password_operation: Option<OperationId>,
    /// Refresh token import in progress
    pub token_import: Option<TokenImport>,
    /// `TRY_TOKEN` exchange running alongside a signed-in session
    pub token_operation: Option<OperationId>,
    /// Error of the last `TRY_TOKEN` exchange made while signed in
    pub token_error: Option<ClassifiedError>,
    /// Second-factor challenge awaiting a one-time password
    pub mfa: Option<MfaChallenge>,
    /// Refresh timer currently armed
    pub armed_timer: Option<TimerId>,
    next_operation: u64,
    next_timer: u64,
}

impl MachineContext {
    /// Allocate a fresh request ID
    pub fn next_operation_id(&mut self) -> OperationId {
        self.next_operation += 1;
        OperationId::new(self.next_operation)
    }

    /// Allocate a fresh timer ID
    pub fn next_timer_id(&mut self) -> TimerId {
        self.next_timer += 1;
        TimerId::new(self.next_timer)
    }

    /// Access token of the current session
    #[must_use]
    pub fn access_token(&self) -> Option<&str> {
        self.session.as_ref().map(|session| session.access_token.as_str())
    }
}

/// State and context published after every processed input
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthSnapshot {
    /// Current state
    pub state: AuthState,
    /// Current context
    pub context: MachineContext,
}

impl AuthSnapshot {
    /// Current session
    #[must_use]
    pub fn session(&self) -> Option<&Session> {
        self.context.session.as_ref()
    }

    /// Whether the snapshot is signed in with a session
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.state.is_signed_in() && self.context.session.is_some()
    }

    /// Whether a `TRY_TOKEN` exchange is running while signed in
    #[must_use]
    pub fn is_importing_token(&self) -> bool {
        self.context.token_operation.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let mut context = MachineContext::default();
        let a = context.next_operation_id();
        let b = context.next_operation_id();
        assert!(b > a);

        let t1 = context.next_timer_id();
        let t2 = context.next_timer_id();
        assert_ne!(t1, t2);
        assert_eq!(t2.to_string(), "timer-2");
    }

    #[test]
    fn test_default_snapshot_is_starting() {
        let snapshot = AuthSnapshot::default();
        assert_eq!(snapshot.state, AuthState::Starting);
        assert!(!snapshot.is_authenticated());
        assert!(snapshot.context.access_token().is_none());
    }
}
