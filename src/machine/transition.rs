//! Pure transition function of the auth machine
//!
//! [`transition`] maps a snapshot and one input to the next snapshot and the
//! effects the caller must carry out. It performs no I/O: requests, timers,
//! persistence and notifications are all described as [`Effect`]s, and their
//! results come back later as further [`Input`]s.

use std::time::Duration;
use tokio::time::Instant;

use super::context::{
    AuthSnapshot, MachineContext, OperationId, OperationKind, PendingOperation, TimerId,
    TokenImport, TokenSource,
};
use super::state::{
    AuthState, AuthenticatingState, ChangeOutcome, ChangeState, Failure, RefreshTimerState,
    SignedInState, SignedOutState,
};
use crate::classify::{BackendError, ClassifiedError, ErrorCategory, classify};
use crate::scheduler::{refresh_delay, retry_delay};
use crate::types::{
    AuthChangeEvent, AuthEvent, AuthOptions, ChangeEmailOptions, MfaChallenge,
    PasswordlessOptions, PersistedSessionRecord, Session, SessionPayload, SignUpOptions,
};
use crate::utils::redact;
use crate::validators::{is_valid_email, is_valid_mfa_ticket, is_valid_password};

// ============================================================================
// Inputs and Effects
// ============================================================================

/// Successful result of a backend request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceOutput {
    /// A session was issued
    Session(SessionPayload),
    /// Accepted, but the user must confirm by email first
    VerificationRequired,
    /// Credentials accepted; a second factor must be presented
    MfaRequired(MfaChallenge),
    /// Accepted, nothing further to do
    Done,
}

/// Everything the machine reacts to
#[derive(Clone, PartialEq)]
pub enum Input {
    /// Start-up, with the persisted record (if any) and its age in seconds
    Start {
        /// Record read from persistence
        persisted: Option<PersistedSessionRecord>,
        /// Seconds since the record was saved
        age_secs: u64,
    },
    /// Event sent by the application
    Event(AuthEvent),
    /// A refresh timer elapsed
    TimerFired(TimerId),
    /// A request issued by an effect finished
    Completed {
        /// Request ID from the effect
        op: OperationId,
        /// Outcome
        result: Result<ServiceOutput, ClassifiedError>,
    },
    /// The persisted record has been deleted
    PersistenceCleared,
}

impl Input {
    /// Short name, used in logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start { .. } => "START",
            Self::Event(event) => event.name(),
            Self::TimerFired(_) => "TIMER_FIRED",
            Self::Completed { result: Ok(_), .. } => "DONE",
            Self::Completed { result: Err(_), .. } => "ERROR",
            Self::PersistenceCleared => "PERSISTENCE_CLEARED",
        }
    }
}

impl std::fmt::Debug for Input {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Start { persisted, age_secs } => f
                .debug_struct("Start")
                .field("persisted", persisted)
                .field("age_secs", age_secs)
                .finish(),
            Self::Event(event) => f.debug_tuple("Event").field(event).finish(),
            Self::TimerFired(id) => f.debug_tuple("TimerFired").field(id).finish(),
            Self::Completed { op, result } => f
                .debug_struct("Completed")
                .field("op", op)
                .field("result", result)
                .finish(),
            Self::PersistenceCleared => f.write_str("PersistenceCleared"),
        }
    }
}

/// Side effect requested by a transition
#[derive(Clone, PartialEq)]
pub enum Effect {
    /// Sign in with email and password
    SignInPassword {
        /// Request ID
        op: OperationId,
        /// Email address
        email: String,
        /// Password
        password: String,
    },
    /// Request a magic link
    SignInPasswordlessEmail {
        /// Request ID
        op: OperationId,
        /// Email address
        email: String,
        /// Request options, redirect already rewritten
        options: PasswordlessOptions,
    },
    /// Create an anonymous user and sign in as it
    SignInAnonymous {
        /// Request ID
        op: OperationId,
    },
    /// Answer a second-factor challenge
    SignInMfaTotp {
        /// Request ID
        op: OperationId,
        /// Challenge ticket
        ticket: String,
        /// One-time password
        otp: String,
    },
    /// Sign up with email and password
    SignUp {
        /// Request ID
        op: OperationId,
        /// Email address
        email: String,
        /// Password
        password: String,
        /// Request options, redirect already rewritten
        options: SignUpOptions,
    },
    /// Exchange a refresh token for a session
    RefreshToken {
        /// Request ID
        op: OperationId,
        /// Refresh token
        refresh_token: String,
    },
    /// Revoke the refresh token server-side; nothing waits on the result
    RevokeSession {
        /// Refresh token to revoke
        refresh_token: String,
        /// Revoke every session of the user
        all: bool,
    },
    /// Change the user's email
    ChangeEmail {
        /// Request ID
        op: OperationId,
        /// Bearer token for the request
        access_token: String,
        /// New email address
        new_email: String,
        /// Request options, redirect already rewritten
        options: ChangeEmailOptions,
    },
    /// Change the user's password
    ChangePassword {
        /// Request ID
        op: OperationId,
        /// Bearer token for the request
        access_token: String,
        /// New password
        new_password: String,
    },
    /// Write the session to persistence
    PersistSession(Session),
    /// Delete the persisted record
    ClearPersistedSession,
    /// Arm the refresh timer, cancelling any armed one
    ArmRefreshTimer {
        /// ID reported back when it fires
        timer: TimerId,
        /// Delay from now
        delay: Duration,
    },
    /// Cancel the armed refresh timer
    DisarmRefreshTimer,
    /// Tell subscribers about an auth change
    Notify(AuthChangeEvent),
}

impl Effect {
    /// Whether the effect issues a network request
    #[must_use]
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            Self::SignInPassword { .. }
                | Self::SignInPasswordlessEmail { .. }
                | Self::SignInAnonymous { .. }
                | Self::SignInMfaTotp { .. }
                | Self::SignUp { .. }
                | Self::RefreshToken { .. }
                | Self::RevokeSession { .. }
                | Self::ChangeEmail { .. }
                | Self::ChangePassword { .. }
        )
    }
}

impl std::fmt::Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SignInPassword { op, email, .. } => f
                .debug_struct("SignInPassword")
                .field("op", op)
                .field("email", email)
                .finish_non_exhaustive(),
            Self::SignInPasswordlessEmail { op, email, options } => f
                .debug_struct("SignInPasswordlessEmail")
                .field("op", op)
                .field("email", email)
                .field("options", options)
                .finish(),
            Self::SignInAnonymous { op } => {
                f.debug_struct("SignInAnonymous").field("op", op).finish()
            }
            Self::SignInMfaTotp { op, ticket, .. } => f
                .debug_struct("SignInMfaTotp")
                .field("op", op)
                .field("ticket", &redact(ticket))
                .finish_non_exhaustive(),
            Self::SignUp {
                op, email, options, ..
            } => f
                .debug_struct("SignUp")
                .field("op", op)
                .field("email", email)
                .field("options", options)
                .finish_non_exhaustive(),
            Self::RefreshToken { op, refresh_token } => f
                .debug_struct("RefreshToken")
                .field("op", op)
                .field("refresh_token", &redact(refresh_token))
                .finish(),
            Self::RevokeSession { refresh_token, all } => f
                .debug_struct("RevokeSession")
                .field("refresh_token", &redact(refresh_token))
                .field("all", all)
                .finish(),
            Self::ChangeEmail {
                op,
                new_email,
                options,
                ..
            } => f
                .debug_struct("ChangeEmail")
                .field("op", op)
                .field("new_email", new_email)
                .field("options", options)
                .finish_non_exhaustive(),
            Self::ChangePassword { op, .. } => f
                .debug_struct("ChangePassword")
                .field("op", op)
                .finish_non_exhaustive(),
            Self::PersistSession(session) => f.debug_tuple("PersistSession").field(session).finish(),
            Self::ClearPersistedSession => f.write_str("ClearPersistedSession"),
            Self::ArmRefreshTimer { timer, delay } => f
                .debug_struct("ArmRefreshTimer")
                .field("timer", timer)
                .field("delay", delay)
                .finish(),
            Self::DisarmRefreshTimer => f.write_str("DisarmRefreshTimer"),
            Self::Notify(event) => f.debug_tuple("Notify").field(event).finish(),
        }
    }
}

// ============================================================================
// Transition
// ============================================================================

/// Compute the next snapshot and the effects of processing `input`
///
/// `now` is the instant the input is processed at; session expiry instants
/// are derived from it.
#[must_use]
pub fn transition(
    snapshot: AuthSnapshot,
    input: Input,
    options: &AuthOptions,
    now: Instant,
) -> (AuthSnapshot, Vec<Effect>) {
    let mut step = Step {
        state: snapshot.state,
        context: snapshot.context,
        effects: Vec::new(),
        options,
        now,
    };

    match input {
        Input::Start {
            persisted,
            age_secs,
        } => step.start(persisted, age_secs),
        Input::Event(event) => step.event(event),
        Input::TimerFired(timer) => step.timer_fired(timer),
        Input::Completed { op, result } => step.completed(op, result),
        Input::PersistenceCleared => step.persistence_cleared(),
    }

    (
        AuthSnapshot {
            state: step.state,
            context: step.context,
        },
        step.effects,
    )
}

struct Step<'a> {
    state: AuthState,
    context: MachineContext,
    effects: Vec<Effect>,
    options: &'a AuthOptions,
    now: Instant,
}

impl Step<'_> {
    fn ignore(&self, input: &str, reason: &str) {
        tracing::debug!(input, state = %self.state, reason, "Input ignored");
    }

    // ------------------------------------------------------------------------
    // Start-up
    // ------------------------------------------------------------------------

    fn start(&mut self, persisted: Option<PersistedSessionRecord>, age_secs: u64) {
        if self.state != AuthState::Starting {
            self.ignore("START", "already started");
            return;
        }

        let initial = self
            .options
            .initial_refresh_token
            .clone()
            .filter(|token| !token.is_empty());
        if let Some(refresh_token) = initial {
            self.begin_import(refresh_token, TokenSource::Startup);
            return;
        }

        match persisted.filter(|_| self.options.auto_sign_in) {
            Some(record)
                if !record.access_token.is_empty() && record.remaining_secs(age_secs) > 0 =>
            {
                tracing::debug!(
                    remaining_secs = record.remaining_secs(age_secs),
                    "Resuming persisted session"
                );
                self.enter_signed_in(record.to_payload(age_secs), false);
            }
            Some(record) if !record.refresh_token.is_empty() => {
                tracing::debug!("Persisted access token expired, importing refresh token");
                self.begin_import(record.refresh_token, TokenSource::Startup);
            }
            Some(_) => {
                self.state = AuthState::SignedOut(SignedOutState::NoErrors);
                self.effects.push(Effect::ClearPersistedSession);
            }
            None => self.state = AuthState::SignedOut(SignedOutState::NoErrors),
        }
    }

    // ------------------------------------------------------------------------
    // External events
    // ------------------------------------------------------------------------

    fn event(&mut self, event: AuthEvent) {
        let event = match event {
            AuthEvent::TryToken { refresh_token } if self.state.is_signed_in() => {
                self.try_token_signed_in(refresh_token);
                return;
            }
            event => event,
        };

        let name = event.name();
        if event.is_authentication() && !self.accepts_authentication() {
            self.ignore(name, "authentication not accepted in this state");
            return;
        }

        match event {
            AuthEvent::SignInPassword { email, password } => {
                if !is_valid_email(&email) {
                    self.fail_validation(BackendError::invalid_email());
                } else if !is_valid_password(&password) {
                    self.fail_validation(BackendError::invalid_password());
                } else {
                    self.state = AuthState::Authenticating(AuthenticatingState::Password);
                    self.context.error = None;
                    let op = self.begin_operation(OperationKind::SignInPassword);
                    self.effects.push(Effect::SignInPassword {
                        op,
                        email,
                        password,
                    });
                }
            }
            AuthEvent::SignInPasswordlessEmail { email, options } => {
                if !is_valid_email(&email) {
                    self.fail_validation(BackendError::invalid_email());
                } else {
                    self.state = AuthState::Authenticating(AuthenticatingState::PasswordlessEmail);
                    self.context.error = None;
                    let op = self.begin_operation(OperationKind::SignInPasswordlessEmail);
                    self.effects.push(Effect::SignInPasswordlessEmail {
                        op,
                        email,
                        options: options.with_client_url(self.options.client_url.as_deref()),
                    });
                }
            }
            AuthEvent::SignInAnonymous => {
                self.state = AuthState::Authenticating(AuthenticatingState::Anonymous);
                self.context.error = None;
                let op = self.begin_operation(OperationKind::SignInAnonymous);
                self.effects.push(Effect::SignInAnonymous { op });
            }
            AuthEvent::SignInMfaTotp { ticket, otp } => self.sign_in_mfa_totp(ticket, otp),
            AuthEvent::Register {
                email,
                password,
                options,
            } => {
                if !is_valid_email(&email) {
                    self.fail_validation(BackendError::invalid_email());
                } else if !is_valid_password(&password) {
                    self.fail_validation(BackendError::invalid_password());
                } else {
                    self.state = AuthState::Registering;
                    self.context.error = None;
                    let op = self.begin_operation(OperationKind::Register);
                    self.effects.push(Effect::SignUp {
                        op,
                        email,
                        password,
                        options: options.with_client_url(self.options.client_url.as_deref()),
                    });
                }
            }
            AuthEvent::TryToken { refresh_token } => {
                if refresh_token.is_empty() {
                    self.fail_validation(BackendError::invalid_refresh_token());
                } else {
                    self.begin_import(refresh_token, TokenSource::Explicit);
                }
            }
            AuthEvent::SessionUpdate { session } => {
                if session.access_token.is_empty() {
                    self.ignore(name, "session has no access token");
                } else {
                    self.enter_signed_in(session, true);
                }
            }
            AuthEvent::ChangeEmail { new_email, options } => self.change_email(new_email, options),
            AuthEvent::ChangePassword { new_password } => self.change_password(new_password),
            AuthEvent::SignOut { all } => self.sign_out(all),
            AuthEvent::RefreshSession => self.refresh_session(),
        }
    }

    fn accepts_authentication(&self) -> bool {
        matches!(&self.state, AuthState::SignedOut(sub) if *sub != SignedOutState::SigningOut)
    }

    fn sign_in_mfa_totp(&mut self, ticket: Option<String>, otp: String) {
        let ticket = ticket
            .filter(|ticket| !ticket.is_empty())
            .or_else(|| self.context.mfa.as_ref().map(|mfa| mfa.ticket.clone()));
        let Some(ticket) = ticket else {
            self.fail_validation(BackendError::no_mfa_ticket());
            return;
        };
        if !is_valid_mfa_ticket(&ticket) {
            self.fail_validation(BackendError::invalid_mfa_ticket());
            return;
        }

        self.state = AuthState::Authenticating(AuthenticatingState::MfaTotp);
        self.context.error = None;
        let op = self.begin_operation(OperationKind::SignInMfaTotp);
        self.effects.push(Effect::SignInMfaTotp { op, ticket, otp });
    }

    /// `TRY_TOKEN` while signed in: the current session stays until the
    /// exchange succeeds
    fn try_token_signed_in(&mut self, refresh_token: String) {
        if self.context.token_operation.is_some() {
            self.ignore("TRY_TOKEN", "token exchange already in flight");
            return;
        }
        if refresh_token.is_empty() {
            self.context.token_error = Some(classify(BackendError::invalid_refresh_token()));
            return;
        }

        let op = self.context.next_operation_id();
        self.context.token_operation = Some(op);
        self.context.token_error = None;
        self.effects.push(Effect::RefreshToken { op, refresh_token });
    }

    fn change_email(&mut self, new_email: String, options: ChangeEmailOptions) {
        let Some(regions) = self.signed_in_regions() else {
            self.ignore("CHANGE_EMAIL", "not signed in");
            return;
        };
        if regions.change_email.is_running() {
            self.ignore("CHANGE_EMAIL", "email change already in flight");
            return;
        }

        if !is_valid_email(&new_email) {
            self.context.change_email_error = Some(classify(BackendError::invalid_email()));
            self.update_regions(|regions| {
                regions.change_email = ChangeState::Idle(ChangeOutcome::FailedValidation);
            });
            return;
        }

        let access_token = self.current_access_token();
        let op = self.context.next_operation_id();
        self.context.change_email_operation = Some(op);
        self.context.change_email_error = None;
        self.update_regions(|regions| regions.change_email = ChangeState::Running);
        self.effects.push(Effect::ChangeEmail {
            op,
            access_token,
            new_email,
            options: options.with_client_url(self.options.client_url.as_deref()),
        });
    }

    fn change_password(&mut self, new_password: String) {
        let Some(regions) = self.signed_in_regions() else {
            self.ignore("CHANGE_PASSWORD", "not signed in");
            return;
        };
        if regions.change_password.is_running() {
            self.ignore("CHANGE_PASSWORD", "password change already in flight");
            return;
        }

        if !is_valid_password(&new_password) {
            self.context.change_password_error = Some(classify(BackendError::invalid_password()));
            self.update_regions(|regions| {
                regions.change_password = ChangeState::Idle(ChangeOutcome::FailedValidation);
            });
            return;
        }

        let access_token = self.current_access_token();
        let op = self.context.next_operation_id();
        self.context.change_password_operation = Some(op);
        self.context.change_password_error = None;
        self.update_regions(|regions| regions.change_password = ChangeState::Running);
        self.effects.push(Effect::ChangePassword {
            op,
            access_token,
            new_password,
        });
    }

    fn sign_out(&mut self, all: bool) {
        if matches!(
            self.state,
            AuthState::SignedOut(SignedOutState::NoErrors | SignedOutState::SigningOut)
        ) {
            self.ignore("SIGNOUT", "already signed out");
            return;
        }

        let revoke = self
            .context
            .session
            .as_ref()
            .map(|session| session.refresh_token.clone())
            .filter(|token| !token.is_empty());

        self.drop_session();
        self.context.error = None;
        self.context.mfa = None;
        self.state = AuthState::SignedOut(SignedOutState::SigningOut);
        self.effects.push(Effect::ClearPersistedSession);
        if let Some(refresh_token) = revoke {
            self.effects.push(Effect::RevokeSession { refresh_token, all });
        }
    }

    fn refresh_session(&mut self) {
        let Some(regions) = self.signed_in_regions() else {
            self.ignore("REFRESH_SESSION", "not signed in");
            return;
        };
        match regions.refresh_timer {
            RefreshTimerState::Refreshing => {
                self.ignore("REFRESH_SESSION", "refresh already in flight");
            }
            RefreshTimerState::Stopped => self.ignore("REFRESH_SESSION", "no refresh token"),
            _ => self.begin_refresh(),
        }
    }

    // ------------------------------------------------------------------------
    // Internal inputs
    // ------------------------------------------------------------------------

    fn timer_fired(&mut self, timer: TimerId) {
        if self.context.armed_timer != Some(timer) {
            tracing::trace!(%timer, "Stale timer fire ignored");
            return;
        }
        self.context.armed_timer = None;

        let refresh_due = self
            .signed_in_regions()
            .is_some_and(|regions| regions.refresh_timer == RefreshTimerState::Pending);
        let import_due = self.state == AuthState::Authenticating(AuthenticatingState::Token)
            && self.context.pending_operation.is_none();

        if refresh_due {
            self.begin_refresh();
        } else if let Some(import) = self.context.token_import.clone().filter(|_| import_due) {
            tracing::debug!(attempt = import.attempts + 1, "Retrying token import");
            let op = self.begin_operation(OperationKind::ImportToken);
            self.effects.push(Effect::RefreshToken {
                op,
                refresh_token: import.refresh_token,
            });
        } else {
            self.ignore("TIMER_FIRED", "nothing scheduled in this state");
        }
    }

    fn completed(&mut self, op: OperationId, result: Result<ServiceOutput, ClassifiedError>) {
        if let Some(pending) = self.context.pending_operation.filter(|pending| pending.id == op) {
            self.context.pending_operation = None;
            match pending.kind {
                OperationKind::SignInPassword
                | OperationKind::SignInPasswordlessEmail
                | OperationKind::SignInAnonymous
                | OperationKind::SignInMfaTotp
                | OperationKind::Register => self.authentication_completed(result),
                OperationKind::ImportToken => self.import_completed(result),
                OperationKind::Refresh => self.refresh_completed(result),
            }
        } else if self.context.token_operation == Some(op) {
            self.context.token_operation = None;
            self.token_completed(result);
        } else if self.context.change_email_operation == Some(op) {
            self.context.change_email_operation = None;
            self.change_email_completed(result);
        } else if self.context.change_password_operation == Some(op) {
            self.context.change_password_operation = None;
            self.change_password_completed(result);
        } else {
            tracing::debug!(%op, state = %self.state, "Stale completion ignored");
        }
    }

    fn persistence_cleared(&mut self) {
        if self.state == AuthState::SignedOut(SignedOutState::SigningOut) {
            self.state = AuthState::SignedOut(SignedOutState::NoErrors);
        }
    }

    // ------------------------------------------------------------------------
    // Completions
    // ------------------------------------------------------------------------

    fn authentication_completed(&mut self, result: Result<ServiceOutput, ClassifiedError>) {
        match result {
            Ok(ServiceOutput::Session(payload)) => self.enter_signed_in(payload, true),
            Ok(ServiceOutput::VerificationRequired) => {
                self.state = AuthState::SignedOut(SignedOutState::NeedsVerification);
            }
            Ok(ServiceOutput::MfaRequired(challenge)) => {
                tracing::debug!("Second factor required");
                self.context.mfa = Some(challenge);
                self.state = AuthState::SignedOut(SignedOutState::NeedsMfa);
            }
            Ok(ServiceOutput::Done) => self.state = AuthState::SignedOut(SignedOutState::Success),
            Err(error) if error.is_unverified() => {
                self.state = AuthState::SignedOut(SignedOutState::NeedsVerification);
            }
            Err(error) => {
                tracing::debug!(%error, "Authentication failed");
                self.state = AuthState::SignedOut(SignedOutState::Failed(Failure::for_error(&error)));
                self.context.error = Some(error);
            }
        }
    }

    fn import_completed(&mut self, result: Result<ServiceOutput, ClassifiedError>) {
        let error = match result {
            Ok(ServiceOutput::Session(payload)) => {
                self.enter_signed_in(payload, true);
                return;
            }
            Ok(_) => unexpected_response(),
            Err(error) => error,
        };

        let Some(mut import) = self.context.token_import.take() else {
            return;
        };
        import.attempts += 1;

        if error.is_transient() && import.attempts < self.options.max_refresh_attempts {
            let delay = retry_delay(self.options.retry_base_delay, import.attempts);
            tracing::warn!(
                attempt = import.attempts,
                retry_in_ms = delay.as_millis(),
                %error,
                "Token import failed, retrying"
            );
            self.context.token_import = Some(import);
            self.arm(delay);
            return;
        }

        match import.source {
            TokenSource::Startup if !error.is_transient() => {
                // expired or revoked at start-up is a normal lifecycle event
                tracing::debug!(%error, "Stored refresh token rejected, signing out");
                self.context.error = None;
                self.state = AuthState::SignedOut(SignedOutState::NoErrors);
                self.effects.push(Effect::ClearPersistedSession);
            }
            _ => {
                tracing::warn!(attempts = import.attempts, %error, "Token import failed");
                self.state = AuthState::SignedOut(SignedOutState::Failed(Failure::for_error(&error)));
                self.context.error = Some(error);
            }
        }
    }

    fn token_completed(&mut self, result: Result<ServiceOutput, ClassifiedError>) {
        let error = match result {
            Ok(ServiceOutput::Session(payload)) => {
                self.context.token_error = None;
                self.enter_signed_in(payload, true);
                return;
            }
            Ok(_) => unexpected_response(),
            Err(error) => error,
        };
        tracing::warn!(%error, "Token exchange failed, keeping the current session");
        self.context.token_error = Some(error);
    }

    fn refresh_completed(&mut self, result: Result<ServiceOutput, ClassifiedError>) {
        let error = match result {
            Ok(ServiceOutput::Session(payload)) => {
                self.enter_signed_in(payload, true);
                return;
            }
            Ok(_) => unexpected_response(),
            Err(error) => error,
        };

        if error.category == ErrorCategory::Network {
            self.context.refresh_attempts += 1;
            let attempts = self.context.refresh_attempts;
            if attempts < self.options.max_refresh_attempts {
                let delay = retry_delay(self.options.retry_base_delay, attempts);
                tracing::warn!(
                    attempt = attempts,
                    retry_in_ms = delay.as_millis(),
                    %error,
                    "Token refresh failed, retrying"
                );
                self.arm(delay);
                self.update_regions(|regions| regions.refresh_timer = RefreshTimerState::Pending);
                return;
            }
            tracing::warn!(attempts, %error, "Token refresh failed, giving up");
        } else {
            tracing::warn!(%error, "Token refresh rejected");
        }

        self.drop_session();
        self.state = AuthState::SignedOut(SignedOutState::Failed(Failure::Server));
        self.context.error = Some(error);
        self.effects.push(Effect::ClearPersistedSession);
    }

    fn change_email_completed(&mut self, result: Result<ServiceOutput, ClassifiedError>) {
        let outcome = match result {
            Ok(ServiceOutput::VerificationRequired) => ChangeOutcome::NeedsVerification,
            Ok(ServiceOutput::Done | ServiceOutput::Session(_)) => ChangeOutcome::Success,
            Err(error) => {
                let outcome = change_failure(&error);
                self.context.change_email_error = Some(error);
                outcome
            }
        };
        self.update_regions(|regions| regions.change_email = ChangeState::Idle(outcome));
    }

    fn change_password_completed(&mut self, result: Result<ServiceOutput, ClassifiedError>) {
        let outcome = match result {
            Ok(_) => ChangeOutcome::Success,
            Err(error) => {
                let outcome = change_failure(&error);
                self.context.change_password_error = Some(error);
                outcome
            }
        };
        self.update_regions(|regions| regions.change_password = ChangeState::Idle(outcome));
    }

    // ------------------------------------------------------------------------
    // Building blocks
    // ------------------------------------------------------------------------

    fn begin_operation(&mut self, kind: OperationKind) -> OperationId {
        let id = self.context.next_operation_id();
        self.context.pending_operation = Some(PendingOperation { id, kind });
        id
    }

    fn begin_import(&mut self, refresh_token: String, source: TokenSource) {
        self.disarm();
        self.state = AuthState::Authenticating(AuthenticatingState::Token);
        self.context.error = None;
        self.context.token_import = Some(TokenImport {
            refresh_token: refresh_token.clone(),
            source,
            attempts: 0,
        });
        let op = self.begin_operation(OperationKind::ImportToken);
        self.effects.push(Effect::RefreshToken { op, refresh_token });
    }

    fn begin_refresh(&mut self) {
        let Some(refresh_token) = self
            .context
            .session
            .as_ref()
            .map(|session| session.refresh_token.clone())
        else {
            return;
        };
        self.disarm();
        let op = self.begin_operation(OperationKind::Refresh);
        self.update_regions(|regions| regions.refresh_timer = RefreshTimerState::Refreshing);
        self.effects.push(Effect::RefreshToken { op, refresh_token });
    }

    fn fail_validation(&mut self, payload: BackendError) {
        let error = classify(payload);
        tracing::debug!(%error, "Input rejected before sending");
        self.state = AuthState::SignedOut(SignedOutState::Failed(Failure::for_error(&error)));
        self.context.error = Some(error);
    }

    /// Install a new session, replacing any current one
    fn enter_signed_in(&mut self, payload: SessionPayload, persist: bool) {
        let was_signed_in = self.state.is_signed_in();
        let session = Session::from_payload(payload, self.now);

        self.disarm();
        self.context.pending_operation = None;
        self.context.token_import = None;
        self.context.error = None;
        self.context.mfa = None;
        self.context.refresh_attempts = 0;

        let mut regions = match &self.state {
            AuthState::SignedIn(regions) => *regions,
            _ => {
                self.context.change_email_error = None;
                self.context.change_password_error = None;
                self.context.change_email_operation = None;
                self.context.change_password_operation = None;
                SignedInState::default()
            }
        };
        regions.refresh_timer = self.schedule_refresh(&session);
        self.state = AuthState::SignedIn(regions);

        if persist {
            self.effects.push(Effect::PersistSession(session.clone()));
        }
        self.context.session = Some(session);
        self.effects.push(Effect::Notify(if was_signed_in {
            AuthChangeEvent::TokenChanged
        } else {
            AuthChangeEvent::SignedIn
        }));
    }

    fn schedule_refresh(&mut self, session: &Session) -> RefreshTimerState {
        if !self.options.auto_refresh_token {
            return RefreshTimerState::Disabled;
        }
        if !session.has_refresh_token() {
            return RefreshTimerState::Stopped;
        }
        let expires_in = session.expires_in(self.now);
        if expires_in.is_zero() && self.options.refresh_interval.is_none() {
            return RefreshTimerState::Idle;
        }
        self.arm(refresh_delay(
            expires_in,
            self.options.refresh_safety_margin,
            self.options.refresh_interval,
        ));
        RefreshTimerState::Pending
    }

    /// Remove the session and everything tied to it
    fn drop_session(&mut self) {
        self.disarm();
        self.context.pending_operation = None;
        self.context.token_import = None;
        self.context.token_operation = None;
        self.context.change_email_operation = None;
        self.context.change_password_operation = None;
        self.context.refresh_attempts = 0;
        if self.context.session.take().is_some() {
            self.effects.push(Effect::Notify(AuthChangeEvent::SignedOut));
        }
    }

    fn arm(&mut self, delay: Duration) {
        let timer = self.context.next_timer_id();
        self.context.armed_timer = Some(timer);
        self.effects.push(Effect::ArmRefreshTimer { timer, delay });
    }

    fn disarm(&mut self) {
        if self.context.armed_timer.take().is_some() {
            self.effects.push(Effect::DisarmRefreshTimer);
        }
    }

    fn signed_in_regions(&self) -> Option<SignedInState> {
        self.state.signed_in().copied()
    }

    fn update_regions(&mut self, update: impl FnOnce(&mut SignedInState)) {
        if let AuthState::SignedIn(regions) = &mut self.state {
            update(regions);
        }
    }

    fn current_access_token(&self) -> String {
        self.context
            .access_token()
            .map(str::to_string)
            .unwrap_or_default()
    }
}

fn change_failure(error: &ClassifiedError) -> ChangeOutcome {
    match error.category {
        ErrorCategory::Validation => ChangeOutcome::FailedValidation,
        ErrorCategory::Server | ErrorCategory::Network => ChangeOutcome::FailedServer,
    }
}

fn unexpected_response() -> ClassifiedError {
    classify(BackendError::new(
        500,
        "unexpected-response",
        "The token endpoint answered without a session",
    ))
}
