//! `AuthClient`: the actor that runs the auth machine
//!
//! The client owns one background task that processes every input strictly
//! one at a time: events from the application, refresh timer fires, and the
//! completions of requests it issued itself.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        AuthClient                          │
//! │                                                            │
//! │  send()/dispatch() ──┐                                     │
//! │  TokenGate ──────────┼──> commands ─┐                      │
//! │                      │              ▼                      │
//! │  RefreshScheduler ───┴─> timers ─> Actor ──> transition()  │
//! │  spawned requests ─────> completions ─┘        │           │
//! │                                                ▼           │
//! │                         effects: requests, persistence,    │
//! │                         timer arm/disarm, notifications    │
//! │                                                │           │
//! │     snapshots (watch) <────────────────────────┤           │
//! │     changes (broadcast) <──────────────────────┘           │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! Nothing outside the actor writes the machine context; readers see it
//! through the published [`AuthSnapshot`].
//!
//! # Example
//!
//! ```no_run
//! use hasura_auth_session::{AuthClient, AuthOptions};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let options = AuthOptions::builder()
//!     .backend_url("https://local.auth.nhost.run/v1")
//!     .build();
//! let client = AuthClient::new(options)?;
//!
//! let snapshot = client
//!     .sign_in_email_password("jane@example.com", "correct horse")
//!     .await?;
//! println!("state: {}", snapshot.state);
//!
//! let gate = client.token_gate();
//! if let Some(token) = gate.get_valid_access_token().await {
//!     println!("token: {} bytes", token.len());
//! }
//!
//! // waits for the background revocation of a sign-out, if any
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

use futures::Stream;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::backend::{AuthBackend, BackendResult, EmailChange, HttpBackend, SignInOutcome};
use crate::callbacks::{AuthStateCallback, TokenChangedCallback};
use crate::classify::{BackendError, classify};
use crate::error::{AuthError, Result};
use crate::gate::TokenGate;
use crate::machine::{
    AuthSnapshot, AuthState, Effect, Input, OperationId, RefreshTimerState, ServiceOutput,
    TimerId, transition,
};
use crate::persistence::{MemoryPersistence, PersistenceAdapter};
use crate::scheduler::RefreshScheduler;
use crate::types::{
    AuthChange, AuthEvent, AuthOptions, ChangeEmailOptions, DecodedAccessToken,
    PasswordlessOptions, PersistedSessionRecord, Session, SessionPayload, SignUpOptions, User,
};

/// Capacity of the auth change broadcast channel
const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Request sent to the actor
pub(crate) enum Command {
    /// Process an application event, optionally replying with the snapshot
    /// right after it
    Event {
        event: AuthEvent,
        reply: Option<oneshot::Sender<AuthSnapshot>>,
    },
}

/// Whether the user is signed in, and whether that may be about to change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticationStatus {
    /// A session is present
    pub is_authenticated: bool,
    /// Start-up, authentication or registration is still in progress
    pub is_loading: bool,
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`AuthClient`], for choosing the backend and persistence
pub struct AuthClientBuilder {
    options: AuthOptions,
    backend: Option<Arc<dyn AuthBackend>>,
    persistence: Option<Arc<dyn PersistenceAdapter>>,
}

impl AuthClientBuilder {
    /// Use `backend` instead of the HTTP backend
    #[must_use]
    pub fn backend<B: AuthBackend + 'static>(mut self, backend: B) -> Self {
        self.backend = Some(Arc::new(backend));
        self
    }

    /// Use `persistence` instead of in-memory storage
    #[must_use]
    pub fn persistence<P: PersistenceAdapter + 'static>(mut self, persistence: P) -> Self {
        self.persistence = Some(Arc::new(persistence));
        self
    }

    /// Validate the options and start the actor
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidConfig` for unusable options, or
    /// `AuthError::Http` if the default HTTP backend cannot be built.
    pub fn build(self) -> Result<AuthClient> {
        self.options.validate()?;

        let backend = match self.backend {
            Some(backend) => backend,
            None => Arc::new(HttpBackend::from_options(&self.options)?),
        };
        let persistence = self
            .persistence
            .unwrap_or_else(|| Arc::new(MemoryPersistence::new()));

        Ok(AuthClient::spawn(self.options, backend, persistence))
    }
}

// ============================================================================
// Client
// ============================================================================

/// Handle to a running auth machine
///
/// Dropping the client (or calling [`dispose`](Self::dispose)) stops the
/// actor: the refresh timer is cancelled, in-flight requests are abandoned,
/// and token gates resolve with `None`. Refresh token revocations started by
/// a sign-out still run to completion; [`shutdown`](Self::shutdown) waits
/// for them.
pub struct AuthClient {
    options: Arc<AuthOptions>,
    commands: mpsc::UnboundedSender<Command>,
    snapshots: watch::Receiver<AuthSnapshot>,
    changes: broadcast::Sender<AuthChange>,
    cancellation_token: CancellationToken,
    tasks: TaskTracker,
}

impl AuthClient {
    /// Start a client with the HTTP backend and in-memory persistence
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::InvalidConfig` for unusable options.
    pub fn new(options: AuthOptions) -> Result<Self> {
        Self::builder(options).build()
    }

    /// Start configuring a client
    #[must_use]
    pub fn builder(options: AuthOptions) -> AuthClientBuilder {
        AuthClientBuilder {
            options,
            backend: None,
            persistence: None,
        }
    }

    fn spawn(
        options: AuthOptions,
        backend: Arc<dyn AuthBackend>,
        persistence: Arc<dyn PersistenceAdapter>,
    ) -> Self {
        let options = Arc::new(options);
        let cancellation_token = CancellationToken::new();
        let tasks = TaskTracker::new();

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (timers_tx, timers_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (snapshots_tx, snapshots_rx) = watch::channel(AuthSnapshot::default());
        let (changes_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        let actor = Actor {
            snapshot: AuthSnapshot::default(),
            options: options.clone(),
            backend,
            persistence,
            scheduler: RefreshScheduler::new(timers_tx),
            snapshots: snapshots_tx,
            changes: changes_tx.clone(),
            completions: completions_tx,
            cancellation_token: cancellation_token.child_token(),
            tasks: tasks.clone(),
        };
        tasks.spawn(actor.run(commands_rx, timers_rx, completions_rx));

        Self {
            options,
            commands: commands_tx,
            snapshots: snapshots_rx,
            changes: changes_tx,
            cancellation_token,
            tasks,
        }
    }

    /// Options the client was started with
    #[must_use]
    pub fn options(&self) -> &AuthOptions {
        &self.options
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    /// Send `event` and return the snapshot right after it was processed
    ///
    /// Requests started by the event may still be in flight; use the
    /// convenience flows to wait for their outcome.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Disposed` if the client has been disposed.
    pub async fn send(&self, event: AuthEvent) -> Result<AuthSnapshot> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Event {
                event,
                reply: Some(reply),
            })
            .map_err(|_| AuthError::disposed())?;
        response.await.map_err(|_| AuthError::disposed())
    }

    /// Queue `event` without waiting for it to be processed
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Disposed` if the client has been disposed.
    pub fn dispatch(&self, event: AuthEvent) -> Result<()> {
        self.commands
            .send(Command::Event { event, reply: None })
            .map_err(|_| AuthError::disposed())
    }

    /// Send `event`, then wait until `done` holds for a published snapshot
    async fn send_and_wait(
        &self,
        event: AuthEvent,
        done: impl FnMut(&AuthSnapshot) -> bool,
    ) -> Result<AuthSnapshot> {
        self.send(event).await?;
        self.wait_for(done).await
    }

    async fn wait_for(&self, done: impl FnMut(&AuthSnapshot) -> bool) -> Result<AuthSnapshot> {
        let mut snapshots = self.snapshots.clone();
        let snapshot = snapshots
            .wait_for(done)
            .await
            .map_err(|_| AuthError::disposed())?;
        Ok(snapshot.clone())
    }

    // ------------------------------------------------------------------------
    // Convenience flows
    // ------------------------------------------------------------------------

    /// Wait until start-up has finished resuming (or failing to resume)
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Disposed` if the client has been disposed.
    pub async fn wait_until_ready(&self) -> Result<AuthSnapshot> {
        self.wait_for(|snapshot| !snapshot.state.is_loading()).await
    }

    /// Sign in with email and password and wait for the outcome
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Disposed` if the client has been disposed. A
    /// rejected sign-in is not an error: inspect the returned snapshot.
    pub async fn sign_in_email_password(
        &self,
        email: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<AuthSnapshot> {
        let event = AuthEvent::SignInPassword {
            email: email.into(),
            password: password.into(),
        };
        self.send_and_wait(event, |snapshot| snapshot.state.is_settled())
            .await
    }

    /// Request a magic link and wait for the outcome
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Disposed` if the client has been disposed.
    pub async fn sign_in_passwordless_email(
        &self,
        email: impl Into<String>,
        options: PasswordlessOptions,
    ) -> Result<AuthSnapshot> {
        let event = AuthEvent::SignInPasswordlessEmail {
            email: email.into(),
            options,
        };
        self.send_and_wait(event, |snapshot| snapshot.state.is_settled())
            .await
    }

    /// Sign in as a new anonymous user and wait for the outcome
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Disposed` if the client has been disposed.
    pub async fn sign_in_anonymous(&self) -> Result<AuthSnapshot> {
        self.send_and_wait(AuthEvent::SignInAnonymous, |snapshot| {
            snapshot.state.is_settled()
        })
        .await
    }

    /// Answer a TOTP second-factor challenge and wait for the outcome
    ///
    /// Without `ticket`, the one from the last `needsMfa` sign-in is used.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Disposed` if the client has been disposed.
    pub async fn sign_in_mfa_totp(
        &self,
        otp: impl Into<String>,
        ticket: Option<String>,
    ) -> Result<AuthSnapshot> {
        let event = AuthEvent::SignInMfaTotp {
            ticket,
            otp: otp.into(),
        };
        self.send_and_wait(event, |snapshot| snapshot.state.is_settled())
            .await
    }

    /// Register with email and password and wait for the outcome
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Disposed` if the client has been disposed.
    pub async fn sign_up_email_password(
        &self,
        email: impl Into<String>,
        password: impl Into<String>,
        options: SignUpOptions,
    ) -> Result<AuthSnapshot> {
        let event = AuthEvent::Register {
            email: email.into(),
            password: password.into(),
            options,
        };
        self.send_and_wait(event, |snapshot| snapshot.state.is_settled())
            .await
    }

    /// Exchange `refresh_token` for a session and wait for the outcome
    ///
    /// While signed in, the current session is kept until the exchange
    /// succeeds; a failure is reported in `token_error` of the context.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Disposed` if the client has been disposed.
    pub async fn import_refresh_token(
        &self,
        refresh_token: impl Into<String>,
    ) -> Result<AuthSnapshot> {
        let event = AuthEvent::TryToken {
            refresh_token: refresh_token.into(),
        };
        self.send_and_wait(event, |snapshot| {
            snapshot.state.is_settled() && !snapshot.is_importing_token()
        })
        .await
    }

    /// Replace the session with one obtained outside the client
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Disposed` if the client has been disposed.
    pub async fn set_session(&self, session: SessionPayload) -> Result<AuthSnapshot> {
        self.send(AuthEvent::SessionUpdate { session }).await
    }

    /// Sign out locally, revoking the refresh token in the background
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Disposed` if the client has been disposed.
    pub async fn sign_out(&self, all: bool) -> Result<AuthSnapshot> {
        self.send_and_wait(AuthEvent::SignOut { all }, |snapshot| {
            snapshot.state.is_settled()
        })
        .await
    }

    /// Refresh the access token now and wait for the outcome
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Disposed` if the client has been disposed.
    pub async fn refresh_session(&self) -> Result<AuthSnapshot> {
        self.send_and_wait(AuthEvent::RefreshSession, |snapshot| {
            snapshot
                .state
                .signed_in()
                .is_none_or(|regions| regions.refresh_timer != RefreshTimerState::Refreshing)
        })
        .await
    }

    /// Change the user's email and wait for the outcome
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Disposed` if the client has been disposed.
    pub async fn change_email(
        &self,
        new_email: impl Into<String>,
        options: ChangeEmailOptions,
    ) -> Result<AuthSnapshot> {
        let event = AuthEvent::ChangeEmail {
            new_email: new_email.into(),
            options,
        };
        self.send_and_wait(event, |snapshot| {
            snapshot
                .state
                .signed_in()
                .is_none_or(|regions| !regions.change_email.is_running())
        })
        .await
    }

    /// Change the user's password and wait for the outcome
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Disposed` if the client has been disposed.
    pub async fn change_password(&self, new_password: impl Into<String>) -> Result<AuthSnapshot> {
        let event = AuthEvent::ChangePassword {
            new_password: new_password.into(),
        };
        self.send_and_wait(event, |snapshot| {
            snapshot
                .state
                .signed_in()
                .is_none_or(|regions| !regions.change_password.is_running())
        })
        .await
    }

    // ------------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------------

    /// Latest published snapshot
    #[must_use]
    pub fn snapshot(&self) -> AuthSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Latest published state
    #[must_use]
    pub fn state(&self) -> AuthState {
        self.snapshots.borrow().state.clone()
    }

    /// Current session
    #[must_use]
    pub fn session(&self) -> Option<Session> {
        self.snapshots.borrow().context.session.clone()
    }

    /// Current user
    #[must_use]
    pub fn user(&self) -> Option<User> {
        self.snapshots
            .borrow()
            .session()
            .map(|session| session.user.clone())
    }

    /// Current access token, without any validity check
    ///
    /// Dependent clients should use [`TokenGate`] instead.
    #[must_use]
    pub fn access_token(&self) -> Option<String> {
        self.snapshots
            .borrow()
            .context
            .access_token()
            .map(str::to_string)
    }

    /// Whether a session is present
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.snapshots.borrow().is_authenticated()
    }

    /// Authentication and loading flags, read from the same snapshot
    #[must_use]
    pub fn authentication_status(&self) -> AuthenticationStatus {
        let snapshot = self.snapshots.borrow();
        AuthenticationStatus {
            is_authenticated: snapshot.is_authenticated(),
            is_loading: snapshot.state.is_loading(),
        }
    }

    /// Decoded payload of the current access token
    #[must_use]
    pub fn decoded_access_token(&self) -> Option<DecodedAccessToken> {
        let snapshot = self.snapshots.borrow();
        let session = snapshot.session()?;
        match session.decoded_access_token() {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                tracing::debug!(error = %e, "Access token is not a decodable JWT");
                None
            }
        }
    }

    /// Hasura claim `name` of the current access token
    ///
    /// The `x-hasura-` prefix is optional: `"user-id"` and
    /// `"x-hasura-user-id"` look up the same claim.
    #[must_use]
    pub fn hasura_claim(&self, name: &str) -> Option<serde_json::Value> {
        self.decoded_access_token()?.hasura_claim(name).cloned()
    }

    /// Receiver of every published snapshot
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AuthSnapshot> {
        self.snapshots.clone()
    }

    /// Stream of auth changes, ending when the client is disposed
    ///
    /// Changes published before the call are not replayed.
    #[must_use = "auth_changes returns a stream that must be consumed"]
    pub fn auth_changes(&self) -> impl Stream<Item = AuthChange> + Send + 'static {
        let mut changes = self.changes.subscribe();
        let token = self.cancellation_token.child_token();
        async_stream::stream! {
            loop {
                let received = tokio::select! {
                    () = token.cancelled() => break,
                    received = changes.recv() => received,
                };
                match received {
                    Ok(change) => yield change,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Auth change stream lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    /// Call `callback` on every auth change until unsubscribed
    pub fn on_auth_state_changed<C>(&self, callback: C) -> ListenerHandle
    where
        C: AuthStateCallback + 'static,
    {
        let callback = Arc::new(callback);
        self.spawn_listener("auth_state", move |change| {
            let callback = callback.clone();
            async move { callback.call(change.event, change.session).await }
        })
    }

    /// Call `callback` whenever the access token changes until unsubscribed
    ///
    /// Signing in, refreshing and signing out all change the token.
    pub fn on_token_changed<C>(&self, callback: C) -> ListenerHandle
    where
        C: TokenChangedCallback + 'static,
    {
        let callback = Arc::new(callback);
        self.spawn_listener("token", move |change| {
            let callback = callback.clone();
            async move { callback.call(change.session).await }
        })
    }

    fn spawn_listener<F, Fut>(&self, kind: &'static str, invoke: F) -> ListenerHandle
    where
        F: Fn(AuthChange) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut changes = self.changes.subscribe();
        let token = self.cancellation_token.child_token();
        let timeout = self.options.listener_timeout;

        let task = tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    () = token.cancelled() => break,
                    received = changes.recv() => received,
                };
                let change = match received {
                    Ok(change) => change,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(listener = kind, skipped, "Listener lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let event = change.event;
                if tokio::time::timeout(timeout, invoke(change)).await.is_err() {
                    tracing::warn!(
                        listener = kind,
                        event = %event,
                        timeout_ms = timeout.as_millis(),
                        "Listener timed out"
                    );
                }
            }
        });

        ListenerHandle { task }
    }

    // ------------------------------------------------------------------------
    // Dependent clients and lifecycle
    // ------------------------------------------------------------------------

    /// Token gate for dependent HTTP clients
    #[must_use]
    pub fn token_gate(&self) -> TokenGate {
        TokenGate::new(
            self.snapshots.clone(),
            self.commands.clone(),
            self.options.token_validity_margin,
        )
    }

    /// Stop the actor and every listener
    ///
    /// Pending token gate waits resolve with `None`; later calls fail with
    /// `AuthError::Disposed`. The persisted record is left untouched.
    pub fn dispose(&self) {
        self.cancellation_token.cancel();
    }

    /// Dispose the client and wait for its background tasks to finish
    ///
    /// Unlike [`dispose`](Self::dispose), this returns only once pending
    /// refresh token revocations have completed or timed out, so a process
    /// may exit right after it.
    pub async fn shutdown(&self) {
        self.cancellation_token.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        tracing::debug!("Auth client shut down");
    }

    /// Whether [`dispose`](Self::dispose) has been called
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}

impl Drop for AuthClient {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

impl std::fmt::Debug for AuthClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthClient")
            .field("backend_url", &self.options.backend_url)
            .field("state", &self.snapshots.borrow().state)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

/// Subscription created by [`AuthClient::on_auth_state_changed`] or
/// [`AuthClient::on_token_changed`]
///
/// Dropping the handle leaves the listener running until the client is
/// disposed; call [`unsubscribe`](Self::unsubscribe) to stop it earlier.
#[derive(Debug)]
pub struct ListenerHandle {
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Stop delivering changes to the listener
    pub fn unsubscribe(self) {
        self.task.abort();
    }

    /// Whether the listener is still receiving changes
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

// ============================================================================
// Actor
// ============================================================================

struct Actor {
    snapshot: AuthSnapshot,
    options: Arc<AuthOptions>,
    backend: Arc<dyn AuthBackend>,
    persistence: Arc<dyn PersistenceAdapter>,
    scheduler: RefreshScheduler,
    snapshots: watch::Sender<AuthSnapshot>,
    changes: broadcast::Sender<AuthChange>,
    completions: mpsc::UnboundedSender<Input>,
    cancellation_token: CancellationToken,
    tasks: TaskTracker,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut timers: mpsc::UnboundedReceiver<TimerId>,
        mut completions: mpsc::UnboundedReceiver<Input>,
    ) {
        let start = self.load_persisted().await;
        self.process(start).await;

        loop {
            tokio::select! {
                biased;
                () = self.cancellation_token.cancelled() => break,
                Some(input) = completions.recv() => self.process(input).await,
                Some(timer) = timers.recv() => self.process(Input::TimerFired(timer)).await,
                command = commands.recv() => match command {
                    Some(Command::Event { event, reply }) => {
                        self.process(Input::Event(event)).await;
                        if let Some(reply) = reply {
                            // caller may have stopped waiting
                            let _ = reply.send(self.snapshot.clone());
                        }
                    }
                    None => break,
                },
            }
        }

        self.scheduler.disarm();
        tracing::debug!(state = %self.snapshot.state, "Auth actor stopped");
    }

    async fn load_persisted(&self) -> Input {
        match self.persistence.load().await {
            Ok(Some(record)) => {
                let age_secs = record.age_secs();
                tracing::debug!(age_secs, "Loaded persisted session");
                Input::Start {
                    persisted: Some(record),
                    age_secs,
                }
            }
            Ok(None) => Input::Start {
                persisted: None,
                age_secs: 0,
            },
            Err(e) => {
                tracing::warn!(error = %e, "Failed to load persisted session");
                Input::Start {
                    persisted: None,
                    age_secs: 0,
                }
            }
        }
    }

    /// Run `input` and every follow-up input its effects produce inline
    async fn process(&mut self, input: Input) {
        let mut queue = VecDeque::from([input]);

        while let Some(input) = queue.pop_front() {
            let name = input.name();
            let now = Instant::now();
            let previous = std::mem::take(&mut self.snapshot);
            let (next, effects) = transition(previous, input, &self.options, now);
            self.snapshot = next;

            tracing::debug!(
                input = name,
                state = %self.snapshot.state,
                effects = effects.len(),
                "Processed input"
            );

            let mut notifications = Vec::new();
            for effect in effects {
                tracing::trace!(effect = ?effect, "Executing effect");
                match effect {
                    Effect::Notify(event) => notifications.push(event),
                    Effect::PersistSession(session) => {
                        let record = PersistedSessionRecord::from_session(&session, now);
                        if let Err(e) = self.persistence.save(&record).await {
                            tracing::warn!(error = %e, "Failed to persist session");
                        }
                    }
                    Effect::ClearPersistedSession => {
                        if let Err(e) = self.persistence.clear().await {
                            tracing::warn!(error = %e, "Failed to clear persisted session");
                        }
                        queue.push_back(Input::PersistenceCleared);
                    }
                    Effect::ArmRefreshTimer { timer, delay } => self.scheduler.arm(timer, delay),
                    Effect::DisarmRefreshTimer => {
                        self.scheduler.disarm();
                    }
                    request => self.execute_request(request),
                }
            }

            self.snapshots.send_replace(self.snapshot.clone());
            for event in notifications {
                let change = AuthChange {
                    event,
                    session: self.snapshot.context.session.clone(),
                };
                tracing::debug!(event = %event, "Auth change");
                // no subscribers is fine
                let _ = self.changes.send(change);
            }
        }
    }

    fn execute_request(&self, effect: Effect) {
        let backend = self.backend.clone();
        match effect {
            Effect::SignInPassword {
                op,
                email,
                password,
            } => self.spawn_request(op, async move {
                backend
                    .sign_in_email_password(&email, &password)
                    .await
                    .map(|outcome| match outcome {
                        SignInOutcome::Session(session) => ServiceOutput::Session(session),
                        SignInOutcome::Mfa(challenge) => ServiceOutput::MfaRequired(challenge),
                        SignInOutcome::Unverified => ServiceOutput::VerificationRequired,
                    })
            }),
            Effect::SignInAnonymous { op } => self.spawn_request(op, async move {
                backend
                    .sign_in_anonymous()
                    .await
                    .map(ServiceOutput::Session)
            }),
            Effect::SignInMfaTotp { op, ticket, otp } => self.spawn_request(op, async move {
                backend
                    .sign_in_mfa_totp(&ticket, &otp)
                    .await
                    .map(ServiceOutput::Session)
            }),
            Effect::SignInPasswordlessEmail { op, email, options } => {
                self.spawn_request(op, async move {
                    backend
                        .sign_in_passwordless_email(&email, &options)
                        .await
                        .map(|()| ServiceOutput::Done)
                });
            }
            Effect::SignUp {
                op,
                email,
                password,
                options,
            } => self.spawn_request(op, async move {
                backend
                    .sign_up_email_password(&email, &password, &options)
                    .await
                    .map(session_or_verification)
            }),
            Effect::RefreshToken { op, refresh_token } => self.spawn_request(op, async move {
                backend
                    .refresh_token(&refresh_token)
                    .await
                    .map(ServiceOutput::Session)
            }),
            Effect::ChangeEmail {
                op,
                access_token,
                new_email,
                options,
            } => self.spawn_request(op, async move {
                backend
                    .change_email(&access_token, &new_email, &options)
                    .await
                    .map(|change| match change {
                        EmailChange::Changed => ServiceOutput::Done,
                        EmailChange::VerificationSent => ServiceOutput::VerificationRequired,
                    })
            }),
            Effect::ChangePassword {
                op,
                access_token,
                new_password,
            } => self.spawn_request(op, async move {
                backend
                    .change_password(&access_token, &new_password)
                    .await
                    .map(|()| ServiceOutput::Done)
            }),
            Effect::RevokeSession { refresh_token, all } => {
                let timeout = self.options.request_timeout;
                // tracked but not cancelled, so shutdown() can wait for it
                self.tasks.spawn(async move {
                    match tokio::time::timeout(timeout, backend.sign_out(&refresh_token, all)).await
                    {
                        Ok(Ok(())) => tracing::debug!(all, "Refresh token revoked"),
                        Ok(Err(e)) => tracing::warn!(error = %e, "Failed to revoke refresh token"),
                        Err(_) => tracing::warn!("Refresh token revocation timed out"),
                    }
                });
            }
            other => tracing::error!(effect = ?other, "Effect is not a request"),
        }
    }

    /// Run `request` in the background and feed its outcome back as a
    /// completion of `op`
    fn spawn_request<F>(&self, op: OperationId, request: F)
    where
        F: Future<Output = BackendResult<ServiceOutput>> + Send + 'static,
    {
        let completions = self.completions.clone();
        let token = self.cancellation_token.clone();
        let timeout = self.options.request_timeout;

        self.tasks.spawn(async move {
            let result = tokio::select! {
                () = token.cancelled() => return,
                result = tokio::time::timeout(timeout, request) => result,
            };
            let result = result.unwrap_or_else(|_| {
                Err(BackendError::new(
                    0,
                    "timeout",
                    format!("no response within {}ms", timeout.as_millis()),
                ))
            });
            if let Err(e) = &result {
                tracing::debug!(op = %op, error = %e, "Request failed");
            }
            // actor gone means the client was disposed
            let _ = completions.send(Input::Completed {
                op,
                result: result.map_err(classify),
            });
        });
    }
}

/// Sign-up answers without a session when the email must be verified first
fn session_or_verification(session: Option<SessionPayload>) -> ServiceOutput {
    session.map_or(ServiceOutput::VerificationRequired, ServiceOutput::Session)
}
