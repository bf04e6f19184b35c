//! Token gate for dependent HTTP clients
//!
//! A [`TokenGate`] hands out access tokens that are valid for at least the
//! configured margin, or `None` when the user is signed out. While the
//! machine is authenticating or refreshing, callers wait on the published
//! snapshots; the actor wakes them as soon as a new token is available, so
//! there is no fixed polling interval.
//!
//! # Example
//!
//! ```no_run
//! use hasura_auth_session::gate::{OnTimeout, TokenWait};
//! use hasura_auth_session::{AuthClient, AuthOptions};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = AuthClient::new(
//!     AuthOptions::builder().backend_url("https://local.auth.nhost.run/v1").build(),
//! )?;
//! let gate = client.token_gate();
//!
//! // GraphQL request, unauthenticated if signed out
//! let request = reqwest::Client::new().post("https://local.graphql.nhost.run/v1");
//! let response = gate.authorize(request).await.send().await?;
//! println!("{}", response.status());
//!
//! // Storage upload that must not wait longer than two seconds
//! let wait = TokenWait::new()
//!     .timeout(Duration::from_secs(2))
//!     .on_timeout(OnTimeout::Error);
//! let token = gate.get_valid_access_token_with(wait).await?;
//! println!("authenticated: {}", token.is_some());
//! # Ok(())
//! # }
//! ```

use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::client::Command;
use crate::error::{AuthError, Result};
use crate::machine::{AuthSnapshot, AuthState, RefreshTimerState};
use crate::types::AuthEvent;

/// What to do when a wait times out before a valid token appears
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OnTimeout {
    /// Resolve with the last known token, even if expired (or `None`)
    #[default]
    StaleToken,
    /// Fail with `AuthError::TokenTimeout`
    Error,
}

/// How long to wait for a valid token, and what to do after
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TokenWait {
    /// Upper bound on the wait; `None` waits until the machine settles
    pub timeout: Option<Duration>,
    /// Policy once `timeout` elapses
    pub on_timeout: OnTimeout,
}

impl TokenWait {
    /// Wait without a timeout
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Give up after `timeout`
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the timeout policy
    #[must_use]
    pub fn on_timeout(mut self, on_timeout: OnTimeout) -> Self {
        self.on_timeout = on_timeout;
        self
    }
}

/// Token availability as seen in one snapshot
#[derive(Clone, PartialEq, Eq)]
pub enum TokenStatus {
    /// A token valid beyond the margin
    Ready(String),
    /// No session, and none is being obtained
    SignedOut,
    /// Signed in, but the token has expired and nothing can refresh it
    Expired,
    /// A token is expected; `stale` is the current one, if any
    Pending {
        /// Expired (or nearly expired) token of the current session
        stale: Option<String>,
    },
}

impl std::fmt::Debug for TokenStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready(_) => f.write_str("Ready(..)"),
            Self::SignedOut => f.write_str("SignedOut"),
            Self::Expired => f.write_str("Expired"),
            Self::Pending { stale } => f
                .debug_struct("Pending")
                .field("stale", &stale.as_ref().map(|_| ".."))
                .finish(),
        }
    }
}

impl TokenStatus {
    /// Classify `snapshot` at `now`
    ///
    /// ```
    /// use hasura_auth_session::gate::TokenStatus;
    /// use hasura_auth_session::machine::AuthSnapshot;
    /// use std::time::Duration;
    /// use tokio::time::Instant;
    ///
    /// let status = TokenStatus::of(&AuthSnapshot::default(), Instant::now(), Duration::ZERO);
    /// assert_eq!(status, TokenStatus::Pending { stale: None });
    /// ```
    #[must_use]
    pub fn of(snapshot: &AuthSnapshot, now: Instant, margin: Duration) -> Self {
        match &snapshot.state {
            AuthState::SignedOut(_) => Self::SignedOut,
            AuthState::Starting | AuthState::Authenticating(_) | AuthState::Registering => {
                Self::Pending { stale: None }
            }
            AuthState::SignedIn(regions) => {
                let Some(session) = snapshot.session() else {
                    return Self::SignedOut;
                };
                if session.is_valid_at(now, margin) {
                    Self::Ready(session.access_token.clone())
                } else if regions.refresh_timer == RefreshTimerState::Stopped {
                    Self::Expired
                } else {
                    Self::Pending {
                        stale: Some(session.access_token.clone()),
                    }
                }
            }
        }
    }
}

/// Whether an expired token in `snapshot` would never be refreshed unless
/// someone asks
fn needs_refresh_request(snapshot: &AuthSnapshot) -> bool {
    snapshot.state.signed_in().is_some_and(|regions| {
        matches!(
            regions.refresh_timer,
            RefreshTimerState::Idle | RefreshTimerState::Disabled
        )
    })
}

/// Shared access point to the current access token
///
/// Cheap to clone; every dependent client can hold its own copy.
#[derive(Clone)]
pub struct TokenGate {
    snapshots: watch::Receiver<AuthSnapshot>,
    commands: mpsc::UnboundedSender<Command>,
    margin: Duration,
}

impl TokenGate {
    pub(crate) fn new(
        snapshots: watch::Receiver<AuthSnapshot>,
        commands: mpsc::UnboundedSender<Command>,
        margin: Duration,
    ) -> Self {
        Self {
            snapshots,
            commands,
            margin,
        }
    }

    /// Token availability right now, without waiting
    #[must_use]
    pub fn current(&self) -> TokenStatus {
        TokenStatus::of(&self.snapshots.borrow(), Instant::now(), self.margin)
    }

    /// Wait for a valid access token; `None` means signed out
    ///
    /// Never resolves with an expired token. Waits as long as a token is
    /// expected, and resolves with `None` if the client is disposed.
    pub async fn get_valid_access_token(&self) -> Option<String> {
        self.get_valid_access_token_with(TokenWait::new())
            .await
            .ok()
            .flatten()
    }

    /// Wait for a valid access token under the `wait` policy
    ///
    /// # Errors
    ///
    /// Returns `AuthError::TokenTimeout` if the timeout elapses and the
    /// policy is [`OnTimeout::Error`].
    pub async fn get_valid_access_token_with(&self, wait: TokenWait) -> Result<Option<String>> {
        let started = Instant::now();
        let deadline = wait.timeout.map(|timeout| started + timeout);
        let mut snapshots = self.snapshots.clone();
        let mut refresh_requested = false;

        loop {
            let (status, needs_refresh) = {
                let snapshot = snapshots.borrow_and_update();
                (
                    TokenStatus::of(&snapshot, Instant::now(), self.margin),
                    needs_refresh_request(&snapshot),
                )
            };

            let stale = match status {
                TokenStatus::Ready(token) => return Ok(Some(token)),
                TokenStatus::SignedOut | TokenStatus::Expired => return Ok(None),
                TokenStatus::Pending { stale } => stale,
            };

            if needs_refresh && !refresh_requested {
                tracing::debug!("Access token expired with no refresh scheduled, requesting one");
                let command = Command::Event {
                    event: AuthEvent::RefreshSession,
                    reply: None,
                };
                if self.commands.send(command).is_err() {
                    return Ok(None);
                }
                refresh_requested = true;
            }

            let changed = match deadline {
                Some(deadline) => {
                    match tokio::time::timeout_at(deadline, snapshots.changed()).await {
                        Ok(changed) => changed,
                        Err(_) => return Self::timed_out(wait.on_timeout, stale, started),
                    }
                }
                None => snapshots.changed().await,
            };
            if changed.is_err() {
                tracing::debug!("Auth client disposed while waiting for a token");
                return Ok(None);
            }
        }
    }

    fn timed_out(
        policy: OnTimeout,
        stale: Option<String>,
        started: Instant,
    ) -> Result<Option<String>> {
        let waited = started.elapsed();
        match policy {
            OnTimeout::StaleToken => {
                tracing::warn!(
                    waited_ms = waited.as_millis(),
                    has_token = stale.is_some(),
                    "Timed out waiting for a valid token, using the last known one"
                );
                Ok(stale)
            }
            OnTimeout::Error => Err(AuthError::token_timeout(waited)),
        }
    }

    /// Attach `Authorization: Bearer` to `request` when a valid token is
    /// available; leave it unauthenticated otherwise
    pub async fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.get_valid_access_token().await {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

impl std::fmt::Debug for TokenGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGate")
            .field("status", &self.current())
            .field("margin", &self.margin)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::{
        AuthenticatingState, ChangeOutcome, ChangeState, Failure, MachineContext, SignedInState,
        SignedOutState,
    };
    use crate::types::{RefreshTokenId, Session, SessionPayload, User};

    fn signed_in(expires_in: u64, refresh_timer: RefreshTimerState) -> AuthSnapshot {
        let session = Session::from_payload(
            SessionPayload {
                access_token: "access-1".to_string(),
                access_token_expires_in: expires_in,
                refresh_token: "refresh-1".to_string(),
                refresh_token_id: RefreshTokenId::new("rt-1"),
                user: User::default(),
            },
            Instant::now(),
        );
        let mut context = MachineContext::default();
        context.session = Some(session);
        AuthSnapshot {
            state: AuthState::SignedIn(SignedInState {
                refresh_timer,
                change_email: ChangeState::Idle(ChangeOutcome::NoErrors),
                change_password: ChangeState::Idle(ChangeOutcome::NoErrors),
            }),
            context,
        }
    }

    fn gate_for(
        snapshot: AuthSnapshot,
    ) -> (
        TokenGate,
        watch::Sender<AuthSnapshot>,
        mpsc::UnboundedReceiver<Command>,
    ) {
        let (snapshots_tx, snapshots_rx) = watch::channel(snapshot);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        (
            TokenGate::new(snapshots_rx, commands_tx, Duration::from_secs(5)),
            snapshots_tx,
            commands_rx,
        )
    }

    #[test]
    fn test_status_of_snapshots() {
        let now = Instant::now();
        let margin = Duration::from_secs(5);

        let snapshot = signed_in(900, RefreshTimerState::Pending);
        assert_eq!(
            TokenStatus::of(&snapshot, now, margin),
            TokenStatus::Ready("access-1".to_string())
        );

        let snapshot = signed_in(3, RefreshTimerState::Refreshing);
        assert_eq!(
            TokenStatus::of(&snapshot, now, margin),
            TokenStatus::Pending {
                stale: Some("access-1".to_string())
            }
        );

        let snapshot = signed_in(0, RefreshTimerState::Stopped);
        assert_eq!(TokenStatus::of(&snapshot, now, margin), TokenStatus::Expired);

        let snapshot = AuthSnapshot {
            state: AuthState::SignedOut(SignedOutState::NoErrors),
            ..Default::default()
        };
        assert_eq!(TokenStatus::of(&snapshot, now, margin), TokenStatus::SignedOut);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_token_resolves_immediately() {
        let (gate, _snapshots, _commands) = gate_for(signed_in(900, RefreshTimerState::Pending));
        assert_eq!(gate.get_valid_access_token().await.as_deref(), Some("access-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_authentication() {
        let snapshot = AuthSnapshot {
            state: AuthState::Authenticating(AuthenticatingState::Password),
            ..Default::default()
        };
        let (gate, snapshots, _commands) = gate_for(snapshot);

        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.get_valid_access_token().await }
        });
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!waiter.is_finished());

        snapshots.send_replace(signed_in(900, RefreshTimerState::Pending));
        assert_eq!(waiter.await.unwrap().as_deref(), Some("access-1"));
    }

    #[tokio::test]
    async fn test_waiter_wakes_when_sign_in_fails() {
        let snapshot = AuthSnapshot {
            state: AuthState::Authenticating(AuthenticatingState::Password),
            ..Default::default()
        };
        let (gate, snapshots, _commands) = gate_for(snapshot);

        let mut waiter = tokio_test::task::spawn(gate.get_valid_access_token());
        tokio_test::assert_pending!(waiter.poll());

        snapshots.send_replace(AuthSnapshot {
            state: AuthState::SignedOut(SignedOutState::Failed(Failure::Server)),
            ..Default::default()
        });
        assert!(waiter.is_woken());
        assert_eq!(tokio_test::assert_ready!(waiter.poll()), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_policies() {
        let (gate, _snapshots, _commands) = gate_for(signed_in(2, RefreshTimerState::Refreshing));

        let stale = gate
            .get_valid_access_token_with(TokenWait::new().timeout(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(stale.as_deref(), Some("access-1"));

        let err = gate
            .get_valid_access_token_with(
                TokenWait::new()
                    .timeout(Duration::from_secs(1))
                    .on_timeout(OnTimeout::Error),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::TokenTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_idle_session_requests_refresh() {
        let (gate, snapshots, mut commands) = gate_for(signed_in(0, RefreshTimerState::Idle));

        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.get_valid_access_token().await }
        });

        let Some(Command::Event { event, .. }) = commands.recv().await else {
            panic!("expected a refresh request");
        };
        assert_eq!(event, AuthEvent::RefreshSession);

        snapshots.send_replace(signed_in(900, RefreshTimerState::Pending));
        assert_eq!(waiter.await.unwrap().as_deref(), Some("access-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_channel_resolves_none() {
        let snapshot = AuthSnapshot::default();
        let (gate, snapshots, _commands) = gate_for(snapshot);

        let waiter = tokio::spawn({
            let gate = gate.clone();
            async move { gate.get_valid_access_token().await }
        });
        tokio::task::yield_now().await;
        drop(snapshots);
        assert_eq!(waiter.await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_authorize_leaves_signed_out_requests_alone() {
        let snapshot = AuthSnapshot {
            state: AuthState::SignedOut(SignedOutState::NoErrors),
            ..Default::default()
        };
        let (gate, _snapshots, _commands) = gate_for(snapshot);

        let request = gate
            .authorize(reqwest::Client::new().get("http://localhost/graphql"))
            .await
            .build()
            .unwrap();
        assert!(request.headers().get(reqwest::header::AUTHORIZATION).is_none());

        let (gate, _snapshots, _commands) = gate_for(signed_in(900, RefreshTimerState::Pending));
        let request = gate
            .authorize(reqwest::Client::new().get("http://localhost/graphql"))
            .await
            .build()
            .unwrap();
        assert_eq!(
            request.headers()[reqwest::header::AUTHORIZATION],
            "Bearer access-1"
        );
    }
}
