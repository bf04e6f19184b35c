//! # Hasura Auth session engine
//!
//! Client-side session management for Hasura Auth: sign-in, sign-up and
//! sign-out, automatic access-token refresh, session persistence across
//! restarts, and a token gate that dependent HTTP clients share so they never
//! send an expired token.
//! Async/await, strong typing, tokio-based.
//!
//! ## Quick Start
//!
//! ```no_run
//! use hasura_auth_session::{AuthClient, AuthOptions, FilePersistence};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let options = AuthOptions::builder()
//!         .backend_url("https://local.auth.nhost.run/v1")
//!         .build();
//!     let client = AuthClient::builder(options)
//!         .persistence(FilePersistence::new())
//!         .build()?;
//!
//!     // resumes the persisted session, if any
//!     let snapshot = client.wait_until_ready().await?;
//!     if !snapshot.is_authenticated() {
//!         client
//!             .sign_in_email_password("jane@example.com", "correct horse")
//!             .await?;
//!     }
//!
//!     println!("state: {}", client.state());
//!     Ok(())
//! }
//! ```
//!
//! ## Core Features
//!
//! ### 1. A state machine with one writer
//!
//! The [`machine`] module holds the hierarchical auth state as a tagged union
//! and a pure [`transition`](machine::transition) function. The
//! [`AuthClient`] actor feeds it one input at a time and carries out the
//! effects it returns: requests, persistence, timer arming, notifications.
//!
//! ```no_run
//! # use hasura_auth_session::{AuthClient, AuthEvent};
//! # async fn example(client: AuthClient) -> Result<(), Box<dyn std::error::Error>> {
//! let snapshot = client
//!     .send(AuthEvent::SignInPassword {
//!         email: "bad-email".to_string(),
//!         password: "x".to_string(),
//!     })
//!     .await?;
//! assert!(snapshot.state.matches("signedOut.failed.validation.email"));
//! # Ok(())
//! # }
//! ```
//!
//! ### 2. Token gate for dependent clients
//!
//! GraphQL, storage and functions clients ask the [`TokenGate`] for a token
//! before each request. It waits while a sign-in or refresh is in flight and
//! resolves with `None` when the user is signed out:
//!
//! ```no_run
//! # use hasura_auth_session::AuthClient;
//! # async fn example(client: AuthClient) -> Result<(), Box<dyn std::error::Error>> {
//! let gate = client.token_gate();
//! let request = reqwest::Client::new().post("https://local.graphql.nhost.run/v1");
//! let response = gate.authorize(request).await.send().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ### 3. Change notifications
//!
//! ```no_run
//! # use hasura_auth_session::AuthClient;
//! # use hasura_auth_session::callbacks::FnAuthStateCallback;
//! # fn example(client: &AuthClient) {
//! let handle = client.on_auth_state_changed(FnAuthStateCallback::new(|event, _session| {
//!     Box::pin(async move { println!("auth change: {event}") })
//! }));
//! handle.unsubscribe();
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`types`]: identifiers, session and user model, options, events
//! - [`machine`]: state, context and the transition function
//! - [`client`]: the actor and its public API
//! - [`gate`]: token gate for dependent HTTP clients
//! - [`scheduler`]: refresh timer and delay policy
//! - [`backend`]: Hasura Auth network contract and HTTP implementation
//! - [`persistence`]: in-memory and file storage for the session record
//! - [`classify`]: backend error classification
//! - [`validators`]: local email and password checks
//! - [`callbacks`]: listener traits
//! - [`error`]: error types
//!
//! ## Logging
//!
//! This crate uses [`tracing`](https://crates.io/crates/tracing) for structured logging.
//! Tracing events are always emitted but are zero-cost when no subscriber is attached.
//! Tokens only ever appear redacted. To see logs, attach a tracing subscriber in your
//! application:
//!
//! ```rust,ignore
//! tracing_subscriber::fmt::init();
//! ```
//!
//! ## Error Handling
//!
//! Backend failures never surface as errors: they are classified and stored
//! in the machine context, and the state records the outcome. Client
//! operations return [`Result<T, AuthError>`](Result) only for local failures:
//!
//! ```no_run
//! # use hasura_auth_session::{AuthClient, AuthError};
//! # async fn example(client: AuthClient) {
//! match client.sign_out(false).await {
//!     Ok(snapshot) => println!("now {}", snapshot.state),
//!     Err(AuthError::Disposed) => eprintln!("client already disposed"),
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! # }
//! ```
//!
//! ## Requirements
//!
//! - Rust 1.85.0 or later
//! - A Tokio runtime

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod callbacks;
pub mod classify;
pub mod client;
pub mod error;
pub mod gate;
pub mod machine;
pub mod persistence;
pub mod scheduler;
pub mod types;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use backend::{AuthBackend, EmailChange, HttpBackend, SignInOutcome};
pub use callbacks::{
    AuthStateCallback, FnAuthStateCallback, FnTokenChangedCallback, SharedAuthStateCallback,
    SharedTokenChangedCallback, TokenChangedCallback,
};
pub use classify::{BackendError, ClassifiedError, ErrorCategory, ErrorField, classify};
pub use client::{AuthClient, AuthClientBuilder, AuthenticationStatus, ListenerHandle};
pub use error::{AuthError, Result};
pub use futures::StreamExt;
pub use gate::{OnTimeout, TokenGate, TokenStatus, TokenWait};
pub use machine::{AuthSnapshot, AuthState};
pub use persistence::{FilePersistence, MemoryPersistence, PersistenceAdapter};
pub use types::{
    AuthChange, AuthChangeEvent, AuthEvent, AuthOptions, ChangeEmailOptions, MfaChallenge,
    PasswordlessOptions, PersistedSessionRecord, RefreshTokenId, Session, SessionPayload,
    SignUpOptions, User, UserId,
};

/// Version of the crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
