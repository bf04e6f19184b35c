//! Listener traits for auth change notifications
//!
//! [`AuthClient::on_auth_state_changed`](crate::AuthClient::on_auth_state_changed)
//! and [`AuthClient::on_token_changed`](crate::AuthClient::on_token_changed)
//! accept anything implementing these traits. Each invocation runs under the
//! client's listener timeout, so a slow listener cannot hold up the others.
//!
//! # Example
//!
//! ## Using a closure
//!
//! ```no_run
//! use hasura_auth_session::callbacks::FnAuthStateCallback;
//!
//! let listener = FnAuthStateCallback::new(|event, session| {
//!     Box::pin(async move {
//!         let user = session.map(|session| session.user.id);
//!         println!("{event}: {user:?}");
//!     })
//! });
//! ```
//!
//! ## Using a struct
//!
//! ```no_run
//! use hasura_auth_session::callbacks::TokenChangedCallback;
//! use hasura_auth_session::types::Session;
//! use async_trait::async_trait;
//!
//! struct TokenMirror;
//!
//! #[async_trait]
//! impl TokenChangedCallback for TokenMirror {
//!     async fn call(&self, session: Option<Session>) {
//!         if let Some(session) = session {
//!             println!("new token for {}", session.user.id);
//!         }
//!     }
//! }
//! ```

use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::types::{AuthChangeEvent, Session};

/// Boxed future returned by closure listeners
pub type ListenerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Called on every auth change
#[async_trait]
pub trait AuthStateCallback: Send + Sync {
    /// Handle one change, with the session after it
    async fn call(&self, event: AuthChangeEvent, session: Option<Session>);
}

/// Called when the access token changes, including sign-in and sign-out
#[async_trait]
pub trait TokenChangedCallback: Send + Sync {
    /// Handle the new session (`None` after sign-out)
    async fn call(&self, session: Option<Session>);
}

#[async_trait]
impl AuthStateCallback for Box<dyn AuthStateCallback> {
    async fn call(&self, event: AuthChangeEvent, session: Option<Session>) {
        (**self).call(event, session).await;
    }
}

#[async_trait]
impl TokenChangedCallback for Box<dyn TokenChangedCallback> {
    async fn call(&self, session: Option<Session>) {
        (**self).call(session).await;
    }
}

#[async_trait]
impl<T: AuthStateCallback + ?Sized> AuthStateCallback for Arc<T> {
    async fn call(&self, event: AuthChangeEvent, session: Option<Session>) {
        (**self).call(event, session).await;
    }
}

#[async_trait]
impl<T: TokenChangedCallback + ?Sized> TokenChangedCallback for Arc<T> {
    async fn call(&self, session: Option<Session>) {
        (**self).call(session).await;
    }
}

/// Shared auth-state listener
pub type SharedAuthStateCallback = Arc<dyn AuthStateCallback>;

/// Shared token listener
pub type SharedTokenChangedCallback = Arc<dyn TokenChangedCallback>;

// ============================================================================
// Closure-based listeners
// ============================================================================

/// Wrapper to use a closure as an [`AuthStateCallback`]
pub struct FnAuthStateCallback<F>
where
    F: Fn(AuthChangeEvent, Option<Session>) -> ListenerFuture + Send + Sync,
{
    func: F,
}

impl<F> FnAuthStateCallback<F>
where
    F: Fn(AuthChangeEvent, Option<Session>) -> ListenerFuture + Send + Sync,
{
    /// Create a new closure listener.
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F> AuthStateCallback for FnAuthStateCallback<F>
where
    F: Fn(AuthChangeEvent, Option<Session>) -> ListenerFuture + Send + Sync,
{
    async fn call(&self, event: AuthChangeEvent, session: Option<Session>) {
        (self.func)(event, session).await;
    }
}

/// Wrapper to use a closure as a [`TokenChangedCallback`]
pub struct FnTokenChangedCallback<F>
where
    F: Fn(Option<Session>) -> ListenerFuture + Send + Sync,
{
    func: F,
}

impl<F> FnTokenChangedCallback<F>
where
    F: Fn(Option<Session>) -> ListenerFuture + Send + Sync,
{
    /// Create a new closure listener.
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F> TokenChangedCallback for FnTokenChangedCallback<F>
where
    F: Fn(Option<Session>) -> ListenerFuture + Send + Sync,
{
    async fn call(&self, session: Option<Session>) {
        (self.func)(session).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_closure_listener_is_invoked() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let listener = FnAuthStateCallback::new(move |event, session| {
            let counter = counter.clone();
            Box::pin(async move {
                assert_eq!(event, AuthChangeEvent::SignedOut);
                assert!(session.is_none());
                counter.fetch_add(1, Ordering::SeqCst);
            })
        });

        let shared: SharedAuthStateCallback = Arc::new(listener);
        shared.call(AuthChangeEvent::SignedOut, None).await;
        shared.call(AuthChangeEvent::SignedOut, None).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_boxed_token_listener() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let boxed: Box<dyn TokenChangedCallback> =
            Box::new(FnTokenChangedCallback::new(move |_session| {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
            }));

        boxed.call(None).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
