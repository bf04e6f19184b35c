//! Error types for the Hasura Auth session engine
//!
//! Backend failures (wrong credentials, revoked refresh tokens, network
//! outages) are *not* represented here: they are classified into
//! [`ClassifiedError`](crate::classify::ClassifiedError) values and stored in
//! the machine context. `AuthError` covers failures of the engine itself.

use std::time::Duration;
use thiserror::Error;

/// Main error type for the session engine
#[derive(Error, Debug)]
pub enum AuthError {
    /// I/O error while reading or writing the persisted session
    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while (de)serializing the persisted session
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Storage backend failure that is not plain I/O
    #[error("Storage error: {0}")]
    Storage(String),

    /// HTTP client could not be constructed
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// Token gate gave up waiting for a valid access token
    #[error(
        "Timed out after {}ms waiting for a valid access token\nSuggestion: Increase the timeout or use the stale-token fallback",
        waited.as_millis()
    )]
    TokenTimeout {
        /// How long the caller waited
        waited: Duration,
    },

    /// The client has been disposed and no longer processes events
    #[error("Auth client disposed. Create a new client before issuing further events.")]
    Disposed,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Access token could not be decoded
    #[error("Invalid access token: {0}")]
    InvalidToken(String),
}

/// Result type alias for session engine operations
pub type Result<T> = std::result::Result<T, AuthError>;

impl AuthError {
    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a token timeout error
    #[must_use]
    pub fn token_timeout(waited: Duration) -> Self {
        Self::TokenTimeout { waited }
    }

    /// Create a disposed error
    #[must_use]
    pub fn disposed() -> Self {
        Self::Disposed
    }

    /// Create an invalid configuration error
    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    /// Create an invalid token error
    pub fn invalid_token(msg: impl Into<String>) -> Self {
        Self::InvalidToken(msg.into())
    }
}
