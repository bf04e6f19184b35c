//! Type definitions for the session engine
//!
//! Identifiers, the session and user model with its wire and persisted
//! forms, engine options, and the events exchanged with the machine.

pub mod events;
pub mod identifiers;
pub mod options;
pub mod session;

pub use events::{AuthChange, AuthChangeEvent, AuthEvent};
pub use identifiers::{RefreshTokenId, UserId};
pub use options::{
    AuthOptions, ChangeEmailOptions, PasswordlessOptions, SignUpOptions, rewrite_redirect_to,
};
pub use session::{
    DecodedAccessToken, HASURA_CLAIMS_NAMESPACE, MAX_ACCESS_TOKEN_LIFETIME, MfaChallenge,
    PersistedSessionRecord, Session, SessionPayload, User,
};
