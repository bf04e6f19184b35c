//! The auth state machine
//!
//! - [`state`]: hierarchical state as a tagged union
//! - [`context`]: data carried between events
//! - [`transition`]: the pure `(snapshot, input) -> (snapshot, effects)` step
//!
//! The machine itself does nothing; [`AuthClient`](crate::AuthClient) feeds
//! it inputs one at a time and carries out the effects.

pub mod context;
pub mod state;
pub mod transition;

pub use context::{
    AuthSnapshot, MachineContext, OperationId, OperationKind, PendingOperation, TimerId,
    TokenImport, TokenSource,
};
pub use state::{
    AuthState, AuthenticatingState, ChangeOutcome, ChangeState, Failure, RefreshTimerState,
    SignedInState, SignedOutState,
};
pub use transition::{Effect, Input, ServiceOutput, transition};
