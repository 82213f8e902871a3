//! Session state machine and orchestration

pub mod runtime;
pub mod state;

pub use runtime::SessionRuntime;
pub use state::{
    available_actions, Breakpoint, PauseReason, Session, SessionStatus, SourceLocation,
    PENDING_SESSION_ID,
};
