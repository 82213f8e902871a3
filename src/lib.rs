//! DBGp debugger bridge for LLM coding agents
//!
//! Exposes a small set of high-level debugging tools over a line-oriented
//! control transport and drives an XDebug-enabled interpreter over the
//! DBGp wire protocol, recording every step and inspected variable for
//! post-hoc history queries.

pub mod common;
pub mod dbgp;
pub mod inspect;
pub mod ledger;
pub mod pathmap;
pub mod server;
pub mod session;

// Re-export commonly used types for tests
pub use common::{Config, Error, Result, ToolError};
pub use session::{SessionRuntime, SessionStatus};
