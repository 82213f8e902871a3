//! DBGp protocol implementation
//!
//! Client side of the DBGp wire protocol (length-prefixed XML over TCP)
//! spoken by XDebug-enabled interpreters.

pub mod codec;
pub mod link;
pub mod types;
pub mod xml;

pub use link::{BreakpointKind, BreakpointSpec, DbgpLink};
pub use types::{BreakEvent, ExceptionInfo, LinkEvent, StackFrame, VariableInfo};
