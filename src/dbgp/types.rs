//! DBGp protocol types
//!
//! Typed views over the XML messages exchanged with the debuggee.
//! See: https://xdebug.org/docs/dbgp

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A decoded variable, possibly with nested children
///
/// `value` is present only for leaves and carries the decoded scalar;
/// compound values carry `children` instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub var_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<VariableInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub classname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fullname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub numchildren: Option<u32>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

impl VariableInfo {
    /// Whether this is a compound value (object or array)
    pub fn is_compound(&self) -> bool {
        self.children.is_some() || self.numchildren.map_or(false, |n| n > 0)
    }
}

/// One frame from a `stack_get` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StackFrame {
    pub level: u32,
    #[serde(rename = "type")]
    pub frame_type: String,
    pub filename: String,
    pub lineno: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#where: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmdbegin: Option<String>,
}

/// Exception details attached to a break event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionInfo {
    pub name: String,
    pub message: String,
}

/// A break pushed by the debuggee
///
/// `reason` is the raw DBGp reason string; the session layer maps it to
/// a pause reason and keeps the raw value alongside for disambiguation.
#[derive(Debug, Clone)]
pub struct BreakEvent {
    pub remote_filename: String,
    pub lineno: u32,
    pub reason: String,
    pub exception: Option<ExceptionInfo>,
}

/// Events emitted by the link's socket dispatcher
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// The debuggee stopped at a line
    Break(BreakEvent),
    /// The debuggee reported stopped/stopping or the socket closed
    Closed,
}
