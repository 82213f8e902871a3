//! Debug session state
//!
//! Status and pause-reason enums, the session record itself, and the
//! breakpoint registry keyed by `(file, line)`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dbgp::ExceptionInfo;

/// Sentinel id for a session created only to hold breakpoints before
/// `start_debug_session`; never persisted to the ledger
pub const PENDING_SESSION_ID: &str = "pending";

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initializing,
    Listening,
    Connected,
    Running,
    Paused,
    Stopped,
    Error,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Error)
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Initializing => "initializing",
            Self::Listening => "listening",
            Self::Connected => "connected",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Why the debuggee paused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    BreakpointHit,
    StepComplete,
    Exception,
    Entry,
    UserBreak,
}

impl PauseReason {
    /// Map a raw DBGp reason to the agent-facing enum
    ///
    /// The raw reason is kept alongside the mapped value in responses,
    /// since reasons outside this table all collapse to breakpoint_hit.
    pub fn from_dbgp(raw: &str) -> Self {
        match raw {
            "ok" => Self::StepComplete,
            "error" | "exception" => Self::Exception,
            _ => Self::BreakpointHit,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::BreakpointHit => "breakpoint_hit",
            Self::StepComplete => "step_complete",
            Self::Exception => "exception",
            Self::Entry => "entry",
            Self::UserBreak => "user_break",
        }
    }
}

impl std::fmt::Display for PauseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A registered or pending breakpoint
///
/// Identity is `(local_file, line)`; re-setting the same location
/// overwrites. `id` is unset until the debuggee confirms registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Breakpoint {
    pub local_file: String,
    pub line: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    pub remote_file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u32>,
}

/// Current source position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
}

/// The single debug session owned by the runtime
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub status: SessionStatus,
    pub breakpoints: BTreeMap<(String, u32), Breakpoint>,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub location: Option<SourceLocation>,
    pub code_snippet: Option<String>,
    pub pause_reason: Option<PauseReason>,
    /// Raw DBGp reason string from the last break
    pub raw_reason: Option<String>,
    pub exception: Option<ExceptionInfo>,
    pub error_message: Option<String>,
    /// Step counter; advances only on break events
    pub step: u32,
    /// First break should be classified as an entry pause
    pub expect_entry: bool,
}

impl Session {
    pub fn pending() -> Self {
        Self::new(PENDING_SESSION_ID.to_string(), SessionStatus::Initializing)
    }

    pub fn new(id: String, status: SessionStatus) -> Self {
        let now = Utc::now();
        Self {
            id,
            status,
            breakpoints: BTreeMap::new(),
            started_at: now,
            last_activity_at: now,
            location: None,
            code_snippet: None,
            pause_reason: None,
            raw_reason: None,
            exception: None,
            error_message: None,
            step: 0,
            expect_entry: false,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.id == PENDING_SESSION_ID
    }

    pub fn touch(&mut self) {
        self.last_activity_at = Utc::now();
    }
}

/// Agent operations that are valid in the given status
pub fn available_actions(status: SessionStatus) -> Vec<&'static str> {
    match status {
        SessionStatus::Paused => vec![
            "step_over",
            "step_into",
            "step_out",
            "continue",
            "stop",
            "inspect_variable",
        ],
        SessionStatus::Running | SessionStatus::Listening | SessionStatus::Connected => {
            vec!["stop"]
        }
        SessionStatus::Stopped | SessionStatus::Error => vec!["start_debug_session"],
        SessionStatus::Initializing => vec![],
    }
}
