//! Error types for the debugger bridge
//!
//! Error messages are designed to be clear and actionable for LLM agents:
//! every agent-visible error carries a stable string code, a recoverable
//! flag, and a hint advising the next step.

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the debugger bridge
#[derive(Error, Debug)]
pub enum Error {
    // === Session Errors ===
    #[error("No active debug session. Use 'start_debug_session' first")]
    NoActiveSession,

    #[error("A debug session is already active. Use control_execution with action 'stop' to end it")]
    SessionAlreadyActive,

    #[error("Session is not paused (status: {status}). Wait for a breakpoint to hit or step first")]
    SessionNotPaused { status: String },

    #[error("Session has ended. Start a new session with 'start_debug_session'")]
    SessionStopped,

    // === Connection Errors ===
    #[error("Timed out after {0} seconds waiting on the debuggee")]
    ConnectionTimeout(u64),

    #[error("No available port in range {start}-{end}")]
    NoAvailablePort { start: u16, end: u16 },

    #[error("Not connected to a debuggee: {0}")]
    NotConnected(String),

    // === Protocol Errors ===
    #[error("DBGp error {code}: {message}")]
    Dbgp { code: u32, message: String },

    #[error("DBGp protocol error: {0}")]
    Protocol(String),

    // === Input Errors ===
    #[error("Invalid input: {}", issues.join("; "))]
    Validation { issues: Vec<String> },

    #[error("Invalid filter expression: {message}")]
    InvalidFilter {
        message: String,
        available_keys: Vec<String>,
    },

    // === Configuration Errors ===
    #[error("Configuration error: {0}")]
    Config(String),

    // === Storage Errors ===
    #[error("Ledger error: {0}")]
    Ledger(#[from] rusqlite::Error),

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Internal Errors ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error from a list of issues
    pub fn validation<S: Into<String>>(issues: Vec<S>) -> Self {
        Self::Validation {
            issues: issues.into_iter().map(Into::into).collect(),
        }
    }

    /// Create a DBGp protocol error
    pub fn dbgp(code: u32, message: &str) -> Self {
        Self::Dbgp {
            code,
            message: message.to_string(),
        }
    }

    /// DBGp error code, if this is a debuggee-reported error
    pub fn dbgp_code(&self) -> Option<u32> {
        match self {
            Self::Dbgp { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Stable string code for the agent-facing envelope
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoActiveSession => "NO_ACTIVE_SESSION",
            Self::SessionAlreadyActive => "SESSION_ALREADY_ACTIVE",
            Self::SessionNotPaused { .. } => "SESSION_NOT_PAUSED",
            Self::SessionStopped => "SESSION_STOPPED",
            Self::ConnectionTimeout(_) => "CONNECTION_TIMEOUT",
            Self::NoAvailablePort { .. } => "NO_AVAILABLE_PORT",
            Self::NotConnected(_) => "NOT_CONNECTED",
            Self::Dbgp { .. } => "DBGP_ERROR",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::InvalidFilter { .. } => "INVALID_FILTER",
            _ => "UNKNOWN_ERROR",
        }
    }

    /// Whether the agent can correct this error and retry
    pub fn recoverable(&self) -> bool {
        !matches!(
            self,
            Self::Internal(_) | Self::Io(_) | Self::Json(_) | Self::Ledger(_) | Self::Protocol(_)
        )
    }

    /// Next-step hint included in every agent-facing error response
    pub fn hint(&self) -> String {
        match self {
            Self::NoActiveSession => {
                "Call start_debug_session with a trigger command first".to_string()
            }
            Self::SessionAlreadyActive => {
                "Stop the current session with control_execution action=stop".to_string()
            }
            Self::SessionNotPaused { .. } => {
                "Set a breakpoint and wait for it to hit, or use stop_on_entry".to_string()
            }
            Self::SessionStopped => "Start a new session with start_debug_session".to_string(),
            Self::ConnectionTimeout(_) => {
                "Check that the trigger command actually reaches the interpreter and that \
                 XDebug is installed with xdebug.mode=debug"
                    .to_string()
            }
            Self::NoAvailablePort { start, end } => {
                format!("Free a port in {start}-{end} or widen the configured port range")
            }
            Self::NotConnected(_) => "The debuggee disconnected; start a new session".to_string(),
            Self::Dbgp { .. } => {
                "The debuggee rejected the command; check the expression or location".to_string()
            }
            Self::Validation { .. } => "Fix the listed issues and retry".to_string(),
            Self::InvalidFilter { .. } => {
                "Use a path like $.key, $.items[0] or $.items[*].name; see available_keys"
                    .to_string()
            }
            _ => "Retry, or restart the bridge if the error persists".to_string(),
        }
    }
}

/// Agent-facing error envelope
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ToolError {
    pub error: String,
    pub code: String,
    pub recoverable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issues: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub available_keys: Option<Vec<String>>,
}

impl From<&Error> for ToolError {
    fn from(e: &Error) -> Self {
        let issues = match e {
            Error::Validation { issues } => Some(issues.clone()),
            _ => None,
        };
        let available_keys = match e {
            Error::InvalidFilter { available_keys, .. } => Some(available_keys.clone()),
            _ => None,
        };

        Self {
            error: e.to_string(),
            code: e.code().to_string(),
            recoverable: e.recoverable(),
            hint: Some(e.hint()),
            issues,
            available_keys,
        }
    }
}
