//! Agent-facing tool handlers
//!
//! Thin contract translation between tool requests and runtime calls:
//! validate the typed inputs, invoke the runtime, and shape the JSON
//! response envelopes. All validation happens before any DBGp command
//! is sent.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;

use crate::common::{Error, Result, ToolError};
use crate::session::state::available_actions;
use crate::session::{Session, SessionRuntime, SessionStatus};

/// Dispatch one tool request against the shared runtime
pub async fn dispatch(
    runtime: &Mutex<SessionRuntime>,
    tool: &str,
    arguments: Value,
) -> std::result::Result<Value, ToolError> {
    let mut runtime = runtime.lock().await;
    runtime.touch();
    runtime.drain_events().await;

    route(&mut runtime, tool, arguments)
        .await
        .map_err(|e| ToolError::from(&e))
}

async fn route(runtime: &mut SessionRuntime, tool: &str, arguments: Value) -> Result<Value> {
    match tool {
        "set_breakpoint" => set_breakpoint(runtime, parse_args(arguments)?).await,
        "start_debug_session" => start_debug_session(runtime, parse_args(arguments)?).await,
        "control_execution" => control_execution(runtime, parse_args(arguments)?).await,
        "inspect_variable" => inspect_variable(runtime, parse_args(arguments)?).await,
        "get_session_status" => Ok(get_session_status(runtime)),
        "query_history" => query_history(runtime, parse_args(arguments)?).await,
        other => Err(Error::validation(vec![format!("unknown tool '{other}'")])),
    }
}

fn parse_args<T: DeserializeOwned>(arguments: Value) -> Result<T> {
    serde_json::from_value(arguments)
        .map_err(|e| Error::validation(vec![format!("invalid arguments: {e}")]))
}

#[derive(Debug, Deserialize)]
struct SetBreakpointArgs {
    file: String,
    line: i64,
    condition: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StartArgs {
    command: String,
    #[serde(default)]
    stop_on_entry: bool,
    #[serde(default)]
    stop_on_exception: bool,
    working_directory: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ControlArgs {
    action: String,
}

#[derive(Debug, Deserialize)]
struct InspectArgs {
    name: String,
    filter: Option<String>,
    depth: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct HistoryArgs {
    variable_name: String,
    steps_ago: Option<i64>,
    limit: Option<i64>,
}

async fn set_breakpoint(runtime: &mut SessionRuntime, args: SetBreakpointArgs) -> Result<Value> {
    let mut issues = Vec::new();
    if args.file.trim().is_empty() {
        issues.push("file must not be empty".to_string());
    }
    if args.line < 1 {
        issues.push("line must be >= 1".to_string());
    }
    if !issues.is_empty() {
        return Err(Error::Validation { issues });
    }

    let breakpoint = runtime
        .set_breakpoint(&args.file, args.line as u32, args.condition)
        .await?;

    let mut shape = Map::new();
    shape.insert("file".to_string(), json!(breakpoint.local_file));
    shape.insert("line".to_string(), json!(breakpoint.line));
    if let Some(condition) = &breakpoint.condition {
        shape.insert("condition".to_string(), json!(condition));
    }

    Ok(json!({
        "success": true,
        "breakpoint": Value::Object(shape),
        "message": format!(
            "Breakpoint set at {}:{}{}",
            breakpoint.local_file,
            breakpoint.line,
            if breakpoint.id.is_some() { "" } else { " (deferred until the session starts)" },
        ),
        "hint": "Start execution with start_debug_session, then wait for the breakpoint to hit",
    }))
}

async fn start_debug_session(runtime: &mut SessionRuntime, args: StartArgs) -> Result<Value> {
    if args.command.trim().is_empty() {
        return Err(Error::validation(vec!["command must not be empty"]));
    }

    let working_directory = args.working_directory.as_ref().map(std::path::Path::new);
    runtime
        .start_session(
            &args.command,
            args.stop_on_entry,
            args.stop_on_exception,
            working_directory,
        )
        .await?;

    let session = runtime
        .session()
        .ok_or_else(|| Error::Internal("session missing after start".to_string()))?;
    let status = session.status;

    let message = match status {
        SessionStatus::Paused => match &session.location {
            Some(location) => format!("Paused at {}:{}", location.file, location.line),
            None => "Paused".to_string(),
        },
        SessionStatus::Running => {
            "Session started; execution is running (no breakpoint hit yet)".to_string()
        }
        SessionStatus::Stopped => "Debuggee finished before hitting a breakpoint".to_string(),
        other => format!("Session is {other}"),
    };
    let hint = match status {
        SessionStatus::Paused => {
            "Inspect variables with inspect_variable or step with control_execution"
        }
        SessionStatus::Running => {
            "Execution continues; check get_session_status or set more breakpoints for the next run"
        }
        _ => "Start a new session with start_debug_session",
    };

    let mut response = json!({
        "status": status.to_string(),
        "session_id": session.id,
        "message": message,
        "hint": hint,
    });
    attach_pause_fields(&mut response, session);
    Ok(response)
}

async fn control_execution(runtime: &mut SessionRuntime, args: ControlArgs) -> Result<Value> {
    const ACTIONS: &[&str] = &["step_over", "step_into", "step_out", "continue", "stop"];
    if !ACTIONS.contains(&args.action.as_str()) {
        return Err(Error::validation(vec![format!(
            "action must be one of {}",
            ACTIONS.join(", ")
        )]));
    }

    runtime.control_execution(&args.action).await?;

    let Some(session) = runtime.session() else {
        return Ok(json!({
            "status": "stopped",
            "action": args.action,
            "message": "Session stopped",
            "hint": "Start a new session with start_debug_session",
        }));
    };
    let status = session.status;

    let message = match status {
        SessionStatus::Paused => match &session.location {
            Some(location) => format!("Paused at {}:{}", location.file, location.line),
            None => "Paused".to_string(),
        },
        SessionStatus::Running => "Execution resumed; no break yet".to_string(),
        SessionStatus::Stopped => "Session ended".to_string(),
        other => format!("Session is {other}"),
    };
    let hint = match status {
        SessionStatus::Paused => "Inspect variables or keep stepping",
        SessionStatus::Running => "Wait and check get_session_status, or stop",
        _ => "Start a new session with start_debug_session",
    };

    let mut response = json!({
        "status": status.to_string(),
        "action": args.action,
        "message": message,
        "hint": hint,
    });
    attach_pause_fields(&mut response, session);
    Ok(response)
}

async fn inspect_variable(runtime: &mut SessionRuntime, args: InspectArgs) -> Result<Value> {
    let mut issues = Vec::new();
    if args.name.trim().is_empty() {
        issues.push("name must not be empty".to_string());
    }
    if let Some(depth) = args.depth {
        if !(1..=3).contains(&depth) {
            issues.push("depth must be between 1 and 3".to_string());
        }
    }
    if !issues.is_empty() {
        return Err(Error::Validation { issues });
    }

    runtime
        .inspect_variable(
            &args.name,
            args.depth.unwrap_or(1) as u32,
            None,
            args.filter.as_deref(),
        )
        .await
}

fn get_session_status(runtime: &SessionRuntime) -> Value {
    let Some(session) = runtime.session() else {
        return json!({
            "active": false,
            "available_actions": ["start_debug_session"],
        });
    };

    if session.is_pending() {
        return json!({
            "active": false,
            "status": "pending",
            "breakpoints": breakpoints_json(session),
            "available_actions": ["start_debug_session"],
        });
    }

    let mut response = json!({
        "active": !session.status.is_terminal(),
        "session_id": session.id,
        "status": session.status.to_string(),
        "started_at": session.started_at.to_rfc3339(),
        "last_activity": session.last_activity_at.to_rfc3339(),
        "breakpoints": breakpoints_json(session),
        "available_actions": available_actions(session.status),
    });
    attach_pause_fields(&mut response, session);
    if let Some(error_message) = &session.error_message {
        response["error_message"] = json!(error_message);
    }
    response
}

async fn query_history(runtime: &mut SessionRuntime, args: HistoryArgs) -> Result<Value> {
    let mut issues = Vec::new();
    if args.variable_name.trim().is_empty() {
        issues.push("variable_name must not be empty".to_string());
    }
    let steps_ago = args.steps_ago.unwrap_or(1);
    if steps_ago < 0 {
        issues.push("steps_ago must be >= 0".to_string());
    }
    let limit = args.limit.unwrap_or(5);
    if !(1..=20).contains(&limit) {
        issues.push("limit must be between 1 and 20".to_string());
    }
    if !issues.is_empty() {
        return Err(Error::Validation { issues });
    }

    let history = runtime
        .get_history(&args.variable_name, steps_ago as u32, limit as u32)
        .await?;

    let message = if history.is_empty() {
        format!(
            "No recorded values of {} at or before the requested step",
            args.variable_name
        )
    } else {
        format!(
            "{} recorded value(s) of {}, newest first",
            history.len(),
            args.variable_name
        )
    };

    Ok(json!({
        "variable": args.variable_name,
        "steps_ago": steps_ago,
        "history": history,
        "message": message,
    }))
}

fn attach_pause_fields(response: &mut Value, session: &Session) {
    if let Some(location) = &session.location {
        response["location"] = json!(location);
    }
    if let Some(snippet) = &session.code_snippet {
        response["code_snippet"] = json!(snippet);
    }
    if let Some(reason) = session.pause_reason {
        response["pause_reason"] = json!(reason.as_str());
    }
    if let Some(raw) = &session.raw_reason {
        response["raw_reason"] = json!(raw);
    }
    if let Some(exception) = &session.exception {
        response["exception"] = json!(exception);
    }
}

fn breakpoints_json(session: &Session) -> Value {
    let list: Vec<Value> = session
        .breakpoints
        .values()
        .map(|bp| {
            let mut entry = Map::new();
            entry.insert("file".to_string(), json!(bp.local_file));
            entry.insert("line".to_string(), json!(bp.line));
            if let Some(condition) = &bp.condition {
                entry.insert("condition".to_string(), json!(condition));
            }
            Value::Object(entry)
        })
        .collect();
    json!({ "count": list.len(), "list": list })
}
