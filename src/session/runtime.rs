//! Session runtime
//!
//! Central coordinator: owns the session record, the DBGp link, the
//! ledger, and the path mapper, and drives the session state machine.
//! At most one agent operation is in flight at a time (the runtime lives
//! behind a mutex); break and close events are drained at the start of
//! every operation so a break always precedes the agent's next
//! observation of the paused state.

use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::common::{Config, Error, Result};
use crate::dbgp::{
    BreakEvent, BreakpointKind, BreakpointSpec, DbgpLink, LinkEvent,
};
use crate::inspect::{self, FilterOutcome};
use crate::ledger::{HistoryEntry, Ledger, StepLocation};
use crate::pathmap::{normalize, PathMapper};

use super::state::{
    Breakpoint, PauseReason, Session, SessionStatus, SourceLocation,
};

/// How long the start sequence waits for the first break before
/// reporting the session as still running
const FIRST_BREAK_WAIT: Duration = Duration::from_secs(5);

/// Grace period for the best-effort `stop` command during shutdown
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Absolute ceiling on inspection depth regardless of configuration
const ABSOLUTE_MAX_DEPTH: u32 = 10;

pub struct SessionRuntime {
    config: Config,
    mapper: Option<PathMapper>,
    session: Option<Session>,
    link: Option<DbgpLink>,
    ledger: Option<Ledger>,
    stopping: bool,
    last_activity: Arc<StdMutex<Instant>>,
    watchdog: Option<JoinHandle<()>>,
    self_ref: Weak<Mutex<SessionRuntime>>,
}

impl SessionRuntime {
    /// Create the shared runtime handle used by tool dispatch and the
    /// watchdog task
    pub fn shared(config: Config) -> Arc<Mutex<SessionRuntime>> {
        Arc::new_cyclic(|weak| {
            Mutex::new(Self {
                config,
                mapper: None,
                session: None,
                link: None,
                ledger: None,
                stopping: false,
                last_activity: Arc::new(StdMutex::new(Instant::now())),
                watchdog: None,
                self_ref: weak.clone(),
            })
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Record agent activity: resets the watchdog deadline
    pub fn touch(&mut self) {
        *self.last_activity.lock().unwrap() = Instant::now();
        if let Some(session) = self.session.as_mut() {
            session.touch();
        }
    }

    /// Process any break/close events that arrived while idle
    pub async fn drain_events(&mut self) {
        loop {
            let event = match self.link.as_mut() {
                Some(link) => link.try_next_event(),
                None => None,
            };
            match event {
                Some(LinkEvent::Break(ev)) => self.handle_break(ev).await,
                Some(LinkEvent::Closed) => self.stop_session("debuggee disconnected").await,
                None => break,
            }
        }
    }

    fn ensure_mappings(&mut self) {
        if self.mapper.is_none() {
            self.mapper = Some(PathMapper::load(&self.config));
        }
    }

    /// Register or overwrite a breakpoint
    ///
    /// Creates a pending session when none exists; registers with the
    /// debuggee immediately when connected, otherwise defers to start.
    pub async fn set_breakpoint(
        &mut self,
        file: &str,
        line: u32,
        condition: Option<String>,
    ) -> Result<Breakpoint> {
        self.drain_events().await;
        self.ensure_mappings();

        let needs_fresh = match &self.session {
            None => true,
            Some(session) => session.status.is_terminal(),
        };
        if needs_fresh {
            self.session = Some(Session::pending());
        }

        let remote_file = self
            .mapper
            .as_ref()
            .map(|m| m.to_remote(file))
            .unwrap_or_else(|| file.to_string());
        let mut breakpoint = Breakpoint {
            local_file: file.to_string(),
            line,
            condition,
            remote_file,
            id: None,
        };

        let key = (file.to_string(), line);
        let old_id = self
            .session
            .as_ref()
            .and_then(|s| s.breakpoints.get(&key))
            .and_then(|b| b.id);

        if let Some(link) = self.link.as_mut() {
            if link.is_connected() {
                if let Some(old) = old_id {
                    let _ = link.remove_breakpoint(old).await;
                }
                breakpoint.id = Some(link.set_breakpoint(breakpoint_spec(&breakpoint)).await?);
            }
        }

        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::Internal("session vanished".to_string()))?;
        session.breakpoints.insert(key, breakpoint.clone());
        tracing::info!(
            file = %breakpoint.local_file,
            line = breakpoint.line,
            registered = breakpoint.id.is_some(),
            "breakpoint set"
        );
        Ok(breakpoint)
    }

    /// Run the session start sequence
    pub async fn start_session(
        &mut self,
        command: &str,
        stop_on_entry: bool,
        stop_on_exception: bool,
        working_directory: Option<&Path>,
    ) -> Result<()> {
        match self
            .try_start(command, stop_on_entry, stop_on_exception, working_directory)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!("session start failed: {e}");
                if let Some(link) = self.link.as_mut() {
                    link.close();
                }
                self.link = None;
                if let Some(mut ledger) = self.ledger.take() {
                    if let Some(session) = &self.session {
                        if !session.is_pending() {
                            let _ = ledger.finalize_session(&session.id);
                        }
                    }
                    ledger.close();
                }
                if let Some(session) = self.session.as_mut() {
                    session.status = SessionStatus::Error;
                    session.error_message = Some(e.to_string());
                }
                Err(e)
            }
        }
    }

    async fn try_start(
        &mut self,
        command: &str,
        stop_on_entry: bool,
        stop_on_exception: bool,
        working_directory: Option<&Path>,
    ) -> Result<()> {
        if let Some(session) = &self.session {
            if !session.is_pending() && !session.status.is_terminal() {
                return Err(Error::SessionAlreadyActive);
            }
        }

        self.ensure_mappings();

        // Breakpoints accumulated on a pending session carry over
        let carried = match self.session.take() {
            Some(session) if session.is_pending() => session.breakpoints,
            _ => Default::default(),
        };
        let session_id = Uuid::new_v4().to_string();
        let mut session = Session::new(session_id.clone(), SessionStatus::Initializing);
        session.breakpoints = carried;
        session.expect_entry = stop_on_entry;
        self.session = Some(session);
        tracing::info!(session_id = %session_id, "starting debug session");

        let ledger = Ledger::open(&self.config.data_dir())?;
        ledger.init_session(&session_id)?;
        self.ledger = Some(ledger);

        let command_timeout = Duration::from_secs(self.config.connection_timeout_secs);
        let mut link =
            DbgpLink::bind(self.config.port, self.config.port_range_end, command_timeout).await?;
        self.set_status(SessionStatus::Listening);

        link.execute_trigger(command, working_directory)?;
        link.wait_for_connection(command_timeout).await?;
        self.set_status(SessionStatus::Connected);
        self.link = Some(link);

        self.register_all_breakpoints().await;

        if stop_on_exception {
            let outcome = {
                let link = self.link.as_mut().expect("link just set");
                link.break_on_exception("*").await
            };
            if let Err(e) = outcome {
                tracing::warn!("failed to set exception breakpoint: {e}");
            }
        }

        let verb = if stop_on_entry { "step_into" } else { "run" };
        {
            let link = self.link.as_mut().expect("link just set");
            link.send_async(verb, &[]).await?;
        }
        self.set_status(SessionStatus::Running);
        self.arm_watchdog();

        // Execution may legitimately run past the first-break window
        let outcome = {
            let link = self.link.as_mut().expect("link just set");
            link.wait_for_break(FIRST_BREAK_WAIT).await
        };
        match outcome {
            Ok(event) => self.handle_break(event).await,
            Err(Error::ConnectionTimeout(_)) => {
                tracing::debug!("no break within the initial window, still running");
            }
            Err(Error::NotConnected(_)) => {
                self.stop_session("debuggee finished before first break").await;
            }
            Err(e) => return Err(e),
        }

        Ok(())
    }

    async fn register_all_breakpoints(&mut self) {
        let Some(link) = self.link.as_mut() else { return };
        let Some(session) = self.session.as_mut() else { return };

        for breakpoint in session.breakpoints.values_mut() {
            match link.set_breakpoint(breakpoint_spec(breakpoint)).await {
                Ok(id) => breakpoint.id = Some(id),
                Err(e) => tracing::warn!(
                    file = %breakpoint.local_file,
                    line = breakpoint.line,
                    "failed to register breakpoint: {e}"
                ),
            }
        }
    }

    /// Inspect a variable in the paused frame
    pub async fn inspect_variable(
        &mut self,
        name: &str,
        depth: u32,
        max_children: Option<u32>,
        filter: Option<&str>,
    ) -> Result<Value> {
        self.drain_events().await;
        self.ensure_paused()?;

        let depth = depth
            .clamp(1, self.config.max_depth.max(1))
            .min(ABSOLUTE_MAX_DEPTH);
        let max_children = max_children.unwrap_or(self.config.default_max_children);

        let fetched = {
            let link = self
                .link
                .as_mut()
                .ok_or_else(|| Error::NotConnected("no debuggee connection".to_string()))?;
            link.get_property(name, depth, max_children).await?
        };

        let Some(var) = fetched else {
            return Ok(json!({
                "variable": name,
                "found": false,
                "error": format!("Variable {name} not found in the current scope"),
                "hint": "Check the name; locals are only visible inside their function",
            }));
        };

        if let (Some(session), Some(ledger)) = (self.session.as_ref(), self.ledger.as_ref()) {
            if !session.is_pending() {
                let location = session
                    .location
                    .as_ref()
                    .map(step_location)
                    .unwrap_or_default();
                if let Err(e) = ledger.record_variable(
                    &session.id,
                    session.step,
                    &location,
                    name,
                    &inspect::to_plain_value(&var),
                ) {
                    tracing::warn!("failed to record variable snapshot: {e}");
                }
            }
        }

        match filter {
            Some(filter) => match inspect::apply_filter(&var, filter) {
                FilterOutcome::Value(value) => Ok(json!({
                    "variable": name,
                    "filter": filter,
                    "type": var.var_type,
                    "value": value,
                    "truncated": false,
                })),
                FilterOutcome::Diagnostic(diagnostic) => Ok(diagnostic),
            },
            None if var.is_compound() => {
                let mut response = json!({
                    "variable": name,
                    "type": var.var_type,
                    "structure": inspect::structural_summary(&var),
                    "hint": "Pass a filter like $.items[*].sku to extract values",
                });
                if let Some(classname) = &var.classname {
                    response["classname"] = json!(classname);
                }
                Ok(response)
            }
            None => Ok(json!({
                "variable": name,
                "type": var.var_type,
                "value": inspect::to_plain_value(&var),
            })),
        }
    }

    /// Query the ledger for past values of a variable
    pub async fn get_history(
        &mut self,
        name: &str,
        steps_ago: u32,
        limit: u32,
    ) -> Result<Vec<HistoryEntry>> {
        self.drain_events().await;
        let session = self.session.as_ref().ok_or(Error::NoActiveSession)?;
        if session.is_pending() {
            return Err(Error::NoActiveSession);
        }
        if session.status.is_terminal() {
            return Err(Error::SessionStopped);
        }

        let ledger = self
            .ledger
            .as_ref()
            .ok_or_else(|| Error::Internal("ledger unavailable".to_string()))?;
        let from_step = session.step.saturating_sub(steps_ago);
        ledger.get_variable_history(&session.id, name, from_step, limit)
    }

    /// Execute a stepping action, `continue`, or `stop`
    pub async fn control_execution(&mut self, action: &str) -> Result<()> {
        self.drain_events().await;

        if action == "stop" {
            if self.session.is_none() {
                return Err(Error::NoActiveSession);
            }
            self.stop_session("user requested stop").await;
            return Ok(());
        }

        let verb = match action {
            "continue" => "run",
            "step_over" | "step_into" | "step_out" => action,
            other => {
                return Err(Error::validation(vec![format!(
                    "unknown action '{other}'"
                )]))
            }
        };

        {
            let session = self.session.as_mut().ok_or(Error::NoActiveSession)?;
            if session.is_pending() {
                return Err(Error::NoActiveSession);
            }
            if session.status.is_terminal() {
                return Err(Error::SessionStopped);
            }

            let link = self
                .link
                .as_mut()
                .ok_or_else(|| Error::NotConnected("no debuggee connection".to_string()))?;
            link.send_async(verb, &[]).await?;

            session.status = SessionStatus::Running;
            session.pause_reason = None;
            session.exception = None;
            session.touch();
        }
        *self.last_activity.lock().unwrap() = Instant::now();

        let wait = Duration::from_secs(self.config.connection_timeout_secs);
        let outcome = {
            let link = self.link.as_mut().expect("link checked above");
            link.wait_for_break(wait).await
        };
        match outcome {
            Ok(event) => {
                self.handle_break(event).await;
                Ok(())
            }
            Err(Error::ConnectionTimeout(_)) => Ok(()),
            Err(Error::NotConnected(_)) => {
                self.stop_session("debuggee finished").await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Handle one break event: advance the step counter, translate the
    /// location, annotate it, record the step, and pause the session
    async fn handle_break(&mut self, event: BreakEvent) {
        if self.session.is_none() {
            return;
        }

        let function = {
            match self.link.as_mut() {
                Some(link) => link
                    .get_stack_frames()
                    .await
                    .ok()
                    .and_then(|frames| frames.into_iter().next())
                    .and_then(|frame| frame.r#where),
                None => None,
            }
        };

        let absolute = self
            .mapper
            .as_ref()
            .map(|m| m.to_local(&event.remote_filename))
            .unwrap_or_else(|| event.remote_filename.clone());
        let display_path = self.relativize(&absolute);
        let snippet = read_snippet(Path::new(&absolute), event.lineno);

        let session = self.session.as_mut().expect("session checked above");
        session.step += 1;
        let reason = if session.expect_entry {
            session.expect_entry = false;
            PauseReason::Entry
        } else {
            PauseReason::from_dbgp(&event.reason)
        };

        session.status = SessionStatus::Paused;
        session.location = Some(SourceLocation {
            file: display_path.clone(),
            line: event.lineno,
            function: function.clone(),
        });
        session.code_snippet = snippet;
        session.pause_reason = Some(reason);
        session.raw_reason = Some(event.reason.clone());
        session.exception = event.exception.clone();
        session.touch();

        let session_id = session.id.clone();
        let step = session.step;
        let pending = session.is_pending();
        tracing::info!(
            file = %display_path,
            line = event.lineno,
            reason = %reason,
            step,
            "debuggee paused"
        );

        if !pending {
            if let Some(ledger) = self.ledger.as_ref() {
                let location = StepLocation {
                    file: display_path,
                    line: event.lineno,
                    function,
                };
                if let Err(e) = ledger.record_step(&session_id, step, &location, reason.as_str()) {
                    tracing::warn!("failed to record step: {e}");
                }
            }
        }

        *self.last_activity.lock().unwrap() = Instant::now();
    }

    /// Best-effort stop sequence; re-entrant calls are no-ops
    pub async fn stop_session(&mut self, why: &str) {
        if self.stopping {
            return;
        }
        self.stopping = true;
        tracing::info!(reason = why, "stopping session");

        if let Some(link) = self.link.as_mut() {
            if link.is_connected() {
                let _ = tokio::time::timeout(STOP_GRACE, link.send_command("stop", &[], None)).await;
            }
            link.close();
        }
        self.link = None;

        let finalize_id = self
            .session
            .as_ref()
            .filter(|s| !s.is_pending())
            .map(|s| s.id.clone());
        if let Some(mut ledger) = self.ledger.take() {
            if let Some(session_id) = &finalize_id {
                if let Err(e) = ledger.finalize_session(session_id) {
                    tracing::warn!("failed to finalize ledger: {e}");
                }
            }
            ledger.close();
        }

        if let Some(session) = self.session.as_mut() {
            if !session.status.is_terminal() {
                session.status = SessionStatus::Stopped;
            }
            session.touch();
        }

        // The watchdog loop exits on its own once the session is terminal
        self.watchdog = None;
        self.stopping = false;
    }

    fn arm_watchdog(&mut self) {
        let weak = self.self_ref.clone();
        let last_activity = Arc::clone(&self.last_activity);
        let idle = Duration::from_millis(self.config.watchdog_timeout_ms);
        *last_activity.lock().unwrap() = Instant::now();

        self.watchdog = Some(tokio::spawn(async move {
            loop {
                let deadline = *last_activity.lock().unwrap() + idle;
                let now = Instant::now();
                if now < deadline {
                    tokio::time::sleep(deadline - now).await;
                    continue;
                }

                let Some(runtime) = weak.upgrade() else { return };
                let mut runtime = runtime.lock().await;
                let active = runtime
                    .session
                    .as_ref()
                    .map_or(false, |s| !s.status.is_terminal() && !s.is_pending());
                if !active {
                    return;
                }
                if Instant::now() >= *runtime.last_activity.lock().unwrap() + idle {
                    tracing::warn!(idle_ms = idle.as_millis() as u64, "watchdog expired, stopping idle session");
                    runtime.stop_session("watchdog timeout").await;
                    return;
                }
            }
        }));
    }

    fn set_status(&mut self, status: SessionStatus) {
        if let Some(session) = self.session.as_mut() {
            session.status = status;
            tracing::debug!(%status, "session status");
        }
    }

    fn ensure_paused(&self) -> Result<()> {
        let session = self.session.as_ref().ok_or(Error::NoActiveSession)?;
        if session.is_pending() {
            return Err(Error::NoActiveSession);
        }
        match session.status {
            SessionStatus::Paused => Ok(()),
            status if status.is_terminal() => Err(Error::SessionStopped),
            status => Err(Error::SessionNotPaused {
                status: status.to_string(),
            }),
        }
    }

    /// Strip the project root from an absolute local path for display
    fn relativize(&self, path: &str) -> String {
        let root = normalize(&self.config.project_root().to_string_lossy());
        let normalized = normalize(path);
        match normalized.strip_prefix(&format!("{root}/")) {
            Some(relative) => relative.to_string(),
            None => normalized,
        }
    }
}

fn breakpoint_spec(breakpoint: &Breakpoint) -> BreakpointSpec {
    BreakpointSpec {
        kind: if breakpoint.condition.is_some() {
            BreakpointKind::Conditional
        } else {
            BreakpointKind::Line
        },
        file_uri: Some(format!("file://{}", breakpoint.remote_file)),
        lineno: Some(breakpoint.line),
        exception: None,
        expression: breakpoint.condition.clone(),
    }
}

fn step_location(location: &SourceLocation) -> StepLocation {
    StepLocation {
        file: location.file.clone(),
        line: location.line,
        function: location.function.clone(),
    }
}

/// Read a 3-line context snippet around the given line, best-effort
fn read_snippet(path: &Path, line: u32) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let lines: Vec<&str> = content.lines().collect();
    if line == 0 || lines.is_empty() {
        return None;
    }

    let target = line as usize;
    let first = target.saturating_sub(1).max(1);
    let last = (target + 1).min(lines.len());
    if first > lines.len() {
        return None;
    }

    let mut out = String::new();
    for number in first..=last {
        let marker = if number == target { ">" } else { " " };
        out.push_str(&format!(
            "{marker} {number:>4} | {}\n",
            lines.get(number - 1).unwrap_or(&"")
        ));
    }
    Some(out)
}
