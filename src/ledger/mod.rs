//! Persistent step and variable ledger
//!
//! Append-only SQLite store backing post-hoc history queries: the live
//! debuggee cannot step backwards, so every break and every inspected
//! variable is recorded as it happens. Single writer, WAL journal,
//! prepared statements reused across the hot path.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use serde_json::{json, Value};

use crate::common::{Error, Result};

/// Maximum steps rendered in the summary's execution path block
const SUMMARY_PATH_CAP: usize = 50;

/// Integers beyond this magnitude are stored as decimal strings so
/// JSON consumers with double-precision numbers cannot corrupt them
const MAX_SAFE_INTEGER: i128 = 9_007_199_254_740_991;

/// Source position attached to steps and variable snapshots
#[derive(Debug, Clone, Default)]
pub struct StepLocation {
    pub file: String,
    pub line: u32,
    pub function: Option<String>,
}

/// One row from a variable history query
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub step: u32,
    pub value: Value,
    pub location: HistoryLocation,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryLocation {
    pub file: String,
    pub line: u32,
}

/// Durable session ledger under `<data-dir>/sessions.db`
pub struct Ledger {
    conn: Option<Connection>,
    data_dir: PathBuf,
}

impl Ledger {
    /// Open (creating the data dir and schema if needed)
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let conn = Connection::open(data_dir.join("sessions.db"))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;",
        )?;
        let ledger = Self {
            conn: Some(conn),
            data_dir: data_dir.to_path_buf(),
        };
        ledger.ensure_schema()?;
        Ok(ledger)
    }

    fn conn(&self) -> Result<&Connection> {
        self.conn
            .as_ref()
            .ok_or_else(|| Error::Internal("ledger already closed".to_string()))
    }

    fn ensure_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                 id TEXT PRIMARY KEY,
                 started_at TEXT NOT NULL,
                 ended_at TEXT,
                 total_steps INTEGER NOT NULL DEFAULT 0,
                 breakpoints_hit INTEGER NOT NULL DEFAULT 0,
                 exceptions_thrown INTEGER NOT NULL DEFAULT 0,
                 summary_md TEXT
             );
             CREATE TABLE IF NOT EXISTS steps (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 session_id TEXT NOT NULL REFERENCES sessions(id),
                 step_number INTEGER NOT NULL,
                 timestamp TEXT NOT NULL,
                 file TEXT NOT NULL,
                 line INTEGER NOT NULL,
                 function TEXT,
                 reason TEXT NOT NULL,
                 UNIQUE(session_id, step_number)
             );
             CREATE TABLE IF NOT EXISTS variables (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 session_id TEXT NOT NULL REFERENCES sessions(id),
                 step_number INTEGER NOT NULL,
                 timestamp TEXT NOT NULL,
                 file TEXT NOT NULL,
                 line INTEGER NOT NULL,
                 name TEXT NOT NULL,
                 value_json TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_variables_lookup
                 ON variables(session_id, name, step_number DESC);",
        )?;
        Ok(())
    }

    /// Insert a session header with `started_at = now`
    pub fn init_session(&self, session_id: &str) -> Result<()> {
        self.conn()?.execute(
            "INSERT OR IGNORE INTO sessions (id, started_at) VALUES (?1, ?2)",
            params![session_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Record one execution step and bump the session counters
    pub fn record_step(
        &self,
        session_id: &str,
        step: u32,
        location: &StepLocation,
        reason: &str,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.prepare_cached(
            "INSERT OR REPLACE INTO steps
                 (session_id, step_number, timestamp, file, line, function, reason)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )?
        .execute(params![
            session_id,
            step,
            Utc::now().to_rfc3339(),
            location.file,
            location.line,
            location.function,
            reason,
        ])?;

        let counter = if reason == "exception" {
            "exceptions_thrown"
        } else {
            "breakpoints_hit"
        };
        conn.execute(
            &format!(
                "UPDATE sessions SET
                     total_steps = (SELECT MAX(step_number) FROM steps WHERE session_id = ?1),
                     {counter} = {counter} + 1
                 WHERE id = ?1"
            ),
            params![session_id],
        )?;
        Ok(())
    }

    /// Record a variable snapshot against a step
    pub fn record_variable(
        &self,
        session_id: &str,
        step: u32,
        location: &StepLocation,
        name: &str,
        value: &Value,
    ) -> Result<()> {
        self.conn()?
            .prepare_cached(
                "INSERT INTO variables
                     (session_id, step_number, timestamp, file, line, name, value_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?
            .execute(params![
                session_id,
                step,
                Utc::now().to_rfc3339(),
                location.file,
                location.line,
                name,
                safe_stringify(value),
            ])?;
        Ok(())
    }

    /// Latest snapshots of `name` at or before `from_step`, newest first
    pub fn get_variable_history(
        &self,
        session_id: &str,
        name: &str,
        from_step: u32,
        limit: u32,
    ) -> Result<Vec<HistoryEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT step_number, value_json, file, line, timestamp
             FROM variables
             WHERE session_id = ?1 AND name = ?2 AND step_number <= ?3
             ORDER BY step_number DESC
             LIMIT ?4",
        )?;

        let rows = stmt.query_map(params![session_id, name, from_step, limit], |row| {
            let raw: String = row.get(1)?;
            Ok(HistoryEntry {
                step: row.get(0)?,
                value: serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
                location: HistoryLocation {
                    file: row.get(2)?,
                    line: row.get(3)?,
                },
                timestamp: row.get(4)?,
            })
        })?;

        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Set `ended_at`, compute the Markdown summary, store it in the
    /// session row and as `session_<first-8>_summary.md`
    pub fn finalize_session(&self, session_id: &str) -> Result<()> {
        let conn = self.conn()?;
        let ended_at = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE sessions SET ended_at = ?2 WHERE id = ?1",
            params![session_id, ended_at],
        )?;

        let summary = self.render_summary(session_id)?;
        conn.execute(
            "UPDATE sessions SET summary_md = ?2 WHERE id = ?1",
            params![session_id, summary],
        )?;

        let prefix: String = session_id.chars().take(8).collect();
        let path = self.data_dir.join(format!("session_{prefix}_summary.md"));
        if let Err(e) = std::fs::write(&path, &summary) {
            tracing::warn!(path = %path.display(), "failed to write session summary: {e}");
        } else {
            tracing::info!(path = %path.display(), "session summary written");
        }
        Ok(())
    }

    fn render_summary(&self, session_id: &str) -> Result<String> {
        let conn = self.conn()?;

        let header = conn
            .query_row(
                "SELECT started_at, ended_at, total_steps, breakpoints_hit, exceptions_thrown
                 FROM sessions WHERE id = ?1",
                params![session_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, u32>(2)?,
                        row.get::<_, u32>(3)?,
                        row.get::<_, u32>(4)?,
                    ))
                },
            )
            .optional()?;
        let Some((started_at, ended_at, total_steps, breakpoints_hit, exceptions_thrown)) = header
        else {
            return Err(Error::Internal(format!("unknown session {session_id}")));
        };

        let duration = duration_secs(&started_at, ended_at.as_deref());

        let mut stmt = conn.prepare(
            "SELECT step_number, file, line, function, reason
             FROM steps WHERE session_id = ?1 ORDER BY step_number ASC",
        )?;
        let steps: Vec<(u32, String, u32, Option<String>, String)> = stmt
            .query_map(params![session_id], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })?
            .collect::<std::result::Result<_, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT DISTINCT name FROM variables WHERE session_id = ?1 ORDER BY name",
        )?;
        let variables: Vec<String> = stmt
            .query_map(params![session_id], |row| row.get(0))?
            .collect::<std::result::Result<_, _>>()?;

        let mut md = String::new();
        md.push_str("# Debug Session Summary\n\n");
        md.push_str(&format!("- **Session**: `{session_id}`\n"));
        md.push_str(&format!("- **Started**: {started_at}\n"));
        md.push_str(&format!("- **Duration**: {duration}s\n\n"));

        md.push_str("## Statistics\n\n");
        md.push_str("| Metric | Value |\n|---|---|\n");
        md.push_str(&format!("| Total steps | {total_steps} |\n"));
        md.push_str(&format!("| Breakpoints hit | {breakpoints_hit} |\n"));
        md.push_str(&format!("| Exceptions thrown | {exceptions_thrown} |\n"));
        md.push_str(&format!("| Variables inspected | {} |\n\n", variables.len()));

        md.push_str("## Execution Path\n\n```\n");
        for (step, file, line, function, reason) in steps.iter().take(SUMMARY_PATH_CAP) {
            let function = function
                .as_deref()
                .map(|f| format!(" in {f}"))
                .unwrap_or_default();
            md.push_str(&format!("{step:>4}. {file}:{line}{function} ({reason})\n"));
        }
        if steps.len() > SUMMARY_PATH_CAP {
            md.push_str(&format!(
                "... and {} more steps\n",
                steps.len() - SUMMARY_PATH_CAP
            ));
        }
        md.push_str("```\n");

        if !variables.is_empty() {
            md.push_str("\n## Inspected Variables\n\n");
            for name in &variables {
                md.push_str(&format!("- `{name}`\n"));
            }
        }

        Ok(md)
    }

    /// Close the database handle. Idempotent.
    pub fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = conn.close();
        }
    }
}

fn duration_secs(started_at: &str, ended_at: Option<&str>) -> i64 {
    let start = DateTime::parse_from_rfc3339(started_at).map(|d| d.with_timezone(&Utc));
    let end = ended_at
        .and_then(|e| DateTime::parse_from_rfc3339(e).ok())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    match start {
        Ok(start) => (end - start).num_seconds().max(0),
        Err(_) => 0,
    }
}

/// Total serialization of a value for the `value_json` column
///
/// Integers beyond double precision become decimal strings, error-shaped
/// objects flatten to `{name, message}`, and any serialization failure
/// yields a fixed error document instead of propagating.
pub fn safe_stringify(value: &Value) -> String {
    let sanitized = sanitize(value);
    serde_json::to_string(&sanitized)
        .unwrap_or_else(|_| r#"{"error":"Failed to serialize value"}"#.to_string())
}

fn sanitize(value: &Value) -> Value {
    match value {
        Value::Number(n) => {
            let too_big = n
                .as_i64()
                .map(|i| (i as i128).abs() > MAX_SAFE_INTEGER)
                .or_else(|| n.as_u64().map(|u| u as i128 > MAX_SAFE_INTEGER))
                .unwrap_or(false);
            if too_big {
                Value::String(n.to_string())
            } else {
                value.clone()
            }
        }
        Value::Object(map) => {
            if map.contains_key("message") && map.contains_key("stack") {
                let name = map
                    .get("name")
                    .and_then(|n| n.as_str())
                    .unwrap_or("Error");
                return json!({
                    "name": name,
                    "message": map.get("message").cloned().unwrap_or(Value::Null),
                });
            }
            Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), sanitize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(sanitize).collect()),
        other => other.clone(),
    }
}
