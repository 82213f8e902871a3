//! DBGp link to the debuggee
//!
//! Owns the TCP listener, the single debuggee connection, and the trigger
//! child process. A reader task owns the socket's read half and
//! dispatches incoming frames: responses resolve pending commands by
//! transaction id, break/stopped statuses are additionally emitted as
//! events. Raw sockets are never exposed; the session runtime sees two
//! awaitable surfaces, `send_command` and `wait_for_break`.

use std::collections::HashMap;
use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use crate::common::{Error, Result};

use super::codec::{encode_command, FrameDecoder};
use super::types::{BreakEvent, ExceptionInfo, LinkEvent, StackFrame, VariableInfo};
use super::xml::{self, XmlElement};

/// DBGp error code for "can not get property" (property not found)
const DBGP_PROPERTY_NOT_FOUND: u32 = 300;

type PendingMap = Arc<StdMutex<HashMap<u32, oneshot::Sender<Result<XmlElement>>>>>;

/// Breakpoint registration request for `breakpoint_set`
#[derive(Debug, Clone, Default)]
pub struct BreakpointSpec {
    pub kind: BreakpointKind,
    pub file_uri: Option<String>,
    pub lineno: Option<u32>,
    pub exception: Option<String>,
    pub expression: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BreakpointKind {
    #[default]
    Line,
    Conditional,
    Exception,
}

impl BreakpointKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Line => "line",
            Self::Conditional => "conditional",
            Self::Exception => "exception",
        }
    }
}

/// Connection to an XDebug-style debuggee over DBGp
#[derive(Debug)]
pub struct DbgpLink {
    port: u16,
    listener: Option<TcpListener>,
    writer: Option<OwnedWriteHalf>,
    txid: AtomicU32,
    pending: PendingMap,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    events_rx: mpsc::UnboundedReceiver<LinkEvent>,
    trigger: Option<Child>,
    reader_task: Option<JoinHandle<()>>,
    connected: Arc<AtomicBool>,
    closed: bool,
    command_timeout: Duration,
}

impl DbgpLink {
    /// Bind a listener, walking the port range on `EADDRINUSE`
    pub async fn bind(port_start: u16, port_end: u16, command_timeout: Duration) -> Result<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        for port in port_start..=port_end {
            match TcpListener::bind(("0.0.0.0", port)).await {
                Ok(listener) => {
                    tracing::info!(port, "listening for debuggee connection");
                    return Ok(Self {
                        port,
                        listener: Some(listener),
                        writer: None,
                        txid: AtomicU32::new(1),
                        pending: Arc::new(StdMutex::new(HashMap::new())),
                        events_tx,
                        events_rx,
                        trigger: None,
                        reader_task: None,
                        connected: Arc::new(AtomicBool::new(false)),
                        closed: false,
                        command_timeout,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => {
                    tracing::debug!(port, "port busy, trying next");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::NoAvailablePort {
            start: port_start,
            end: port_end,
        })
    }

    /// The actually bound port (may differ from the configured base)
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Wait for the debuggee to dial in, then start the socket dispatcher
    pub async fn wait_for_connection(&mut self, wait: Duration) -> Result<()> {
        let listener = self
            .listener
            .as_ref()
            .ok_or_else(|| Error::Internal("listener already closed".to_string()))?;

        let (stream, peer) = timeout(wait, listener.accept())
            .await
            .map_err(|_| Error::ConnectionTimeout(wait.as_secs()))??;
        stream.set_nodelay(true).ok();
        tracing::info!(%peer, "debuggee connected");

        let (read_half, write_half) = stream.into_split();
        self.writer = Some(write_half);
        self.connected.store(true, Ordering::SeqCst);

        let pending = Arc::clone(&self.pending);
        let events_tx = self.events_tx.clone();
        let connected = Arc::clone(&self.connected);
        self.reader_task = Some(tokio::spawn(read_loop(
            read_half, pending, events_tx, connected,
        )));

        Ok(())
    }

    /// Spawn the trigger command through a shell, detached
    ///
    /// The child is fire-and-forget: its exit does not drive session
    /// state. Output is captured into log lines for diagnostics only.
    pub fn execute_trigger(&mut self, command_line: &str, cwd: Option<&std::path::Path>) -> Result<()> {
        let argv = split_command(command_line);
        if argv.is_empty() {
            return Err(Error::validation(vec!["trigger command is empty"]));
        }
        tracing::info!(program = %argv[0], port = self.port, "spawning trigger command");

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(command_line)
            .env(
                "XDEBUG_CONFIG",
                format!(
                    "client_host=host.docker.internal client_port={}",
                    self.port
                ),
            )
            .env("XDEBUG_SESSION", "mcp")
            .env("XDEBUG_MODE", "debug")
            .env("XDEBUG_TRIGGER", "yes")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn()?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(log_child_output(stdout, "trigger stdout"));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_child_output(stderr, "trigger stderr"));
        }

        self.trigger = Some(child);
        Ok(())
    }

    /// Send a command and await its correlated response
    ///
    /// A timeout rejects only the waiter; the command stays pending until
    /// a matching response arrives (then discarded) or the link closes.
    pub async fn send_command(
        &mut self,
        verb: &str,
        args: &[(&str, String)],
        data: Option<&[u8]>,
    ) -> Result<XmlElement> {
        if !self.is_connected() {
            return Err(Error::NotConnected("no debuggee connection".to_string()));
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::NotConnected("no debuggee connection".to_string()))?;

        let txid = self.txid.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(txid, tx);

        let frame = encode_command(verb, txid, args, data);
        tracing::debug!(verb, txid, "dbgp command");
        writer.write_all(&frame).await?;
        writer.flush().await?;

        match timeout(self.command_timeout, rx).await {
            Err(_) => Err(Error::ConnectionTimeout(self.command_timeout.as_secs())),
            Ok(Err(_)) => Err(Error::NotConnected("connection closed".to_string())),
            Ok(Ok(result)) => result,
        }
    }

    /// Send a continuation command without awaiting its response
    ///
    /// Continuation responses only arrive once the debuggee breaks or
    /// finishes, so they surface through the event queue instead.
    pub async fn send_async(&mut self, verb: &str, args: &[(&str, String)]) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected("no debuggee connection".to_string()));
        }
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::NotConnected("no debuggee connection".to_string()))?;

        let txid = self.txid.fetch_add(1, Ordering::SeqCst);
        let frame = encode_command(verb, txid, args, None);
        tracing::debug!(verb, txid, "dbgp continuation");
        writer.write_all(&frame).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Resolve on the next break event
    pub async fn wait_for_break(&mut self, wait: Duration) -> Result<BreakEvent> {
        match timeout(wait, self.events_rx.recv()).await {
            Err(_) => Err(Error::ConnectionTimeout(wait.as_secs())),
            Ok(None) | Ok(Some(LinkEvent::Closed)) => {
                Err(Error::NotConnected("connection closed".to_string()))
            }
            Ok(Some(LinkEvent::Break(event))) => Ok(event),
        }
    }

    /// Non-blocking poll of the event queue
    pub fn try_next_event(&mut self) -> Option<LinkEvent> {
        self.events_rx.try_recv().ok()
    }

    /// Register a breakpoint with the debuggee, returning its id
    pub async fn set_breakpoint(&mut self, spec: BreakpointSpec) -> Result<u32> {
        let mut args: Vec<(&str, String)> = vec![("-t", spec.kind.as_str().to_string())];
        if let Some(uri) = &spec.file_uri {
            args.push(("-f", uri.clone()));
        }
        if let Some(lineno) = spec.lineno {
            args.push(("-n", lineno.to_string()));
        }
        if let Some(exception) = &spec.exception {
            args.push(("-x", exception.clone()));
        }
        let data = spec.expression.as_ref().map(|e| e.as_bytes().to_vec());

        let response = self
            .send_command("breakpoint_set", &args, data.as_deref())
            .await?;
        response
            .attr("id")
            .and_then(|id| id.parse().ok())
            .ok_or_else(|| Error::Protocol("breakpoint_set response missing id".to_string()))
    }

    pub async fn remove_breakpoint(&mut self, id: u32) -> Result<()> {
        self.send_command("breakpoint_remove", &[("-d", id.to_string())], None)
            .await?;
        Ok(())
    }

    /// Fetch one property; `None` when the debuggee reports it not found
    pub async fn get_property(
        &mut self,
        name: &str,
        depth: u32,
        max_children: u32,
    ) -> Result<Option<VariableInfo>> {
        self.set_feature("max_depth", &depth.to_string()).await?;
        self.set_feature("max_children", &max_children.to_string())
            .await?;

        match self
            .send_command("property_get", &[("-n", name.to_string())], None)
            .await
        {
            Ok(response) => Ok(response.child("property").map(xml::decode_property)),
            Err(e) if e.dbgp_code() == Some(DBGP_PROPERTY_NOT_FOUND) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn get_context_variables(
        &mut self,
        context_id: u32,
        depth: u32,
    ) -> Result<Vec<VariableInfo>> {
        self.set_feature("max_depth", &depth.to_string()).await?;
        let response = self
            .send_command("context_get", &[("-c", context_id.to_string())], None)
            .await?;
        Ok(response
            .children_named("property")
            .map(xml::decode_property)
            .collect())
    }

    pub async fn get_stack_frames(&mut self) -> Result<Vec<StackFrame>> {
        let response = self.send_command("stack_get", &[], None).await?;
        Ok(response
            .children_named("stack")
            .map(|frame| StackFrame {
                level: frame.attr("level").and_then(|v| v.parse().ok()).unwrap_or(0),
                frame_type: frame.attr("type").unwrap_or("file").to_string(),
                filename: frame.attr("filename").unwrap_or_default().to_string(),
                lineno: frame.attr("lineno").and_then(|v| v.parse().ok()).unwrap_or(0),
                r#where: frame.attr("where").map(str::to_string),
                cmdbegin: frame.attr("cmdbegin").map(str::to_string),
            })
            .collect())
    }

    pub async fn evaluate(&mut self, expression: &str) -> Result<VariableInfo> {
        let response = self
            .send_command("eval", &[], Some(expression.as_bytes()))
            .await?;
        response
            .child("property")
            .map(xml::decode_property)
            .ok_or_else(|| Error::Protocol("eval response missing property".to_string()))
    }

    pub async fn set_feature(&mut self, name: &str, value: &str) -> Result<()> {
        self.send_command(
            "feature_set",
            &[("-n", name.to_string()), ("-v", value.to_string())],
            None,
        )
        .await?;
        Ok(())
    }

    pub async fn break_on_exception(&mut self, name: &str) -> Result<u32> {
        self.set_breakpoint(BreakpointSpec {
            kind: BreakpointKind::Exception,
            exception: Some(name.to_string()),
            ..Default::default()
        })
        .await
    }

    /// Close the link: kill the trigger, reject all pending commands,
    /// drop the socket and listener. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(mut child) = self.trigger.take() {
            let _ = child.start_kill();
        }
        reject_all(&self.pending);
        if let Some(handle) = self.reader_task.take() {
            handle.abort();
        }
        self.writer = None;
        self.listener = None;
        self.connected.store(false, Ordering::SeqCst);
        tracing::debug!("dbgp link closed");
    }
}

impl Drop for DbgpLink {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop(
    mut read_half: OwnedReadHalf,
    pending: PendingMap,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    connected: Arc<AtomicBool>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 8192];

    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => break,
            Err(e) => {
                tracing::debug!("debuggee socket read failed: {e}");
                break;
            }
            Ok(n) => {
                for payload in decoder.feed(&buf[..n]) {
                    match xml::parse(&payload) {
                        Ok(doc) => dispatch(&doc, &pending, &events_tx),
                        Err(e) => tracing::warn!("discarding unparseable frame: {e}"),
                    }
                }
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
    reject_all(&pending);
    let _ = events_tx.send(LinkEvent::Closed);
}

fn dispatch(doc: &XmlElement, pending: &PendingMap, events_tx: &mpsc::UnboundedSender<LinkEvent>) {
    match doc.name.as_str() {
        "init" => {
            tracing::info!(
                language = doc.attr("language").unwrap_or("?"),
                idekey = doc.attr("idekey").unwrap_or("?"),
                fileuri = doc.attr("fileuri").unwrap_or("?"),
                "debuggee init"
            );
        }
        "response" => {
            // Event emission precedes resolving the waiting command so a
            // break is observable before the command's caller resumes.
            match doc.attr("status") {
                Some("break") => {
                    let _ = events_tx.send(LinkEvent::Break(break_event_from(doc)));
                }
                Some("stopping") | Some("stopped") => {
                    let _ = events_tx.send(LinkEvent::Closed);
                }
                _ => {}
            }

            let Some(txid) = doc.attr("transaction_id").and_then(|v| v.parse::<u32>().ok())
            else {
                tracing::debug!(command = doc.attr("command").unwrap_or("?"), "response without transaction id");
                return;
            };

            let waiter = pending.lock().unwrap().remove(&txid);
            if let Some(tx) = waiter {
                let result = match doc.child("error") {
                    Some(error) => {
                        let code = error.attr("code").and_then(|c| c.parse().ok()).unwrap_or(0);
                        let message = error
                            .child("message")
                            .map(xml::decode_text)
                            .unwrap_or_else(|| error.text.trim().to_string());
                        Err(Error::dbgp(code, &message))
                    }
                    None => Ok(doc.clone()),
                };
                let _ = tx.send(result);
            }
        }
        "stream" | "notify" => {
            tracing::debug!(kind = %doc.name, "debuggee {}", xml::decode_text(doc));
        }
        other => tracing::warn!(element = other, "unexpected DBGp element"),
    }
}

fn break_event_from(doc: &XmlElement) -> BreakEvent {
    let message = doc.child("message");
    let exception = message.and_then(|m| {
        m.attr("exception").map(|name| ExceptionInfo {
            name: name.to_string(),
            message: xml::decode_text(m),
        })
    });

    BreakEvent {
        remote_filename: message
            .and_then(|m| m.attr("filename"))
            .unwrap_or_default()
            .to_string(),
        lineno: message
            .and_then(|m| m.attr("lineno"))
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        reason: doc.attr("reason").unwrap_or_default().to_string(),
        exception,
    }
}

fn reject_all(pending: &PendingMap) {
    let waiters: Vec<_> = pending.lock().unwrap().drain().collect();
    for (_, tx) in waiters {
        let _ = tx.send(Err(Error::NotConnected("connection closed".to_string())));
    }
}

async fn log_child_output<R>(reader: R, label: &'static str)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!("{label}: {}", truncate(&line, 300));
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Simple quote-aware splitting of the trigger command string
pub fn split_command(input: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in input.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None => match c {
                '\'' | '"' => quote = Some(c),
                c if c.is_whitespace() => {
                    if !current.is_empty() {
                        out.push(std::mem::take(&mut current));
                    }
                }
                _ => current.push(c),
            },
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}
