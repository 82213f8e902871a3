//! End-to-end tests for the debugger bridge
//!
//! These drive the real tool dispatch → session runtime → DBGp link
//! path against a scripted stub debuggee speaking DBGp frames over a
//! real TCP socket, covering the full workflow: breakpoints before
//! start, pausing, surgical inspection, history queries, exception
//! stops, and the watchdog.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use xdebug_bridge::common::Config;
use xdebug_bridge::server::tools::dispatch;
use xdebug_bridge::session::SessionRuntime;

/// Project fixture with a PHP source file at app/x.php
fn project_fixture() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("app")).unwrap();
    let mut source = String::from("<?php\n");
    for line in 2..=50 {
        if line == 42 {
            source.push_str("$total = checkout($cart);\n");
        } else {
            source.push_str(&format!("// line {line}\n"));
        }
    }
    std::fs::write(dir.path().join("app/x.php"), source).unwrap();
    dir
}

fn runtime_for(dir: &tempfile::TempDir, port: u16, watchdog_ms: u64) -> Arc<Mutex<SessionRuntime>> {
    SessionRuntime::shared(Config {
        port,
        port_range_end: port + 3,
        connection_timeout_secs: 10,
        watchdog_timeout_ms: watchdog_ms,
        data_dir: Some(dir.path().join(".xdebug-mcp")),
        project_root: Some(dir.path().to_path_buf()),
        ..Config::default()
    })
}

/// One parsed DBGp command from the bridge
#[derive(Debug, Clone)]
struct StubCommand {
    verb: String,
    txid: u32,
    args: HashMap<String, String>,
    data: Option<String>,
}

/// Scripted debuggee speaking DBGp over TCP
struct Stub {
    stream: TcpStream,
    buf: Vec<u8>,
}

impl Stub {
    /// Dial the bridge, retrying until its listener is up
    async fn connect(port: u16) -> Self {
        for _ in 0..250 {
            if let Ok(stream) = TcpStream::connect(("127.0.0.1", port)).await {
                return Self {
                    stream,
                    buf: Vec::new(),
                };
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("bridge listener never came up on port {port}");
    }

    async fn send_init(&mut self) {
        self.reply(
            r#"<init xmlns="urn:debugger_protocol_v1" language="PHP" protocol_version="1.0"
                 fileuri="file:///var/www/html/index.php" idekey="mcp"/>"#
                .to_string(),
        )
        .await;
    }

    async fn recv_command(&mut self) -> Option<StubCommand> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == 0) {
                let raw: Vec<u8> = self.buf.drain(..=pos).collect();
                let text = String::from_utf8_lossy(&raw[..raw.len() - 1]).to_string();
                return Some(parse_command(&text));
            }
            let mut chunk = [0u8; 4096];
            match self.stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return None,
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
            }
        }
    }

    async fn reply(&mut self, xml: String) {
        let mut frame = xml.len().to_string().into_bytes();
        frame.push(0);
        frame.extend_from_slice(xml.as_bytes());
        frame.push(0);
        self.stream.write_all(&frame).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    async fn ack(&mut self, cmd: &StubCommand) {
        self.reply(format!(
            r#"<response command="{}" transaction_id="{}" success="1"/>"#,
            cmd.verb, cmd.txid
        ))
        .await;
    }

    async fn reply_break(&mut self, cmd: &StubCommand, uri: &str, line: u32) {
        self.reply(format!(
            r#"<response command="{}" transaction_id="{}" status="break" reason="">
                 <xdebug:message filename="{uri}" lineno="{line}"/>
               </response>"#,
            cmd.verb, cmd.txid
        ))
        .await;
    }

    async fn reply_stack(&mut self, cmd: &StubCommand, uri: &str, line: u32, func: &str) {
        self.reply(format!(
            r#"<response command="stack_get" transaction_id="{}">
                 <stack level="0" type="file" filename="{uri}" lineno="{line}" where="{func}"/>
               </response>"#,
            cmd.txid
        ))
        .await;
    }

    async fn reply_stopped(&mut self, cmd: &StubCommand) {
        self.reply(format!(
            r#"<response command="{}" transaction_id="{}" status="stopped" reason="ok"/>"#,
            cmd.verb, cmd.txid
        ))
        .await;
    }
}

fn parse_command(text: &str) -> StubCommand {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let verb = tokens.first().unwrap_or(&"").to_string();
    let mut args = HashMap::new();
    let mut txid = 0;
    let mut data = None;
    let mut i = 1;
    while i < tokens.len() {
        if tokens[i] == "--" {
            data = tokens.get(i + 1).map(|b64| {
                String::from_utf8(STANDARD.decode(b64).expect("payload must be base64")).unwrap()
            });
            break;
        }
        if let (Some(flag), Some(value)) = (tokens.get(i), tokens.get(i + 1)) {
            if *flag == "-i" {
                txid = value.parse().unwrap();
            }
            args.insert(flag.to_string(), value.to_string());
        }
        i += 2;
    }
    StubCommand {
        verb,
        txid,
        args,
        data,
    }
}

const X_PHP_URI: &str = "file:///var/www/html/app/x.php";

#[tokio::test]
async fn breakpoint_before_start_hits_and_pauses() {
    let dir = project_fixture();
    let runtime = runtime_for(&dir, 47111, 300_000);

    let set = dispatch(
        &runtime,
        "set_breakpoint",
        json!({ "file": "app/x.php", "line": 42 }),
    )
    .await
    .unwrap();
    assert_eq!(set["success"], json!(true));
    assert_eq!(set["breakpoint"], json!({ "file": "app/x.php", "line": 42 }));

    let stub = tokio::spawn(async move {
        let mut stub = Stub::connect(47111).await;
        stub.send_init().await;
        let mut registered_uri = None;
        while let Some(cmd) = stub.recv_command().await {
            match cmd.verb.as_str() {
                "breakpoint_set" => {
                    registered_uri = cmd.args.get("-f").cloned();
                    assert_eq!(cmd.args.get("-t").map(String::as_str), Some("line"));
                    assert_eq!(cmd.args.get("-n").map(String::as_str), Some("42"));
                    stub.reply(format!(
                        r#"<response command="breakpoint_set" transaction_id="{}" id="1001"/>"#,
                        cmd.txid
                    ))
                    .await;
                }
                "run" => stub.reply_break(&cmd, X_PHP_URI, 42).await,
                "stack_get" => stub.reply_stack(&cmd, X_PHP_URI, 42, "checkout").await,
                "stop" => {
                    stub.reply_stopped(&cmd).await;
                    break;
                }
                _ => stub.ack(&cmd).await,
            }
        }
        registered_uri
    });

    let started = dispatch(
        &runtime,
        "start_debug_session",
        json!({ "command": "curl http://localhost/foo" }),
    )
    .await
    .unwrap();

    assert_eq!(started["status"], json!("paused"));
    assert_eq!(started["location"]["file"], json!("app/x.php"));
    assert_eq!(started["location"]["line"], json!(42));
    assert_eq!(started["pause_reason"], json!("breakpoint_hit"));
    assert!(started["code_snippet"]
        .as_str()
        .unwrap()
        .contains("$total = checkout($cart);"));

    let status = dispatch(&runtime, "get_session_status", json!({})).await.unwrap();
    assert_eq!(status["active"], json!(true));
    assert_eq!(status["status"], json!("paused"));
    assert_eq!(
        status["available_actions"],
        json!(["step_over", "step_into", "step_out", "continue", "stop", "inspect_variable"])
    );

    dispatch(&runtime, "control_execution", json!({ "action": "stop" }))
        .await
        .unwrap();
    let registered_uri = stub.await.unwrap();
    assert_eq!(registered_uri.as_deref(), Some(X_PHP_URI));
}

fn order_property_xml(txid: u32) -> String {
    format!(
        r#"<response command="property_get" transaction_id="{txid}">
             <property name="$order" fullname="$order" type="object" classname="Order" numchildren="3">
               <property name="id" type="int">123</property>
               <property name="total" type="float">99.99</property>
               <property name="items" type="array" numchildren="2">
                 <property name="0" type="array" numchildren="1">
                   <property name="sku" type="string" size="2" encoding="base64">QTE=</property>
                 </property>
                 <property name="1" type="array" numchildren="1">
                   <property name="sku" type="string" size="2" encoding="base64">QjI=</property>
                 </property>
               </property>
             </property>
           </response>"#
    )
}

#[tokio::test]
async fn structural_summary_then_surgical_filter() {
    let dir = project_fixture();
    let runtime = runtime_for(&dir, 47121, 300_000);

    dispatch(
        &runtime,
        "set_breakpoint",
        json!({ "file": "app/x.php", "line": 42 }),
    )
    .await
    .unwrap();

    let stub = tokio::spawn(async move {
        let mut stub = Stub::connect(47121).await;
        stub.send_init().await;
        while let Some(cmd) = stub.recv_command().await {
            match cmd.verb.as_str() {
                "breakpoint_set" => {
                    stub.reply(format!(
                        r#"<response command="breakpoint_set" transaction_id="{}" id="1001"/>"#,
                        cmd.txid
                    ))
                    .await;
                }
                "run" => stub.reply_break(&cmd, X_PHP_URI, 42).await,
                "stack_get" => stub.reply_stack(&cmd, X_PHP_URI, 42, "checkout").await,
                "property_get" => {
                    assert_eq!(cmd.args.get("-n").map(String::as_str), Some("$order"));
                    let xml = order_property_xml(cmd.txid);
                    stub.reply(xml).await;
                }
                "stop" => {
                    stub.reply_stopped(&cmd).await;
                    break;
                }
                _ => stub.ack(&cmd).await,
            }
        }
    });

    dispatch(
        &runtime,
        "start_debug_session",
        json!({ "command": "curl http://localhost/order" }),
    )
    .await
    .unwrap();

    // Without a filter: structural summary, never the full payload
    let summary = dispatch(&runtime, "inspect_variable", json!({ "name": "$order" }))
        .await
        .unwrap();
    assert_eq!(summary["type"], json!("object"));
    assert_eq!(summary["classname"], json!("Order"));
    assert_eq!(summary["structure"]["keys"], json!(["id", "total", "items"]));
    assert_eq!(summary["structure"]["children_count"], json!(3));
    assert_eq!(summary["structure"]["preview"]["id"], json!("(int) 123"));
    assert_eq!(summary["structure"]["preview"]["total"], json!("(float) 99.99"));
    assert_eq!(
        summary["structure"]["preview"]["items"],
        json!("(array) [2 children]")
    );

    // With a filter: only the selected slice
    let filtered = dispatch(
        &runtime,
        "inspect_variable",
        json!({ "name": "$order", "filter": "$.items[*].sku" }),
    )
    .await
    .unwrap();
    assert_eq!(filtered["value"], json!(["A1", "B2"]));
    assert_eq!(filtered["truncated"], json!(false));

    // A bad filter downgrades to navigational hints
    let diagnostic = dispatch(
        &runtime,
        "inspect_variable",
        json!({ "name": "$order", "filter": "$.nope" }),
    )
    .await
    .unwrap();
    assert!(diagnostic["error"].as_str().unwrap().contains("nope"));
    assert!(diagnostic["available_keys"]
        .as_array()
        .unwrap()
        .contains(&json!("id")));

    dispatch(&runtime, "control_execution", json!({ "action": "stop" }))
        .await
        .unwrap();
    stub.abort();
}

#[tokio::test]
async fn conditional_breakpoint_is_base64_encoded() {
    let dir = project_fixture();
    let runtime = runtime_for(&dir, 47131, 300_000);

    dispatch(
        &runtime,
        "set_breakpoint",
        json!({ "file": "app/x.php", "line": 42, "condition": "$i === 50" }),
    )
    .await
    .unwrap();

    let stub = tokio::spawn(async move {
        let mut stub = Stub::connect(47131).await;
        stub.send_init().await;
        let mut condition = None;
        while let Some(cmd) = stub.recv_command().await {
            match cmd.verb.as_str() {
                "breakpoint_set" => {
                    assert_eq!(cmd.args.get("-t").map(String::as_str), Some("conditional"));
                    condition = cmd.data.clone();
                    stub.reply(format!(
                        r#"<response command="breakpoint_set" transaction_id="{}" id="1002"/>"#,
                        cmd.txid
                    ))
                    .await;
                }
                "run" => stub.reply_break(&cmd, X_PHP_URI, 42).await,
                "stack_get" => stub.reply_stack(&cmd, X_PHP_URI, 42, "loop_body").await,
                "stop" => {
                    stub.reply_stopped(&cmd).await;
                    break;
                }
                _ => stub.ack(&cmd).await,
            }
        }
        condition
    });

    let started = dispatch(
        &runtime,
        "start_debug_session",
        json!({ "command": "curl http://localhost/loop" }),
    )
    .await
    .unwrap();
    assert_eq!(started["status"], json!("paused"));

    dispatch(&runtime, "control_execution", json!({ "action": "stop" }))
        .await
        .unwrap();
    let condition = stub.await.unwrap();
    assert_eq!(condition.as_deref(), Some("$i === 50"));
}

#[tokio::test]
async fn exception_stop_carries_payload() {
    let dir = project_fixture();
    let runtime = runtime_for(&dir, 47141, 300_000);

    let stub = tokio::spawn(async move {
        let mut stub = Stub::connect(47141).await;
        stub.send_init().await;
        let mut exception_filter = None;
        while let Some(cmd) = stub.recv_command().await {
            match cmd.verb.as_str() {
                "breakpoint_set" => {
                    assert_eq!(cmd.args.get("-t").map(String::as_str), Some("exception"));
                    exception_filter = cmd.args.get("-x").cloned();
                    stub.reply(format!(
                        r#"<response command="breakpoint_set" transaction_id="{}" id="2001"/>"#,
                        cmd.txid
                    ))
                    .await;
                }
                "run" => {
                    stub.reply(format!(
                        r#"<response command="run" transaction_id="{}" status="break" reason="exception">
                             <xdebug:message filename="{X_PHP_URI}" lineno="17" exception="RuntimeException"><![CDATA[boom]]></xdebug:message>
                           </response>"#,
                        cmd.txid
                    ))
                    .await;
                }
                "stack_get" => stub.reply_stack(&cmd, X_PHP_URI, 17, "throws").await,
                "stop" => {
                    stub.reply_stopped(&cmd).await;
                    break;
                }
                _ => stub.ack(&cmd).await,
            }
        }
        exception_filter
    });

    let started = dispatch(
        &runtime,
        "start_debug_session",
        json!({ "command": "curl http://localhost/throw", "stop_on_exception": true }),
    )
    .await
    .unwrap();

    assert_eq!(started["status"], json!("paused"));
    assert_eq!(started["pause_reason"], json!("exception"));
    assert_eq!(started["raw_reason"], json!("exception"));
    assert_eq!(
        started["exception"],
        json!({ "name": "RuntimeException", "message": "boom" })
    );

    dispatch(&runtime, "control_execution", json!({ "action": "stop" }))
        .await
        .unwrap();
    let exception_filter = stub.await.unwrap();
    assert_eq!(exception_filter.as_deref(), Some("*"));
}

#[tokio::test]
async fn history_queries_travel_back_in_time() {
    let dir = project_fixture();
    let runtime = runtime_for(&dir, 47151, 300_000);

    dispatch(
        &runtime,
        "set_breakpoint",
        json!({ "file": "app/x.php", "line": 42 }),
    )
    .await
    .unwrap();

    let stub = tokio::spawn(async move {
        let mut stub = Stub::connect(47151).await;
        stub.send_init().await;
        let mut inspections = 0u32;
        while let Some(cmd) = stub.recv_command().await {
            match cmd.verb.as_str() {
                "breakpoint_set" => {
                    stub.reply(format!(
                        r#"<response command="breakpoint_set" transaction_id="{}" id="1001"/>"#,
                        cmd.txid
                    ))
                    .await;
                }
                "run" => stub.reply_break(&cmd, X_PHP_URI, 42).await,
                "stack_get" => stub.reply_stack(&cmd, X_PHP_URI, 42, "loop_body").await,
                "property_get" => {
                    inspections += 1;
                    stub.reply(format!(
                        r#"<response command="property_get" transaction_id="{}">
                             <property name="$state" type="array" numchildren="1">
                               <property name="step" type="int">{inspections}</property>
                             </property>
                           </response>"#,
                        cmd.txid
                    ))
                    .await;
                }
                "stop" => {
                    stub.reply_stopped(&cmd).await;
                    break;
                }
                _ => stub.ack(&cmd).await,
            }
        }
    });

    let started = dispatch(
        &runtime,
        "start_debug_session",
        json!({ "command": "curl http://localhost/loop" }),
    )
    .await
    .unwrap();
    let session_id = started["session_id"].as_str().unwrap().to_string();

    // Inspect $state at steps 1, 2, 3
    for expected_step in 1..=3u32 {
        let inspected = dispatch(&runtime, "inspect_variable", json!({ "name": "$state" }))
            .await
            .unwrap();
        assert_eq!(
            inspected["structure"]["preview"]["step"],
            json!(format!("(int) {expected_step}"))
        );
        if expected_step < 3 {
            let resumed = dispatch(
                &runtime,
                "control_execution",
                json!({ "action": "continue" }),
            )
            .await
            .unwrap();
            assert_eq!(resumed["status"], json!("paused"));
        }
    }

    let all = dispatch(
        &runtime,
        "query_history",
        json!({ "variable_name": "$state", "steps_ago": 0, "limit": 3 }),
    )
    .await
    .unwrap();
    let history = all["history"].as_array().unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[0]["step"], json!(3));
    assert_eq!(history[0]["value"], json!({ "step": 3 }));
    assert_eq!(history[2]["step"], json!(1));
    assert_eq!(history[2]["value"], json!({ "step": 1 }));

    let earlier = dispatch(
        &runtime,
        "query_history",
        json!({ "variable_name": "$state", "steps_ago": 2, "limit": 5 }),
    )
    .await
    .unwrap();
    let history = earlier["history"].as_array().unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["step"], json!(1));

    dispatch(&runtime, "control_execution", json!({ "action": "stop" }))
        .await
        .unwrap();
    stub.await.unwrap();

    // Stop finalizes the ledger and writes the Markdown summary
    let prefix: String = session_id.chars().take(8).collect();
    let summary_path = dir
        .path()
        .join(".xdebug-mcp")
        .join(format!("session_{prefix}_summary.md"));
    let summary = std::fs::read_to_string(summary_path).unwrap();
    assert!(summary.contains("| Total steps | 3 |"));
    assert!(summary.contains("`$state`"));
}

#[tokio::test]
async fn watchdog_stops_an_idle_session() {
    let dir = project_fixture();
    let runtime = runtime_for(&dir, 47161, 150);

    dispatch(
        &runtime,
        "set_breakpoint",
        json!({ "file": "app/x.php", "line": 42 }),
    )
    .await
    .unwrap();

    let stub = tokio::spawn(async move {
        let mut stub = Stub::connect(47161).await;
        stub.send_init().await;
        while let Some(cmd) = stub.recv_command().await {
            match cmd.verb.as_str() {
                "breakpoint_set" => {
                    stub.reply(format!(
                        r#"<response command="breakpoint_set" transaction_id="{}" id="1001"/>"#,
                        cmd.txid
                    ))
                    .await;
                }
                "run" => stub.reply_break(&cmd, X_PHP_URI, 42).await,
                "stack_get" => stub.reply_stack(&cmd, X_PHP_URI, 42, "checkout").await,
                "stop" => {
                    stub.reply_stopped(&cmd).await;
                    break;
                }
                _ => stub.ack(&cmd).await,
            }
        }
    });

    let started = dispatch(
        &runtime,
        "start_debug_session",
        json!({ "command": "curl http://localhost/foo" }),
    )
    .await
    .unwrap();
    assert_eq!(started["status"], json!("paused"));

    // No agent activity past the watchdog deadline
    tokio::time::sleep(Duration::from_millis(500)).await;

    let err = dispatch(&runtime, "inspect_variable", json!({ "name": "$x" }))
        .await
        .unwrap_err();
    assert_eq!(err.code, "SESSION_STOPPED");

    let status = dispatch(&runtime, "get_session_status", json!({})).await.unwrap();
    assert_eq!(status["active"], json!(false));
    assert_eq!(status["status"], json!("stopped"));
    stub.await.unwrap();
}

#[tokio::test]
async fn occupied_port_range_reports_no_available_port() {
    let dir = project_fixture();
    let runtime = SessionRuntime::shared(Config {
        port: 47171,
        port_range_end: 47172,
        connection_timeout_secs: 2,
        data_dir: Some(dir.path().join(".xdebug-mcp")),
        project_root: Some(dir.path().to_path_buf()),
        ..Config::default()
    });

    let blocker_a = tokio::net::TcpListener::bind(("0.0.0.0", 47171)).await.unwrap();
    let blocker_b = tokio::net::TcpListener::bind(("0.0.0.0", 47172)).await.unwrap();

    let err = dispatch(&runtime, "start_debug_session", json!({ "command": "true" }))
        .await
        .unwrap_err();
    assert_eq!(err.code, "NO_AVAILABLE_PORT");
    assert!(err.recoverable);

    // The walk held no sockets: freeing the blockers frees the range
    drop(blocker_a);
    drop(blocker_b);
    let rebound = tokio::net::TcpListener::bind(("0.0.0.0", 47171)).await;
    assert!(rebound.is_ok());
}

#[tokio::test]
async fn second_start_while_active_is_rejected() {
    let dir = project_fixture();
    let runtime = runtime_for(&dir, 47181, 300_000);

    dispatch(
        &runtime,
        "set_breakpoint",
        json!({ "file": "app/x.php", "line": 42 }),
    )
    .await
    .unwrap();

    let stub = tokio::spawn(async move {
        let mut stub = Stub::connect(47181).await;
        stub.send_init().await;
        while let Some(cmd) = stub.recv_command().await {
            match cmd.verb.as_str() {
                "breakpoint_set" => {
                    stub.reply(format!(
                        r#"<response command="breakpoint_set" transaction_id="{}" id="1001"/>"#,
                        cmd.txid
                    ))
                    .await;
                }
                "run" => stub.reply_break(&cmd, X_PHP_URI, 42).await,
                "stack_get" => stub.reply_stack(&cmd, X_PHP_URI, 42, "checkout").await,
                "stop" => {
                    stub.reply_stopped(&cmd).await;
                    break;
                }
                _ => stub.ack(&cmd).await,
            }
        }
    });

    dispatch(
        &runtime,
        "start_debug_session",
        json!({ "command": "curl http://localhost/foo" }),
    )
    .await
    .unwrap();

    let err = dispatch(
        &runtime,
        "start_debug_session",
        json!({ "command": "curl http://localhost/bar" }),
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, "SESSION_ALREADY_ACTIVE");
    assert!(err.recoverable);

    dispatch(&runtime, "control_execution", json!({ "action": "stop" }))
        .await
        .unwrap();
    stub.await.unwrap();
}
