//! Control transport: line-oriented JSON over stdio
//!
//! One request per line, one response per line. stdout carries only the
//! transport; all diagnostics go to stderr via tracing. EOF on stdin
//! runs the stop sequence so no debuggee is left orphaned.

pub mod tools;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::common::{Config, Result, ToolError};
use crate::session::SessionRuntime;

/// One agent request line
#[derive(Debug, Deserialize)]
pub struct Request {
    pub id: u64,
    pub tool: String,
    #[serde(default)]
    pub arguments: Option<Value>,
}

/// One response line
#[derive(Debug, Serialize)]
pub struct Response {
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
}

impl Response {
    fn success(id: u64, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: u64, error: ToolError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// Run the bridge until stdin closes
pub async fn serve(config: Config) -> Result<()> {
    let runtime = SessionRuntime::shared(config);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    tracing::info!("bridge ready, reading tool requests from stdin");

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<Request>(line) {
            Ok(request) => {
                tracing::debug!(id = request.id, tool = %request.tool, "tool request");
                let arguments = request.arguments.unwrap_or_else(|| Value::Object(Default::default()));
                match tools::dispatch(&runtime, &request.tool, arguments).await {
                    Ok(result) => Response::success(request.id, result),
                    Err(error) => Response::failure(request.id, error),
                }
            }
            Err(e) => {
                tracing::warn!("unparseable request line: {e}");
                Response::failure(
                    0,
                    ToolError {
                        error: format!("Invalid request: {e}"),
                        code: "VALIDATION_ERROR".to_string(),
                        recoverable: true,
                        hint: Some(
                            "Send one JSON object per line: {\"id\", \"tool\", \"arguments\"}"
                                .to_string(),
                        ),
                        issues: None,
                        available_keys: None,
                    },
                )
            }
        };

        let mut payload = serde_json::to_vec(&response)?;
        payload.push(b'\n');
        stdout.write_all(&payload).await?;
        stdout.flush().await?;
    }

    tracing::info!("control stream closed, shutting down");
    let mut runtime = runtime.lock().await;
    runtime.stop_session("bridge shutdown").await;
    Ok(())
}
