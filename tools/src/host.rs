//! The tool-host side of the RPC protocol.
//!
//! Runs in the sandboxed subprocess (`relay host`), answering
//! `initialize`, `tools/list` and `tools/call` over stdio. Responses go to
//! stdout only; anything diagnostic goes through `tracing` (stderr in the
//! host binary), so the two are never mixed.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncWrite};

use relay_rpc::{LineReader, LineWriter, PROTOCOL_VERSION};
use relay_types::ToolDefinition;
use tokio_util::sync::CancellationToken;

use crate::exec::{CommandSpec, ExecLimits, ExecOutcome, ExecRequest, ExecSandbox, ExecStatus};

pub const EXEC_TOOL_NAME: &str = "exec";

/// Consecutive unreadable frames tolerated before the serve loop gives up.
const MAX_CONSECUTIVE_READ_ERRORS: usize = 3;

/// Schema for the built-in `exec` tool.
#[must_use]
pub fn exec_tool_definition() -> ToolDefinition {
    ToolDefinition::new(
        EXEC_TOOL_NAME,
        "Run a single external command in the project workspace. Prefer the argv form \
         (cmd + args, no shell interpolation); pass a shell string only when shell \
         features are genuinely needed.",
        json!({
            "type": "object",
            "properties": {
                "cmd": {
                    "type": "string",
                    "description": "Program to run (argv form, preferred)."
                },
                "args": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Arguments for cmd."
                },
                "shell": {
                    "type": "string",
                    "description": "Full shell command line (fallback form)."
                },
                "cwd": {
                    "type": "string",
                    "description": "Working directory, relative to the project root."
                },
                "timeout_ms": {
                    "type": "integer",
                    "description": "Wall-clock limit for the command."
                }
            }
        }),
    )
}

#[derive(Debug, Default, Deserialize)]
struct ExecToolArgs {
    #[serde(default)]
    cmd: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    shell: Option<String>,
    #[serde(default)]
    cwd: Option<String>,
    #[serde(default)]
    timeout_ms: Option<u64>,
}

/// Serves the exec sandbox over newline-delimited JSON-RPC.
pub struct ToolHost {
    sandbox: ExecSandbox,
    default_timeout: Duration,
    limits: ExecLimits,
}

impl ToolHost {
    #[must_use]
    pub fn new(project_root: std::path::PathBuf) -> Self {
        Self {
            sandbox: ExecSandbox::new(project_root),
            default_timeout: Duration::from_secs(120),
            limits: ExecLimits::default(),
        }
    }

    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_limits(mut self, limits: ExecLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Serve over the process's standard streams until EOF.
    pub async fn serve_stdio(&self) -> anyhow::Result<()> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve until the peer disconnects.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> anyhow::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut reader = LineReader::new(reader);
        let mut writer = LineWriter::new(writer);
        let mut consecutive_errors = 0usize;

        loop {
            match reader.read_message().await {
                Ok(Some(frame)) => {
                    consecutive_errors = 0;
                    if let Some(response) = self.handle_frame(&frame).await {
                        writer.write_message(&response).await?;
                    }
                }
                Ok(None) => return Ok(()),
                Err(e) => {
                    consecutive_errors += 1;
                    tracing::warn!("Skipping unreadable frame: {e}");
                    if consecutive_errors >= MAX_CONSECUTIVE_READ_ERRORS {
                        anyhow::bail!("giving up after {consecutive_errors} unreadable frames");
                    }
                }
            }
        }
    }

    async fn handle_frame(&self, frame: &Value) -> Option<Value> {
        let method = frame.get("method").and_then(Value::as_str);
        let id = frame.get("id").cloned();

        match (method, id) {
            (Some("initialize"), Some(id)) => Some(result_response(
                id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "serverInfo": {
                        "name": "relay-host",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                    "capabilities": { "tools": {} },
                }),
            )),
            (Some("tools/list"), Some(id)) => {
                let def = exec_tool_definition();
                Some(result_response(
                    id,
                    json!({
                        "tools": [{
                            "name": def.name,
                            "description": def.description,
                            "inputSchema": def.parameters,
                        }]
                    }),
                ))
            }
            (Some("tools/call"), Some(id)) => Some(self.handle_call(id, frame.get("params")).await),
            (Some(other), Some(id)) => {
                tracing::debug!("Unknown method from client: {other}");
                Some(error_response(id, -32601, format!("Method not found: {other}")))
            }
            (Some(notification), None) => {
                tracing::trace!("Ignoring notification: {notification}");
                None
            }
            (None, _) => {
                tracing::trace!("Ignoring frame without a method");
                None
            }
        }
    }

    async fn handle_call(&self, id: Value, params: Option<&Value>) -> Value {
        let name = params
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        if name != EXEC_TOOL_NAME {
            return error_response(id, -32602, format!("Unknown tool: {name}"));
        }

        let arguments = params
            .and_then(|p| p.get("arguments"))
            .cloned()
            .unwrap_or_else(|| json!({}));
        let args: ExecToolArgs = match serde_json::from_value(arguments) {
            Ok(args) => args,
            Err(e) => return error_response(id, -32602, format!("Bad exec arguments: {e}")),
        };

        let command = match (args.cmd, args.shell) {
            (Some(cmd), _) if !cmd.trim().is_empty() => CommandSpec::Argv {
                cmd,
                args: args.args,
            },
            (_, Some(shell)) if !shell.trim().is_empty() => CommandSpec::Shell(shell),
            _ => {
                return error_response(
                    id,
                    -32602,
                    "exec requires either cmd or shell".to_string(),
                );
            }
        };

        let request = ExecRequest {
            command,
            workdir: args.cwd,
            timeout: args
                .timeout_ms
                .map_or(self.default_timeout, Duration::from_millis),
            limits: self.limits,
        };

        // The host has no cancellation path of its own; the client's per-call
        // timeout governs.
        match self.sandbox.run(&request, &CancellationToken::new()).await {
            Ok(outcome) => {
                let content = format_outcome(&outcome);
                result_response(
                    id,
                    json!({
                        "content": content,
                        "isError": !outcome.ok,
                        "outcome": outcome,
                    }),
                )
            }
            Err(e) => error_response(id, -32602, e.to_string()),
        }
    }
}

fn result_response(id: Value, result: Value) -> Value {
    json!({ "jsonrpc": "2.0", "id": id, "result": result })
}

fn error_response(id: Value, code: i64, message: String) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message }
    })
}

/// Render an outcome into the text surfaced to the model.
fn format_outcome(outcome: &ExecOutcome) -> String {
    let mut out = String::new();
    match outcome.status {
        ExecStatus::Success => {}
        ExecStatus::Timeout => {
            out.push_str(&format!("command timed out after {}ms", outcome.duration_ms));
        }
        ExecStatus::Aborted => out.push_str("command aborted"),
        ExecStatus::SpawnError => out.push_str(&format!(
            "failed to start: {}",
            outcome.error.as_deref().unwrap_or("unknown error")
        )),
        ExecStatus::NonzeroExit => {
            out.push_str(&format!("exit code {}", outcome.exit_code.unwrap_or(-1)));
        }
    }

    if !outcome.stdout.is_empty() {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str(&outcome.stdout);
        if outcome.truncated.stdout {
            out.push_str("\n[stdout truncated]");
        }
    }

    if !outcome.stderr.trim().is_empty() {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        out.push_str("[stderr]\n");
        out.push_str(&outcome.stderr);
        if outcome.truncated.stderr {
            out.push_str("\n[stderr truncated]");
        }
    }

    out
}
