//! Relay binary - gateway and tool-host entry points.
//!
//! Two modes share one executable:
//!
//! - `relay chat [-s SESSION] [-c CONFIG] [PROMPT...]` runs a single user
//!   turn against the configured upstream, printing gateway events as
//!   `data:`-prefixed JSON lines and prompting on stderr for any approval
//!   the policy requires.
//! - `relay host [--root DIR] [--max-output-bytes N] [--timeout-secs N]`
//!   runs the tool-host side of the RPC protocol over stdio. The gateway
//!   spawns this mode as its subprocess; stdout is protocol-only, logs go to
//!   stderr.
//! - `relay sessions [-c CONFIG]` lists recorded sessions.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use relay_engine::{
    ApprovalDecision, ApprovalHub, ApprovalId, GatewayConfig, Orchestrator, TurnRequest,
};
use relay_rpc::{ToolHostClient, ToolHostConfig};
use relay_store::SessionStore;
use relay_tools::{ExecLimits, ToolHost};
use relay_types::{GatewayEvent, GatewayPayload, SessionId};

const DEFAULT_CONFIG_PATH: &str = "relay.toml";
const DEFAULT_SESSION: &str = "default";

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // Stderr only: in host mode stdout carries the RPC protocol.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("host") => run_host(&args[1..]).await,
        Some("chat") => run_chat(&args[1..]).await,
        Some("sessions") => run_sessions(&args[1..]),
        _ => {
            eprintln!("usage: relay <chat|host|sessions> [options]");
            std::process::exit(2);
        }
    }
}

/// Pull `--flag value` out of an argument list.
fn flag_value(args: &[String], long: &str, short: Option<&str>) -> Option<String> {
    args.iter()
        .position(|arg| arg == long || short.is_some_and(|s| arg == s))
        .and_then(|i| args.get(i + 1).cloned())
}

/// Everything that is not a recognized flag or its value.
fn positional(args: &[String], flags: &[(&str, Option<&str>)]) -> Vec<String> {
    let mut skip_next = false;
    let mut out = Vec::new();
    for arg in args {
        if skip_next {
            skip_next = false;
            continue;
        }
        if flags
            .iter()
            .any(|(long, short)| arg == long || short.is_some_and(|s| arg == s))
        {
            skip_next = true;
            continue;
        }
        out.push(arg.clone());
    }
    out
}

async fn run_host(args: &[String]) -> Result<()> {
    let root = flag_value(args, "--root", None)
        .map_or_else(|| std::env::current_dir().context("resolving cwd"), |r| Ok(PathBuf::from(r)))?;

    let mut host = ToolHost::new(root.clone());
    if let Some(bytes) = flag_value(args, "--max-output-bytes", None) {
        let cap: usize = bytes.parse().context("parsing --max-output-bytes")?;
        host = host.with_limits(ExecLimits {
            max_stdout_bytes: cap,
            max_stderr_bytes: cap,
        });
    }
    if let Some(secs) = flag_value(args, "--timeout-secs", None) {
        let secs: u64 = secs.parse().context("parsing --timeout-secs")?;
        host = host.with_default_timeout(Duration::from_secs(secs));
    }

    tracing::info!(root = %root.display(), "Tool host serving on stdio");
    host.serve_stdio().await
}

async fn run_chat(args: &[String]) -> Result<()> {
    let flags = [("--session", Some("-s")), ("--config", Some("-c"))];

    let config_path = flag_value(args, "--config", Some("-c"))
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = GatewayConfig::load_or_default(std::path::Path::new(&config_path))?;

    let session = flag_value(args, "--session", Some("-s"))
        .unwrap_or_else(|| DEFAULT_SESSION.to_string());
    let session_id = SessionId::new(session).context("invalid session id")?;

    let mut prompt = positional(args, &flags).join(" ");
    if prompt.trim().is_empty() {
        let mut line = String::new();
        std::io::stdin()
            .read_line(&mut line)
            .context("reading prompt from stdin")?;
        prompt = line.trim().to_string();
    }
    if prompt.is_empty() {
        bail!("no prompt given");
    }

    let host_config = tool_host_config(&config)?;
    let tool_host = Arc::new(
        ToolHostClient::spawn(&host_config)
            .await
            .context("starting tool host")?,
    );
    let tools = tool_host
        .list_tools(Duration::from_secs(30))
        .await
        .context("listing tools")?;
    tracing::info!(count = tools.len(), "Tool host ready");

    let store = Arc::new(SessionStore::new(&config.sessions.root)?);
    let approvals = ApprovalHub::new();
    let orchestrator = Orchestrator::new(config, store, tool_host, approvals.clone(), tools);

    let (events_tx, mut events_rx) = mpsc::channel::<GatewayEvent>(256);
    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => println!("data: {json}"),
                Err(e) => tracing::warn!("Failed to serialize gateway event: {e}"),
            }

            if let GatewayPayload::ToolCall {
                call,
                approval_id: Some(id),
            } = &event.payload
            {
                let decision = prompt_approval(&call.name).await;
                if let Err(e) = approvals.decide(&ApprovalId::from(id.as_str()), decision, None) {
                    tracing::warn!("Approval decision not delivered: {e}");
                }
            }
        }
    });

    let cancel = CancellationToken::new();
    let turn = TurnRequest {
        session_id,
        user_text: prompt,
        events: events_tx,
        cancel: cancel.clone(),
    };

    let mut run = tokio::spawn(async move { orchestrator.run_turn(turn).await });
    tokio::select! {
        result = &mut run => result.context("turn task")??,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupt received; cancelling turn");
            cancel.cancel();
            let _ = run.await;
        }
    }

    let _ = printer.await;
    Ok(())
}

fn run_sessions(args: &[String]) -> Result<()> {
    let config_path = flag_value(args, "--config", Some("-c"))
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = GatewayConfig::load_or_default(std::path::Path::new(&config_path))?;

    let store = SessionStore::new(&config.sessions.root)?;
    for meta in store.list_sessions()? {
        println!(
            "{}\t{}\t{}",
            meta.id,
            meta.last_model.as_deref().unwrap_or("-"),
            meta.title
        );
    }
    Ok(())
}

/// The default host command is this very binary in host mode; exec limits
/// from the config ride along as host flags.
fn tool_host_config(config: &GatewayConfig) -> Result<ToolHostConfig> {
    let own_binary = config.tools.host_command == "relay";
    let command = if own_binary {
        std::env::current_exe()
            .context("resolving own executable")?
            .to_string_lossy()
            .into_owned()
    } else {
        config.tools.host_command.clone()
    };

    let mut args = config.tools.host_args.clone();
    if own_binary {
        args.push("--max-output-bytes".to_string());
        args.push(config.tools.max_output_bytes.to_string());
        args.push("--timeout-secs".to_string());
        args.push(config.tools.exec_timeout_secs.to_string());
    }

    Ok(ToolHostConfig {
        command,
        args,
        init_timeout: Duration::from_secs(30),
    })
}

/// Ask the human on stderr; anything but an explicit yes denies.
async fn prompt_approval(tool_name: &str) -> ApprovalDecision {
    eprint!("approve tool call `{tool_name}`? [y/N] ");
    let line = tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
        line
    })
    .await
    .unwrap_or_default();

    if line.trim().eq_ignore_ascii_case("y") {
        ApprovalDecision::Approve
    } else {
        ApprovalDecision::Deny
    }
}
