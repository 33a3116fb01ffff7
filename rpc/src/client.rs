//! Client handle - owns the tool-host subprocess and its RPC lifecycle.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::RpcError;
use crate::codec::{LineReader, LineWriter};
use crate::protocol::{
    self, CallToolResult, Incoming, Notification, Request, ToolsListResult, parse_incoming,
};
use relay_types::ToolDefinition;

const WRITER_CHANNEL_CAPACITY: usize = 64;

/// How a tool host is launched.
#[derive(Debug, Clone)]
pub struct ToolHostConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Timeout for the `initialize` handshake.
    pub init_timeout: Duration,
}

impl Default for ToolHostConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            init_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct ResponseFrame {
    result: Option<serde_json::Value>,
    error: Option<protocol::ErrorBody>,
}

#[derive(Debug)]
struct Shared {
    pending: Mutex<HashMap<u64, oneshot::Sender<ResponseFrame>>>,
    closed: AtomicBool,
    close_reason: std::sync::Mutex<String>,
}

impl Shared {
    fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            close_reason: std::sync::Mutex::new(String::new()),
        }
    }

    fn close_reason(&self) -> String {
        let reason = self
            .close_reason
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default();
        if reason.is_empty() {
            "tool host exited".to_string()
        } else {
            reason
        }
    }

    /// Mark the client closed and reject every outstanding request.
    ///
    /// Dropping the pending senders wakes each waiter immediately; they read
    /// the stored reason for their error message.
    async fn fail_all(&self, reason: &str) {
        if let Ok(mut slot) = self.close_reason.lock()
            && slot.is_empty()
        {
            *slot = reason.to_string();
        }
        self.closed.store(true, Ordering::SeqCst);
        self.pending.lock().await.clear();
    }
}

/// Handle on one tool-host subprocess.
///
/// Cheap to share behind an `Arc`; every method takes `&self`. Once closed
/// (subprocess exit or stream error), the handle stays closed.
#[derive(Debug)]
pub struct ToolHostClient {
    writer_tx: mpsc::Sender<serde_json::Value>,
    next_id: AtomicU64,
    shared: Arc<Shared>,
    /// Held so `kill_on_drop` tears the subprocess down with the client.
    _child: Option<Child>,
    #[allow(dead_code)]
    reader_handle: tokio::task::JoinHandle<()>,
    #[allow(dead_code)]
    writer_handle: tokio::task::JoinHandle<()>,
}

impl ToolHostClient {
    /// Spawn the configured tool host and complete the handshake.
    pub async fn spawn(config: &ToolHostConfig) -> Result<Self, RpcError> {
        let resolved = which::which(&config.command)
            .map_err(|e| RpcError::Spawn(format!("{} not found: {e}", config.command)))?;

        let mut cmd = Command::new(&resolved);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Strip secret-bearing env vars before the host can observe them.
        for (key, _) in std::env::vars() {
            if relay_types::is_denylisted_env(&key) {
                cmd.env_remove(&key);
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| RpcError::Spawn(format!("spawning {}: {e}", config.command)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RpcError::Spawn("no stdout from tool host".to_string()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RpcError::Spawn("no stdin from tool host".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "relay_rpc::tool_host", "{line}");
                }
            });
        }

        let mut client = Self::attach(stdout, stdin);
        client._child = Some(child);
        client.initialize(config.init_timeout).await?;
        Ok(client)
    }

    /// Connect over an arbitrary transport and complete the handshake.
    ///
    /// Used for in-process hosts and tests; [`ToolHostClient::spawn`] is the
    /// production path.
    pub async fn connect<R, W>(reader: R, writer: W, init_timeout: Duration) -> Result<Self, RpcError>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let client = Self::attach(reader, writer);
        client.initialize(init_timeout).await?;
        Ok(client)
    }

    fn attach<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::new(Shared::new());

        let (writer_tx, mut writer_rx) = mpsc::channel::<serde_json::Value>(WRITER_CHANNEL_CAPACITY);
        let writer_shared = shared.clone();
        let writer_handle = tokio::spawn(async move {
            let mut writer = LineWriter::new(writer);
            while let Some(frame) = writer_rx.recv().await {
                if let Err(e) = writer.write_message(&frame).await {
                    tracing::warn!("Tool host write error: {e}");
                    writer_shared.fail_all(&format!("tool host write error: {e}")).await;
                    break;
                }
            }
        });

        let reader_shared = shared.clone();
        let reader_handle = tokio::spawn(async move {
            let mut reader = LineReader::new(reader);
            loop {
                match reader.read_message().await {
                    Ok(Some(frame)) => Self::dispatch_frame(&frame, &reader_shared).await,
                    Ok(None) => {
                        tracing::info!("Tool host closed stdout");
                        reader_shared.fail_all("tool host closed stdout").await;
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Tool host read error: {e}");
                        reader_shared
                            .fail_all(&format!("tool host read error: {e}"))
                            .await;
                        break;
                    }
                }
            }
        });

        Self {
            writer_tx,
            next_id: AtomicU64::new(1),
            shared,
            _child: None,
            reader_handle,
            writer_handle,
        }
    }

    async fn dispatch_frame(frame: &serde_json::Value, shared: &Shared) {
        let Some(incoming) = parse_incoming(frame) else {
            tracing::trace!("Ignoring malformed JSON-RPC frame from tool host");
            return;
        };

        match incoming {
            Incoming::Response { id, result, error } => {
                let sender = shared.pending.lock().await.remove(&id);
                match sender {
                    Some(tx) => {
                        let _ = tx.send(ResponseFrame { result, error });
                    }
                    // Forgotten calls (timeout) land here; a late response is
                    // dropped by id-miss.
                    None => tracing::trace!(id, "Dropping response for unknown request id"),
                }
            }
            // One-directional RPC: the host never gets to drive us.
            Incoming::ServerRequest { method } => {
                tracing::trace!("Ignoring request from tool host: {method}");
            }
            Incoming::Notification { method } => {
                tracing::trace!("Ignoring notification from tool host: {method}");
            }
        }
    }

    async fn initialize(&self, timeout: Duration) -> Result<(), RpcError> {
        let result = self
            .send_request(
                protocol::METHOD_INITIALIZE,
                Some(protocol::initialize_params()),
                timeout,
            )
            .await
            .map_err(|e| RpcError::Handshake(e.to_string()))?;

        match serde_json::from_value::<protocol::InitializeResult>(result) {
            Ok(init) => {
                let version = init.protocol_version.unwrap_or_default();
                if version != protocol::PROTOCOL_VERSION {
                    tracing::warn!(
                        host_version = %version,
                        client_version = protocol::PROTOCOL_VERSION,
                        "Tool host protocol version mismatch"
                    );
                }
                if let Some(info) = init.server_info {
                    tracing::debug!(name = ?info.name, "Tool host initialized");
                }
            }
            Err(e) => {
                tracing::warn!("Unreadable initialize result from tool host: {e}");
            }
        }

        self.send_notification(protocol::METHOD_INITIALIZED, None)
            .await
            .map_err(|e| RpcError::Handshake(e.to_string()))?;

        Ok(())
    }

    /// Fetch the host's tool catalog, dropping entries without a valid name.
    pub async fn list_tools(&self, timeout: Duration) -> Result<Vec<ToolDefinition>, RpcError> {
        let result = self
            .send_request(protocol::METHOD_TOOLS_LIST, None, timeout)
            .await?;

        let listed: ToolsListResult = serde_json::from_value(result)
            .map_err(|e| RpcError::Protocol(format!("bad tools/list result: {e}")))?;

        let mut tools = Vec::new();
        for entry in listed.tools {
            match entry.into_definition() {
                Some(def) => tools.push(def),
                None => tracing::warn!("Skipping tool host entry without a name"),
            }
        }
        Ok(tools)
    }

    /// Invoke one tool with a per-call timeout.
    ///
    /// On timeout the pending entry is forgotten; a late response from the
    /// host is silently dropped by id-miss.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: &serde_json::Value,
        timeout: Duration,
    ) -> Result<CallToolResult, RpcError> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments,
        });
        let result = self
            .send_request(protocol::METHOD_TOOLS_CALL, Some(params), timeout)
            .await?;

        serde_json::from_value(result)
            .map_err(|e| RpcError::Protocol(format!("bad tools/call result: {e}")))
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    async fn send_request(
        &self,
        method: &'static str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, RpcError> {
        if self.is_closed() {
            return Err(RpcError::Closed(self.shared.close_reason()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id, tx);

        let request = Request::new(id, method, params);
        let frame = serde_json::to_value(&request)
            .map_err(|e| RpcError::Protocol(format!("serializing request: {e}")))?;
        if self.writer_tx.send(frame).await.is_err() {
            self.shared.pending.lock().await.remove(&id);
            return Err(RpcError::Closed(self.shared.close_reason()));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => {
                if let Some(error) = response.error {
                    return Err(RpcError::Host {
                        code: error.code,
                        message: error.message,
                    });
                }
                Ok(response.result.unwrap_or(serde_json::Value::Null))
            }
            Ok(Err(_)) => Err(RpcError::Closed(self.shared.close_reason())),
            Err(_) => {
                // Forget the call so repeated timeouts don't grow the map and
                // a late response finds nothing to deliver to.
                self.shared.pending.lock().await.remove(&id);
                Err(RpcError::Timeout {
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    async fn send_notification(
        &self,
        method: &'static str,
        params: Option<serde_json::Value>,
    ) -> Result<(), RpcError> {
        let notification = Notification::new(method, params);
        let frame = serde_json::to_value(&notification)
            .map_err(|e| RpcError::Protocol(format!("serializing notification: {e}")))?;
        self.writer_tx
            .send(frame)
            .await
            .map_err(|_| RpcError::Closed(self.shared.close_reason()))
    }
}
