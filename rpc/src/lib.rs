//! Tool-host RPC: newline-delimited JSON-RPC 2.0 over a subprocess's
//! standard streams.
//!
//! The client owns one long-lived tool-host subprocess. Requests and
//! responses travel over stdin/stdout, one compact JSON object per line;
//! stderr carries diagnostic text only and is drained into `tracing`. The
//! protocol is one-directional: the client calls `initialize`, `tools/list`
//! and `tools/call`, and ignores anything the host initiates.
//!
//! There is no auto-restart. When the subprocess exits, every outstanding
//! request is rejected and the client stays permanently closed; restarting
//! is the owner's decision.

mod client;
mod codec;
pub mod protocol;

pub use client::{ToolHostClient, ToolHostConfig};
pub use codec::{LineReader, LineWriter};
pub use protocol::{CallToolResult, PROTOCOL_VERSION};

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("failed to spawn tool host: {0}")]
    Spawn(String),
    #[error("tool host handshake failed: {0}")]
    Handshake(String),
    #[error("tool host is closed: {0}")]
    Closed(String),
    #[error("{method} timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },
    #[error("tool host error {code}: {message}")]
    Host { code: i64, message: String },
    #[error("protocol error: {0}")]
    Protocol(String),
}
