//! JSON-RPC message shapes for the tool-host dialect.
//!
//! Method names and field casing follow the Model Context Protocol
//! conventions (`initialize`, `notifications/initialized`, `tools/list`,
//! `tools/call`, `protocolVersion`, `inputSchema`, `isError`), carried over
//! newline-delimited frames instead of `Content-Length` framing.

use relay_types::ToolDefinition;
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: &str = "2024-11-05";

pub(crate) const METHOD_INITIALIZE: &str = "initialize";
pub(crate) const METHOD_INITIALIZED: &str = "notifications/initialized";
pub(crate) const METHOD_TOOLS_LIST: &str = "tools/list";
pub(crate) const METHOD_TOOLS_CALL: &str = "tools/call";

#[derive(Debug, Serialize)]
pub(crate) struct Request {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Request {
    pub fn new(id: u64, method: &'static str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Notification {
    pub fn new(method: &'static str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ErrorBody {
    pub code: i64,
    pub message: String,
}

#[derive(Debug)]
pub(crate) enum Incoming {
    Response {
        id: u64,
        result: Option<serde_json::Value>,
        error: Option<ErrorBody>,
    },
    ServerRequest {
        method: String,
    },
    Notification {
        method: String,
    },
}

pub(crate) fn parse_incoming(frame: &serde_json::Value) -> Option<Incoming> {
    let id = frame.get("id");
    let method = frame
        .get("method")
        .and_then(|m| m.as_str())
        .map(String::from);
    let has_result_or_error = frame.get("result").is_some() || frame.get("error").is_some();

    match (id, method, has_result_or_error) {
        (Some(id_val), None, true) => Some(Incoming::Response {
            id: id_val.as_u64()?,
            result: frame.get("result").cloned(),
            error: frame
                .get("error")
                .and_then(|e| serde_json::from_value(e.clone()).ok()),
        }),
        (Some(_), Some(method), _) => Some(Incoming::ServerRequest { method }),
        (None, Some(method), _) => Some(Incoming::Notification { method }),
        _ => None,
    }
}

pub(crate) fn initialize_params() -> serde_json::Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "clientInfo": {
            "name": "relay",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "capabilities": { "tools": {} },
    })
}

#[derive(Debug, Deserialize)]
pub(crate) struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(rename = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServerInfo {
    pub name: Option<String>,
}

/// One entry of a `tools/list` result, `inputSchema` mapped onto the domain
/// `parameters` field.
#[derive(Debug, Deserialize)]
pub(crate) struct ToolEntry {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, rename = "inputSchema")]
    pub input_schema: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<ToolEntry>,
}

impl ToolEntry {
    /// Entries without a usable name are dropped by the caller.
    pub fn into_definition(self) -> Option<ToolDefinition> {
        let name = self.name.filter(|n| !n.trim().is_empty())?;
        Some(ToolDefinition::new(
            name,
            self.description.unwrap_or_default(),
            self.input_schema
                .unwrap_or_else(|| serde_json::json!({ "type": "object" })),
        ))
    }
}

/// Result of one `tools/call`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallToolResult {
    #[serde(default)]
    pub content: String,
    #[serde(default, rename = "isError")]
    pub is_error: bool,
}
