//! Transcript records (persisted) and gateway events (emitted to the caller).

use serde::{Deserialize, Serialize};

use crate::message::Message;
use crate::tool::{ToolCall, ToolResult};

/// One entry in a session's append-only event log.
///
/// Events are immutable once written; a session's effective state is the
/// ordered replay of its records, with `Reset` logically discarding
/// everything before it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriptEvent {
    Message { message: Message },
    ToolCall { call: ToolCall },
    ToolResult { result: ToolResult },
    Reset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptRecord {
    /// Monotonically assigned per session.
    pub seq: u64,
    /// Milliseconds since the Unix epoch.
    pub ts_ms: i64,
    #[serde(flatten)]
    pub event: TranscriptEvent,
}

impl TranscriptRecord {
    #[must_use]
    pub fn new(seq: u64, ts_ms: i64, event: TranscriptEvent) -> Self {
        Self { seq, ts_ms, event }
    }
}

/// Event stream surfaced to the caller, mirroring the turn's progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GatewayPayload {
    Meta {
        session_id: String,
        model: String,
    },
    AssistantStart,
    AssistantEnd {
        content: String,
    },
    Delta {
        text: String,
    },
    ToolCall {
        call: ToolCall,
        /// Set when the call is gated on a pending human approval.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        approval_id: Option<String>,
    },
    ToolResult {
        result: ToolResult,
    },
    Done,
    Error {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayEvent {
    /// Receive timestamp, milliseconds since the Unix epoch.
    pub ts_ms: i64,
    #[serde(flatten)]
    pub payload: GatewayPayload,
}

impl GatewayEvent {
    #[must_use]
    pub fn new(ts_ms: i64, payload: GatewayPayload) -> Self {
        Self { ts_ms, payload }
    }
}
