//! Normalized streaming events from the upstream chat protocol.

use serde::{Deserialize, Serialize};

/// One partial piece of a tool call delivered during streaming.
///
/// Vendors differ in how fragments are keyed: by numeric `index`, by stable
/// `id`, or by neither. All fields are optional here; correlation is the
/// accumulator's job, not the parser's.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallFragment {
    pub index: Option<u32>,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// Events emitted by the upstream stream parser, consumed by the orchestrator
/// through a channel receiver in a plain sequential loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Incremental (or cumulative, vendor-dependent) assistant text.
    TextDelta(String),
    /// Partial tool call to be merged by the accumulator.
    ToolCallDelta(ToolCallFragment),
    /// `choices[0].finish_reason`, when present.
    FinishReason(String),
    /// Stream completed successfully.
    Done,
    /// Stream terminated with an error; partial output may precede this.
    Error(String),
}
