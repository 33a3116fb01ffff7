//! Typed serde views of upstream SSE payloads.
//!
//! Deserialization is deliberately tolerant: unknown fields are ignored and
//! every field the parser can live without is optional, so a vendor adding
//! payload members never breaks the stream.

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub(crate) struct ChatChunk {
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub error: Option<UpstreamError>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Choice {
    #[serde(default)]
    pub delta: Option<Delta>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Delta {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<ToolCallDelta>>,
}

/// One streamed tool-call fragment. Vendors disagree on framing: arguments
/// and name may arrive nested under `function` or flat on the entry.
#[derive(Debug, Deserialize)]
pub(crate) struct ToolCallDelta {
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<FunctionDelta>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct FunctionDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UpstreamError {
    #[serde(default)]
    pub message: Option<String>,
}

impl ToolCallDelta {
    /// Collapse the two framings into `(name, arguments)`, nested form first.
    pub(crate) fn into_parts(self) -> (Option<u32>, Option<String>, Option<String>, Option<String>) {
        let (func_name, func_args) = match self.function {
            Some(f) => (f.name, f.arguments),
            None => (None, None),
        };
        (
            self.index,
            self.id,
            func_name.or(self.name),
            func_args.or(self.arguments),
        )
    }
}
