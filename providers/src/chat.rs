//! Chat-completions request construction and SSE payload parsing.

use relay_types::{Message, StreamEvent, ToolCallFragment, ToolDefinition};
use serde_json::{Value, json};

use crate::SseParseAction;
use crate::sse_types::ChatChunk;

/// Build the streaming request body: `{model, stream, tool_choice, tools,
/// messages}`.
///
/// Tool calls in history are re-serialized into the wire's nested `function`
/// framing with stringified arguments; `tool` messages carry their
/// `tool_call_id`.
pub(crate) fn build_request_body(
    model: &str,
    messages: &[Message],
    tools: &[ToolDefinition],
) -> Value {
    let wire_messages: Vec<Value> = messages.iter().map(wire_message).collect();

    let mut body = serde_json::Map::new();
    body.insert("model".to_string(), json!(model));
    body.insert("stream".to_string(), json!(true));
    body.insert("messages".to_string(), Value::Array(wire_messages));

    if !tools.is_empty() {
        let tool_defs: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect();
        body.insert("tools".to_string(), Value::Array(tool_defs));
        body.insert("tool_choice".to_string(), json!("auto"));
    }

    Value::Object(body)
}

fn wire_message(msg: &Message) -> Value {
    match msg {
        Message::Assistant(m) if !m.tool_calls.is_empty() => {
            let calls: Vec<Value> = m
                .tool_calls
                .iter()
                .map(|call| {
                    let args_json = serde_json::to_string(&call.arguments)
                        .unwrap_or_else(|_| "{}".to_string());
                    json!({
                        "id": call.id,
                        "type": "function",
                        "function": { "name": call.name, "arguments": args_json }
                    })
                })
                .collect();
            json!({
                "role": "assistant",
                "content": m.content,
                "tool_calls": calls,
            })
        }
        Message::Tool(m) => json!({
            "role": "tool",
            "content": m.content,
            "tool_call_id": m.tool_call_id,
        }),
        other => json!({
            "role": other.role_str(),
            "content": other.content(),
        }),
    }
}

/// Parser for chat-completions stream payloads.
///
/// Stateless apart from forward-compatibility bookkeeping; correlation of
/// tool-call fragments is the accumulator's job, so fragments pass through
/// raw.
#[derive(Default)]
pub(crate) struct ChatStreamParser;

impl ChatStreamParser {
    pub(crate) fn parse(&mut self, json: &Value) -> SseParseAction {
        let chunk: ChatChunk = match serde_json::from_value(json.clone()) {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::debug!("Failed to parse chat SSE payload: {e}");
                return SseParseAction::Continue;
            }
        };

        if let Some(error) = chunk.error {
            let message = error
                .message
                .unwrap_or_else(|| "Unknown upstream error".to_string());
            return SseParseAction::Error(message);
        }

        let mut events = Vec::new();

        if let Some(choice) = chunk.choices.into_iter().next() {
            if let Some(delta) = choice.delta {
                if let Some(content) = delta.content
                    && !content.is_empty()
                {
                    events.push(StreamEvent::TextDelta(content));
                }

                if let Some(calls) = delta.tool_calls {
                    for call in calls {
                        let (index, id, name, arguments) = call.into_parts();
                        events.push(StreamEvent::ToolCallDelta(ToolCallFragment {
                            index,
                            id,
                            name,
                            arguments,
                        }));
                    }
                }
            }

            if let Some(reason) = choice.finish_reason {
                events.push(StreamEvent::FinishReason(reason));
            }
        }

        if events.is_empty() {
            SseParseAction::Continue
        } else {
            SseParseAction::Emit(events)
        }
    }
}
