//! Upstream chat client with streaming support.
//!
//! # Architecture
//!
//! - [`send_chat`] - issue one streaming chat request and pump normalized
//!   [`StreamEvent`]s into a channel
//! - [`chat`] - request body construction and the chat-completions SSE parser
//! - [`accumulate`] - reconstruction of complete tool calls from streamed
//!   fragments
//!
//! The HTTP response is consumed as a server-sent event stream: `data:`-prefixed
//! JSON lines terminated by a literal `[DONE]` sentinel. Events are pushed
//! through a [`tokio::sync::mpsc::Sender<StreamEvent>`] so the consumer's
//! control flow stays a plain sequential loop over the receiver.
//!
//! # Error Handling
//!
//! Stream-level failures (idle timeout, oversized buffer, malformed payloads
//! past the tolerance threshold, premature EOF) are delivered as
//! [`StreamEvent::Error`] rather than `Err` returns, so partial output is
//! preserved. Only failures that prevent reading the HTTP response at all
//! surface as `Err`. Nothing here retries: retry policy belongs to the caller.

pub mod accumulate;
pub mod chat;
mod sse_types;

use std::sync::OnceLock;
use std::time::Duration;

pub(crate) use anyhow::Result;
use relay_types::StreamEvent;
use tokio::sync::mpsc;

const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Cap on the unconsumed SSE byte buffer; a well-formed stream never comes
/// close.
const MAX_SSE_BUFFER_BYTES: usize = 4 * 1024 * 1024;

/// Consecutive unparseable payloads tolerated before the stream is failed.
const MAX_SSE_PARSE_ERRORS: usize = 3;

const MAX_ERROR_BODY_BYTES: usize = 32 * 1024;

pub fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|e| {
                tracing::error!("Failed to build HTTP client: {e}. Falling back to defaults.");
                reqwest::Client::new()
            })
    })
}

fn find_sse_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n");
    let crlf = buffer.windows(4).position(|w| w == b"\r\n\r\n");
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a <= b { (a, 2) } else { (b, 4) }),
        (Some(a), None) => Some((a, 2)),
        (None, Some(b)) => Some((b, 4)),
        (None, None) => None,
    }
}

fn drain_next_sse_event(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let (pos, delim_len) = find_sse_event_boundary(buffer)?;
    let event = buffer[..pos].to_vec();
    buffer.drain(..pos + delim_len);
    Some(event)
}

fn extract_sse_data(event: &str) -> Option<String> {
    let mut data = String::new();
    let mut found = false;

    for line in event.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if let Some(mut rest) = line.strip_prefix("data:") {
            if let Some(stripped) = rest.strip_prefix(' ') {
                rest = stripped;
            }

            if found {
                data.push('\n');
            }
            data.push_str(rest);
            found = true;
        }
    }

    if found { Some(data) } else { None }
}

#[derive(Debug)]
pub(crate) enum SseParseAction {
    /// Continue processing, no event to emit
    Continue,
    /// Emit these events and continue
    Emit(Vec<StreamEvent>),
    Error(String),
}

pub(crate) async fn send_event(tx: &mpsc::Sender<StreamEvent>, event: StreamEvent) -> bool {
    tx.send(event).await.is_ok()
}

/// Process an SSE response body into [`StreamEvent`]s.
///
/// Handles the transport-level concerns:
/// - idle-read timeout
/// - buffer management with a hard size cap
/// - UTF-8 validation
/// - event boundary detection across chunk splits
/// - the `[DONE]` sentinel
/// - parse-error tracking with a threshold
pub(crate) async fn process_sse_stream(
    response: reqwest::Response,
    parser: &mut chat::ChatStreamParser,
    tx: &mpsc::Sender<StreamEvent>,
    idle_timeout: Duration,
) -> Result<()> {
    use futures_util::StreamExt;

    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    let mut parse_errors = 0usize;

    loop {
        let Ok(next) = tokio::time::timeout(idle_timeout, stream.next()).await else {
            let _ = send_event(tx, StreamEvent::Error("Stream idle timeout".to_string())).await;
            return Ok(());
        };

        let Some(chunk) = next else { break };
        let chunk = chunk?;
        buffer.extend_from_slice(&chunk);

        if buffer.len() > MAX_SSE_BUFFER_BYTES {
            let _ = send_event(
                tx,
                StreamEvent::Error("SSE buffer exceeded maximum size (4 MiB)".to_string()),
            )
            .await;
            return Ok(());
        }

        while let Some(event) = drain_next_sse_event(&mut buffer) {
            if event.is_empty() {
                continue;
            }

            let Ok(event) = std::str::from_utf8(&event) else {
                let _ = send_event(
                    tx,
                    StreamEvent::Error("Received invalid UTF-8 from SSE stream".to_string()),
                )
                .await;
                return Ok(());
            };

            let Some(data) = extract_sse_data(event) else {
                continue;
            };

            if data == "[DONE]" {
                let _ = send_event(tx, StreamEvent::Done).await;
                return Ok(());
            }

            match serde_json::from_str::<serde_json::Value>(&data) {
                Ok(json) => {
                    parse_errors = 0;
                    match parser.parse(&json) {
                        SseParseAction::Continue => {}
                        SseParseAction::Emit(events) => {
                            for event in events {
                                if !send_event(tx, event).await {
                                    return Ok(());
                                }
                            }
                        }
                        SseParseAction::Error(msg) => {
                            let _ = send_event(tx, StreamEvent::Error(msg)).await;
                            return Ok(());
                        }
                    }
                }
                Err(e) => {
                    parse_errors = parse_errors.saturating_add(1);
                    tracing::warn!(
                        %e,
                        payload_bytes = data.len(),
                        "Invalid SSE JSON payload"
                    );
                    if parse_errors >= MAX_SSE_PARSE_ERRORS {
                        let _ = send_event(
                            tx,
                            StreamEvent::Error(format!("Invalid stream payload: {e}")),
                        )
                        .await;
                        return Ok(());
                    }
                }
            }
        }
    }

    // Premature EOF: connection closed without the [DONE] sentinel.
    let _ = send_event(
        tx,
        StreamEvent::Error("Connection closed before stream completed".to_string()),
    )
    .await;
    Ok(())
}

pub async fn read_capped_error_body(response: reqwest::Response) -> String {
    use futures_util::StreamExt;
    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        body.extend_from_slice(&chunk);
        if body.len() > MAX_ERROR_BODY_BYTES {
            body.truncate(MAX_ERROR_BODY_BYTES);
            let text = String::from_utf8_lossy(&body);
            return format!("{text}...(truncated)");
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}

/// One streaming chat request.
pub struct ChatRequest<'a> {
    /// Base URL of the upstream API, without the `/chat/completions` suffix.
    pub base_url: &'a str,
    pub api_key: Option<&'a str>,
    pub model: &'a str,
    pub messages: &'a [relay_types::Message],
    pub tools: &'a [relay_types::ToolDefinition],
    pub idle_timeout: Duration,
    pub tx: mpsc::Sender<StreamEvent>,
}

/// Send one streaming chat request and pump its events into `request.tx`.
pub async fn send_chat(request: ChatRequest<'_>) -> Result<()> {
    let body = chat::build_request_body(request.model, request.messages, request.tools);
    let url = format!(
        "{}/chat/completions",
        request.base_url.trim_end_matches('/')
    );

    let mut builder = http_client()
        .post(&url)
        .header("content-type", "application/json")
        .json(&body);
    if let Some(key) = request.api_key {
        builder = builder.header("Authorization", format!("Bearer {key}"));
    }

    let response = match builder.send().await {
        Ok(response) => response,
        Err(e) => {
            let _ = send_event(&request.tx, StreamEvent::Error(format!("Request failed: {e}")))
                .await;
            return Ok(());
        }
    };

    if !response.status().is_success() {
        let status = response.status();
        let error_text = read_capped_error_body(response).await;
        let _ = send_event(
            &request.tx,
            StreamEvent::Error(format!("API error {status}: {error_text}")),
        )
        .await;
        return Ok(());
    }

    let mut parser = chat::ChatStreamParser::default();
    process_sse_stream(response, &mut parser, &request.tx, request.idle_timeout).await
}
