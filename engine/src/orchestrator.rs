//! The turn control loop.
//!
//! Flow per user turn: persist the user message, build a budgeted context,
//! stream the upstream response while feeding the accumulator, then either
//! finish (no tool calls) or execute the calls sequentially in model
//! emission order - policy gate, approval wait, RPC dispatch - persisting
//! and re-emitting every step, and loop back upstream with the results.
//!
//! Sequential tool execution is deliberate: it trades throughput for
//! deterministic ordering and simple error attribution.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use relay_providers::accumulate::ToolCallAccumulator;
use relay_providers::{ChatRequest, send_chat};
use relay_rpc::{RpcError, ToolHostClient};
use relay_store::SessionStore;
use relay_types::{
    GatewayEvent, GatewayPayload, Message, SessionId, StreamEvent, ToolCall, ToolDefinition,
    ToolResult, TranscriptEvent, TranscriptRecord,
};

use crate::EngineError;
use crate::approvals::{self, ApprovalHub};
use crate::config::GatewayConfig;
use crate::policy::PolicyVerdict;
use crate::truncate;

const STREAM_EVENT_CHANNEL_CAPACITY: usize = 1024;
const MAX_TITLE_CHARS: usize = 64;

fn now_unix_ms() -> i64 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    i64::try_from(duration.as_millis()).unwrap_or(0)
}

async fn emit(events: &mpsc::Sender<GatewayEvent>, payload: GatewayPayload) -> bool {
    events
        .send(GatewayEvent::new(now_unix_ms(), payload))
        .await
        .is_ok()
}

fn derive_title(user_text: &str) -> String {
    let first_line = user_text.lines().next().unwrap_or_default().trim();
    first_line.chars().take(MAX_TITLE_CHARS).collect()
}

/// Parse accumulated raw arguments. Unparseable payloads are preserved as a
/// raw string alongside the error so the call is still recorded honestly.
fn parse_arguments(raw: &str) -> (serde_json::Value, Option<String>) {
    if raw.trim().is_empty() {
        return (serde_json::json!({}), None);
    }
    match serde_json::from_str(raw) {
        Ok(value) => (value, None),
        Err(e) => (serde_json::Value::String(raw.to_string()), Some(e.to_string())),
    }
}

/// Rebuild chat history from effective transcript records. Tool calls ride
/// inside their assistant message; `tool_call` records are audit entries.
fn history_from_records(records: &[TranscriptRecord]) -> Vec<Message> {
    records
        .iter()
        .filter_map(|record| match &record.event {
            TranscriptEvent::Message { message } => Some(message.clone()),
            TranscriptEvent::ToolResult { result } => Some(Message::tool_result(result)),
            TranscriptEvent::ToolCall { .. } | TranscriptEvent::Reset => None,
        })
        .collect()
}

/// One user turn to drive.
pub struct TurnRequest {
    pub session_id: SessionId,
    pub user_text: String,
    /// Gateway events stream here; a closed receiver counts as a client
    /// disconnect.
    pub events: mpsc::Sender<GatewayEvent>,
    /// Client-disconnect signal: aborts the upstream read, cancels pending
    /// approvals, suppresses further output. Already-persisted records stay.
    pub cancel: CancellationToken,
}

struct AssistantTurn {
    text: String,
    calls: Vec<relay_providers::accumulate::CompletedToolCall>,
    finish_reason: Option<String>,
}

enum StreamOutcome {
    Completed(AssistantTurn),
    Failed(String),
    Canceled,
}

enum CallOutcome {
    Result(ToolResult),
    Canceled,
    TurnFailed(String),
}

/// Drives turns for any number of concurrent sessions.
///
/// No mutable turn state lives on this struct; everything per-turn is local
/// to [`Orchestrator::run_turn`], so sessions never share it.
pub struct Orchestrator {
    config: GatewayConfig,
    store: Arc<SessionStore>,
    tool_host: Arc<ToolHostClient>,
    approvals: ApprovalHub,
    tools: Vec<ToolDefinition>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        config: GatewayConfig,
        store: Arc<SessionStore>,
        tool_host: Arc<ToolHostClient>,
        approvals: ApprovalHub,
        tools: Vec<ToolDefinition>,
    ) -> Self {
        Self {
            config,
            store,
            tool_host,
            approvals,
            tools,
        }
    }

    /// The approval registry, for wiring up the decision endpoint.
    #[must_use]
    pub fn approvals(&self) -> &ApprovalHub {
        &self.approvals
    }

    #[must_use]
    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Run one multi-step exchange to completion.
    ///
    /// Protocol, policy and resource failures terminate the turn, not the
    /// process: they surface as gateway events and `Ok(())`. `Err` is
    /// reserved for persistence failures the caller must see.
    pub async fn run_turn(&self, request: TurnRequest) -> Result<(), EngineError> {
        let TurnRequest {
            session_id,
            user_text,
            events,
            cancel,
        } = request;

        let meta = self.store.ensure_session(&session_id)?;
        let mut history = history_from_records(&self.store.read_effective_events(&session_id)?);

        if history.is_empty() && meta.title == session_id.as_str() {
            let title = derive_title(&user_text);
            if !title.is_empty() {
                self.store
                    .update_meta(&session_id, |meta| meta.title = title)?;
            }
        }

        let user_message = Message::user(user_text);
        self.store.append_event(
            &session_id,
            TranscriptEvent::Message {
                message: user_message.clone(),
            },
        )?;
        history.push(user_message);

        if !emit(
            &events,
            GatewayPayload::Meta {
                session_id: session_id.to_string(),
                model: self.config.upstream.model.clone(),
            },
        )
        .await
        {
            return Ok(());
        }

        let mut call_counter = 0usize;
        let mut iteration = 0u32;

        loop {
            iteration += 1;

            let context = truncate::truncate(&history, self.config.context.budget_tokens);
            tracing::debug!(
                session = %session_id,
                used_tokens = context.used_tokens,
                dropped = context.dropped,
                "Built upstream context"
            );

            let turn = match self
                .stream_assistant(context.messages, &events, &cancel)
                .await
            {
                StreamOutcome::Canceled => {
                    self.approvals.cancel_session(&session_id);
                    return Ok(());
                }
                StreamOutcome::Failed(message) => {
                    tracing::warn!(session = %session_id, "Upstream stream failed: {message}");
                    let _ = emit(&events, GatewayPayload::Error { message }).await;
                    return Ok(());
                }
                StreamOutcome::Completed(turn) => turn,
            };

            // Convert reconstructed calls into protocol tool calls;
            // unparseable argument payloads become pre-resolved errors.
            let mut tool_calls: Vec<ToolCall> = Vec::new();
            let mut pre_resolved: Vec<ToolResult> = Vec::new();
            for completed in turn.calls {
                call_counter += 1;
                let id = completed
                    .id
                    .unwrap_or_else(|| format!("call_{call_counter}"));
                let (arguments, parse_error) = parse_arguments(&completed.arguments_raw);
                if let Some(e) = parse_error {
                    pre_resolved.push(ToolResult::error(
                        &id,
                        &completed.name,
                        format!("invalid tool arguments: {e}"),
                    ));
                }
                tool_calls.push(ToolCall::new(id, completed.name, arguments));
            }

            let assistant =
                Message::assistant_with_tool_calls(turn.text.clone(), tool_calls.clone());
            self.store.append_event(
                &session_id,
                TranscriptEvent::Message {
                    message: assistant.clone(),
                },
            )?;
            let model = self.config.upstream.model.clone();
            self.store
                .update_meta(&session_id, move |meta| meta.last_model = Some(model))?;

            if !emit(&events, GatewayPayload::AssistantEnd { content: turn.text }).await {
                return Ok(());
            }
            history.push(assistant);

            if tool_calls.is_empty() {
                if turn.finish_reason.as_deref() == Some("tool_calls") {
                    tracing::debug!("finish_reason was tool_calls but nothing accumulated");
                }
                let _ = emit(&events, GatewayPayload::Done).await;
                return Ok(());
            }

            let iterations_exhausted = iteration >= self.config.tools.max_iterations;

            for call in &tool_calls {
                let pre = pre_resolved
                    .iter()
                    .find(|result| result.tool_call_id == call.id)
                    .cloned();

                let result = match pre {
                    Some(result) => {
                        if !self.announce_call(&session_id, &events, call, None).await? {
                            return Ok(());
                        }
                        result
                    }
                    None if iterations_exhausted => {
                        if !self.announce_call(&session_id, &events, call, None).await? {
                            return Ok(());
                        }
                        ToolResult::error(&call.id, &call.name, "Max tool iterations reached")
                    }
                    None => match self
                        .execute_call(&session_id, &events, call, &cancel)
                        .await?
                    {
                        CallOutcome::Canceled => {
                            self.approvals.cancel_session(&session_id);
                            return Ok(());
                        }
                        CallOutcome::TurnFailed(message) => {
                            tracing::warn!(session = %session_id, "{message}");
                            let _ = emit(&events, GatewayPayload::Error { message }).await;
                            return Ok(());
                        }
                        CallOutcome::Result(result) => result,
                    },
                };

                self.store.append_event(
                    &session_id,
                    TranscriptEvent::ToolResult {
                        result: result.clone(),
                    },
                )?;
                if !emit(
                    &events,
                    GatewayPayload::ToolResult {
                        result: result.clone(),
                    },
                )
                .await
                {
                    return Ok(());
                }
                history.push(Message::tool_result(&result));
            }

            if iterations_exhausted {
                tracing::warn!(
                    session = %session_id,
                    limit = self.config.tools.max_iterations,
                    "Max tool iterations reached; ending turn"
                );
                let _ = emit(&events, GatewayPayload::Done).await;
                return Ok(());
            }
        }
    }

    /// Stream one assistant response, feeding the accumulator and re-emitting
    /// text deltas, until the upstream signals completion.
    async fn stream_assistant(
        &self,
        messages: Vec<Message>,
        events: &mpsc::Sender<GatewayEvent>,
        cancel: &CancellationToken,
    ) -> StreamOutcome {
        let (tx, mut rx) = mpsc::channel::<StreamEvent>(STREAM_EVENT_CHANNEL_CAPACITY);

        let base_url = self.config.upstream.base_url.clone();
        let api_key = std::env::var(&self.config.upstream.api_key_env).ok();
        let model = self.config.upstream.model.clone();
        let tools = self.tools.clone();
        let idle_timeout = self.config.idle_timeout();

        let upstream = tokio::spawn(async move {
            let request = ChatRequest {
                base_url: &base_url,
                api_key: api_key.as_deref(),
                model: &model,
                messages: &messages,
                tools: &tools,
                idle_timeout,
                tx: tx.clone(),
            };
            if let Err(e) = send_chat(request).await {
                tracing::warn!("Upstream streaming request failed: {e}");
                let _ = tx.send(StreamEvent::Error(e.to_string())).await;
            }
        });

        if !emit(events, GatewayPayload::AssistantStart).await {
            upstream.abort();
            return StreamOutcome::Canceled;
        }

        let mut accumulator = ToolCallAccumulator::new();
        let mut finish_reason = None;

        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => {
                    upstream.abort();
                    return StreamOutcome::Canceled;
                }
                event = rx.recv() => event,
            };

            match event {
                None => {
                    return StreamOutcome::Failed("stream ended without completion".to_string());
                }
                Some(StreamEvent::TextDelta(chunk)) => {
                    accumulator.push_text(&chunk);
                    if !emit(events, GatewayPayload::Delta { text: chunk }).await {
                        upstream.abort();
                        return StreamOutcome::Canceled;
                    }
                }
                Some(StreamEvent::ToolCallDelta(fragment)) => {
                    accumulator.push_fragment(&fragment);
                }
                Some(StreamEvent::FinishReason(reason)) => finish_reason = Some(reason),
                Some(StreamEvent::Done) => break,
                Some(StreamEvent::Error(message)) => {
                    upstream.abort();
                    return StreamOutcome::Failed(message);
                }
            }
        }

        let text = accumulator.text().to_string();
        let calls = accumulator.finish();
        StreamOutcome::Completed(AssistantTurn {
            text,
            calls,
            finish_reason,
        })
    }

    /// Persist the `tool_call` record and surface it to the caller.
    /// Returns false when the caller has disconnected.
    async fn announce_call(
        &self,
        session_id: &SessionId,
        events: &mpsc::Sender<GatewayEvent>,
        call: &ToolCall,
        approval_id: Option<String>,
    ) -> Result<bool, EngineError> {
        self.store.append_event(
            session_id,
            TranscriptEvent::ToolCall { call: call.clone() },
        )?;
        Ok(emit(
            events,
            GatewayPayload::ToolCall {
                call: call.clone(),
                approval_id,
            },
        )
        .await)
    }

    /// Gate one call on policy and approval, then dispatch it to the host.
    async fn execute_call(
        &self,
        session_id: &SessionId,
        events: &mpsc::Sender<GatewayEvent>,
        call: &ToolCall,
        cancel: &CancellationToken,
    ) -> Result<CallOutcome, EngineError> {
        match self.config.approvals.policy.check(&call.name) {
            PolicyVerdict::Deny { reason } => {
                if !self.announce_call(session_id, events, call, None).await? {
                    return Ok(CallOutcome::Canceled);
                }
                return Ok(CallOutcome::Result(ToolResult::error(
                    &call.id,
                    &call.name,
                    format!("tool call denied: {reason}"),
                )));
            }
            PolicyVerdict::Allow => {
                if !self.announce_call(session_id, events, call, None).await? {
                    return Ok(CallOutcome::Canceled);
                }
            }
            PolicyVerdict::NeedsApproval => {
                let (approval_id, rx) = self
                    .approvals
                    .create(session_id, self.config.approval_timeout());
                if !self
                    .announce_call(session_id, events, call, Some(approval_id.to_string()))
                    .await?
                {
                    return Ok(CallOutcome::Canceled);
                }

                let resolution = tokio::select! {
                    () = cancel.cancelled() => return Ok(CallOutcome::Canceled),
                    resolution = approvals::wait(rx) => resolution,
                };

                if !resolution.approved {
                    // Policy outcome, surfaced to the model as a structured
                    // tool error it can react to.
                    let reason = if resolution.timed_out {
                        "approval timed out"
                    } else if resolution.canceled {
                        "approval canceled"
                    } else {
                        "approval denied"
                    };
                    return Ok(CallOutcome::Result(ToolResult::error(
                        &call.id,
                        &call.name,
                        format!("tool call not executed: {reason}"),
                    )));
                }
            }
        }

        match self
            .tool_host
            .call_tool(&call.name, &call.arguments, self.config.call_timeout())
            .await
        {
            Ok(result) => Ok(CallOutcome::Result(if result.is_error {
                ToolResult::error(&call.id, &call.name, result.content)
            } else {
                ToolResult::success(&call.id, &call.name, result.content)
            })),
            // A dead tool host ends the turn; everything else is a per-call
            // failure the model gets to see.
            Err(e @ (RpcError::Closed(_) | RpcError::Spawn(_) | RpcError::Handshake(_))) => {
                Ok(CallOutcome::TurnFailed(format!("tool host unavailable: {e}")))
            }
            Err(e) => Ok(CallOutcome::Result(ToolResult::error(
                &call.id,
                &call.name,
                format!("tool call failed: {e}"),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use relay_rpc::ToolHostClient;
    use relay_store::SessionStore;
    use relay_tools::ToolHost;
    use relay_types::{GatewayEvent, GatewayPayload, Message, SessionId, TranscriptEvent};

    use super::{Orchestrator, TurnRequest, history_from_records, parse_arguments};
    use crate::approvals::{ApprovalDecision, ApprovalHub};
    use crate::config::{ApprovalsConfig, GatewayConfig, SessionsConfig, UpstreamConfig};
    use crate::policy::{ApprovalMode, ToolPolicy};

    fn sse_body(chunks: &[serde_json::Value]) -> String {
        let mut body = String::new();
        for chunk in chunks {
            body.push_str(&format!("data: {chunk}\n\n"));
        }
        body.push_str("data: [DONE]\n\n");
        body
    }

    fn sse_response(chunks: &[serde_json::Value]) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_raw(sse_body(chunks), "text/event-stream")
    }

    fn tool_call_round() -> ResponseTemplate {
        sse_response(&[
            serde_json::json!({
                "choices": [{
                    "delta": {
                        "tool_calls": [{
                            "index": 0,
                            "id": "call_1",
                            "function": { "name": "exec" }
                        }]
                    }
                }]
            }),
            serde_json::json!({
                "choices": [{
                    "delta": {
                        "tool_calls": [{ "index": 0, "function": { "arguments": "{\"cmd\":" } }]
                    }
                }]
            }),
            serde_json::json!({
                "choices": [{
                    "delta": {
                        "tool_calls": [{ "index": 0, "function": { "arguments": "\"ls\"}" } }]
                    }
                }]
            }),
            serde_json::json!({
                "choices": [{ "delta": {}, "finish_reason": "tool_calls" }]
            }),
        ])
    }

    fn final_round(text: &str) -> ResponseTemplate {
        sse_response(&[
            serde_json::json!({ "choices": [{ "delta": { "content": text } }] }),
            serde_json::json!({ "choices": [{ "delta": {}, "finish_reason": "stop" }] }),
        ])
    }

    async fn build_orchestrator(
        server: &MockServer,
        mode: ApprovalMode,
        denylist: Vec<String>,
    ) -> (Orchestrator, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");

        let host = ToolHost::new(dir.path().to_path_buf());
        let (client_io, host_io) = tokio::io::duplex(256 * 1024);
        let (host_read, host_write) = tokio::io::split(host_io);
        tokio::spawn(async move {
            let _ = host.serve(host_read, host_write).await;
        });
        let (client_read, client_write) = tokio::io::split(client_io);
        let tool_host = Arc::new(
            ToolHostClient::connect(client_read, client_write, Duration::from_secs(5))
                .await
                .expect("handshake"),
        );
        let tools = tool_host
            .list_tools(Duration::from_secs(5))
            .await
            .expect("tools");

        let config = GatewayConfig {
            upstream: UpstreamConfig {
                base_url: server.uri(),
                model: "test-model".to_string(),
                api_key_env: "RELAY_TEST_MISSING_KEY".to_string(),
                ..UpstreamConfig::default()
            },
            approvals: ApprovalsConfig {
                policy: ToolPolicy {
                    mode,
                    denylist,
                    ..ToolPolicy::default()
                },
                ..ApprovalsConfig::default()
            },
            sessions: SessionsConfig {
                root: dir.path().join("sessions"),
            },
            ..GatewayConfig::default()
        };

        let store = Arc::new(SessionStore::new(&config.sessions.root).expect("store"));
        let orchestrator =
            Orchestrator::new(config, store, tool_host, ApprovalHub::new(), tools);
        (orchestrator, dir)
    }

    fn request(
        session: &str,
        text: &str,
    ) -> (TurnRequest, mpsc::Receiver<GatewayEvent>, CancellationToken) {
        let (tx, rx) = mpsc::channel(256);
        let cancel = CancellationToken::new();
        (
            TurnRequest {
                session_id: SessionId::new(session).expect("valid id"),
                user_text: text.to_string(),
                events: tx,
                cancel: cancel.clone(),
            },
            rx,
            cancel,
        )
    }

    fn drain(rx: &mut mpsc::Receiver<GatewayEvent>) -> Vec<GatewayPayload> {
        let mut payloads = Vec::new();
        while let Ok(event) = rx.try_recv() {
            payloads.push(event.payload);
        }
        payloads
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn list_files_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(tool_call_round())
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(final_round("Those are your files."))
            .mount(&server)
            .await;

        let (orchestrator, _dir) =
            build_orchestrator(&server, ApprovalMode::Permissive, Vec::new()).await;
        let (turn, mut rx, _cancel) = request("s1", "list files");

        orchestrator.run_turn(turn).await.expect("turn");

        let payloads = drain(&mut rx);
        assert!(matches!(payloads[0], GatewayPayload::Meta { .. }));

        let call = payloads
            .iter()
            .find_map(|p| match p {
                GatewayPayload::ToolCall { call, .. } => Some(call.clone()),
                _ => None,
            })
            .expect("tool call event");
        assert_eq!(call.name, "exec");
        assert_eq!(call.arguments, serde_json::json!({"cmd": "ls"}));

        let result = payloads
            .iter()
            .find_map(|p| match p {
                GatewayPayload::ToolResult { result } => Some(result.clone()),
                _ => None,
            })
            .expect("tool result event");
        assert!(!result.is_error);
        assert_eq!(result.tool_call_id, "call_1");

        assert!(
            payloads
                .iter()
                .any(|p| matches!(p, GatewayPayload::Delta { text } if text.contains("files")))
        );
        assert!(matches!(payloads.last(), Some(GatewayPayload::Done)));

        // The transcript holds the full audit trail, in order.
        let session = SessionId::new("s1").expect("valid id");
        let records = orchestrator.store().read_events(&session).expect("events");
        let kinds: Vec<&'static str> = records
            .iter()
            .map(|r| match &r.event {
                TranscriptEvent::Message { .. } => "message",
                TranscriptEvent::ToolCall { .. } => "tool_call",
                TranscriptEvent::ToolResult { .. } => "tool_result",
                TranscriptEvent::Reset => "reset",
            })
            .collect();
        assert_eq!(
            kinds,
            vec!["message", "message", "tool_call", "tool_result", "message"]
        );

        // Session metadata got titled and stamped.
        let meta = orchestrator
            .store()
            .load_meta(&session)
            .expect("meta")
            .expect("present");
        assert_eq!(meta.title, "list files");
        assert_eq!(meta.last_model.as_deref(), Some("test-model"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn approval_denial_becomes_structured_tool_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(tool_call_round())
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(final_round("Understood, skipping that."))
            .mount(&server)
            .await;

        let (orchestrator, _dir) =
            build_orchestrator(&server, ApprovalMode::Default, Vec::new()).await;
        let hub = orchestrator.approvals().clone();
        let (turn, mut rx, _cancel) = request("s1", "list files");

        // Deny from the "decision endpoint" as soon as the gated call shows up.
        let decider = tokio::spawn(async move {
            let mut payloads = Vec::new();
            while let Some(event) = rx.recv().await {
                if let GatewayPayload::ToolCall {
                    approval_id: Some(id),
                    ..
                } = &event.payload
                {
                    hub.decide(&id.as_str().into(), ApprovalDecision::Deny, None)
                        .expect("deny");
                }
                payloads.push(event.payload);
            }
            payloads
        });

        orchestrator.run_turn(turn).await.expect("turn");
        let payloads = decider.await.expect("decider");

        let result = payloads
            .iter()
            .find_map(|p| match p {
                GatewayPayload::ToolResult { result } => Some(result.clone()),
                _ => None,
            })
            .expect("tool result");
        assert!(result.is_error);
        assert!(result.content.contains("approval denied"));
        assert!(matches!(payloads.last(), Some(GatewayPayload::Done)));
    }

    #[tokio::test]
    async fn denylisted_tool_never_reaches_the_host() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(tool_call_round())
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(final_round("Can't do that."))
            .mount(&server)
            .await;

        let (orchestrator, _dir) = build_orchestrator(
            &server,
            ApprovalMode::Permissive,
            vec!["exec".to_string()],
        )
        .await;
        let (turn, mut rx, _cancel) = request("s1", "list files");

        orchestrator.run_turn(turn).await.expect("turn");

        let payloads = drain(&mut rx);
        let result = payloads
            .iter()
            .find_map(|p| match p {
                GatewayPayload::ToolResult { result } => Some(result.clone()),
                _ => None,
            })
            .expect("tool result");
        assert!(result.is_error);
        assert!(result.content.contains("denylisted"));
    }

    #[tokio::test]
    async fn upstream_http_error_terminates_turn_with_error_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let (orchestrator, _dir) =
            build_orchestrator(&server, ApprovalMode::Permissive, Vec::new()).await;
        let (turn, mut rx, _cancel) = request("s1", "hello");

        orchestrator.run_turn(turn).await.expect("turn");

        let payloads = drain(&mut rx);
        assert!(
            payloads
                .iter()
                .any(|p| matches!(p, GatewayPayload::Error { message } if message.contains("500")))
        );
        assert!(!payloads.iter().any(|p| matches!(p, GatewayPayload::Done)));
    }

    #[tokio::test]
    async fn pre_cancelled_turn_emits_no_done() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(final_round("never read"))
            .mount(&server)
            .await;

        let (orchestrator, _dir) =
            build_orchestrator(&server, ApprovalMode::Permissive, Vec::new()).await;
        let (turn, mut rx, cancel) = request("s1", "hello");
        cancel.cancel();

        orchestrator.run_turn(turn).await.expect("turn");

        let payloads = drain(&mut rx);
        assert!(!payloads.iter().any(|p| matches!(p, GatewayPayload::Done)));
        assert!(!payloads.iter().any(|p| matches!(p, GatewayPayload::Error { .. })));

        // The user message was persisted before the cancel took effect.
        let session = SessionId::new("s1").expect("valid id");
        let records = orchestrator.store().read_events(&session).expect("events");
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn second_turn_sees_prior_history() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(final_round("first answer"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(final_round("second answer"))
            .mount(&server)
            .await;

        let (orchestrator, _dir) =
            build_orchestrator(&server, ApprovalMode::Permissive, Vec::new()).await;

        let (turn, mut rx1, _c1) = request("s1", "first question");
        orchestrator.run_turn(turn).await.expect("turn 1");
        drain(&mut rx1);

        let (turn, mut rx2, _c2) = request("s1", "second question");
        orchestrator.run_turn(turn).await.expect("turn 2");
        drain(&mut rx2);

        let requests = server.received_requests().await.expect("requests");
        let second_body: serde_json::Value =
            serde_json::from_slice(&requests[1].body).expect("json body");
        let messages = second_body["messages"].as_array().expect("messages");
        // user, assistant, user - prior history travels to the upstream.
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0]["content"], "first question");
        assert_eq!(messages[1]["content"], "first answer");
        assert_eq!(messages[2]["content"], "second question");
    }

    #[test]
    fn parse_arguments_tolerates_empty_and_garbage() {
        assert_eq!(parse_arguments("").0, serde_json::json!({}));
        assert_eq!(
            parse_arguments("{\"a\":1}").0,
            serde_json::json!({"a": 1})
        );

        let (value, error) = parse_arguments("{broken");
        assert_eq!(value, serde_json::Value::String("{broken".to_string()));
        assert!(error.is_some());
    }

    #[test]
    fn history_rebuild_converts_tool_results_and_skips_audit_records() {
        use relay_types::{ToolCall, ToolResult, TranscriptRecord};

        let call = ToolCall::new("call_1", "exec", serde_json::json!({}));
        let records = vec![
            TranscriptRecord::new(
                0,
                1,
                TranscriptEvent::Message {
                    message: Message::user("hi"),
                },
            ),
            TranscriptRecord::new(
                1,
                2,
                TranscriptEvent::Message {
                    message: Message::assistant_with_tool_calls("", vec![call.clone()]),
                },
            ),
            TranscriptRecord::new(2, 3, TranscriptEvent::ToolCall { call }),
            TranscriptRecord::new(
                3,
                4,
                TranscriptEvent::ToolResult {
                    result: ToolResult::success("call_1", "exec", "out"),
                },
            ),
        ];

        let history = history_from_records(&records);
        assert_eq!(history.len(), 3);
        assert_eq!(history[2].role_str(), "tool");
    }
}
