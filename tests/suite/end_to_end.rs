//! The full loop: mocked upstream, real tool-host subprocess, real store.
//!
//! "list files" -> the model streams one tool call in fragments -> the
//! accumulator reconstructs `{cmd: "ls"}` -> the sandboxed host executes it
//! -> the result streams back -> the second model round finishes with
//! `stop` -> the turn ends with `done`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use relay_engine::{
    ApprovalHub, ApprovalMode, ApprovalsConfig, GatewayConfig, Orchestrator, SessionsConfig,
    ToolPolicy, TurnRequest, UpstreamConfig,
};
use relay_rpc::{ToolHostClient, ToolHostConfig};
use relay_store::SessionStore;
use relay_types::{GatewayEvent, GatewayPayload, SessionId, TranscriptEvent};

fn sse_response(chunks: &[serde_json::Value]) -> ResponseTemplate {
    let mut body = String::new();
    for chunk in chunks {
        body.push_str(&format!("data: {chunk}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
}

async fn spawn_real_host(root: &Path) -> Arc<ToolHostClient> {
    let config = ToolHostConfig {
        command: env!("CARGO_BIN_EXE_relay").to_string(),
        args: vec![
            "host".to_string(),
            "--root".to_string(),
            root.display().to_string(),
        ],
        init_timeout: Duration::from_secs(30),
    };
    Arc::new(ToolHostClient::spawn(&config).await.expect("spawn host"))
}

#[cfg(unix)]
#[tokio::test]
async fn list_files_end_to_end() {
    let server = MockServer::start().await;

    // Round one: a single tool call delivered as fragments keyed by index 0.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(&[
            serde_json::json!({
                "choices": [{
                    "delta": {
                        "tool_calls": [{
                            "index": 0,
                            "id": "call_ls",
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
        ]))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;

    // Round two: plain text and a stop.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(sse_response(&[
            serde_json::json!({ "choices": [{ "delta": { "content": "You have one file." } }] }),
            serde_json::json!({ "choices": [{ "delta": {}, "finish_reason": "stop" }] }),
        ]))
        .expect(1)
        .mount(&server)
        .await;

    let workspace = tempfile::tempdir().expect("tempdir");
    std::fs::write(workspace.path().join("hello.txt"), b"hi").expect("fixture");

    let tool_host = spawn_real_host(workspace.path()).await;
    let tools = tool_host
        .list_tools(Duration::from_secs(10))
        .await
        .expect("tools");

    let config = GatewayConfig {
        upstream: UpstreamConfig {
            base_url: server.uri(),
            model: "test-model".to_string(),
            api_key_env: "RELAY_E2E_MISSING_KEY".to_string(),
            ..UpstreamConfig::default()
        },
        approvals: ApprovalsConfig {
            policy: ToolPolicy {
                mode: ApprovalMode::Permissive,
                ..ToolPolicy::default()
            },
            ..ApprovalsConfig::default()
        },
        sessions: SessionsConfig {
            root: workspace.path().join("sessions"),
        },
        ..GatewayConfig::default()
    };

    let store = Arc::new(SessionStore::new(&config.sessions.root).expect("store"));
    let orchestrator = Orchestrator::new(
        config,
        store.clone(),
        tool_host,
        ApprovalHub::new(),
        tools,
    );

    let (events_tx, mut events_rx) = mpsc::channel::<GatewayEvent>(256);
    let turn = TurnRequest {
        session_id: SessionId::new("e2e").expect("valid id"),
        user_text: "list files".to_string(),
        events: events_tx,
        cancel: CancellationToken::new(),
    };

    orchestrator.run_turn(turn).await.expect("turn");

    let mut payloads = Vec::new();
    while let Ok(event) = events_rx.try_recv() {
        assert!(event.ts_ms > 0, "every event carries a receive timestamp");
        payloads.push(event.payload);
    }

    // The reconstructed call and its executed result both surfaced.
    let call = payloads
        .iter()
        .find_map(|p| match p {
            GatewayPayload::ToolCall { call, .. } => Some(call.clone()),
            _ => None,
        })
        .expect("tool_call event");
    assert_eq!(call.id, "call_ls");
    assert_eq!(call.arguments, serde_json::json!({"cmd": "ls"}));

    let result = payloads
        .iter()
        .find_map(|p| match p {
            GatewayPayload::ToolResult { result } => Some(result.clone()),
            _ => None,
        })
        .expect("tool_result event");
    assert!(!result.is_error);
    assert!(result.content.contains("hello.txt"));

    assert!(matches!(payloads.last(), Some(GatewayPayload::Done)));

    // Replayable record of every step, in order.
    let session = SessionId::new("e2e").expect("valid id");
    let kinds: Vec<&'static str> = store
        .read_events(&session)
        .expect("events")
        .iter()
        .map(|record| match &record.event {
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

    // And the session is discoverable through the index.
    let sessions = store.list_sessions().expect("list");
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].title, "list files");
}
