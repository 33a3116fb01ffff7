//! RPC client against the real `relay host` subprocess.

use std::path::Path;
use std::time::Duration;

use relay_rpc::{RpcError, ToolHostClient, ToolHostConfig};

fn host_config(root: &Path) -> ToolHostConfig {
    ToolHostConfig {
        command: env!("CARGO_BIN_EXE_relay").to_string(),
        args: vec![
            "host".to_string(),
            "--root".to_string(),
            root.display().to_string(),
        ],
        init_timeout: Duration::from_secs(30),
    }
}

#[tokio::test]
async fn spawned_host_completes_handshake_and_lists_tools() {
    let dir = tempfile::tempdir().expect("tempdir");
    let client = ToolHostClient::spawn(&host_config(dir.path()))
        .await
        .expect("spawn + handshake");

    let tools = client
        .list_tools(Duration::from_secs(10))
        .await
        .expect("list tools");
    assert_eq!(tools.len(), 1);
    assert_eq!(tools[0].name, "exec");
    assert!(!client.is_closed());
}

#[cfg(unix)]
#[tokio::test]
async fn spawned_host_executes_commands_in_its_root() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("marker.txt"), b"x").expect("fixture");

    let client = ToolHostClient::spawn(&host_config(dir.path()))
        .await
        .expect("spawn + handshake");

    let result = client
        .call_tool(
            "exec",
            &serde_json::json!({"cmd": "ls"}),
            Duration::from_secs(10),
        )
        .await
        .expect("call");

    assert!(!result.is_error);
    assert!(result.content.contains("marker.txt"));
}

#[cfg(unix)]
#[tokio::test]
async fn output_cap_flag_limits_capture() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = host_config(dir.path());
    config.args.push("--max-output-bytes".to_string());
    config.args.push("512".to_string());

    let client = ToolHostClient::spawn(&config)
        .await
        .expect("spawn + handshake");

    let result = client
        .call_tool(
            "exec",
            &serde_json::json!({"shell": "printf 'x%.0s' $(seq 1 4096)"}),
            Duration::from_secs(10),
        )
        .await
        .expect("call");

    assert!(result.content.contains("[stdout truncated]"));
}

#[tokio::test]
async fn missing_host_binary_is_a_spawn_error() {
    let config = ToolHostConfig {
        command: "relay-host-binary-that-does-not-exist".to_string(),
        args: Vec::new(),
        init_timeout: Duration::from_secs(5),
    };
    let err = ToolHostClient::spawn(&config).await.expect_err("no binary");
    assert!(matches!(err, RpcError::Spawn(_)));
}

#[cfg(unix)]
#[tokio::test]
async fn host_that_exits_immediately_fails_the_handshake() {
    let config = ToolHostConfig {
        command: "true".to_string(),
        args: Vec::new(),
        init_timeout: Duration::from_secs(5),
    };
    let err = ToolHostClient::spawn(&config).await.expect_err("dead host");
    assert!(matches!(err, RpcError::Handshake(_)));
}
