//! Gateway configuration.
//!
//! A thin typed wrapper over a TOML file; every knob has a serde default so
//! a missing or partial file still yields a runnable config.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::policy::ToolPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL without the `/chat/completions` suffix.
    pub base_url: String,
    /// Environment variable holding the bearer token.
    pub api_key_env: String,
    pub model: String,
    pub idle_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            model: "gpt-4o-mini".to_string(),
            idle_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub budget_tokens: u32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            budget_tokens: 48_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Tool-host launch command; defaults to this binary in host mode.
    pub host_command: String,
    pub host_args: Vec<String>,
    pub call_timeout_secs: u64,
    /// Tool round-trips allowed within one user turn.
    pub max_iterations: u32,
    /// Per-stream capture cap for the exec tool, in bytes.
    pub max_output_bytes: usize,
    /// Default wall-clock limit for one exec invocation; kept under the RPC
    /// call timeout so the host answers before the client gives up.
    pub exec_timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            host_command: "relay".to_string(),
            host_args: vec!["host".to_string()],
            call_timeout_secs: 120,
            max_iterations: 16,
            max_output_bytes: 256 * 1024,
            exec_timeout_secs: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalsConfig {
    #[serde(flatten)]
    pub policy: ToolPolicy,
    pub timeout_secs: u64,
}

impl Default for ApprovalsConfig {
    fn default() -> Self {
        Self {
            policy: ToolPolicy::default(),
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionsConfig {
    pub root: PathBuf,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(".relay/sessions"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub upstream: UpstreamConfig,
    pub context: ContextConfig,
    pub tools: ToolsConfig,
    pub approvals: ApprovalsConfig,
    pub sessions: SessionsConfig,
}

impl GatewayConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        toml::from_str(&data).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Load the file if present, defaults otherwise.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.idle_timeout_secs)
    }

    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.tools.call_timeout_secs)
    }

    #[must_use]
    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approvals.timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::GatewayConfig;
    use crate::policy::ApprovalMode;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: GatewayConfig = toml::from_str("").expect("parse");
        assert_eq!(config.upstream.api_key_env, "OPENAI_API_KEY");
        assert_eq!(config.tools.host_args, vec!["host"]);
        assert_eq!(config.tools.max_output_bytes, 256 * 1024);
        assert_eq!(config.approvals.policy.mode, ApprovalMode::Default);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let config: GatewayConfig = toml::from_str(
            r#"
            [upstream]
            model = "local-llm"
            base_url = "http://localhost:8080/v1"

            [approvals]
            mode = "permissive"
            timeout_secs = 30
            "#,
        )
        .expect("parse");

        assert_eq!(config.upstream.model, "local-llm");
        assert_eq!(config.approvals.policy.mode, ApprovalMode::Permissive);
        assert_eq!(config.approvals.timeout_secs, 30);
        // Untouched sections keep defaults.
        assert_eq!(config.tools.call_timeout_secs, 120);
    }

    #[test]
    fn load_or_default_tolerates_missing_file() {
        let config =
            GatewayConfig::load_or_default(std::path::Path::new("/definitely/not/here.toml"))
                .expect("defaults");
        assert_eq!(config.context.budget_tokens, 48_000);
    }
}
