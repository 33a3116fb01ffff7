//! Tool approval policy.

use serde::{Deserialize, Serialize};

/// How aggressively tool calls are gated on human approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalMode {
    /// Nothing requires approval (denylist still applies).
    Permissive,
    /// Approval required unless the tool is allowlisted.
    #[default]
    Default,
    /// Every call requires approval, allowlist or not.
    Strict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyVerdict {
    Allow,
    NeedsApproval,
    Deny { reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPolicy {
    pub mode: ApprovalMode,
    pub allowlist: Vec<String>,
    pub denylist: Vec<String>,
}

impl ToolPolicy {
    #[must_use]
    pub fn check(&self, tool_name: &str) -> PolicyVerdict {
        if self.denylist.iter().any(|name| name == tool_name) {
            return PolicyVerdict::Deny {
                reason: format!("tool {tool_name} is denylisted"),
            };
        }

        match self.mode {
            ApprovalMode::Permissive => PolicyVerdict::Allow,
            ApprovalMode::Strict => PolicyVerdict::NeedsApproval,
            ApprovalMode::Default => {
                if self.allowlist.iter().any(|name| name == tool_name) {
                    PolicyVerdict::Allow
                } else {
                    PolicyVerdict::NeedsApproval
                }
            }
        }
    }
}
