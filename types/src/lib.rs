//! Core domain types for Relay.
//!
//! This crate holds the data model shared by every other crate: chat
//! messages, tool calls and results, streaming events, gateway events,
//! transcript records, and validated identifiers. It deliberately contains
//! no IO and no async - construction and conversion only.

mod event;
mod ids;
mod message;
mod stream;
mod tool;

pub use event::{GatewayEvent, GatewayPayload, TranscriptEvent, TranscriptRecord};
pub use ids::{SessionId, SessionIdError};
pub use message::{AssistantMessage, Message, SystemMessage, ToolMessage, UserMessage};
pub use stream::{StreamEvent, ToolCallFragment};
pub use tool::{ToolCall, ToolDefinition, ToolResult};

/// Environment variable patterns stripped from every spawned subprocess.
///
/// Matched case-insensitively with `*` as prefix/suffix/infix wildcard.
/// Covers credential material and dynamic-linker injection vectors.
pub const ENV_SECRET_DENYLIST: &[&str] = &[
    "*_KEY",
    "*_KEYS",
    "*_TOKEN",
    "*_SECRET*",
    "*_PASSWORD*",
    "*_CREDENTIAL*",
    "*_PASSPHRASE*",
    "AWS_*",
    "GITHUB_PAT",
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "DYLD_*",
];

/// Whether an environment variable must be withheld from subprocesses.
#[must_use]
pub fn is_denylisted_env(key: &str) -> bool {
    let upper = key.to_uppercase();
    ENV_SECRET_DENYLIST
        .iter()
        .any(|pattern| env_glob_matches(pattern, &upper))
}

/// Minimal glob matcher for the denylist patterns.
/// Handles `*_SUFFIX`, `PREFIX_*`, `*_INFIX*`, and exact match.
fn env_glob_matches(pattern: &str, key_upper: &str) -> bool {
    let pat = pattern.to_uppercase();
    match (pat.starts_with('*'), pat.ends_with('*')) {
        (true, true) => {
            let inner = &pat[1..pat.len() - 1];
            key_upper.contains(inner)
        }
        (true, false) => {
            let suffix = &pat[1..];
            key_upper.ends_with(suffix)
        }
        (false, true) => {
            let prefix = &pat[..pat.len() - 1];
            key_upper.starts_with(prefix)
        }
        (false, false) => key_upper == pat,
    }
}

#[cfg(test)]
mod env_denylist_tests {
    use super::{env_glob_matches, is_denylisted_env};

    #[test]
    fn suffix_patterns_match() {
        assert!(env_glob_matches("*_KEY", "API_KEY"));
        assert!(env_glob_matches("*_KEY", "MY_SECRET_KEY"));
        assert!(!env_glob_matches("*_KEY", "KEYRING"));
    }

    #[test]
    fn prefix_patterns_match() {
        assert!(env_glob_matches("AWS_*", "AWS_ACCESS_KEY_ID"));
        assert!(!env_glob_matches("AWS_*", "MY_AWS"));
    }

    #[test]
    fn infix_patterns_match() {
        assert!(env_glob_matches("*_CREDENTIAL*", "DB_CREDENTIAL_FILE"));
        assert!(env_glob_matches("*_CREDENTIAL*", "MY_CREDENTIALS"));
        assert!(!env_glob_matches("*_CREDENTIAL*", "CREDENTIAL"));
    }

    #[test]
    fn exact_patterns_match() {
        assert!(env_glob_matches("LD_PRELOAD", "LD_PRELOAD"));
        assert!(!env_glob_matches("LD_PRELOAD", "LD_PRELOAD_X"));
    }

    #[test]
    fn denylist_is_case_insensitive() {
        assert!(is_denylisted_env("api_key"));
        assert!(is_denylisted_env("aws_session_token"));
        assert!(is_denylisted_env("DYLD_INSERT_LIBRARIES"));
        assert!(!is_denylisted_env("PATH"));
        assert!(!is_denylisted_env("HOME"));
    }
}
