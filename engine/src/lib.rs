//! Turn orchestration for Relay.
//!
//! One [`Orchestrator`] instance serves a gateway process; each call to
//! [`Orchestrator::run_turn`] drives one user-initiated multi-turn exchange:
//! build context within the token budget, stream the upstream response,
//! reassemble tool calls, gate them on policy and approvals, execute them
//! through the tool host, persist every step, and loop until the model stops
//! asking for tools.

mod approvals;
mod config;
mod orchestrator;
mod policy;
mod truncate;

pub use approvals::{
    ApprovalDecision, ApprovalError, ApprovalHub, ApprovalId, ApprovalResolution,
};
pub use config::{
    ApprovalsConfig, ContextConfig, GatewayConfig, SessionsConfig, ToolsConfig, UpstreamConfig,
};
pub use orchestrator::{Orchestrator, TurnRequest};
pub use policy::{ApprovalMode, PolicyVerdict, ToolPolicy};
pub use truncate::{
    MAX_CONTEXT_BUDGET, MIN_CONTEXT_BUDGET, TokenEstimator, Truncation, truncate,
};

/// Failures a caller must see. Protocol, policy and resource failures never
/// surface here - they terminate only the affected turn, as gateway events.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] relay_store::StoreError),
}
