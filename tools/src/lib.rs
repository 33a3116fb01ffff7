//! Exec sandbox and tool-host server.
//!
//! The sandbox runs one external command with a bounded blast radius:
//! working-directory containment under a project root, independently
//! byte-capped stdout/stderr capture, and timeout- or cancellation-triggered
//! termination of the entire process group. Resource failures (spawn errors,
//! timeouts, capped output) are captured into the [`ExecOutcome`] rather than
//! thrown, so a failing command never aborts the caller's loop; only
//! integrity violations (a working directory escaping the root) reject up
//! front.
//!
//! [`ToolHost`] is the subprocess side of the RPC protocol: a serve loop over
//! stdio that exposes the sandbox as the `exec` tool.

mod exec;
mod host;
mod process;
mod shell;
mod workdir;

pub use exec::{
    CommandSpec, ExecLimits, ExecOutcome, ExecRequest, ExecSandbox, ExecStatus, StreamTruncation,
};
pub use host::{EXEC_TOOL_NAME, ToolHost, exec_tool_definition};
pub use process::ChildGuard;
pub use shell::{DetectedShell, ShellOverride, detect_shell};
pub use workdir::resolve_workdir;

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("working directory {requested:?} escapes the project root")]
    WorkdirEscape { requested: String },
    #[error("working directory {requested:?} is not a valid path")]
    WorkdirInvalid { requested: String },
    #[error("command must not be empty")]
    EmptyCommand,
}
