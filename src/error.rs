//! Custom error types for ruo.

use thiserror::Error;

/// Errors that can occur while building or driving an upgrade run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuoError {
    #[error("Invalid directive {0}: {1}")]
    InvalidDirective(String, String),

    #[error("Incompatible directives: {0}")]
    IncompatibleDirective(String),

    #[error("Unsupported directive: {0}")]
    UnsupportedDirective(String),

    #[error("Topology has no target hosts: {0}")]
    EmptyTopology(String),

    #[error("Invalid topology: {0}")]
    InvalidTopology(String),

    #[error("[{0}] host unreachable after {1} missed pings")]
    HostUnreachable(String, u32),

    #[error("[{0}] command rejected: {1}")]
    CommandRejected(String, String),

    #[error("[{0}] task timed out after {1}s")]
    TaskTimeout(String, u64),

    #[error("[{0}] agent transport error: {1}")]
    Transport(String, String),

    #[error("Upgrade run not found: {0}")]
    RunNotFound(String),

    #[error("Cannot {op} a run in state {state}")]
    InvalidTransition { op: String, state: String },

    #[error("Fatal orchestration error: {0}")]
    Fatal(String),
}

impl RuoError {
    /// Create a transport error from any error type, tagged with the host.
    pub fn transport<E: std::fmt::Display>(host: &str, err: E) -> Self {
        Self::Transport(host.to_string(), single_line(&err.to_string()))
    }

    /// Create an invalid-transition error for an operation attempted in `state`.
    pub fn invalid_transition(op: &str, state: impl std::fmt::Display) -> Self {
        Self::InvalidTransition {
            op: op.to_string(),
            state: state.to_string(),
        }
    }

    /// Returns true if this error is recorded on a Task rather than rejecting a request.
    pub const fn is_dispatch_error(&self) -> bool {
        matches!(
            self,
            Self::HostUnreachable(_, _)
                | Self::CommandRejected(_, _)
                | Self::TaskTimeout(_, _)
                | Self::Transport(_, _)
        )
    }

    /// Returns true if the executor may re-dispatch after this error.
    ///
    /// An unreachable host is never re-dispatched implicitly.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::CommandRejected(_, _) | Self::TaskTimeout(_, _) | Self::Transport(_, _)
        )
    }

    /// Returns true for validation errors that reject a run before it is created.
    pub const fn is_validation_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidDirective(_, _)
                | Self::IncompatibleDirective(_)
                | Self::UnsupportedDirective(_)
                | Self::EmptyTopology(_)
                | Self::InvalidTopology(_)
        )
    }
}

/// Collapse a multi-line error chain into one line for task diagnostics.
fn single_line(message: &str) -> String {
    message
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
