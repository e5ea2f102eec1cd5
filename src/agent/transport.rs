//! Command channel to host agents.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agent::probe::{PingReply, PingRequest};
use crate::directive::Direction;
use crate::error::RuoError;
use crate::plan::OperationKind;
use crate::run::{RunId, TaskId};

/// Instruction for one task, sent to the agent on `host`.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskCommand {
    pub run_id: RunId,
    pub task_id: TaskId,
    pub host: String,
    pub service: String,
    pub component: String,
    pub operation: OperationKind,
    pub version: String,
    #[serde(flatten)]
    pub direction: Direction,
    /// 1 for the first dispatch, incremented on every re-dispatch.
    pub attempt: u32,
}

/// Agent answer to a [`TaskCommand`].
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
pub struct CommandReply {
    pub accepted: bool,
    #[serde(default)]
    pub message: Option<String>,
}

/// Transport to host agents.
///
/// `execute` resolves when the agent reports the command finished. Any error
/// is recorded on the task; the executor applies timeouts around the call.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    async fn ping(&self, host: &str, request: &PingRequest) -> Result<PingReply, RuoError>;

    async fn execute(&self, host: &str, command: &TaskCommand) -> Result<(), RuoError>;
}
