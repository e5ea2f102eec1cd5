//! Upgrade run aggregate: overall state, cursor and the tasks it owns.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::directive::Policy;
use crate::error::RuoError;
use crate::plan::{Group, OperationKind, Stage, UpgradePlan};

/// Identifier of an upgrade run.
#[derive(
    Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, JsonSchema,
)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for RunId {
    type Err = RuoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| RuoError::RunNotFound(s.to_string()))
    }
}

/// Index of a task within its run.
pub type TaskId = usize;

/// Overall state of a run.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Pending,
    Running,
    Holding,
    Suspended,
    Completed,
    Aborted,
}

impl RunState {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Aborted)
    }

    /// Run is waiting on an external `retry`/`abort`, or is archived.
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Holding | Self::Completed | Self::Aborted)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Holding => write!(f, "HOLDING"),
            Self::Suspended => write!(f, "SUSPENDED"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Status of a single task.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Queued,
    InProgress,
    Completed,
    Failed,
    Skipped,
    TimedOut,
}

impl TaskStatus {
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Skipped | Self::TimedOut
        )
    }

    /// Counts as FAILED for stage completion.
    pub const fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::TimedOut)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Queued => write!(f, "QUEUED"),
            Self::InProgress => write!(f, "IN_PROGRESS"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Skipped => write!(f, "SKIPPED"),
            Self::TimedOut => write!(f, "TIMED_OUT"),
        }
    }
}

/// A task owned by a run.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub group: usize,
    pub stage: usize,
    pub host: String,
    pub service: String,
    pub component: String,
    pub operation: OperationKind,
    pub version: String,
    pub status: TaskStatus,
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Position of the run within its plan.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Cursor {
    pub group: usize,
    pub stage: usize,
}

impl Cursor {
    pub const fn next_stage(self) -> Self {
        Self {
            group: self.group,
            stage: self.stage + 1,
        }
    }

    pub const fn next_group(self) -> Self {
        Self {
            group: self.group + 1,
            stage: 0,
        }
    }
}

/// Result of executing one task, reported by the executor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskOutcome {
    pub status: TaskStatus,
    /// Automatic re-dispatches performed by the executor for this dispatch.
    pub retries: u32,
    pub error: Option<RuoError>,
}

impl TaskOutcome {
    pub const fn completed(retries: u32) -> Self {
        Self {
            status: TaskStatus::Completed,
            retries,
            error: None,
        }
    }

    pub fn failed(error: RuoError, retries: u32) -> Self {
        let status = if matches!(error, RuoError::TaskTimeout(_, _)) {
            TaskStatus::TimedOut
        } else {
            TaskStatus::Failed
        };
        Self {
            status,
            retries,
            error: Some(error),
        }
    }
}

/// Progress notification from an executor worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskEvent {
    Started { task_id: TaskId, attempt: u32 },
    Finished { task_id: TaskId, outcome: TaskOutcome },
}

impl TaskEvent {
    pub const fn task_id(&self) -> TaskId {
        match self {
            Self::Started { task_id, .. } | Self::Finished { task_id, .. } => *task_id,
        }
    }
}

/// Aggregate root of one orchestration run.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeRun {
    pub id: RunId,
    pub plan: UpgradePlan,
    pub policy: Policy,
    pub state: RunState,
    pub cursor: Cursor,
    /// Pending tasks of the current stage have been handed to the executor.
    pub stage_dispatched: bool,
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl UpgradeRun {
    /// Create a PENDING run that owns one task per plan entry.
    pub fn new(id: RunId, plan: UpgradePlan, policy: Policy) -> Self {
        let tasks = plan
            .tasks()
            .enumerate()
            .map(|(id, (group, stage, spec))| Task {
                id,
                group,
                stage,
                host: spec.host.clone(),
                service: spec.service.clone(),
                component: spec.component.clone(),
                operation: spec.operation,
                version: spec.version.clone(),
                status: TaskStatus::Pending,
                retry_count: 0,
                last_error: None,
                started_at: None,
                completed_at: None,
            })
            .collect();

        let now = Utc::now();
        Self {
            id,
            plan,
            policy,
            state: RunState::Pending,
            cursor: Cursor::default(),
            stage_dispatched: false,
            tasks,
            message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn current_group(&self) -> Option<&Group> {
        self.plan.groups.get(self.cursor.group)
    }

    pub fn current_stage(&self) -> Option<&Stage> {
        self.current_group()
            .and_then(|g| g.stages.get(self.cursor.stage))
    }

    /// Tasks belonging to the stage under the cursor.
    pub fn stage_tasks(&self) -> impl Iterator<Item = &Task> {
        let cursor = self.cursor;
        self.tasks
            .iter()
            .filter(move |t| t.group == cursor.group && t.stage == cursor.stage)
    }

    pub fn failed_tasks(&self) -> Vec<&Task> {
        self.tasks.iter().filter(|t| t.status.is_failure()).collect()
    }

    pub fn non_terminal_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|t| !t.status.is_terminal())
            .count()
    }

    /// Share of tasks in a terminal status, 0-100.
    pub fn progress_percent(&self) -> u8 {
        if self.tasks.is_empty() {
            return 100;
        }
        let done = self.tasks.len() - self.non_terminal_count();
        u8::try_from(done * 100 / self.tasks.len()).unwrap_or(100)
    }

    pub(crate) fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
