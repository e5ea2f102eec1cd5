//! Resource types exposed to the query layer and the `Upgrade` projection.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::directive::{DOWNGRADE_DIRECTIVE, Policy, SKIP_SERVICE_CHECKS_DIRECTIVE};
use crate::error::RuoError;
use crate::plan::OperationKind;
use crate::run::{RunId, RunState, Task, TaskStatus, UpgradeRun};

/// Closed set of resource types the orchestrator exposes.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
pub enum ResourceType {
    Upgrade,
    UpgradeGroup,
    UpgradeItem,
    Task,
}

impl ResourceType {
    pub const ALL: [Self; 4] = [Self::Upgrade, Self::UpgradeGroup, Self::UpgradeItem, Self::Task];

    pub const fn singular_name(self) -> &'static str {
        match self {
            Self::Upgrade => "upgrade",
            Self::UpgradeGroup => "upgrade_group",
            Self::UpgradeItem => "upgrade_item",
            Self::Task => "task",
        }
    }

    pub const fn plural_name(self) -> &'static str {
        match self {
            Self::Upgrade => "upgrades",
            Self::UpgradeGroup => "upgrade_groups",
            Self::UpgradeItem => "upgrade_items",
            Self::Task => "tasks",
        }
    }

    /// Directive keys accepted when creating a resource of this type.
    pub const fn create_directives(self) -> &'static [&'static str] {
        match self {
            Self::Upgrade => &[DOWNGRADE_DIRECTIVE, SKIP_SERVICE_CHECKS_DIRECTIVE],
            Self::UpgradeGroup | Self::UpgradeItem | Self::Task => &[],
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upgrade => write!(f, "Upgrade"),
            Self::UpgradeGroup => write!(f, "UpgradeGroup"),
            Self::UpgradeItem => write!(f, "UpgradeItem"),
            Self::Task => write!(f, "Task"),
        }
    }
}

/// Filter over archived runs, by direction and terminal state.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HistoryFilter {
    #[default]
    All,
    UpgradeAborted,
    UpgradeCompleted,
    DowngradeAborted,
    DowngradeCompleted,
}

impl HistoryFilter {
    /// `All` matches every run, including ones still in flight.
    pub const fn matches(self, policy: &Policy, state: RunState) -> bool {
        let downgrade = policy.is_downgrade();
        match self {
            Self::All => true,
            Self::UpgradeAborted => !downgrade && matches!(state, RunState::Aborted),
            Self::UpgradeCompleted => !downgrade && matches!(state, RunState::Completed),
            Self::DowngradeAborted => downgrade && matches!(state, RunState::Aborted),
            Self::DowngradeCompleted => downgrade && matches!(state, RunState::Completed),
        }
    }
}

impl std::str::FromStr for HistoryFilter {
    type Err = RuoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "ALL" => Ok(Self::All),
            "UPGRADE_ABORTED" => Ok(Self::UpgradeAborted),
            "UPGRADE_COMPLETED" => Ok(Self::UpgradeCompleted),
            "DOWNGRADE_ABORTED" => Ok(Self::DowngradeAborted),
            "DOWNGRADE_COMPLETED" => Ok(Self::DowngradeCompleted),
            other => Err(RuoError::InvalidDirective(
                "filter".to_string(),
                format!("unknown history filter '{other}'"),
            )),
        }
    }
}

/// Per-task row of an [`UpgradeResource`].
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    pub id: usize,
    pub group: String,
    pub stage: String,
    pub host: String,
    pub service: String,
    pub component: String,
    pub operation: OperationKind,
    pub status: TaskStatus,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Read-only projection of an upgrade run.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeResource {
    pub kind: ResourceType,
    pub id: RunId,
    pub topology: String,
    pub from_version: String,
    pub to_version: String,
    pub state: RunState,

    /// Directive flags the run was created with.
    #[serde(flatten)]
    pub directives: Policy,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_group: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<String>,

    /// Share of tasks in a terminal status (0-100).
    pub progress_percent: u8,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Tasks that are FAILED or TIMED_OUT, with their last error.
    #[serde(default)]
    pub failed_tasks: Vec<TaskView>,

    #[serde(default)]
    pub tasks: Vec<TaskView>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl UpgradeResource {
    pub fn from_run(run: &UpgradeRun) -> Self {
        let view = |task: &Task| {
            let group = &run.plan.groups[task.group];
            TaskView {
                id: task.id,
                group: group.name.clone(),
                stage: group.stages[task.stage].name.clone(),
                host: task.host.clone(),
                service: task.service.clone(),
                component: task.component.clone(),
                operation: task.operation,
                status: task.status,
                retry_count: task.retry_count,
                last_error: task.last_error.clone(),
            }
        };

        // The cursor is past the last group once the run completes.
        let active = !run.state.is_terminal();
        Self {
            kind: ResourceType::Upgrade,
            id: run.id,
            topology: run.plan.topology.clone(),
            from_version: run.plan.from_version.clone(),
            to_version: run.plan.to_version.clone(),
            state: run.state,
            directives: run.policy,
            current_group: run
                .current_group()
                .filter(|_| active)
                .map(|g| g.name.clone()),
            current_stage: run
                .current_stage()
                .filter(|_| active)
                .map(|s| s.name.clone()),
            progress_percent: run.progress_percent(),
            message: run.message.clone(),
            failed_tasks: run.failed_tasks().into_iter().map(view).collect(),
            tasks: run.tasks.iter().map(view).collect(),
            created_at: run.created_at,
            updated_at: run.updated_at,
            completed_at: run.completed_at,
        }
    }
}
