//! Upgrade plan builder.
//!
//! Expands a topology into ordered groups (one per service), each holding
//! barrier-synchronized stages (one per operation kind) of per-host tasks.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::directive::Policy;
use crate::error::RuoError;
use crate::topology::{Component, Service, Topology};

/// Operation a task performs on one host.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Stop,
    Install,
    Start,
    Restart,
    Check,
}

impl OperationKind {
    /// Fixed stage precedence within a group.
    pub const PRECEDENCE: [Self; 5] = [
        Self::Stop,
        Self::Install,
        Self::Start,
        Self::Restart,
        Self::Check,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Install => "install",
            Self::Start => "start",
            Self::Restart => "restart",
            Self::Check => "check",
        }
    }

    const fn applies_to(self, component: &Component) -> bool {
        match self {
            Self::Stop | Self::Install | Self::Start => !component.restart_only,
            Self::Restart => component.restart_only,
            Self::Check => true,
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of work: an operation on a component on one host.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub host: String,
    pub service: String,
    pub component: String,
    pub operation: OperationKind,
    /// Version the operation acts on (the outgoing version for `stop`).
    pub version: String,
}

/// Barrier-synchronized set of tasks sharing one operation kind.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Stage {
    pub name: String,
    pub operation: OperationKind,
    pub tasks: Vec<TaskSpec>,
}

/// Ordered stages for one service.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub name: String,
    pub skippable: bool,
    pub stages: Vec<Stage>,
}

impl Group {
    pub fn task_count(&self) -> usize {
        self.stages.iter().map(|s| s.tasks.len()).sum()
    }
}

/// Immutable, ordered plan for one run.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpgradePlan {
    pub topology: String,
    pub from_version: String,
    pub to_version: String,
    pub groups: Vec<Group>,
}

impl UpgradePlan {
    pub fn task_count(&self) -> usize {
        self.groups.iter().map(Group::task_count).sum()
    }

    pub fn stage_count(&self) -> usize {
        self.groups.iter().map(|g| g.stages.len()).sum()
    }

    /// Iterate every task with its (group, stage) position.
    pub fn tasks(&self) -> impl Iterator<Item = (usize, usize, &TaskSpec)> {
        self.groups.iter().enumerate().flat_map(|(g, group)| {
            group
                .stages
                .iter()
                .enumerate()
                .flat_map(move |(s, stage)| stage.tasks.iter().map(move |t| (g, s, t)))
        })
    }
}

/// Build the plan for a run.
pub fn build(topology: &Topology, policy: &Policy) -> Result<UpgradePlan, RuoError> {
    expand(topology, policy.is_downgrade(), policy.skip_service_checks)
}

/// Build a plan from bare flags, used for previews where no forward run exists yet.
pub fn expand(
    topology: &Topology,
    downgrade: bool,
    skip_service_checks: bool,
) -> Result<UpgradePlan, RuoError> {
    topology.validate()?;
    if topology.placement_count() == 0 {
        return Err(RuoError::EmptyTopology(topology.name.clone()));
    }

    // A downgrade reinstalls the source version over the target version.
    let (from_version, to_version) = if downgrade {
        (&topology.target_version, &topology.source_version)
    } else {
        (&topology.source_version, &topology.target_version)
    };

    let services: Vec<&Service> = if downgrade {
        topology.services.iter().rev().collect()
    } else {
        topology.services.iter().collect()
    };

    let groups: Vec<Group> = services
        .into_iter()
        .map(|service| {
            build_group(
                service,
                from_version,
                to_version,
                downgrade,
                skip_service_checks,
            )
        })
        .collect();

    let plan = UpgradePlan {
        topology: topology.name.clone(),
        from_version: from_version.clone(),
        to_version: to_version.clone(),
        groups,
    };

    info!(
        topology = %plan.topology,
        downgrade,
        skip_service_checks,
        groups = plan.groups.len(),
        stages = plan.stage_count(),
        tasks = plan.task_count(),
        "Upgrade plan built: {} -> {}",
        plan.from_version,
        plan.to_version
    );
    Ok(plan)
}

fn build_group(
    service: &Service,
    from_version: &str,
    to_version: &str,
    downgrade: bool,
    skip_service_checks: bool,
) -> Group {
    let components: Vec<&Component> = if downgrade {
        service.components.iter().rev().collect()
    } else {
        service.components.iter().collect()
    };

    let mut stages = Vec::new();
    for operation in OperationKind::PRECEDENCE {
        if operation == OperationKind::Check && skip_service_checks {
            continue;
        }

        let version = if operation == OperationKind::Stop {
            from_version
        } else {
            to_version
        };

        let tasks: Vec<TaskSpec> = components
            .iter()
            .filter(|c| operation.applies_to(c))
            .flat_map(|c| {
                c.hosts.iter().map(move |host| TaskSpec {
                    host: host.clone(),
                    service: service.name.clone(),
                    component: c.name.clone(),
                    operation,
                    version: version.to_string(),
                })
            })
            .collect();

        if tasks.is_empty() {
            continue;
        }
        stages.push(Stage {
            name: format!("{operation} {} ({version})", service.name),
            operation,
            tasks,
        });
    }

    if stages.is_empty() {
        debug!(service = %service.name, "Service has no target hosts, group is empty");
    }

    Group {
        name: service.name.clone(),
        // Without a check stage there is no go/no-go signal for this group.
        skippable: service.skippable || skip_service_checks,
        stages,
    }
}
