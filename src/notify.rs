//! Notification module for upgrade run lifecycle events.

pub mod slack;

pub use slack::{FailedTaskRow, RunNotice, SlackNotifier};

use crate::directive::Policy;
use crate::run::{RunState, UpgradeRun};

/// Failed task rows are capped so a large failed stage still fits one message.
const MAX_FAILED_TASK_ROWS: usize = 8;

/// Which run directions send notifications.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NotificationConfig {
    pub on_upgrade: bool,
    pub on_downgrade: bool,
}

/// Determine whether a notification should be sent for a run with this policy.
pub const fn should_notify(config: &NotificationConfig, policy: &Policy) -> bool {
    if policy.is_downgrade() {
        config.on_downgrade
    } else {
        config.on_upgrade
    }
}

/// Notice for the state the run just entered from `from`, if that state is
/// announced at all.
pub fn build_notice(run: &UpgradeRun, from: RunState) -> Option<RunNotice> {
    let (verb, facts) = match run.state {
        RunState::Running if from == RunState::Pending => ("Started", started_facts(run)),
        RunState::Holding => ("Holding", vec![topology(run), stage(run, "Stage", "unknown")]),
        RunState::Completed => ("Completed", completed_facts(run)),
        RunState::Aborted => ("Aborted", aborted_facts(run)),
        _ => return None,
    };

    let mut notice = RunNotice {
        run_id: run.id,
        state: run.state,
        title: format!("{} {verb}", direction_title(&run.policy)),
        facts,
        failed: Vec::new(),
        more_failed: 0,
    };
    if run.state == RunState::Holding {
        let failed = run.failed_tasks();
        notice.more_failed = failed.len().saturating_sub(MAX_FAILED_TASK_ROWS);
        notice.failed = failed
            .iter()
            .take(MAX_FAILED_TASK_ROWS)
            .map(|task| FailedTaskRow {
                host: task.host.clone(),
                target: format!("{}/{}", task.service, task.component),
                status: task.status.to_string(),
                error: task
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "no error recorded".to_string()),
            })
            .collect();
    }
    Some(notice)
}

fn topology(run: &UpgradeRun) -> (String, String) {
    ("Topology".to_string(), run.plan.topology.clone())
}

fn versions(run: &UpgradeRun) -> (String, String) {
    (
        "Versions".to_string(),
        format!("{} → {}", run.plan.from_version, run.plan.to_version),
    )
}

fn stage(run: &UpgradeRun, label: &str, none: &str) -> (String, String) {
    let name = run
        .current_stage()
        .map_or_else(|| none.to_string(), |s| s.name.clone());
    (label.to_string(), name)
}

fn duration(run: &UpgradeRun) -> (String, String) {
    let value = run.completed_at.map_or_else(
        || "unknown".to_string(),
        |end| {
            let secs = (end - run.created_at).num_seconds().unsigned_abs();
            format!("{}m {}s", secs / 60, secs % 60)
        },
    );
    ("Duration".to_string(), value)
}

fn started_facts(run: &UpgradeRun) -> Vec<(String, String)> {
    let services = run
        .plan
        .groups
        .iter()
        .map(|g| g.name.as_str())
        .collect::<Vec<_>>()
        .join(" → ");
    vec![
        topology(run),
        versions(run),
        ("Tasks".to_string(), run.tasks.len().to_string()),
        (
            "Skip Service Checks".to_string(),
            run.policy.skip_service_checks.to_string(),
        ),
        ("Services".to_string(), services),
    ]
}

fn completed_facts(run: &UpgradeRun) -> Vec<(String, String)> {
    vec![
        topology(run),
        versions(run),
        ("Tasks".to_string(), run.tasks.len().to_string()),
        duration(run),
    ]
}

fn aborted_facts(run: &UpgradeRun) -> Vec<(String, String)> {
    vec![
        topology(run),
        versions(run),
        stage(run, "Aborted Stage", "none"),
        duration(run),
        (
            "Reason".to_string(),
            run.message.clone().unwrap_or_else(|| "unknown".to_string()),
        ),
    ]
}

const fn direction_title(policy: &Policy) -> &'static str {
    if policy.is_downgrade() {
        "Cluster Downgrade"
    } else {
        "Cluster Upgrade"
    }
}
