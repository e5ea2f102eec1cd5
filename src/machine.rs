//! Upgrade state machine.
//!
//! Transition functions on [`UpgradeRun`]. They are only ever called from the
//! run's driver task, which processes one input at a time, so every transition
//! sees and leaves a consistent aggregate.

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::agent::TaskCommand;
use crate::error::RuoError;
use crate::plan::OperationKind;
use crate::run::{RunState, TaskEvent, TaskStatus, UpgradeRun};

const fn is_legal(from: RunState, to: RunState) -> bool {
    use RunState::{Aborted, Completed, Holding, Pending, Running, Suspended};
    match (from, to) {
        (Completed | Aborted, _) => false,
        (_, Aborted) => true,
        (Pending, Running)
        | (Running, Holding | Suspended | Completed)
        | (Holding | Suspended, Running)
        | (Holding, Suspended) => true,
        _ => false,
    }
}

impl UpgradeRun {
    fn transition(&mut self, to: RunState, op: &str) -> Result<(), RuoError> {
        if !is_legal(self.state, to) {
            return Err(RuoError::invalid_transition(op, self.state));
        }
        info!(
            run_id = %self.id,
            from = %self.state,
            to = %to,
            "Run state transition"
        );
        self.state = to;
        self.touch();
        if to.is_terminal() {
            self.completed_at = Some(self.updated_at);
        }
        Ok(())
    }

    /// PENDING -> RUNNING.
    pub fn start(&mut self) -> Result<(), RuoError> {
        self.transition(RunState::Running, "start")
    }

    /// Drive the run forward as far as it can go without waiting on tasks.
    ///
    /// Returns commands for tasks that were queued by this call. Skips empty
    /// groups, advances finished stages and completes the run after the last
    /// group. Does nothing unless the run is RUNNING.
    pub fn step(&mut self) -> Result<Vec<TaskCommand>, RuoError> {
        loop {
            if self.state != RunState::Running {
                return Ok(Vec::new());
            }

            let Some(group) = self.plan.groups.get(self.cursor.group) else {
                self.message = Some(format!(
                    "{} tasks completed: {} -> {}",
                    self.tasks.len(),
                    self.plan.from_version,
                    self.plan.to_version
                ));
                self.transition(RunState::Completed, "complete")?;
                return Ok(Vec::new());
            };

            if self.cursor.stage >= group.stages.len() {
                if group.stages.is_empty() {
                    debug!(run_id = %self.id, group = %group.name, "Skipping empty group");
                }
                self.cursor = self.cursor.next_group();
                self.stage_dispatched = false;
                continue;
            }

            if !self.stage_dispatched {
                let commands = self.queue_stage();
                self.stage_dispatched = true;
                if !commands.is_empty() {
                    return Ok(commands);
                }
            }

            if self.stage_tasks().any(|t| !t.status.is_terminal()) {
                return Ok(Vec::new());
            }

            if !self.advance()? {
                return Ok(Vec::new());
            }
        }
    }

    /// Mark every PENDING task of the current stage QUEUED and build its command.
    fn queue_stage(&mut self) -> Vec<TaskCommand> {
        let cursor = self.cursor;
        let run_id = self.id;
        let direction = self.policy.direction;

        let commands: Vec<TaskCommand> = self
            .tasks
            .iter_mut()
            .filter(|t| t.group == cursor.group && t.stage == cursor.stage)
            .filter(|t| t.status == TaskStatus::Pending)
            .map(|task| {
                task.status = TaskStatus::Queued;
                TaskCommand {
                    run_id,
                    task_id: task.id,
                    host: task.host.clone(),
                    service: task.service.clone(),
                    component: task.component.clone(),
                    operation: task.operation,
                    version: task.version.clone(),
                    direction,
                    attempt: task.retry_count + 1,
                }
            })
            .collect();

        if let Some(stage) = self.current_stage() {
            info!(
                run_id = %self.id,
                stage = %stage.name,
                tasks = commands.len(),
                "Stage dispatched"
            );
        }
        self.touch();
        commands
    }

    /// Close the current stage once all of its tasks are terminal.
    ///
    /// Returns `Ok(true)` if the cursor moved to the next stage and `Ok(false)`
    /// if a failure moved the run to HOLDING instead.
    pub fn advance(&mut self) -> Result<bool, RuoError> {
        if self.state != RunState::Running {
            return Err(RuoError::invalid_transition("advance", self.state));
        }
        if self.stage_tasks().any(|t| !t.status.is_terminal()) {
            return Err(RuoError::invalid_transition(
                "advance past outstanding tasks of",
                self.state,
            ));
        }

        let skippable = self.current_group().is_some_and(|g| g.skippable);
        let stage_name = self
            .current_stage()
            .map(|s| s.name.clone())
            .unwrap_or_default();

        let (tolerated, blocking): (Vec<_>, Vec<_>) = self
            .stage_tasks()
            .filter(|t| t.status.is_failure())
            .partition(|t| skippable && t.operation == OperationKind::Check);

        for task in &tolerated {
            warn!(
                run_id = %self.id,
                task_id = task.id,
                host = %task.host,
                "Service check failed in skippable group, continuing"
            );
        }

        if !blocking.is_empty() {
            let failures: Vec<String> = blocking
                .iter()
                .map(|t| {
                    format!(
                        "{} {}/{} ({})",
                        t.host,
                        t.service,
                        t.component,
                        t.last_error.as_deref().unwrap_or("failed")
                    )
                })
                .collect();
            self.message = Some(format!(
                "{stage_name}: {} task(s) failed: {}",
                failures.len(),
                failures.join(", ")
            ));
            self.transition(RunState::Holding, "hold")?;
            return Ok(false);
        }

        debug!(run_id = %self.id, stage = %stage_name, "Stage completed");
        self.cursor = self.cursor.next_stage();
        self.stage_dispatched = false;
        self.touch();
        Ok(true)
    }

    /// Re-queue the failed tasks of the current stage and return to RUNNING.
    ///
    /// Only valid from HOLDING. Returns how many tasks were re-queued.
    pub fn retry(&mut self) -> Result<usize, RuoError> {
        if self.state != RunState::Holding {
            return Err(RuoError::invalid_transition("retry", self.state));
        }

        let cursor = self.cursor;
        let mut requeued = 0;
        for task in self
            .tasks
            .iter_mut()
            .filter(|t| t.group == cursor.group && t.stage == cursor.stage)
            .filter(|t| t.status.is_failure())
        {
            task.status = TaskStatus::Pending;
            task.retry_count += 1;
            task.last_error = None;
            task.started_at = None;
            task.completed_at = None;
            requeued += 1;
        }

        self.stage_dispatched = false;
        self.message = None;
        self.transition(RunState::Running, "retry")?;
        info!(run_id = %self.id, requeued, "Failed tasks re-queued");
        Ok(requeued)
    }

    /// Block dispatch of further stages. Tasks already sent keep running.
    pub fn suspend(&mut self) -> Result<(), RuoError> {
        if !matches!(self.state, RunState::Running | RunState::Holding) {
            return Err(RuoError::invalid_transition("suspend", self.state));
        }
        self.transition(RunState::Suspended, "suspend")
    }

    /// Return to RUNNING from SUSPENDED or HOLDING. A stage that still holds
    /// a failure re-enters HOLDING on the next [`UpgradeRun::step`].
    pub fn resume(&mut self) -> Result<(), RuoError> {
        if !matches!(self.state, RunState::Suspended | RunState::Holding) {
            return Err(RuoError::invalid_transition("resume", self.state));
        }
        self.transition(RunState::Running, "resume")
    }

    /// Skip every task that has not reached a terminal status and archive the run.
    pub fn abort(&mut self, reason: impl Into<String>) -> Result<(), RuoError> {
        if self.state.is_terminal() {
            return Err(RuoError::invalid_transition("abort", self.state));
        }

        let now = Utc::now();
        let mut skipped = 0;
        for task in self.tasks.iter_mut().filter(|t| !t.status.is_terminal()) {
            task.status = TaskStatus::Skipped;
            task.completed_at = Some(now);
            skipped += 1;
        }

        let reason = reason.into();
        warn!(run_id = %self.id, skipped, reason = %reason, "Aborting run");
        self.message = Some(reason);
        self.transition(RunState::Aborted, "abort")
    }

    /// Record a task event reported by the executor.
    ///
    /// Events for an archived run are dropped. An event that contradicts the
    /// aggregate is a [`RuoError::Fatal`] and the caller aborts the run.
    pub fn apply(&mut self, event: &TaskEvent) -> Result<(), RuoError> {
        if self.state.is_terminal() {
            debug!(run_id = %self.id, task_id = event.task_id(), "Dropping event for archived run");
            return Ok(());
        }

        let task_id = event.task_id();
        let cursor = self.cursor;
        let Some(task) = self.tasks.get(task_id) else {
            return Err(RuoError::Fatal(format!("event for unknown task {task_id}")));
        };
        if task.group != cursor.group || task.stage != cursor.stage {
            return Err(RuoError::Fatal(format!(
                "event for task {task_id} outside the current stage"
            )));
        }
        if task.status.is_terminal() {
            return Err(RuoError::Fatal(format!(
                "event for task {task_id} which is already {}",
                task.status
            )));
        }

        match event {
            TaskEvent::Started { attempt, .. } => {
                let host = task.host.as_str();
                let busy = self.tasks.iter().any(|t| {
                    t.id != task_id && t.host == host && t.status == TaskStatus::InProgress
                });
                if busy {
                    return Err(RuoError::Fatal(format!(
                        "task {task_id} started while another task is in progress on {host}"
                    )));
                }
                let task = &mut self.tasks[task_id];
                task.status = TaskStatus::InProgress;
                if task.started_at.is_none() {
                    task.started_at = Some(Utc::now());
                }
                debug!(
                    run_id = %self.id,
                    task_id,
                    host = %task.host,
                    operation = %task.operation,
                    attempt,
                    "Task started"
                );
            }
            TaskEvent::Finished { outcome, .. } => {
                if !outcome.status.is_terminal() {
                    return Err(RuoError::Fatal(format!(
                        "task {task_id} finished with non-terminal status {}",
                        outcome.status
                    )));
                }
                let task = &mut self.tasks[task_id];
                task.status = outcome.status;
                task.retry_count += outcome.retries;
                task.last_error = outcome.error.as_ref().map(ToString::to_string);
                task.completed_at = Some(Utc::now());
                info!(
                    run_id = %self.id,
                    task_id,
                    host = %task.host,
                    operation = %task.operation,
                    status = %task.status,
                    retries = task.retry_count,
                    "Task finished"
                );
            }
        }
        self.touch();
        Ok(())
    }
}
