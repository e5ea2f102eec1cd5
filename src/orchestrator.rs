//! Orchestration command surface.
//!
//! Every run is owned by one driver task. Control commands and task events
//! reach it over channels and are applied one at a time; readers only ever see
//! the snapshots it publishes on a watch channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, info, warn};

use crate::agent::{AgentSupervisors, AgentTransport};
use crate::config::EngineConfig;
use crate::directive::{self, RawDirectives};
use crate::error::RuoError;
use crate::executor::{HostLocks, TaskExecutor};
use crate::notify::{self, NotificationConfig, SlackNotifier};
use crate::plan;
use crate::resource::{HistoryFilter, UpgradeResource};
use crate::run::{RunId, RunState, TaskEvent, UpgradeRun};
use crate::telemetry::metrics::{Metrics, RunLabels};
use crate::topology::Topology;

const CONTROL_BUFFER: usize = 8;
const EVENT_BUFFER: usize = 256;

#[derive(Debug)]
enum ControlOp {
    Retry,
    Suspend,
    Resume,
    Abort(String),
}

impl ControlOp {
    const fn name(&self) -> &'static str {
        match self {
            Self::Retry => "retry",
            Self::Suspend => "suspend",
            Self::Resume => "resume",
            Self::Abort(_) => "abort",
        }
    }
}

struct Control {
    op: ControlOp,
    reply: oneshot::Sender<Result<UpgradeRun, RuoError>>,
}

struct RunHandle {
    control: mpsc::Sender<Control>,
    snapshot: watch::Receiver<UpgradeRun>,
}

/// Creates runs and routes commands to them.
///
/// `runs` is the in-memory run history: archived runs stay listed and
/// readable for the life of the orchestrator, their drivers having exited.
pub struct Orchestrator {
    transport: Arc<dyn AgentTransport>,
    config: EngineConfig,
    metrics: Option<Arc<Metrics>>,
    slack: Option<Arc<SlackNotifier>>,
    host_locks: Arc<HostLocks>,
    runs: Mutex<HashMap<RunId, RunHandle>>,
}

impl Orchestrator {
    pub fn new(transport: Arc<dyn AgentTransport>, config: EngineConfig) -> Self {
        Self {
            transport,
            config,
            metrics: None,
            slack: None,
            host_locks: Arc::default(),
            runs: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    #[must_use]
    pub fn with_slack(mut self, slack: Arc<SlackNotifier>) -> Self {
        self.slack = Some(slack);
        self
    }

    /// Validate directives, build the plan and start a new run.
    ///
    /// `reference` is the forward run a downgrade reverses. Validation errors
    /// are returned before anything is created. Must be called from within a
    /// Tokio runtime.
    pub fn create_run(
        &self,
        topology: &Topology,
        directives: &RawDirectives,
        reference: Option<RunId>,
    ) -> Result<RunId, RuoError> {
        let policy = directive::parse(directives, reference)?;
        if let Some(of) = policy.downgrade_of() {
            self.check_downgrade_reference(of, topology)?;
        }
        let plan = plan::build(topology, &policy)?;

        let runtime = Handle::try_current()
            .map_err(|e| RuoError::Fatal(format!("no Tokio runtime to drive the run: {e}")))?;

        let run = UpgradeRun::new(RunId::new(), plan, policy);
        let id = run.id;
        let labels = RunLabels {
            topology: run.plan.topology.clone(),
            direction: run.policy.direction.to_string(),
        };

        info!(
            run_id = %id,
            topology = %run.plan.topology,
            direction = %run.policy.direction,
            skip_service_checks = run.policy.skip_service_checks,
            tasks = run.tasks.len(),
            "Upgrade run created"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_run_created(id, &labels);
        }

        let (control_tx, control_rx) = mpsc::channel(CONTROL_BUFFER);
        let (snapshot_tx, snapshot_rx) = watch::channel(run.clone());
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let supervisors = Arc::new(AgentSupervisors::new(
            self.transport.clone(),
            self.config.probe.clone(),
        ));
        let executor = TaskExecutor::new(
            self.transport.clone(),
            supervisors.clone(),
            self.config.executor.clone(),
        )
        .with_host_locks(self.host_locks.clone());

        let driver = RunDriver {
            run,
            executor,
            supervisors,
            events: events_tx,
            cancel: cancel_tx,
            cancel_rx,
            snapshot: snapshot_tx,
            metrics: self.metrics.clone(),
            slack: self.slack.clone(),
            notification: self.config.notification,
            labels,
        };

        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id,
                RunHandle {
                    control: control_tx,
                    snapshot: snapshot_rx,
                },
            );
        runtime.spawn(driver.run(control_rx, events_rx));
        Ok(id)
    }

    fn check_downgrade_reference(&self, of: RunId, topology: &Topology) -> Result<(), RuoError> {
        let forward = self.get_run(of).map_err(|_| {
            RuoError::IncompatibleDirective(format!("downgrade references unknown run {of}"))
        })?;
        if forward.policy.is_downgrade() {
            return Err(RuoError::IncompatibleDirective(format!(
                "run {of} is a downgrade and cannot be reversed"
            )));
        }
        if !forward.state.is_terminal() {
            return Err(RuoError::IncompatibleDirective(format!(
                "run {of} is still {}",
                forward.state
            )));
        }
        if forward.plan.topology != topology.name {
            return Err(RuoError::IncompatibleDirective(format!(
                "run {of} targeted topology {}, not {}",
                forward.plan.topology, topology.name
            )));
        }
        Ok(())
    }

    fn watch(&self, id: RunId) -> Result<watch::Receiver<UpgradeRun>, RuoError> {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|h| h.snapshot.clone())
            .ok_or_else(|| RuoError::RunNotFound(id.to_string()))
    }

    /// Latest snapshot of a run.
    pub fn get_run(&self, id: RunId) -> Result<UpgradeRun, RuoError> {
        Ok(self.watch(id)?.borrow().clone())
    }

    /// Latest snapshot of a run as an `Upgrade` resource.
    pub fn get_resource(&self, id: RunId) -> Result<UpgradeResource, RuoError> {
        Ok(UpgradeResource::from_run(&self.watch(id)?.borrow()))
    }

    /// Snapshots of every run matching `filter`, oldest first.
    pub fn list_runs(&self, filter: HistoryFilter) -> Vec<UpgradeRun> {
        let mut runs: Vec<UpgradeRun> = self
            .runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|h| h.snapshot.borrow().clone())
            .filter(|r| filter.matches(&r.policy, r.state))
            .collect();
        runs.sort_by_key(|r| r.created_at);
        runs
    }

    async fn control(&self, id: RunId, op: ControlOp) -> Result<UpgradeRun, RuoError> {
        let (sender, snapshot) = {
            let runs = self.runs.lock().unwrap_or_else(PoisonError::into_inner);
            let handle = runs
                .get(&id)
                .ok_or_else(|| RuoError::RunNotFound(id.to_string()))?;
            (handle.control.clone(), handle.snapshot.clone())
        };

        let name = op.name();
        // The driver exits once the run is archived.
        let gone = || RuoError::invalid_transition(name, snapshot.borrow().state);

        let (reply, rx) = oneshot::channel();
        sender
            .send(Control { op, reply })
            .await
            .map_err(|_| gone())?;
        rx.await.map_err(|_| gone())?
    }

    /// Re-queue the failed tasks of a HOLDING run.
    pub async fn retry(&self, id: RunId) -> Result<UpgradeRun, RuoError> {
        self.control(id, ControlOp::Retry).await
    }

    pub async fn suspend(&self, id: RunId) -> Result<UpgradeRun, RuoError> {
        self.control(id, ControlOp::Suspend).await
    }

    pub async fn resume(&self, id: RunId) -> Result<UpgradeRun, RuoError> {
        self.control(id, ControlOp::Resume).await
    }

    pub async fn abort(&self, id: RunId, reason: impl Into<String>) -> Result<UpgradeRun, RuoError> {
        self.control(id, ControlOp::Abort(reason.into())).await
    }

    /// Wait until a snapshot of the run satisfies `predicate`.
    pub async fn wait_until(
        &self,
        id: RunId,
        mut predicate: impl FnMut(&UpgradeRun) -> bool,
    ) -> Result<UpgradeRun, RuoError> {
        let mut rx = self.watch(id)?;
        let run = rx
            .wait_for(|run| predicate(run))
            .await
            .map_err(|_| RuoError::Fatal(format!("run {id} stopped before reaching the awaited state")))?;
        Ok(run.clone())
    }

    /// Wait until the run is HOLDING, COMPLETED or ABORTED.
    pub async fn wait_settled(&self, id: RunId) -> Result<UpgradeRun, RuoError> {
        self.wait_until(id, |run| run.state.is_settled()).await
    }
}

/// Single writer of one run.
struct RunDriver {
    run: UpgradeRun,
    executor: TaskExecutor,
    supervisors: Arc<AgentSupervisors>,
    events: mpsc::Sender<TaskEvent>,
    cancel: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    snapshot: watch::Sender<UpgradeRun>,
    metrics: Option<Arc<Metrics>>,
    slack: Option<Arc<SlackNotifier>>,
    notification: NotificationConfig,
    labels: RunLabels,
}

impl RunDriver {
    async fn run(
        mut self,
        mut controls: mpsc::Receiver<Control>,
        mut events: mpsc::Receiver<TaskEvent>,
    ) {
        let from = self.run.state;
        if let Err(e) = self.run.start() {
            self.fail(&e);
        }
        self.observe(from);
        self.pump();
        self.publish();

        while !self.run.state.is_terminal() {
            tokio::select! {
                Some(event) = events.recv() => self.on_event(&event),
                control = controls.recv() => match control {
                    Some(control) => self.on_control(control),
                    None => {
                        let from = self.run.state;
                        if self.run.abort("orchestrator shut down").is_ok() {
                            self.observe(from);
                        }
                        self.publish();
                    }
                },
            }
        }
        info!(run_id = %self.run.id, state = %self.run.state, "Run driver finished");
    }

    fn on_event(&mut self, event: &TaskEvent) {
        match self.run.apply(event) {
            Ok(()) => self.record_task(event),
            Err(e) => self.fail(&e),
        }
        self.pump();
        self.publish();
    }

    fn on_control(&mut self, control: Control) {
        let from = self.run.state;
        let result = match control.op {
            ControlOp::Retry => self.run.retry().map(|_| ()),
            ControlOp::Suspend => self.run.suspend(),
            ControlOp::Resume => self.run.resume(),
            ControlOp::Abort(reason) => self.run.abort(reason),
        };
        if let Err(e) = &result {
            warn!(run_id = %self.run.id, error = %e, "Control command rejected");
        }
        self.observe(from);
        self.pump();
        self.publish();
        let _ = control.reply.send(result.map(|()| self.run.clone()));
    }

    /// Advance the run and hand newly queued tasks to the executor.
    fn pump(&mut self) {
        let from = self.run.state;
        match self.run.step() {
            Ok(commands) if !commands.is_empty() => {
                self.executor
                    .dispatch(commands, self.events.clone(), self.cancel_rx.clone());
            }
            Ok(_) => {}
            Err(e) => self.fail(&e),
        }
        self.observe(from);
    }

    /// Abort the run after an error in the transition path.
    fn fail(&mut self, error: &RuoError) {
        error!(run_id = %self.run.id, error = %error, "Aborting run after orchestration error");
        let from = self.run.state;
        if self.run.abort(format!("Fatal: {error}")).is_ok() {
            self.observe(from);
        }
    }

    fn publish(&self) {
        self.snapshot.send_replace(self.run.clone());
    }

    fn record_task(&self, event: &TaskEvent) {
        let (Some(metrics), TaskEvent::Finished { task_id, outcome }) = (&self.metrics, event)
        else {
            return;
        };
        let Some(task) = self.run.task(*task_id) else {
            return;
        };
        let duration = task
            .started_at
            .zip(task.completed_at)
            .and_then(|(start, end)| (end - start).to_std().ok())
            .map(|d| d.as_secs_f64());
        metrics.record_task_finished(task.operation, task.status, duration);
        if matches!(outcome.error, Some(RuoError::HostUnreachable(_, _))) {
            metrics.record_host_unreachable(&task.host);
        }
    }

    /// React to a state change since `from`.
    fn observe(&self, from: RunState) {
        let to = self.run.state;
        if to == from {
            return;
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_transition(self.run.id, &self.labels, to);
        }

        if to.is_terminal() {
            let _ = self.cancel.send(true);
            self.executor.shutdown();
            self.supervisors.shutdown();
        }

        if let Some(slack) = &self.slack
            && notify::should_notify(&self.notification, &self.run.policy)
            && let Some(notice) = notify::build_notice(&self.run, from)
        {
            let slack = slack.clone();
            tokio::spawn(async move {
                slack.send(&notice).await;
            });
        }
    }
}
