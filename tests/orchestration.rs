use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use ruo::agent::{AgentTransport, PingReply, PingRequest, ProbeConfig, TaskCommand};
use ruo::directive::RawDirectives;
use ruo::executor::ExecutorConfig;
use ruo::plan::OperationKind;
use ruo::resource::{HistoryFilter, UpgradeResource};
use ruo::run::{RunId, RunState, TaskStatus, UpgradeRun};
use ruo::topology::{Component, Service, Topology};
use ruo::{EngineConfig, Orchestrator, RuoError};

/// Scripted agent fleet. Records every command and per-host concurrency.
#[derive(Default)]
struct FakeFleet {
    delay: Duration,
    state: Mutex<FleetState>,
}

#[derive(Default)]
struct FleetState {
    /// Remaining rejections per host.
    failures: HashMap<String, u32>,
    /// Hosts that refuse pings and commands.
    down: HashSet<String>,
    /// Hosts whose commands never finish.
    hung: HashSet<String>,
    in_flight: HashMap<String, u32>,
    max_per_host: u32,
    executed: Vec<(String, OperationKind, u32)>,
}

impl FakeFleet {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    fn fail(&self, host: &str, times: u32) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(host.to_string(), times);
    }

    fn set_down(&self, host: &str, down: bool) {
        let mut state = self.state.lock().unwrap();
        if down {
            state.down.insert(host.to_string());
        } else {
            state.down.remove(host);
        }
    }

    fn hang(&self, host: &str) {
        self.state.lock().unwrap().hung.insert(host.to_string());
    }

    fn executed_on(&self, host: &str, operation: OperationKind) -> Vec<u32> {
        self.state
            .lock()
            .unwrap()
            .executed
            .iter()
            .filter(|(h, op, _)| h == host && *op == operation)
            .map(|(_, _, attempt)| *attempt)
            .collect()
    }

    fn executed_count(&self) -> usize {
        self.state.lock().unwrap().executed.len()
    }

    fn max_per_host(&self) -> u32 {
        self.state.lock().unwrap().max_per_host
    }
}

#[async_trait]
impl AgentTransport for FakeFleet {
    async fn ping(&self, host: &str, _request: &PingRequest) -> Result<PingReply, RuoError> {
        if self.state.lock().unwrap().down.contains(host) {
            return Err(RuoError::Transport(host.to_string(), "connection refused".into()));
        }
        Ok(PingReply::now())
    }

    async fn execute(&self, host: &str, command: &TaskCommand) -> Result<(), RuoError> {
        let hung = {
            let mut state = self.state.lock().unwrap();
            if state.down.contains(host) {
                return Err(RuoError::Transport(host.to_string(), "connection refused".into()));
            }
            state
                .executed
                .push((host.to_string(), command.operation, command.attempt));
            let count = state.in_flight.entry(host.to_string()).or_default();
            *count += 1;
            let count = *count;
            state.max_per_host = state.max_per_host.max(count);
            state.hung.contains(host)
        };

        if hung {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        tokio::time::sleep(self.delay).await;

        let mut state = self.state.lock().unwrap();
        *state.in_flight.entry(host.to_string()).or_default() -= 1;
        match state.failures.get_mut(host) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(RuoError::CommandRejected(host.to_string(), "exit status 1".into()))
            }
            _ => Ok(()),
        }
    }
}

fn engine(failure_threshold: u32) -> EngineConfig {
    EngineConfig {
        executor: ExecutorConfig {
            task_timeout: Duration::from_secs(5),
            ..ExecutorConfig::default()
        },
        probe: ProbeConfig {
            interval: Duration::from_secs(3600),
            timeout: Duration::from_millis(200),
            failure_threshold,
            ..ProbeConfig::default()
        },
        ..EngineConfig::default()
    }
}

fn topology(components: Vec<(&str, Vec<&str>)>) -> Topology {
    Topology {
        name: "prod-analytics".to_string(),
        source_version: "2.6.4".to_string(),
        target_version: "3.1.0".to_string(),
        services: vec![Service {
            name: "ServiceA".to_string(),
            skippable: false,
            components: components
                .into_iter()
                .map(|(name, hosts)| Component {
                    name: name.to_string(),
                    hosts: hosts.into_iter().map(str::to_string).collect(),
                    restart_only: false,
                })
                .collect(),
        }],
    }
}

fn two_hosts() -> Topology {
    topology(vec![("WORKER", vec!["host1", "host2"])])
}

fn directives(pairs: &[(&str, &str)]) -> RawDirectives {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

async fn settle(orchestrator: &Orchestrator, id: RunId) -> UpgradeRun {
    tokio::time::timeout(Duration::from_secs(10), orchestrator.wait_settled(id))
        .await
        .expect("run did not settle in time")
        .unwrap()
}

#[tokio::test]
async fn test_successful_run_completes_every_task() {
    let fleet = FakeFleet::new(Duration::ZERO);
    let orchestrator = Orchestrator::new(fleet.clone(), engine(3));

    let id = orchestrator
        .create_run(&two_hosts(), &RawDirectives::new(), None)
        .unwrap();
    let run = settle(&orchestrator, id).await;

    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.plan.groups.len(), 1);
    assert_eq!(run.plan.stage_count(), 4);
    assert_eq!(run.tasks.len(), 8);
    assert_eq!(run.non_terminal_count(), 0);
    assert!(run.tasks.iter().all(|t| t.status == TaskStatus::Completed));
    assert_eq!(fleet.executed_count(), 8);
    assert!(run.completed_at.is_some());

    let resource = orchestrator.get_resource(id).unwrap();
    assert_eq!(resource.progress_percent, 100);
    assert!(resource.current_stage.is_none());
}

#[tokio::test]
async fn test_skip_service_checks_drops_check_tasks() {
    let fleet = FakeFleet::new(Duration::ZERO);
    let orchestrator = Orchestrator::new(fleet.clone(), engine(3));

    let id = orchestrator
        .create_run(
            &two_hosts(),
            &directives(&[("skip_service_checks", "true")]),
            None,
        )
        .unwrap();
    let run = settle(&orchestrator, id).await;

    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.tasks.len(), 6);
    assert!(run.tasks.iter().all(|t| t.operation != OperationKind::Check));
    assert!(fleet.executed_on("host1", OperationKind::Check).is_empty());
}

#[tokio::test]
async fn test_validation_errors_create_no_run() {
    let orchestrator = Orchestrator::new(FakeFleet::new(Duration::ZERO), engine(3));

    let err = orchestrator
        .create_run(&two_hosts(), &directives(&[("downgrade", "true")]), None)
        .unwrap_err();
    assert!(matches!(err, RuoError::IncompatibleDirective(_)), "{err}");

    let err = orchestrator
        .create_run(&two_hosts(), &directives(&[("force", "true")]), None)
        .unwrap_err();
    assert_eq!(err, RuoError::UnsupportedDirective("force".into()));

    let err = orchestrator
        .create_run(&topology(vec![("WORKER", vec![])]), &RawDirectives::new(), None)
        .unwrap_err();
    assert!(matches!(err, RuoError::EmptyTopology(_)), "{err}");

    let err = orchestrator
        .create_run(
            &two_hosts(),
            &directives(&[("downgrade", "true")]),
            Some(RunId::new()),
        )
        .unwrap_err();
    assert!(matches!(err, RuoError::IncompatibleDirective(_)), "{err}");

    assert!(orchestrator.list_runs(HistoryFilter::All).is_empty());
}

#[tokio::test]
async fn test_tasks_on_one_host_never_overlap() {
    let fleet = FakeFleet::new(Duration::from_millis(20));
    let orchestrator = Orchestrator::new(fleet.clone(), engine(3));

    let topology = topology(vec![
        ("NAMENODE", vec!["host1", "host2"]),
        ("DATANODE", vec!["host1", "host2", "host3"]),
    ]);
    let id = orchestrator
        .create_run(&topology, &RawDirectives::new(), None)
        .unwrap();
    let run = settle(&orchestrator, id).await;

    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.tasks.len(), 20);
    assert_eq!(fleet.max_per_host(), 1);
}

#[tokio::test]
async fn test_failure_holds_and_retry_reruns_only_failed_task() {
    let fleet = FakeFleet::new(Duration::ZERO);
    fleet.fail("host2", 1);
    let orchestrator = Orchestrator::new(fleet.clone(), engine(3));

    let id = orchestrator
        .create_run(&two_hosts(), &RawDirectives::new(), None)
        .unwrap();
    let run = settle(&orchestrator, id).await;

    assert_eq!(run.state, RunState::Holding);
    let failed = run.failed_tasks();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].host, "host2");
    assert_eq!(failed[0].status, TaskStatus::Failed);
    assert!(failed[0].last_error.as_deref().unwrap().contains("exit status 1"));
    let host1 = run.stage_tasks().find(|t| t.host == "host1").unwrap();
    assert_eq!(host1.status, TaskStatus::Completed);

    let resource = UpgradeResource::from_run(&run);
    assert_eq!(resource.failed_tasks.len(), 1);
    assert!(resource.message.unwrap().contains("host2"));

    let retried = orchestrator.retry(id).await.unwrap();
    assert_ne!(retried.state, RunState::Holding);
    let run = settle(&orchestrator, id).await;

    assert_eq!(run.state, RunState::Completed);
    assert_eq!(fleet.executed_on("host1", OperationKind::Stop), vec![1]);
    assert_eq!(fleet.executed_on("host2", OperationKind::Stop), vec![1, 2]);
    let stop = run
        .tasks
        .iter()
        .find(|t| t.host == "host2" && t.operation == OperationKind::Stop)
        .unwrap();
    assert_eq!(stop.retry_count, 1);
}

#[tokio::test]
async fn test_automatic_retry_absorbs_transient_failure() {
    let fleet = FakeFleet::new(Duration::ZERO);
    fleet.fail("host2", 1);
    let mut config = engine(3);
    config.executor.max_task_retries = 1;
    let orchestrator = Orchestrator::new(fleet.clone(), config);

    let id = orchestrator
        .create_run(&two_hosts(), &RawDirectives::new(), None)
        .unwrap();
    let run = settle(&orchestrator, id).await;

    assert_eq!(run.state, RunState::Completed);
    assert_eq!(fleet.executed_on("host2", OperationKind::Stop).len(), 2);
}

#[tokio::test]
async fn test_abort_skips_every_remaining_task() {
    let fleet = FakeFleet::new(Duration::from_millis(200));
    let orchestrator = Orchestrator::new(fleet.clone(), engine(3));

    let id = orchestrator
        .create_run(&two_hosts(), &RawDirectives::new(), None)
        .unwrap();
    orchestrator
        .wait_until(id, |run| {
            run.tasks.iter().any(|t| t.status == TaskStatus::InProgress)
        })
        .await
        .unwrap();

    let run = orchestrator.abort(id, "operator requested").await.unwrap();
    assert_eq!(run.state, RunState::Aborted);
    assert_eq!(run.non_terminal_count(), 0);
    assert!(run.tasks.iter().all(|t| t.status == TaskStatus::Skipped));

    // In-flight commands finish on their own; the archived run ignores them.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let archived = orchestrator.get_run(id).unwrap();
    assert_eq!(archived.state, RunState::Aborted);
    assert_eq!(archived.tasks, run.tasks);
    assert!(fleet.executed_count() <= 2);

    let err = orchestrator.abort(id, "again").await.unwrap_err();
    assert_eq!(err, RuoError::invalid_transition("abort", "ABORTED"));
}

#[tokio::test]
async fn test_abort_from_holding() {
    let fleet = FakeFleet::new(Duration::ZERO);
    fleet.fail("host1", 1);
    let orchestrator = Orchestrator::new(fleet, engine(3));

    let id = orchestrator
        .create_run(&two_hosts(), &RawDirectives::new(), None)
        .unwrap();
    assert_eq!(settle(&orchestrator, id).await.state, RunState::Holding);

    let run = orchestrator.abort(id, "giving up").await.unwrap();
    assert_eq!(run.state, RunState::Aborted);
    assert_eq!(run.non_terminal_count(), 0);
    assert_eq!(run.failed_tasks().len(), 1);
    assert_eq!(run.message.as_deref(), Some("giving up"));
}

#[tokio::test]
async fn test_unreachable_host_fails_without_dispatch() {
    let fleet = FakeFleet::new(Duration::ZERO);
    fleet.set_down("host2", true);
    let orchestrator = Orchestrator::new(fleet.clone(), engine(1));

    let id = orchestrator
        .create_run(&two_hosts(), &RawDirectives::new(), None)
        .unwrap();
    let run = settle(&orchestrator, id).await;

    assert_eq!(run.state, RunState::Holding);
    let failed = run.failed_tasks();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].host, "host2");
    assert!(failed[0].last_error.as_deref().unwrap().contains("unreachable"));
    assert!(failed[0].started_at.is_none());
    assert!(fleet.executed_on("host2", OperationKind::Stop).is_empty());

    // Recovery does not retry on its own.
    fleet.set_down("host2", false);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(orchestrator.get_run(id).unwrap().state, RunState::Holding);

    orchestrator.retry(id).await.unwrap();
    let run = settle(&orchestrator, id).await;
    assert_eq!(run.state, RunState::Completed);
}

#[tokio::test]
async fn test_task_timeout_is_distinguished() {
    let fleet = FakeFleet::new(Duration::ZERO);
    fleet.hang("host1");
    let mut config = engine(3);
    config.executor.task_timeout = Duration::from_millis(100);
    let orchestrator = Orchestrator::new(fleet, config);

    let id = orchestrator
        .create_run(&two_hosts(), &RawDirectives::new(), None)
        .unwrap();
    let run = settle(&orchestrator, id).await;

    assert_eq!(run.state, RunState::Holding);
    let failed = run.failed_tasks();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].host, "host1");
    assert_eq!(failed[0].status, TaskStatus::TimedOut);
}

#[tokio::test]
async fn test_suspend_lets_in_flight_tasks_finish() {
    let fleet = FakeFleet::new(Duration::from_millis(100));
    let orchestrator = Orchestrator::new(fleet.clone(), engine(3));

    let id = orchestrator
        .create_run(&two_hosts(), &RawDirectives::new(), None)
        .unwrap();
    orchestrator
        .wait_until(id, |run| {
            run.tasks.iter().any(|t| t.status == TaskStatus::InProgress)
        })
        .await
        .unwrap();

    let run = orchestrator.suspend(id).await.unwrap();
    assert_eq!(run.state, RunState::Suspended);

    let run = orchestrator
        .wait_until(id, |run| run.stage_tasks().all(|t| t.status.is_terminal()))
        .await
        .unwrap();
    assert_eq!(run.state, RunState::Suspended);
    assert_eq!(run.cursor.stage, 0);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(fleet.executed_count(), 2);

    orchestrator.resume(id).await.unwrap();
    let run = settle(&orchestrator, id).await;
    assert_eq!(run.state, RunState::Completed);
    assert_eq!(fleet.executed_count(), 8);
}

#[tokio::test]
async fn test_commands_on_unknown_or_wrong_state() {
    let orchestrator = Orchestrator::new(FakeFleet::new(Duration::ZERO), engine(3));

    let missing = RunId::new();
    assert!(matches!(
        orchestrator.get_run(missing),
        Err(RuoError::RunNotFound(_))
    ));
    assert!(matches!(
        orchestrator.retry(missing).await,
        Err(RuoError::RunNotFound(_))
    ));

    let id = orchestrator
        .create_run(&two_hosts(), &RawDirectives::new(), None)
        .unwrap();
    settle(&orchestrator, id).await;
    let err = orchestrator.retry(id).await.unwrap_err();
    assert!(matches!(err, RuoError::InvalidTransition { .. }), "{err}");
}

#[tokio::test]
async fn test_downgrade_after_abort() {
    let fleet = FakeFleet::new(Duration::from_millis(50));
    let orchestrator = Orchestrator::new(fleet.clone(), engine(3));
    let topology = two_hosts();

    let forward = orchestrator
        .create_run(&topology, &RawDirectives::new(), None)
        .unwrap();

    // A downgrade cannot reverse a run that is still in flight.
    let err = orchestrator
        .create_run(&topology, &directives(&[("downgrade", "true")]), Some(forward))
        .unwrap_err();
    assert!(matches!(err, RuoError::IncompatibleDirective(_)), "{err}");

    orchestrator.abort(forward, "rolling back").await.unwrap();

    let downgrade = orchestrator
        .create_run(&topology, &directives(&[("downgrade", "true")]), Some(forward))
        .unwrap();
    let run = settle(&orchestrator, downgrade).await;

    assert_eq!(run.state, RunState::Completed);
    assert_eq!(run.policy.downgrade_of(), Some(forward));
    assert_eq!(run.plan.from_version, "3.1.0");
    assert_eq!(run.plan.to_version, "2.6.4");

    // A downgrade cannot itself be reversed.
    let err = orchestrator
        .create_run(&topology, &directives(&[("downgrade", "true")]), Some(downgrade))
        .unwrap_err();
    assert!(matches!(err, RuoError::IncompatibleDirective(_)), "{err}");

    let aborted = orchestrator.list_runs(HistoryFilter::UpgradeAborted);
    assert_eq!(aborted.len(), 1);
    assert_eq!(aborted[0].id, forward);
    let completed = orchestrator.list_runs(HistoryFilter::DowngradeCompleted);
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].id, downgrade);
    assert!(orchestrator.list_runs(HistoryFilter::UpgradeCompleted).is_empty());
    assert_eq!(orchestrator.list_runs(HistoryFilter::All).len(), 2);
}

#[tokio::test]
async fn test_downgrade_waits_for_forward_run_to_release_hosts() {
    let fleet = FakeFleet::new(Duration::from_millis(300));
    let orchestrator = Orchestrator::new(fleet.clone(), engine(3));
    let topology = two_hosts();

    let forward = orchestrator
        .create_run(&topology, &RawDirectives::new(), None)
        .unwrap();
    orchestrator
        .wait_until(forward, |run| {
            run.tasks.iter().any(|t| t.status == TaskStatus::InProgress)
        })
        .await
        .unwrap();

    // A suspended run still has commands in flight and can be resumed.
    let run = orchestrator.suspend(forward).await.unwrap();
    assert_eq!(run.state, RunState::Suspended);
    let err = orchestrator
        .create_run(&topology, &directives(&[("downgrade", "true")]), Some(forward))
        .unwrap_err();
    assert!(matches!(err, RuoError::IncompatibleDirective(_)), "{err}");
    assert_eq!(orchestrator.list_runs(HistoryFilter::All).len(), 1);

    // Once aborted, the downgrade is accepted but waits for the forward
    // run's in-flight commands before touching the same hosts.
    orchestrator.abort(forward, "rolling back").await.unwrap();
    let downgrade = orchestrator
        .create_run(&topology, &directives(&[("downgrade", "true")]), Some(forward))
        .unwrap();
    let run = settle(&orchestrator, downgrade).await;

    assert_eq!(run.state, RunState::Completed);
    assert_eq!(fleet.max_per_host(), 1);
}
