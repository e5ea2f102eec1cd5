//! Prometheus metrics for the ruo orchestrator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::plan::OperationKind;
use crate::run::{RunId, RunState, TaskStatus};

/// Labels for run-level metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RunLabels {
    pub topology: String,
    pub direction: String,
}

/// Labels for state transition metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StateLabels {
    pub topology: String,
    pub direction: String,
    pub state: String,
}

/// Labels for finished task metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TaskLabels {
    pub operation: String,
    pub status: String,
}

/// Labels for task duration metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OperationLabels {
    pub operation: String,
}

/// Labels for host liveness metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HostLabels {
    pub host: String,
}

/// All Prometheus metrics for the orchestrator.
pub struct Metrics {
    pub runs_created_total: Family<RunLabels, Counter>,
    pub runs_active: Gauge,
    pub state_transition_total: Family<StateLabels, Counter>,
    pub runs_completed_total: Family<RunLabels, Counter>,
    pub runs_aborted_total: Family<RunLabels, Counter>,
    pub runs_holding_total: Family<RunLabels, Counter>,
    pub run_duration_seconds: Family<RunLabels, Histogram>,
    pub task_finished_total: Family<TaskLabels, Counter>,
    pub task_duration_seconds: Family<OperationLabels, Histogram>,
    pub host_unreachable_total: Family<HostLabels, Counter>,
    /// In-memory tracking of when each run started.
    run_start_times: Mutex<HashMap<RunId, Instant>>,
}

/// Buckets for single task duration (1s to 1h): installs can take many minutes.
const TASK_DURATION_BUCKETS: &[f64] = &[
    0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0, 3600.0,
];

/// Buckets for whole run duration (1m to 12h).
const RUN_DURATION_BUCKETS: &[f64] = &[
    60.0, 300.0, 600.0, 1800.0, 3600.0, 7200.0, 14400.0, 28800.0, 43200.0,
];

impl Metrics {
    /// Create and register all metrics with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let runs_created_total = Family::<RunLabels, Counter>::default();
        registry.register(
            "ruo_runs_created",
            "Total number of upgrade runs created",
            runs_created_total.clone(),
        );

        let runs_active = Gauge::default();
        registry.register(
            "ruo_runs_active",
            "Number of runs not yet in a terminal state",
            runs_active.clone(),
        );

        let state_transition_total = Family::<StateLabels, Counter>::default();
        registry.register(
            "ruo_state_transition",
            "Total number of run state transitions",
            state_transition_total.clone(),
        );

        let runs_completed_total = Family::<RunLabels, Counter>::default();
        registry.register(
            "ruo_runs_completed",
            "Total number of runs that reached COMPLETED",
            runs_completed_total.clone(),
        );

        let runs_aborted_total = Family::<RunLabels, Counter>::default();
        registry.register(
            "ruo_runs_aborted",
            "Total number of runs that reached ABORTED",
            runs_aborted_total.clone(),
        );

        let runs_holding_total = Family::<RunLabels, Counter>::default();
        registry.register(
            "ruo_runs_holding",
            "Total number of times a run entered HOLDING after a stage failure",
            runs_holding_total.clone(),
        );

        let run_duration_seconds = Family::<RunLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(RUN_DURATION_BUCKETS.iter().copied())
        });
        registry.register(
            "ruo_run_duration_seconds",
            "Time from run creation to a terminal state in seconds",
            run_duration_seconds.clone(),
        );

        let task_finished_total = Family::<TaskLabels, Counter>::default();
        registry.register(
            "ruo_task_finished",
            "Total number of tasks that reached a terminal status",
            task_finished_total.clone(),
        );

        let task_duration_seconds =
            Family::<OperationLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(TASK_DURATION_BUCKETS.iter().copied())
            });
        registry.register(
            "ruo_task_duration_seconds",
            "Duration of task execution in seconds",
            task_duration_seconds.clone(),
        );

        let host_unreachable_total = Family::<HostLabels, Counter>::default();
        registry.register(
            "ruo_host_unreachable",
            "Total number of tasks failed because their host was unreachable",
            host_unreachable_total.clone(),
        );

        Self {
            runs_created_total,
            runs_active,
            state_transition_total,
            runs_completed_total,
            runs_aborted_total,
            runs_holding_total,
            run_duration_seconds,
            task_finished_total,
            task_duration_seconds,
            host_unreachable_total,
            run_start_times: Mutex::new(HashMap::new()),
        }
    }

    /// Record a newly created run and start tracking its duration.
    pub fn record_run_created(&self, run_id: RunId, labels: &RunLabels) {
        self.runs_created_total.get_or_create(labels).inc();
        self.runs_active.inc();
        self.run_start_times
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(run_id, Instant::now());
    }

    /// Record a run state transition. Terminal states close out the run.
    pub fn record_transition(&self, run_id: RunId, labels: &RunLabels, state: RunState) {
        self.state_transition_total
            .get_or_create(&StateLabels {
                topology: labels.topology.clone(),
                direction: labels.direction.clone(),
                state: state.to_string(),
            })
            .inc();

        match state {
            RunState::Holding => {
                self.runs_holding_total.get_or_create(labels).inc();
            }
            RunState::Completed => {
                self.runs_completed_total.get_or_create(labels).inc();
                self.observe_run_duration(run_id, labels);
            }
            RunState::Aborted => {
                self.runs_aborted_total.get_or_create(labels).inc();
                self.observe_run_duration(run_id, labels);
            }
            RunState::Pending | RunState::Running | RunState::Suspended => {}
        }
    }

    /// Observe the duration of a finished run and remove its start time entry.
    /// Returns the observed duration in seconds, or None if no start time was tracked.
    fn observe_run_duration(&self, run_id: RunId, labels: &RunLabels) -> Option<f64> {
        let start = self
            .run_start_times
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&run_id)?;
        self.runs_active.dec();
        let duration = start.elapsed().as_secs_f64();
        self.run_duration_seconds
            .get_or_create(labels)
            .observe(duration);
        Some(duration)
    }

    /// Record a task reaching a terminal status.
    pub fn record_task_finished(
        &self,
        operation: OperationKind,
        status: TaskStatus,
        duration_secs: Option<f64>,
    ) {
        self.task_finished_total
            .get_or_create(&TaskLabels {
                operation: operation.to_string(),
                status: status.to_string(),
            })
            .inc();
        if let Some(duration) = duration_secs {
            self.task_duration_seconds
                .get_or_create(&OperationLabels {
                    operation: operation.to_string(),
                })
                .observe(duration);
        }
    }

    pub fn record_host_unreachable(&self, host: &str) {
        self.host_unreachable_total
            .get_or_create(&HostLabels {
                host: host.to_string(),
            })
            .inc();
    }
}

/// Axum handler that encodes the registry as OpenMetrics text.
async fn metrics_handler(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let mut buf = String::new();
    if encode(&mut buf, &registry).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics".to_string(),
        );
    }
    (StatusCode::OK, buf)
}

/// Start the metrics server on the given port.
pub async fn serve(port: u16, registry: Arc<Registry>) -> anyhow::Result<()> {
    use axum::Router;
    use axum::routing::get;
    use tokio::net::TcpListener;
    use tracing::info;

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry);

    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!("Metrics server listening on port {}", port);
    axum::serve(listener, app).await?;
    Ok(())
}
