//! ruo - Rolling Upgrade Orchestrator.
//!
//! Plans and drives rolling upgrades of multi-host service clusters, holding
//! on failed stages until they are retried or the run is aborted.

use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use ruo::agent::HttpAgentTransport;
use ruo::config::{BUILD_DATE, COMMIT, Command, Config, HoldAction, VERSION};
use ruo::directive::{DOWNGRADE_DIRECTIVE, RawDirectives, SKIP_SERVICE_CHECKS_DIRECTIVE};
use ruo::notify::SlackNotifier;
use ruo::resource::UpgradeResource;
use ruo::run::{RunId, RunState, UpgradeRun};
use ruo::telemetry::{health, metrics};
use ruo::topology::Topology;
use ruo::{Orchestrator, RuoError, logging, plan};

/// Options of `ruo apply`.
struct ApplyOptions<'a> {
    topology: &'a Path,
    skip_service_checks: bool,
    on_hold: HoldAction,
    max_run_retries: u32,
    downgrade_on_abort: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::from_args();

    if let Err(e) = logging::init(&config.log_format, &config.log_level) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    info!(
        "Starting ruo v{} (commit: {}, build: {})",
        VERSION, COMMIT, BUILD_DATE
    );

    match run(&config).await {
        Ok(code) => code,
        Err(e) => {
            error!("ruo failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: &Config) -> Result<ExitCode> {
    match &config.command {
        Command::Plan {
            topology,
            downgrade,
            skip_service_checks,
        } => {
            let topology = load_topology(topology)?;
            let plan = plan::expand(&topology, *downgrade, *skip_service_checks)?;
            print!("{}", serde_yaml::to_string(&plan)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Schema => {
            let schema = schemars::schema_for!(UpgradeResource);
            println!("{}", serde_json::to_string_pretty(&schema)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Apply {
            topology,
            skip_service_checks,
            on_hold,
            max_run_retries,
            downgrade_on_abort,
        } => {
            let options = ApplyOptions {
                topology,
                skip_service_checks: *skip_service_checks,
                on_hold: *on_hold,
                max_run_retries: *max_run_retries,
                downgrade_on_abort: *downgrade_on_abort,
            };
            apply(config, &options).await
        }
    }
}

fn load_topology(path: &Path) -> Result<Topology> {
    Topology::load(path).with_context(|| format!("Failed to load topology {}", path.display()))
}

async fn apply(config: &Config, options: &ApplyOptions<'_>) -> Result<ExitCode> {
    config.display();
    let topology = load_topology(options.topology)?;

    // Initialize Prometheus metrics
    let mut registry = prometheus_client::registry::Registry::default();
    let metrics = Arc::new(metrics::Metrics::new(&mut registry));
    let registry = Arc::new(registry);

    let health_state = health::HealthState::new();
    let health_state_clone = health_state.clone();
    let health_port = config.health_port;
    tokio::spawn(async move {
        if let Err(e) = health::serve(health_port, health_state_clone).await {
            error!("Health server failed: {}", e);
        }
    });

    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = metrics::serve(metrics_port, registry).await {
            error!("Metrics server failed: {}", e);
        }
    });

    let transport = HttpAgentTransport::new(&config.agent_scheme, config.agent_port)
        .context("Failed to build agent client")?;

    let mut orchestrator =
        Orchestrator::new(Arc::new(transport), config.engine_config()).with_metrics(metrics);
    if let Some(url) = config.slack_webhook() {
        info!("Slack notifications enabled");
        orchestrator = orchestrator.with_slack(Arc::new(SlackNotifier::new(url)));
    }

    health_state.set_ready(true);

    let mut directives = RawDirectives::new();
    if options.skip_service_checks {
        directives.insert(SKIP_SERVICE_CHECKS_DIRECTIVE.to_string(), "true".to_string());
    }

    let run_id = orchestrator.create_run(&topology, &directives, None)?;
    let upgrade = drive(&orchestrator, run_id, options).await?;
    report(&upgrade)?;

    if upgrade.state == RunState::Aborted && options.downgrade_on_abort {
        directives.insert(DOWNGRADE_DIRECTIVE.to_string(), "true".to_string());
        let downgrade_id = orchestrator.create_run(&topology, &directives, Some(run_id))?;
        info!(
            run_id = %downgrade_id,
            reverses = %run_id,
            "Started compensating downgrade"
        );
        let downgrade = drive(&orchestrator, downgrade_id, options).await?;
        report(&downgrade)?;
    }

    health_state.set_ready(false);

    if upgrade.state == RunState::Completed {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}

/// Follow a run until it is archived, applying the hold policy whenever it
/// enters HOLDING. An interrupt aborts the run.
async fn drive(
    orchestrator: &Orchestrator,
    id: RunId,
    options: &ApplyOptions<'_>,
) -> Result<UpgradeRun> {
    let mut retries = 0;
    loop {
        let run = tokio::select! {
            run = orchestrator.wait_settled(id) => run?,
            _ = tokio::signal::ctrl_c() => {
                warn!(run_id = %id, "Received SIGINT, aborting run");
                abort(orchestrator, id, "interrupted by operator").await?;
                continue;
            }
        };

        if run.state != RunState::Holding {
            return Ok(run);
        }

        let stage = run
            .current_stage()
            .map_or_else(|| "unknown".to_string(), |s| s.name.clone());
        warn!(
            run_id = %id,
            stage = %stage,
            failed_tasks = run.failed_tasks().len(),
            message = run.message.as_deref().unwrap_or_default(),
            "Run is holding"
        );

        match options.on_hold {
            HoldAction::Retry if retries < options.max_run_retries => {
                retries += 1;
                info!(
                    run_id = %id,
                    attempt = retries,
                    max_run_retries = options.max_run_retries,
                    "Retrying failed tasks"
                );
                orchestrator.retry(id).await?;
            }
            HoldAction::Wait => {
                info!(run_id = %id, "Waiting for interrupt before aborting the held run");
                tokio::signal::ctrl_c()
                    .await
                    .context("Failed to listen for interrupt")?;
                abort(orchestrator, id, format!("held at {stage}, aborted by operator")).await?;
            }
            HoldAction::Retry | HoldAction::Abort => {
                abort(orchestrator, id, format!("held at {stage}")).await?;
            }
        }
    }
}

async fn abort(orchestrator: &Orchestrator, id: RunId, reason: impl Into<String>) -> Result<()> {
    match orchestrator.abort(id, reason).await {
        // Archived in the meantime.
        Ok(_) | Err(RuoError::InvalidTransition { .. }) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn report(run: &UpgradeRun) -> Result<()> {
    info!(
        run_id = %run.id,
        direction = %run.policy.direction,
        state = %run.state,
        tasks = run.tasks.len(),
        failed_tasks = run.failed_tasks().len(),
        "Run finished"
    );
    print!("{}", serde_yaml::to_string(&UpgradeResource::from_run(run))?);
    Ok(())
}
