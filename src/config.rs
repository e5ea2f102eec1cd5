use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use secrecy::SecretString;

use crate::agent::ProbeConfig;
use crate::executor::ExecutorConfig;
use crate::notify::NotificationConfig;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = env!("BUILD_COMMIT");
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Engine tuning shared by every run an orchestrator creates.
#[derive(Clone, Debug, Default)]
pub struct EngineConfig {
    pub executor: ExecutorConfig,
    pub probe: ProbeConfig,
    pub notification: NotificationConfig,
}

/// Rolling upgrade orchestrator.
///
/// Plans a staged rollout of a cluster topology and drives it through the
/// agent running on each host.
#[derive(Parser, Debug, Clone)]
#[command(name = "ruo")]
#[command(about = "Rolling upgrade and downgrade orchestrator for multi-host service clusters")]
#[command(version = const_format::formatcp!(
    "{} (commit: {}, build date: {})",
    VERSION, COMMIT, BUILD_DATE
))]
pub struct Config {
    #[command(subcommand)]
    pub command: Command,

    /// Automatic re-dispatches of a failed task before it stays FAILED
    #[arg(long, global = true, env = "RUO_MAX_TASK_RETRIES", default_value = "0")]
    pub max_task_retries: u32,

    /// Per-task timeout in seconds
    #[arg(long, global = true, env = "RUO_TASK_TIMEOUT_SECONDS", default_value = "600")]
    pub task_timeout_seconds: u64,

    /// Hosts receiving commands at the same time
    #[arg(long, global = true, env = "RUO_MAX_CONCURRENT_HOSTS", default_value = "8")]
    pub max_concurrent_hosts: usize,

    /// Background liveness probe interval in seconds
    #[arg(long, global = true, env = "RUO_PING_INTERVAL_SECONDS", default_value = "30")]
    pub ping_interval_seconds: u64,

    /// Liveness probe timeout in seconds
    #[arg(long, global = true, env = "RUO_PING_TIMEOUT_SECONDS", default_value = "5")]
    pub ping_timeout_seconds: u64,

    /// Consecutive missed pings before a host is marked unreachable
    #[arg(long, global = true, env = "RUO_PING_FAILURE_THRESHOLD", default_value = "3")]
    pub ping_failure_threshold: u32,

    /// Port the host agents listen on
    #[arg(long, global = true, env = "RUO_AGENT_PORT", default_value = "8670")]
    pub agent_port: u16,

    /// Scheme used to reach the host agents: http or https
    #[arg(long, global = true, env = "RUO_AGENT_SCHEME", default_value = "http")]
    pub agent_scheme: String,

    /// Username sent with liveness probes
    #[arg(long, global = true, env = "RUO_USERNAME", default_value = "ruo")]
    pub username: String,

    /// Instance name sent with liveness probes
    #[arg(long, global = true, env = "RUO_INSTANCE_NAME", default_value = "ruo")]
    pub instance_name: String,

    /// Slack Incoming Webhook URL for run notifications
    #[arg(long, global = true, env = "RUO_SLACK_WEBHOOK_URL", hide_env_values = true)]
    pub slack_webhook_url: Option<String>,

    /// Send notifications for upgrade runs
    #[arg(long, global = true, env = "RUO_NOTIFY_ON_UPGRADE", default_value = "true", action = clap::ArgAction::Set)]
    pub notify_on_upgrade: bool,

    /// Send notifications for downgrade runs
    #[arg(long, global = true, env = "RUO_NOTIFY_ON_DOWNGRADE", default_value = "true", action = clap::ArgAction::Set)]
    pub notify_on_downgrade: bool,

    /// Port for /healthz and /readyz
    #[arg(long, global = true, env = "RUO_HEALTH_PORT", default_value = "8080")]
    pub health_port: u16,

    /// Port for /metrics
    #[arg(long, global = true, env = "RUO_METRICS_PORT", default_value = "8081")]
    pub metrics_port: u16,

    /// Log format: json or pretty
    #[arg(long, global = true, env = "RUO_LOG_FORMAT", default_value = "json")]
    pub log_format: String,

    /// Log level
    #[arg(long, global = true, env = "RUO_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Build the plan for a topology and print it without contacting agents
    Plan {
        /// Topology file (YAML)
        #[arg(long, env = "RUO_TOPOLOGY")]
        topology: PathBuf,

        /// Plan the downgrade from the target version back to the source version
        #[arg(long)]
        downgrade: bool,

        /// Leave out every check task
        #[arg(long)]
        skip_service_checks: bool,
    },

    /// Run an upgrade against the agents of a topology
    Apply {
        /// Topology file (YAML)
        #[arg(long, env = "RUO_TOPOLOGY")]
        topology: PathBuf,

        /// Leave out every check task
        #[arg(long)]
        skip_service_checks: bool,

        /// What to do when the run stops in HOLDING
        #[arg(long, value_enum, env = "RUO_ON_HOLD", default_value = "wait")]
        on_hold: HoldAction,

        /// Retries of a HOLDING run before it is aborted (with --on-hold retry)
        #[arg(long, env = "RUO_MAX_RUN_RETRIES", default_value = "3")]
        max_run_retries: u32,

        /// Run the compensating downgrade after the upgrade is aborted
        #[arg(long)]
        downgrade_on_abort: bool,
    },

    /// Print the JSON schema of the Upgrade resource
    Schema,
}

/// Caller policy for a run that enters HOLDING.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldAction {
    /// Keep the run HOLDING until interrupted, then abort it
    Wait,
    /// Retry the failed tasks, up to --max-run-retries times
    Retry,
    /// Abort the run
    Abort,
}

impl Config {
    pub fn from_args() -> Self {
        Self::parse()
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            executor: ExecutorConfig {
                max_task_retries: self.max_task_retries,
                task_timeout: Duration::from_secs(self.task_timeout_seconds),
                max_concurrent_hosts: self.max_concurrent_hosts,
            },
            probe: ProbeConfig {
                username: self.username.clone(),
                instance_name: self.instance_name.clone(),
                interval: Duration::from_secs(self.ping_interval_seconds),
                timeout: Duration::from_secs(self.ping_timeout_seconds),
                failure_threshold: self.ping_failure_threshold,
            },
            notification: NotificationConfig {
                on_upgrade: self.notify_on_upgrade,
                on_downgrade: self.notify_on_downgrade,
            },
        }
    }

    /// Webhook URL, if one is configured and non-empty.
    pub fn slack_webhook(&self) -> Option<SecretString> {
        self.slack_webhook_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .map(|url| SecretString::from(url.to_string()))
    }

    pub fn display(&self) {
        tracing::info!(
            max_task_retries = self.max_task_retries,
            task_timeout_seconds = self.task_timeout_seconds,
            max_concurrent_hosts = self.max_concurrent_hosts,
            ping_interval_seconds = self.ping_interval_seconds,
            ping_timeout_seconds = self.ping_timeout_seconds,
            ping_failure_threshold = self.ping_failure_threshold,
            agent = %format!("{}://<host>:{}", self.agent_scheme, self.agent_port),
            slack = self.slack_webhook().is_some(),
            health_port = self.health_port,
            metrics_port = self.metrics_port,
            log_format = %self.log_format,
            log_level = %self.log_level,
            "Configuration initialized"
        );

        if self.max_task_retries > 0 {
            tracing::warn!(
                max_task_retries = self.max_task_retries,
                "Failed tasks are re-dispatched automatically before the run holds"
            );
        }
    }
}
