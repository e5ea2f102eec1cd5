//! Per-host agent supervision.
//!
//! Each host gets one supervising task that owns its [`AgentSession`]. The
//! task probes on a fixed interval and answers on-demand probe and snapshot
//! requests over an mpsc channel, so session state is never shared.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior, interval_at, timeout};
use tracing::{debug, info, warn};

use crate::agent::probe::PingRequest;
use crate::agent::transport::AgentTransport;
use crate::error::RuoError;

const COMMAND_BUFFER: usize = 16;

/// Liveness probing settings shared by all supervisors.
#[derive(Clone, Debug)]
pub struct ProbeConfig {
    pub username: String,
    pub instance_name: String,
    pub interval: Duration,
    pub timeout: Duration,
    /// Consecutive missed pings before a host is marked unreachable.
    pub failure_threshold: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            username: "ruo".to_string(),
            instance_name: "ruo".to_string(),
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            failure_threshold: 3,
        }
    }
}

/// Liveness record for one host.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentSession {
    pub host: String,
    pub last_contact: Option<DateTime<Utc>>,
    pub outstanding_ping: bool,
    pub consecutive_failures: u32,
    pub unreachable: bool,
}

impl AgentSession {
    fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            last_contact: None,
            outstanding_ping: false,
            consecutive_failures: 0,
            unreachable: false,
        }
    }

    /// No contact yet, or the last contact is older than `max_age`.
    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.last_contact.is_none_or(|at| {
            let age = Utc::now().signed_duration_since(at);
            age.to_std().unwrap_or_default() > max_age
        })
    }

    fn record_success(&mut self, contacted_at: DateTime<Utc>) {
        if self.unreachable {
            info!(host = %self.host, "Host reachable again");
        }
        self.last_contact = Some(contacted_at);
        self.consecutive_failures = 0;
        self.unreachable = false;
    }

    fn record_failure(&mut self, threshold: u32) {
        self.consecutive_failures += 1;
        if !self.unreachable && self.consecutive_failures >= threshold {
            warn!(
                host = %self.host,
                failures = self.consecutive_failures,
                "Host marked unreachable"
            );
            self.unreachable = true;
        }
    }
}

enum SupervisorCommand {
    Probe { reply: oneshot::Sender<AgentSession> },
    Session { reply: oneshot::Sender<AgentSession> },
    Shutdown,
}

#[derive(Clone)]
struct SupervisorHandle {
    host: String,
    commands: mpsc::Sender<SupervisorCommand>,
}

impl SupervisorHandle {
    fn spawn(host: &str, transport: Arc<dyn AgentTransport>, config: Arc<ProbeConfig>) -> Self {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let supervisor = Supervisor {
            session: AgentSession::new(host),
            transport,
            config,
        };
        tokio::spawn(supervisor.run(rx));
        Self {
            host: host.to_string(),
            commands: tx,
        }
    }

    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<AgentSession>) -> SupervisorCommand,
    ) -> Result<AgentSession, RuoError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| RuoError::Fatal(format!("supervisor for {} is gone", self.host)))?;
        rx.await
            .map_err(|_| RuoError::Fatal(format!("supervisor for {} dropped a reply", self.host)))
    }
}

struct Supervisor {
    session: AgentSession,
    transport: Arc<dyn AgentTransport>,
    config: Arc<ProbeConfig>,
}

impl Supervisor {
    async fn run(mut self, mut commands: mpsc::Receiver<SupervisorCommand>) {
        let mut ticker = interval_at(Instant::now() + self.config.interval, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(host = %self.session.host, "Agent supervisor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.probe(false).await,
                command = commands.recv() => match command {
                    Some(SupervisorCommand::Probe { reply }) => {
                        self.probe(true).await;
                        let _ = reply.send(self.session.clone());
                    }
                    Some(SupervisorCommand::Session { reply }) => {
                        let _ = reply.send(self.session.clone());
                    }
                    Some(SupervisorCommand::Shutdown) | None => break,
                },
            }
        }
        debug!(host = %self.session.host, "Agent supervisor stopped");
    }

    async fn probe(&mut self, immediate: bool) {
        let request = PingRequest::new(
            &self.config.username,
            &self.config.instance_name,
            immediate,
        );
        let host = self.session.host.clone();

        self.session.outstanding_ping = true;
        let result = timeout(self.config.timeout, self.transport.ping(&host, &request)).await;
        self.session.outstanding_ping = false;

        match result {
            Ok(Ok(reply)) => {
                debug!(host = %host, immediate, "Ping succeeded");
                self.session.record_success(reply.contacted_at);
            }
            Ok(Err(e)) => {
                warn!(host = %host, immediate, error = %e, "Ping failed");
                self.session.record_failure(self.config.failure_threshold);
            }
            Err(_) => {
                warn!(
                    host = %host,
                    immediate,
                    timeout_secs = self.config.timeout.as_secs(),
                    "Ping timed out"
                );
                self.session.record_failure(self.config.failure_threshold);
            }
        }
    }
}

/// Registry of per-host supervisors for one run.
///
/// Supervisors are spawned on first contact with a host and stopped by
/// [`AgentSupervisors::shutdown`].
pub struct AgentSupervisors {
    transport: Arc<dyn AgentTransport>,
    config: Arc<ProbeConfig>,
    handles: Mutex<Option<HashMap<String, SupervisorHandle>>>,
}

impl AgentSupervisors {
    pub fn new(transport: Arc<dyn AgentTransport>, config: ProbeConfig) -> Self {
        Self {
            transport,
            config: Arc::new(config),
            handles: Mutex::new(Some(HashMap::new())),
        }
    }

    fn handle(&self, host: &str) -> Result<SupervisorHandle, RuoError> {
        let mut guard = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(handles) = guard.as_mut() else {
            return Err(RuoError::Fatal("agent supervisors are shut down".to_string()));
        };
        let handle = handles.entry(host.to_string()).or_insert_with(|| {
            SupervisorHandle::spawn(host, self.transport.clone(), self.config.clone())
        });
        Ok(handle.clone())
    }

    /// Current session snapshot for `host`, starting its supervisor if needed.
    pub async fn session(&self, host: &str) -> Result<AgentSession, RuoError> {
        let handle = self.handle(host)?;
        handle
            .request(|reply| SupervisorCommand::Session { reply })
            .await
    }

    /// Force a synchronous probe of `host`.
    pub async fn probe(&self, host: &str) -> Result<AgentSession, RuoError> {
        let handle = self.handle(host)?;
        handle.request(|reply| SupervisorCommand::Probe { reply }).await
    }

    /// Gate dispatch to `host`.
    ///
    /// Probes immediately when the session is stale or unreachable and fails
    /// with [`RuoError::HostUnreachable`] only if the host is still marked
    /// unreachable afterwards.
    pub async fn ensure_reachable(&self, host: &str) -> Result<AgentSession, RuoError> {
        let mut session = self.session(host).await?;
        if session.unreachable || session.is_stale(self.config.interval) {
            session = self.probe(host).await?;
        }
        if session.unreachable {
            return Err(RuoError::HostUnreachable(
                host.to_string(),
                session.consecutive_failures,
            ));
        }
        Ok(session)
    }

    /// Stop every supervisor. Later calls fail with [`RuoError::Fatal`].
    pub fn shutdown(&self) {
        let handles = self
            .handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        for (host, handle) in handles.into_iter().flatten() {
            debug!(host = %host, "Stopping agent supervisor");
            let _ = handle.commands.try_send(SupervisorCommand::Shutdown);
        }
    }
}

impl Drop for AgentSupervisors {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::probe::PingReply;
    use crate::agent::transport::TaskCommand;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Answers pings while `up` is set and counts every ping it sees.
    struct FlakyAgent {
        up: AtomicBool,
        pings: AtomicU32,
        immediate_pings: AtomicU32,
    }

    impl FlakyAgent {
        fn new(up: bool) -> Arc<Self> {
            Arc::new(Self {
                up: AtomicBool::new(up),
                pings: AtomicU32::new(0),
                immediate_pings: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl AgentTransport for FlakyAgent {
        async fn ping(&self, host: &str, request: &PingRequest) -> Result<PingReply, RuoError> {
            self.pings.fetch_add(1, Ordering::SeqCst);
            if request.immediate {
                self.immediate_pings.fetch_add(1, Ordering::SeqCst);
            }
            if self.up.load(Ordering::SeqCst) {
                Ok(PingReply::now())
            } else {
                Err(RuoError::Transport(host.to_string(), "connection refused".into()))
            }
        }

        async fn execute(&self, _host: &str, _command: &TaskCommand) -> Result<(), RuoError> {
            Ok(())
        }
    }

    fn config(threshold: u32) -> ProbeConfig {
        ProbeConfig {
            interval: Duration::from_secs(3600),
            timeout: Duration::from_millis(200),
            failure_threshold: threshold,
            ..ProbeConfig::default()
        }
    }

    #[test]
    fn test_session_failure_threshold() {
        let mut session = AgentSession::new("host1");
        assert!(session.is_stale(Duration::from_secs(30)));

        session.record_failure(2);
        assert!(!session.unreachable);
        session.record_failure(2);
        assert!(session.unreachable);
        assert_eq!(session.consecutive_failures, 2);

        session.record_success(Utc::now());
        assert!(!session.unreachable);
        assert_eq!(session.consecutive_failures, 0);
        assert!(!session.is_stale(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn test_first_contact_probes_immediately() {
        let agent = FlakyAgent::new(true);
        let supervisors = AgentSupervisors::new(agent.clone(), config(3));

        let session = supervisors.ensure_reachable("host1").await.unwrap();
        assert!(session.last_contact.is_some());
        assert_eq!(agent.immediate_pings.load(Ordering::SeqCst), 1);

        // Fresh session, no second probe.
        supervisors.ensure_reachable("host1").await.unwrap();
        assert_eq!(agent.pings.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unreachable_after_threshold_then_recovers() {
        let agent = FlakyAgent::new(false);
        let supervisors = AgentSupervisors::new(agent.clone(), config(2));

        // One miss is below the threshold and does not block dispatch.
        let session = supervisors.ensure_reachable("host2").await.unwrap();
        assert_eq!(session.consecutive_failures, 1);

        let err = supervisors.ensure_reachable("host2").await.unwrap_err();
        assert_eq!(err, RuoError::HostUnreachable("host2".into(), 2));

        agent.up.store(true, Ordering::SeqCst);
        let session = supervisors.ensure_reachable("host2").await.unwrap();
        assert!(!session.unreachable);
        assert_eq!(session.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_periodic_probe_is_not_immediate() {
        let agent = FlakyAgent::new(true);
        let supervisors = AgentSupervisors::new(
            agent.clone(),
            ProbeConfig {
                interval: Duration::from_millis(20),
                ..config(3)
            },
        );
        supervisors.session("host1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert!(agent.pings.load(Ordering::SeqCst) >= 2);
        assert_eq!(agent.immediate_pings.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_sessions() {
        let supervisors = AgentSupervisors::new(FlakyAgent::new(true), config(3));
        supervisors.ensure_reachable("host1").await.unwrap();
        supervisors.shutdown();
        assert!(matches!(
            supervisors.session("host1").await,
            Err(RuoError::Fatal(_))
        ));
    }
}
