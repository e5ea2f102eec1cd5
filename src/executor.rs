//! Task executor.
//!
//! Runs the commands of one stage: one worker per host, tasks on a host run
//! strictly one after another, and at most `max_concurrent_hosts` hosts are
//! worked on at once. Workers report progress as [`TaskEvent`]s and never
//! touch the run aggregate themselves.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, Semaphore, mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::agent::{AgentSupervisors, AgentTransport, TaskCommand};
use crate::error::RuoError;
use crate::run::{TaskEvent, TaskOutcome};

/// Dispatch settings.
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// Automatic re-dispatches after a failed attempt. 0 disables them.
    pub max_task_retries: u32,
    pub task_timeout: Duration,
    pub max_concurrent_hosts: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_task_retries: 0,
            task_timeout: Duration::from_secs(600),
            max_concurrent_hosts: 8,
        }
    }
}

/// One lock per host, shared by every executor of an orchestrator.
///
/// A host worker holds its host's lock for its whole queue, so commands of
/// different runs never reach the same agent at once. A worker of an aborted
/// run keeps the lock until its in-flight command returns.
#[derive(Default)]
pub struct HostLocks {
    hosts: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl HostLocks {
    fn get(&self, host: &str) -> Arc<AsyncMutex<()>> {
        self.hosts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(host.to_string())
            .or_default()
            .clone()
    }
}

/// Dispatches stage commands to host agents.
pub struct TaskExecutor {
    transport: Arc<dyn AgentTransport>,
    supervisors: Arc<AgentSupervisors>,
    config: ExecutorConfig,
    host_slots: Arc<Semaphore>,
    host_locks: Arc<HostLocks>,
}

impl TaskExecutor {
    pub fn new(
        transport: Arc<dyn AgentTransport>,
        supervisors: Arc<AgentSupervisors>,
        config: ExecutorConfig,
    ) -> Self {
        let host_slots = Arc::new(Semaphore::new(config.max_concurrent_hosts.max(1)));
        Self {
            transport,
            supervisors,
            config,
            host_slots,
            host_locks: Arc::default(),
        }
    }

    /// Share host locks with the executors of other runs.
    #[must_use]
    pub fn with_host_locks(mut self, host_locks: Arc<HostLocks>) -> Self {
        self.host_locks = host_locks;
        self
    }

    /// Start workers for `commands` and return immediately.
    ///
    /// Events are sent on `events`. Once `cancel` flips to true no further
    /// task is started; a task already sent to its agent runs to completion or
    /// timeout.
    pub fn dispatch(
        &self,
        commands: Vec<TaskCommand>,
        events: mpsc::Sender<TaskEvent>,
        cancel: watch::Receiver<bool>,
    ) {
        let mut by_host: BTreeMap<String, Vec<TaskCommand>> = BTreeMap::new();
        for command in commands {
            by_host.entry(command.host.clone()).or_default().push(command);
        }

        for (host, queue) in by_host {
            let host_lock = self.host_locks.get(&host);
            let worker = HostWorker {
                host,
                queue,
                transport: self.transport.clone(),
                supervisors: self.supervisors.clone(),
                config: self.config.clone(),
                events: events.clone(),
                cancel: cancel.clone(),
            };
            let slots = self.host_slots.clone();
            tokio::spawn(async move {
                let _host = host_lock.lock_owned().await;
                let Ok(_permit) = slots.acquire_owned().await else {
                    return;
                };
                worker.run().await;
            });
        }
    }

    /// Stop handing out host slots. Workers waiting for a slot exit.
    pub fn shutdown(&self) {
        self.host_slots.close();
    }
}

struct HostWorker {
    host: String,
    queue: Vec<TaskCommand>,
    transport: Arc<dyn AgentTransport>,
    supervisors: Arc<AgentSupervisors>,
    config: ExecutorConfig,
    events: mpsc::Sender<TaskEvent>,
    cancel: watch::Receiver<bool>,
}

impl HostWorker {
    fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    async fn run(self) {
        debug!(host = %self.host, tasks = self.queue.len(), "Host worker started");
        for command in &self.queue {
            if self.cancelled() {
                debug!(host = %self.host, task_id = command.task_id, "Dispatch cancelled");
                return;
            }
            let outcome = self.execute(command).await;
            let event = TaskEvent::Finished {
                task_id: command.task_id,
                outcome,
            };
            if self.events.send(event).await.is_err() {
                return;
            }
        }
    }

    async fn execute(&self, command: &TaskCommand) -> TaskOutcome {
        if let Err(e) = self.supervisors.ensure_reachable(&self.host).await {
            warn!(
                host = %self.host,
                task_id = command.task_id,
                error = %e,
                "Skipping dispatch to unreachable host"
            );
            return TaskOutcome::failed(e, 0);
        }

        let mut retries = 0;
        loop {
            let attempt = command.attempt + retries;
            let started = TaskEvent::Started {
                task_id: command.task_id,
                attempt,
            };
            if self.events.send(started).await.is_err() {
                return TaskOutcome::failed(RuoError::Fatal("run driver is gone".into()), retries);
            }

            let attempt_command = TaskCommand {
                attempt,
                ..command.clone()
            };
            let error = match timeout(
                self.config.task_timeout,
                self.transport.execute(&self.host, &attempt_command),
            )
            .await
            {
                Ok(Ok(())) => return TaskOutcome::completed(retries),
                Ok(Err(e)) => e,
                Err(_) => RuoError::TaskTimeout(
                    self.host.clone(),
                    self.config.task_timeout.as_secs(),
                ),
            };

            if !error.is_retryable() || retries >= self.config.max_task_retries || self.cancelled()
            {
                return TaskOutcome::failed(error, retries);
            }

            retries += 1;
            info!(
                host = %self.host,
                task_id = command.task_id,
                retry = retries,
                max_retries = self.config.max_task_retries,
                error = %error,
                "Task attempt failed, re-dispatching"
            );
        }
    }
}
