//! Agent process runtime.
//!
//! Wires the connection, resource monitor and task queue together,
//! dispatches inbound envelopes and decides how the process exits. The
//! exit code is the contract with the external supervisor: `0` means stay
//! down, [`RESTART_EXIT_CODE`] means relaunch.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use crate::agent::connection::{ConnectionEvent, ConnectionManager, ConnectionState, EnvelopeSink};
use crate::agent::executor::{ProcessExecutor, SharedEnv};
use crate::agent::queue::TaskQueueProcessor;
use crate::agent::resources::{SystemSampler, ResourceAction, ResourceEvent, ResourceMonitor};
use crate::config::AgentConfig;
use crate::protocol::payloads::{
    AgentStatus, AgentStatusReport, CancelInitiator, DeployRequest, DeployResult,
    EnvUpdateRequest, EnvUpdateResult, PathValidateRequest, PathValidateResult, SystemCommand,
    TaskAck, TaskCancel, TaskCancelled, TaskSubmit,
};
use crate::protocol::{Envelope, EnvelopeType};

/// Exit code asking the supervisor for a restart (EX_TEMPFAIL).
pub const RESTART_EXIT_CODE: i32 = 75;

/// How the agent process should end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Clean,
    Restart,
}

impl ExitReason {
    pub fn exit_code(&self) -> i32 {
        match self {
            ExitReason::Clean => 0,
            ExitReason::Restart => RESTART_EXIT_CODE,
        }
    }
}

/// A decision to stop, with the reason recorded on cancelled tasks.
#[derive(Debug, Clone, PartialEq)]
struct Stop {
    exit: ExitReason,
    reason: String,
    initiator: CancelInitiator,
}

/// Handles envelopes from the coordinator.
struct InboundHandler {
    sink: Arc<dyn EnvelopeSink>,
    queue: Arc<TaskQueueProcessor>,
    env: SharedEnv,
}

impl InboundHandler {
    async fn handle(&self, envelope: Envelope) -> Option<Stop> {
        match envelope.kind() {
            EnvelopeType::TaskSubmit => self.on_submit(&envelope),
            EnvelopeType::TaskCancel => self.on_cancel(&envelope),
            EnvelopeType::PathValidateRequest => self.on_path_validate(&envelope).await,
            EnvelopeType::EnvUpdateRequest => self.on_env_update(&envelope).await,
            EnvelopeType::DeployRequest => self.on_deploy(&envelope),
            EnvelopeType::SystemShutdown | EnvelopeType::SystemRestart => {
                let command: SystemCommand = envelope.payload_as().unwrap_or_default();
                let requested = command
                    .reason
                    .unwrap_or_else(|| "requested by coordinator".to_string());
                let exit = if envelope.kind() == EnvelopeType::SystemRestart {
                    ExitReason::Restart
                } else {
                    ExitReason::Clean
                };
                tracing::info!("{} received: {}", envelope.kind(), requested);
                return Some(Stop {
                    exit,
                    reason: format!("agent stopping: {}", requested),
                    initiator: CancelInitiator::Shutdown,
                });
            }
            other => {
                tracing::debug!(kind = %other, "Ignoring envelope not meant for agents");
            }
        }
        None
    }

    fn on_submit(&self, envelope: &Envelope) {
        match envelope.payload_as::<TaskSubmit>() {
            Ok(spec) => {
                // Rejections are already reported to the coordinator.
                let _ = self.queue.submit(spec);
            }
            Err(e) => {
                tracing::warn!("Malformed task submission: {}", e);
                if let Some(task_id) = envelope.task_id() {
                    self.reply(Envelope::with_payload(
                        EnvelopeType::TaskAck,
                        &TaskAck {
                            task_id: task_id.to_string(),
                            accepted: false,
                            reason: Some(e.to_string()),
                        },
                    ));
                }
            }
        }
    }

    fn on_cancel(&self, envelope: &Envelope) {
        let cancel: TaskCancel = match envelope.payload_as() {
            Ok(cancel) => cancel,
            Err(e) => {
                tracing::warn!("Malformed cancel request: {}", e);
                return;
            }
        };
        let reason = cancel
            .reason
            .unwrap_or_else(|| "cancelled by user".to_string());

        if !self
            .queue
            .cancel_with(&cancel.task_id, &reason, CancelInitiator::User)
        {
            // Not running here; settle the coordinator's record anyway.
            tracing::debug!(task_id = %cancel.task_id, "Cancel for inactive task");
            self.reply(Envelope::with_payload(
                EnvelopeType::TaskCancelled,
                &TaskCancelled {
                    task_id: cancel.task_id,
                    reason: format!("{} (task was not active on agent)", reason),
                    initiator: CancelInitiator::User,
                },
            ));
        }
    }

    async fn on_path_validate(&self, envelope: &Envelope) {
        let request: PathValidateRequest = match envelope.payload_as() {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Malformed path validation request: {}", e);
                return;
            }
        };

        let mut result = PathValidateResult {
            request_id: request.request_id,
            path: request.path.clone(),
            exists: false,
            is_directory: false,
            error: None,
        };
        match tokio::fs::metadata(PathBuf::from(&request.path)).await {
            Ok(metadata) => {
                result.exists = true;
                result.is_directory = metadata.is_dir();
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => result.error = Some(e.to_string()),
        }
        self.reply(Envelope::with_payload(
            EnvelopeType::PathValidateResult,
            &result,
        ));
    }

    async fn on_env_update(&self, envelope: &Envelope) {
        let request: EnvUpdateRequest = match envelope.payload_as() {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Malformed env update: {}", e);
                return;
            }
        };

        let invalid = request
            .set
            .keys()
            .chain(request.remove.iter())
            .find(|key| !valid_env_key(key))
            .cloned();

        let result = match invalid {
            Some(key) => EnvUpdateResult {
                request_id: request.request_id,
                success: false,
                applied: Vec::new(),
                error: Some(format!("invalid variable name '{}'", key)),
            },
            None => {
                let mut env = self.env.write().await;
                let mut applied: Vec<String> = Vec::new();
                for (key, value) in request.set {
                    env.insert(key.clone(), value);
                    applied.push(key);
                }
                for key in request.remove {
                    if env.remove(&key).is_some() {
                        applied.push(key);
                    }
                }
                applied.sort();
                tracing::info!(count = applied.len(), "Applied environment update");
                EnvUpdateResult {
                    request_id: request.request_id,
                    success: true,
                    applied,
                    error: None,
                }
            }
        };
        self.reply(Envelope::with_payload(EnvelopeType::EnvUpdateResult, &result));
    }

    fn on_deploy(&self, envelope: &Envelope) {
        let request: DeployRequest = match envelope.payload_as() {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("Malformed deploy request: {}", e);
                return;
            }
        };
        tracing::warn!(deploy_id = %request.deploy_id, project_id = %request.project_id, "Deploy requested but not supported");
        self.reply(Envelope::with_payload(
            EnvelopeType::DeployResult,
            &DeployResult {
                deploy_id: request.deploy_id,
                success: false,
                error: Some("deployments are not supported by this agent".to_string()),
            },
        ));
    }

    fn reply(&self, envelope: Envelope) {
        let kind = envelope.kind();
        if !self.sink.send(envelope) {
            tracing::warn!(kind = %kind, "Reply dropped, not connected");
        }
    }
}

fn valid_env_key(key: &str) -> bool {
    !key.is_empty() && !key.contains('=') && !key.contains('\0')
}

/// What the runtime does about a resource event.
fn resource_reaction(queue: &TaskQueueProcessor, event: &ResourceEvent) -> Option<Stop> {
    match event.action {
        ResourceAction::None | ResourceAction::RejectNewTasks => None,
        ResourceAction::CancelLowestPriority => {
            if queue.cancel_lowest_priority_task(&event.cause).is_none() {
                tracing::debug!("Resource pressure but no task to cancel");
            }
            None
        }
        ResourceAction::GracefulShutdown => {
            tracing::error!("Critical resource pressure, restarting: {}", event.cause);
            Some(Stop {
                exit: ExitReason::Restart,
                reason: format!("agent restarting due to resource pressure: {}", event.cause),
                initiator: CancelInitiator::Resource,
            })
        }
    }
}

fn status_report(queue: &TaskQueueProcessor, monitor: &ResourceMonitor) -> Envelope {
    let active_task_ids: Vec<String> = queue
        .get_active_tasks()
        .into_iter()
        .map(|task| task.task_id)
        .collect();
    let status = if active_task_ids.is_empty() {
        AgentStatus::Online
    } else {
        AgentStatus::Busy
    };
    Envelope::with_payload(
        EnvelopeType::AgentStatus,
        &AgentStatusReport {
            status,
            active_task_ids,
            resources: Some(monitor.report_status()),
        },
    )
}

/// The agent process.
pub struct AgentRuntime {
    connection: Arc<ConnectionManager>,
    inbound: mpsc::Receiver<Envelope>,
    queue: Arc<TaskQueueProcessor>,
    monitor: Arc<ResourceMonitor>,
    env: SharedEnv,
    status_interval: Duration,
    drain_timeout: Duration,
}

impl AgentRuntime {
    pub fn new(
        connection: Arc<ConnectionManager>,
        inbound: mpsc::Receiver<Envelope>,
        queue: Arc<TaskQueueProcessor>,
        monitor: Arc<ResourceMonitor>,
        env: SharedEnv,
    ) -> Self {
        Self {
            connection,
            inbound,
            queue,
            monitor,
            env,
            status_interval: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(10),
        }
    }

    /// Build every component from configuration.
    pub fn from_config(config: &AgentConfig) -> Self {
        let (connection, inbound) = ConnectionManager::new(config.connection_config());
        let monitor = Arc::new(ResourceMonitor::new(
            Arc::new(SystemSampler::new()),
            config.thresholds,
            config.resource_sample_interval,
        ));
        let env = SharedEnv::default();
        let mut executor = ProcessExecutor::new(config.executor_program.clone())
            .with_args(config.executor_args.clone())
            .with_timeout(config.task_timeout)
            .with_env(env.clone());
        if let Some(dir) = &config.executor_workdir {
            executor = executor.with_working_dir(dir.clone());
        }
        let queue = Arc::new(TaskQueueProcessor::new(
            config.max_concurrent_tasks,
            monitor.clone(),
            connection.clone(),
            Arc::new(executor),
        ));
        Self::new(connection, inbound, queue, monitor, env)
            .with_status_interval(config.status_interval)
    }

    pub fn with_status_interval(mut self, interval: Duration) -> Self {
        self.status_interval = interval;
        self
    }

    /// How long shutdown waits for cancelled tasks to report.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn queue(&self) -> &Arc<TaskQueueProcessor> {
        &self.queue
    }

    /// Run until a stop is requested. Returns the exit decision.
    pub async fn run(mut self) -> ExitReason {
        let handler = InboundHandler {
            sink: self.connection.clone(),
            queue: self.queue.clone(),
            env: self.env.clone(),
        };
        let mut resource_events = self.monitor.subscribe();
        let mut connection_events = self.connection.subscribe();

        let background = tokio_util::sync::CancellationToken::new();
        let monitor_task = self.monitor.start_monitoring(background.clone());
        let supervisor = self.connection.start();
        let mut status_tick = tokio::time::interval(self.status_interval);
        status_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(agent_id = %self.connection.agent_id(), "Agent runtime started");

        let stop = loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupt received");
                    break Stop {
                        exit: ExitReason::Clean,
                        reason: "agent stopping: interrupted".to_string(),
                        initiator: CancelInitiator::Shutdown,
                    };
                }
                envelope = self.inbound.recv() => match envelope {
                    Some(envelope) => {
                        if let Some(stop) = handler.handle(envelope).await {
                            break stop;
                        }
                    }
                    None => break Stop {
                        exit: ExitReason::Restart,
                        reason: "agent restarting: connection manager stopped".to_string(),
                        initiator: CancelInitiator::Shutdown,
                    },
                },
                event = resource_events.recv() => match event {
                    Ok(event) => {
                        let reaction = resource_reaction(&self.queue, &event);
                        self.send_status();
                        if let Some(stop) = reaction {
                            break stop;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Resource events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                },
                event = connection_events.recv() => {
                    if let Ok(ConnectionEvent::StateChanged(ConnectionState::Online)) = event {
                        self.send_status();
                    }
                }
                _ = status_tick.tick() => self.send_status(),
            }
        };

        self.shutdown(&stop).await;
        background.cancel();
        let _ = monitor_task.await;
        let _ = tokio::time::timeout(Duration::from_secs(5), supervisor).await;
        tracing::info!(exit_code = stop.exit.exit_code(), "Agent runtime stopped");
        stop.exit
    }

    fn send_status(&self) {
        if self.connection.is_connected() {
            self.connection.send(status_report(&self.queue, &self.monitor));
        }
    }

    async fn shutdown(&self, stop: &Stop) {
        let cancelled = self.queue.cancel_all(&stop.reason, stop.initiator);
        if !cancelled.is_empty() {
            tracing::info!(count = cancelled.len(), "Cancelling active tasks before exit");
            if !self.queue.wait_until_idle(self.drain_timeout).await {
                tracing::warn!("Tasks did not finish within {:?}", self.drain_timeout);
            }
        }
        self.connection.close();
    }
}
