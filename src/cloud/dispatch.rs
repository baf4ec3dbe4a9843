//! Cloud-side task submission, cancellation and control traffic.
//!
//! Task commands go straight to a connected agent. Control traffic for an
//! offline agent (cancellations, restarts) is parked in the
//! [`OfflineMailbox`] and redelivered when the agent authenticates again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::cloud::health::HealthTracker;
use crate::cloud::mailbox::OfflineMailbox;
use crate::cloud::notify::{TaskNotification, TaskNotifier};
use crate::cloud::registry::AgentRegistry;
use crate::cloud::router::MessageRouter;
use crate::db::Database;
use crate::error::{DatabaseError, DispatchError};
use crate::protocol::payloads::{
    DeployRequest, DeployResult, EnvUpdateRequest, EnvUpdateResult, PathValidateRequest,
    PathValidateResult, SystemCommand, TaskCancel, TaskSubmit,
};
use crate::protocol::{Envelope, EnvelopeType};
use crate::task::{NewTask, Task, TaskStatus};

/// How a message reached (or will reach) an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    Sent,
    Queued,
}

pub struct Dispatcher {
    db: Arc<dyn Database>,
    registry: Arc<AgentRegistry>,
    health: Arc<HealthTracker>,
    mailbox: OfflineMailbox,
    router: Arc<MessageRouter>,
    notifier: Arc<dyn TaskNotifier>,
}

impl Dispatcher {
    pub fn new(
        db: Arc<dyn Database>,
        registry: Arc<AgentRegistry>,
        health: Arc<HealthTracker>,
        mailbox: OfflineMailbox,
        router: Arc<MessageRouter>,
        notifier: Arc<dyn TaskNotifier>,
    ) -> Self {
        Self {
            db,
            registry,
            health,
            mailbox,
            router,
            notifier,
        }
    }

    pub fn mailbox(&self) -> &OfflineMailbox {
        &self.mailbox
    }

    /// Create a task and hand it to its agent.
    ///
    /// The record is created `pending`, moves to `queued` once the submit
    /// envelope is handed to the connection, and from there is driven by
    /// the agent's envelopes. If the agent is not connected the task is
    /// failed immediately and `AgentOffline` is returned.
    pub async fn submit(&self, new: NewTask) -> Result<Task, DispatchError> {
        let task = Task::new(new);
        self.db.create_task(&task).await?;
        tracing::info!(task_id = %task.id, agent_id = %task.agent_id, "Task created");

        let envelope = Envelope::with_payload(
            EnvelopeType::TaskSubmit,
            &TaskSubmit {
                task_id: task.id.clone(),
                project_id: task.project_id.clone(),
                bot_name: task.bot_name.clone(),
                command: task.command.clone(),
                prompt: task.prompt.clone(),
                session_id: task.session_id.clone(),
                max_budget: task.max_budget,
                parent_task_id: task.parent_task_id.clone(),
                working_dir: None,
            },
        );

        if !self.registry.send(&task.agent_id, envelope).await {
            let agent_id = task.agent_id.clone();
            self.fail_offline(task).await?;
            return Err(DispatchError::AgentOffline { agent_id });
        }
        self.registry.track_task(&task.agent_id, &task.id).await;

        let mut queued = task.clone();
        if queued.transition(TaskStatus::Queued)
            && self
                .db
                .update_task_if_status(&queued, TaskStatus::Pending)
                .await?
        {
            return Ok(queued);
        }
        // The agent's ack won the race; return what is stored.
        Ok(self.db.get_task(&task.id).await?.unwrap_or(task))
    }

    async fn fail_offline(&self, mut task: Task) -> Result<(), DatabaseError> {
        tracing::warn!(task_id = %task.id, agent_id = %task.agent_id, "Agent offline, task failed");
        let expected = task.status;
        if task.transition(TaskStatus::Failed) {
            task.error_message = Some("agent offline".to_string());
            if self.db.update_task_if_status(&task, expected).await? {
                self.health.record_failure(&task.agent_id);
                self.notifier.notify(TaskNotification::Failed {
                    task_id: task.id.clone(),
                    agent_id: task.agent_id.clone(),
                    error: "agent offline".to_string(),
                    code: "agent_offline".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Ask the owning agent to cancel a task. The record changes when the
    /// agent reports `task:cancelled`.
    pub async fn cancel(&self, task_id: &str) -> Result<Delivery, DispatchError> {
        let task = self
            .db
            .get_task(task_id)
            .await?
            .ok_or_else(|| DispatchError::TaskNotFound(task_id.to_string()))?;
        if task.status.is_terminal() {
            return Err(DispatchError::AlreadyTerminal {
                task_id: task.id,
                status: task.status.to_string(),
            });
        }

        let envelope = Envelope::with_payload(
            EnvelopeType::TaskCancel,
            &TaskCancel {
                task_id: task.id.clone(),
                reason: Some("cancelled by user".to_string()),
            },
        );
        self.send_or_enqueue(&task.agent_id, envelope).await
    }

    /// Ask an agent to restart itself.
    pub async fn restart_agent(
        &self,
        agent_id: &str,
        reason: Option<String>,
    ) -> Result<Delivery, DispatchError> {
        let envelope = Envelope::with_payload(EnvelopeType::SystemRestart, &SystemCommand { reason });
        self.send_or_enqueue(agent_id, envelope).await
    }

    /// Send now if connected, otherwise park in the mailbox.
    pub async fn send_or_enqueue(
        &self,
        agent_id: &str,
        envelope: Envelope,
    ) -> Result<Delivery, DispatchError> {
        if self.registry.send(agent_id, envelope.clone()).await {
            return Ok(Delivery::Sent);
        }
        self.mailbox.enqueue_envelope(agent_id, &envelope).await?;
        Ok(Delivery::Queued)
    }

    /// Deliver everything waiting for a freshly authenticated agent.
    /// Returns how many entries were sent.
    pub async fn redeliver(&self, agent_id: &str) -> Result<usize, DatabaseError> {
        let entries = self.mailbox.drain(agent_id).await?;
        if entries.is_empty() {
            return Ok(0);
        }

        let mut sent = 0;
        let mut pending = entries.iter();
        for entry in pending.by_ref() {
            if self.registry.send(agent_id, entry.to_envelope()).await {
                sent += 1;
                continue;
            }
            // Connection is gone; put this one and the rest back.
            self.mailbox.requeue(entry).await?;
            break;
        }
        for entry in pending {
            self.mailbox.requeue(entry).await?;
        }

        tracing::info!(agent_id = %agent_id, sent, total = entries.len(), "Redelivered offline messages");
        Ok(sent)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task, DispatchError> {
        self.db
            .get_task(task_id)
            .await?
            .ok_or_else(|| DispatchError::TaskNotFound(task_id.to_string()))
    }

    pub async fn list_agent_tasks(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<Task>, DispatchError> {
        Ok(self.db.list_tasks_for_agent(agent_id, limit).await?)
    }

    /// Ask an agent whether a path exists on its host.
    pub async fn validate_path(
        &self,
        agent_id: &str,
        path: &str,
        timeout: Duration,
    ) -> Result<PathValidateResult, DispatchError> {
        let request_id = Uuid::new_v4().to_string();
        let envelope = Envelope::with_payload(
            EnvelopeType::PathValidateRequest,
            &PathValidateRequest {
                request_id: request_id.clone(),
                path: path.to_string(),
            },
        );
        self.request(agent_id, &request_id, envelope, timeout).await
    }

    /// Change the environment an agent hands to its executor.
    pub async fn update_env(
        &self,
        agent_id: &str,
        set: HashMap<String, String>,
        remove: Vec<String>,
        timeout: Duration,
    ) -> Result<EnvUpdateResult, DispatchError> {
        let request_id = Uuid::new_v4().to_string();
        let envelope = Envelope::with_payload(
            EnvelopeType::EnvUpdateRequest,
            &EnvUpdateRequest {
                request_id: request_id.clone(),
                set,
                remove,
            },
        );
        self.request(agent_id, &request_id, envelope, timeout).await
    }

    pub async fn deploy(
        &self,
        agent_id: &str,
        project_id: &str,
        environment: Option<String>,
        timeout: Duration,
    ) -> Result<DeployResult, DispatchError> {
        let deploy_id = Uuid::new_v4().to_string();
        let envelope = Envelope::with_payload(
            EnvelopeType::DeployRequest,
            &DeployRequest {
                deploy_id: deploy_id.clone(),
                project_id: project_id.to_string(),
                environment,
            },
        );
        self.request(agent_id, &deploy_id, envelope, timeout).await
    }

    async fn request<T: DeserializeOwned>(
        &self,
        agent_id: &str,
        request_id: &str,
        envelope: Envelope,
        timeout: Duration,
    ) -> Result<T, DispatchError> {
        let reply = self.router.expect_reply(request_id);
        if !self.registry.send(agent_id, envelope).await {
            self.router.forget_reply(request_id);
            return Err(DispatchError::AgentOffline {
                agent_id: agent_id.to_string(),
            });
        }

        match tokio::time::timeout(timeout, reply).await {
            Ok(Ok(envelope)) => Ok(envelope.payload_as::<T>()?),
            _ => {
                self.router.forget_reply(request_id);
                Err(DispatchError::ReplyTimeout {
                    request_id: request_id.to_string(),
                    timeout,
                })
            }
        }
    }
}
