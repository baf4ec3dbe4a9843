//! Applies inbound agent envelopes to task records.
//!
//! Each connection context calls [`MessageRouter::route`] for its frames in
//! arrival order. Status changes go through a compare-and-set update, so a
//! terminal envelope that arrives twice (or races another context) is a
//! no-op the second time: no field changes and no notification.
//!
//! Chatty tasks are throttled. Progress messages go into a bounded ring per
//! task that is republished as one consolidated update at most once per
//! interval. Messages held back by the throttle are flushed by a periodic
//! sweep or, at the latest, just before the task's terminal notification.
//! Stream chunks are appended to a capped output buffer that is attached to
//! the completion notification.
//!
//! `agent:status` reports are reconciled against the store: a running task
//! the agent has stopped listing for longer than `orphan_grace` is failed.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rust_decimal::Decimal;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cloud::health::HealthTracker;
use crate::cloud::notify::{TaskNotification, TaskNotifier};
use crate::cloud::registry::AgentRegistry;
use crate::db::Database;
use crate::error::DatabaseError;
use crate::protocol::payloads::{
    AgentStatusReport, DeployResult, EnvUpdateResult, PathValidateResult, TaskAck, TaskCancelled,
    TaskComplete, TaskErrorPayload, TaskProgress, TaskStream,
};
use crate::protocol::{Envelope, EnvelopeType};
use crate::task::{Task, TaskStatus};

/// Router tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RouterConfig {
    /// Progress messages retained per task.
    pub progress_window: usize,
    /// Minimum spacing between consolidated progress notifications.
    pub progress_interval: Duration,
    /// Bytes of streamed output retained per task (the tail is kept).
    pub stream_limit: usize,
    /// How long a running task may be missing from the agent's status
    /// reports before it is failed.
    pub orphan_grace: Duration,
}

/// Recent tasks scanned when reconciling a status report.
const RECONCILE_SCAN_LIMIT: usize = 256;

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            progress_window: 8,
            progress_interval: Duration::from_secs(1),
            stream_limit: 64 * 1024,
            orphan_grace: Duration::from_secs(60),
        }
    }
}

/// What happened to a routed envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// The task moved to this status.
    Transitioned(TaskStatus),
    /// Accepted without a status change.
    Recorded,
    /// The task already moved past the point where this envelope applies.
    Stale,
    /// Unknown task, foreign task, malformed payload or unexpected kind.
    Dropped,
}

#[derive(Default)]
struct ProgressRing {
    agent_id: String,
    lines: VecDeque<String>,
    percent: Option<u8>,
    estimated_cost: Option<Decimal>,
    over_budget: bool,
    last_published: Option<Instant>,
    /// Lines arrived since the last publish.
    dirty: bool,
}

impl ProgressRing {
    fn is_due(&self, interval: Duration) -> bool {
        self.last_published
            .is_none_or(|at| at.elapsed() >= interval)
    }

    fn publish(&mut self, task_id: &str) -> TaskNotification {
        self.last_published = Some(Instant::now());
        self.dirty = false;
        TaskNotification::Progress {
            task_id: task_id.to_string(),
            agent_id: self.agent_id.clone(),
            lines: self.lines.iter().cloned().collect(),
            percent: self.percent,
            estimated_cost: self.estimated_cost,
            over_budget: self.over_budget,
        }
    }
}

/// Inbound envelope router. One instance is shared by every connection.
pub struct MessageRouter {
    db: Arc<dyn Database>,
    registry: Arc<AgentRegistry>,
    health: Arc<HealthTracker>,
    notifier: Arc<dyn TaskNotifier>,
    config: RouterConfig,
    progress: Mutex<HashMap<String, ProgressRing>>,
    streams: Mutex<HashMap<String, String>>,
    /// Agent id -> running tasks absent from its reports, and since when.
    missing: Mutex<HashMap<String, HashMap<String, Instant>>>,
    /// Request id -> waiter for the agent's `*:result` reply.
    replies: Mutex<HashMap<String, oneshot::Sender<Envelope>>>,
}

impl MessageRouter {
    pub fn new(
        db: Arc<dyn Database>,
        registry: Arc<AgentRegistry>,
        health: Arc<HealthTracker>,
        notifier: Arc<dyn TaskNotifier>,
    ) -> Self {
        Self {
            db,
            registry,
            health,
            notifier,
            config: RouterConfig::default(),
            progress: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            missing: Mutex::new(HashMap::new()),
            replies: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_config(mut self, config: RouterConfig) -> Self {
        self.config = config;
        self
    }

    /// Register interest in the reply carrying `request_id`.
    pub fn expect_reply(&self, request_id: &str) -> oneshot::Receiver<Envelope> {
        let (tx, rx) = oneshot::channel();
        self.replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(request_id.to_string(), tx);
        rx
    }

    /// Stop waiting for a reply (after a timeout).
    pub fn forget_reply(&self, request_id: &str) {
        self.replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(request_id);
    }

    /// Apply one envelope from `agent_id`.
    pub async fn route(
        &self,
        agent_id: &str,
        envelope: &Envelope,
    ) -> Result<RouteOutcome, DatabaseError> {
        tracing::debug!(agent_id = %agent_id, kind = %envelope.kind(), "Routing envelope");

        match envelope.kind() {
            EnvelopeType::TaskAck => match decode::<TaskAck>(agent_id, envelope) {
                Some(ack) => self.on_ack(agent_id, ack).await,
                None => Ok(RouteOutcome::Dropped),
            },
            EnvelopeType::TaskProgress => match decode::<TaskProgress>(agent_id, envelope) {
                Some(progress) => self.on_progress(agent_id, progress).await,
                None => Ok(RouteOutcome::Dropped),
            },
            EnvelopeType::TaskStream => match decode::<TaskStream>(agent_id, envelope) {
                Some(stream) => self.on_stream(agent_id, stream).await,
                None => Ok(RouteOutcome::Dropped),
            },
            EnvelopeType::TaskComplete => match decode::<TaskComplete>(agent_id, envelope) {
                Some(complete) => self.on_complete(agent_id, complete).await,
                None => Ok(RouteOutcome::Dropped),
            },
            EnvelopeType::TaskError => match decode::<TaskErrorPayload>(agent_id, envelope) {
                Some(error) => self.on_error(agent_id, error).await,
                None => Ok(RouteOutcome::Dropped),
            },
            EnvelopeType::TaskCancelled => match decode::<TaskCancelled>(agent_id, envelope) {
                Some(cancelled) => self.on_cancelled(agent_id, cancelled).await,
                None => Ok(RouteOutcome::Dropped),
            },
            EnvelopeType::AgentStatus => match decode::<AgentStatusReport>(agent_id, envelope) {
                Some(report) => {
                    self.registry.apply_status(agent_id, &report).await;
                    self.reconcile(agent_id, &report).await?;
                    Ok(RouteOutcome::Recorded)
                }
                None => Ok(RouteOutcome::Dropped),
            },
            EnvelopeType::HeartbeatPing => Ok(RouteOutcome::Recorded),
            EnvelopeType::PathValidateResult => {
                let request_id =
                    decode::<PathValidateResult>(agent_id, envelope).map(|r| r.request_id);
                Ok(self.deliver_reply(request_id, envelope))
            }
            EnvelopeType::EnvUpdateResult => {
                let request_id =
                    decode::<EnvUpdateResult>(agent_id, envelope).map(|r| r.request_id);
                Ok(self.deliver_reply(request_id, envelope))
            }
            EnvelopeType::DeployResult => {
                let result = decode::<DeployResult>(agent_id, envelope);
                if let Some(result) = &result {
                    tracing::info!(
                        agent_id = %agent_id,
                        deploy_id = %result.deploy_id,
                        success = result.success,
                        error = ?result.error,
                        "Deploy result"
                    );
                }
                Ok(self.deliver_reply(result.map(|r| r.deploy_id), envelope))
            }
            other => {
                tracing::warn!(agent_id = %agent_id, kind = %other, "Unexpected envelope from agent");
                Ok(RouteOutcome::Dropped)
            }
        }
    }

    fn deliver_reply(&self, request_id: Option<String>, envelope: &Envelope) -> RouteOutcome {
        let Some(request_id) = request_id else {
            return RouteOutcome::Dropped;
        };
        let waiter = self
            .replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&request_id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(envelope.clone());
                RouteOutcome::Recorded
            }
            None => {
                tracing::debug!(request_id = %request_id, "Reply with no waiter");
                RouteOutcome::Dropped
            }
        }
    }

    /// Load a task owned by `agent_id`, or None if it should be dropped.
    async fn load(&self, agent_id: &str, task_id: &str) -> Result<Option<Task>, DatabaseError> {
        let Some(task) = self.db.get_task(task_id).await? else {
            tracing::warn!(agent_id = %agent_id, task_id = %task_id, "Envelope for unknown task dropped");
            return Ok(None);
        };
        if task.agent_id != agent_id {
            tracing::warn!(
                agent_id = %agent_id,
                task_id = %task_id,
                owner = %task.agent_id,
                "Envelope for another agent's task dropped"
            );
            return Ok(None);
        }
        Ok(Some(task))
    }

    /// Move `task` to `next` if it is still in the status we loaded.
    async fn apply(
        &self,
        mut task: Task,
        next: TaskStatus,
        update: impl FnOnce(&mut Task),
    ) -> Result<Option<Task>, DatabaseError> {
        let expected = task.status;
        if !task.transition(next) {
            tracing::debug!(
                task_id = %task.id,
                from = %expected,
                to = %next,
                "Transition not applicable"
            );
            return Ok(None);
        }
        update(&mut task);
        if self.db.update_task_if_status(&task, expected).await? {
            tracing::info!(task_id = %task.id, from = %expected, to = %next, "Task transitioned");
            Ok(Some(task))
        } else {
            Ok(None)
        }
    }

    async fn on_ack(&self, agent_id: &str, ack: TaskAck) -> Result<RouteOutcome, DatabaseError> {
        let Some(task) = self.load(agent_id, &ack.task_id).await? else {
            return Ok(RouteOutcome::Dropped);
        };

        if ack.accepted {
            return match self.apply(task, TaskStatus::Running, |_| {}).await? {
                Some(task) => {
                    self.notifier.notify(TaskNotification::Started {
                        task_id: task.id,
                        agent_id: agent_id.to_string(),
                    });
                    Ok(RouteOutcome::Transitioned(TaskStatus::Running))
                }
                None => Ok(RouteOutcome::Stale),
            };
        }

        let reason = ack
            .reason
            .unwrap_or_else(|| "rejected by agent".to_string());
        self.fail(agent_id, task, reason, "rejected".to_string())
            .await
    }

    async fn on_error(
        &self,
        agent_id: &str,
        error: TaskErrorPayload,
    ) -> Result<RouteOutcome, DatabaseError> {
        let Some(task) = self.load(agent_id, &error.task_id).await? else {
            return Ok(RouteOutcome::Dropped);
        };
        self.fail(agent_id, task, error.error, error.code).await
    }

    async fn fail(
        &self,
        agent_id: &str,
        task: Task,
        error: String,
        code: String,
    ) -> Result<RouteOutcome, DatabaseError> {
        let message = error.clone();
        match self
            .apply(task, TaskStatus::Failed, |t| t.error_message = Some(message))
            .await?
        {
            Some(task) => {
                self.finish(agent_id, &task.id).await;
                self.health.record_failure(agent_id);
                tracing::warn!(agent_id = %agent_id, task_id = %task.id, code = %code, "Task failed: {}", error);
                self.notifier.notify(TaskNotification::Failed {
                    task_id: task.id,
                    agent_id: agent_id.to_string(),
                    error,
                    code,
                });
                Ok(RouteOutcome::Transitioned(TaskStatus::Failed))
            }
            None => Ok(RouteOutcome::Stale),
        }
    }

    async fn on_complete(
        &self,
        agent_id: &str,
        complete: TaskComplete,
    ) -> Result<RouteOutcome, DatabaseError> {
        let Some(task) = self.load(agent_id, &complete.task_id).await? else {
            return Ok(RouteOutcome::Dropped);
        };

        let summary = complete.summary.clone();
        let applied = self
            .apply(task, TaskStatus::Completed, |t| {
                if complete.session_id.is_some() {
                    t.session_id = complete.session_id;
                }
                t.input_tokens = complete.input_tokens;
                t.output_tokens = complete.output_tokens;
                t.estimated_cost = complete.estimated_cost;
                t.files_changed = complete.files_changed;
                t.commands_run = complete.commands_run;
            })
            .await?;

        let Some(task) = applied else {
            return Ok(RouteOutcome::Stale);
        };

        let output = self.take_output(&task.id);
        self.finish(agent_id, &task.id).await;
        self.health.record_success(agent_id);

        let over_budget = task.is_over_budget();
        if over_budget {
            tracing::warn!(
                task_id = %task.id,
                estimated_cost = %task.estimated_cost,
                max_budget = ?task.max_budget,
                "Task finished over budget"
            );
        }

        self.notifier.notify(TaskNotification::Completed {
            task_id: task.id,
            agent_id: agent_id.to_string(),
            input_tokens: task.input_tokens,
            output_tokens: task.output_tokens,
            estimated_cost: task.estimated_cost,
            over_budget,
            summary,
            output,
        });
        Ok(RouteOutcome::Transitioned(TaskStatus::Completed))
    }

    async fn on_cancelled(
        &self,
        agent_id: &str,
        cancelled: TaskCancelled,
    ) -> Result<RouteOutcome, DatabaseError> {
        let Some(task) = self.load(agent_id, &cancelled.task_id).await? else {
            return Ok(RouteOutcome::Dropped);
        };

        let reason = cancelled.reason.clone();
        match self
            .apply(task, TaskStatus::Cancelled, |t| t.error_message = Some(reason))
            .await?
        {
            Some(task) => {
                self.finish(agent_id, &task.id).await;
                tracing::info!(
                    agent_id = %agent_id,
                    task_id = %task.id,
                    initiator = cancelled.initiator.as_str(),
                    "Task cancelled: {}",
                    cancelled.reason
                );
                self.notifier.notify(TaskNotification::Cancelled {
                    task_id: task.id,
                    agent_id: agent_id.to_string(),
                    reason: cancelled.reason,
                    initiator: Some(cancelled.initiator),
                });
                Ok(RouteOutcome::Transitioned(TaskStatus::Cancelled))
            }
            None => Ok(RouteOutcome::Stale),
        }
    }

    async fn on_progress(
        &self,
        agent_id: &str,
        progress: TaskProgress,
    ) -> Result<RouteOutcome, DatabaseError> {
        let Some(task) = self.load(agent_id, &progress.task_id).await? else {
            return Ok(RouteOutcome::Dropped);
        };
        if task.status.is_terminal() {
            return Ok(RouteOutcome::Stale);
        }

        let over_budget = match (progress.estimated_cost, task.max_budget) {
            (Some(cost), Some(budget)) if cost > budget => {
                tracing::warn!(
                    task_id = %task.id,
                    estimated_cost = %cost,
                    max_budget = %budget,
                    "Task running over budget"
                );
                true
            }
            _ => false,
        };

        let notification = {
            let mut rings = self
                .progress
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let ring = rings.entry(task.id.clone()).or_default();
            ring.agent_id = agent_id.to_string();
            ring.lines.push_back(progress.message);
            while ring.lines.len() > self.config.progress_window.max(1) {
                ring.lines.pop_front();
            }
            ring.percent = progress.percent.or(ring.percent);
            ring.estimated_cost = progress.estimated_cost.or(ring.estimated_cost);
            ring.over_budget = over_budget;
            ring.dirty = true;

            (over_budget || ring.is_due(self.config.progress_interval))
                .then(|| ring.publish(&task.id))
        };

        if let Some(notification) = notification {
            self.notifier.notify(notification);
        }
        Ok(RouteOutcome::Recorded)
    }

    async fn on_stream(
        &self,
        agent_id: &str,
        stream: TaskStream,
    ) -> Result<RouteOutcome, DatabaseError> {
        let Some(task) = self.load(agent_id, &stream.task_id).await? else {
            return Ok(RouteOutcome::Dropped);
        };
        if task.status.is_terminal() {
            return Ok(RouteOutcome::Stale);
        }

        let mut streams = self
            .streams
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let buffer = streams.entry(task.id).or_default();
        buffer.push_str(&stream.chunk);
        truncate_front(buffer, self.config.stream_limit);
        Ok(RouteOutcome::Recorded)
    }

    /// Publish progress held back by the throttle whose interval has passed.
    /// Returns how many tasks were published.
    pub fn flush_progress(&self) -> usize {
        let pending: Vec<TaskNotification> = self
            .progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter_mut()
            .filter(|(_, ring)| ring.dirty && ring.is_due(self.config.progress_interval))
            .map(|(task_id, ring)| ring.publish(task_id))
            .collect();
        let count = pending.len();
        for notification in pending {
            self.notifier.notify(notification);
        }
        count
    }

    /// Run [`Self::flush_progress`] every `progress_interval` until shutdown.
    pub fn spawn_progress_flush(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let router = Arc::clone(self);
        tokio::spawn(async move {
            let every = router.config.progress_interval.max(Duration::from_millis(10));
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        router.flush_progress();
                    }
                }
            }
        })
    }

    /// Fail running tasks the agent no longer lists. A task is failed on the
    /// first report that still omits it `orphan_grace` after the first
    /// omission, so a terminal envelope racing a report wins.
    async fn reconcile(
        &self,
        agent_id: &str,
        report: &AgentStatusReport,
    ) -> Result<(), DatabaseError> {
        let reported: HashSet<&str> = report.active_task_ids.iter().map(String::as_str).collect();
        let unlisted: Vec<Task> = self
            .db
            .list_tasks_for_agent(agent_id, RECONCILE_SCAN_LIMIT)
            .await?
            .into_iter()
            .filter(|task| task.status == TaskStatus::Running)
            .filter(|task| !reported.contains(task.id.as_str()))
            .collect();

        let orphaned = {
            let mut missing = self
                .missing
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let previous = missing.remove(agent_id).unwrap_or_default();
            let mut still_missing = HashMap::new();
            let mut orphaned = Vec::new();
            for task in unlisted {
                match previous.get(&task.id) {
                    Some(since) if since.elapsed() >= self.config.orphan_grace => {
                        orphaned.push(task)
                    }
                    Some(since) => {
                        still_missing.insert(task.id.clone(), *since);
                    }
                    None => {
                        still_missing.insert(task.id.clone(), Instant::now());
                    }
                }
            }
            if !still_missing.is_empty() {
                missing.insert(agent_id.to_string(), still_missing);
            }
            orphaned
        };

        for task in orphaned {
            self.fail(
                agent_id,
                task,
                "task no longer reported by agent".to_string(),
                "orphaned".to_string(),
            )
            .await?;
        }
        Ok(())
    }

    /// Clear per-task accumulators and registry bookkeeping. Progress still
    /// held back by the throttle is published first.
    async fn finish(&self, agent_id: &str, task_id: &str) {
        let ring = self
            .progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(task_id);
        if let Some(mut ring) = ring
            && ring.dirty
        {
            self.notifier.notify(ring.publish(task_id));
        }
        self.streams
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(task_id);
        self.registry.release_task(agent_id, task_id).await;
    }

    fn take_output(&self, task_id: &str) -> Option<String> {
        self.streams
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(task_id)
            .filter(|s| !s.is_empty())
    }
}

fn decode<T: serde::de::DeserializeOwned>(agent_id: &str, envelope: &Envelope) -> Option<T> {
    match envelope.payload_as::<T>() {
        Ok(payload) => Some(payload),
        Err(e) => {
            tracing::warn!(
                agent_id = %agent_id,
                kind = %envelope.kind(),
                envelope_id = %envelope.id(),
                "Malformed payload dropped: {}",
                e
            );
            None
        }
    }
}

/// Drop bytes from the front until `buffer` fits in `limit`, on a char boundary.
fn truncate_front(buffer: &mut String, limit: usize) {
    if buffer.len() <= limit {
        return;
    }
    let mut cut = buffer.len() - limit;
    while !buffer.is_char_boundary(cut) {
        cut += 1;
    }
    buffer.drain(..cut);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::auth::AgentKeyStore;
    use crate::cloud::notify::BroadcastNotifier;
    use crate::db::memory::InMemoryStore;
    use crate::protocol::payloads::{AgentStatus, CancelInitiator};
    use crate::task::NewTask;
    use rust_decimal_macros::dec;
    use tokio::sync::broadcast;

    struct Fixture {
        db: Arc<InMemoryStore>,
        registry: Arc<AgentRegistry>,
        health: Arc<HealthTracker>,
        router: MessageRouter,
        events: broadcast::Receiver<TaskNotification>,
    }

    fn fixture(config: RouterConfig) -> Fixture {
        let db = Arc::new(InMemoryStore::new());
        let registry = Arc::new(AgentRegistry::new(AgentKeyStore::default()));
        let health = Arc::new(HealthTracker::default());
        let notifier = Arc::new(BroadcastNotifier::default());
        let events = notifier.subscribe();
        let router = MessageRouter::new(db.clone(), registry.clone(), health.clone(), notifier)
            .with_config(config);
        Fixture {
            db,
            registry,
            health,
            router,
            events,
        }
    }

    async fn seed(db: &InMemoryStore, status: TaskStatus) -> Task {
        let mut task = Task::new(NewTask {
            project_id: "proj".to_string(),
            agent_id: "agent-a".to_string(),
            bot_name: "builder".to_string(),
            command: "run".to_string(),
            prompt: "go".to_string(),
            max_budget: Some(dec!(1.00)),
            parent_task_id: None,
            session_id: None,
        });
        task.status = status;
        db.create_task(&task).await.unwrap();
        task
    }

    fn complete(task_id: &str, cost: Decimal) -> Envelope {
        Envelope::with_payload(
            EnvelopeType::TaskComplete,
            &TaskComplete {
                task_id: task_id.to_string(),
                session_id: Some("sess-1".to_string()),
                input_tokens: 10,
                output_tokens: 20,
                estimated_cost: cost,
                files_changed: vec!["src/lib.rs".to_string()],
                commands_run: vec![],
                summary: Some("done".to_string()),
            },
        )
    }

    fn progress(task_id: &str, message: &str) -> Envelope {
        Envelope::with_payload(
            EnvelopeType::TaskProgress,
            &TaskProgress {
                task_id: task_id.to_string(),
                message: message.to_string(),
                percent: None,
                estimated_cost: None,
            },
        )
    }

    fn status(active: &[&str]) -> Envelope {
        Envelope::with_payload(
            EnvelopeType::AgentStatus,
            &AgentStatusReport {
                status: AgentStatus::Busy,
                active_task_ids: active.iter().map(|id| id.to_string()).collect(),
                resources: None,
            },
        )
    }

    fn cancelled(task_id: &str) -> Envelope {
        Envelope::with_payload(
            EnvelopeType::TaskCancelled,
            &TaskCancelled {
                task_id: task_id.to_string(),
                reason: "cancelled by user".to_string(),
                initiator: CancelInitiator::User,
            },
        )
    }

    fn error(task_id: &str) -> Envelope {
        Envelope::with_payload(
            EnvelopeType::TaskError,
            &TaskErrorPayload {
                task_id: task_id.to_string(),
                error: "boom".to_string(),
                code: "execution_failed".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_ack_accepted_moves_to_running() {
        let mut f = fixture(RouterConfig::default());
        let task = seed(&f.db, TaskStatus::Queued).await;
        let ack = Envelope::with_payload(
            EnvelopeType::TaskAck,
            &TaskAck {
                task_id: task.id.clone(),
                accepted: true,
                reason: None,
            },
        );

        let outcome = f.router.route("agent-a", &ack).await.unwrap();
        assert_eq!(outcome, RouteOutcome::Transitioned(TaskStatus::Running));
        assert!(matches!(f.events.try_recv().unwrap(), TaskNotification::Started { .. }));

        // A repeated ack changes nothing.
        assert_eq!(f.router.route("agent-a", &ack).await.unwrap(), RouteOutcome::Stale);
    }

    #[tokio::test]
    async fn test_ack_rejected_fails_with_reason() {
        let f = fixture(RouterConfig::default());
        let task = seed(&f.db, TaskStatus::Queued).await;
        let ack = Envelope::with_payload(
            EnvelopeType::TaskAck,
            &TaskAck {
                task_id: task.id.clone(),
                accepted: false,
                reason: Some("duplicate task".to_string()),
            },
        );
        f.router.route("agent-a", &ack).await.unwrap();
        let stored = f.db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("duplicate task"));
    }

    #[tokio::test]
    async fn test_complete_persists_metrics_and_flags_budget() {
        let mut f = fixture(RouterConfig::default());
        let task = seed(&f.db, TaskStatus::Running).await;

        let outcome = f
            .router
            .route("agent-a", &complete(&task.id, dec!(1.50)))
            .await
            .unwrap();
        assert_eq!(outcome, RouteOutcome::Transitioned(TaskStatus::Completed));

        let stored = f.db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.input_tokens, 10);
        assert_eq!(stored.output_tokens, 20);
        assert_eq!(stored.session_id.as_deref(), Some("sess-1"));
        assert_eq!(stored.files_changed, vec!["src/lib.rs".to_string()]);
        assert!(stored.completed_at.is_some());

        match f.events.try_recv().unwrap() {
            TaskNotification::Completed { over_budget, .. } => assert!(over_budget),
            other => panic!("unexpected notification: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_terminal_on_terminal_is_noop() {
        let mut f = fixture(RouterConfig::default());
        let task = seed(&f.db, TaskStatus::Running).await;

        f.router.route("agent-a", &error(&task.id)).await.unwrap();
        assert!(matches!(f.events.try_recv().unwrap(), TaskNotification::Failed { .. }));
        let after_first = f.db.get_task(&task.id).await.unwrap().unwrap();

        // Duplicate error and a late completion are both ignored.
        assert_eq!(
            f.router.route("agent-a", &error(&task.id)).await.unwrap(),
            RouteOutcome::Stale
        );
        assert_eq!(
            f.router
                .route("agent-a", &complete(&task.id, dec!(0.10)))
                .await
                .unwrap(),
            RouteOutcome::Stale
        );
        assert_eq!(f.db.get_task(&task.id).await.unwrap().unwrap(), after_first);
        assert!(f.events.try_recv().is_err());

        let report = f.health.report("agent-a").unwrap();
        assert_eq!(report.total_failures, 1);
    }

    #[tokio::test]
    async fn test_duplicate_complete_is_noop() {
        let mut f = fixture(RouterConfig::default());
        let task = seed(&f.db, TaskStatus::Running).await;

        f.router
            .route("agent-a", &complete(&task.id, dec!(0.25)))
            .await
            .unwrap();
        assert!(matches!(f.events.try_recv().unwrap(), TaskNotification::Completed { .. }));
        let after_first = f.db.get_task(&task.id).await.unwrap().unwrap();

        assert_eq!(
            f.router
                .route("agent-a", &complete(&task.id, dec!(9.99)))
                .await
                .unwrap(),
            RouteOutcome::Stale
        );
        let stored = f.db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored, after_first);
        assert_eq!(stored.estimated_cost, dec!(0.25));
        assert!(f.events.try_recv().is_err());
        assert_eq!(f.health.report("agent-a").unwrap().total_successes, 1);
    }

    #[tokio::test]
    async fn test_cancelled_after_complete_is_noop() {
        let mut f = fixture(RouterConfig::default());
        let task = seed(&f.db, TaskStatus::Running).await;

        f.router
            .route("agent-a", &complete(&task.id, dec!(0.25)))
            .await
            .unwrap();
        assert!(matches!(f.events.try_recv().unwrap(), TaskNotification::Completed { .. }));
        let after_first = f.db.get_task(&task.id).await.unwrap().unwrap();

        assert_eq!(
            f.router.route("agent-a", &cancelled(&task.id)).await.unwrap(),
            RouteOutcome::Stale
        );
        let stored = f.db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored, after_first);
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.estimated_cost, dec!(0.25));
        assert!(stored.error_message.is_none());
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_cancelled_records_reason() {
        let f = fixture(RouterConfig::default());
        let task = seed(&f.db, TaskStatus::Running).await;
        let cancelled = Envelope::with_payload(
            EnvelopeType::TaskCancelled,
            &TaskCancelled {
                task_id: task.id.clone(),
                reason: "cancelled due to resource pressure: memory usage 93.0%".to_string(),
                initiator: CancelInitiator::Resource,
            },
        );
        f.router.route("agent-a", &cancelled).await.unwrap();
        let stored = f.db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Cancelled);
        assert!(
            stored
                .error_message
                .unwrap()
                .starts_with("cancelled due to resource pressure")
        );
    }

    #[tokio::test]
    async fn test_unknown_and_foreign_tasks_dropped() {
        let f = fixture(RouterConfig::default());
        assert_eq!(
            f.router.route("agent-a", &error("missing")).await.unwrap(),
            RouteOutcome::Dropped
        );

        let task = seed(&f.db, TaskStatus::Running).await;
        assert_eq!(
            f.router.route("agent-b", &error(&task.id)).await.unwrap(),
            RouteOutcome::Dropped
        );
        assert_eq!(
            f.db.get_task(&task.id).await.unwrap().unwrap().status,
            TaskStatus::Running
        );
    }

    #[tokio::test]
    async fn test_malformed_payload_dropped() {
        let f = fixture(RouterConfig::default());
        let envelope = Envelope::new(EnvelopeType::TaskComplete, serde_json::json!({"nope": 1}));
        assert_eq!(
            f.router.route("agent-a", &envelope).await.unwrap(),
            RouteOutcome::Dropped
        );
    }

    #[tokio::test]
    async fn test_progress_ring_keeps_last_window() {
        let mut f = fixture(RouterConfig {
            progress_interval: Duration::from_secs(3600),
            ..RouterConfig::default()
        });
        let task = seed(&f.db, TaskStatus::Running).await;

        for n in 0..20 {
            f.router
                .route("agent-a", &progress(&task.id, &format!("step {}", n)))
                .await
                .unwrap();
        }

        // Only the first message went out; the rest were coalesced.
        assert!(matches!(f.events.try_recv().unwrap(), TaskNotification::Progress { .. }));
        assert!(f.events.try_recv().is_err());

        // The held-back window is published ahead of the terminal event.
        f.router.route("agent-a", &error(&task.id)).await.unwrap();
        match f.events.try_recv().unwrap() {
            TaskNotification::Progress { lines, .. } => {
                assert_eq!(lines.len(), 8);
                assert_eq!(lines.first().unwrap(), "step 12");
                assert_eq!(lines.last().unwrap(), "step 19");
            }
            other => panic!("unexpected notification: {:?}", other),
        }
        assert!(matches!(f.events.try_recv().unwrap(), TaskNotification::Failed { .. }));
        assert_eq!(f.router.flush_progress(), 0);
    }

    #[tokio::test]
    async fn test_progress_burst_then_silence_is_flushed() {
        let mut f = fixture(RouterConfig {
            progress_interval: Duration::from_millis(20),
            ..RouterConfig::default()
        });
        let task = seed(&f.db, TaskStatus::Running).await;

        for message in ["cloning", "building", "testing"] {
            f.router
                .route("agent-a", &progress(&task.id, message))
                .await
                .unwrap();
        }
        assert!(matches!(f.events.try_recv().unwrap(), TaskNotification::Progress { .. }));
        assert!(f.events.try_recv().is_err());

        // Inside the interval nothing is due yet.
        assert_eq!(f.router.flush_progress(), 0);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(f.router.flush_progress(), 1);
        match f.events.try_recv().unwrap() {
            TaskNotification::Progress { lines, .. } => {
                assert_eq!(lines.last().map(String::as_str), Some("testing"))
            }
            other => panic!("unexpected notification: {:?}", other),
        }

        // Nothing new arrived, so nothing more to publish.
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(f.router.flush_progress(), 0);
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_status_report_fails_orphaned_task() {
        let mut f = fixture(RouterConfig {
            orphan_grace: Duration::ZERO,
            ..RouterConfig::default()
        });
        let listed = seed(&f.db, TaskStatus::Running).await;
        let orphan = seed(&f.db, TaskStatus::Running).await;
        let queued = seed(&f.db, TaskStatus::Queued).await;
        let (_info, _rx) = f.registry.register("agent-a", "1").await;

        // The first report that omits a task only starts the grace period.
        let report = status(&[listed.id.as_str()]);
        f.router.route("agent-a", &report).await.unwrap();
        assert_eq!(
            f.db.get_task(&orphan.id).await.unwrap().unwrap().status,
            TaskStatus::Running
        );
        assert!(f.events.try_recv().is_err());

        f.router.route("agent-a", &report).await.unwrap();
        let stored = f.db.get_task(&orphan.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(
            stored.error_message.as_deref(),
            Some("task no longer reported by agent")
        );
        match f.events.try_recv().unwrap() {
            TaskNotification::Failed { task_id, code, .. } => {
                assert_eq!(task_id, orphan.id);
                assert_eq!(code, "orphaned");
            }
            other => panic!("unexpected notification: {:?}", other),
        }
        assert!(f.events.try_recv().is_err());

        // Listed and not-yet-acked tasks are left alone.
        assert_eq!(
            f.db.get_task(&listed.id).await.unwrap().unwrap().status,
            TaskStatus::Running
        );
        assert_eq!(
            f.db.get_task(&queued.id).await.unwrap().unwrap().status,
            TaskStatus::Queued
        );
    }

    #[tokio::test]
    async fn test_status_report_grace_lets_terminal_envelope_win() {
        let mut f = fixture(RouterConfig::default());
        let task = seed(&f.db, TaskStatus::Running).await;

        // Report built after the agent finished but delivered before the
        // completion envelope.
        f.router.route("agent-a", &status(&[])).await.unwrap();
        f.router
            .route("agent-a", &complete(&task.id, dec!(0.10)))
            .await
            .unwrap();
        f.router.route("agent-a", &status(&[])).await.unwrap();

        let stored = f.db.get_task(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert!(matches!(f.events.try_recv().unwrap(), TaskNotification::Completed { .. }));
        assert!(f.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stream_output_capped_and_attached() {
        let mut f = fixture(RouterConfig {
            stream_limit: 8,
            ..RouterConfig::default()
        });
        let task = seed(&f.db, TaskStatus::Running).await;
        for chunk in ["hello ", "world", "!"] {
            let stream = Envelope::with_payload(
                EnvelopeType::TaskStream,
                &TaskStream {
                    task_id: task.id.clone(),
                    chunk: chunk.to_string(),
                },
            );
            f.router.route("agent-a", &stream).await.unwrap();
        }

        f.router
            .route("agent-a", &complete(&task.id, dec!(0.10)))
            .await
            .unwrap();
        match f.events.try_recv().unwrap() {
            TaskNotification::Completed { output, .. } => {
                assert_eq!(output.as_deref(), Some("o world!"))
            }
            other => panic!("unexpected notification: {:?}", other),
        }

        // The buffer went with the completion; a late chunk is stale.
        let late = Envelope::with_payload(
            EnvelopeType::TaskStream,
            &TaskStream {
                task_id: task.id.clone(),
                chunk: "late".to_string(),
            },
        );
        assert_eq!(
            f.router.route("agent-a", &late).await.unwrap(),
            RouteOutcome::Stale
        );
    }

    #[tokio::test]
    async fn test_reply_delivered_to_waiter() {
        let f = fixture(RouterConfig::default());
        let rx = f.router.expect_reply("req-1");
        let reply = Envelope::with_payload(
            EnvelopeType::PathValidateResult,
            &PathValidateResult {
                request_id: "req-1".to_string(),
                path: "/tmp".to_string(),
                exists: true,
                is_directory: true,
                error: None,
            },
        );
        assert_eq!(
            f.router.route("agent-a", &reply).await.unwrap(),
            RouteOutcome::Recorded
        );
        assert_eq!(rx.await.unwrap().id(), reply.id());

        // Nobody waiting the second time.
        assert_eq!(
            f.router.route("agent-a", &reply).await.unwrap(),
            RouteOutcome::Dropped
        );
    }

    #[test]
    fn test_truncate_front_respects_char_boundary() {
        let mut s = "ééé".to_string();
        truncate_front(&mut s, 3);
        assert_eq!(s, "é");
    }
}
