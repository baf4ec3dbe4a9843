//! Admission-controlled task queue.
//!
//! Every task that enters the active set leaves it exactly once, through
//! [`TaskQueueProcessor::finalize`], which removes the entry under the lock
//! and emits the single terminal envelope for it. A cancel request
//! recorded before that point always wins over the executor's result.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use crate::agent::connection::EnvelopeSink;
use crate::agent::executor::{ExecutionEvent, ExecutionOutcome, TaskExecutor};
use crate::agent::resources::ResourceMonitor;
use crate::error::{AdmissionError, ExecutionError};
use crate::protocol::payloads::{
    CancelInitiator, TaskAck, TaskCancelled, TaskComplete, TaskErrorPayload, TaskProgress,
    TaskStream, TaskSubmit,
};
use crate::protocol::{Envelope, EnvelopeType};

/// Where an admitted task currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Queued,
    Running,
}

/// Public view of an active task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveTaskInfo {
    pub task_id: String,
    pub project_id: String,
    pub bot_name: String,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    pub cancelling: bool,
}

struct CancelRequest {
    reason: String,
    initiator: CancelInitiator,
}

struct ActiveTask {
    spec: TaskSubmit,
    state: RunState,
    created_at: DateTime<Utc>,
    seq: u64,
    cancel: CancellationToken,
    cancel_request: Option<CancelRequest>,
}

impl ActiveTask {
    fn info(&self) -> ActiveTaskInfo {
        ActiveTaskInfo {
            task_id: self.spec.task_id.clone(),
            project_id: self.spec.project_id.clone(),
            bot_name: self.spec.bot_name.clone(),
            state: self.state,
            created_at: self.created_at,
            cancelling: self.cancel_request.is_some(),
        }
    }
}

/// Agent-side task queue.
pub struct TaskQueueProcessor {
    max_concurrent: usize,
    monitor: Arc<ResourceMonitor>,
    sink: Arc<dyn EnvelopeSink>,
    executor: Arc<dyn TaskExecutor>,
    active: Mutex<HashMap<String, ActiveTask>>,
    next_seq: AtomicU64,
    idle: Notify,
}

impl TaskQueueProcessor {
    pub fn new(
        max_concurrent: usize,
        monitor: Arc<ResourceMonitor>,
        sink: Arc<dyn EnvelopeSink>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            monitor,
            sink,
            executor,
            active: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            idle: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ActiveTask>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Admit and start a task.
    ///
    /// On rejection nothing is created; the error is returned and also
    /// reported to the coordinator (`task:error` for admission failures,
    /// `task:ack{accepted:false}` for duplicates).
    pub fn submit(self: &Arc<Self>, spec: TaskSubmit) -> Result<(), AdmissionError> {
        let task_id = spec.task_id.clone();
        let admitted = {
            let mut active = self.lock();
            match self.check_admission(&active, &task_id) {
                Ok(()) => {
                    let cancel = CancellationToken::new();
                    active.insert(
                        task_id.clone(),
                        ActiveTask {
                            spec: spec.clone(),
                            state: RunState::Queued,
                            created_at: Utc::now(),
                            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
                            cancel: cancel.clone(),
                            cancel_request: None,
                        },
                    );
                    Ok(cancel)
                }
                Err(e) => Err(e),
            }
        };

        let cancel = match admitted {
            Ok(cancel) => cancel,
            Err(e) => {
                tracing::warn!(task_id = %task_id, "{}", e);
                self.report_rejection(&task_id, &e);
                return Err(e);
            }
        };

        tracing::info!(task_id = %task_id, bot = %spec.bot_name, "Task admitted");
        self.emit(Envelope::with_payload(
            EnvelopeType::TaskAck,
            &TaskAck {
                task_id: task_id.clone(),
                accepted: true,
                reason: None,
            },
        ));

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            queue.run(spec, cancel).await;
        });
        Ok(())
    }

    fn check_admission(
        &self,
        active: &HashMap<String, ActiveTask>,
        task_id: &str,
    ) -> Result<(), AdmissionError> {
        if active.contains_key(task_id) {
            return Err(AdmissionError::Duplicate {
                task_id: task_id.to_string(),
            });
        }
        if !self.monitor.can_accept_new_tasks() {
            let cause = self
                .monitor
                .report_status()
                .cause
                .unwrap_or_else(|| "resource monitor is refusing new tasks".to_string());
            return Err(AdmissionError::ResourcesExhausted { cause });
        }
        if active.len() >= self.max_concurrent {
            return Err(AdmissionError::ConcurrencyLimit {
                limit: self.max_concurrent,
            });
        }
        Ok(())
    }

    fn report_rejection(&self, task_id: &str, error: &AdmissionError) {
        let envelope = match error {
            AdmissionError::Duplicate { .. } => Envelope::with_payload(
                EnvelopeType::TaskAck,
                &TaskAck {
                    task_id: task_id.to_string(),
                    accepted: false,
                    reason: Some(error.to_string()),
                },
            ),
            _ => Envelope::with_payload(
                EnvelopeType::TaskError,
                &TaskErrorPayload {
                    task_id: task_id.to_string(),
                    error: error.to_string(),
                    code: error.code().to_string(),
                },
            ),
        };
        self.emit(envelope);
    }

    async fn run(self: Arc<Self>, spec: TaskSubmit, cancel: CancellationToken) {
        let task_id = spec.task_id.clone();
        {
            let mut active = self.lock();
            if let Some(entry) = active.get_mut(&task_id) {
                entry.state = RunState::Running;
            }
        }

        let result = if cancel.is_cancelled() {
            Err(ExecutionError::Cancelled)
        } else {
            let (tx, mut rx) = mpsc::channel(64);
            let execution = self.executor.execute(&spec, tx, cancel.clone());
            tokio::pin!(execution);

            let result = loop {
                tokio::select! {
                    result = &mut execution => break result,
                    Some(event) = rx.recv() => self.forward(&task_id, event),
                }
            };
            while let Ok(event) = rx.try_recv() {
                self.forward(&task_id, event);
            }
            result
        };

        self.finalize(&task_id, result);
    }

    fn forward(&self, task_id: &str, event: ExecutionEvent) {
        let envelope = match event {
            ExecutionEvent::Progress {
                message,
                percent,
                estimated_cost,
            } => Envelope::with_payload(
                EnvelopeType::TaskProgress,
                &TaskProgress {
                    task_id: task_id.to_string(),
                    message,
                    percent,
                    estimated_cost,
                },
            ),
            ExecutionEvent::Stream { chunk } => Envelope::with_payload(
                EnvelopeType::TaskStream,
                &TaskStream {
                    task_id: task_id.to_string(),
                    chunk,
                },
            ),
        };
        if !self.sink.send(envelope) {
            tracing::debug!(task_id = %task_id, "Dropped intermediate event while offline");
        }
    }

    /// Remove the task and emit its one terminal envelope.
    fn finalize(&self, task_id: &str, result: Result<ExecutionOutcome, ExecutionError>) {
        let (entry, now_empty) = {
            let mut active = self.lock();
            let entry = active.remove(task_id);
            (entry, active.is_empty())
        };
        let Some(entry) = entry else {
            return;
        };

        let envelope = match (entry.cancel_request, result) {
            (Some(request), _) => {
                tracing::info!(
                    task_id = %task_id,
                    initiator = request.initiator.as_str(),
                    "Task cancelled: {}",
                    request.reason
                );
                Envelope::with_payload(
                    EnvelopeType::TaskCancelled,
                    &TaskCancelled {
                        task_id: task_id.to_string(),
                        reason: request.reason,
                        initiator: request.initiator,
                    },
                )
            }
            (None, Ok(outcome)) => {
                tracing::info!(
                    task_id = %task_id,
                    input_tokens = outcome.input_tokens,
                    output_tokens = outcome.output_tokens,
                    "Task completed"
                );
                Envelope::with_payload(
                    EnvelopeType::TaskComplete,
                    &TaskComplete {
                        task_id: task_id.to_string(),
                        session_id: outcome.session_id,
                        input_tokens: outcome.input_tokens,
                        output_tokens: outcome.output_tokens,
                        estimated_cost: outcome.estimated_cost,
                        files_changed: outcome.files_changed,
                        commands_run: outcome.commands_run,
                        summary: outcome.summary,
                    },
                )
            }
            (None, Err(e)) => {
                tracing::warn!(task_id = %task_id, "Task failed: {}", e);
                let code = match &e {
                    ExecutionError::Timeout(_) => "timeout",
                    ExecutionError::SpawnFailed { .. } => "spawn_failed",
                    _ => "execution_failed",
                };
                Envelope::with_payload(
                    EnvelopeType::TaskError,
                    &TaskErrorPayload {
                        task_id: task_id.to_string(),
                        error: e.to_string(),
                        code: code.to_string(),
                    },
                )
            }
        };

        self.emit(envelope);
        if now_empty {
            self.idle.notify_waiters();
        }
    }

    fn emit(&self, envelope: Envelope) {
        let kind = envelope.kind();
        if !self.sink.send(envelope) {
            tracing::warn!(kind = %kind, "Not connected; envelope not delivered");
        }
    }

    /// User-initiated cancel. False if the task is not active here.
    pub fn cancel(&self, task_id: &str) -> bool {
        self.cancel_with(task_id, "cancelled by user", CancelInitiator::User)
    }

    /// Record a cancel request and interrupt execution. The first recorded
    /// reason is the one reported.
    pub fn cancel_with(&self, task_id: &str, reason: &str, initiator: CancelInitiator) -> bool {
        let mut active = self.lock();
        let Some(entry) = active.get_mut(task_id) else {
            return false;
        };
        if entry.cancel_request.is_none() {
            entry.cancel_request = Some(CancelRequest {
                reason: reason.to_string(),
                initiator,
            });
        }
        entry.cancel.cancel();
        true
    }

    /// Cancel the oldest active task not already being cancelled.
    /// `cause` is recorded in the cancellation reason.
    pub fn cancel_lowest_priority_task(&self, cause: &str) -> Option<String> {
        let mut active = self.lock();
        let entry = active
            .values_mut()
            .filter(|entry| entry.cancel_request.is_none())
            .min_by_key(|entry| (entry.created_at, entry.seq))?;

        entry.cancel_request = Some(CancelRequest {
            reason: format!("cancelled due to resource pressure: {}", cause),
            initiator: CancelInitiator::Resource,
        });
        entry.cancel.cancel();
        tracing::warn!(task_id = %entry.spec.task_id, "Cancelling oldest task: {}", cause);
        Some(entry.spec.task_id.clone())
    }

    /// Cancel everything. Returns the affected ids.
    pub fn cancel_all(&self, reason: &str, initiator: CancelInitiator) -> Vec<String> {
        let ids: Vec<String> = self.lock().keys().cloned().collect();
        ids.into_iter()
            .filter(|id| self.cancel_with(id, reason, initiator))
            .collect()
    }

    /// Active tasks, oldest first.
    pub fn get_active_tasks(&self) -> Vec<ActiveTaskInfo> {
        let active = self.lock();
        let mut entries: Vec<&ActiveTask> = active.values().collect();
        entries.sort_by_key(|entry| (entry.created_at, entry.seq));
        entries.into_iter().map(ActiveTask::info).collect()
    }

    pub fn active_count(&self) -> usize {
        self.lock().len()
    }

    /// Wait until every active task has emitted its terminal envelope.
    pub async fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.active_count() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.active_count() == 0;
            }
        }
    }
}
