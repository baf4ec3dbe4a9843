//! Downstream task notifications.
//!
//! The router publishes one [`TaskNotification`] per observable change.
//! Consumers (the admin event stream, tests, embedding applications)
//! subscribe through [`BroadcastNotifier`].

use futures::Stream;
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;

use crate::protocol::payloads::CancelInitiator;

/// Something a user-facing surface would want to show.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskNotification {
    Started {
        task_id: String,
        agent_id: String,
    },
    /// Coalesced progress: the most recent messages, oldest first.
    Progress {
        task_id: String,
        agent_id: String,
        lines: Vec<String>,
        percent: Option<u8>,
        estimated_cost: Option<Decimal>,
        over_budget: bool,
    },
    Completed {
        task_id: String,
        agent_id: String,
        input_tokens: u64,
        output_tokens: u64,
        estimated_cost: Decimal,
        over_budget: bool,
        summary: Option<String>,
        output: Option<String>,
    },
    Failed {
        task_id: String,
        agent_id: String,
        error: String,
        code: String,
    },
    Cancelled {
        task_id: String,
        agent_id: String,
        reason: String,
        initiator: Option<CancelInitiator>,
    },
}

impl TaskNotification {
    pub fn task_id(&self) -> &str {
        match self {
            TaskNotification::Started { task_id, .. }
            | TaskNotification::Progress { task_id, .. }
            | TaskNotification::Completed { task_id, .. }
            | TaskNotification::Failed { task_id, .. }
            | TaskNotification::Cancelled { task_id, .. } => task_id,
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            TaskNotification::Started { .. } => "task_started",
            TaskNotification::Progress { .. } => "task_progress",
            TaskNotification::Completed { .. } => "task_completed",
            TaskNotification::Failed { .. } => "task_failed",
            TaskNotification::Cancelled { .. } => "task_cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskNotification::Completed { .. }
                | TaskNotification::Failed { .. }
                | TaskNotification::Cancelled { .. }
        )
    }
}

/// Sink for task notifications.
pub trait TaskNotifier: Send + Sync {
    fn notify(&self, notification: TaskNotification);
}

/// Fan-out to any number of subscribers. Slow subscribers miss events.
pub struct BroadcastNotifier {
    tx: broadcast::Sender<TaskNotification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaskNotification> {
        self.tx.subscribe()
    }

    /// Subscription as a stream, skipping anything lagged out.
    pub fn stream(&self) -> impl Stream<Item = TaskNotification> + Send + 'static + use<> {
        BroadcastStream::new(self.tx.subscribe()).filter_map(|result| result.ok())
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

impl TaskNotifier for BroadcastNotifier {
    fn notify(&self, notification: TaskNotification) {
        tracing::debug!(
            task_id = %notification.task_id(),
            event = notification.event_name(),
            "Task notification"
        );
        // No receivers is fine
        let _ = self.tx.send(notification);
    }
}
