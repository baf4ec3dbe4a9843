//! Task record and lifecycle.
//!
//! ```text
//! pending ──▶ queued ──▶ running ──▶ completed
//!    │          │           │  ├───▶ failed
//!    └──────────┴───────────┴──┴───▶ cancelled
//! ```
//!
//! Transitions only move forward. The three end states are terminal.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// True once no further mutation is permitted.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    fn rank(&self) -> u8 {
        match self {
            TaskStatus::Pending => 0,
            TaskStatus::Queued => 1,
            TaskStatus::Running => 2,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => 3,
        }
    }

    /// Whether `next` is a legal forward move from `self`.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "queued" => Ok(TaskStatus::Queued),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => Err(format!("unknown task status '{}'", s)),
        }
    }
}

/// A unit of work, owned by one project and assigned to one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub project_id: String,
    pub agent_id: String,
    pub bot_name: String,
    pub command: String,
    pub prompt: String,
    pub status: TaskStatus,
    pub session_id: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub estimated_cost: Decimal,
    pub max_budget: Option<Decimal>,
    /// Non-owning back-reference grouping decomposed subtasks.
    pub parent_task_id: Option<String>,
    pub files_changed: Vec<String>,
    pub commands_run: Vec<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields a caller supplies when creating a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTask {
    pub project_id: String,
    pub agent_id: String,
    pub bot_name: String,
    pub command: String,
    pub prompt: String,
    #[serde(default)]
    pub max_budget: Option<Decimal>,
    #[serde(default)]
    pub parent_task_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl Task {
    /// Create a pending task with a fresh id.
    pub fn new(new: NewTask) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: new.project_id,
            agent_id: new.agent_id,
            bot_name: new.bot_name,
            command: new.command,
            prompt: new.prompt,
            status: TaskStatus::Pending,
            session_id: new.session_id,
            input_tokens: 0,
            output_tokens: 0,
            estimated_cost: Decimal::ZERO,
            max_budget: new.max_budget,
            parent_task_id: new.parent_task_id,
            files_changed: Vec::new(),
            commands_run: Vec::new(),
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Move to `next`, stamping timestamps. Returns false (and leaves the
    /// record untouched) if the move is not a legal forward transition.
    pub fn transition(&mut self, next: TaskStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        let now = Utc::now();
        self.status = next;
        self.updated_at = now;
        if next.is_terminal() {
            self.completed_at = Some(now);
        }
        true
    }

    /// True if a cost budget is set and the estimate exceeds it.
    pub fn is_over_budget(&self) -> bool {
        self.max_budget
            .is_some_and(|budget| self.estimated_cost > budget)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample() -> Task {
        Task::new(NewTask {
            project_id: "p1".to_string(),
            agent_id: "agent-a".to_string(),
            bot_name: "builder".to_string(),
            command: "code".to_string(),
            prompt: "add a test".to_string(),
            max_budget: Some(dec!(1.00)),
            parent_task_id: None,
            session_id: None,
        })
    }

    #[test]
    fn test_forward_transitions() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Queued));
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Cancelled));
    }

    #[test]
    fn test_no_backwards_or_repeat_transitions() {
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Queued));
        assert!(!TaskStatus::Running.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Pending));
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            assert!(terminal.is_terminal());
            for next in [
                TaskStatus::Pending,
                TaskStatus::Queued,
                TaskStatus::Running,
                TaskStatus::Completed,
                TaskStatus::Failed,
                TaskStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_transition_stamps_completion() {
        let mut task = sample();
        assert!(task.transition(TaskStatus::Running));
        assert!(task.completed_at.is_none());
        assert!(task.transition(TaskStatus::Failed));
        assert!(task.completed_at.is_some());

        let snapshot = task.clone();
        assert!(!task.transition(TaskStatus::Completed));
        assert_eq!(task, snapshot);
    }

    #[test]
    fn test_over_budget() {
        let mut task = sample();
        task.estimated_cost = dec!(0.99);
        assert!(!task.is_over_budget());
        task.estimated_cost = dec!(1.01);
        assert!(task.is_over_budget());
        task.max_budget = None;
        assert!(!task.is_over_budget());
    }

    #[test]
    fn test_status_parse() {
        assert_eq!("running".parse::<TaskStatus>(), Ok(TaskStatus::Running));
        assert!("done".parse::<TaskStatus>().is_err());
    }
}
