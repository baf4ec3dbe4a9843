//! Persistence for tasks and the offline mailbox.
//!
//! [`postgres::Store`] is the production backend. [`memory::InMemoryStore`]
//! backs single-process deployments without a database and the test suites.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::cloud::mailbox::OfflineQueueEntry;
use crate::error::DatabaseError;
use crate::task::{Task, TaskStatus};

pub use memory::InMemoryStore;
pub use postgres::Store;

/// Database abstraction layer.
#[async_trait]
pub trait Database: Send + Sync {
    // --- Tasks ---

    /// Insert a new task. Fails with `Conflict` when the id already exists.
    async fn create_task(&self, task: &Task) -> Result<(), DatabaseError>;

    async fn get_task(&self, id: &str) -> Result<Option<Task>, DatabaseError>;

    /// Overwrite the stored task only while its status still equals
    /// `expected`. Returns whether the write happened.
    async fn update_task_if_status(
        &self,
        task: &Task,
        expected: TaskStatus,
    ) -> Result<bool, DatabaseError>;

    /// Most recent tasks for an agent, newest first.
    async fn list_tasks_for_agent(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<Task>, DatabaseError>;

    // --- Offline mailbox ---

    async fn enqueue_message(&self, entry: &OfflineQueueEntry) -> Result<(), DatabaseError>;

    /// Mark every undelivered entry for the agent that has not expired at
    /// `now` as delivered and return them in creation order.
    async fn claim_pending_messages(
        &self,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<OfflineQueueEntry>, DatabaseError>;

    /// Undo a claim so the entry is delivered on the next drain.
    async fn release_message(&self, id: Uuid) -> Result<(), DatabaseError>;

    async fn pending_message_count(
        &self,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, DatabaseError>;

    /// Delete every entry whose expiry is at or before `now`.
    async fn purge_expired_messages(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError>;
}
