//! Process-local backend. State is lost on restart.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::cloud::mailbox::OfflineQueueEntry;
use crate::db::Database;
use crate::error::DatabaseError;
use crate::task::{Task, TaskStatus};

/// In-memory [`Database`].
#[derive(Default)]
pub struct InMemoryStore {
    tasks: RwLock<HashMap<String, Task>>,
    /// Kept in insertion order, which is creation order.
    queue: RwLock<Vec<OfflineQueueEntry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Database for InMemoryStore {
    async fn create_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(DatabaseError::Conflict {
                entity: "task",
                id: task.id.clone(),
            });
        }
        tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, DatabaseError> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn update_task_if_status(
        &self,
        task: &Task,
        expected: TaskStatus,
    ) -> Result<bool, DatabaseError> {
        let mut tasks = self.tasks.write().await;
        match tasks.get_mut(&task.id) {
            Some(stored) if stored.status == expected => {
                *stored = task.clone();
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(DatabaseError::NotFound {
                entity: "task",
                id: task.id.clone(),
            }),
        }
    }

    async fn list_tasks_for_agent(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<Task>, DatabaseError> {
        let tasks = self.tasks.read().await;
        let mut matching: Vec<Task> = tasks
            .values()
            .filter(|t| t.agent_id == agent_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn enqueue_message(&self, entry: &OfflineQueueEntry) -> Result<(), DatabaseError> {
        let mut queue = self.queue.write().await;
        if queue.iter().any(|e| e.id == entry.id) {
            return Err(DatabaseError::Conflict {
                entity: "offline message",
                id: entry.id.to_string(),
            });
        }
        queue.push(entry.clone());
        Ok(())
    }

    async fn claim_pending_messages(
        &self,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<OfflineQueueEntry>, DatabaseError> {
        let mut queue = self.queue.write().await;
        let mut claimed = Vec::new();
        for entry in queue.iter_mut() {
            if entry.agent_id == agent_id && !entry.delivered && !entry.is_expired(now) {
                entry.delivered = true;
                entry.delivered_at = Some(now);
                claimed.push(entry.clone());
            }
        }
        claimed.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(claimed)
    }

    async fn release_message(&self, id: Uuid) -> Result<(), DatabaseError> {
        let mut queue = self.queue.write().await;
        let entry = queue
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "offline message",
                id: id.to_string(),
            })?;
        entry.delivered = false;
        entry.delivered_at = None;
        Ok(())
    }

    async fn pending_message_count(
        &self,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, DatabaseError> {
        let queue = self.queue.read().await;
        Ok(queue
            .iter()
            .filter(|e| e.agent_id == agent_id && !e.delivered && !e.is_expired(now))
            .count())
    }

    async fn purge_expired_messages(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let mut queue = self.queue.write().await;
        let before = queue.len();
        queue.retain(|e| !e.is_expired(now));
        Ok((before - queue.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::NewTask;

    fn task(id: &str) -> Task {
        let mut task = Task::new(NewTask {
            project_id: "proj".to_string(),
            agent_id: "agent-a".to_string(),
            bot_name: "builder".to_string(),
            command: "run".to_string(),
            prompt: "do it".to_string(),
            max_budget: None,
            parent_task_id: None,
            session_id: None,
        });
        task.id = id.to_string();
        task
    }

    #[tokio::test]
    async fn test_create_conflict() {
        let store = InMemoryStore::new();
        store.create_task(&task("t1")).await.unwrap();
        let err = store.create_task(&task("t1")).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict { .. }));
    }

    #[tokio::test]
    async fn test_update_if_status_is_compare_and_set() {
        let store = InMemoryStore::new();
        let original = task("t1");
        store.create_task(&original).await.unwrap();

        let mut running = original.clone();
        assert!(running.transition(TaskStatus::Queued));
        assert!(
            store
                .update_task_if_status(&running, TaskStatus::Pending)
                .await
                .unwrap()
        );

        // Stale expectation loses.
        let mut failed = original.clone();
        failed.status = TaskStatus::Failed;
        assert!(
            !store
                .update_task_if_status(&failed, TaskStatus::Pending)
                .await
                .unwrap()
        );
        let stored = store.get_task("t1").await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn test_update_missing_task() {
        let store = InMemoryStore::new();
        let err = store
            .update_task_if_status(&task("ghost"), TaskStatus::Pending)
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_list_tasks_newest_first() {
        let store = InMemoryStore::new();
        let mut older = task("old");
        older.created_at = Utc::now() - chrono::Duration::minutes(5);
        store.create_task(&older).await.unwrap();
        store.create_task(&task("new")).await.unwrap();

        let listed = store.list_tasks_for_agent("agent-a", 10).await.unwrap();
        let ids: Vec<_> = listed.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "old"]);
        assert_eq!(store.list_tasks_for_agent("agent-a", 1).await.unwrap().len(), 1);
        assert!(store.list_tasks_for_agent("agent-b", 10).await.unwrap().is_empty());
    }
}
