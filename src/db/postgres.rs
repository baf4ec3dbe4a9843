//! PostgreSQL backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Config, Pool, Runtime};
use postgres_types::Json;
use tokio_postgres::{NoTls, Row};
use uuid::Uuid;

use crate::cloud::mailbox::OfflineQueueEntry;
use crate::config::DatabaseConfig;
use crate::db::Database;
use crate::error::DatabaseError;
use crate::protocol::EnvelopeType;
use crate::task::{Task, TaskStatus};

refinery::embed_migrations!("migrations");

const TASK_COLUMNS: &str = "id, project_id, agent_id, bot_name, command, prompt, status, \
     session_id, input_tokens, output_tokens, estimated_cost, max_budget, parent_task_id, \
     files_changed, commands_run, error_message, created_at, updated_at, completed_at";

const QUEUE_COLUMNS: &str =
    "id, seq, agent_id, message_type, payload, created_at, expires_at, delivered, delivered_at";

/// Database store for the cloud side.
pub struct Store {
    pool: Pool,
}

impl Store {
    /// Create a new store and connect to the database.
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let mut cfg = Config::new();
        cfg.url = Some(config.url().to_string());
        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: config.pool_size,
            ..Default::default()
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| DatabaseError::Pool(e.to_string()))?;

        // Test connection
        let _ = pool.get().await?;

        Ok(Self { pool })
    }

    /// Apply the embedded schema migrations.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let mut conn = self.conn().await?;
        let report = migrations::runner()
            .run_async(&mut **conn)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        for migration in report.applied_migrations() {
            tracing::info!(
                version = migration.version(),
                name = migration.name(),
                "Applied migration"
            );
        }
        Ok(())
    }

    pub async fn conn(&self) -> Result<deadpool_postgres::Object, DatabaseError> {
        Ok(self.pool.get().await?)
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Negative counters read back as zero.
fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

fn row_to_task(row: &Row) -> Result<Task, DatabaseError> {
    let status: String = row.try_get("status")?;
    let status: TaskStatus = status
        .parse()
        .map_err(|e| DatabaseError::Corrupt(format!("task status: {}", e)))?;
    let files_changed: Json<Vec<String>> = row.try_get("files_changed")?;
    let commands_run: Json<Vec<String>> = row.try_get("commands_run")?;

    Ok(Task {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        agent_id: row.try_get("agent_id")?,
        bot_name: row.try_get("bot_name")?,
        command: row.try_get("command")?,
        prompt: row.try_get("prompt")?,
        status,
        session_id: row.try_get("session_id")?,
        input_tokens: to_u64(row.try_get("input_tokens")?),
        output_tokens: to_u64(row.try_get("output_tokens")?),
        estimated_cost: row.try_get("estimated_cost")?,
        max_budget: row.try_get("max_budget")?,
        parent_task_id: row.try_get("parent_task_id")?,
        files_changed: files_changed.0,
        commands_run: commands_run.0,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn row_to_entry(row: &Row) -> Result<(i64, OfflineQueueEntry), DatabaseError> {
    let message_type: String = row.try_get("message_type")?;
    let message_type: EnvelopeType = message_type
        .parse()
        .map_err(|e| DatabaseError::Corrupt(format!("message type: {}", e)))?;

    let entry = OfflineQueueEntry {
        id: row.try_get("id")?,
        agent_id: row.try_get("agent_id")?,
        message_type,
        payload: row.try_get("payload")?,
        created_at: row.try_get("created_at")?,
        expires_at: row.try_get("expires_at")?,
        delivered: row.try_get("delivered")?,
        delivered_at: row.try_get("delivered_at")?,
    };
    Ok((row.try_get("seq")?, entry))
}

#[async_trait]
impl Database for Store {
    async fn create_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        let inserted = conn
            .execute(
                r#"
                INSERT INTO tasks (
                    id, project_id, agent_id, bot_name, command, prompt, status,
                    session_id, input_tokens, output_tokens, estimated_cost, max_budget,
                    parent_task_id, files_changed, commands_run, error_message,
                    created_at, updated_at, completed_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
                ON CONFLICT (id) DO NOTHING
                "#,
                &[
                    &task.id,
                    &task.project_id,
                    &task.agent_id,
                    &task.bot_name,
                    &task.command,
                    &task.prompt,
                    &task.status.as_str(),
                    &task.session_id,
                    &to_i64(task.input_tokens),
                    &to_i64(task.output_tokens),
                    &task.estimated_cost,
                    &task.max_budget,
                    &task.parent_task_id,
                    &Json(&task.files_changed),
                    &Json(&task.commands_run),
                    &task.error_message,
                    &task.created_at,
                    &task.updated_at,
                    &task.completed_at,
                ],
            )
            .await?;

        if inserted == 0 {
            return Err(DatabaseError::Conflict {
                entity: "task",
                id: task.id.clone(),
            });
        }
        Ok(())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>, DatabaseError> {
        let conn = self.conn().await?;
        let sql = format!("SELECT {} FROM tasks WHERE id = $1", TASK_COLUMNS);
        let row = conn.query_opt(sql.as_str(), &[&id]).await?;
        row.as_ref().map(row_to_task).transpose()
    }

    async fn update_task_if_status(
        &self,
        task: &Task,
        expected: TaskStatus,
    ) -> Result<bool, DatabaseError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                r#"
                UPDATE tasks SET
                    status = $2,
                    session_id = $3,
                    input_tokens = $4,
                    output_tokens = $5,
                    estimated_cost = $6,
                    files_changed = $7,
                    commands_run = $8,
                    error_message = $9,
                    updated_at = $10,
                    completed_at = $11
                WHERE id = $1 AND status = $12
                "#,
                &[
                    &task.id,
                    &task.status.as_str(),
                    &task.session_id,
                    &to_i64(task.input_tokens),
                    &to_i64(task.output_tokens),
                    &task.estimated_cost,
                    &Json(&task.files_changed),
                    &Json(&task.commands_run),
                    &task.error_message,
                    &task.updated_at,
                    &task.completed_at,
                    &expected.as_str(),
                ],
            )
            .await?;
        Ok(updated == 1)
    }

    async fn list_tasks_for_agent(
        &self,
        agent_id: &str,
        limit: usize,
    ) -> Result<Vec<Task>, DatabaseError> {
        let conn = self.conn().await?;
        let sql = format!(
            "SELECT {} FROM tasks WHERE agent_id = $1 ORDER BY created_at DESC LIMIT $2",
            TASK_COLUMNS
        );
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = conn.query(sql.as_str(), &[&agent_id, &limit]).await?;
        rows.iter().map(row_to_task).collect()
    }

    async fn enqueue_message(&self, entry: &OfflineQueueEntry) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.execute(
            r#"
            INSERT INTO offline_queue (id, agent_id, message_type, payload, created_at, expires_at, delivered, delivered_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
            &[
                &entry.id,
                &entry.agent_id,
                &entry.message_type.as_str(),
                &entry.payload,
                &entry.created_at,
                &entry.expires_at,
                &entry.delivered,
                &entry.delivered_at,
            ],
        )
        .await?;
        Ok(())
    }

    async fn claim_pending_messages(
        &self,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<OfflineQueueEntry>, DatabaseError> {
        let conn = self.conn().await?;
        // SKIP LOCKED keeps two concurrent drains from claiming the same row.
        let sql = format!(
            r#"
            UPDATE offline_queue SET delivered = TRUE, delivered_at = $2
            WHERE id IN (
                SELECT id FROM offline_queue
                WHERE agent_id = $1 AND NOT delivered AND expires_at > $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {}
            "#,
            QUEUE_COLUMNS
        );
        let rows = conn.query(sql.as_str(), &[&agent_id, &now]).await?;

        // RETURNING carries no ordering guarantee.
        let mut claimed = rows
            .iter()
            .map(row_to_entry)
            .collect::<Result<Vec<_>, _>>()?;
        claimed.sort_by(|(a_seq, a), (b_seq, b)| {
            a.created_at.cmp(&b.created_at).then(a_seq.cmp(b_seq))
        });
        Ok(claimed.into_iter().map(|(_, entry)| entry).collect())
    }

    async fn release_message(&self, id: Uuid) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        let updated = conn
            .execute(
                "UPDATE offline_queue SET delivered = FALSE, delivered_at = NULL WHERE id = $1",
                &[&id],
            )
            .await?;
        if updated == 0 {
            return Err(DatabaseError::NotFound {
                entity: "offline message",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn pending_message_count(
        &self,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, DatabaseError> {
        let conn = self.conn().await?;
        let row = conn
            .query_one(
                "SELECT COUNT(*) AS pending FROM offline_queue \
                 WHERE agent_id = $1 AND NOT delivered AND expires_at > $2",
                &[&agent_id, &now],
            )
            .await?;
        let pending: i64 = row.try_get("pending")?;
        Ok(usize::try_from(pending).unwrap_or(0))
    }

    async fn purge_expired_messages(&self, now: DateTime<Utc>) -> Result<u64, DatabaseError> {
        let conn = self.conn().await?;
        let removed = conn
            .execute("DELETE FROM offline_queue WHERE expires_at <= $1", &[&now])
            .await?;
        Ok(removed)
    }
}
