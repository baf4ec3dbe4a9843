//! Error types for every fleetlink concern.
//!
//! Each subsystem owns one enum. Library code propagates these with `?`;
//! only the binary collapses them into `anyhow::Error`.

use std::time::Duration;

/// Configuration loading and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required variable is not set.
    #[error("Missing required setting: {key}")]
    Missing { key: String },

    /// A variable is set but cannot be parsed.
    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

/// Envelope encoding/decoding errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The frame is not a valid envelope.
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The envelope payload does not match the expected shape for its type.
    #[error("Invalid {kind} payload: {reason}")]
    InvalidPayload { kind: &'static str, reason: String },
}

/// Agent-side connection errors. Never surfaced past the connection manager.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Transport could not be opened or was dropped.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The coordinator rejected our credentials.
    #[error("Authentication rejected: {reason}")]
    AuthRejected { reason: String },

    /// No auth response arrived in time.
    #[error("Authentication timed out after {0:?}")]
    AuthTimeout(Duration),

    /// The remote side closed the connection.
    #[error("Connection closed by remote: {reason}")]
    RemoteClosed { reason: String },

    /// The manager was closed by its owner.
    #[error("Connection manager closed")]
    Closed,

    /// A frame from the coordinator could not be decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl From<tokio_tungstenite::tungstenite::Error> for ConnectionError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ConnectionError::Transport(e.to_string())
    }
}

/// Task admission rejections reported synchronously to the submitter.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdmissionError {
    /// The resource monitor is refusing new work.
    #[error("Admission rejected: {cause}")]
    ResourcesExhausted { cause: String },

    /// Max concurrency reached.
    #[error("Admission rejected: concurrency limit of {limit} reached")]
    ConcurrencyLimit { limit: usize },

    /// A task with this id is already active on this agent.
    #[error("Task {task_id} is already active")]
    Duplicate { task_id: String },
}

impl AdmissionError {
    /// Stable machine-readable code for task:error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            AdmissionError::ResourcesExhausted { .. } => "admission_rejected",
            AdmissionError::ConcurrencyLimit { .. } => "admission_rejected",
            AdmissionError::Duplicate { .. } => "duplicate_task",
        }
    }
}

/// Failures reported by the external execution engine.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// The engine process could not be started.
    #[error("Failed to spawn executor: {reason}")]
    SpawnFailed { reason: String },

    /// The engine ran but reported failure.
    #[error("Execution failed: {reason}")]
    Failed { reason: String },

    /// The task exceeded its time allowance.
    #[error("Execution timed out after {0:?}")]
    Timeout(Duration),

    /// The run was interrupted through its cancellation token.
    #[error("Execution cancelled")]
    Cancelled,

    /// I/O error while talking to the engine.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// Could not create or check out a pooled connection.
    #[error("Connection pool error: {0}")]
    Pool(String),

    /// Query failed.
    #[error("Query failed: {0}")]
    Query(#[from] tokio_postgres::Error),

    /// Schema migration failed.
    #[error("Migration failed: {0}")]
    Migration(String),

    /// A stored value could not be decoded.
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// A record that must exist was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A record with the same key already exists.
    #[error("{entity} already exists: {id}")]
    Conflict { entity: &'static str, id: String },
}

impl From<deadpool_postgres::PoolError> for DatabaseError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        DatabaseError::Pool(e.to_string())
    }
}

/// Cloud-side dispatch errors.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The target agent has no live connection.
    #[error("Agent {agent_id} is not connected")]
    AgentOffline { agent_id: String },

    /// Unknown task id.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Task already reached a terminal state.
    #[error("Task {task_id} is already {status}")]
    AlreadyTerminal { task_id: String, status: String },

    /// The agent did not answer a request in time.
    #[error("No reply to request {request_id} within {timeout:?}")]
    ReplyTimeout { request_id: String, timeout: Duration },

    /// The agent's reply could not be decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Persistence failure.
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Cloud server startup errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind the listener.
    #[error("Failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
