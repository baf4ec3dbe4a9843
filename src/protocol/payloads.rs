//! Typed payloads for each envelope kind.
//!
//! All payloads are camelCase on the wire.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::agent::resources::ResourceStatus;

/// `auth:request`: first frame sent by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub agent_id: String,
    pub api_key: String,
    pub version: String,
}

/// `auth:response`: the coordinator's verdict on an auth request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuthResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(reason.into()),
        }
    }
}

/// `heartbeat:ping`, sent by either side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPing {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_time: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_time: Option<i64>,
}

/// `task:submit`: a unit of work for a specific agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSubmit {
    pub task_id: String,
    pub project_id: String,
    pub bot_name: String,
    pub command: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_budget: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

/// `task:ack`: admission verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskAck {
    pub task_id: String,
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// `task:progress`: a human-readable progress line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskProgress {
    pub task_id: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_cost: Option<Decimal>,
}

/// `task:stream`: raw output from the execution engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskStream {
    pub task_id: String,
    pub chunk: String,
}

/// `task:complete`: terminal success with metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskComplete {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub estimated_cost: Decimal,
    #[serde(default)]
    pub files_changed: Vec<String>,
    #[serde(default)]
    pub commands_run: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// `task:error`: terminal failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskErrorPayload {
    pub task_id: String,
    pub error: String,
    #[serde(default = "default_error_code")]
    pub code: String,
}

fn default_error_code() -> String {
    "execution_failed".to_string()
}

/// `task:cancel`: cloud asks the agent to stop a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCancel {
    pub task_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Who asked for a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelInitiator {
    User,
    Resource,
    Shutdown,
}

impl CancelInitiator {
    pub fn as_str(&self) -> &'static str {
        match self {
            CancelInitiator::User => "user",
            CancelInitiator::Resource => "resource",
            CancelInitiator::Shutdown => "shutdown",
        }
    }
}

/// `task:cancelled`: terminal cancellation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCancelled {
    pub task_id: String,
    pub reason: String,
    pub initiator: CancelInitiator,
}

/// Agent availability as seen on the wire and in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Online,
    Busy,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Online => "online",
            AgentStatus::Busy => "busy",
            AgentStatus::Offline => "offline",
        }
    }
}

/// `agent:status`: periodic self-report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatusReport {
    pub status: AgentStatus,
    #[serde(default)]
    pub active_task_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceStatus>,
}

/// `deploy:request`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    pub deploy_id: String,
    pub project_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

/// `deploy:result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployResult {
    pub deploy_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `path:validate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathValidateRequest {
    pub request_id: String,
    pub path: String,
}

/// `path:validate:result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathValidateResult {
    pub request_id: String,
    pub path: String,
    pub exists: bool,
    pub is_directory: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `env:update`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvUpdateRequest {
    pub request_id: String,
    #[serde(default)]
    pub set: HashMap<String, String>,
    #[serde(default)]
    pub remove: Vec<String>,
}

/// `env:update:result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvUpdateResult {
    pub request_id: String,
    pub success: bool,
    #[serde(default)]
    pub applied: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `system:shutdown` / `system:restart`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemCommand {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Envelope, EnvelopeType};
    use pretty_assertions::assert_eq;
    use rust_decimal_macros::dec;
    use serde_json::json;

    #[test]
    fn test_auth_request_is_camel_case() {
        let req = AuthRequest {
            agent_id: "agent-a".to_string(),
            api_key: "k".to_string(),
            version: "1".to_string(),
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["agentId"], "agent-a");
        assert_eq!(value["apiKey"], "k");
    }

    #[test]
    fn test_task_complete_defaults_missing_metrics() {
        let env = Envelope::new(EnvelopeType::TaskComplete, json!({"taskId": "t1"}));
        let complete: TaskComplete = env.payload_as().unwrap();
        assert_eq!(complete.task_id, "t1");
        assert_eq!(complete.input_tokens, 0);
        assert_eq!(complete.estimated_cost, Decimal::ZERO);
        assert!(complete.files_changed.is_empty());
    }

    #[test]
    fn test_task_submit_decodes_budget() {
        let env = Envelope::new(
            EnvelopeType::TaskSubmit,
            json!({
                "taskId": "t1",
                "projectId": "p1",
                "botName": "builder",
                "command": "code",
                "prompt": "fix the tests",
                "maxBudget": "2.50"
            }),
        );
        let submit: TaskSubmit = env.payload_as().unwrap();
        assert_eq!(submit.max_budget, Some(dec!(2.50)));
        assert!(submit.parent_task_id.is_none());
    }

    #[test]
    fn test_payload_mismatch_reports_kind() {
        let env = Envelope::new(EnvelopeType::TaskAck, json!({"accepted": true}));
        let err = env.payload_as::<TaskAck>().unwrap_err();
        assert!(err.to_string().contains("task:ack"));
    }

    #[test]
    fn test_task_error_default_code() {
        let env = Envelope::new(
            EnvelopeType::TaskError,
            json!({"taskId": "t1", "error": "boom"}),
        );
        let payload: TaskErrorPayload = env.payload_as().unwrap();
        assert_eq!(payload.code, "execution_failed");
    }

    #[test]
    fn test_cancel_initiator_wire_names() {
        let value = serde_json::to_value(CancelInitiator::Resource).unwrap();
        assert_eq!(value, json!("resource"));
        assert_eq!(CancelInitiator::User.as_str(), "user");
    }
}
