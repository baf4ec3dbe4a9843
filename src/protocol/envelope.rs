//! The envelope: the unit of transport between agents and the cloud.
//!
//! Wire format is a JSON text frame:
//!
//! ```text
//! { "id": "...", "type": "task:progress", "payload": { ... }, "timestamp": 1700000000000 }
//! ```

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProtocolError;

/// Protocol version announced in `auth:request`.
pub const PROTOCOL_VERSION: &str = "1";

/// Close codes used on the WebSocket transport.
pub mod close_code {
    /// Normal shutdown.
    pub const NORMAL: u16 = 1000;
    /// Another connection for the same agent took over.
    pub const SUPERSEDED: u16 = 4000;
    /// Authentication was rejected.
    pub const AUTH_FAILED: u16 = 4001;
    /// The peer stopped sending heartbeats.
    pub const HEARTBEAT_TIMEOUT: u16 = 4002;
    /// Handshake did not start with a valid auth request.
    pub const PROTOCOL_VIOLATION: u16 = 4003;
}

/// Closed set of envelope kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EnvelopeType {
    #[serde(rename = "auth:request")]
    AuthRequest,
    #[serde(rename = "auth:response")]
    AuthResponse,
    #[serde(rename = "heartbeat:ping")]
    HeartbeatPing,
    #[serde(rename = "task:submit")]
    TaskSubmit,
    #[serde(rename = "task:ack")]
    TaskAck,
    #[serde(rename = "task:progress")]
    TaskProgress,
    #[serde(rename = "task:stream")]
    TaskStream,
    #[serde(rename = "task:complete")]
    TaskComplete,
    #[serde(rename = "task:error")]
    TaskError,
    #[serde(rename = "task:cancel")]
    TaskCancel,
    #[serde(rename = "task:cancelled")]
    TaskCancelled,
    #[serde(rename = "agent:status")]
    AgentStatus,
    #[serde(rename = "deploy:request")]
    DeployRequest,
    #[serde(rename = "deploy:result")]
    DeployResult,
    #[serde(rename = "path:validate")]
    PathValidateRequest,
    #[serde(rename = "path:validate:result")]
    PathValidateResult,
    #[serde(rename = "env:update")]
    EnvUpdateRequest,
    #[serde(rename = "env:update:result")]
    EnvUpdateResult,
    #[serde(rename = "system:shutdown")]
    SystemShutdown,
    #[serde(rename = "system:restart")]
    SystemRestart,
}

impl EnvelopeType {
    /// All kinds, in declaration order.
    pub const ALL: [EnvelopeType; 20] = [
        EnvelopeType::AuthRequest,
        EnvelopeType::AuthResponse,
        EnvelopeType::HeartbeatPing,
        EnvelopeType::TaskSubmit,
        EnvelopeType::TaskAck,
        EnvelopeType::TaskProgress,
        EnvelopeType::TaskStream,
        EnvelopeType::TaskComplete,
        EnvelopeType::TaskError,
        EnvelopeType::TaskCancel,
        EnvelopeType::TaskCancelled,
        EnvelopeType::AgentStatus,
        EnvelopeType::DeployRequest,
        EnvelopeType::DeployResult,
        EnvelopeType::PathValidateRequest,
        EnvelopeType::PathValidateResult,
        EnvelopeType::EnvUpdateRequest,
        EnvelopeType::EnvUpdateResult,
        EnvelopeType::SystemShutdown,
        EnvelopeType::SystemRestart,
    ];

    /// Wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeType::AuthRequest => "auth:request",
            EnvelopeType::AuthResponse => "auth:response",
            EnvelopeType::HeartbeatPing => "heartbeat:ping",
            EnvelopeType::TaskSubmit => "task:submit",
            EnvelopeType::TaskAck => "task:ack",
            EnvelopeType::TaskProgress => "task:progress",
            EnvelopeType::TaskStream => "task:stream",
            EnvelopeType::TaskComplete => "task:complete",
            EnvelopeType::TaskError => "task:error",
            EnvelopeType::TaskCancel => "task:cancel",
            EnvelopeType::TaskCancelled => "task:cancelled",
            EnvelopeType::AgentStatus => "agent:status",
            EnvelopeType::DeployRequest => "deploy:request",
            EnvelopeType::DeployResult => "deploy:result",
            EnvelopeType::PathValidateRequest => "path:validate",
            EnvelopeType::PathValidateResult => "path:validate:result",
            EnvelopeType::EnvUpdateRequest => "env:update",
            EnvelopeType::EnvUpdateResult => "env:update:result",
            EnvelopeType::SystemShutdown => "system:shutdown",
            EnvelopeType::SystemRestart => "system:restart",
        }
    }
}

impl std::fmt::Display for EnvelopeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EnvelopeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EnvelopeType::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| format!("unknown envelope type '{}'", s))
    }
}

/// An immutable, typed message.
///
/// Fields are private; construct through [`Envelope::new`] or
/// [`Envelope::with_payload`] and read through accessors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    id: String,
    #[serde(rename = "type")]
    kind: EnvelopeType,
    #[serde(default)]
    payload: serde_json::Value,
    timestamp: i64,
}

impl Envelope {
    /// Create an envelope with a fresh id and the current timestamp.
    pub fn new(kind: EnvelopeType, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            payload,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Create an envelope from a typed payload.
    pub fn with_payload<T: Serialize>(kind: EnvelopeType, payload: &T) -> Self {
        let value = serde_json::to_value(payload).unwrap_or(serde_json::Value::Null);
        Self::new(kind, value)
    }

    /// Rebuild an envelope from stored parts (offline mailbox redelivery).
    pub fn from_parts(
        id: impl Into<String>,
        kind: EnvelopeType,
        payload: serde_json::Value,
        timestamp: i64,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            payload,
            timestamp,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> EnvelopeType {
        self.kind
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    /// Creation instant in milliseconds since the Unix epoch.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Decode the payload into its typed form.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(self.payload.clone()).map_err(|e| ProtocolError::InvalidPayload {
            kind: self.kind.as_str(),
            reason: e.to_string(),
        })
    }

    /// Task id carried in the payload, if any.
    pub fn task_id(&self) -> Option<&str> {
        self.payload.get("taskId").and_then(|v| v.as_str())
    }

    /// Serialize to a text frame.
    pub fn encode(&self) -> String {
        // Serializing a Value-backed struct cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse a text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}
