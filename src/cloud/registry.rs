//! Registry of live agent connections.
//!
//! Exactly one [`AgentConnection`] exists per agent id. A newly
//! authenticated connection replaces the old record and the old socket is
//! told to close with [`close_code::SUPERSEDED`]. Removal is keyed on the
//! connection id so a superseded socket cannot unregister its successor.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::cloud::auth::AgentKeyStore;
use crate::protocol::payloads::{AgentStatus, AgentStatusReport};
use crate::protocol::{Envelope, close_code};

/// Frames queued for a connection's writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Envelope(Envelope),
    Close { code: u16, reason: String },
}

/// Cloud-side view of a live peer. May lag the agent's real state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConnection {
    pub agent_id: String,
    pub connection_id: Uuid,
    pub status: AgentStatus,
    pub version: String,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub active_task_ids: BTreeSet<String>,
}

struct Entry {
    info: AgentConnection,
    sender: mpsc::UnboundedSender<Outbound>,
}

impl Entry {
    fn refresh_status(&mut self) {
        if self.info.status != AgentStatus::Offline {
            self.info.status = if self.info.active_task_ids.is_empty() {
                AgentStatus::Online
            } else {
                AgentStatus::Busy
            };
        }
    }
}

/// Agent registry. Shared by every connection context and the dispatcher.
pub struct AgentRegistry {
    keys: AgentKeyStore,
    agents: RwLock<HashMap<String, Entry>>,
}

impl AgentRegistry {
    pub fn new(keys: AgentKeyStore) -> Self {
        Self {
            keys,
            agents: RwLock::new(HashMap::new()),
        }
    }

    /// Check an agent's credentials.
    pub fn authenticate(&self, agent_id: &str, api_key: &str) -> bool {
        self.keys.validate(agent_id, api_key)
    }

    /// Record a newly authenticated connection. Returns the record and the
    /// receiver the connection's writer drains.
    pub async fn register(
        &self,
        agent_id: &str,
        version: &str,
    ) -> (AgentConnection, mpsc::UnboundedReceiver<Outbound>) {
        let now = Utc::now();
        let (sender, receiver) = mpsc::unbounded_channel();
        let info = AgentConnection {
            agent_id: agent_id.to_string(),
            connection_id: Uuid::new_v4(),
            status: AgentStatus::Online,
            version: version.to_string(),
            connected_at: now,
            last_heartbeat_at: now,
            active_task_ids: BTreeSet::new(),
        };

        let previous = self.agents.write().await.insert(
            agent_id.to_string(),
            Entry {
                info: info.clone(),
                sender,
            },
        );

        if let Some(old) = previous {
            tracing::info!(
                agent_id = %agent_id,
                old_connection = %old.info.connection_id,
                "Superseding existing connection"
            );
            let _ = old.sender.send(Outbound::Close {
                code: close_code::SUPERSEDED,
                reason: "superseded by a newer connection".to_string(),
            });
        }
        tracing::info!(agent_id = %agent_id, connection_id = %info.connection_id, "Agent registered");
        (info, receiver)
    }

    /// Remove the record if it still belongs to `connection_id`.
    pub async fn unregister(&self, agent_id: &str, connection_id: Uuid) -> bool {
        let mut agents = self.agents.write().await;
        match agents.get(agent_id) {
            Some(entry) if entry.info.connection_id == connection_id => {
                agents.remove(agent_id);
                tracing::info!(agent_id = %agent_id, "Agent unregistered");
                true
            }
            _ => false,
        }
    }

    pub async fn get_agent(&self, agent_id: &str) -> Option<AgentConnection> {
        self.agents
            .read()
            .await
            .get(agent_id)
            .map(|entry| entry.info.clone())
    }

    /// Every live record, sorted by agent id.
    pub async fn list_agents(&self) -> Vec<AgentConnection> {
        let mut agents: Vec<AgentConnection> = self
            .agents
            .read()
            .await
            .values()
            .map(|entry| entry.info.clone())
            .collect();
        agents.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        agents
    }

    /// Ids of agents with a live connection, sorted.
    pub async fn get_connected_agent_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .agents
            .read()
            .await
            .values()
            .filter(|entry| entry.info.status != AgentStatus::Offline)
            .map(|entry| entry.info.agent_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn is_connected(&self, agent_id: &str) -> bool {
        self.agents
            .read()
            .await
            .get(agent_id)
            .is_some_and(|entry| entry.info.status != AgentStatus::Offline && !entry.sender.is_closed())
    }

    /// Hand an envelope to the agent's writer. False if the agent is
    /// unknown or its connection is gone; the caller decides on fallback.
    pub async fn send(&self, agent_id: &str, envelope: Envelope) -> bool {
        let agents = self.agents.read().await;
        let Some(entry) = agents.get(agent_id) else {
            return false;
        };
        if entry.info.status == AgentStatus::Offline {
            return false;
        }
        let kind = envelope.kind();
        let sent = entry.sender.send(Outbound::Envelope(envelope)).is_ok();
        if sent {
            tracing::debug!(agent_id = %agent_id, kind = %kind, "Queued envelope for agent");
        }
        sent
    }

    /// Ask a specific connection to close.
    pub async fn close(&self, agent_id: &str, connection_id: Uuid, code: u16, reason: &str) -> bool {
        let mut agents = self.agents.write().await;
        match agents.get_mut(agent_id) {
            Some(entry) if entry.info.connection_id == connection_id => {
                entry.info.status = AgentStatus::Offline;
                entry
                    .sender
                    .send(Outbound::Close {
                        code,
                        reason: reason.to_string(),
                    })
                    .is_ok()
            }
            _ => false,
        }
    }

    /// Any inbound traffic counts as a heartbeat.
    pub async fn record_heartbeat(&self, agent_id: &str, connection_id: Uuid) {
        let mut agents = self.agents.write().await;
        if let Some(entry) = agents.get_mut(agent_id)
            && entry.info.connection_id == connection_id
        {
            entry.info.last_heartbeat_at = Utc::now();
        }
    }

    /// Apply an `agent:status` self-report.
    pub async fn apply_status(&self, agent_id: &str, report: &AgentStatusReport) {
        let mut agents = self.agents.write().await;
        if let Some(entry) = agents.get_mut(agent_id) {
            entry.info.active_task_ids = report.active_task_ids.iter().cloned().collect();
            entry.info.status = match report.status {
                AgentStatus::Offline => AgentStatus::Offline,
                _ => AgentStatus::Online,
            };
            entry.refresh_status();
        }
    }

    pub async fn track_task(&self, agent_id: &str, task_id: &str) {
        let mut agents = self.agents.write().await;
        if let Some(entry) = agents.get_mut(agent_id) {
            entry.info.active_task_ids.insert(task_id.to_string());
            entry.refresh_status();
        }
    }

    pub async fn release_task(&self, agent_id: &str, task_id: &str) {
        let mut agents = self.agents.write().await;
        if let Some(entry) = agents.get_mut(agent_id) {
            entry.info.active_task_ids.remove(task_id);
            entry.refresh_status();
        }
    }

    /// Connections silent for longer than `timeout`.
    pub async fn stale_agents(&self, timeout: Duration) -> Vec<(String, Uuid)> {
        let now = Utc::now();
        self.agents
            .read()
            .await
            .values()
            .filter(|entry| {
                (now - entry.info.last_heartbeat_at)
                    .to_std()
                    .is_ok_and(|silence| silence > timeout)
            })
            .map(|entry| (entry.info.agent_id.clone(), entry.info.connection_id))
            .collect()
    }
}
