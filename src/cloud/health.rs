//! Per-agent health derived from rolling success/failure outcomes.
//!
//! The tracker owns no connection state. It only sees outcomes reported
//! by the dispatcher and router.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Tuning for [`HealthTracker`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthConfig {
    /// Outcomes kept per agent.
    pub window: usize,
    /// Below this many outcomes an agent is considered healthy.
    pub min_samples: usize,
    /// Minimum success ratio over the window.
    pub min_success_rate: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window: 20,
            min_samples: 3,
            min_success_rate: 0.5,
        }
    }
}

#[derive(Debug, Default)]
struct AgentHealth {
    outcomes: VecDeque<bool>,
    total_successes: u64,
    total_failures: u64,
    last_failure_at: Option<DateTime<Utc>>,
}

impl AgentHealth {
    fn success_rate(&self) -> Option<f64> {
        if self.outcomes.is_empty() {
            return None;
        }
        let ok = self.outcomes.iter().filter(|o| **o).count();
        Some(ok as f64 / self.outcomes.len() as f64)
    }
}

/// Health summary for one agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentHealthReport {
    pub agent_id: String,
    pub healthy: bool,
    pub success_rate: Option<f64>,
    pub window_size: usize,
    pub total_successes: u64,
    pub total_failures: u64,
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// Fleet-level health summary.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetHealthReport {
    pub healthy_agents: usize,
    pub unhealthy_agents: usize,
    pub agents: Vec<AgentHealthReport>,
}

/// Rolling outcome counts per agent.
pub struct HealthTracker {
    config: HealthConfig,
    agents: RwLock<HashMap<String, AgentHealth>>,
}

impl HealthTracker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            agents: RwLock::new(HashMap::new()),
        }
    }

    pub fn record_success(&self, agent_id: &str) {
        self.record(agent_id, true);
    }

    pub fn record_failure(&self, agent_id: &str) {
        self.record(agent_id, false);
    }

    fn record(&self, agent_id: &str, success: bool) {
        let mut agents = self
            .agents
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let health = agents.entry(agent_id.to_string()).or_default();
        health.outcomes.push_back(success);
        while health.outcomes.len() > self.config.window.max(1) {
            health.outcomes.pop_front();
        }
        if success {
            health.total_successes += 1;
        } else {
            health.total_failures += 1;
            health.last_failure_at = Some(Utc::now());
        }
    }

    /// Unknown agents and agents with too few samples are healthy.
    pub fn is_healthy(&self, agent_id: &str) -> bool {
        let agents = self
            .agents
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        agents
            .get(agent_id)
            .map(|health| self.judge(health))
            .unwrap_or(true)
    }

    fn judge(&self, health: &AgentHealth) -> bool {
        if health.outcomes.len() < self.config.min_samples {
            return true;
        }
        health
            .success_rate()
            .is_none_or(|rate| rate >= self.config.min_success_rate)
    }

    pub fn report(&self, agent_id: &str) -> Option<AgentHealthReport> {
        let agents = self
            .agents
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        agents
            .get(agent_id)
            .map(|health| self.build_report(agent_id, health))
    }

    fn build_report(&self, agent_id: &str, health: &AgentHealth) -> AgentHealthReport {
        AgentHealthReport {
            agent_id: agent_id.to_string(),
            healthy: self.judge(health),
            success_rate: health.success_rate(),
            window_size: health.outcomes.len(),
            total_successes: health.total_successes,
            total_failures: health.total_failures,
            last_failure_at: health.last_failure_at,
        }
    }

    /// Summary over every agent seen so far, sorted by id.
    pub fn fleet_report(&self) -> FleetHealthReport {
        let agents = self
            .agents
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut reports: Vec<AgentHealthReport> = agents
            .iter()
            .map(|(id, health)| self.build_report(id, health))
            .collect();
        reports.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        let healthy_agents = reports.iter().filter(|r| r.healthy).count();
        FleetHealthReport {
            healthy_agents,
            unhealthy_agents: reports.len() - healthy_agents,
            agents: reports,
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(HealthConfig::default())
    }
}
