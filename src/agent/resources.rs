//! Resource monitoring and backpressure signals.
//!
//! The monitor samples memory and CPU on a fixed interval, derives a
//! health score and a recommended [`ResourceAction`], and publishes a
//! [`ResourceEvent`] when a threshold is crossed.
//!
//! ```text
//!   usage  0% ──────── reject ──────── cancel ──────── critical ── 100%
//!   action    none      reject_new_tasks  cancel_lowest   graceful_shutdown
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Recommended reaction to the current resource pressure, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceAction {
    None,
    RejectNewTasks,
    CancelLowestPriority,
    GracefulShutdown,
}

impl ResourceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceAction::None => "none",
            ResourceAction::RejectNewTasks => "reject_new_tasks",
            ResourceAction::CancelLowestPriority => "cancel_lowest_priority",
            ResourceAction::GracefulShutdown => "graceful_shutdown",
        }
    }
}

/// Raw usage figures from a sampler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceSample {
    pub memory_percent: f64,
    pub cpu_percent: f64,
}

/// Point-in-time resource snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceStatus {
    pub health_score: u8,
    pub memory_percent: f64,
    pub cpu_percent: f64,
    pub can_accept_new_tasks: bool,
    pub action: ResourceAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
    pub sampled_at: DateTime<Utc>,
}

impl ResourceStatus {
    /// Status before the first sample.
    pub fn healthy() -> Self {
        Self {
            health_score: 100,
            memory_percent: 0.0,
            cpu_percent: 0.0,
            can_accept_new_tasks: true,
            action: ResourceAction::None,
            cause: None,
            sampled_at: Utc::now(),
        }
    }
}

/// Published when usage crosses a threshold.
#[derive(Debug, Clone)]
pub struct ResourceEvent {
    pub action: ResourceAction,
    /// Names the resource and the usage level that triggered the event.
    pub cause: String,
    pub status: ResourceStatus,
}

/// Thresholds (percent) for one resource.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdTier {
    pub reject: f64,
    pub cancel: f64,
    /// `None` means this resource never triggers a shutdown.
    pub critical: Option<f64>,
}

impl ThresholdTier {
    fn action_for(&self, usage: f64) -> (ResourceAction, f64) {
        if let Some(critical) = self.critical
            && usage >= critical
        {
            return (ResourceAction::GracefulShutdown, critical);
        }
        if usage >= self.cancel {
            (ResourceAction::CancelLowestPriority, self.cancel)
        } else if usage >= self.reject {
            (ResourceAction::RejectNewTasks, self.reject)
        } else {
            (ResourceAction::None, self.reject)
        }
    }
}

/// Tiered thresholds for memory and CPU.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceThresholds {
    pub memory: ThresholdTier,
    pub cpu: ThresholdTier,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            memory: ThresholdTier {
                reject: 85.0,
                cancel: 92.0,
                critical: Some(97.0),
            },
            cpu: ThresholdTier {
                reject: 90.0,
                cancel: 98.0,
                critical: None,
            },
        }
    }
}

/// Health score in 0..=100, decreasing in both memory and CPU usage.
pub fn health_score(memory_percent: f64, cpu_percent: f64) -> u8 {
    let memory = memory_percent.clamp(0.0, 100.0);
    let cpu = cpu_percent.clamp(0.0, 100.0);
    let pressure = 0.6 * memory + 0.4 * cpu;
    (100.0 - pressure).round().clamp(0.0, 100.0) as u8
}

/// Derive a status from a sample. Pure and deterministic.
pub fn evaluate(thresholds: &ResourceThresholds, sample: ResourceSample) -> ResourceStatus {
    let (memory_action, memory_limit) = thresholds.memory.action_for(sample.memory_percent);
    let (cpu_action, cpu_limit) = thresholds.cpu.action_for(sample.cpu_percent);

    let (action, cause) = if memory_action >= cpu_action {
        (
            memory_action,
            describe("memory", sample.memory_percent, memory_action, memory_limit),
        )
    } else {
        (
            cpu_action,
            describe("cpu", sample.cpu_percent, cpu_action, cpu_limit),
        )
    };

    ResourceStatus {
        health_score: health_score(sample.memory_percent, sample.cpu_percent),
        memory_percent: sample.memory_percent,
        cpu_percent: sample.cpu_percent,
        can_accept_new_tasks: action == ResourceAction::None,
        action,
        cause,
        sampled_at: Utc::now(),
    }
}

fn describe(resource: &str, usage: f64, action: ResourceAction, limit: f64) -> Option<String> {
    if action == ResourceAction::None {
        return None;
    }
    Some(format!(
        "{} usage {:.1}% reached {} threshold of {:.0}%",
        resource,
        usage,
        action.as_str(),
        limit
    ))
}

/// Source of usage figures.
pub trait ResourceSampler: Send + Sync {
    fn sample(&self) -> std::io::Result<ResourceSample>;
}

/// Host-wide figures from `sysinfo`. CPU usage is measured between
/// consecutive refreshes, so the very first reading is near zero.
pub struct SystemSampler {
    system: Mutex<System>,
}

impl SystemSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_usage();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceSampler for SystemSampler {
    fn sample(&self) -> std::io::Result<ResourceSample> {
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        system.refresh_memory();
        system.refresh_cpu_usage();

        let memory_percent = memory_percent(system.total_memory(), system.available_memory())
            .ok_or_else(|| std::io::Error::other("host reported zero total memory"))?;
        let cpu_percent = f64::from(system.global_cpu_usage()).clamp(0.0, 100.0);

        Ok(ResourceSample {
            memory_percent,
            cpu_percent,
        })
    }
}

/// Percent of memory in use. `None` when the total is unknown.
fn memory_percent(total: u64, available: u64) -> Option<f64> {
    if total == 0 {
        return None;
    }
    let used = total.saturating_sub(available);
    Some(used as f64 / total as f64 * 100.0)
}

/// Sampler returning values set by the caller.
pub struct StaticSampler {
    sample: Mutex<ResourceSample>,
}

impl StaticSampler {
    pub fn new(memory_percent: f64, cpu_percent: f64) -> Self {
        Self {
            sample: Mutex::new(ResourceSample {
                memory_percent,
                cpu_percent,
            }),
        }
    }

    pub fn set(&self, memory_percent: f64, cpu_percent: f64) {
        let mut sample = self
            .sample
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *sample = ResourceSample {
            memory_percent,
            cpu_percent,
        };
    }
}

impl ResourceSampler for StaticSampler {
    fn sample(&self) -> std::io::Result<ResourceSample> {
        Ok(*self
            .sample
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()))
    }
}

/// Periodic resource monitor.
pub struct ResourceMonitor {
    sampler: Arc<dyn ResourceSampler>,
    thresholds: ResourceThresholds,
    interval: Duration,
    status: RwLock<ResourceStatus>,
    accepting: AtomicBool,
    events: broadcast::Sender<ResourceEvent>,
}

impl ResourceMonitor {
    pub fn new(
        sampler: Arc<dyn ResourceSampler>,
        thresholds: ResourceThresholds,
        interval: Duration,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            sampler,
            thresholds,
            interval,
            status: RwLock::new(ResourceStatus::healthy()),
            accepting: AtomicBool::new(true),
            events,
        }
    }

    /// Subscribe to threshold-crossing events.
    pub fn subscribe(&self) -> broadcast::Receiver<ResourceEvent> {
        self.events.subscribe()
    }

    /// Fast-path admission check.
    pub fn can_accept_new_tasks(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Latest snapshot, without sampling.
    pub fn report_status(&self) -> ResourceStatus {
        self.status
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Take one sample, update state and emit an event if warranted.
    pub fn sample_now(&self) -> ResourceStatus {
        let sample = match self.sampler.sample() {
            Ok(sample) => sample,
            Err(e) => {
                tracing::warn!("Resource sampling failed: {}", e);
                return self.report_status();
            }
        };

        let status = evaluate(&self.thresholds, sample);
        let previous = {
            let mut guard = self
                .status
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::replace(&mut *guard, status.clone())
        };
        self.accepting
            .store(status.can_accept_new_tasks, Ordering::SeqCst);

        if should_emit(previous.action, status.action) {
            let cause = status.cause.clone().unwrap_or_default();
            tracing::warn!(
                action = status.action.as_str(),
                health_score = status.health_score,
                "{}",
                cause
            );
            // No subscribers is fine.
            let _ = self.events.send(ResourceEvent {
                action: status.action,
                cause,
                status: status.clone(),
            });
        } else if previous.action != ResourceAction::None && status.action == ResourceAction::None
        {
            tracing::info!(
                health_score = status.health_score,
                "Resource pressure cleared, accepting tasks again"
            );
        }

        status
    }

    /// Start periodic sampling until `shutdown` is cancelled.
    pub fn start_monitoring(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        monitor.sample_now();
                    }
                }
            }
            tracing::debug!("Resource monitor stopped");
        })
    }
}

/// Rejection is signalled on crossing; cancel and shutdown repeat while held.
fn should_emit(previous: ResourceAction, current: ResourceAction) -> bool {
    match current {
        ResourceAction::None => false,
        ResourceAction::RejectNewTasks => previous != current,
        ResourceAction::CancelLowestPriority | ResourceAction::GracefulShutdown => true,
    }
}
