//! Agent side of the fleet.
//!
//! The agent process runs:
//! - One persistent, authenticated connection to the coordinator
//! - A resource monitor driving backpressure
//! - An admission-controlled task queue backed by an execution engine
//! - A runtime dispatching inbound envelopes and owning the exit code

pub mod circuit;
pub mod connection;
pub mod executor;
pub mod queue;
pub mod resources;
pub mod runtime;

pub use circuit::{CircuitBreakerState, ReconnectConfig, ReconnectPolicy};
pub use connection::{
    ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionState, EnvelopeSink,
};
pub use executor::{
    ExecutionEvent, ExecutionOutcome, ProcessExecutor, SharedEnv, TaskExecutor,
};
pub use queue::{ActiveTaskInfo, RunState, TaskQueueProcessor};
pub use resources::{
    SystemSampler, ResourceAction, ResourceEvent, ResourceMonitor, ResourceSample,
    ResourceSampler, ResourceStatus, ResourceThresholds, StaticSampler, ThresholdTier,
};
pub use runtime::{AgentRuntime, ExitReason};

#[cfg(test)]
pub(crate) mod testing {
    //! Doubles shared by the agent unit tests.

    use std::sync::Mutex;

    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use serde::de::DeserializeOwned;
    use tokio::sync::{Semaphore, mpsc};
    use tokio_util::sync::CancellationToken;

    use super::connection::EnvelopeSink;
    use super::executor::{ExecutionEvent, ExecutionOutcome, TaskExecutor};
    use crate::error::ExecutionError;
    use crate::protocol::payloads::TaskSubmit;
    use crate::protocol::{Envelope, EnvelopeType};

    pub fn submit(task_id: &str, prompt: &str) -> TaskSubmit {
        TaskSubmit {
            task_id: task_id.to_string(),
            project_id: "p1".to_string(),
            bot_name: "builder".to_string(),
            command: "code".to_string(),
            prompt: prompt.to_string(),
            session_id: None,
            max_budget: None,
            parent_task_id: None,
            working_dir: None,
        }
    }

    /// Records every envelope; `send` always succeeds unless disconnected.
    #[derive(Default)]
    pub struct RecordingSink {
        sent: Mutex<Vec<Envelope>>,
        offline: std::sync::atomic::AtomicBool,
    }

    impl RecordingSink {
        pub fn set_offline(&self, offline: bool) {
            self.offline
                .store(offline, std::sync::atomic::Ordering::SeqCst);
        }

        pub fn envelopes(&self) -> Vec<Envelope> {
            self.sent.lock().unwrap().clone()
        }

        pub fn kinds(&self) -> Vec<EnvelopeType> {
            self.envelopes().iter().map(|e| e.kind()).collect()
        }

        pub fn count(&self, kind: EnvelopeType) -> usize {
            self.envelopes().iter().filter(|e| e.kind() == kind).count()
        }

        pub fn last_of<T: DeserializeOwned>(&self, kind: EnvelopeType) -> Option<T> {
            self.envelopes()
                .iter()
                .rev()
                .find(|e| e.kind() == kind)
                .and_then(|e| e.payload_as().ok())
        }
    }

    impl EnvelopeSink for RecordingSink {
        fn send(&self, envelope: Envelope) -> bool {
            if self.offline.load(std::sync::atomic::Ordering::SeqCst) {
                return false;
            }
            self.sent.lock().unwrap().push(envelope);
            true
        }
    }

    /// Behaviour is chosen by the task prompt:
    /// `quick` succeeds, `fail` fails, `block` waits for cancellation,
    /// `ignore-cancel` waits for [`ScriptedExecutor::release`] and succeeds.
    pub struct ScriptedExecutor {
        gate: Semaphore,
    }

    impl Default for ScriptedExecutor {
        fn default() -> Self {
            Self {
                gate: Semaphore::new(0),
            }
        }
    }

    impl ScriptedExecutor {
        pub fn release(&self) {
            self.gate.add_permits(1);
        }
    }

    #[async_trait]
    impl TaskExecutor for ScriptedExecutor {
        async fn execute(
            &self,
            task: &TaskSubmit,
            events: mpsc::Sender<ExecutionEvent>,
            cancel: CancellationToken,
        ) -> Result<ExecutionOutcome, ExecutionError> {
            match task.prompt.as_str() {
                "fail" => Err(ExecutionError::Failed {
                    reason: "engine crashed".to_string(),
                }),
                "block" => {
                    cancel.cancelled().await;
                    Err(ExecutionError::Cancelled)
                }
                "ignore-cancel" => {
                    let _ = self.gate.acquire().await;
                    Ok(ExecutionOutcome::default())
                }
                _ => {
                    let _ = events
                        .send(ExecutionEvent::Progress {
                            message: "starting".to_string(),
                            percent: Some(10),
                            estimated_cost: None,
                        })
                        .await;
                    let _ = events
                        .send(ExecutionEvent::Stream {
                            chunk: "output".to_string(),
                        })
                        .await;
                    Ok(ExecutionOutcome {
                        input_tokens: 1,
                        output_tokens: 2,
                        estimated_cost: Decimal::new(5, 2),
                        ..Default::default()
                    })
                }
            }
        }
    }
}
