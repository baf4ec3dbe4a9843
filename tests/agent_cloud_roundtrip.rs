//! End-to-end runs of a real agent runtime against a real coordinator over
//! a loopback WebSocket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal_macros::dec;
use secrecy::SecretString;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use fleetlink::agent::{
    AgentRuntime, ConnectionConfig, ConnectionManager, ExecutionEvent, ExecutionOutcome,
    ExitReason, ReconnectConfig, ResourceMonitor, ResourceThresholds, SharedEnv, StaticSampler,
    TaskExecutor, TaskQueueProcessor,
};
use fleetlink::cloud::{
    AdminToken, AgentKeyStore, CloudServer, CloudState, Delivery, ServerOptions, TaskNotification,
};
use fleetlink::db::InMemoryStore;
use fleetlink::protocol::payloads::TaskSubmit;
use fleetlink::{ExecutionError, NewTask, TaskStatus};

type TestResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

const AGENT_ID: &str = "agent-a";
const AGENT_KEY: &str = "key-a";

/// `quick` streams a little output and succeeds; anything else waits
/// for cancellation.
struct EchoExecutor;

#[async_trait]
impl TaskExecutor for EchoExecutor {
    async fn execute(
        &self,
        task: &TaskSubmit,
        events: mpsc::Sender<ExecutionEvent>,
        cancel: CancellationToken,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        if task.prompt != "quick" {
            cancel.cancelled().await;
            return Err(ExecutionError::Cancelled);
        }
        let _ = events
            .send(ExecutionEvent::Stream {
                chunk: "hello ".to_string(),
            })
            .await;
        let _ = events
            .send(ExecutionEvent::Stream {
                chunk: "fleet".to_string(),
            })
            .await;
        Ok(ExecutionOutcome {
            input_tokens: 120,
            output_tokens: 30,
            estimated_cost: dec!(0.02),
            summary: Some("echoed".to_string()),
            ..ExecutionOutcome::default()
        })
    }
}

struct Harness {
    server: CloudServer,
    state: CloudState,
    addr: SocketAddr,
}

impl Harness {
    async fn start() -> TestResult<Self> {
        let keys = HashMap::from([(AGENT_ID.to_string(), SecretString::from(AGENT_KEY))]);
        let options = ServerOptions {
            heartbeat_interval: Duration::from_millis(200),
            heartbeat_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(2),
            ..ServerOptions::default()
        };
        let state = CloudState::new(
            Arc::new(InMemoryStore::new()),
            AgentKeyStore::new(keys, None),
            options,
        );
        let mut server = CloudServer::new(
            "127.0.0.1:0".parse()?,
            state.clone(),
            AdminToken::new(None),
        );
        let addr = server.start().await?;
        Ok(Self {
            server,
            state,
            addr,
        })
    }

    fn spawn_agent(&self) -> JoinHandle<ExitReason> {
        let config = ConnectionConfig::new(
            format!("ws://{}/agent/ws", self.addr),
            AGENT_ID,
            SecretString::from(AGENT_KEY),
        )
        .with_heartbeat_interval(Duration::from_millis(200))
        .with_reconnect(
            ReconnectConfig {
                base_delay: Duration::from_millis(50),
                max_delay: Duration::from_millis(200),
                ..ReconnectConfig::default()
            }
            .without_jitter(),
        );
        let (connection, inbound) = ConnectionManager::new(config);
        let monitor = Arc::new(ResourceMonitor::new(
            Arc::new(StaticSampler::new(10.0, 10.0)),
            ResourceThresholds::default(),
            Duration::from_millis(100),
        ));
        let queue = Arc::new(TaskQueueProcessor::new(
            2,
            monitor.clone(),
            connection.clone(),
            Arc::new(EchoExecutor),
        ));
        let runtime = AgentRuntime::new(connection, inbound, queue, monitor, SharedEnv::default())
            .with_status_interval(Duration::from_millis(200))
            .with_drain_timeout(Duration::from_secs(1));
        tokio::spawn(runtime.run())
    }

    async fn wait_connected(&self) -> TestResult<()> {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !self.state.registry.is_connected(AGENT_ID).await {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .map_err(|_| "agent never connected")?;
        Ok(())
    }

    async fn stop(mut self) {
        self.server.shutdown().await;
    }
}

fn new_task(prompt: &str) -> NewTask {
    NewTask {
        project_id: "p1".to_string(),
        agent_id: AGENT_ID.to_string(),
        bot_name: "builder".to_string(),
        command: "code".to_string(),
        prompt: prompt.to_string(),
        max_budget: None,
        parent_task_id: None,
        session_id: None,
    }
}

async fn next_matching<F>(
    events: &mut broadcast::Receiver<TaskNotification>,
    mut matches: F,
) -> TestResult<TaskNotification>
where
    F: FnMut(&TaskNotification) -> bool,
{
    let found = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .map_err(|_| "timed out waiting for notification")?;
    found.ok_or_else(|| "notification stream closed".into())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_submitted_task_completes_with_metrics() -> TestResult<()> {
    let harness = Harness::start().await?;
    let agent = harness.spawn_agent();
    harness.wait_connected().await?;

    let mut events = harness.state.notifier.subscribe();
    let task = harness.state.dispatcher.submit(new_task("quick")).await?;

    let done = next_matching(&mut events, |event| {
        event.task_id() == task.id && event.is_terminal()
    })
    .await?;
    match done {
        TaskNotification::Completed {
            input_tokens,
            output_tokens,
            output,
            ..
        } => {
            assert_eq!(input_tokens, 120);
            assert_eq!(output_tokens, 30);
            assert_eq!(output.as_deref(), Some("hello fleet"));
        }
        other => panic!("expected completion, got {other:?}"),
    }

    let stored = harness.state.dispatcher.get_task(&task.id).await?;
    assert_eq!(stored.status, TaskStatus::Completed);
    assert_eq!(stored.estimated_cost, dec!(0.02));
    assert!(stored.completed_at.is_some());

    agent.abort();
    harness.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_reaches_running_task() -> TestResult<()> {
    let harness = Harness::start().await?;
    let agent = harness.spawn_agent();
    harness.wait_connected().await?;

    let mut events = harness.state.notifier.subscribe();
    let task = harness.state.dispatcher.submit(new_task("block")).await?;
    next_matching(&mut events, |event| {
        matches!(event, TaskNotification::Started { task_id, .. } if *task_id == task.id)
    })
    .await?;

    let delivery = harness.state.dispatcher.cancel(&task.id).await?;
    assert_eq!(delivery, Delivery::Sent);

    let done = next_matching(&mut events, |event| {
        event.task_id() == task.id && event.is_terminal()
    })
    .await?;
    assert!(matches!(done, TaskNotification::Cancelled { .. }), "{done:?}");

    let stored = harness.state.dispatcher.get_task(&task.id).await?;
    assert_eq!(stored.status, TaskStatus::Cancelled);
    assert_eq!(stored.error_message.as_deref(), Some("cancelled by user"));

    agent.abort();
    harness.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_restart_queued_while_offline_is_delivered_on_connect() -> TestResult<()> {
    let harness = Harness::start().await?;

    let delivery = harness
        .state
        .dispatcher
        .restart_agent(AGENT_ID, Some("upgrade".to_string()))
        .await?;
    assert_eq!(delivery, Delivery::Queued);
    assert_eq!(harness.state.dispatcher.mailbox().pending_count(AGENT_ID).await?, 1);

    let agent = harness.spawn_agent();
    let exit = tokio::time::timeout(Duration::from_secs(5), agent)
        .await
        .map_err(|_| "agent did not exit")??;
    assert_eq!(exit, ExitReason::Restart);
    assert_eq!(exit.exit_code(), 75);
    assert_eq!(harness.state.dispatcher.mailbox().pending_count(AGENT_ID).await?, 0);

    harness.stop().await;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_path_validation_round_trip() -> TestResult<()> {
    let harness = Harness::start().await?;
    let agent = harness.spawn_agent();
    harness.wait_connected().await?;

    let dir = tempfile::tempdir()?;
    let path = dir.path().to_string_lossy().to_string();
    let result = harness
        .state
        .dispatcher
        .validate_path(AGENT_ID, &path, Duration::from_secs(2))
        .await?;
    assert!(result.exists);
    assert!(result.is_directory);

    let missing = dir.path().join("nope").to_string_lossy().to_string();
    let result = harness
        .state
        .dispatcher
        .validate_path(AGENT_ID, &missing, Duration::from_secs(2))
        .await?;
    assert!(!result.exists);

    agent.abort();
    harness.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_submit_to_unknown_agent_fails_offline() -> TestResult<()> {
    let harness = Harness::start().await?;

    let err = harness
        .state
        .dispatcher
        .submit(new_task("quick"))
        .await
        .expect_err("agent is not connected");
    assert!(matches!(err, fleetlink::DispatchError::AgentOffline { .. }));

    let tasks = harness
        .state
        .dispatcher
        .list_agent_tasks(AGENT_ID, 10)
        .await?;
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].status, TaskStatus::Failed);

    harness.stop().await;
    Ok(())
}
