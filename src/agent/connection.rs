//! Persistent connection from an agent to the coordinator.
//!
//! ```text
//!  disconnected ──▶ connecting ──▶ authenticating ──▶ online
//!       ▲                │               │              │
//!       └── backoff ◀────┴───────────────┴──────────────┘
//! ```
//!
//! One attempt is: open the WebSocket, send `auth:request`, wait for
//! `auth:response`. While online the manager runs a local keepalive that
//! emits `heartbeat:ping` on a fixed interval and drops the session when
//! the coordinator goes silent. Every terminal disconnect is fed to the
//! [`ReconnectPolicy`]; transport and auth errors never reach callers.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

use crate::agent::circuit::{CircuitBreakerState, ReconnectConfig, ReconnectPolicy};
use crate::error::ConnectionError;
use crate::protocol::payloads::{AuthRequest, AuthResponse, HeartbeatPing};
use crate::protocol::{Envelope, EnvelopeType, PROTOCOL_VERSION, close_code};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Missed keepalive intervals tolerated before the session is dropped.
const SILENCE_TOLERANCE: u32 = 3;

/// Anything that can carry envelopes to the coordinator.
///
/// `send` never buffers: it returns false when the envelope could not be
/// handed to a live, authenticated session.
pub trait EnvelopeSink: Send + Sync {
    fn send(&self, envelope: Envelope) -> bool;
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Online,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Authenticating => "authenticating",
            ConnectionState::Online => "online",
        }
    }
}

/// Published to subscribers of [`ConnectionManager::subscribe`].
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged(ConnectionState),
    AuthFailed { reason: String },
    Disconnected { reason: String },
    CircuitOpened { consecutive_failures: u32 },
    ReconnectScheduled {
        delay: Duration,
        consecutive_failures: u32,
    },
}

/// Connection settings.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// WebSocket URL of the coordinator endpoint.
    pub url: String,
    pub agent_id: String,
    pub api_key: SecretString,
    pub version: String,
    /// Interval between local keepalive pings.
    pub heartbeat_interval: Duration,
    /// How long to wait for `auth:response`.
    pub auth_timeout: Duration,
    pub reconnect: ReconnectConfig,
}

impl std::fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("url", &self.url)
            .field("agent_id", &self.agent_id)
            .field("api_key", &"[REDACTED]")
            .field("version", &self.version)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("auth_timeout", &self.auth_timeout)
            .field("reconnect", &self.reconnect)
            .finish()
    }
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>, agent_id: impl Into<String>, api_key: SecretString) -> Self {
        Self {
            url: url.into(),
            agent_id: agent_id.into(),
            api_key,
            version: PROTOCOL_VERSION.to_string(),
            heartbeat_interval: Duration::from_secs(30),
            auth_timeout: Duration::from_secs(10),
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }
}

/// Owns the agent's single connection to the coordinator.
pub struct ConnectionManager {
    config: ConnectionConfig,
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    inbound: mpsc::Sender<Envelope>,
    events: broadcast::Sender<ConnectionEvent>,
    policy: Mutex<ReconnectPolicy>,
    shutdown: CancellationToken,
}

impl ConnectionManager {
    /// Create a manager. Inbound envelopes (other than heartbeats) arrive
    /// on the returned receiver, in arrival order.
    pub fn new(config: ConnectionConfig) -> (Arc<Self>, mpsc::Receiver<Envelope>) {
        let (inbound, inbound_rx) = mpsc::channel(256);
        let (events, _) = broadcast::channel(64);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let policy = ReconnectPolicy::new(config.reconnect.clone());
        let manager = Arc::new(Self {
            config,
            state,
            outbound: Mutex::new(None),
            inbound,
            events,
            policy: Mutex::new(policy),
            shutdown: CancellationToken::new(),
        });
        (manager, inbound_rx)
    }

    pub fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// True only while authenticated.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Online
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub fn circuit_state(&self) -> CircuitBreakerState {
        self.lock_policy().state()
    }

    /// Queue an envelope on the live session. False if not authenticated.
    pub fn send(&self, envelope: Envelope) -> bool {
        if !self.is_connected() {
            return false;
        }
        let outbound = self
            .outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match outbound.as_ref() {
            Some(tx) => tx.send(Message::text(envelope.encode())).is_ok(),
            None => false,
        }
    }

    /// Permanently close. Cancels the session, keepalive and any pending
    /// reconnect timer.
    pub fn close(&self) {
        if !self.shutdown.is_cancelled() {
            tracing::info!(agent_id = %self.config.agent_id, "Closing connection manager");
        }
        self.shutdown.cancel();
    }

    /// Spawn the reconnecting supervisor. This is the only way to connect:
    /// every attempt's outcome goes through the reconnect policy.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.run().await })
    }

    /// Connect, serve, back off, repeat until closed.
    pub async fn run(self: Arc<Self>) {
        while !self.shutdown.is_cancelled() {
            let reason = match self.handshake().await {
                Ok((socket, outbound_rx)) => self.run_session(socket, outbound_rx).await,
                Err(ConnectionError::Closed) => break,
                Err(e) => {
                    if let ConnectionError::AuthRejected { reason } = &e {
                        let _ = self.events.send(ConnectionEvent::AuthFailed {
                            reason: reason.clone(),
                        });
                    }
                    e.to_string()
                }
            };
            self.session_ended(&reason);

            if self.shutdown.is_cancelled() {
                break;
            }

            let (delay, breaker) = {
                let mut policy = self.lock_policy();
                let was_open = policy.state().open;
                let delay = policy.record_failure();
                let breaker = policy.state();
                if breaker.open && !was_open {
                    let _ = self.events.send(ConnectionEvent::CircuitOpened {
                        consecutive_failures: breaker.consecutive_failures,
                    });
                }
                (delay, breaker)
            };

            if breaker.open {
                tracing::warn!(
                    agent_id = %self.config.agent_id,
                    consecutive_failures = breaker.consecutive_failures,
                    "Circuit open, retrying in {:?}: {}",
                    delay,
                    reason
                );
            } else {
                tracing::warn!(
                    agent_id = %self.config.agent_id,
                    consecutive_failures = breaker.consecutive_failures,
                    "Connection lost, retrying in {:?}: {}",
                    delay,
                    reason
                );
            }
            let _ = self.events.send(ConnectionEvent::ReconnectScheduled {
                delay,
                consecutive_failures: breaker.consecutive_failures,
            });

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.set_state(ConnectionState::Disconnected);
        tracing::debug!(agent_id = %self.config.agent_id, "Connection supervisor stopped");
    }

    fn lock_policy(&self) -> std::sync::MutexGuard<'_, ReconnectPolicy> {
        self.policy
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::debug!(agent_id = %self.config.agent_id, state = next.as_str(), "Connection state changed");
            let _ = self.events.send(ConnectionEvent::StateChanged(next));
        }
    }

    fn session_ended(&self, reason: &str) {
        self.outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        self.set_state(ConnectionState::Disconnected);
        let _ = self.events.send(ConnectionEvent::Disconnected {
            reason: reason.to_string(),
        });
    }

    /// Open the transport and authenticate.
    async fn handshake(
        &self,
    ) -> Result<(Socket, mpsc::UnboundedReceiver<Message>), ConnectionError> {
        if self.shutdown.is_cancelled() {
            return Err(ConnectionError::Closed);
        }

        self.set_state(ConnectionState::Connecting);
        let (mut socket, _) = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(ConnectionError::Closed),
            result = connect_async(self.config.url.as_str()) => result?,
        };

        self.set_state(ConnectionState::Authenticating);
        let request = Envelope::with_payload(
            EnvelopeType::AuthRequest,
            &AuthRequest {
                agent_id: self.config.agent_id.clone(),
                api_key: self.config.api_key.expose_secret().to_string(),
                version: self.config.version.clone(),
            },
        );
        socket.send(Message::text(request.encode())).await?;

        let response = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(ConnectionError::Closed),
            result = tokio::time::timeout(self.config.auth_timeout, await_auth_response(&mut socket)) => {
                result.map_err(|_| ConnectionError::AuthTimeout(self.config.auth_timeout))??
            }
        };

        if !response.success {
            let reason = response
                .error
                .unwrap_or_else(|| "authentication rejected".to_string());
            let _ = socket
                .close(Some(CloseFrame {
                    code: CloseCode::from(close_code::AUTH_FAILED),
                    reason: reason.clone().into(),
                }))
                .await;
            tracing::warn!(agent_id = %self.config.agent_id, "Authentication rejected: {}", reason);
            return Err(ConnectionError::AuthRejected { reason });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self
            .outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(tx);
        self.lock_policy().record_success();
        self.set_state(ConnectionState::Online);
        tracing::info!(agent_id = %self.config.agent_id, url = %self.config.url, "Authenticated with coordinator");
        Ok((socket, rx))
    }

    /// Serve an authenticated session. Returns why it ended.
    async fn run_session(
        &self,
        socket: Socket,
        mut outbound: mpsc::UnboundedReceiver<Message>,
    ) -> String {
        let (mut sink, mut stream) = socket.split();
        let interval = self.config.heartbeat_interval;
        let mut keepalive = tokio::time::interval_at(Instant::now() + interval, interval);
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    // Flush what callers already handed us.
                    while let Ok(message) = outbound.try_recv() {
                        if sink.send(message).await.is_err() {
                            break;
                        }
                    }
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CloseCode::Normal,
                            reason: "agent closing".into(),
                        })))
                        .await;
                    return "closed by agent".to_string();
                }
                message = outbound.recv() => match message {
                    Some(message) => {
                        if let Err(e) = sink.send(message).await {
                            return format!("send failed: {}", e);
                        }
                    }
                    None => return "outbound channel closed".to_string(),
                },
                _ = keepalive.tick() => {
                    if last_inbound.elapsed() > interval * SILENCE_TOLERANCE {
                        return format!("no traffic from coordinator for {:?}", last_inbound.elapsed());
                    }
                    let ping = Envelope::with_payload(
                        EnvelopeType::HeartbeatPing,
                        &HeartbeatPing {
                            server_time: None,
                            agent_time: Some(Utc::now().timestamp_millis()),
                        },
                    );
                    if let Err(e) = sink.send(Message::text(ping.encode())).await {
                        return format!("keepalive failed: {}", e);
                    }
                }
                frame = stream.next() => {
                    last_inbound = Instant::now();
                    match frame {
                        Some(Ok(Message::Text(text))) => self.dispatch_frame(text.as_str()).await,
                        Some(Ok(Message::Close(frame))) => {
                            return match frame {
                                Some(frame) => format!("remote closed ({}): {}", u16::from(frame.code), frame.reason.as_str()),
                                None => "remote closed".to_string(),
                            };
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return format!("transport error: {}", e),
                        None => return "stream ended".to_string(),
                    }
                }
            }
        }
    }

    async fn dispatch_frame(&self, text: &str) {
        let envelope = match Envelope::decode(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(agent_id = %self.config.agent_id, "Dropping undecodable frame: {}", e);
                return;
            }
        };

        if envelope.kind() == EnvelopeType::HeartbeatPing {
            tracing::trace!(agent_id = %self.config.agent_id, "Coordinator heartbeat");
            return;
        }

        tracing::debug!(agent_id = %self.config.agent_id, kind = %envelope.kind(), "Inbound envelope");
        if self.inbound.send(envelope).await.is_err() {
            tracing::debug!("Inbound receiver dropped");
        }
    }
}

impl EnvelopeSink for ConnectionManager {
    fn send(&self, envelope: Envelope) -> bool {
        ConnectionManager::send(self, envelope)
    }
}

/// Read frames until an `auth:response` arrives.
async fn await_auth_response(socket: &mut Socket) -> Result<AuthResponse, ConnectionError> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => {
                let envelope = Envelope::decode(text.as_str())?;
                if envelope.kind() == EnvelopeType::AuthResponse {
                    return Ok(envelope.payload_as()?);
                }
            }
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = frame
                    .map(|f| (u16::from(f.code), f.reason.as_str().to_string()))
                    .unwrap_or((close_code::NORMAL, String::new()));
                if code == close_code::AUTH_FAILED {
                    return Err(ConnectionError::AuthRejected { reason });
                }
                return Err(ConnectionError::RemoteClosed {
                    reason: format!("{} {}", code, reason),
                });
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
            None => {
                return Err(ConnectionError::RemoteClosed {
                    reason: "stream ended during handshake".to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ConnectionConfig {
        ConnectionConfig::new(
            "ws://127.0.0.1:9/agent/ws",
            "agent-a",
            SecretString::from("secret"),
        )
    }

    #[test]
    fn test_config_debug_redacts_key() {
        let debug = format!("{:?}", config());
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("secret"));
    }

    #[tokio::test]
    async fn test_send_fails_when_not_connected() {
        let (manager, _rx) = ConnectionManager::new(config());
        assert!(!manager.is_connected());
        assert!(!manager.send(Envelope::new(
            EnvelopeType::AgentStatus,
            serde_json::json!({})
        )));
    }

    #[tokio::test]
    async fn test_run_returns_immediately_once_closed() {
        let (manager, _rx) = ConnectionManager::new(config());
        manager.close();
        tokio::time::timeout(Duration::from_secs(1), manager.clone().run())
            .await
            .unwrap();
        assert!(manager.is_closed());
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_refused_connect_feeds_breaker() {
        let cfg = config().with_reconnect(ReconnectConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(20),
            long_backoff: Duration::from_secs(600),
            failure_threshold: 2,
            jitter_ratio: 0.0,
        });
        let (manager, _rx) = ConnectionManager::new(cfg);
        let mut events = manager.subscribe();
        let handle = manager.start();

        let mut reasons = Vec::new();
        let opened_at = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match events.recv().await.unwrap() {
                    ConnectionEvent::Disconnected { reason } => reasons.push(reason),
                    ConnectionEvent::CircuitOpened {
                        consecutive_failures,
                    } => break consecutive_failures,
                    _ => {}
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(opened_at, 2);
        assert_eq!(reasons.len(), 2);
        assert!(!manager.is_connected());
        let breaker = manager.circuit_state();
        assert!(breaker.open);
        assert_eq!(breaker.consecutive_failures, 2);

        manager.close();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_close_cancels_pending_retry() {
        let cfg = config().with_reconnect(ReconnectConfig {
            base_delay: Duration::from_secs(600),
            ..ReconnectConfig::default()
        });
        let (manager, _rx) = ConnectionManager::new(cfg);
        let mut events = manager.subscribe();
        let handle = manager.start();

        // Wait for the first retry to be scheduled, then close.
        loop {
            if let ConnectionEvent::ReconnectScheduled {
                consecutive_failures,
                ..
            } = events.recv().await.unwrap()
            {
                assert_eq!(consecutive_failures, 1);
                break;
            }
        }
        manager.close();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(manager.circuit_state().consecutive_failures, 1);
    }
}
