//! Cloud server: the agent WebSocket endpoint plus the admin API.
//!
//! Every accepted socket gets its own connection context. The context
//! authenticates the first frame, registers the agent, redelivers its
//! mailbox and then routes inbound envelopes one at a time in arrival
//! order. A separate writer task drains the registry's outbound queue and
//! sends server heartbeats. A background reaper closes connections that
//! have gone silent.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::cloud::api::AdminApi;
use crate::cloud::auth::{AdminToken, AgentKeyStore};
use crate::cloud::dispatch::Dispatcher;
use crate::cloud::health::{HealthConfig, HealthTracker};
use crate::cloud::mailbox::OfflineMailbox;
use crate::cloud::notify::BroadcastNotifier;
use crate::cloud::registry::{AgentRegistry, Outbound};
use crate::cloud::router::{MessageRouter, RouterConfig};
use crate::db::Database;
use crate::error::ServerError;
use crate::protocol::payloads::{AuthRequest, AuthResponse, HeartbeatPing};
use crate::protocol::{Envelope, EnvelopeType, close_code};

/// Timings and limits for the cloud side.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// How long a new socket may take to send `auth:request`.
    pub auth_timeout: Duration,
    /// Spacing of server `heartbeat:ping` frames.
    pub heartbeat_interval: Duration,
    /// Silence after which a connection is reaped.
    pub heartbeat_timeout: Duration,
    /// How long admin requests wait for an agent's reply.
    pub request_timeout: Duration,
    pub mailbox_ttl: Duration,
    pub purge_interval: Duration,
    pub health: HealthConfig,
    pub router: RouterConfig,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            auth_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(90),
            request_timeout: Duration::from_secs(10),
            mailbox_ttl: Duration::from_secs(24 * 60 * 60),
            purge_interval: Duration::from_secs(300),
            health: HealthConfig::default(),
            router: RouterConfig::default(),
        }
    }
}

/// Shared cloud components. Cheap to clone.
#[derive(Clone)]
pub struct CloudState {
    pub registry: Arc<AgentRegistry>,
    pub health: Arc<HealthTracker>,
    pub router: Arc<MessageRouter>,
    pub dispatcher: Arc<Dispatcher>,
    pub notifier: Arc<BroadcastNotifier>,
    pub options: Arc<ServerOptions>,
    shutdown: CancellationToken,
}

impl CloudState {
    pub fn new(db: Arc<dyn Database>, keys: AgentKeyStore, options: ServerOptions) -> Self {
        let registry = Arc::new(AgentRegistry::new(keys));
        let health = Arc::new(HealthTracker::new(options.health));
        let notifier = Arc::new(BroadcastNotifier::default());
        let router = Arc::new(
            MessageRouter::new(db.clone(), registry.clone(), health.clone(), notifier.clone())
                .with_config(options.router),
        );
        let mailbox = OfflineMailbox::new(db.clone(), options.mailbox_ttl);
        let dispatcher = Arc::new(Dispatcher::new(
            db,
            registry.clone(),
            health.clone(),
            mailbox,
            router.clone(),
            notifier.clone(),
        ));

        Self {
            registry,
            health,
            router,
            dispatcher,
            notifier,
            options: Arc::new(options),
            shutdown: CancellationToken::new(),
        }
    }
}

/// The cloud coordinator's HTTP server.
pub struct CloudServer {
    bind_addr: SocketAddr,
    state: CloudState,
    admin: AdminToken,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
}

impl CloudServer {
    pub fn new(bind_addr: SocketAddr, state: CloudState, admin: AdminToken) -> Self {
        Self {
            bind_addr,
            state,
            admin,
            shutdown_tx: None,
            handle: None,
            background: Vec::new(),
        }
    }

    pub fn state(&self) -> &CloudState {
        &self.state
    }

    /// Full route table: agent socket, admin API and health.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/agent/ws", get(agent_ws_handler))
            .with_state(self.state.clone())
            .merge(AdminApi::router(self.state.clone(), self.admin.clone()))
            .layer(TraceLayer::new_for_http())
    }

    /// Bind the listener, spawn the server and its background sweeps.
    /// Returns the bound address (useful with port 0).
    pub async fn start(&mut self) -> Result<SocketAddr, ServerError> {
        let app = self.router();

        let listener = tokio::net::TcpListener::bind(self.bind_addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: self.bind_addr.to_string(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Cloud server listening on {}", local_addr);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdown_tx = Some(shutdown_tx);

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                    tracing::info!("Cloud server shutting down");
                })
                .await
            {
                tracing::error!("Cloud server error: {}", e);
            }
        });
        self.handle = Some(handle);

        let options = &self.state.options;
        self.background.push(spawn_reaper(
            self.state.registry.clone(),
            options.heartbeat_interval,
            options.heartbeat_timeout,
            self.state.shutdown.clone(),
        ));
        self.background.push(
            self.state
                .dispatcher
                .mailbox()
                .spawn_purge_task(options.purge_interval, self.state.shutdown.clone()),
        );
        self.background.push(
            self.state
                .router
                .spawn_progress_flush(self.state.shutdown.clone()),
        );

        Ok(local_addr)
    }

    /// Close every agent connection, stop the sweeps and wait for the
    /// server task to finish.
    pub async fn shutdown(&mut self) {
        self.state.shutdown.cancel();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        for handle in self.background.drain(..) {
            let _ = handle.await;
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

fn spawn_reaper(
    registry: Arc<AgentRegistry>,
    every: Duration,
    timeout: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    for (agent_id, connection_id) in registry.stale_agents(timeout).await {
                        tracing::warn!(agent_id = %agent_id, "Heartbeat timeout, closing connection");
                        registry
                            .close(&agent_id, connection_id, close_code::HEARTBEAT_TIMEOUT, "heartbeat timeout")
                            .await;
                    }
                }
            }
        }
    })
}

async fn agent_ws_handler(ws: WebSocketUpgrade, State(state): State<CloudState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

async fn send_close(sink: &mut WsSink, code: u16, reason: &str) {
    let _ = sink
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

async fn send_envelope(sink: &mut WsSink, envelope: &Envelope) -> bool {
    sink.send(Message::Text(envelope.encode().into()))
        .await
        .is_ok()
}

/// Why a socket never got past authentication.
enum AuthFailure {
    /// Peer went away or timed out; nothing to say.
    Gone,
    /// Close with this code and reason.
    Close(u16, String),
}

async fn read_auth_request(stream: &mut WsStream) -> Result<AuthRequest, AuthFailure> {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => {
                let envelope = Envelope::decode(text.as_str()).map_err(|e| {
                    AuthFailure::Close(close_code::PROTOCOL_VIOLATION, format!("malformed frame: {}", e))
                })?;
                if envelope.kind() != EnvelopeType::AuthRequest {
                    return Err(AuthFailure::Close(
                        close_code::PROTOCOL_VIOLATION,
                        format!("expected auth:request, got {}", envelope.kind()),
                    ));
                }
                return envelope.payload_as::<AuthRequest>().map_err(|e| {
                    AuthFailure::Close(close_code::PROTOCOL_VIOLATION, e.to_string())
                });
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
            Some(Ok(Message::Binary(_))) => {
                return Err(AuthFailure::Close(
                    close_code::PROTOCOL_VIOLATION,
                    "binary frames are not supported".to_string(),
                ));
            }
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return Err(AuthFailure::Gone),
        }
    }
}

async fn handle_socket(socket: WebSocket, state: CloudState) {
    let (mut sink, mut stream) = socket.split();

    let request = match tokio::time::timeout(
        state.options.auth_timeout,
        read_auth_request(&mut stream),
    )
    .await
    {
        Ok(Ok(request)) => request,
        Ok(Err(AuthFailure::Close(code, reason))) => {
            tracing::warn!(code, "Rejecting connection before auth: {}", reason);
            send_close(&mut sink, code, &reason).await;
            return;
        }
        Ok(Err(AuthFailure::Gone)) => return,
        Err(_) => {
            tracing::warn!("Connection did not authenticate in time");
            send_close(&mut sink, close_code::AUTH_FAILED, "auth timeout").await;
            return;
        }
    };

    if !state.registry.authenticate(&request.agent_id, &request.api_key) {
        tracing::warn!(agent_id = %request.agent_id, "Agent authentication failed");
        let response = Envelope::with_payload(
            EnvelopeType::AuthResponse,
            &AuthResponse::rejected("invalid credentials"),
        );
        send_envelope(&mut sink, &response).await;
        send_close(&mut sink, close_code::AUTH_FAILED, "invalid credentials").await;
        return;
    }

    let response = Envelope::with_payload(EnvelopeType::AuthResponse, &AuthResponse::ok());
    if !send_envelope(&mut sink, &response).await {
        return;
    }

    let agent_id = request.agent_id;
    let (info, outbound) = state.registry.register(&agent_id, &request.version).await;
    let connection_id = info.connection_id;

    let session = state.shutdown.child_token();
    let writer = tokio::spawn(write_loop(
        sink,
        outbound,
        state.options.heartbeat_interval,
        session.clone(),
    ));

    match state.dispatcher.redeliver(&agent_id).await {
        Ok(0) => {}
        Ok(sent) => tracing::info!(agent_id = %agent_id, sent, "Mailbox delivered"),
        Err(e) => tracing::error!(agent_id = %agent_id, "Mailbox redelivery failed: {}", e),
    }

    read_loop(&state, &agent_id, connection_id, stream, &session).await;

    session.cancel();
    let _ = writer.await;
    state.registry.unregister(&agent_id, connection_id).await;
    tracing::info!(agent_id = %agent_id, connection_id = %connection_id, "Agent connection closed");
}

async fn read_loop(
    state: &CloudState,
    agent_id: &str,
    connection_id: Uuid,
    mut stream: WsStream,
    session: &CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = session.cancelled() => break,
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => {
                state.registry.record_heartbeat(agent_id, connection_id).await;
                match Envelope::decode(text.as_str()) {
                    Ok(envelope) => {
                        if let Err(e) = state.router.route(agent_id, &envelope).await {
                            tracing::error!(
                                agent_id = %agent_id,
                                kind = %envelope.kind(),
                                "Failed to apply envelope: {}",
                                e
                            );
                        }
                    }
                    Err(e) => {
                        tracing::warn!(agent_id = %agent_id, "Malformed frame dropped: {}", e);
                    }
                }
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                state.registry.record_heartbeat(agent_id, connection_id).await;
            }
            Some(Ok(Message::Binary(_))) => {
                tracing::warn!(agent_id = %agent_id, "Binary frame dropped");
            }
            Some(Ok(Message::Close(frame))) => {
                let (code, reason) = frame
                    .map(|f| (f.code, f.reason.as_str().to_string()))
                    .unwrap_or((close_code::NORMAL, String::new()));
                tracing::info!(agent_id = %agent_id, code, reason = %reason, "Agent closed connection");
                break;
            }
            Some(Err(e)) => {
                tracing::warn!(agent_id = %agent_id, "Socket error: {}", e);
                break;
            }
            None => break,
        }
    }
}

async fn write_loop(
    mut sink: WsSink,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    heartbeat_interval: Duration,
    session: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(
        tokio::time::Instant::now() + heartbeat_interval,
        heartbeat_interval,
    );

    loop {
        tokio::select! {
            _ = session.cancelled() => {
                while let Ok(Outbound::Envelope(envelope)) = outbound.try_recv() {
                    if !send_envelope(&mut sink, &envelope).await {
                        break;
                    }
                }
                send_close(&mut sink, close_code::NORMAL, "connection closed").await;
                break;
            }
            message = outbound.recv() => match message {
                Some(Outbound::Envelope(envelope)) => {
                    if !send_envelope(&mut sink, &envelope).await {
                        break;
                    }
                }
                Some(Outbound::Close { code, reason }) => {
                    send_close(&mut sink, code, &reason).await;
                    break;
                }
                None => break,
            },
            _ = ticker.tick() => {
                let ping = Envelope::with_payload(
                    EnvelopeType::HeartbeatPing,
                    &HeartbeatPing {
                        server_time: Some(Utc::now().timestamp_millis()),
                        agent_time: None,
                    },
                );
                if !send_envelope(&mut sink, &ping).await {
                    break;
                }
            }
        }
    }
    // Wake the reader if the socket died on our side.
    session.cancel();
}
