//! Admin HTTP API.
//!
//! Everything except `/health` sits behind the admin bearer token.

use std::collections::HashMap;
use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_stream::StreamExt;

use crate::cloud::auth::{AdminToken, admin_auth_middleware};
use crate::cloud::dispatch::Delivery;
use crate::cloud::health::FleetHealthReport;
use crate::cloud::registry::AgentConnection;
use crate::cloud::server::CloudState;
use crate::error::DispatchError;
use crate::protocol::payloads::{DeployResult, EnvUpdateResult, PathValidateResult};
use crate::task::{NewTask, Task};

pub struct AdminApi;

impl AdminApi {
    pub fn router(state: CloudState, admin: AdminToken) -> Router {
        Router::new()
            .route("/agents", get(list_agents))
            .route("/agents/{agent_id}", get(get_agent))
            .route("/agents/{agent_id}/tasks", get(list_agent_tasks))
            .route("/agents/{agent_id}/restart", post(restart_agent))
            .route("/agents/{agent_id}/validate-path", post(validate_path))
            .route("/agents/{agent_id}/env", post(update_env))
            .route("/agents/{agent_id}/deploy", post(deploy))
            .route("/tasks", post(submit_task))
            .route("/tasks/{task_id}", get(get_task))
            .route("/tasks/{task_id}/cancel", post(cancel_task))
            .route("/events", get(events))
            .route_layer(axum::middleware::from_fn_with_state(
                admin,
                admin_auth_middleware,
            ))
            // Unauthenticated routes (added after the layer).
            .route("/health", get(health))
            .with_state(state)
    }
}

/// Error body returned by every failing handler.
#[derive(Debug, Serialize)]
struct ApiError {
    #[serde(skip)]
    status: StatusCode,
    error: String,
}

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        let status = match &e {
            DispatchError::AgentOffline { .. } => StatusCode::SERVICE_UNAVAILABLE,
            DispatchError::TaskNotFound(_) => StatusCode::NOT_FOUND,
            DispatchError::AlreadyTerminal { .. } => StatusCode::CONFLICT,
            DispatchError::ReplyTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            DispatchError::Protocol(_) => StatusCode::BAD_GATEWAY,
            DispatchError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("Admin request failed: {}", e);
        }
        Self {
            status,
            error: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self)).into_response()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    connected_agents: usize,
    fleet: FleetHealthReport,
}

async fn health(State(state): State<CloudState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        connected_agents: state.registry.get_connected_agent_ids().await.len(),
        fleet: state.health.fleet_report(),
    })
}

async fn list_agents(State(state): State<CloudState>) -> Json<Vec<AgentConnection>> {
    Json(state.registry.list_agents().await)
}

async fn get_agent(
    State(state): State<CloudState>,
    Path(agent_id): Path<String>,
) -> Result<Json<AgentConnection>, StatusCode> {
    state
        .registry
        .get_agent(&agent_id)
        .await
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    limit: Option<usize>,
}

async fn list_agent_tasks(
    State(state): State<CloudState>,
    Path(agent_id): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Task>>, ApiError> {
    let limit = query.limit.unwrap_or(50).min(500);
    Ok(Json(
        state.dispatcher.list_agent_tasks(&agent_id, limit).await?,
    ))
}

#[derive(Debug, Serialize)]
struct DeliveryResponse {
    delivery: Delivery,
}

#[derive(Debug, Deserialize)]
struct RestartQuery {
    reason: Option<String>,
}

async fn restart_agent(
    State(state): State<CloudState>,
    Path(agent_id): Path<String>,
    Query(query): Query<RestartQuery>,
) -> Result<Json<DeliveryResponse>, ApiError> {
    let delivery = state
        .dispatcher
        .restart_agent(&agent_id, query.reason)
        .await?;
    tracing::info!(agent_id = %agent_id, delivery = ?delivery, "Restart requested");
    Ok(Json(DeliveryResponse { delivery }))
}

#[derive(Debug, Deserialize)]
struct ValidatePathBody {
    path: String,
}

async fn validate_path(
    State(state): State<CloudState>,
    Path(agent_id): Path<String>,
    Json(body): Json<ValidatePathBody>,
) -> Result<Json<PathValidateResult>, ApiError> {
    let timeout = state.options.request_timeout;
    Ok(Json(
        state
            .dispatcher
            .validate_path(&agent_id, &body.path, timeout)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
struct EnvBody {
    #[serde(default)]
    set: HashMap<String, String>,
    #[serde(default)]
    remove: Vec<String>,
}

async fn update_env(
    State(state): State<CloudState>,
    Path(agent_id): Path<String>,
    Json(body): Json<EnvBody>,
) -> Result<Json<EnvUpdateResult>, ApiError> {
    let timeout = state.options.request_timeout;
    Ok(Json(
        state
            .dispatcher
            .update_env(&agent_id, body.set, body.remove, timeout)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeployBody {
    project_id: String,
    environment: Option<String>,
}

async fn deploy(
    State(state): State<CloudState>,
    Path(agent_id): Path<String>,
    Json(body): Json<DeployBody>,
) -> Result<Json<DeployResult>, ApiError> {
    let timeout = state.options.request_timeout;
    Ok(Json(
        state
            .dispatcher
            .deploy(&agent_id, &body.project_id, body.environment, timeout)
            .await?,
    ))
}

async fn submit_task(
    State(state): State<CloudState>,
    Json(new): Json<NewTask>,
) -> Result<(StatusCode, Json<Task>), ApiError> {
    let task = state.dispatcher.submit(new).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn get_task(
    State(state): State<CloudState>,
    Path(task_id): Path<String>,
) -> Result<Json<Task>, ApiError> {
    Ok(Json(state.dispatcher.get_task(&task_id).await?))
}

async fn cancel_task(
    State(state): State<CloudState>,
    Path(task_id): Path<String>,
) -> Result<(StatusCode, Json<DeliveryResponse>), ApiError> {
    let delivery = state.dispatcher.cancel(&task_id).await?;
    Ok((StatusCode::ACCEPTED, Json(DeliveryResponse { delivery })))
}

/// Task notifications as server-sent events.
async fn events(
    State(state): State<CloudState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static> {
    let stream = state.notifier.stream().map(|notification| {
        let data = serde_json::to_string(&notification).unwrap_or_default();
        Ok::<_, Infallible>(Event::default().event(notification.event_name()).data(data))
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
