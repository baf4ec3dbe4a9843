//! Credentials for agents and for the admin API.
//!
//! Security properties:
//! - Keys are held as `SecretString` and never logged
//! - Comparisons are constant-time
//! - A per-agent key only authenticates its own agent id
//! - The admin API is disabled when no admin token is configured

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use secrecy::{ExposeSecret, SecretString};
use subtle::ConstantTimeEq;

fn constant_time_eq(stored: &SecretString, presented: &str) -> bool {
    stored
        .expose_secret()
        .as_bytes()
        .ct_eq(presented.as_bytes())
        .into()
}

/// API keys accepted from agents.
#[derive(Clone, Default)]
pub struct AgentKeyStore {
    /// agent_id -> key.
    agent_keys: Arc<HashMap<String, SecretString>>,
    /// Accepted from any agent id when set.
    shared_key: Option<SecretString>,
}

impl AgentKeyStore {
    pub fn new(agent_keys: HashMap<String, SecretString>, shared_key: Option<SecretString>) -> Self {
        Self {
            agent_keys: Arc::new(agent_keys),
            shared_key,
        }
    }

    /// Validate a key for an agent id.
    pub fn validate(&self, agent_id: &str, api_key: &str) -> bool {
        if agent_id.is_empty() || api_key.is_empty() {
            return false;
        }
        if let Some(stored) = self.agent_keys.get(agent_id) {
            return constant_time_eq(stored, api_key);
        }
        self.shared_key
            .as_ref()
            .is_some_and(|shared| constant_time_eq(shared, api_key))
    }

    /// Number of agents with a dedicated key (for diagnostics).
    pub fn agent_count(&self) -> usize {
        self.agent_keys.len()
    }
}

impl std::fmt::Debug for AgentKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentKeyStore")
            .field("agents", &self.agent_keys.len())
            .field("shared_key", &self.shared_key.is_some())
            .finish()
    }
}

/// Bearer token guarding the admin API.
#[derive(Clone, Default)]
pub struct AdminToken(Option<SecretString>);

impl AdminToken {
    pub fn new(token: Option<SecretString>) -> Self {
        Self(token)
    }

    pub fn is_configured(&self) -> bool {
        self.0.is_some()
    }

    pub fn validate(&self, presented: &str) -> bool {
        self.0
            .as_ref()
            .is_some_and(|stored| constant_time_eq(stored, presented))
    }
}

/// Axum middleware requiring `Authorization: Bearer <admin token>`.
///
/// Wire up with `axum::middleware::from_fn_with_state(admin_token, admin_auth_middleware)`.
pub async fn admin_auth_middleware(
    State(admin): State<AdminToken>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    if !admin.is_configured() {
        return Err(StatusCode::FORBIDDEN);
    }

    let token = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    if !admin.validate(token) {
        return Err(StatusCode::UNAUTHORIZED);
    }

    Ok(next.run(request).await)
}
