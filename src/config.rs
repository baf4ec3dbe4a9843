//! Configuration loaded from the environment.
//!
//! `from_env()` reads the process environment after loading an optional
//! `.env` file. `from_lookup()` takes any key lookup so tests can supply a
//! map instead of mutating the process environment.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::agent::circuit::ReconnectConfig;
use crate::agent::connection::ConnectionConfig;
use crate::agent::resources::{ResourceThresholds, ThresholdTier};
use crate::cloud::auth::{AdminToken, AgentKeyStore};
use crate::cloud::health::HealthConfig;
use crate::cloud::router::RouterConfig;
use crate::cloud::server::ServerOptions;
use crate::error::ConfigError;

/// Typed access to a key lookup.
struct Vars<F> {
    lookup: F,
}

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.get(key).ok_or_else(|| ConfigError::Missing {
            key: key.to_string(),
        })
    }

    fn parse<T>(&self, key: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get(key) {
            Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::Invalid {
                key: key.to_string(),
                reason: e.to_string(),
            }),
            None => Ok(default),
        }
    }

    fn secs(&self, key: &str, default: u64) -> Result<Duration, ConfigError> {
        self.parse(key, default).map(Duration::from_secs)
    }

    fn millis(&self, key: &str, default: u64) -> Result<Duration, ConfigError> {
        self.parse(key, default).map(Duration::from_millis)
    }

    fn percent(&self, key: &str, default: f64) -> Result<f64, ConfigError> {
        let value: f64 = self.parse(key, default)?;
        if !(0.0..=100.0).contains(&value) {
            return Err(ConfigError::Invalid {
                key: key.to_string(),
                reason: format!("{} is not a percentage", value),
            });
        }
        Ok(value)
    }

    fn secret(&self, key: &str) -> Option<SecretString> {
        self.get(key).map(SecretString::from)
    }
}

fn load_dotenv() {
    // Missing .env is normal
    let _ = dotenvy::dotenv();
}

fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Agent process settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub agent_id: String,
    pub cloud_url: String,
    pub api_key: SecretString,
    pub heartbeat_interval: Duration,
    pub reconnect: ReconnectConfig,
    pub max_concurrent_tasks: usize,
    pub resource_sample_interval: Duration,
    pub thresholds: ResourceThresholds,
    pub status_interval: Duration,
    pub executor_program: String,
    pub executor_args: Vec<String>,
    pub executor_workdir: Option<PathBuf>,
    pub task_timeout: Duration,
}

impl AgentConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        load_dotenv();
        Self::from_lookup(process_env)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let reconnect = ReconnectConfig {
            base_delay: vars.millis("FLEET_RECONNECT_BASE_MS", 1_000)?,
            max_delay: vars.millis("FLEET_RECONNECT_MAX_MS", 30_000)?,
            long_backoff: vars.millis("FLEET_LONG_BACKOFF_MS", 60_000)?,
            failure_threshold: vars.parse("FLEET_CIRCUIT_THRESHOLD", 5)?,
            jitter_ratio: vars.parse("FLEET_RECONNECT_JITTER", 0.1)?,
        };
        if !(0.0..=0.5).contains(&reconnect.jitter_ratio) {
            return Err(ConfigError::Invalid {
                key: "FLEET_RECONNECT_JITTER".to_string(),
                reason: "must be between 0.0 and 0.5".to_string(),
            });
        }

        let thresholds = ResourceThresholds {
            memory: ThresholdTier {
                reject: vars.percent("FLEET_MEMORY_REJECT_PCT", 85.0)?,
                cancel: vars.percent("FLEET_MEMORY_CANCEL_PCT", 92.0)?,
                critical: Some(vars.percent("FLEET_MEMORY_CRITICAL_PCT", 97.0)?),
            },
            cpu: ThresholdTier {
                reject: vars.percent("FLEET_CPU_REJECT_PCT", 90.0)?,
                cancel: vars.percent("FLEET_CPU_CANCEL_PCT", 98.0)?,
                critical: None,
            },
        };

        let max_concurrent_tasks: usize = vars.parse("FLEET_MAX_CONCURRENT_TASKS", 2)?;
        if max_concurrent_tasks == 0 {
            return Err(ConfigError::Invalid {
                key: "FLEET_MAX_CONCURRENT_TASKS".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            agent_id: vars.required("FLEET_AGENT_ID")?,
            cloud_url: vars.required("FLEET_CLOUD_URL")?,
            api_key: SecretString::from(vars.required("FLEET_API_KEY")?),
            heartbeat_interval: vars.secs("FLEET_HEARTBEAT_INTERVAL_SECS", 30)?,
            reconnect,
            max_concurrent_tasks,
            resource_sample_interval: vars.secs("FLEET_RESOURCE_SAMPLE_SECS", 10)?,
            thresholds,
            status_interval: vars.secs("FLEET_STATUS_INTERVAL_SECS", 30)?,
            executor_program: vars
                .get("FLEET_EXECUTOR_PROGRAM")
                .unwrap_or_else(|| "claude".to_string()),
            executor_args: vars
                .get("FLEET_EXECUTOR_ARGS")
                .map(|raw| raw.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            executor_workdir: vars.get("FLEET_EXECUTOR_WORKDIR").map(PathBuf::from),
            task_timeout: vars.secs("FLEET_TASK_TIMEOUT_SECS", 3_600)?,
        })
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig::new(
            self.cloud_url.clone(),
            self.agent_id.clone(),
            self.api_key.clone(),
        )
        .with_heartbeat_interval(self.heartbeat_interval)
        .with_reconnect(self.reconnect.clone())
    }
}

/// PostgreSQL connection settings.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: SecretString,
    pub pool_size: usize,
}

impl DatabaseConfig {
    pub fn url(&self) -> &str {
        self.url.expose_secret()
    }
}

/// Cloud process settings.
#[derive(Debug, Clone)]
pub struct CloudConfig {
    pub bind_addr: SocketAddr,
    /// `None` selects the in-memory store.
    pub database: Option<DatabaseConfig>,
    pub agent_keys: HashMap<String, SecretString>,
    pub shared_key: Option<SecretString>,
    pub admin_token: Option<SecretString>,
    pub server_heartbeat: Duration,
    pub heartbeat_timeout: Duration,
    pub mailbox_ttl: Duration,
    pub purge_interval: Duration,
    pub progress_window: usize,
    pub progress_interval: Duration,
    pub orphan_grace: Duration,
}

impl CloudConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        load_dotenv();
        Self::from_lookup(process_env)
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars { lookup };

        let database = match vars.secret("DATABASE_URL") {
            Some(url) => Some(DatabaseConfig {
                url,
                pool_size: vars.parse("DATABASE_POOL_SIZE", 10)?,
            }),
            None => None,
        };

        let agent_keys = match vars.get("FLEET_AGENT_KEYS") {
            Some(raw) => parse_agent_keys(&raw)?,
            None => HashMap::new(),
        };
        let shared_key = vars.secret("FLEET_SHARED_API_KEY");
        if agent_keys.is_empty() && shared_key.is_none() {
            tracing::warn!("No agent keys configured; every agent will be rejected");
        }

        Ok(Self {
            bind_addr: vars.parse("FLEET_BIND_ADDR", SocketAddr::from(([0, 0, 0, 0], 8787)))?,
            database,
            agent_keys,
            shared_key,
            admin_token: vars.secret("FLEET_ADMIN_TOKEN"),
            server_heartbeat: vars.secs("FLEET_SERVER_HEARTBEAT_SECS", 30)?,
            heartbeat_timeout: vars.secs("FLEET_HEARTBEAT_TIMEOUT_SECS", 90)?,
            mailbox_ttl: vars.secs("FLEET_MAILBOX_TTL_SECS", 86_400)?,
            purge_interval: vars.secs("FLEET_MAILBOX_PURGE_SECS", 300)?,
            progress_window: vars.parse("FLEET_PROGRESS_WINDOW", 8)?,
            progress_interval: vars.millis("FLEET_PROGRESS_INTERVAL_MS", 1_000)?,
            orphan_grace: vars.secs("FLEET_ORPHAN_GRACE_SECS", 60)?,
        })
    }

    pub fn key_store(&self) -> AgentKeyStore {
        AgentKeyStore::new(self.agent_keys.clone(), self.shared_key.clone())
    }

    pub fn admin_token(&self) -> AdminToken {
        AdminToken::new(self.admin_token.clone())
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            heartbeat_interval: self.server_heartbeat,
            heartbeat_timeout: self.heartbeat_timeout,
            mailbox_ttl: self.mailbox_ttl,
            purge_interval: self.purge_interval,
            health: HealthConfig::default(),
            router: RouterConfig {
                progress_window: self.progress_window,
                progress_interval: self.progress_interval,
                orphan_grace: self.orphan_grace,
                ..RouterConfig::default()
            },
            ..ServerOptions::default()
        }
    }
}

/// Parse `agent-a:key-a,agent-b:key-b`.
fn parse_agent_keys(raw: &str) -> Result<HashMap<String, SecretString>, ConfigError> {
    let mut keys = HashMap::new();
    for pair in raw.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (agent_id, key) = pair
            .split_once(':')
            .map(|(a, k)| (a.trim(), k.trim()))
            .filter(|(a, k)| !a.is_empty() && !k.is_empty())
            .ok_or_else(|| ConfigError::Invalid {
                key: "FLEET_AGENT_KEYS".to_string(),
                reason: "expected comma-separated agent_id:key pairs".to_string(),
            })?;
        keys.insert(agent_id.to_string(), SecretString::from(key.to_string()));
    }
    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_agent_defaults() {
        let config = AgentConfig::from_lookup(lookup(&[
            ("FLEET_AGENT_ID", "agent-a"),
            ("FLEET_CLOUD_URL", "ws://localhost:8787/agent/ws"),
            ("FLEET_API_KEY", "secret"),
        ]))
        .unwrap();

        assert_eq!(config.max_concurrent_tasks, 2);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.reconnect.failure_threshold, 5);
        assert_eq!(config.reconnect.long_backoff, Duration::from_secs(60));
        assert_eq!(config.thresholds.memory.critical, Some(97.0));
        assert_eq!(config.thresholds.cpu.critical, None);
        assert_eq!(config.executor_program, "claude");
        assert!(config.executor_args.is_empty());
        assert_eq!(config.api_key.expose_secret(), "secret");
    }

    #[test]
    fn test_agent_requires_identity() {
        let err = AgentConfig::from_lookup(lookup(&[("FLEET_CLOUD_URL", "ws://x")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing { key } if key == "FLEET_AGENT_ID"));
    }

    #[test]
    fn test_agent_rejects_bad_values() {
        let base = [
            ("FLEET_AGENT_ID", "agent-a"),
            ("FLEET_CLOUD_URL", "ws://x"),
            ("FLEET_API_KEY", "k"),
        ];

        let mut vars = base.to_vec();
        vars.push(("FLEET_MAX_CONCURRENT_TASKS", "lots"));
        assert!(matches!(
            AgentConfig::from_lookup(lookup(&vars)).unwrap_err(),
            ConfigError::Invalid { .. }
        ));

        let mut vars = base.to_vec();
        vars.push(("FLEET_MEMORY_REJECT_PCT", "150"));
        assert!(AgentConfig::from_lookup(lookup(&vars)).is_err());

        let mut vars = base.to_vec();
        vars.push(("FLEET_MAX_CONCURRENT_TASKS", "0"));
        assert!(AgentConfig::from_lookup(lookup(&vars)).is_err());
    }

    #[test]
    fn test_executor_args_split() {
        let config = AgentConfig::from_lookup(lookup(&[
            ("FLEET_AGENT_ID", "agent-a"),
            ("FLEET_CLOUD_URL", "ws://x"),
            ("FLEET_API_KEY", "k"),
            ("FLEET_EXECUTOR_ARGS", "--print  --output-format stream-json"),
            ("FLEET_EXECUTOR_WORKDIR", "/srv/work"),
        ]))
        .unwrap();
        assert_eq!(
            config.executor_args,
            vec!["--print", "--output-format", "stream-json"]
        );
        assert_eq!(config.executor_workdir, Some(PathBuf::from("/srv/work")));
    }

    #[test]
    fn test_cloud_defaults_use_memory_store() {
        let config = CloudConfig::from_lookup(lookup(&[])).unwrap();
        assert!(config.database.is_none());
        assert_eq!(config.bind_addr.port(), 8787);
        assert_eq!(config.mailbox_ttl, Duration::from_secs(86_400));
        assert!(!config.admin_token().is_configured());

        let options = config.server_options();
        assert_eq!(options.heartbeat_timeout, Duration::from_secs(90));
        assert_eq!(options.router.progress_window, 8);
        assert_eq!(options.router.orphan_grace, Duration::from_secs(60));
    }

    #[test]
    fn test_cloud_agent_keys() {
        let config = CloudConfig::from_lookup(lookup(&[
            ("FLEET_AGENT_KEYS", "agent-a:key-a, agent-b:key-b"),
            ("DATABASE_URL", "postgres://localhost/fleet"),
        ]))
        .unwrap();
        let store = config.key_store();
        assert!(store.validate("agent-a", "key-a"));
        assert!(store.validate("agent-b", "key-b"));
        assert!(!store.validate("agent-c", "key-a"));

        let db = config.database.unwrap();
        assert_eq!(db.url(), "postgres://localhost/fleet");
        assert_eq!(db.pool_size, 10);
    }

    #[test]
    fn test_cloud_rejects_malformed_keys() {
        let err = CloudConfig::from_lookup(lookup(&[("FLEET_AGENT_KEYS", "agent-a")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }
}
