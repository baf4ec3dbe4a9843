//! Command-line entry points for the two process roles.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::agent::{AgentRuntime, ExitReason};
use crate::cloud::{CloudServer, CloudState};
use crate::config::{AgentConfig, CloudConfig};
use crate::db::{Database, InMemoryStore, Store};

#[derive(Parser, Debug)]
#[command(name = "fleetlink")]
#[command(about = "Agent fleet coordination: agent runtime and cloud coordinator", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, global = true, env = "FLEET_LOG_FORMAT")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Run an agent: connect to the cloud and execute tasks
    Agent(AgentArgs),

    /// Run the cloud coordinator
    Cloud(CloudArgs),

    /// Apply database migrations and exit
    Migrate,
}

#[derive(Args, Debug, Clone, Default)]
pub struct AgentArgs {
    /// Agent id (overrides FLEET_AGENT_ID)
    #[arg(long)]
    pub agent_id: Option<String>,

    /// Coordinator WebSocket URL (overrides FLEET_CLOUD_URL)
    #[arg(long)]
    pub cloud_url: Option<String>,

    /// Maximum concurrently running tasks (overrides FLEET_MAX_CONCURRENT_TASKS)
    #[arg(long)]
    pub max_concurrent_tasks: Option<usize>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct CloudArgs {
    /// Listen address (overrides FLEET_BIND_ADDR)
    #[arg(long)]
    pub bind: Option<SocketAddr>,
}

impl AgentArgs {
    fn apply(self, config: &mut AgentConfig) {
        if let Some(agent_id) = self.agent_id {
            config.agent_id = agent_id;
        }
        if let Some(url) = self.cloud_url {
            config.cloud_url = url;
        }
        if let Some(max) = self.max_concurrent_tasks {
            config.max_concurrent_tasks = max.max(1);
        }
    }
}

/// Run the agent until it stops. The caller exits with the returned code.
pub async fn run_agent(args: AgentArgs) -> anyhow::Result<ExitReason> {
    let mut config = AgentConfig::from_env()?;
    args.apply(&mut config);
    tracing::info!(
        agent_id = %config.agent_id,
        cloud_url = %config.cloud_url,
        max_concurrent_tasks = config.max_concurrent_tasks,
        "Starting agent"
    );
    Ok(AgentRuntime::from_config(&config).run().await)
}

async fn open_database(config: &CloudConfig) -> anyhow::Result<Arc<dyn Database>> {
    match &config.database {
        Some(db) => {
            let store = Store::new(db).await?;
            store.run_migrations().await?;
            tracing::info!(pool_size = db.pool_size, "Using PostgreSQL store");
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

/// Run the coordinator until ctrl-c.
pub async fn run_cloud(args: CloudArgs) -> anyhow::Result<()> {
    let mut config = CloudConfig::from_env()?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }

    let db = open_database(&config).await?;
    let state = CloudState::new(db, config.key_store(), config.server_options());
    let mut server = CloudServer::new(config.bind_addr, state, config.admin_token());
    let addr = server.start().await?;
    tracing::info!(%addr, admin_api = config.admin_token.is_some(), "Coordinator ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Interrupt received, shutting down");
    server.shutdown().await;
    Ok(())
}

/// Apply migrations against DATABASE_URL.
pub async fn run_migrate() -> anyhow::Result<()> {
    let config = CloudConfig::from_env()?;
    let Some(db) = &config.database else {
        anyhow::bail!("DATABASE_URL must be set to run migrations");
    };
    Store::new(db).await?.run_migrations().await?;
    tracing::info!("Migrations applied");
    Ok(())
}
