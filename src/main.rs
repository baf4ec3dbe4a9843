use clap::Parser;
use tracing_subscriber::EnvFilter;

use fleetlink::cli::{Cli, Command, LogFormat, run_agent, run_cloud, run_migrate};

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("fleetlink=info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Agent(args) => {
            let reason = run_agent(args).await?;
            std::process::exit(reason.exit_code());
        }
        Command::Cloud(args) => run_cloud(args).await,
        Command::Migrate => run_migrate().await,
    }
}
