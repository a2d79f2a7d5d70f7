use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use solvelog_storage::PgStore;
use solvelog_sync::SyncConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "solvelog")]
#[command(about = "Collects recent accepted submissions for tracked judge users")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// One scrape run; prints the invocation response as JSON.
    Run,
    /// Apply database migrations.
    Migrate,
    /// Run on the configured cron schedule until interrupted.
    Schedule,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();
    init_tracing();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let response = solvelog_sync::handle_invocation().await;
            println!("{}", serde_json::to_string(&response)?);
            if response.status_code != 200 {
                return Ok(ExitCode::FAILURE);
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env()?;
            let store = PgStore::connect(&config.database_url, 1).await?;
            store.migrate().await?;
            info!("migrations applied");
        }
        Commands::Schedule => {
            let config = SyncConfig::from_env()?;
            if !config.scheduler_enabled {
                anyhow::bail!("SOLVELOG_SCHEDULER_ENABLED is not set; refusing to start the scheduler");
            }
            let pipeline = Arc::new(solvelog_sync::pipeline_from_config(&config).await?);
            let sched = solvelog_sync::maybe_build_scheduler(&config, pipeline)
                .await?
                .context("scheduler disabled")?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler started");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down");
        }
    }

    Ok(ExitCode::SUCCESS)
}
