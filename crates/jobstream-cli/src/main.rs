use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use jobstream_core::RunStatus;
use jobstream_sync::{build_scheduler, JobStore, PgJobStore, PgStoreConfig, RunOrchestrator, SyncConfig};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "jobstream-cli")]
#[command(about = "Streams job listings from the upstream API into Postgres or local files")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Execute one run and print its summary as JSON.
    Run {
        #[arg(long)]
        max_pages: Option<u32>,
        #[arg(long)]
        no_db: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Run on a cron schedule until interrupted.
    Schedule {
        #[arg(long)]
        cron: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Run {
        max_pages: None,
        no_db: false,
    }) {
        Commands::Run { max_pages, no_db } => {
            if max_pages.is_some() {
                config.max_pages = max_pages;
            }
            if no_db {
                config.db_enabled = false;
            }
            let orchestrator = Arc::new(RunOrchestrator::new(config)?);
            spawn_stop_on_ctrl_c(orchestrator.clone());

            let summary = orchestrator.run().await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if summary.status == RunStatus::Failed {
                anyhow::bail!(
                    "run failed: {}",
                    summary.reason.unwrap_or_else(|| "unknown reason".into())
                );
            }
        }
        Commands::Migrate => {
            let pg = PgStoreConfig::from_sync_config(&config)
                .context("DATABASE_URL is not set or the database is disabled")?;
            let store = PgJobStore::new(pg);
            store.migrate().await.context("applying migrations")?;
            store.close().await;
            println!("migrations applied");
        }
        Commands::Schedule { cron } => {
            let cron = cron.unwrap_or_else(|| config.schedule_cron.clone());
            let orchestrator = Arc::new(RunOrchestrator::new(config)?);
            let mut sched = build_scheduler(orchestrator.clone(), &cron).await?;
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler started");

            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down scheduler");
            sched.shutdown().await.context("stopping scheduler")?;
            if orchestrator.stop() {
                info!("waiting for the active run to drain");
                orchestrator.wait_until_idle().await;
            }
        }
    }

    Ok(())
}

fn spawn_stop_on_ctrl_c(orchestrator: Arc<RunOrchestrator>) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                orchestrator.stop();
            }
            Err(err) => warn!(error = %err, "could not listen for ctrl-c"),
        }
    });
}
