use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use rjip_core::SourceKind;
use rjip_sync::{load_sources, migrate::run_migrations, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "rjip-cli")]
#[command(about = "Remote jobs ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass over every active source.
    Sync {
        /// Fetch, filter and report without writing to the database.
        #[arg(long)]
        dry_run: bool,
        /// Override RJIP_MAX_AGE_DAYS for this run.
        #[arg(long)]
        max_age_days: Option<u32>,
    },
    /// List the configured sources.
    Sources,
    /// Apply SQL migrations through DATABASE_URL.
    Migrate,
    /// Delete persisted listings older than JOB_PRUNE_MAX_AGE_DAYS.
    Prune,
    /// Run the sync on the configured cron schedule until interrupted.
    Schedule,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync {
        dry_run: false,
        max_age_days: None,
    }) {
        Commands::Sync {
            dry_run,
            max_age_days,
        } => {
            config.dry_run |= dry_run;
            if let Some(days) = max_age_days {
                config.max_age_days = days;
            }
            let summary = rjip_sync::run_sync_once(config).await?;
            println!(
                "sync complete: run_id={} status={:?} sources={} failed={} skipped={} fresh={} persisted={} reports={}",
                summary.run_id,
                summary.status,
                summary.sources.len(),
                summary.failed_sources().count(),
                summary.skipped_sources.len(),
                summary.totals.total_fresh,
                summary
                    .persistence
                    .as_ref()
                    .map(|p| p.written.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                summary.reports_dir.as_deref().unwrap_or("-"),
            );
        }
        Commands::Sources => {
            let sources = load_sources(&config.sources_path()).await?;
            for source in &sources {
                let kind = match source.kind {
                    SourceKind::Feed => "feed",
                    SourceKind::PagedApi => "api",
                };
                let state = if source.active {
                    "active".to_string()
                } else {
                    format!(
                        "inactive ({})",
                        source.inactive_reason.as_deref().unwrap_or("no reason given")
                    )
                };
                println!("{:<28} {:<4} {:<40} {}", source.id, kind, state, source.endpoint);
            }
        }
        Commands::Migrate => {
            let database_url = config
                .database_url
                .clone()
                .ok_or_else(|| anyhow!("DATABASE_URL is required for migrate"))?;
            run_migrations(&database_url).await?;
            println!("migrations applied");
        }
        Commands::Prune => {
            config.dry_run = false;
            let pipeline = SyncPipeline::new(config, Vec::new())?;
            let deleted = pipeline.prune().await?;
            println!("pruned {deleted} listings");
        }
        Commands::Schedule => {
            config.scheduler_enabled = true;
            let sources = load_sources(&config.sources_path()).await?;
            let pipeline = Arc::new(SyncPipeline::new(config, sources)?);
            let mut sched = pipeline
                .maybe_build_scheduler()
                .await?
                .ok_or_else(|| anyhow!("scheduler was not built"))?;
            sched.start().await.context("starting scheduler")?;
            info!(
                cron_1 = %pipeline.config().sync_cron_1,
                cron_2 = %pipeline.config().sync_cron_2,
                "scheduler running; ctrl-c to stop"
            );
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            pipeline.cancel_token().cancel();
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
