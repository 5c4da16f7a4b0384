use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use apptsync_core::SystemClock;
use apptsync_provider::{AcuityClient, FixtureProvider, ProviderClient};
use apptsync_storage::{AppointmentStore, MemoryStore, PgStore};
use apptsync_sync::{
    build_snapshot_scheduler, maybe_build_snapshot_scheduler, AppConfig, DiffProjector,
    Reconciler, SyncContext,
};
use apptsync_web::AppState;
use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "apptsync")]
#[command(about = "Acuity appointment sync: webhook classifier, snapshot reconciler and hourly diff")]
struct Cli {
    #[command(flatten)]
    backends: Backends,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Args)]
struct Backends {
    /// Keep appointments in memory instead of Postgres.
    #[arg(long, global = true)]
    memory: bool,
    /// Serve provider data from a JSON array of Acuity records instead of the live API.
    #[arg(long, global = true, value_name = "PATH")]
    fixture: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP API (and the snapshot scheduler when enabled).
    Serve,
    /// Fetch the provider listing once and reconcile today's appointments.
    Snapshot,
    /// Print today's hourly diff as JSON.
    Diff,
    /// Apply database migrations.
    Migrate,
    /// Run only the snapshot scheduler until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Migrate => {
            let store = connect_pg(&config).await?;
            store.migrate().await.context("running migrations")?;
            println!("migrations applied");
        }
        Commands::Snapshot => {
            let ctx = build_context(&config, &cli.backends).await?;
            let reconciler = Reconciler::new(ctx, config.listing_limit, config.listing_today_only);
            let summary = reconciler.reconcile_snapshot().await?;
            println!(
                "snapshot complete: snapshot_id={} total={} deleted={} created={} updated={} skipped={}",
                summary.snapshot_id,
                summary.total,
                summary.deleted,
                summary.created,
                summary.updated,
                summary.skipped
            );
        }
        Commands::Diff => {
            let ctx = build_context(&config, &cli.backends).await?;
            let hours = config.load_business_hours().await?;
            let projector = DiffProjector::new(ctx, hours, config.snapshot_lead());
            let diff = projector.project_daily_diff().await?;
            println!("{}", serde_json::to_string_pretty(&diff)?);
        }
        Commands::Serve => {
            let ctx = build_context(&config, &cli.backends).await?;
            let hours = config.load_business_hours().await?;
            let state = AppState::new(ctx, &config, hours.clone());
            let scheduler =
                maybe_build_snapshot_scheduler(&config, state.reconciler.clone(), &hours).await?;
            if let Some(scheduler) = &scheduler {
                scheduler.start().await.context("starting snapshot scheduler")?;
            }
            apptsync_web::serve(state, config.web_port).await?;
        }
        Commands::Schedule => {
            let ctx = build_context(&config, &cli.backends).await?;
            let hours = config.load_business_hours().await?;
            let reconciler = Arc::new(Reconciler::new(
                ctx,
                config.listing_limit,
                config.listing_today_only,
            ));
            let mut scheduler = build_snapshot_scheduler(
                reconciler,
                &hours,
                config.snapshot_lead_minutes,
                config.calendar.tz(),
            )
            .await?;
            scheduler.start().await.context("starting snapshot scheduler")?;
            info!("snapshot scheduler running; press ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            scheduler.shutdown().await.context("stopping snapshot scheduler")?;
        }
    }

    Ok(())
}

async fn connect_pg(config: &AppConfig) -> Result<PgStore> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is not set")?;
    PgStore::connect(url)
        .await
        .context("connecting to postgres")
}

async fn build_context(config: &AppConfig, backends: &Backends) -> Result<SyncContext> {
    let store: Arc<dyn AppointmentStore> = if backends.memory {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(connect_pg(config).await?)
    };
    let provider: Arc<dyn ProviderClient> = match &backends.fixture {
        Some(path) => Arc::new(FixtureProvider::from_path(path)?),
        None => Arc::new(AcuityClient::new(config.acuity_config())?),
    };
    Ok(SyncContext::new(
        store,
        provider,
        Arc::new(SystemClock),
        config.calendar,
    ))
}
