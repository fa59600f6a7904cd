use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use gpucat_storage::{catalog_facets, filter_catalog, snapshot_for_provider, CatalogQuery, PgStore};
use gpucat_sync::{
    build_persistent_pipeline, build_pipeline_from_env, run_retention_cleanup, run_sync_once_from_env,
    SyncConfig, SyncPipeline,
};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str =
    "gpucat_core=info,gpucat_storage=info,gpucat_adapters=info,gpucat_sync=info,gpucat_cli=info";

#[derive(Debug, Parser)]
#[command(name = "gpucat-cli")]
#[command(about = "GPU pricing catalog command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion cycle.
    Sync,
    /// Apply database migrations.
    Migrate,
    /// Run ingestion cycles on the configured cron until interrupted.
    Schedule,
    /// Snapshot row count, providers and last observation.
    Stats,
    /// Price series for one stable key.
    History { stable_key: String },
    /// One provider's snapshot.
    Snapshot { provider: String },
    /// Filtered catalog page, or facet counts.
    Catalog {
        #[arg(long = "provider")]
        providers: Vec<String>,
        #[arg(long = "model")]
        gpu_models: Vec<String>,
        #[arg(long)]
        search: Option<String>,
        #[arg(long, default_value_t = 0)]
        cursor: usize,
        #[arg(long)]
        size: Option<usize>,
        #[arg(long)]
        facets: bool,
    },
    /// Delete price samples older than the cleanup retention.
    Prune {
        #[arg(long)]
        days: Option<i64>,
    },
    /// Delete every snapshot row.
    Clear,
}

/// Pipeline for commands that read or maintain an existing catalog.
async fn open_catalog() -> Result<SyncPipeline> {
    build_persistent_pipeline(SyncConfig::from_env()).await
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value).context("serializing output")?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} providers={} stored={} touched={} pruned={} reports={}",
                summary.run_id,
                summary.providers.len(),
                summary.outcome.stored,
                summary.outcome.touched_stable_keys.len(),
                summary.outcome.pruned_samples,
                summary.reports_dir
            );
            if let Some(error) = &summary.outcome.history_error {
                eprintln!("price history degraded: {error}");
            }
        }
        Commands::Migrate => {
            let config = SyncConfig::from_env();
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let pipeline = Arc::new(build_pipeline_from_env().await?);
            let Some(mut sched) = pipeline.maybe_build_scheduler().await? else {
                bail!("scheduler disabled; set GPUCAT_SCHEDULER_ENABLED=1");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().sync_cron, "scheduler running");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down scheduler");
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Stats => {
            let pipeline = open_catalog().await?;
            print_json(&pipeline.replacer().pricing().cache_stats().await?)?;
        }
        Commands::History { stable_key } => {
            let pipeline = open_catalog().await?;
            let series = pipeline.replacer().history_reader().get_series(&stable_key).await?;
            print_json(&series)?;
        }
        Commands::Snapshot { provider } => {
            let pipeline = open_catalog().await?;
            match snapshot_for_provider(pipeline.replacer().pricing().as_ref(), &provider).await? {
                Some(snapshot) => print_json(&snapshot)?,
                None => bail!("no snapshot rows for provider {provider}"),
            }
        }
        Commands::Catalog {
            providers,
            gpu_models,
            search,
            cursor,
            size,
            facets,
        } => {
            let pipeline = open_catalog().await?;
            let records = pipeline.replacer().pricing().all_records().await?;
            if facets {
                print_json(&catalog_facets(&records))?;
            } else {
                let query = CatalogQuery {
                    providers,
                    gpu_models,
                    search,
                    cursor,
                    size,
                    ..Default::default()
                };
                print_json(&filter_catalog(&records, &query))?;
            }
        }
        Commands::Prune { days } => {
            let pipeline = open_catalog().await?;
            let deleted = match days {
                Some(days) => {
                    run_retention_cleanup(
                        pipeline.replacer().history().as_ref(),
                        pipeline.replacer().clock().as_ref(),
                        days,
                    )
                    .await?
                }
                None => pipeline.run_retention_cleanup().await?,
            };
            println!("pruned {deleted} price samples");
        }
        Commands::Clear => {
            let pipeline = open_catalog().await?;
            let deleted = pipeline.replacer().pricing().clear_all().await?;
            println!("cleared {deleted} snapshot rows");
        }
    }

    Ok(())
}
