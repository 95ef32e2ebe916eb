use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tcs_storage::{
    DirectoryFetcher, HttpFetcher, MemoryGateway, PayloadFetcher, PersistenceGateway, PgGateway,
};
use tcs_sync::{
    report_markdown, LogSummarySink, PipelineSettings, ReportDirSink, RunSummary, Scheduler,
    SummarySink, SyncConfig,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tcs-cli")]
#[command(about = "Tournament calendar sync command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Default, Args)]
struct SourceArgs {
    /// Read `<dir>/<source_id>/payload.{html,json}` instead of fetching over HTTP.
    #[arg(long)]
    fixtures: Option<PathBuf>,
    /// Keep records in memory instead of Postgres (nothing persists past the process).
    #[arg(long)]
    memory: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync cycle and exit.
    Sync(SourceArgs),
    /// Run the periodic scheduler until interrupted.
    Run(SourceArgs),
    /// Apply database migrations.
    Migrate,
    /// Summarize the most recent runs from the reports directory.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn build_fetcher(
    settings: &PipelineSettings,
    config: &SyncConfig,
    args: &SourceArgs,
) -> Result<Arc<dyn PayloadFetcher>> {
    match &args.fixtures {
        Some(dir) => Ok(Arc::new(DirectoryFetcher::new(dir))),
        None => {
            let fetcher = HttpFetcher::new(settings.http_client_config(&config.user_agent))
                .context("building http client")?;
            Ok(Arc::new(fetcher))
        }
    }
}

async fn open_gateway(
    config: &SyncConfig,
    args: &SourceArgs,
) -> Result<Arc<dyn PersistenceGateway>> {
    if args.memory {
        warn!("using in-memory store; results are discarded on exit");
        return Ok(Arc::new(MemoryGateway::new()));
    }
    let gateway = PgGateway::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    Ok(Arc::new(gateway))
}

fn sinks(config: &SyncConfig) -> Vec<Arc<dyn SummarySink>> {
    vec![
        Arc::new(LogSummarySink),
        Arc::new(ReportDirSink::new(config.reports_dir.clone())),
    ]
}

fn print_summary(summary: &RunSummary) {
    let totals = summary.totals();
    println!(
        "sync complete: run_id={} sources={} failed={} inserted={} updated={} \
         unchanged={} archived={}",
        summary.run_id,
        summary.sources.len(),
        summary.failed_sources().len(),
        totals.inserted,
        totals.updated,
        totals.noop,
        totals.archived
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync(SourceArgs::default())) {
        Commands::Sync(args) => {
            let settings = PipelineSettings::load(&config.config_path)?;
            let pipeline = settings.pipeline(
                build_fetcher(&settings, &config, &args)?,
                open_gateway(&config, &args).await?,
            );
            let summary = pipeline.run_once().await;
            for sink in sinks(&config) {
                sink.publish(&summary).await?;
            }
            print_summary(&summary);
        }
        Commands::Run(args) => {
            let settings = PipelineSettings::load(&config.config_path)?;
            let pipeline = settings.pipeline(
                build_fetcher(&settings, &config, &args)?,
                open_gateway(&config, &args).await?,
            );
            let scheduler = sinks(&config).into_iter().fold(
                Scheduler::new(pipeline, settings.interval(), settings.run_on_start),
                Scheduler::with_sink,
            );
            scheduler.start().await?;
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            info!("shutdown requested");
            scheduler.stop().await?;
        }
        Commands::Migrate => {
            let gateway = PgGateway::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            gateway.migrate().await.context("applying migrations")?;
            println!("migrations applied");
        }
        Commands::Report { runs } => {
            println!("{}", report_markdown(runs, &config.reports_dir)?);
        }
    }

    Ok(())
}
