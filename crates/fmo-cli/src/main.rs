use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fmo_sync::{build_scheduler, pipeline_from_env, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "fmo-cli")]
#[command(about = "Keeps the production dashboard worksheets in sync with the database")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync now, then again every FMO_SYNC_INTERVAL_SECS until Ctrl-C.
    Run,
    /// Run a single sync cycle and print its summary as JSON.
    Once,
    /// Resolve the header of every configured worksheet without writing anything.
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    let pipeline = pipeline_from_env(config).context("building sync pipeline")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_forever(Arc::new(pipeline)).await?,
        Commands::Once => {
            let summary = pipeline.run_once().await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&summary).context("serializing cycle summary")?
            );
        }
        Commands::Check => {
            for report in pipeline.check_headers().await {
                match (&report.error, report.virgin) {
                    (Some(err), _) => println!("{}: ERROR {err}", report.worksheet),
                    (None, true) => println!("{}: empty, header will be written", report.worksheet),
                    (None, false) => {
                        println!("{}: ok", report.worksheet);
                        for (letter, title, field) in &report.columns {
                            println!("  {letter:>3}  {title} -> {field}");
                        }
                        for title in &report.missing {
                            println!("  not on sheet: {title}");
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

async fn run_forever(pipeline: Arc<SyncPipeline>) -> Result<()> {
    pipeline.run_logged().await;

    let mut sched = build_scheduler(Arc::clone(&pipeline)).await?;
    sched.start().await.context("starting scheduler")?;
    info!(
        interval_secs = pipeline.config().sync_interval_secs,
        worksheets = pipeline.layouts().len(),
        "scheduler started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down");
    sched.shutdown().await.context("stopping scheduler")?;
    Ok(())
}
