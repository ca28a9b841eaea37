use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

use show_sync::config;
use show_sync::handlers::{Timer, TriggerResponse};
use show_sync::runtime::Runtime;

#[derive(Debug, Parser)]
#[command(author, version, about = "Mirror the TVMaze catalog into a local database")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Process queues and timers until Ctrl-C
    Run {
        /// Exit once no message is visible instead of waiting for more
        #[arg(long)]
        until_idle: bool,
    },
    /// Enqueue a full catalog crawl
    StartFullSync {
        #[arg(long)]
        page: Option<String>,
    },
    /// Stage every known show id for a seasons/episodes crawl
    StartSeasonsEpisodes,
    /// Stage the upstream change feed (day, week or month)
    SweepChanges {
        #[arg(long)]
        since: Option<String>,
    },
    /// Turn pending updates into seasons/episodes refresh work
    DrainBacklog,
    /// Print an example configuration
    PrintConfig,
}

fn report(response: TriggerResponse) -> Result<()> {
    println!("{response}");
    if !response.is_success() {
        bail!("request failed with status {}", response.status);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    if let Command::PrintConfig = args.command {
        print!("{}", config::example());
        return Ok(());
    }

    let cfg = config::load(Some(&args.config))?;
    let runtime = Runtime::from_config(cfg).await?;
    let handlers = runtime.handlers();

    match args.command {
        Command::Run { until_idle: true } => {
            let handled = runtime.run_until_idle().await?;
            info!(handled, "queues idle");
        }
        Command::Run { until_idle: false } => runtime.run().await?,
        Command::StartFullSync { page } => report(handlers.start_full_sync(page.as_deref()).await)?,
        Command::StartSeasonsEpisodes => report(handlers.start_seasons_episodes_crawl().await)?,
        Command::SweepChanges { since } => report(handlers.sweep_changes(since.as_deref()).await)?,
        Command::DrainBacklog => {
            handlers.on_timer(Timer::DrainBacklog).await?;
        }
        Command::PrintConfig => {}
    }
    Ok(())
}
