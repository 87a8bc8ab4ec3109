/*
[INPUT]:  CLI arguments, YAML feed file, OS shutdown signals
[OUTPUT]: Running feed tails, periodic per-feed stats, exit code from feed outcomes
[POS]:    Binary entry point
[UPDATE]: When changing CLI flags, startup flow, or shutdown handling
*/

use anyhow::{Context, Result, anyhow};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use kucoin_ws_tail::{FeedReport, TailConfig, TailManager};

#[derive(Parser, Debug)]
#[command(name = "kucoin-ws-tail", version, about = "Tail KuCoin public push topics")]
struct Cli {
    #[arg(long = "config", value_name = "PATH")]
    config_path: PathBuf,
    #[arg(long = "log-level", value_name = "LEVEL", default_value = "info")]
    log_level: String,
    #[arg(long = "dry-run")]
    dry_run: bool,
    /// Seconds between per-feed stats lines; also how often finished feeds are noticed
    #[arg(long = "stats-interval-secs", value_name = "SECS", default_value_t = 30)]
    stats_interval_secs: u64,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Cli::parse();
    init_tracing(&args.log_level)?;

    info!(
        config_path = %args.config_path.display(),
        dry_run = args.dry_run,
        "starting kucoin-ws-tail"
    );

    let config = load_config(&args.config_path)?;
    info!(feed_count = config.feeds.len(), "configuration loaded");

    if args.dry_run {
        info!("dry-run requested; configuration validated");
        return Ok(ExitCode::SUCCESS);
    }

    let mut manager = TailManager::new();
    let shutdown = manager.shutdown_token();
    setup_signal_handlers(shutdown.clone());

    manager
        .spawn_from_config(config)
        .await
        .context("spawn feeds from config")?;
    info!("feeds started");

    let mut stats_tick =
        tokio::time::interval(Duration::from_secs(args.stats_interval_secs.max(1)));
    stats_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    stats_tick.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("shutdown signal received");
                break;
            }
            _ = stats_tick.tick() => {
                log_report(&manager.report());
                if manager.all_finished() {
                    warn!("every feed has finished; shutting down");
                    break;
                }
            }
        }
    }

    log_report(&manager.report());
    match manager.shutdown_and_wait().await {
        Ok(()) => {
            info!("feeds shutdown complete");
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            error!(error = %format!("{err:#}"), "feed ended with an error");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn log_report(report: &[FeedReport]) {
    for feed in report {
        info!(
            feed_id = %feed.feed_id,
            status = ?feed.status,
            messages = feed.messages,
            errors = feed.errors,
            reconnects = feed.reconnects,
            "feed stats"
        );
    }
}

fn init_tracing(log_level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(log_level).context("invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|err| anyhow!(err))
        .context("initialize tracing subscriber")?;
    Ok(())
}

fn load_config(path: &PathBuf) -> Result<TailConfig> {
    let path_str = path
        .to_str()
        .context("config path must be valid utf-8")?;
    TailConfig::from_file(path_str).context("load config")
}

fn setup_signal_handlers(shutdown: CancellationToken) {
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install SIGINT handler");
            return;
        }
        info!("received SIGINT");
        shutdown_clone.cancel();
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let shutdown_clone = shutdown.clone();
        tokio::spawn(async move {
            match signal(SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                    info!("received SIGTERM");
                    shutdown_clone.cancel();
                }
                Err(err) => {
                    warn!(error = %err, "failed to install SIGTERM handler");
                }
            }
        });
    }
}
