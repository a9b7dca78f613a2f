use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::{Context, Result};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::format::{Compact, DefaultFields};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::miner::Miner;

mod chat;
mod miner;
mod notify;
mod watcher;

/// Forced exit if graceful shutdown stalls past this.
const SHUTDOWN_WATCHDOG: Duration = Duration::from_secs(30);

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Directory of per-account YAML config files
    #[arg(short, long, default_value_t = String::from("config"))]
    config_dir: String,
    /// Simulate predictions, don't actually place them
    #[arg(short, long, default_value_t = false)]
    simulate: bool,
    /// Log to file
    #[arg(short, long)]
    log_file: Option<String>,
}

fn get_layer<S>(
    layer: tracing_subscriber::fmt::Layer<S>,
) -> tracing_subscriber::fmt::Layer<
    S,
    DefaultFields,
    tracing_subscriber::fmt::format::Format<Compact, ChronoLocal>,
> {
    layer
        .with_timer(ChronoLocal::new("%v %k:%M:%S %z".to_owned()))
        .compact()
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    let log_level = std::env::var("LOG").unwrap_or("info".to_owned());
    let tracing_opts = tracing_subscriber::registry()
        .with(
            EnvFilter::new(format!("twitch_points_daemon={log_level}"))
                .add_directive(format!("common={log_level}").parse()?),
        )
        .with(get_layer(tracing_subscriber::fmt::layer()));

    let _guard = if let Some(log_file) = &args.log_file {
        let file_appender = tracing_appender::rolling::never(".", log_file);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        tracing_opts
            .with(get_layer(tracing_subscriber::fmt::layer()).with_writer(non_blocking))
            .init();
        Some(guard)
    } else {
        tracing_opts.init();
        None
    };

    let accounts = common::config::load_config_dir(&PathBuf::from(&args.config_dir))
        .context("Loading account configs")?;
    info!(accounts = accounts.len(), "Parsed account configs");

    let root = CancellationToken::new();
    let mut miners: JoinSet<(String, Result<()>)> = JoinSet::new();

    for cfg in accounts {
        if !cfg.is_enabled() {
            info!(account = %cfg.username, "Account disabled, skipping");
            continue;
        }

        let username = cfg.username.clone();
        let miner = Miner::new(cfg, args.simulate, root.child_token());
        miners.spawn(async move {
            let result = miner.run().await;
            (username, result)
        });
    }

    if miners.is_empty() {
        warn!("No enabled accounts, exiting");
        return Ok(());
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            root.cancel();
        }
        Some(joined) = miners.join_next() => {
            match joined {
                Ok((username, Ok(()))) => info!(account = %username, "Miner exited"),
                Ok((username, Err(err))) => error!(account = %username, "Miner failed: {err:#}"),
                Err(err) => error!("Miner task failed: {err}"),
            }
            root.cancel();
        }
    }

    let drain = async {
        while let Some(joined) = miners.join_next().await {
            if let Ok((username, Err(err))) = joined {
                error!(account = %username, "Miner failed during shutdown: {err:#}");
            }
        }
    };

    if tokio::time::timeout(SHUTDOWN_WATCHDOG, drain).await.is_err() {
        error!("Shutdown stalled, forcing exit");
        std::process::exit(1);
    }

    info!("Shutdown complete");
    Ok(())
}
