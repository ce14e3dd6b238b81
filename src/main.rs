use anyhow::Result;
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use protect_vault::config::{Cli, Config, NvrConfig};
use protect_vault::error::Error;
use protect_vault::ledger::Ledger;
use protect_vault::notify::{Level, Notifier};
use protect_vault::nvr::ProtectClient;
use protect_vault::supervisor::Supervisor;
use protect_vault::transfer::{RcloneTransfer, Transfer};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Exit code for configuration errors; container entrypoints treat it as
/// "do not restart".
const EXIT_CONFIG_ERROR: i32 = 200;

const CONNECT_ATTEMPTS: u32 = 20;
const CONNECT_DELAY_INITIAL: Duration = Duration::from_secs(5);
const CONNECT_DELAY_CAP: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose.min(5));

    let config = match Config::from_cli(cli) {
        Ok(config) => config,
        Err(e) => {
            error!("{e:#}");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    match run(config).await {
        Ok(()) => {}
        Err(e) => {
            if e.downcast_ref::<Error>()
                .map(|e| matches!(e, Error::Config(_)))
                .unwrap_or(false)
            {
                error!("{e:#}");
                std::process::exit(EXIT_CONFIG_ERROR);
            }
            error!("{e:#}");
            std::process::exit(1);
        }
    }
}

async fn run(config: Config) -> Result<()> {
    info!("Starting...");

    let notifier = Arc::new(Notifier::new(config.notifiers.clone()));
    if notifier.has_targets() {
        notifier
            .dispatch(Level::Info, "protect-vault", "Starting UniFi Protect backup")
            .await;
    }

    // Make sure rclone is installed and the destination remote exists before
    // touching anything else.
    info!("Checking rclone configuration...");
    let transfer = Arc::new(RcloneTransfer::new(
        config.rclone_destination.clone(),
        config.rclone_args.clone(),
        config.rclone_purge_args.clone(),
    ));
    transfer.check().await?;

    info!("Connecting to UniFi Protect...");
    let nvr = Arc::new(connect_with_retry(&config.nvr).await?);

    let ledger = Ledger::open(&config.sqlite_path).await?;

    let supervisor = Supervisor::new(config, nvr, transfer, ledger, notifier);
    supervisor.run(CancellationToken::new()).await
}

/// The NVR may still be booting (e.g. after a power cut); retry with a
/// doubling delay before giving up.
async fn connect_with_retry(config: &NvrConfig) -> Result<ProtectClient> {
    let mut delay = CONNECT_DELAY_INITIAL;

    for attempt in 1..=CONNECT_ATTEMPTS {
        match ProtectClient::connect(config).await {
            Ok(client) => return Ok(client),
            Err(e) => {
                if attempt == CONNECT_ATTEMPTS {
                    return Err(e.context(format!(
                        "failed to connect to UniFi Protect after {CONNECT_ATTEMPTS} attempts"
                    )));
                }
                warn!("Failed to connect to UniFi Protect, retrying in {delay:?}: {e:#}");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(CONNECT_DELAY_CAP);
            }
        }
    }
    unreachable!()
}

/// Map `-v` counts onto logger filters. Higher levels progressively open up
/// our own modules first, then the libraries underneath.
fn init_logging(verbosity: u8) {
    let (crate_level, global_level) = match verbosity {
        0 => (LevelFilter::Info, LevelFilter::Warn),
        1 => (LevelFilter::Debug, LevelFilter::Warn),
        2 => (LevelFilter::Trace, LevelFilter::Warn),
        3 => (LevelFilter::Trace, LevelFilter::Info),
        4 => (LevelFilter::Trace, LevelFilter::Info),
        _ => (LevelFilter::Trace, LevelFilter::Debug),
    };

    env_logger::Builder::new()
        .filter_level(global_level)
        .filter_module("protect_vault", crate_level)
        .format_timestamp_secs()
        .init();
}
