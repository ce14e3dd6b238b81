//! Stage lifecycle management.
//!
//! The supervisor owns every channel and every stage. One cancellation
//! token drives cooperative shutdown; producers stop first, the download
//! stage drains its current item on a bounded grace, the upload stage
//! finishes its in-flight handoff, and the purger stops at the next pass
//! boundary. Fatal errors escalate; anything else restarts its stage with
//! backoff.

use crate::config::Config;
use crate::error::Error;
use crate::ledger::Ledger;
use crate::notify::{Level, Notifier};
use crate::nvr::{EventFilter, NvrClient};
use crate::pipeline::download::Downloader;
use crate::pipeline::listener::EventListener;
use crate::pipeline::missing::MissingEventChecker;
use crate::pipeline::upload::{probe_available, Uploader};
use crate::pipeline::{PipelineTracker, RetryCounter, UploadStatus, MAX_ATTEMPTS};
use crate::purge::Purger;
use crate::transfer::Transfer;
use anyhow::Result;
use async_trait::async_trait;
use futures_util::FutureExt;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const STAGE_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const STAGE_BACKOFF_CAP: Duration = Duration::from_secs(60);
/// A stage that ran this long before failing gets a fresh backoff.
const STAGE_HEALTHY_RUN: Duration = Duration::from_secs(300);
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_secs(60);

/// A restartable worker.
#[async_trait]
trait Stage: Send {
    fn name(&self) -> &'static str;
    async fn run_once(&mut self) -> Result<()>;
}

macro_rules! impl_stage {
    ($type:ty, $name:literal) => {
        #[async_trait]
        impl Stage for $type {
            fn name(&self) -> &'static str {
                $name
            }
            async fn run_once(&mut self) -> Result<()> {
                self.run().await
            }
        }
    };
}

impl_stage!(EventListener, "event listener");
impl_stage!(MissingEventChecker, "missing event checker");
impl_stage!(Downloader, "downloader");
impl_stage!(Uploader, "uploader");
impl_stage!(Purger, "purge task");

pub struct Supervisor {
    config: Config,
    nvr: Arc<dyn NvrClient>,
    transfer: Arc<dyn Transfer>,
    ledger: Ledger,
    notifier: Arc<Notifier>,
}

impl Supervisor {
    pub fn new(
        config: Config,
        nvr: Arc<dyn NvrClient>,
        transfer: Arc<dyn Transfer>,
        ledger: Ledger,
        notifier: Arc<Notifier>,
    ) -> Self {
        Supervisor {
            config,
            nvr,
            transfer,
            ledger,
            notifier,
        }
    }

    /// Run until interrupted or a stage fails fatally.
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let filter = EventFilter {
            detection_types: self.config.detection_types.clone(),
            ignore_cameras: self.config.ignore_cameras.clone(),
            max_event_length: chrono::Duration::from_std(self.config.max_event_length)
                .map_err(|e| Error::Config(format!("max event length out of range: {e}")))?,
        };

        let (realtime_tx, realtime_rx) = mpsc::channel(self.config.event_queue_size);
        let (backlog_tx, backlog_rx) = mpsc::channel(self.config.event_queue_size);
        let (work_tx, work_rx) = mpsc::channel(1);
        let (reconnect_tx, reconnect_rx) = mpsc::channel(1);
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<anyhow::Error>(4);

        let tracker = Arc::new(PipelineTracker::new());
        let retry = Arc::new(RetryCounter::new(self.config.retention, MAX_ATTEMPTS));
        let status = Arc::new(UploadStatus::new());

        let probe = probe_available().await;
        if probe {
            debug!("ffprobe found, clip durations will be checked");
        } else {
            debug!("ffprobe not found, skipping clip duration checks");
        }

        let listener = EventListener::new(
            self.nvr.clone(),
            self.ledger.clone(),
            filter.clone(),
            tracker.clone(),
            realtime_tx,
            reconnect_tx,
            self.config.max_event_length,
            token.clone(),
        );
        let missing = MissingEventChecker::new(
            self.nvr.clone(),
            self.ledger.clone(),
            filter,
            tracker.clone(),
            retry.clone(),
            backlog_tx,
            reconnect_rx,
            self.config.retention,
            self.config.missing_interval,
            self.config.skip_missing,
            token.clone(),
        );
        let downloader = Downloader::new(
            self.nvr.clone(),
            self.ledger.clone(),
            self.config.template.clone(),
            self.config.rclone_destination.clone(),
            realtime_rx,
            backlog_rx,
            work_tx,
            tracker.clone(),
            retry.clone(),
            self.notifier.clone(),
            self.config.download_buffer_size as usize,
            token.clone(),
        );
        let uploader = Uploader::new(
            self.transfer.clone(),
            self.ledger.clone(),
            work_rx,
            tracker,
            retry,
            self.notifier.clone(),
            status,
            probe,
            token.clone(),
        );
        let purger = Purger::new(
            self.ledger.clone(),
            self.transfer.clone(),
            self.config.retention,
            self.config.purge_interval,
            token.clone(),
        );

        info!("Starting tasks...");
        let stages: Vec<Box<dyn Stage>> = vec![
            Box::new(listener),
            Box::new(missing),
            Box::new(downloader),
            Box::new(uploader),
            Box::new(purger),
        ];
        let handles: Vec<JoinHandle<()>> = stages
            .into_iter()
            .map(|stage| {
                tokio::spawn(run_stage(
                    stage,
                    token.clone(),
                    fatal_tx.clone(),
                    self.notifier.clone(),
                ))
            })
            .collect();
        drop(fatal_tx);

        let fatal = tokio::select! {
            _ = token.cancelled() => None,
            interrupt = tokio::signal::ctrl_c() => {
                match interrupt {
                    Ok(()) => info!("Interrupt received, shutting down"),
                    Err(e) => warn!("Failed to listen for interrupts: {e}"),
                }
                None
            }
            fatal = fatal_rx.recv() => fatal,
        };

        token.cancel();
        for handle in handles {
            if tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, handle).await.is_err() {
                warn!("A stage did not stop within {SHUTDOWN_JOIN_TIMEOUT:?}");
            }
        }
        self.ledger.close().await;

        match fatal {
            None => {
                info!("Shutdown complete");
                Ok(())
            }
            Some(e) => {
                error!("Stopped on fatal error: {e:#}");
                self.notifier
                    .dispatch(Level::Error, "Fatal error", &format!("{e:#}"))
                    .await;
                Err(e)
            }
        }
    }
}

/// Drive one stage, restarting it with bounded backoff on non-fatal errors
/// and panics, escalating fatal errors to the supervisor.
async fn run_stage(
    mut stage: Box<dyn Stage>,
    token: CancellationToken,
    fatal_tx: mpsc::Sender<anyhow::Error>,
    notifier: Arc<Notifier>,
) {
    let mut backoff = STAGE_BACKOFF_INITIAL;

    loop {
        let started = Instant::now();
        let result = std::panic::AssertUnwindSafe(stage.run_once())
            .catch_unwind()
            .await;

        let error = match result {
            Ok(Ok(())) => {
                debug!("{} stopped", stage.name());
                return;
            }
            Ok(Err(e)) => {
                if e.downcast_ref::<Error>().map(Error::is_fatal).unwrap_or(false) {
                    error!("{} hit a fatal error: {e:#}", stage.name());
                    let _ = fatal_tx.send(e).await;
                    return;
                }
                format!("{e:#}")
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                format!("panicked: {message}")
            }
        };

        if token.is_cancelled() {
            return;
        }
        if started.elapsed() > STAGE_HEALTHY_RUN {
            backoff = STAGE_BACKOFF_INITIAL;
        }

        error!("{} failed: {error}; restarting in {backoff:?}", stage.name());
        notifier
            .dispatch(
                Level::Error,
                "Stage restarted",
                &format!("{}: {error}", stage.name()),
            )
            .await;

        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(STAGE_BACKOFF_CAP);
    }
}
