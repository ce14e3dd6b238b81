//! Missing-event reconciler.
//!
//! Diffs the NVR's event history over the retention window against the
//! ledger and re-injects anything that was missed, e.g. while the agent was
//! offline. Runs at startup, whenever the listener reconnects, and on a
//! timer.

use crate::error::Error;
use crate::ledger::{Ledger, LedgerRow};
use crate::nvr::{Event, EventFilter, NvrClient};
use crate::pipeline::{PipelineTracker, RetryCounter};
use anyhow::{anyhow, Result};
use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub struct MissingEventChecker {
    nvr: Arc<dyn NvrClient>,
    ledger: Ledger,
    filter: EventFilter,
    tracker: Arc<PipelineTracker>,
    retry: Arc<RetryCounter>,
    backlog_tx: mpsc::Sender<Event>,
    reconnect_rx: mpsc::Receiver<()>,
    retention: Duration,
    interval: Duration,
    skip_missing: bool,
    token: CancellationToken,
}

impl MissingEventChecker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        nvr: Arc<dyn NvrClient>,
        ledger: Ledger,
        filter: EventFilter,
        tracker: Arc<PipelineTracker>,
        retry: Arc<RetryCounter>,
        backlog_tx: mpsc::Sender<Event>,
        reconnect_rx: mpsc::Receiver<()>,
        retention: Duration,
        interval: Duration,
        skip_missing: bool,
        token: CancellationToken,
    ) -> Self {
        MissingEventChecker {
            nvr,
            ledger,
            filter,
            tracker,
            retry,
            backlog_tx,
            reconnect_rx,
            retention,
            interval,
            skip_missing,
            token,
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("Starting missing event checker");

        // On first boot with --skip-missing the backlog is marked as already
        // handled instead of being downloaded.
        if self.skip_missing {
            self.seed_skip_markers().await?;
            self.skip_missing = false;
        } else {
            self.checked_pass().await?;
        }

        loop {
            tokio::select! {
                _ = self.token.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.interval) => {}
                received = self.reconnect_rx.recv() => {
                    if received.is_none() {
                        return Err(anyhow!("listener is gone"));
                    }
                    info!("NVR reconnected, checking for missed events");
                }
            }
            self.checked_pass().await?;
        }
    }

    /// Run one pass, swallowing transient errors so the loop keeps its
    /// schedule. Fatal errors propagate.
    async fn checked_pass(&mut self) -> Result<()> {
        match self.pass().await {
            Ok(()) => Ok(()),
            Err(e) => {
                if e.downcast_ref::<Error>().map(Error::is_fatal).unwrap_or(false) {
                    return Err(e);
                }
                error!("Missing event check failed: {e:#}");
                Ok(())
            }
        }
    }

    async fn pass(&mut self) -> Result<()> {
        debug!("Running check for missing events...");
        let now = Utc::now();
        let from = now
            - chrono::Duration::from_std(self.retention)
                .map_err(|e| Error::Config(format!("retention out of range: {e}")))?;

        let events = self.nvr.list_events(from, now).await?;
        let ledger_ids = self.ledger.ids_in_window(from, now).await?;

        let mut offered = 0usize;
        for event in events {
            if !self.filter.is_eligible(&event) {
                continue;
            }
            if ledger_ids.contains(&event.id) {
                continue;
            }
            if self.tracker.contains(&event.id) {
                continue;
            }
            if self.retry.is_banned(&event.id) {
                continue;
            }

            if offered == 0 {
                warn!("Found missing events, adding to backup queue");
            }
            debug!(
                "Adding missing event {} ({}) to queue",
                event.id,
                event.detection_label()
            );

            self.tracker.insert(&event.id);
            let event_id = event.id.clone();
            tokio::select! {
                _ = self.token.cancelled() => {
                    self.tracker.remove(&event_id);
                    return Ok(());
                }
                result = self.backlog_tx.send(event) => {
                    if result.is_err() {
                        self.tracker.remove(&event_id);
                        return Err(anyhow!("download stage is gone"));
                    }
                }
            }
            offered += 1;

            // Keep the realtime path responsive during a large backlog scan.
            tokio::task::yield_now().await;
        }

        debug!("Missing event check complete, offered {offered} events");
        Ok(())
    }

    /// Write a do-not-fetch marker for every currently retained event that
    /// is not in the ledger yet.
    async fn seed_skip_markers(&mut self) -> Result<()> {
        info!("Ignoring missing events");
        let now = Utc::now();
        let from = now
            - chrono::Duration::from_std(self.retention)
                .map_err(|e| Error::Config(format!("retention out of range: {e}")))?;

        let events = self.nvr.list_events(from, now).await?;
        let ledger_ids = self.ledger.ids_in_window(from, now).await?;

        let mut seeded = 0usize;
        for event in events {
            if !self.filter.is_eligible(&event) || ledger_ids.contains(&event.id) {
                continue;
            }
            let (start, end) = match (event.start, event.end) {
                (Some(start), Some(end)) => (start, end),
                _ => continue,
            };

            self.ledger
                .put(&LedgerRow {
                    event_id: event.id.clone(),
                    event_type: event.detection_label(),
                    camera_id: event.camera_id.clone(),
                    start,
                    end,
                    remote_path: String::new(),
                    uploaded_at: now,
                })
                .await?;
            seeded += 1;
        }

        info!("Marked {seeded} existing events as already backed up");
        Ok(())
    }
}
