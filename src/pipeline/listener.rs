//! Realtime event listener.
//!
//! Subscribes to the NVR's event feed and forwards completed, eligible
//! events into the realtime queue. Events that arrive without an end are
//! remembered until their closing update shows up.

use crate::ledger::Ledger;
use crate::nvr::{Event, EventFilter, NvrClient, NvrMessage};
use crate::pipeline::PipelineTracker;
use anyhow::{anyhow, Result};
use log::{debug, info, trace};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Extra slack before a start-only event is forgotten.
const PENDING_MARGIN: Duration = Duration::from_secs(5 * 60);

pub struct EventListener {
    nvr: Arc<dyn NvrClient>,
    ledger: Ledger,
    filter: EventFilter,
    tracker: Arc<PipelineTracker>,
    realtime_tx: mpsc::Sender<Event>,
    reconnect_tx: mpsc::Sender<()>,
    max_event_length: Duration,
    token: CancellationToken,
    /// Event ids seen without an end, and when we first saw them.
    pending: HashMap<String, Instant>,
}

impl EventListener {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        nvr: Arc<dyn NvrClient>,
        ledger: Ledger,
        filter: EventFilter,
        tracker: Arc<PipelineTracker>,
        realtime_tx: mpsc::Sender<Event>,
        reconnect_tx: mpsc::Sender<()>,
        max_event_length: Duration,
        token: CancellationToken,
    ) -> Self {
        EventListener {
            nvr,
            ledger,
            filter,
            tracker,
            realtime_tx,
            reconnect_tx,
            max_event_length,
            token,
            pending: HashMap::new(),
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("Starting event listener");
        let mut messages = self.nvr.subscribe().await?;

        loop {
            tokio::select! {
                _ = self.token.cancelled() => return Ok(()),
                message = messages.recv() => match message {
                    None => return Err(anyhow!("event stream ended")),
                    Some(NvrMessage::Reconnected) => {
                        // Wake the reconciler to cover the gap. A full signal
                        // channel already has a pending check.
                        let _ = self.reconnect_tx.try_send(());
                    }
                    Some(NvrMessage::Event(event)) => self.handle_event(event).await?,
                },
            }
        }
    }

    async fn handle_event(&mut self, event: Event) -> Result<()> {
        if event.end.is_none() {
            if event.start.is_some() && !self.filter.ignore_cameras.contains(&event.camera_id) {
                trace!("Event {} has not ended yet", event.id);
                self.pending.insert(event.id.clone(), Instant::now());
                self.prune_pending();
            }
            return Ok(());
        }

        self.pending.remove(&event.id);

        if !self.filter.is_eligible(&event) {
            trace!("Skipping ineligible event {}", event.id);
            return Ok(());
        }
        if self.tracker.contains(&event.id) {
            trace!("Event {} already in the pipeline", event.id);
            return Ok(());
        }
        if self.ledger.has(&event.id).await? {
            trace!("Event {} already backed up", event.id);
            return Ok(());
        }

        self.tracker.insert(&event.id);
        debug!(
            "Adding event {} to queue ({} in pipeline)",
            event.id,
            self.tracker.len()
        );

        let event_id = event.id.clone();
        tokio::select! {
            _ = self.token.cancelled() => {
                self.tracker.remove(&event_id);
                Ok(())
            }
            result = self.realtime_tx.send(event) => {
                if result.is_err() {
                    self.tracker.remove(&event_id);
                    return Err(anyhow!("download stage is gone"));
                }
                Ok(())
            }
        }
    }

    /// Forget start-only events that could never become eligible anymore, so
    /// an event whose end never arrives cannot grow the map without bound.
    fn prune_pending(&mut self) {
        let deadline = self.max_event_length + PENDING_MARGIN;
        self.pending.retain(|_, seen| seen.elapsed() < deadline);
    }
}
