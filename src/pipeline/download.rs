//! Download stage.
//!
//! Pulls events off the queues (realtime first), fetches the clip from the
//! NVR and streams it through a bounded handoff to the upload stage. All
//! failure handling for the fetch side lives here: failed attempts are
//! counted and an event that keeps failing is banned.

use crate::config::units::human_readable_size;
use crate::ledger::Ledger;
use crate::notify::{Level, Notifier};
use crate::nvr::{Event, NvrClient};
use crate::pipeline::{clip_pipe, PipelineTracker, RetryCounter, UploadJob};
use crate::template::{PathTemplate, TemplateContext};
use anyhow::{anyhow, Result};
use chrono::Utc;
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// The NVR only cuts clips on keyframes (every ~5 s) and needs a moment to
/// make the clip available, so fetch no earlier than 1.5 keyframe intervals
/// after the event ended.
const FETCH_GRACE: Duration = Duration::from_millis(7500);
/// Idle limit for a single clip read.
const CHUNK_TIMEOUT: Duration = Duration::from_secs(60);
/// How long a download may keep running once shutdown has been requested.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub struct Downloader {
    nvr: Arc<dyn NvrClient>,
    ledger: Ledger,
    template: PathTemplate,
    destination: String,
    realtime_rx: mpsc::Receiver<Event>,
    backlog_rx: mpsc::Receiver<Event>,
    work_tx: mpsc::Sender<UploadJob>,
    tracker: Arc<PipelineTracker>,
    retry: Arc<RetryCounter>,
    notifier: Arc<Notifier>,
    buffer_size: usize,
    token: CancellationToken,
}

impl Downloader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        nvr: Arc<dyn NvrClient>,
        ledger: Ledger,
        template: PathTemplate,
        destination: String,
        realtime_rx: mpsc::Receiver<Event>,
        backlog_rx: mpsc::Receiver<Event>,
        work_tx: mpsc::Sender<UploadJob>,
        tracker: Arc<PipelineTracker>,
        retry: Arc<RetryCounter>,
        notifier: Arc<Notifier>,
        buffer_size: usize,
        token: CancellationToken,
    ) -> Self {
        Downloader {
            nvr,
            ledger,
            template,
            destination,
            realtime_rx,
            backlog_rx,
            work_tx,
            tracker,
            retry,
            notifier,
            buffer_size,
            token,
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("Starting downloader");
        loop {
            // Realtime events win over reconciler backlog when both are
            // ready.
            let event = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Ok(()),
                Some(event) = self.realtime_rx.recv() => event,
                Some(event) = self.backlog_rx.recv() => event,
                else => return Err(anyhow!("event queues are gone")),
            };

            if let Err(e) = self.process(event).await {
                return Err(e);
            }
        }
    }

    /// Handle one event end to end. Only fatal errors are returned;
    /// per-event failures are counted and swallowed.
    async fn process(&mut self, event: Event) -> Result<()> {
        // Listener and reconciler race; re-check before doing any work.
        if self.ledger.has(&event.id).await? {
            debug!("Event {} already backed up, skipping", event.id);
            self.tracker.remove(&event.id);
            return Ok(());
        }
        if self.retry.is_banned(&event.id) {
            debug!("Event {} is banned, skipping", event.id);
            self.tracker.remove(&event.id);
            return Ok(());
        }

        let (start, end) = match (event.start, event.end) {
            (Some(start), Some(end)) => (start, end),
            _ => {
                self.tracker.remove(&event.id);
                return Ok(());
            }
        };

        // Fetching too soon returns a truncated clip.
        let since_end = (Utc::now() - end).to_std().unwrap_or_default();
        if since_end < FETCH_GRACE {
            let wait = FETCH_GRACE - since_end;
            debug!("Waiting {wait:?} for clip of event {} to be ready", event.id);
            tokio::select! {
                _ = self.token.cancelled() => {
                    self.tracker.remove(&event.id);
                    return Ok(());
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }

        let camera = match self.nvr.camera(&event.camera_id).await {
            Ok(camera) => camera,
            Err(e) => {
                self.record_failure(&event, &format!("camera lookup failed: {e:#}"))
                    .await;
                return Ok(());
            }
        };

        let tz = self.nvr.timezone();
        let duration = event.duration().unwrap_or_else(chrono::Duration::zero);
        let relative = self.template.render(&TemplateContext {
            event_id: &event.id,
            camera_name: &camera.name,
            detection_type: &event.detection_label(),
            start: start.with_timezone(&tz),
            end: end.with_timezone(&tz),
            duration_seconds: duration.num_seconds(),
        });
        let remote_path = format!("{}/{}", self.destination, relative);

        info!("Backing up event {} from {}", event.id, camera.name);
        debug!("  Type: {}", event.detection_label());
        debug!("  Start: {start}  End: {end}  ({}s)", duration.num_seconds());
        debug!("  Destination: {remote_path}");

        let (writer, reader) = clip_pipe(self.buffer_size);
        let job = UploadJob {
            event: event.clone(),
            camera_name: camera.name.clone(),
            remote_path,
            reader,
        };

        // Depth-1 work channel: blocks until the uploader takes the previous
        // handoff.
        tokio::select! {
            _ = self.token.cancelled() => {
                self.tracker.remove(&event.id);
                return Ok(());
            }
            result = self.work_tx.send(job) => {
                if result.is_err() {
                    self.tracker.remove(&event.id);
                    return Err(anyhow!("upload stage is gone"));
                }
            }
        }

        let mut stream = match self.nvr.fetch_clip(&event.camera_id, start, end).await {
            Ok(stream) => stream,
            Err(e) => {
                writer.fail(format!("clip fetch failed: {e:#}")).await;
                self.record_failure(&event, &format!("clip fetch failed: {e:#}"))
                    .await;
                return Ok(());
            }
        };

        match copy_stream(&mut stream, &writer, &self.token).await {
            Ok(bytes) => {
                debug!(
                    "Downloaded {} for event {}, added to upload queue",
                    human_readable_size(bytes),
                    event.id
                );
                writer.finish();
            }
            Err(reason) => {
                writer.fail(reason.clone()).await;
                self.record_failure(&event, &reason).await;
            }
        }
        Ok(())
    }

    async fn record_failure(&self, event: &Event, reason: &str) {
        let attempts = self.retry.record_failure(&event.id);
        self.tracker.remove(&event.id);

        if attempts >= self.retry.max_attempts() {
            let message = format!(
                "Event {} failed to download {attempts} times in a row, permanently ignoring it \
                 ({reason})",
                event.id
            );
            error!("{message}");
            self.notifier
                .dispatch(Level::Warning, "Event abandoned", &message)
                .await;
        } else {
            warn!(
                "Event {} failed download attempt {attempts}: {reason}",
                event.id
            );
        }
    }
}

/// Pump the clip stream into the handoff. Returns total bytes on a clean
/// EOF. Once shutdown is requested the in-flight clip gets a bounded grace
/// to drain before the copy is abandoned.
async fn copy_stream(
    stream: &mut crate::nvr::ClipByteStream,
    writer: &crate::pipeline::ClipWriter,
    token: &CancellationToken,
) -> Result<u64, String> {
    use futures_util::StreamExt;
    use tokio::time::Instant;

    let mut total = 0u64;
    let mut deadline: Option<Instant> = None;

    loop {
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                return Err("shutdown during download".to_string());
            }
        }

        let next = tokio::select! {
            next = tokio::time::timeout(CHUNK_TIMEOUT, stream.next()) => {
                next.map_err(|_| format!("clip read stalled for {CHUNK_TIMEOUT:?}"))?
            }
            _ = token.cancelled(), if deadline.is_none() => {
                deadline = Some(Instant::now() + SHUTDOWN_GRACE);
                continue;
            }
        };

        match next {
            None => return Ok(total),
            Some(Err(e)) => return Err(format!("clip stream error: {e:#}")),
            Some(Ok(chunk)) => {
                total += chunk.len() as u64;
                writer
                    .send(chunk)
                    .await
                    .map_err(|_| "upload side closed".to_string())?;
            }
        }
    }
}
