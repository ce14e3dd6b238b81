//! Upload stage.
//!
//! Streams each handoff to the remote and records the result in the ledger.
//! The ledger row is written only after the transfer tool has fully
//! committed the object, so `has(event_id)` always implies the clip is
//! remotely present.

use crate::config::units::human_readable_size;
use crate::ledger::{Ledger, LedgerRow};
use crate::notify::{Level, Notifier};
use crate::pipeline::{PipelineTracker, RetryCounter, UploadJob, UploadStatus};
use crate::transfer::Transfer;
use anyhow::Result;
use bytes::Bytes;
use chrono::Utc;
use log::{debug, error, info, warn};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Probed durations shorter than the event window by more than this get a
/// warning.
const PROBE_TOLERANCE: f64 = 0.5;

pub struct Uploader {
    transfer: Arc<dyn Transfer>,
    ledger: Ledger,
    work_rx: mpsc::Receiver<UploadJob>,
    tracker: Arc<PipelineTracker>,
    retry: Arc<RetryCounter>,
    notifier: Arc<Notifier>,
    status: Arc<UploadStatus>,
    probe_enabled: bool,
    token: CancellationToken,
}

impl Uploader {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transfer: Arc<dyn Transfer>,
        ledger: Ledger,
        work_rx: mpsc::Receiver<UploadJob>,
        tracker: Arc<PipelineTracker>,
        retry: Arc<RetryCounter>,
        notifier: Arc<Notifier>,
        status: Arc<UploadStatus>,
        probe_enabled: bool,
        token: CancellationToken,
    ) -> Self {
        Uploader {
            transfer,
            ledger,
            work_rx,
            tracker,
            retry,
            notifier,
            status,
            probe_enabled,
            token,
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        info!("Starting uploader");
        loop {
            // Shutdown lets the in-flight handoff complete; it only stops
            // new jobs from being accepted.
            let job = tokio::select! {
                _ = self.token.cancelled() => return Ok(()),
                job = self.work_rx.recv() => match job {
                    None => return Ok(()),
                    Some(job) => job,
                },
            };

            let event_id = job.event.id.clone();
            self.status.set_in_flight(Some(event_id.clone()));

            let result = self.process(job).await;

            self.status.set_in_flight(None);
            self.status.set_buffered_bytes(0);
            self.tracker.remove(&event_id);

            result?;
        }
    }

    /// Upload one handoff. Only fatal errors are returned.
    async fn process(&mut self, mut job: UploadJob) -> Result<()> {
        info!("Uploading event {} to {}", job.event.id, job.remote_path);

        let mut sink = match self.transfer.begin_upload(&job.remote_path).await {
            Ok(sink) => sink,
            Err(e) => {
                self.record_failure(&job.event.id, &format!("{e:#}")).await;
                return Ok(());
            }
        };
        let mut probe = if self.probe_enabled {
            DurationProbe::spawn()
        } else {
            None
        };

        let mut uploaded = 0u64;
        let outcome = loop {
            match job.reader.recv().await {
                None => break StreamOutcome::Complete,
                Some(Err(reason)) => break StreamOutcome::DownloadFailed(reason),
                Some(Ok(chunk)) => {
                    self.status
                        .set_buffered_bytes(job.reader.buffered_bytes() as u64);

                    if let Some(p) = probe.as_mut() {
                        // Best effort; a dead probe never fails the upload.
                        if !p.write(&chunk).await {
                            probe = None;
                        }
                    }

                    uploaded += chunk.len() as u64;
                    if let Err(e) = sink.write(chunk).await {
                        break StreamOutcome::UploadFailed(format!("{e:#}"));
                    }
                }
            }
        };

        match outcome {
            StreamOutcome::Complete => match sink.finish().await {
                Ok(()) => {
                    let (start, end) = match (job.event.start, job.event.end) {
                        (Some(start), Some(end)) => (start, end),
                        // Never reaches the uploader without both set.
                        _ => (Utc::now(), Utc::now()),
                    };
                    self.ledger
                        .put(&LedgerRow {
                            event_id: job.event.id.clone(),
                            event_type: job.event.detection_label(),
                            camera_id: job.event.camera_id.clone(),
                            start,
                            end,
                            remote_path: job.remote_path.clone(),
                            uploaded_at: Utc::now(),
                        })
                        .await?;

                    info!(
                        "Backed up event {} ({}) from {}",
                        job.event.id,
                        human_readable_size(uploaded),
                        job.camera_name
                    );
                    self.status.record_completed();

                    if let Some(probe) = probe {
                        check_probed_duration(&job, probe).await;
                    }
                }
                Err(e) => {
                    self.record_failure(&job.event.id, &format!("{e:#}")).await;
                }
            },
            StreamOutcome::DownloadFailed(reason) => {
                // The downloader already counted this failure.
                debug!(
                    "Aborting upload of event {}, download failed: {reason}",
                    job.event.id
                );
                sink.abort().await;
            }
            StreamOutcome::UploadFailed(reason) => {
                sink.abort().await;
                self.record_failure(&job.event.id, &reason).await;
            }
        }

        Ok(())
    }

    async fn record_failure(&self, event_id: &str, reason: &str) {
        let attempts = self.retry.record_failure(event_id);
        if attempts >= self.retry.max_attempts() {
            let message = format!(
                "Event {event_id} failed to upload {attempts} times in a row, permanently \
                 ignoring it ({reason})"
            );
            error!("{message}");
            self.notifier
                .dispatch(Level::Warning, "Event abandoned", &message)
                .await;
        } else {
            warn!("Event {event_id} failed upload attempt {attempts}: {reason}");
        }
    }
}

enum StreamOutcome {
    Complete,
    DownloadFailed(String),
    UploadFailed(String),
}

/// Compare the clip's probed duration against the event window; log only.
async fn check_probed_duration(job: &UploadJob, probe: DurationProbe) {
    let expected = match (job.event.start, job.event.end) {
        (Some(start), Some(end)) => (end - start).num_milliseconds() as f64 / 1000.0,
        _ => return,
    };

    match probe.finish().await {
        Some(probed) => {
            let delta = probed - expected;
            if probed + PROBE_TOLERANCE < expected {
                warn!(
                    "Clip for event {} is shorter than the event: {probed:.3}s ({delta:+.3}s)",
                    job.event.id
                );
            } else {
                debug!(
                    "Clip duration for event {}: {probed:.3}s ({delta:+.3}s)",
                    job.event.id
                );
            }
        }
        None => debug!("Duration probe failed for event {}", job.event.id),
    }
}

/// Out-of-band `ffprobe` fed with a copy of the clip bytes.
struct DurationProbe {
    child: Child,
    stdin: Option<ChildStdin>,
}

impl DurationProbe {
    fn spawn() -> Option<Self> {
        let mut child = Command::new("ffprobe")
            .args([
                "-v",
                "quiet",
                "-show_streams",
                "-select_streams",
                "v:0",
                "-of",
                "json",
                "-",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .ok()?;
        let stdin = child.stdin.take()?;
        Some(DurationProbe {
            child,
            stdin: Some(stdin),
        })
    }

    /// Returns false once the probe stops accepting input.
    async fn write(&mut self, chunk: &Bytes) -> bool {
        match self.stdin.as_mut() {
            Some(stdin) => stdin.write_all(chunk).await.is_ok(),
            None => false,
        }
    }

    async fn finish(mut self) -> Option<f64> {
        drop(self.stdin.take());
        let output = tokio::time::timeout(Duration::from_secs(10), self.child.wait_with_output())
            .await
            .ok()?
            .ok()?;
        if !output.status.success() {
            return None;
        }

        let parsed: serde_json::Value = serde_json::from_slice(&output.stdout).ok()?;
        parsed
            .get("streams")?
            .get(0)?
            .get("duration")?
            .as_str()?
            .parse()
            .ok()
    }
}

/// Whether `ffprobe` is available on this system.
pub async fn probe_available() -> bool {
    Command::new("ffprobe")
        .arg("-version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}
