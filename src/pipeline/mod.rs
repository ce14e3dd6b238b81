//! The event backup pipeline: realtime listener, missing-event reconciler,
//! download stage and upload stage, connected by bounded channels.

use crate::nvr::Event;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

pub mod download;
pub mod handoff;
pub mod listener;
pub mod missing;
pub mod retry;
pub mod upload;

pub use handoff::{clip_pipe, ClipReader, ClipWriter};
pub use retry::RetryCounter;

/// Download/upload attempts before an event is banned.
pub const MAX_ATTEMPTS: u32 = 10;

/// Work handed from the download stage to the upload stage.
pub struct UploadJob {
    pub event: Event,
    pub camera_name: String,
    /// Full rclone path, e.g. `remote:unifi/Front/2024-01-01/....mp4`.
    /// Computed once by the download stage.
    pub remote_path: String,
    pub reader: ClipReader,
}

/// Ids of events currently queued, downloading or uploading. The reconciler
/// consults this to avoid re-offering work already in flight.
#[derive(Default)]
pub struct PipelineTracker {
    inner: Mutex<HashSet<String>>,
}

impl PipelineTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the event was already tracked.
    pub fn insert(&self, event_id: &str) -> bool {
        self.inner.lock().unwrap().insert(event_id.to_string())
    }

    pub fn remove(&self, event_id: &str) {
        self.inner.lock().unwrap().remove(event_id);
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.inner.lock().unwrap().contains(event_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Diagnostics published by the upload stage.
#[derive(Default)]
pub struct UploadStatus {
    in_flight: Mutex<Option<String>>,
    buffered_bytes: AtomicU64,
    completed: AtomicU64,
}

impl UploadStatus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_in_flight(&self, event_id: Option<String>) {
        *self.in_flight.lock().unwrap() = event_id;
    }

    pub fn in_flight(&self) -> Option<String> {
        self.in_flight.lock().unwrap().clone()
    }

    pub fn set_buffered_bytes(&self, bytes: u64) {
        self.buffered_bytes.store(bytes, Ordering::Relaxed);
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.buffered_bytes.load(Ordering::Relaxed)
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_tracks() {
        let tracker = PipelineTracker::new();
        assert!(tracker.insert("e1"));
        assert!(!tracker.insert("e1"));
        assert!(tracker.contains("e1"));
        tracker.remove("e1");
        assert!(!tracker.contains("e1"));
        assert!(tracker.is_empty());
    }

    #[test]
    fn status_publishes_in_flight() {
        let status = UploadStatus::new();
        assert_eq!(status.in_flight(), None);
        status.set_in_flight(Some("e1".to_string()));
        assert_eq!(status.in_flight(), Some("e1".to_string()));
        status.set_in_flight(None);
        assert_eq!(status.in_flight(), None);
    }
}
