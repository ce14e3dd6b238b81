//! Types and the client interface for the UniFi Protect NVR.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, FixedOffset, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::{Display, Formatter};
use tokio::sync::mpsc;

pub mod client;

pub use client::ProtectClient;

/// Detection types that can be selected for backup.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DetectionType {
    Motion,
    Person,
    Vehicle,
    Ring,
}

impl DetectionType {
    pub const ALL: [DetectionType; 4] = [
        DetectionType::Motion,
        DetectionType::Person,
        DetectionType::Vehicle,
        DetectionType::Ring,
    ];

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "motion" => Some(DetectionType::Motion),
            "person" => Some(DetectionType::Person),
            "vehicle" => Some(DetectionType::Vehicle),
            "ring" => Some(DetectionType::Ring),
            _ => None,
        }
    }
}

impl Display for DetectionType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DetectionType::Motion => write!(f, "motion"),
            DetectionType::Person => write!(f, "person"),
            DetectionType::Vehicle => write!(f, "vehicle"),
            DetectionType::Ring => write!(f, "ring"),
        }
    }
}

/// Kind of event as reported by the NVR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    Motion,
    SmartDetect,
    Ring,
    /// Anything else the NVR may send; never eligible for backup.
    Other(String),
}

impl Display for EventKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Motion => write!(f, "motion"),
            EventKind::SmartDetect => write!(f, "smartDetect"),
            EventKind::Ring => write!(f, "ring"),
            EventKind::Other(s) => write!(f, "{s}"),
        }
    }
}

/// A detection interval reported by the NVR.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub camera_id: String,
    pub kind: EventKind,
    pub smart_detect_types: Vec<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl Event {
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.start, self.end) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Label used in file paths and logs, e.g. `motion` or
    /// `smartDetect (person, vehicle)`.
    pub fn detection_label(&self) -> String {
        if self.smart_detect_types.is_empty() {
            self.kind.to_string()
        } else {
            format!("{} ({})", self.kind, self.smart_detect_types.join(", "))
        }
    }
}

/// Filters controlling which events get backed up.
#[derive(Debug, Clone)]
pub struct EventFilter {
    pub detection_types: HashSet<DetectionType>,
    pub ignore_cameras: HashSet<String>,
    pub max_event_length: chrono::Duration,
}

impl EventFilter {
    /// An event is eligible iff it has ended, its type and smart detection
    /// types are all wanted, its camera is not ignored, and it is not longer
    /// than the configured maximum.
    pub fn is_eligible(&self, event: &Event) -> bool {
        if self.ignore_cameras.contains(&event.camera_id) {
            return false;
        }
        let duration = match event.duration() {
            Some(d) => d,
            None => return false,
        };
        if duration > self.max_event_length || duration < chrono::Duration::zero() {
            return false;
        }

        match &event.kind {
            EventKind::Motion => self.detection_types.contains(&DetectionType::Motion),
            EventKind::Ring => self.detection_types.contains(&DetectionType::Ring),
            EventKind::SmartDetect => {
                // Every smart detection type on the event must be wanted.
                !event.smart_detect_types.is_empty()
                    && event.smart_detect_types.iter().all(|t| {
                        DetectionType::parse(t)
                            .map(|t| self.detection_types.contains(&t))
                            .unwrap_or(false)
                    })
            }
            EventKind::Other(_) => false,
        }
    }
}

/// A camera known to the NVR.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Camera {
    pub id: String,
    pub name: String,
}

/// Messages delivered by the realtime subscription.
#[derive(Debug, Clone)]
pub enum NvrMessage {
    /// An event add or update. Updates carry the full event state.
    Event(Event),
    /// The websocket reconnected after a connection loss; the reconciler
    /// should run immediately.
    Reconnected,
}

/// Stream of clip bytes produced by `fetch_clip`.
pub type ClipByteStream = BoxStream<'static, Result<Bytes>>;

/// Interface to the NVR used by the pipeline.
///
/// The concrete implementation is [`ProtectClient`]; tests substitute an
/// in-memory fake.
#[async_trait]
pub trait NvrClient: Send + Sync {
    /// Subscribe to the realtime event feed. The client reconnects
    /// transparently and emits [`NvrMessage::Reconnected`] after each
    /// successful reconnect.
    async fn subscribe(&self) -> Result<mpsc::Receiver<NvrMessage>>;

    /// List events in the window, oldest first. Only events whose `end` is
    /// set are returned. Paged internally.
    async fn list_events(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Event>>;

    /// Fetch the clip for an event as a byte stream.
    async fn fetch_clip(
        &self,
        camera_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ClipByteStream>;

    /// Look up a camera by id. Cached; a miss refreshes the bootstrap so
    /// cameras added after startup resolve.
    async fn camera(&self, camera_id: &str) -> Result<Camera>;

    /// The NVR's local UTC offset, used for path formatting.
    fn timezone(&self) -> FixedOffset;
}
