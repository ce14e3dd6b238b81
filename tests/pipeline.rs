//! End-to-end pipeline tests against in-memory NVR and transfer fakes.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use protect_vault::config::{Config, NvrConfig};
use protect_vault::ledger::{Ledger, LedgerRow};
use protect_vault::notify::Notifier;
use protect_vault::nvr::{
    Camera, ClipByteStream, Event, EventKind, NvrClient, NvrMessage,
};
use protect_vault::purge::Purger;
use protect_vault::supervisor::Supervisor;
use protect_vault::template::PathTemplate;
use protect_vault::transfer::{Transfer, UploadSink};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct MockNvr {
    cameras: HashMap<String, Camera>,
    historical: Mutex<Vec<Event>>,
    clip: Bytes,
    fail_remaining: AtomicU32,
    always_fail: bool,
    fetch_calls: AtomicU32,
    subscribers: Mutex<Vec<mpsc::Sender<NvrMessage>>>,
}

impl MockNvr {
    fn new() -> Self {
        let mut cameras = HashMap::new();
        cameras.insert(
            "cam-front".to_string(),
            Camera {
                id: "cam-front".to_string(),
                name: "Front".to_string(),
            },
        );
        MockNvr {
            cameras,
            historical: Mutex::new(Vec::new()),
            clip: Bytes::from_static(b"not really mp4 data"),
            fail_remaining: AtomicU32::new(0),
            always_fail: false,
            fetch_calls: AtomicU32::new(0),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    async fn send_event(&self, event: Event) {
        // The listener may not have subscribed yet.
        let sender = loop {
            if let Some(sender) = self.subscribers.lock().unwrap().last().cloned() {
                break sender;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        sender.send(NvrMessage::Event(event)).await.unwrap();
    }
}

#[async_trait]
impl NvrClient for MockNvr {
    async fn subscribe(&self) -> Result<mpsc::Receiver<NvrMessage>> {
        let (tx, rx) = mpsc::channel(64);
        self.subscribers.lock().unwrap().push(tx);
        Ok(rx)
    }

    async fn list_events(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Event>> {
        Ok(self
            .historical
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.start.map(|s| s >= from && s <= to).unwrap_or(false))
            .cloned()
            .collect())
    }

    async fn fetch_clip(
        &self,
        _camera_id: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<ClipByteStream> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        if self.always_fail {
            anyhow::bail!("clip not found");
        }
        if self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            anyhow::bail!("transient NVR error");
        }

        let chunks: Vec<Result<Bytes>> = self
            .clip
            .chunks(1024)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }

    async fn camera(&self, camera_id: &str) -> Result<Camera> {
        self.cameras
            .get(camera_id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown camera {camera_id}"))
    }

    fn timezone(&self) -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }
}

#[derive(Default)]
struct MockTransfer {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    deletes: Mutex<Vec<String>>,
    uploads_finished: AtomicU32,
}

impl MockTransfer {
    fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(path).cloned()
    }

    fn paths(&self) -> HashSet<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }
}

#[derive(Clone)]
struct TransferHandle(Arc<MockTransfer>);

#[async_trait]
impl Transfer for TransferHandle {
    async fn check(&self) -> Result<()> {
        Ok(())
    }

    async fn begin_upload(&self, path: &str) -> Result<Box<dyn UploadSink>> {
        Ok(Box::new(MockSink {
            path: path.to_string(),
            buffer: Vec::new(),
            transfer: self.0.clone(),
        }))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.0.deletes.lock().unwrap().push(path.to_string());
        // Deleting something already gone is still success.
        self.0.objects.lock().unwrap().remove(path);
        Ok(())
    }

    async fn tidy(&self) -> Result<()> {
        Ok(())
    }
}

struct MockSink {
    path: String,
    buffer: Vec<u8>,
    transfer: Arc<MockTransfer>,
}

#[async_trait]
impl UploadSink for MockSink {
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        self.buffer.extend_from_slice(&chunk);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<()> {
        self.transfer
            .objects
            .lock()
            .unwrap()
            .insert(self.path, self.buffer);
        self.transfer.uploads_finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn abort(self: Box<Self>) {}
}

fn test_config(sqlite_path: &Path) -> Config {
    Config {
        nvr: NvrConfig {
            address: "nvr.local".to_string(),
            port: 443,
            username: "backup".to_string(),
            password: "secret".to_string(),
            verify_ssl: true,
        },
        rclone_destination: "mock:unifi".to_string(),
        rclone_args: Vec::new(),
        rclone_purge_args: Vec::new(),
        retention: Duration::from_secs(7 * 86400),
        purge_interval: Duration::from_secs(3600),
        max_event_length: Duration::from_secs(2 * 3600),
        download_buffer_size: 1024,
        detection_types: protect_vault::nvr::DetectionType::ALL.into_iter().collect(),
        ignore_cameras: HashSet::new(),
        template: PathTemplate::parse(
            "{camera_name}/{event.start:%Y-%m-%d}/{event.end:%Y-%m-%dT%H-%M-%S} {detection_type}.mp4",
        )
        .unwrap(),
        sqlite_path: sqlite_path.to_path_buf(),
        skip_missing: false,
        notifiers: Vec::new(),
        verbosity: 0,
        event_queue_size: 16,
        missing_interval: Duration::from_millis(50),
    }
}

fn motion_event(id: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> Event {
    Event {
        id: id.to_string(),
        camera_id: "cam-front".to_string(),
        kind: EventKind::Motion,
        smart_detect_types: Vec::new(),
        start: Some(start),
        end: Some(end),
    }
}

async fn wait_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..400 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}

struct Harness {
    nvr: Arc<MockNvr>,
    transfer: Arc<MockTransfer>,
    ledger: Ledger,
    token: CancellationToken,
    _dir: tempfile::TempDir,
}

impl Harness {
    async fn start(configure: impl FnOnce(&mut Config, &mut MockNvr)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let sqlite_path = dir.path().join("events.sqlite");
        let mut config = test_config(&sqlite_path);
        let mut nvr = MockNvr::new();
        configure(&mut config, &mut nvr);

        let nvr = Arc::new(nvr);
        let transfer = Arc::new(MockTransfer::default());
        let ledger = Ledger::open(&sqlite_path).await.unwrap();
        let token = CancellationToken::new();

        let supervisor = Supervisor::new(
            config,
            nvr.clone(),
            Arc::new(TransferHandle(transfer.clone())),
            ledger.clone(),
            Arc::new(Notifier::new(Vec::new())),
        );
        tokio::spawn(supervisor.run(token.clone()));

        Harness {
            nvr,
            transfer,
            ledger,
            token,
            _dir: dir,
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[tokio::test]
async fn realtime_event_is_backed_up() {
    let harness = Harness::start(|_, _| {}).await;

    let start = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
    let end = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 5).unwrap();
    harness.nvr.send_event(motion_event("E1", start, end)).await;

    let ledger = harness.ledger.clone();
    wait_until("E1 in ledger", || {
        let ledger = ledger.clone();
        async move { ledger.has("E1").await.unwrap_or(false) }
    })
    .await;

    let expected = "mock:unifi/Front/2024-01-01/2024-01-01T10-00-05 motion.mp4";
    assert_eq!(
        harness.transfer.object(expected).as_deref(),
        Some(b"not really mp4 data".as_slice())
    );
}

#[tokio::test]
async fn zero_duration_ring_event_is_backed_up() {
    let harness = Harness::start(|_, _| {}).await;

    let at = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
    let mut event = motion_event("R1", at, at);
    event.kind = EventKind::Ring;
    harness.nvr.send_event(event).await;

    let ledger = harness.ledger.clone();
    wait_until("R1 in ledger", || {
        let ledger = ledger.clone();
        async move { ledger.has("R1").await.unwrap_or(false) }
    })
    .await;
    assert_eq!(harness.transfer.paths().len(), 1);
}

#[tokio::test]
async fn reconciler_backfills_missing_events() {
    let harness = Harness::start(|_, nvr| {
        let now = Utc::now();
        let mut historical = nvr.historical.lock().unwrap();
        for (i, id) in ["H1", "H2", "H3"].iter().enumerate() {
            let start = now - chrono::Duration::minutes(60 - i as i64);
            historical.push(motion_event(id, start, start + chrono::Duration::seconds(5)));
        }
    })
    .await;

    let ledger = harness.ledger.clone();
    wait_until("all historical events in ledger", || {
        let ledger = ledger.clone();
        async move {
            ledger.has("H1").await.unwrap_or(false)
                && ledger.has("H2").await.unwrap_or(false)
                && ledger.has("H3").await.unwrap_or(false)
        }
    })
    .await;
    assert_eq!(harness.transfer.paths().len(), 3);
}

#[tokio::test]
async fn transient_fetch_failures_are_retried() {
    let harness = Harness::start(|_, nvr| {
        nvr.fail_remaining = AtomicU32::new(2);
        let now = Utc::now();
        let start = now - chrono::Duration::minutes(30);
        nvr.historical
            .lock()
            .unwrap()
            .push(motion_event("F1", start, start + chrono::Duration::seconds(5)));
    })
    .await;

    let ledger = harness.ledger.clone();
    wait_until("F1 in ledger", || {
        let ledger = ledger.clone();
        async move { ledger.has("F1").await.unwrap_or(false) }
    })
    .await;

    assert_eq!(harness.nvr.fetch_calls.load(Ordering::SeqCst), 3);
    assert_eq!(harness.transfer.paths().len(), 1);
    assert_eq!(harness.transfer.uploads_finished.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn event_failing_every_attempt_is_banned() {
    let harness = Harness::start(|_, nvr| {
        nvr.always_fail = true;
        let now = Utc::now();
        let start = now - chrono::Duration::minutes(30);
        nvr.historical
            .lock()
            .unwrap()
            .push(motion_event("B1", start, start + chrono::Duration::seconds(5)));
    })
    .await;

    let nvr = harness.nvr.clone();
    wait_until("ten failed attempts", || {
        let nvr = nvr.clone();
        async move { nvr.fetch_calls.load(Ordering::SeqCst) >= 10 }
    })
    .await;

    // The ban holds: several reconciler passes later no further attempt was
    // made and nothing was ledgered.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(harness.nvr.fetch_calls.load(Ordering::SeqCst), 10);
    assert!(!harness.ledger.has("B1").await.unwrap());
    assert!(harness.transfer.paths().is_empty());
}

#[tokio::test]
async fn duplicate_offers_upload_once() {
    let harness = Harness::start(|_, _| {}).await;

    let start = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
    let end = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 5).unwrap();
    harness.nvr.send_event(motion_event("D1", start, end)).await;
    harness.nvr.send_event(motion_event("D1", start, end)).await;

    let ledger = harness.ledger.clone();
    wait_until("D1 in ledger", || {
        let ledger = ledger.clone();
        async move { ledger.has("D1").await.unwrap_or(false) }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(harness.transfer.uploads_finished.load(Ordering::SeqCst), 1);
    assert_eq!(harness.transfer.paths().len(), 1);
}

#[tokio::test]
async fn clip_larger_than_buffer_uploads_fully() {
    let clip: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
    let clip_copy = clip.clone();
    let harness = Harness::start(move |config, nvr| {
        // 1 KiB buffer, 64 KiB clip.
        config.download_buffer_size = 1024;
        nvr.clip = Bytes::from(clip_copy);
        let now = Utc::now();
        let start = now - chrono::Duration::minutes(30);
        nvr.historical
            .lock()
            .unwrap()
            .push(motion_event("L1", start, start + chrono::Duration::seconds(5)));
    })
    .await;

    let ledger = harness.ledger.clone();
    wait_until("L1 in ledger", || {
        let ledger = ledger.clone();
        async move { ledger.has("L1").await.unwrap_or(false) }
    })
    .await;

    let path = harness.transfer.paths().into_iter().next().unwrap();
    assert_eq!(harness.transfer.object(&path).unwrap(), clip);
}

#[tokio::test]
async fn skip_missing_seeds_ledger_without_downloads() {
    let harness = Harness::start(|config, nvr| {
        config.skip_missing = true;
        let now = Utc::now();
        let mut historical = nvr.historical.lock().unwrap();
        for i in 0..5 {
            let start = now - chrono::Duration::minutes(60 - i);
            historical.push(motion_event(
                &format!("S{i}"),
                start,
                start + chrono::Duration::seconds(5),
            ));
        }
    })
    .await;

    let ledger = harness.ledger.clone();
    wait_until("all seeded", || {
        let ledger = ledger.clone();
        async move {
            ledger.has("S0").await.unwrap_or(false) && ledger.has("S4").await.unwrap_or(false)
        }
    })
    .await;

    assert_eq!(harness.nvr.fetch_calls.load(Ordering::SeqCst), 0);
    assert!(harness.transfer.paths().is_empty());

    // Events from now on are processed normally.
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
    let end = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 5).unwrap();
    harness.nvr.send_event(motion_event("N1", start, end)).await;
    let ledger = harness.ledger.clone();
    wait_until("N1 in ledger", || {
        let ledger = ledger.clone();
        async move { ledger.has("N1").await.unwrap_or(false) }
    })
    .await;
    assert_eq!(harness.transfer.paths().len(), 1);
}

#[tokio::test]
async fn purger_deletes_expired_rows_only() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Ledger::open(&dir.path().join("events.sqlite")).await.unwrap();
    let transfer = Arc::new(MockTransfer::default());
    let now = Utc::now();

    // One row 8 days old, one fresh.
    let old_end = now - chrono::Duration::days(8);
    ledger
        .put(&LedgerRow {
            event_id: "OLD".to_string(),
            event_type: "motion".to_string(),
            camera_id: "cam-front".to_string(),
            start: old_end - chrono::Duration::seconds(5),
            end: old_end,
            remote_path: "mock:unifi/old.mp4".to_string(),
            uploaded_at: old_end,
        })
        .await
        .unwrap();
    ledger
        .put(&LedgerRow {
            event_id: "NEW".to_string(),
            event_type: "motion".to_string(),
            camera_id: "cam-front".to_string(),
            start: now - chrono::Duration::seconds(10),
            end: now - chrono::Duration::seconds(5),
            remote_path: "mock:unifi/new.mp4".to_string(),
            uploaded_at: now,
        })
        .await
        .unwrap();
    transfer
        .objects
        .lock()
        .unwrap()
        .insert("mock:unifi/old.mp4".to_string(), b"old".to_vec());

    let token = CancellationToken::new();
    let mut purger = Purger::new(
        ledger.clone(),
        Arc::new(TransferHandle(transfer.clone())),
        Duration::from_secs(7 * 86400),
        Duration::from_millis(50),
        token.clone(),
    );
    let handle = tokio::spawn(async move { purger.run().await });

    let ledger_check = ledger.clone();
    wait_until("old row purged", || {
        let ledger = ledger_check.clone();
        async move { !ledger.has("OLD").await.unwrap_or(true) }
    })
    .await;

    // Let a few more passes run: purging must be idempotent.
    tokio::time::sleep(Duration::from_millis(200)).await;
    token.cancel();
    handle.await.unwrap().unwrap();

    let deletes = transfer.deletes.lock().unwrap().clone();
    assert_eq!(deletes, vec!["mock:unifi/old.mp4".to_string()]);
    assert!(ledger.has("NEW").await.unwrap());
    assert!(transfer.object("mock:unifi/old.mp4").is_none());
}

#[tokio::test]
async fn purger_removes_skip_markers_without_remote_deletes() {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Ledger::open(&dir.path().join("events.sqlite")).await.unwrap();
    let transfer = Arc::new(MockTransfer::default());
    let old_end = Utc::now() - chrono::Duration::days(8);

    ledger
        .put(&LedgerRow {
            event_id: "SKIP".to_string(),
            event_type: "motion".to_string(),
            camera_id: "cam-front".to_string(),
            start: old_end - chrono::Duration::seconds(5),
            end: old_end,
            remote_path: String::new(),
            uploaded_at: old_end,
        })
        .await
        .unwrap();

    let token = CancellationToken::new();
    let mut purger = Purger::new(
        ledger.clone(),
        Arc::new(TransferHandle(transfer.clone())),
        Duration::from_secs(7 * 86400),
        Duration::from_millis(50),
        token.clone(),
    );
    let handle = tokio::spawn(async move { purger.run().await });

    let ledger_check = ledger.clone();
    wait_until("skip marker purged", || {
        let ledger = ledger_check.clone();
        async move { !ledger.has("SKIP").await.unwrap_or(true) }
    })
    .await;
    token.cancel();
    handle.await.unwrap().unwrap();

    assert!(transfer.deletes.lock().unwrap().is_empty());
}
