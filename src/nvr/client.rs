//! HTTP / websocket client for the UniFi Protect NVR.

use crate::config::NvrConfig;
use crate::error::Error;
use crate::nvr::{Camera, ClipByteStream, Event, EventKind, NvrClient, NvrMessage};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Local, Offset, TimeZone, Utc};
use futures_util::{SinkExt, StreamExt, TryStreamExt};
use log::{debug, error, info, trace, warn};
use rand::Rng;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async_tls_with_config, Connector};

const EVENT_PAGE_SIZE: usize = 500;
const CAMERA_CACHE_TTL: Duration = Duration::from_secs(6 * 60 * 60);
/// At least twice the NVR's websocket heartbeat interval.
const WS_LIVENESS_TIMEOUT: Duration = Duration::from_secs(60);
const WS_PING_INTERVAL: Duration = Duration::from_secs(25);
const WS_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const WS_BACKOFF_CAP: Duration = Duration::from_secs(60);

struct CachedCamera {
    camera: Camera,
    fetched: Instant,
}

/// Client for a single UniFi Protect instance.
pub struct ProtectClient {
    base_url: String,
    ws_url: String,
    config: NvrConfig,
    http: reqwest::Client,
    csrf_token: RwLock<Option<String>>,
    auth_cookie: RwLock<Option<String>>,
    cameras: RwLock<HashMap<String, CachedCamera>>,
    timezone: FixedOffset,
}

impl ProtectClient {
    /// Log in and fetch the bootstrap. Fails if the NVR is unreachable; the
    /// caller retries with backoff.
    pub async fn connect(config: &NvrConfig) -> Result<Self> {
        let base_url = format!("https://{}:{}", config.address, config.port);
        let ws_url = format!(
            "wss://{}:{}/proxy/protect/ws/updates",
            config.address, config.port
        );

        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!config.verify_ssl)
            .cookie_store(true)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Nvr(format!("failed to build HTTP client: {e}")))?;

        let client = ProtectClient {
            base_url,
            ws_url,
            config: config.clone(),
            http,
            csrf_token: RwLock::new(None),
            auth_cookie: RwLock::new(None),
            cameras: RwLock::new(HashMap::new()),
            timezone: Local::now().offset().fix(),
        };

        client.login().await?;
        let bootstrap = client.fetch_bootstrap().await?;
        let timezone = bootstrap
            .nvr
            .timezone_offset_minutes()
            .and_then(|minutes| FixedOffset::east_opt(minutes * 60))
            .unwrap_or(client.timezone);

        info!("Found cameras:");
        for camera in &bootstrap.cameras {
            info!(" - {}: {}", camera.id, camera.name);
        }
        debug!("NVR UTC offset: {timezone}");
        client.store_cameras(bootstrap.cameras);

        Ok(ProtectClient { timezone, ..client })
    }

    async fn login(&self) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/api/auth/login", self.base_url))
            .json(&serde_json::json!({
                "username": self.config.username,
                "password": self.config.password,
                "rememberMe": true,
            }))
            .send()
            .await
            .map_err(|e| Error::Nvr(format!("login request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(Error::Nvr(format!("login failed: {}", response.status())).into());
        }

        if let Some(token) = response
            .headers()
            .get("x-csrf-token")
            .and_then(|v| v.to_str().ok())
        {
            *self.csrf_token.write().unwrap() = Some(token.to_string());
        }

        // Keep the raw auth cookie around for the websocket handshake, which
        // does not go through the reqwest cookie jar.
        for cookie in response.headers().get_all("set-cookie") {
            if let Ok(cookie) = cookie.to_str() {
                if let Some(pair) = cookie.split(';').next() {
                    if pair.trim_start().starts_with("TOKEN=") {
                        *self.auth_cookie.write().unwrap() = Some(pair.trim().to_string());
                    }
                }
            }
        }

        debug!("Logged into {}", self.config.address);
        Ok(())
    }

    async fn get(&self, url: String, query: &[(&str, String)]) -> Result<reqwest::Response> {
        let mut request = self.http.get(url).query(query);
        if let Some(token) = self.csrf_token.read().unwrap().clone() {
            request = request.header("x-csrf-token", token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::Nvr(format!("NVR request failed: {e}")))?;

        // Sessions expire; retry once behind a fresh login.
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            warn!("NVR session expired, logging in again");
            self.login().await?;
            let url = response.url().clone();
            let mut request = self.http.get(url);
            if let Some(token) = self.csrf_token.read().unwrap().clone() {
                request = request.header("x-csrf-token", token);
            }
            return request
                .send()
                .await
                .map_err(|e| Error::Nvr(format!("NVR request failed: {e}")).into());
        }

        Ok(response)
    }

    async fn fetch_bootstrap(&self) -> Result<WireBootstrap> {
        let response = self
            .get(format!("{}/proxy/protect/api/bootstrap", self.base_url), &[])
            .await?;
        if !response.status().is_success() {
            return Err(Error::Nvr(format!("bootstrap failed: {}", response.status())).into());
        }
        response
            .json::<WireBootstrap>()
            .await
            .map_err(|e| Error::Nvr(format!("bad bootstrap payload: {e}")).into())
    }

    fn store_cameras(&self, cameras: Vec<WireCamera>) {
        let now = Instant::now();
        let mut cache = self.cameras.write().unwrap();
        for camera in cameras {
            cache.insert(
                camera.id.clone(),
                CachedCamera {
                    camera: Camera {
                        id: camera.id,
                        name: camera.name,
                    },
                    fetched: now,
                },
            );
        }
    }

    fn cached_camera(&self, camera_id: &str) -> Option<Camera> {
        let cache = self.cameras.read().unwrap();
        cache
            .get(camera_id)
            .filter(|entry| entry.fetched.elapsed() < CAMERA_CACHE_TTL)
            .map(|entry| entry.camera.clone())
    }

}

#[async_trait]
impl NvrClient for ProtectClient {
    async fn subscribe(&self) -> Result<mpsc::Receiver<NvrMessage>> {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(subscription_loop(
            self.ws_url.clone(),
            self.auth_cookie.read().unwrap().clone(),
            self.config.verify_ssl,
            tx,
        ));
        Ok(rx)
    }

    async fn list_events(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Result<Vec<Event>> {
        let mut events: Vec<Event> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut window_start = from;

        loop {
            debug!("Fetching events for interval: {window_start} - {to}");
            let response = self
                .get(
                    format!("{}/proxy/protect/api/events", self.base_url),
                    &[
                        ("start", window_start.timestamp_millis().to_string()),
                        ("end", to.timestamp_millis().to_string()),
                        ("limit", EVENT_PAGE_SIZE.to_string()),
                        ("orderDirection", "ASC".to_string()),
                    ],
                )
                .await?;
            if !response.status().is_success() {
                return Err(
                    Error::Nvr(format!("event listing failed: {}", response.status())).into(),
                );
            }

            let page: Vec<WireEvent> = response
                .json()
                .await
                .map_err(|e| Error::Nvr(format!("bad event listing payload: {e}")))?;
            let page_len = page.len();

            for wire in page {
                let event = wire.into_event();
                // Advance the window past the newest complete event so the
                // next page makes progress.
                if let (Some(start), Some(_)) = (event.start, event.end) {
                    if start > window_start {
                        window_start = start;
                    }
                }
                if event.end.is_none() {
                    continue;
                }
                if seen.insert(event.id.clone()) {
                    events.push(event);
                }
            }

            if page_len < EVENT_PAGE_SIZE {
                break;
            }
        }

        events.sort_by_key(|e| e.start);
        Ok(events)
    }

    async fn fetch_clip(
        &self,
        camera_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ClipByteStream> {
        let response = self
            .get(
                format!("{}/proxy/protect/api/video/export", self.base_url),
                &[
                    ("camera", camera_id.to_string()),
                    ("start", start.timestamp_millis().to_string()),
                    ("end", end.timestamp_millis().to_string()),
                ],
            )
            .await?;

        match response.status() {
            status if status.is_success() => {}
            reqwest::StatusCode::NOT_FOUND => {
                return Err(Error::ClipNotFound(format!("camera {camera_id}")).into())
            }
            status if status.as_u16() == 409 || status.as_u16() == 503 => {
                return Err(Error::ClipNotReady(format!("NVR returned {status}")).into())
            }
            status => return Err(Error::Nvr(format!("clip export failed: {status}")).into()),
        }

        let stream = response
            .bytes_stream()
            .map_err(|e| anyhow::Error::from(Error::Nvr(format!("clip stream failed: {e}"))));
        Ok(Box::pin(stream))
    }

    async fn camera(&self, camera_id: &str) -> Result<Camera> {
        if let Some(camera) = self.cached_camera(camera_id) {
            return Ok(camera);
        }

        // A miss usually means a camera added after startup: refresh the
        // bootstrap instead of giving up.
        debug!("Unknown camera id `{camera_id}`, refreshing bootstrap");
        let bootstrap = self.fetch_bootstrap().await?;
        self.store_cameras(bootstrap.cameras);

        self.cached_camera(camera_id)
            .ok_or_else(|| Error::Nvr(format!("unknown camera id `{camera_id}`")).into())
    }

    fn timezone(&self) -> FixedOffset {
        self.timezone
    }
}

type WsRequest = tokio_tungstenite::tungstenite::handshake::client::Request;

fn build_ws_request(ws_url: &str, cookie: Option<&str>) -> Result<WsRequest> {
    let mut request = ws_url
        .into_client_request()
        .map_err(|e| Error::Nvr(format!("bad websocket url: {e}")))?;
    if let Some(cookie) = cookie {
        request.headers_mut().insert(
            "Cookie",
            cookie
                .parse()
                .map_err(|_| Error::Nvr("unusable auth cookie".to_string()))?,
        );
    }
    Ok(request)
}

fn build_tls_connector(verify_ssl: bool) -> Result<Connector> {
    let tls = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(!verify_ssl)
        .build()
        .map_err(|e| Error::Nvr(format!("failed to build TLS connector: {e}")))?;
    Ok(Connector::NativeTls(tls))
}

/// Connect, read and reconnect forever; exits when the receiver goes away.
async fn subscription_loop(
    ws_url: String,
    cookie: Option<String>,
    verify_ssl: bool,
    tx: mpsc::Sender<NvrMessage>,
) {
    let mut backoff = WS_BACKOFF_INITIAL;
    let mut connected_before = false;

    loop {
        let attempt = async {
            let request = build_ws_request(&ws_url, cookie.as_deref())?;
            let connector = build_tls_connector(verify_ssl)?;
            connect_async_tls_with_config(request, None, false, Some(connector))
                .await
                .map_err(|e| anyhow::Error::from(Error::Nvr(format!("websocket connect failed: {e}"))))
        };

        match attempt.await {
            Ok((mut stream, _)) => {
                info!("Connected to NVR event stream");
                backoff = WS_BACKOFF_INITIAL;

                if connected_before {
                    // Tell the reconciler to cover the gap we just had.
                    if tx.send(NvrMessage::Reconnected).await.is_err() {
                        return;
                    }
                }
                connected_before = true;

                let mut ping = tokio::time::interval(WS_PING_INTERVAL);
                ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

                loop {
                    tokio::select! {
                        _ = tx.closed() => {
                            debug!("Event stream subscriber gone, stopping");
                            return;
                        }
                        _ = ping.tick() => {
                            if let Err(e) = stream.send(WsMessage::Ping(Vec::new())).await {
                                warn!("NVR websocket ping failed: {e}");
                                break;
                            }
                        }
                        next = tokio::time::timeout(WS_LIVENESS_TIMEOUT, stream.next()) => {
                            match next {
                                Err(_) => {
                                    warn!("NVR websocket silent for {WS_LIVENESS_TIMEOUT:?}, reconnecting");
                                    break;
                                }
                                Ok(None) => {
                                    warn!("NVR websocket closed, reconnecting");
                                    break;
                                }
                                Ok(Some(Err(e))) => {
                                    warn!("NVR websocket error: {e}");
                                    break;
                                }
                                Ok(Some(Ok(message))) => {
                                    if let Some(event) = decode_ws_message(message) {
                                        if tx.send(NvrMessage::Event(event)).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
            Err(e) => {
                error!("NVR websocket connect failed: {e}");
            }
        }

        if tx.is_closed() {
            return;
        }

        // Full jitter keeps a fleet of agents from reconnecting in lockstep.
        let sleep = Duration::from_millis(rand::thread_rng().gen_range(0..=backoff.as_millis() as u64));
        debug!("Reconnecting to NVR websocket in {sleep:?}");
        tokio::time::sleep(sleep).await;
        backoff = (backoff * 2).min(WS_BACKOFF_CAP);
    }
}

fn decode_ws_message(message: WsMessage) -> Option<Event> {
    let text = match message {
        WsMessage::Text(text) => text.to_string(),
        WsMessage::Binary(data) => String::from_utf8(data.to_vec()).ok()?,
        _ => return None,
    };
    trace!("NVR websocket frame: {text}");

    let packet: WsPacket = serde_json::from_str(&text).ok()?;
    if packet.model_key != "event" {
        return None;
    }
    let mut event = packet.data.into_event();

    // Newer NVRs send `{event_id}-{camera_id}` on the websocket while the
    // REST API reports the bare event id; normalize to the REST form.
    if let Some((id, _)) = event.id.split_once('-') {
        event.id = id.to_string();
    }
    Some(event)
}

#[derive(Debug, Deserialize)]
struct WsPacket {
    #[serde(rename = "modelKey")]
    model_key: String,
    #[serde(alias = "newObj", alias = "payload")]
    data: WireEvent,
}

#[derive(Debug, Deserialize)]
struct WireBootstrap {
    #[serde(default)]
    cameras: Vec<WireCamera>,
    nvr: WireNvr,
}

#[derive(Debug, Deserialize)]
struct WireCamera {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct WireNvr {
    #[serde(rename = "timezoneOffset")]
    timezone_offset: Option<i32>,
}

impl WireNvr {
    /// Minutes east of UTC, when the NVR reports one. Falls back to the
    /// agent's local offset otherwise.
    fn timezone_offset_minutes(&self) -> Option<i32> {
        self.timezone_offset
    }
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    id: String,
    #[serde(default)]
    camera: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "smartDetectTypes", default)]
    smart_detect_types: Vec<String>,
    start: Option<i64>,
    end: Option<i64>,
}

impl WireEvent {
    fn into_event(self) -> Event {
        let kind = match self.kind.as_str() {
            "motion" => EventKind::Motion,
            "ring" => EventKind::Ring,
            "smartDetectZone" | "smartDetectLine" | "smartAudioDetect" => EventKind::SmartDetect,
            other => EventKind::Other(other.to_string()),
        };

        Event {
            id: self.id,
            camera_id: self.camera.unwrap_or_default(),
            kind,
            smart_detect_types: self.smart_detect_types,
            start: self.start.and_then(millis_to_utc),
            end: self.end.and_then(millis_to_utc),
        }
    }
}

fn millis_to_utc(millis: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis).single()
}
