/// mpv media host.
///
/// mpv runs as a child process with `--idle=yes` and is driven over its JSON
/// IPC socket (a Unix socket, or a named pipe on Windows):
///
/// ```text
///   MpvHost (MediaHost impl)
///         │  ensure_handle() spawns mpv lazily, observes properties
///         │
///   MpvDriver::spawn_and_connect()
///         ├── writer_task   ← MpvRequest via mpsc, serialised → socket
///         └── reader_task   ← JSON lines from socket
///                                ├── reply (has request_id) → matching oneshot
///                                └── event / property-change → forwarder
///                                                                  │ translate()
///                                                                  ▼
///                                                     ControllerEvent::Media
/// ```
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use plusradio_proto::platform;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

use crate::core::ControllerEvent;
use crate::media::{MediaEvent, MediaHost, ReadyState};

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

/// How long a single IPC request may wait for its reply.
const REQUEST_TIMEOUT: tokio::time::Duration = tokio::time::Duration::from_secs(5);

/// Seconds of demuxer cache treated as comfortably buffered.
const ENOUGH_CACHE_SECS: f64 = 2.0;

// ── observation property IDs ──────────────────────────────────────────────────

pub const OBS_CORE_IDLE: u64 = 1;
pub const OBS_PAUSE: u64 = 2;
pub const OBS_ICY_TITLE: u64 = 3;
pub const OBS_TIME_POS: u64 = 4;
pub const OBS_PAUSED_FOR_CACHE: u64 = 5;

const OBSERVED: &[(u64, &str)] = &[
    (OBS_CORE_IDLE, "core-idle"),
    (OBS_PAUSE, "pause"),
    (OBS_ICY_TITLE, "metadata/by-key/icy-title"),
    (OBS_TIME_POS, "time-pos"),
    (OBS_PAUSED_FOR_CACHE, "paused-for-cache"),
];

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct MpvRequest {
    req_id: u64,
    /// Serialised JSON line, newline included.
    payload: String,
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// An unsolicited mpv message (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.event_name()? != "property-change" {
            return None;
        }
        let id = self.raw.get("id")?.as_u64()?;
        Some((id, self.raw.get("data").unwrap_or(&Value::Null)))
    }

    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }
}

/// Events worth a trip through the controller channel.  Playback position
/// changes several times a second and the controller has no use for it.
fn forwarded(evt: &MpvEvent) -> Option<MediaEvent> {
    translate(evt).filter(|media| !matches!(media, MediaEvent::TimeProgress(_)))
}

/// Map an mpv event onto the controller's media vocabulary.  Anything the
/// controller does not care about maps to `None`.
pub fn translate(evt: &MpvEvent) -> Option<MediaEvent> {
    if let Some((id, data)) = evt.as_property_change() {
        return match id {
            OBS_CORE_IDLE if data.as_bool() == Some(false) => Some(MediaEvent::Started),
            OBS_PAUSE if data.as_bool() == Some(true) => Some(MediaEvent::Paused),
            OBS_PAUSED_FOR_CACHE if data.as_bool() == Some(true) => Some(MediaEvent::Stalled),
            OBS_TIME_POS => data.as_f64().map(MediaEvent::TimeProgress),
            OBS_ICY_TITLE => Some(MediaEvent::MetadataReady(
                data.as_str().filter(|t| !t.trim().is_empty()).map(str::to_string),
            )),
            _ => None,
        };
    }

    match evt.event_name()? {
        "start-file" => Some(MediaEvent::LoadStarted),
        "file-loaded" => Some(MediaEvent::CanPlay),
        "end-file" => match evt.raw.get("reason").and_then(Value::as_str) {
            Some("error") => {
                let detail = evt
                    .raw
                    .get("file_error")
                    .and_then(Value::as_str)
                    .unwrap_or("playback error");
                Some(MediaEvent::Errored(detail.to_string()))
            }
            // A live stream reaching eof means the server hung up.
            Some("eof") => Some(MediaEvent::Errored("stream ended".to_string())),
            _ => None,
        },
        _ => None,
    }
}

/// Buffering level from mpv's cache properties.  No demuxer cache at all
/// means nothing was received yet.
pub fn ready_state_from(paused_for_cache: bool, cache_secs: Option<f64>) -> ReadyState {
    match cache_secs {
        None => ReadyState::HaveNothing,
        Some(_) if paused_for_cache => ReadyState::HaveCurrentData,
        Some(secs) if secs >= ENOUGH_CACHE_SECS => ReadyState::HaveEnoughData,
        Some(_) => ReadyState::HaveFutureData,
    }
}

// ── handle ────────────────────────────────────────────────────────────────────

/// Cloneable handle to the writer task.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<MpvRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let mut payload = serde_json::to_string(&json!({ "command": command, "request_id": req_id }))?;
        payload.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(MpvRequest {
                req_id,
                payload,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(REQUEST_TIMEOUT, reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn load_stream(&self, url: &str) -> anyhow::Result<()> {
        self.send(json!(["loadfile", url, "replace"])).await?;
        Ok(())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.send(json!(["stop"])).await?;
        Ok(())
    }

    pub async fn set_pause(&self, paused: bool) -> anyhow::Result<()> {
        self.send(json!(["set_property", "pause", paused])).await?;
        Ok(())
    }

    pub async fn set_volume(&self, volume: f32) -> anyhow::Result<()> {
        let pct = (volume * 100.0).clamp(0.0, 100.0);
        self.send(json!(["set_property", "volume", pct])).await?;
        Ok(())
    }

    async fn get_property(&self, name: &str) -> Option<Value> {
        match self.send(json!(["get_property", name])).await {
            Ok(mut resp) => resp.get_mut("data").map(Value::take),
            Err(e) => {
                debug!("mpv: get_property {} failed: {}", name, e);
                None
            }
        }
    }

    /// Register every observed property.  Needed after each fresh connection.
    pub async fn observe_all_properties(&self) {
        for (id, name) in OBSERVED {
            match self.send(json!(["observe_property", id, name])).await {
                Ok(_) => debug!("mpv: observe_property id={} name={}", id, name),
                Err(e) => warn!("mpv: observe_property {} failed: {}", name, e),
            }
        }
    }
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns the mpv child process.
pub struct MpvDriver {
    socket_name: String,
    process: Option<tokio::process::Child>,
}

impl Default for MpvDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MpvDriver {
    pub fn new() -> Self {
        Self {
            socket_name: platform::mpv_socket_name(),
            process: None,
        }
    }

    pub fn process_alive(&mut self) -> bool {
        match self.process.as_mut() {
            Some(child) => child.try_wait().ok().flatten().is_none(),
            None => false,
        }
    }

    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
    }

    async fn spawn_process(&mut self, volume: f32) -> anyhow::Result<()> {
        self.kill().await;

        let mpv_binary =
            platform::find_mpv_binary().ok_or_else(|| anyhow::anyhow!("mpv binary not found"))?;
        info!("mpv: spawning {:?}", mpv_binary);

        let child = tokio::process::Command::new(mpv_binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg("--quiet")
            .arg("--cache=yes")
            .arg(platform::mpv_socket_arg())
            .arg(format!(
                "--volume={}",
                (volume * 100.0).clamp(0.0, 100.0).round() as i64
            ))
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()?;
        self.process = Some(child);
        Ok(())
    }

    #[cfg(unix)]
    pub async fn spawn_and_connect(
        &mut self,
        volume: f32,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        let socket_path = std::path::PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;
        self.spawn_process(volume).await?;

        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        let stream = UnixStream::connect(&socket_path)
            .await
            .map_err(|e| anyhow::anyhow!("mpv IPC socket unavailable: {}", e))?;
        info!("mpv: connected to IPC socket");

        let (read_half, write_half) = stream.into_split();
        Ok(start_io_tasks(read_half, write_half, event_tx))
    }

    #[cfg(windows)]
    pub async fn spawn_and_connect(
        &mut self,
        volume: f32,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> anyhow::Result<MpvHandle> {
        self.spawn_process(volume).await?;

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                info!("mpv: connected to named pipe");
                let (read_half, write_half) = tokio::io::split(client);
                return Ok(start_io_tasks(read_half, write_half, event_tx));
            }
        }
        anyhow::bail!("mpv named pipe did not appear")
    }
}

/// Spawn the reader and writer tasks over an established connection.
pub fn start_io_tasks<R, W>(read: R, write: W, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<MpvRequest>(64);

    tokio::spawn(writer_task(write, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(BufReader::new(read), pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

async fn fail_all(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("{}", reason)));
    }
}

async fn reader_task<R>(mut reader: BufReader<R>, pending: PendingMap, event_tx: mpsc::Sender<MpvEvent>)
where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_all(&pending, "mpv IPC connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                let Some(req_id) = val.get("request_id").and_then(Value::as_u64) else {
                    if event_tx.send(MpvEvent { raw: val }).await.is_err() {
                        debug!("mpv reader: event receiver gone");
                    }
                    continue;
                };

                let Some(tx) = pending.lock().await.remove(&req_id) else {
                    debug!("mpv reader: reply for unknown req={}", req_id);
                    continue;
                };
                let result = match val["error"].as_str() {
                    Some("success") => Ok(val),
                    other => Err(anyhow::anyhow!(
                        "mpv error: {}",
                        other.unwrap_or("unknown error")
                    )),
                };
                let _ = tx.send(result);
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_all(&pending, "mpv IPC read error").await;
                break;
            }
        }
    }
}

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<MpvRequest>, pending: PendingMap)
where
    W: AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // register before writing so the reader can match the reply
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: req={} {}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

// ── MediaHost ─────────────────────────────────────────────────────────────────

/// `MediaHost` backed by an mpv child process.  mpv is started on first use
/// and restarted if it dies.
pub struct MpvHost {
    driver: MpvDriver,
    handle: Option<MpvHandle>,
    forwarder: Option<AbortHandle>,
    controller_tx: mpsc::Sender<ControllerEvent>,
    volume: f32,
}

impl MpvHost {
    pub fn new(controller_tx: mpsc::Sender<ControllerEvent>) -> Self {
        Self {
            driver: MpvDriver::new(),
            handle: None,
            forwarder: None,
            controller_tx,
            volume: 0.8,
        }
    }

    async fn ensure_handle(&mut self) -> anyhow::Result<MpvHandle> {
        if let Some(handle) = &self.handle {
            if !handle.is_closed() && self.driver.process_alive() {
                return Ok(handle.clone());
            }
            warn!("mpv: process died, restarting");
            self.handle = None;
        }

        if let Some(prev) = self.forwarder.take() {
            prev.abort();
        }
        let (event_tx, mut event_rx) = mpsc::channel::<MpvEvent>(64);
        let controller_tx = self.controller_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(evt) = event_rx.recv().await {
                let Some(media) = forwarded(&evt) else {
                    continue;
                };
                if controller_tx.send(ControllerEvent::Media(media)).await.is_err() {
                    break;
                }
            }
        });
        self.forwarder = Some(forwarder.abort_handle());

        let handle = self.driver.spawn_and_connect(self.volume, event_tx).await?;
        handle.observe_all_properties().await;
        self.handle = Some(handle.clone());
        Ok(handle)
    }
}

#[async_trait]
impl MediaHost for MpvHost {
    async fn load(&mut self, url: &str) -> anyhow::Result<()> {
        let handle = self.ensure_handle().await?;
        // queue paused; play() starts it
        handle.set_pause(true).await?;
        handle.load_stream(url).await
    }

    async fn play(&mut self) -> anyhow::Result<()> {
        let handle = self.ensure_handle().await?;
        handle.set_pause(false).await
    }

    async fn pause(&mut self) -> anyhow::Result<()> {
        match &self.handle {
            Some(handle) => handle.set_pause(true).await,
            None => Ok(()),
        }
    }

    async fn reset(&mut self) -> anyhow::Result<()> {
        match &self.handle {
            Some(handle) => handle.stop().await,
            None => Ok(()),
        }
    }

    async fn set_volume(&mut self, volume: f32) -> anyhow::Result<()> {
        self.volume = volume;
        match &self.handle {
            Some(handle) => handle.set_volume(volume).await,
            None => Ok(()),
        }
    }

    async fn ready_state(&mut self) -> ReadyState {
        let Some(handle) = self.handle.clone() else {
            return ReadyState::HaveNothing;
        };
        let paused_for_cache = handle
            .get_property("paused-for-cache")
            .await
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        let cache_secs = handle
            .get_property("demuxer-cache-duration")
            .await
            .and_then(|v| v.as_f64());
        ready_state_from(paused_for_cache, cache_secs)
    }

    async fn shutdown(&mut self) {
        info!("mpv: shutting down");
        if let Some(handle) = self.handle.take() {
            let _ = handle.send(json!(["quit"])).await;
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        self.driver.kill().await;
    }
}
