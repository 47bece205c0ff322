//! mpv IPC driver with separated reader/writer tasks, and the
//! `PlaybackEngine` built on it.
//!
//! Architecture:
//!
//! ```text
//!   MpvEngine::prepare()
//!         │
//!         ├── MpvDriver::spawn_and_connect()
//!         │       ├── writer_task   ← receives PendingRequest via mpsc, serialises → socket
//!         │       └── reader_task   ← reads JSON lines from socket
//!         │                              ├── response (has request_id) → matched oneshot::Sender
//!         │                              └── event                     → event channel
//!         └── event_task            ← file-loaded / end-file → LoadState watch + EngineSignal
//! ```
//!
//! Platform notes:
//! - Unix:   Unix domain sockets
//! - Windows: Named pipes  \\.\pipe\<name>

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

use crate::engine::{EngineError, EngineSignal, PlaybackEngine};

// ── global request-id counter ─────────────────────────────────────────────────

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

/// How long `prepare` waits for mpv to report `file-loaded`.
const PREPARE_TIMEOUT: Duration = Duration::from_secs(15);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

// ── internal channel types ────────────────────────────────────────────────────

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// An mpv event that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// Returns the event name, e.g. "end-file", "start-file", "file-loaded".
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    /// `reason` of an end-file event ("eof", "stop", "quit", "error", ...).
    pub fn end_reason(&self) -> Option<&str> {
        self.raw.get("reason")?.as_str()
    }
}

// ── public handle ─────────────────────────────────────────────────────────────

/// Cloneable handle to the mpv writer task.  Use `send()` to fire a command
/// and await the response.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
    timeout: Duration,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(self.timeout, reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    /// True once the writer task has exited (socket or process gone).
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

    pub async fn set_volume(&self, vol: f32) -> anyhow::Result<()> {
        let vol_pct = (vol * 100.0).clamp(0.0, 100.0);
        self.send(json!(["set_property", "volume", vol_pct])).await?;
        Ok(())
    }

    pub async fn set_pause(&self, paused: bool) -> anyhow::Result<()> {
        self.send(json!(["set_property", "pause", paused])).await?;
        Ok(())
    }

    pub async fn get_pause(&self) -> anyhow::Result<bool> {
        let resp = self.send(json!(["get_property", "pause"])).await?;
        Ok(resp["data"].as_bool().unwrap_or(true))
    }
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns the mpv child process and manages (re)connection.
pub struct MpvDriver {
    socket_name: String,
    process: Option<tokio::process::Child>,
    pub last_volume: f32,
    ipc_timeout: Duration,
}

impl MpvDriver {
    pub fn new(ipc_timeout: Duration) -> Self {
        Self {
            socket_name: station_proto::platform::mpv_socket_name(),
            process: None,
            last_volume: 1.0,
            ipc_timeout,
        }
    }

    pub fn process_alive(&mut self) -> bool {
        if let Some(ref mut child) = self.process {
            child.try_wait().ok().flatten().is_none()
        } else {
            false
        }
    }

    /// Kill the process if running.
    pub async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
    }

    fn spawn_process(&mut self) -> Result<(), EngineError> {
        let mpv_binary =
            station_proto::platform::find_mpv_binary().ok_or(EngineError::PlayerMissing)?;

        let vol_arg = format!(
            "--volume={}",
            (self.last_volume * 100.0).clamp(0.0, 100.0).round() as i64
        );
        let ipc_arg = station_proto::platform::mpv_socket_arg();

        info!("mpv: spawning {}", mpv_binary.display());
        let child = tokio::process::Command::new(mpv_binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg(&ipc_arg)
            .arg("--quiet")
            .arg(vol_arg)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Prepare(format!("failed to spawn mpv: {}", e)))?;
        self.process = Some(child);
        Ok(())
    }

    // ── spawn / reconnect ─────────────────────────────────────────────────────

    #[cfg(unix)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> Result<MpvHandle, EngineError> {
        self.kill().await;

        let socket_path = std::path::PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;

        self.spawn_process()?;

        // Wait for socket to appear
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            return Err(EngineError::Prepare("mpv IPC socket did not appear".into()));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stream = UnixStream::connect(&socket_path)
            .await
            .map_err(|e| EngineError::Prepare(format!("mpv IPC connect: {}", e)))?;
        info!("mpv: connected to IPC socket");
        Ok(Self::start_io_tasks(stream, event_tx, self.ipc_timeout))
    }

    #[cfg(unix)]
    fn start_io_tasks(
        stream: UnixStream,
        event_tx: mpsc::Sender<MpvEvent>,
        timeout: Duration,
    ) -> MpvHandle {
        let (read_half, write_half) = stream.into_split();
        let reader = BufReader::new(read_half);

        // req_id → reply channel.  Writer inserts, reader resolves.
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

        tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
        tokio::spawn(reader_task(reader, pending, event_tx));

        MpvHandle {
            tx: cmd_tx,
            timeout,
        }
    }

    // ── Windows ───────────────────────────────────────────────────────────────

    #[cfg(windows)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> Result<MpvHandle, EngineError> {
        self.kill().await;
        self.spawn_process()?;

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                info!("mpv: connected to named pipe");
                return Ok(Self::start_io_tasks_windows(
                    client,
                    event_tx,
                    self.ipc_timeout,
                ));
            }
        }
        Err(EngineError::Prepare("mpv named pipe did not appear".into()))
    }

    #[cfg(windows)]
    fn start_io_tasks_windows(
        pipe: tokio::net::windows::named_pipe::NamedPipeClient,
        event_tx: mpsc::Sender<MpvEvent>,
        timeout: Duration,
    ) -> MpvHandle {
        let (read_half, write_half) = tokio::io::split(pipe);
        let reader = BufReader::new(read_half);

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

        tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
        tokio::spawn(reader_task(reader, pending, event_tx));

        MpvHandle {
            tx: cmd_tx,
            timeout,
        }
    }
}

// ── reader task ───────────────────────────────────────────────────────────────

async fn reader_task<R>(
    mut reader: BufReader<R>,
    pending: PendingMap,
    event_tx: mpsc::Sender<MpvEvent>,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_pending(&pending, "mpv IPC connection closed").await;
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

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"]
                                .as_str()
                                .unwrap_or("unknown error")
                                .to_string();
                            debug!("mpv reader: response req={} err={}", req_id, err);
                            Err(anyhow::anyhow!("mpv error: {}", err))
                        };
                        let _ = tx.send(result);
                    } else {
                        debug!("mpv reader: response for unknown req={}", req_id);
                    }
                } else {
                    debug!("mpv reader: event {}", trimmed);
                    let _ = event_tx.send(MpvEvent { raw: val }).await;
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_pending(&pending, "mpv IPC read error").await;
                break;
            }
        }
    }
}

async fn fail_pending(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("{}", reason)));
    }
}

// ── writer task ───────────────────────────────────────────────────────────────

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register reply channel before writing so reader can match it
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: send req={} payload={}", req.req_id, req.payload.trim());
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

// ── load tracking ─────────────────────────────────────────────────────────────

/// Where the current stream is in its load cycle, as seen from mpv events.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadState {
    Idle,
    Loading,
    Loaded,
    Failed(String),
}

/// Translate raw mpv events into load-state changes and engine signals.
/// Returns the new load state, if it changed.
fn on_mpv_event(current: &LoadState, evt: &MpvEvent) -> (Option<LoadState>, Option<EngineSignal>) {
    match evt.event_name() {
        Some("file-loaded") if *current == LoadState::Loading => (Some(LoadState::Loaded), None),
        Some("end-file") => {
            let reason = evt.end_reason().unwrap_or("unknown");
            let failed = matches!(reason, "error" | "network");
            let detail = evt
                .raw
                .get("file_error")
                .and_then(|v| v.as_str())
                .unwrap_or(reason)
                .to_string();
            match current {
                LoadState::Loading if failed => (Some(LoadState::Failed(detail)), None),
                LoadState::Loaded if failed => (
                    Some(LoadState::Idle),
                    Some(EngineSignal::StreamFailed(detail)),
                ),
                LoadState::Loaded if reason == "eof" => (
                    Some(LoadState::Idle),
                    Some(EngineSignal::StreamFailed("stream ended".into())),
                ),
                _ => (None, None),
            }
        }
        _ => (None, None),
    }
}

async fn event_task(
    mut events: mpsc::Receiver<MpvEvent>,
    load_tx: watch::Sender<LoadState>,
    signal_tx: mpsc::Sender<EngineSignal>,
) {
    while let Some(evt) = events.recv().await {
        let current = load_tx.borrow().clone();
        let (next, signal) = on_mpv_event(&current, &evt);
        if let Some(next) = next {
            debug!("mpv: load state {:?} → {:?}", current, next);
            let _ = load_tx.send(next);
        }
        if let Some(signal) = signal {
            info!("mpv: {:?}", signal);
            let _ = signal_tx.send(signal).await;
        }
    }
    // Reader gone: the connection or the process died.
    let was_loaded = *load_tx.borrow() == LoadState::Loaded;
    let _ = load_tx.send(LoadState::Idle);
    if was_loaded {
        let _ = signal_tx.send(EngineSignal::PlayerExited).await;
    }
    debug!("mpv: event task exiting");
}

// ── engine ────────────────────────────────────────────────────────────────────

/// `PlaybackEngine` backed by an mpv child process.
pub struct MpvEngine {
    driver: MpvDriver,
    handle: Option<MpvHandle>,
    stream_url: String,
    load_tx: watch::Sender<LoadState>,
    load_rx: watch::Receiver<LoadState>,
    signal_tx: mpsc::Sender<EngineSignal>,
}

impl MpvEngine {
    pub fn new(
        stream_url: String,
        volume: f32,
        ipc_timeout: Duration,
        signal_tx: mpsc::Sender<EngineSignal>,
    ) -> Self {
        let mut driver = MpvDriver::new(ipc_timeout);
        driver.last_volume = volume;
        let (load_tx, load_rx) = watch::channel(LoadState::Idle);
        Self {
            driver,
            handle: None,
            stream_url,
            load_tx,
            load_rx,
            signal_tx,
        }
    }

    async fn ensure_handle(&mut self) -> Result<MpvHandle, EngineError> {
        if self.handle.is_some() && !self.driver.process_alive() {
            warn!("mpv: process died, dropping handle");
            self.handle = None;
        }

        if let Some(handle) = &self.handle {
            return Ok(handle.clone());
        }

        let (event_tx, event_rx) = mpsc::channel::<MpvEvent>(64);
        let handle = self.driver.spawn_and_connect(event_tx).await?;
        let _ = self.load_tx.send(LoadState::Idle);
        tokio::spawn(event_task(
            event_rx,
            self.load_tx.clone(),
            self.signal_tx.clone(),
        ));
        self.handle = Some(handle.clone());
        Ok(handle)
    }

    fn loaded_handle(&self) -> Result<&MpvHandle, EngineError> {
        match &self.handle {
            Some(h) if self.is_prepared() => Ok(h),
            _ => Err(EngineError::NotPrepared),
        }
    }
}

#[async_trait]
impl PlaybackEngine for MpvEngine {
    async fn prepare(&mut self) -> Result<(), EngineError> {
        let handle = self.ensure_handle().await?;

        // Load paused; start() unpauses.
        handle.set_pause(true).await?;
        let _ = self.load_tx.send(LoadState::Loading);
        info!("mpv: loading {}", self.stream_url);
        if let Err(e) = handle.load_stream(&self.stream_url).await {
            let _ = self.load_tx.send(LoadState::Idle);
            return Err(EngineError::Prepare(e.to_string()));
        }

        let mut rx = self.load_rx.clone();
        let settled = tokio::time::timeout(
            PREPARE_TIMEOUT,
            rx.wait_for(|s| !matches!(s, LoadState::Loading)),
        )
        .await
        .map(|r| r.map(|state| (*state).clone()));

        match settled {
            Ok(Ok(LoadState::Loaded)) => Ok(()),
            Ok(Ok(LoadState::Failed(reason))) => Err(EngineError::Prepare(reason)),
            Ok(Ok(other)) => Err(EngineError::Prepare(format!(
                "unexpected load state {:?}",
                other
            ))),
            Ok(Err(_)) => Err(EngineError::Prepare("mpv event channel closed".into())),
            Err(_) => {
                let _ = handle.stop().await;
                let _ = self.load_tx.send(LoadState::Idle);
                Err(EngineError::Prepare(format!(
                    "stream not loaded after {}s",
                    PREPARE_TIMEOUT.as_secs()
                )))
            }
        }
    }

    fn is_prepared(&self) -> bool {
        *self.load_rx.borrow() == LoadState::Loaded
    }

    async fn start(&mut self) -> Result<(), EngineError> {
        self.loaded_handle()?.set_pause(false).await?;
        Ok(())
    }

    async fn pause(&mut self) -> Result<(), EngineError> {
        self.loaded_handle()?.set_pause(true).await?;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), EngineError> {
        // Mark idle first so the "stop" end-file is not read as a failure.
        let _ = self.load_tx.send(LoadState::Idle);
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        // A dead player is as stopped as it gets.
        if handle.is_closed() || !self.driver.process_alive() {
            warn!("mpv: player gone, dropping handle on stop");
            return Ok(());
        }
        match handle.stop().await {
            Ok(()) => {
                self.handle = Some(handle);
                Ok(())
            }
            Err(_) if handle.is_closed() => {
                warn!("mpv: connection closed during stop, dropping handle");
                Ok(())
            }
            Err(e) => {
                self.handle = Some(handle);
                Err(e.into())
            }
        }
    }

    async fn is_playing(&mut self) -> bool {
        match self.loaded_handle() {
            Ok(h) => matches!(h.get_pause().await, Ok(false)),
            Err(_) => false,
        }
    }

    async fn set_volume(&mut self, volume: f32) -> Result<(), EngineError> {
        self.driver.last_volume = volume;
        if let Some(handle) = &self.handle {
            handle.set_volume(volume).await?;
        }
        Ok(())
    }

    async fn shutdown(&mut self) {
        info!("mpv: shutting down");
        if let Some(handle) = self.handle.take() {
            let _ = handle.stop().await;
        }
        let _ = self.load_tx.send(LoadState::Idle);
        self.driver.kill().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(raw: Value) -> MpvEvent {
        MpvEvent { raw }
    }

    #[test]
    fn test_file_loaded_completes_preparation() {
        let (next, signal) = on_mpv_event(&LoadState::Loading, &event(json!({"event": "file-loaded"})));
        assert_eq!(next, Some(LoadState::Loaded));
        assert_eq!(signal, None);
    }

    #[test]
    fn test_error_while_loading_fails_preparation() {
        let evt = event(json!({"event": "end-file", "reason": "error", "file_error": "loading failed"}));
        let (next, signal) = on_mpv_event(&LoadState::Loading, &evt);
        assert_eq!(next, Some(LoadState::Failed("loading failed".into())));
        assert_eq!(signal, None);
    }

    #[test]
    fn test_error_while_loaded_signals_stream_failure() {
        let evt = event(json!({"event": "end-file", "reason": "error"}));
        let (next, signal) = on_mpv_event(&LoadState::Loaded, &evt);
        assert_eq!(next, Some(LoadState::Idle));
        assert_eq!(signal, Some(EngineSignal::StreamFailed("error".into())));
    }

    #[test]
    fn test_stop_end_file_is_not_a_failure() {
        let evt = event(json!({"event": "end-file", "reason": "stop"}));
        assert_eq!(on_mpv_event(&LoadState::Idle, &evt), (None, None));
        // loadfile "replace" ends the previous file with reason=stop while loading
        assert_eq!(on_mpv_event(&LoadState::Loading, &evt), (None, None));
    }

    #[test]
    fn test_unrelated_events_ignored() {
        let evt = event(json!({"event": "audio-reconfig"}));
        assert_eq!(on_mpv_event(&LoadState::Loaded, &evt), (None, None));
    }

    #[tokio::test]
    async fn test_unprepared_engine_refuses_start() {
        let (tx, _rx) = mpsc::channel(4);
        let mut engine = MpvEngine::new(
            "http://127.0.0.1:9/stream".into(),
            1.0,
            Duration::from_secs(1),
            tx,
        );
        assert!(!engine.is_prepared());
        assert!(matches!(engine.start().await, Err(EngineError::NotPrepared)));
        assert!(!engine.is_playing().await);
        assert!(engine.stop().await.is_ok());
    }

    /// Engine whose mpv connection is already gone but which still believes
    /// the stream is loaded.
    fn engine_with_dead_player() -> MpvEngine {
        let (signal_tx, _) = mpsc::channel(4);
        let mut engine = MpvEngine::new(
            "http://127.0.0.1:9/stream".into(),
            1.0,
            Duration::from_secs(1),
            signal_tx,
        );
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        engine.handle = Some(MpvHandle {
            tx,
            timeout: Duration::from_secs(1),
        });
        let _ = engine.load_tx.send(LoadState::Loaded);
        engine
    }

    #[tokio::test]
    async fn test_stop_with_dead_player_drops_handle() {
        let mut engine = engine_with_dead_player();
        assert!(engine.is_prepared());
        assert!(engine.stop().await.is_ok());
        assert!(engine.handle.is_none());
        assert!(!engine.is_prepared());
    }

    #[tokio::test]
    async fn test_player_exit_with_dead_player_reaches_stopped() {
        use crate::core::{CoreEvent, SyncCore};
        use station_proto::config::Config;
        use station_proto::playback::PlaybackState;
        use station_proto::protocol::Command;
        use tokio::sync::broadcast;

        let (event_tx, _event_rx) = mpsc::channel(16);
        let (broadcast_tx, _broadcast_rx) = broadcast::channel(16);
        let mut core = SyncCore::new(
            Config::default(),
            engine_with_dead_player(),
            None,
            event_tx,
            broadcast_tx,
        );
        let sm = core.state_manager();
        sm.set_playback(PlaybackState::Playing).await;

        assert!(
            core.handle_event(CoreEvent::Engine(EngineSignal::PlayerExited))
                .await
        );
        assert_eq!(sm.playback().await, PlaybackState::Stopped);

        core.handle_event(CoreEvent::Command(Command::Stop)).await;
        core.handle_event(CoreEvent::Command(Command::Pause)).await;
        assert_eq!(sm.playback().await, PlaybackState::Stopped);
    }
}
