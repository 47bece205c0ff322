mod core;
mod engine;
mod focus;
mod http;
mod mpv;
mod notification;
mod session;
mod socket;

use anyhow::Context;
use station_proto::config::Config;
use station_proto::track::{TrackFetcher, TrackLabel};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::core::{CoreEvent, SyncCore};
use crate::engine::EngineSignal;
use crate::mpv::MpvEngine;
use crate::notification::{FileSink, LogSink, NotificationRenderer, NotificationSink};
use crate::session::MediaSession;

#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    /// The state changed; observers re-read the snapshot.
    StateUpdated,
    /// The boolean "is audio playing" signal, with the rev it belongs to.
    PlaybackChanged { is_playing: bool, rev: u64 },
    TrackUpdated(TrackLabel),
    /// Transient user-facing message.
    Notice(String),
    Log(String),
}

/// A custom tracing layer that forwards log messages to the broadcast channel
struct BroadcastLayer {
    sender: broadcast::Sender<BroadcastMessage>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<BroadcastMessage>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        // Only WARN and ERROR go to clients
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = String::new();
        let now = chrono::Local::now();
        message.push_str(&format!("{} ", now.format("%H:%M:%S")));
        message.push_str(&format!("[{}] ", level));

        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // No receivers is fine
        let _ = self.sender.send(BroadcastMessage::Log(message));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Broadcast channel first so logging can use it
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(100);

    let data_dir = station_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("creating data dir {:?}", data_dir))?;
    let log_path = data_dir.join("daemon.log");

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("opening log file {:?}", log_path))?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    let broadcast_layer = BroadcastLayer::new(broadcast_tx.clone());

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(broadcast_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info,station_daemon=debug")
            }),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load().context("loading config")?;
    info!("Config loaded from: {:?}", Config::config_path());

    let fetcher = TrackFetcher::from_config(&config).context("invalid track settings")?;

    // Event channel: all external inputs funnel into SyncCore
    let (event_tx, event_rx) = mpsc::channel::<CoreEvent>(256);

    // Engine signals are forwarded into the same channel
    let (signal_tx, mut signal_rx) = mpsc::channel::<EngineSignal>(16);
    let forward_tx = event_tx.clone();
    tokio::spawn(async move {
        while let Some(signal) = signal_rx.recv().await {
            if forward_tx.send(CoreEvent::Engine(signal)).await.is_err() {
                break;
            }
        }
    });

    let engine = MpvEngine::new(
        config.station.stream_url.clone(),
        config.engine.volume,
        Duration::from_secs(config.engine.ipc_timeout_secs),
        signal_tx,
    );

    let sync_core = SyncCore::new(
        config.clone(),
        engine,
        Some(fetcher),
        event_tx.clone(),
        broadcast_tx.clone(),
    );
    let state_manager = sync_core.state_manager();

    // Observers
    let mut sinks: Vec<Box<dyn NotificationSink>> = vec![Box::new(LogSink)];
    if config.notification.file_sink {
        sinks.push(Box::new(FileSink::in_data_dir()));
    }
    notification::start_renderer(
        NotificationRenderer::new(sinks),
        state_manager.clone(),
        broadcast_tx.subscribe(),
    );

    let session = Arc::new(RwLock::new(MediaSession::default()));
    session::start_publisher(
        session.clone(),
        state_manager.clone(),
        broadcast_tx.subscribe(),
    );

    // TCP socket server for control clients
    let _socket_handle = socket::start_server(
        config.socket.bind_address.clone(),
        config.socket.port,
        state_manager.clone(),
        event_tx.clone(),
        broadcast_tx.clone(),
    );

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            http::HttpState {
                state_manager: state_manager.clone(),
                session,
                event_tx: event_tx.clone(),
            },
        );
    }

    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            return;
        }
        info!("Interrupt received");
        let _ = shutdown_tx.send(CoreEvent::Shutdown).await;
    });

    info!("Daemon initialised, running event loop");
    sync_core.run(event_rx).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::fake::FakeEngine;
    use crate::notification::{NotificationAction, NotificationModel};
    use crate::session::{SessionPlaybackState, SharedSession};
    use station_proto::playback::PlaybackState;
    use station_proto::protocol::{Broadcast, Command, FocusChange, Message};
    use station_proto::replica::StateReplica;
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;
    use tokio::net::{TcpListener, TcpStream};

    struct RecordingSink(Arc<Mutex<Vec<NotificationModel>>>);

    impl NotificationSink for RecordingSink {
        fn publish(&mut self, model: &NotificationModel) -> anyhow::Result<()> {
            self.0.lock().unwrap().push(model.clone());
            Ok(())
        }
    }

    async fn next_broadcast(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Broadcast {
        let mut tmp = [0u8; 4096];
        loop {
            if let Some((msg, consumed)) = Message::next_frame(buf).unwrap() {
                buf.drain(..consumed);
                if let Message::Broadcast(b) = msg {
                    return b;
                }
                continue;
            }
            let n = stream.read(&mut tmp).await.unwrap();
            assert!(n > 0, "daemon closed the connection");
            buf.extend_from_slice(&tmp[..n]);
        }
    }

    #[tokio::test]
    async fn test_focus_loss_reaches_every_observer() {
        let (engine, _log) = FakeEngine::new();
        let (event_tx, event_rx) = mpsc::channel(64);
        let (broadcast_tx, _) = broadcast::channel(256);
        let core = SyncCore::new(
            Config::default(),
            engine,
            None,
            event_tx.clone(),
            broadcast_tx.clone(),
        );
        let sm = core.state_manager();

        let rendered = Arc::new(Mutex::new(Vec::new()));
        crate::notification::start_renderer(
            NotificationRenderer::new(vec![Box::new(RecordingSink(rendered.clone()))]),
            sm.clone(),
            broadcast_tx.subscribe(),
        );
        let session: SharedSession = Arc::new(RwLock::new(MediaSession::default()));
        crate::session::start_publisher(session.clone(), sm.clone(), broadcast_tx.subscribe());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(crate::socket::serve(
            listener,
            sm.clone(),
            event_tx.clone(),
            broadcast_tx.clone(),
        ));
        let core_task = tokio::spawn(core.run(event_rx));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = Vec::new();
        let mut replica = StateReplica::new();
        replica.apply(next_broadcast(&mut client, &mut buf).await);
        assert_eq!(replica.playback(), PlaybackState::Stopped);

        event_tx.send(CoreEvent::Command(Command::Play)).await.unwrap();
        event_tx
            .send(CoreEvent::Command(Command::AudioFocus {
                change: FocusChange::Loss,
            }))
            .await
            .unwrap();

        let mut saw_playing = false;
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                replica.apply(next_broadcast(&mut client, &mut buf).await);
                saw_playing |= replica.is_playing();
                if saw_playing && replica.playback() == PlaybackState::Paused {
                    break;
                }
            }
        })
        .await
        .expect("client never saw the forced pause");
        assert_eq!(replica.playback().button_glyph(), '▶');

        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if session.read().await.state == SessionPlaybackState::Paused {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("media session never showed Paused");

        let last = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let last = rendered.lock().unwrap().last().cloned();
                match last {
                    Some(m) if m.visible && m.primary() == NotificationAction::Play => break m,
                    _ => tokio::time::sleep(Duration::from_millis(10)).await,
                }
            }
        })
        .await
        .expect("notification never offered Play");
        assert_eq!(last.actions, [NotificationAction::Play, NotificationAction::Stop]);
        assert!(!last.ongoing);

        event_tx.send(CoreEvent::Shutdown).await.unwrap();
        core_task.await.unwrap().unwrap();
    }
}
