//! SyncCore: single-owner event loop for the playback state.
//!
//! Every input that can change what the daemon is doing (client commands,
//! focus reports, engine signals, finished track fetches, refresh ticks)
//! arrives as a `CoreEvent` on one mpsc channel.  SyncCore owns the engine
//! and the focus tracker exclusively and is the only writer of
//! `StationState`.
//!
//! Transitions are confirm-after-execute: a request is validated against the
//! transition table, the engine is driven, and only when the engine accepted
//! the operation is the new state written and broadcast.  A failed engine op
//! leaves the state untouched and produces a `Notice` instead.

use std::sync::Arc;
use std::time::Duration;

use station_proto::config::Config;
use station_proto::playback::{PlaybackState, Transition};
use station_proto::protocol::{
    Command, EngineHealth, FocusChange, FocusState, FOCUS_DENIED, LOAD_FAILED, PLAYBACK_ERROR,
};
use station_proto::state::StateManager;
use station_proto::track::{TrackFetcher, TrackLabel};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::engine::{EngineError, EngineSignal, PlaybackEngine};
use crate::focus::{FocusEffect, FocusRequest, FocusTracker};
use crate::BroadcastMessage;

// ── CoreEvent ─────────────────────────────────────────────────────────────────

/// All inputs into the SyncCore loop.
#[derive(Debug)]
pub enum CoreEvent {
    /// A command from a socket client, the HTTP API or a notification action.
    Command(Command),
    /// Unsolicited news from the engine.
    Engine(EngineSignal),
    /// A background track fetch finished.
    TrackFetched(TrackLabel),
    /// Periodic re-scrape of the station page.
    RefreshTick,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied(PlaybackState),
    NoOp,
}

#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("audio focus denied")]
    FocusDenied,

    #[error(transparent)]
    Prepare(EngineError),

    #[error(transparent)]
    Engine(EngineError),
}

impl TransitionError {
    /// Text for the transient notice shown to the user.
    pub fn notice(&self) -> String {
        match self {
            TransitionError::FocusDenied => FOCUS_DENIED.to_string(),
            TransitionError::Prepare(_) => LOAD_FAILED.to_string(),
            TransitionError::Engine(e) => format!("{}: {}", PLAYBACK_ERROR, e),
        }
    }
}

// ── SyncCore ──────────────────────────────────────────────────────────────────

pub struct SyncCore<E: PlaybackEngine> {
    config: Config,
    state_manager: Arc<StateManager>,
    engine: E,
    focus: FocusTracker,
    fetcher: Option<TrackFetcher>,
    /// Our own input channel, for results of spawned work.
    event_tx: mpsc::Sender<CoreEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
}

impl<E: PlaybackEngine> SyncCore<E> {
    pub fn new(
        config: Config,
        engine: E,
        fetcher: Option<TrackFetcher>,
        event_tx: mpsc::Sender<CoreEvent>,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
    ) -> Self {
        let state_manager = Arc::new(StateManager::new(
            config.station.to_station(),
            config.engine.volume,
        ));
        Self {
            config,
            state_manager,
            engine,
            focus: FocusTracker::new(),
            fetcher,
            event_tx,
            broadcast_tx,
        }
    }

    /// Borrow the state manager (for observers and servers).
    pub fn state_manager(&self) -> Arc<StateManager> {
        Arc::clone(&self.state_manager)
    }

    /// Run the core event loop.  Returns when a `Shutdown` event is received
    /// or every sender is gone.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<CoreEvent>) -> anyhow::Result<()> {
        info!("SyncCore: starting event loop");
        self.startup().await;

        if self.config.track.refresh_secs > 0 {
            let tick_tx = self.event_tx.clone();
            let period = Duration::from_secs(self.config.track.refresh_secs);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    if tick_tx.send(CoreEvent::RefreshTick).await.is_err() {
                        break;
                    }
                }
            });
        }

        while let Some(evt) = event_rx.recv().await {
            if !self.handle_event(evt).await {
                break;
            }
        }

        info!("SyncCore: shutting down");
        self.engine.shutdown().await;
        Ok(())
    }

    /// Initial fetch, plus autoplay when configured.
    pub async fn startup(&mut self) {
        self.spawn_track_fetch();
        if self.config.station.autoplay {
            info!("SyncCore: autoplay enabled");
            self.request_or_notify(Transition::Play).await;
        }
    }

    /// Handle one event.  Returns false when the loop should stop.
    pub async fn handle_event(&mut self, evt: CoreEvent) -> bool {
        match evt {
            CoreEvent::Shutdown => {
                info!("SyncCore: shutdown requested");
                return false;
            }
            CoreEvent::Command(cmd) => {
                info!("SyncCore: command {:?}", cmd);
                self.handle_command(cmd).await;
            }
            CoreEvent::Engine(signal) => self.handle_engine_signal(signal).await,
            CoreEvent::TrackFetched(label) => {
                if self.state_manager.set_track(label.clone()).await {
                    info!("SyncCore: track → {}", label.display());
                    let _ = self.broadcast_tx.send(BroadcastMessage::TrackUpdated(label));
                    let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
                }
            }
            CoreEvent::RefreshTick => self.spawn_track_fetch(),
        }
        true
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Play => self.client_request(Transition::Play).await,
            Command::Pause => self.client_request(Transition::Pause).await,
            Command::Stop => self.client_request(Transition::Stop).await,
            Command::TogglePause => {
                let current = self.state_manager.playback().await;
                self.client_request(Transition::toggle(current)).await;
            }
            Command::RefreshTrack => self.spawn_track_fetch(),
            Command::AudioFocus { change } => self.handle_focus_change(change).await,
            // Answered by the socket server from the snapshot.
            Command::GetState => {}
        }
    }

    async fn client_request(&mut self, transition: Transition) {
        // An explicit Pause or Stop cancels a pending resume, even when it
        // is a no-op because a transient loss already paused us.
        if matches!(transition, Transition::Pause | Transition::Stop) {
            self.focus.forget_resume();
        }
        self.request_or_notify(transition).await;
    }

    async fn request_or_notify(&mut self, transition: Transition) {
        if let Err(e) = self.request(transition).await {
            warn!("SyncCore: {:?} failed: {}", transition, e);
            self.notice(e.notice());
        }
    }

    /// Validate, drive the engine, then publish.
    pub async fn request(&mut self, transition: Transition) -> Result<Outcome, TransitionError> {
        let current = self.state_manager.playback().await;
        let Some(target) = transition.apply(current) else {
            debug!("SyncCore: {:?} is a no-op while {:?}", transition, current);
            return Ok(Outcome::NoOp);
        };

        if transition == Transition::Play && self.focus.request() == FocusRequest::Denied {
            return Err(TransitionError::FocusDenied);
        }

        if transition.starts_audio() && !self.engine.is_prepared() {
            if let Err(e) = self.prepare().await {
                if current == PlaybackState::Stopped {
                    self.focus.abandon();
                }
                self.sync_focus().await;
                return Err(TransitionError::Prepare(e));
            }
        }

        let result = match target {
            PlaybackState::Playing => self.engine.start().await,
            PlaybackState::Paused => self.engine.pause().await,
            PlaybackState::Stopped => self.engine.stop().await,
        };
        if let Err(e) = result {
            if current == PlaybackState::Stopped {
                self.focus.abandon();
            }
            self.sync_focus().await;
            return Err(TransitionError::Engine(e));
        }

        match transition {
            Transition::Stop => {
                if self.focus.state() == FocusState::Ducked {
                    self.restore_volume().await;
                }
                self.focus.abandon();
                self.state_manager.set_engine(EngineHealth::Absent).await;
            }
            Transition::Pause => self.focus.forget_resume(),
            _ => {}
        }

        self.state_manager.set_playback(target).await;
        self.state_manager.set_focus(self.focus.state()).await;
        self.publish_playback().await;
        info!("SyncCore: {:?} → {:?}", current, target);

        if target.is_playing() {
            if !self.engine.is_playing().await {
                warn!("SyncCore: engine accepted start but does not report playing");
            }
            self.spawn_track_fetch();
        }

        Ok(Outcome::Applied(target))
    }

    async fn prepare(&mut self) -> Result<(), EngineError> {
        if self.state_manager.set_engine(EngineHealth::Preparing).await {
            let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
        }
        match self.engine.prepare().await {
            Ok(()) => {
                self.state_manager.set_engine(EngineHealth::Ready).await;
                Ok(())
            }
            Err(e) => {
                warn!("SyncCore: preparation failed: {}", e);
                self.state_manager
                    .set_engine(EngineHealth::Failed(e.to_string()))
                    .await;
                let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
                Err(e)
            }
        }
    }

    async fn handle_focus_change(&mut self, change: FocusChange) {
        let playback = self.state_manager.playback().await;
        let effects = self.focus.on_change(change, playback);
        debug!("SyncCore: focus {:?} → {:?}", change, effects);

        for effect in effects {
            match effect {
                FocusEffect::Transition(t) => self.request_or_notify(t).await,
                FocusEffect::Duck => {
                    let duck = self.config.engine.duck_volume;
                    if let Err(e) = self.engine.set_volume(duck).await {
                        warn!("SyncCore: duck failed: {}", e);
                    }
                }
                FocusEffect::RestoreVolume => self.restore_volume().await,
            }
        }

        self.sync_focus().await;
    }

    async fn restore_volume(&mut self) {
        let volume = self.state_manager.get_state().await.volume;
        if let Err(e) = self.engine.set_volume(volume).await {
            warn!("SyncCore: volume restore failed: {}", e);
        }
    }

    async fn handle_engine_signal(&mut self, signal: EngineSignal) {
        let reason = match signal {
            EngineSignal::StreamFailed(reason) => reason,
            EngineSignal::PlayerExited => "player exited".to_string(),
        };
        warn!("SyncCore: engine signal: {}", reason);

        match self.request(Transition::Stop).await {
            Ok(Outcome::Applied(_)) => {
                self.notice(format!("Stream stopped: {}", reason));
            }
            Ok(Outcome::NoOp) => {}
            Err(e) => {
                // Playback has ended whatever the engine reports.
                warn!("SyncCore: stop after engine failure: {}, forcing Stopped", e);
                self.force_stopped().await;
                self.notice(format!("Stream stopped: {}", reason));
            }
        }
        if self
            .state_manager
            .set_engine(EngineHealth::Failed(reason))
            .await
        {
            let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
        }
    }

    /// Publish Stopped without the engine's confirmation.
    async fn force_stopped(&mut self) {
        let current = self.state_manager.playback().await;
        self.focus.abandon();
        self.state_manager.set_playback(PlaybackState::Stopped).await;
        self.state_manager.set_focus(self.focus.state()).await;
        self.publish_playback().await;
        info!("SyncCore: {:?} → Stopped (forced)", current);
    }

    async fn sync_focus(&self) {
        if self.state_manager.set_focus(self.focus.state()).await {
            let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
        }
    }

    async fn publish_playback(&self) {
        let state = self.state_manager.get_state().await;
        let _ = self.broadcast_tx.send(BroadcastMessage::PlaybackChanged {
            is_playing: state.is_playing(),
            rev: state.rev,
        });
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }

    fn notice(&self, message: String) {
        let _ = self.broadcast_tx.send(BroadcastMessage::Notice(message));
    }

    fn spawn_track_fetch(&self) {
        let Some(fetcher) = &self.fetcher else {
            return;
        };
        let tx = self.event_tx.clone();
        fetcher.fetch_label_with(move |label| {
            if tx.try_send(CoreEvent::TrackFetched(label)).is_err() {
                warn!("SyncCore: dropped track fetch result, event channel full or closed");
            }
        });
    }
}
