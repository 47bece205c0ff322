//! Media-style notification.
//!
//! The model is a pure function of `StationState`.  A renderer task watches
//! the broadcast channel, re-renders from the current snapshot and hands the
//! result to a `NotificationSink` only when it differs from the last one.

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use station_proto::playback::PlaybackState;
use station_proto::protocol::{Command, StationState};
use station_proto::state::StateManager;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::BroadcastMessage;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum NotificationAction {
    Play,
    Pause,
    Stop,
}

impl NotificationAction {
    /// The client command a press of this action sends.
    pub fn command(self) -> Command {
        match self {
            NotificationAction::Play => Command::Play,
            NotificationAction::Pause => Command::Pause,
            NotificationAction::Stop => Command::Stop,
        }
    }
}

impl std::str::FromStr for NotificationAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "play" => Ok(NotificationAction::Play),
            "pause" => Ok(NotificationAction::Pause),
            "stop" => Ok(NotificationAction::Stop),
            other => Err(format!("unknown notification action '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NotificationModel {
    pub title: String,
    pub text: String,
    /// Primary (Play or Pause) first, then Stop.
    pub actions: [NotificationAction; 2],
    /// Cannot be swiped away while audio is playing.
    pub ongoing: bool,
    /// Hidden once playback is stopped.
    pub visible: bool,
}

impl NotificationModel {
    pub fn render(state: &StationState) -> Self {
        let primary = if state.is_playing() {
            NotificationAction::Pause
        } else {
            NotificationAction::Play
        };
        Self {
            title: state.station.name.clone(),
            text: state.track.display().to_string(),
            actions: [primary, NotificationAction::Stop],
            ongoing: state.is_playing(),
            visible: state.playback != PlaybackState::Stopped,
        }
    }

    pub fn primary(&self) -> NotificationAction {
        self.actions[0]
    }
}

pub trait NotificationSink: Send {
    fn publish(&mut self, model: &NotificationModel) -> anyhow::Result<()>;
}

/// Emits every rendered notification as a structured log event.
pub struct LogSink;

impl NotificationSink for LogSink {
    fn publish(&mut self, model: &NotificationModel) -> anyhow::Result<()> {
        info!(
            title = %model.title,
            text = %model.text,
            primary = ?model.primary(),
            ongoing = model.ongoing,
            visible = model.visible,
            "notification"
        );
        Ok(())
    }
}

/// Writes the current notification as JSON, for desktop widgets to poll.
/// The file is removed when the notification is hidden.
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn in_data_dir() -> Self {
        Self::new(station_proto::platform::data_dir().join("notification.json"))
    }
}

impl NotificationSink for FileSink {
    fn publish(&mut self, model: &NotificationModel) -> anyhow::Result<()> {
        if !model.visible {
            if self.path.exists() {
                std::fs::remove_file(&self.path)?;
            }
            return Ok(());
        }
        let json = serde_json::to_vec_pretty(model)?;
        std::fs::write(&self.path, json)?;
        Ok(())
    }
}

/// Renders into every sink, skipping unchanged models.
pub struct NotificationRenderer {
    sinks: Vec<Box<dyn NotificationSink>>,
    last: Option<NotificationModel>,
}

impl NotificationRenderer {
    pub fn new(sinks: Vec<Box<dyn NotificationSink>>) -> Self {
        Self { sinks, last: None }
    }

    /// Returns true when the model changed and was pushed to the sinks.
    pub fn render(&mut self, state: &StationState) -> bool {
        let model = NotificationModel::render(state);
        if self.last.as_ref() == Some(&model) {
            return false;
        }
        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.publish(&model) {
                warn!("notification: sink failed: {}", e);
            }
        }
        self.last = Some(model);
        true
    }
}

pub fn start_renderer(
    mut renderer: NotificationRenderer,
    state_manager: Arc<StateManager>,
    mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        renderer.render(&state_manager.get_state().await);
        loop {
            match broadcast_rx.recv().await {
                Ok(
                    BroadcastMessage::StateUpdated
                    | BroadcastMessage::PlaybackChanged { .. }
                    | BroadcastMessage::TrackUpdated(_),
                ) => {
                    if renderer.render(&state_manager.get_state().await) {
                        debug!("notification: re-rendered");
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("notification: missed {} broadcast messages", n);
                    renderer.render(&state_manager.get_state().await);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
