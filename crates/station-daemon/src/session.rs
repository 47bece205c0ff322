//! Media-session publisher: the snapshot media keys and desktop widgets read.

use std::sync::Arc;

use serde::Serialize;
use station_proto::playback::PlaybackState;
use station_proto::protocol::{EngineHealth, StationState};
use station_proto::state::StateManager;
use tokio::sync::{broadcast, RwLock};
use tracing::warn;

use crate::notification::NotificationAction;
use crate::BroadcastMessage;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionPlaybackState {
    #[default]
    None,
    Stopped,
    Buffering,
    Playing,
    Paused,
    Error,
}

#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct SessionMetadata {
    pub title: String,
    pub artist: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Default)]
pub struct MediaSession {
    pub rev: u64,
    pub state: SessionPlaybackState,
    pub actions: Vec<NotificationAction>,
    pub metadata: SessionMetadata,
}

impl MediaSession {
    pub fn from_state(state: &StationState) -> Self {
        let code = match (&state.engine, state.playback) {
            (_, PlaybackState::Playing) => SessionPlaybackState::Playing,
            (_, PlaybackState::Paused) => SessionPlaybackState::Paused,
            (EngineHealth::Preparing, PlaybackState::Stopped) => SessionPlaybackState::Buffering,
            (EngineHealth::Failed(_), PlaybackState::Stopped) => SessionPlaybackState::Error,
            (_, PlaybackState::Stopped) => SessionPlaybackState::Stopped,
        };
        Self {
            rev: state.rev,
            state: code,
            actions: vec![
                NotificationAction::Play,
                NotificationAction::Pause,
                NotificationAction::Stop,
            ],
            metadata: SessionMetadata {
                title: state.station.name.clone(),
                artist: state.track.text().unwrap_or_default().to_string(),
            },
        }
    }
}

pub type SharedSession = Arc<RwLock<MediaSession>>;

pub fn start_publisher(
    session: SharedSession,
    state_manager: Arc<StateManager>,
    mut broadcast_rx: broadcast::Receiver<BroadcastMessage>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        refresh(&session, &state_manager).await;
        loop {
            match broadcast_rx.recv().await {
                Ok(
                    BroadcastMessage::StateUpdated
                    | BroadcastMessage::PlaybackChanged { .. }
                    | BroadcastMessage::TrackUpdated(_),
                ) => refresh(&session, &state_manager).await,
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("session: missed {} broadcast messages", n);
                    refresh(&session, &state_manager).await;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

async fn refresh(session: &SharedSession, state_manager: &StateManager) {
    let next = MediaSession::from_state(&state_manager.get_state().await);
    let mut guard = session.write().await;
    // Snapshots can be read out of order; never go back in rev.
    if next.rev >= guard.rev {
        *guard = next;
    }
}
