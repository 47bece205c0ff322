use crate::playback::PlaybackState;
use crate::protocol::{EngineHealth, FocusState, Station, StationState};
use crate::track::{TrackLabel, TrackStatus};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Owner of the daemon's `StationState`.
///
/// Only the daemon core writes through these setters; everything else reads
/// snapshots.  Each setter bumps `rev` only when the value actually changes
/// and reports whether it did, so the caller can skip redundant broadcasts.
/// Nothing here is persisted: a fresh daemon always starts `Stopped`.
pub struct StateManager {
    state: Arc<RwLock<StationState>>,
}

impl StateManager {
    pub fn new(station: Station, volume: f32) -> Self {
        let state = StationState {
            rev: 1,
            station,
            playback: PlaybackState::Stopped,
            track: TrackStatus::Pending,
            engine: EngineHealth::Absent,
            focus: FocusState::None,
            volume: volume.clamp(0.0, 1.0),
        };

        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    pub async fn get_state(&self) -> StationState {
        self.state.read().await.clone()
    }

    pub async fn playback(&self) -> PlaybackState {
        self.state.read().await.playback
    }

    pub async fn set_playback(&self, playback: PlaybackState) -> bool {
        let mut state = self.state.write().await;
        if state.playback == playback {
            return false;
        }
        state.playback = playback;
        state.rev += 1;
        true
    }

    /// Record a finished fetch.  The first call always counts as a change,
    /// even for an absent label, since it ends the `Pending` phase.
    pub async fn set_track(&self, label: TrackLabel) -> bool {
        let track = TrackStatus::Fetched(label);
        let mut state = self.state.write().await;
        if state.track == track {
            return false;
        }
        state.track = track;
        state.rev += 1;
        true
    }

    pub async fn set_engine(&self, engine: EngineHealth) -> bool {
        let mut state = self.state.write().await;
        if state.engine == engine {
            return false;
        }
        state.engine = engine;
        state.rev += 1;
        true
    }

    pub async fn set_focus(&self, focus: FocusState) -> bool {
        let mut state = self.state.write().await;
        if state.focus == focus {
            return false;
        }
        state.focus = focus;
        state.rev += 1;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> StateManager {
        StateManager::new(
            Station {
                name: "Test FM".to_string(),
                ..Default::default()
            },
            1.0,
        )
    }

    #[tokio::test]
    async fn test_starts_stopped_with_pending_track() {
        let state = manager().get_state().await;
        assert_eq!(state.playback, PlaybackState::Stopped);
        assert!(state.track.is_pending());
        assert_eq!(state.track.display(), "Fetching track...");
        assert_eq!(state.engine, EngineHealth::Absent);
        assert_eq!(state.rev, 1);
    }

    #[tokio::test]
    async fn test_rev_bumps_only_on_change() {
        let sm = manager();
        assert!(sm.set_playback(PlaybackState::Playing).await);
        assert!(!sm.set_playback(PlaybackState::Playing).await);
        assert_eq!(sm.get_state().await.rev, 2);

        assert!(sm.set_track(TrackLabel::new(Some("A - B".into()))).await);
        assert!(!sm.set_track(TrackLabel::new(Some("A - B".into()))).await);
        assert!(sm.set_track(TrackLabel::absent()).await);
        assert_eq!(sm.get_state().await.rev, 4);
    }

    #[tokio::test]
    async fn test_first_failed_fetch_ends_pending() {
        let sm = manager();
        assert!(sm.set_track(TrackLabel::absent()).await);
        let state = sm.get_state().await;
        assert!(!state.track.is_pending());
        assert_eq!(state.track.display(), "Track not found");
        assert!(!sm.set_track(TrackLabel::absent()).await);
    }

    #[tokio::test]
    async fn test_initial_volume_is_clamped() {
        let sm = StateManager::new(Station::default(), 3.0);
        assert_eq!(sm.get_state().await.volume, 1.0);
    }
}
