//! Client-side mirror of the daemon's state.
//!
//! A replica is an eventually-consistent cache, never a source of truth.
//! Snapshots carry the daemon's `rev`; anything older than what the replica
//! already holds is dropped, so a late `State` cannot undo a newer
//! `PlaybackChanged`.

use crate::playback::PlaybackState;
use crate::protocol::{Broadcast, StationState, PROTOCOL_VERSION};
use crate::track::{TrackLabel, TrackStatus, FETCHING_TRACK};

/// What a broadcast did to the replica.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicaUpdate {
    /// Displayed values changed; re-render.
    Changed,
    /// Nothing visible changed (duplicate or stale snapshot).
    Unchanged,
    /// A transient message to show once.
    Notice(String),
    /// A daemon log line.
    Log(String),
}

#[derive(Debug, Clone, Default)]
pub struct StateReplica {
    state: Option<StationState>,
    protocol_mismatch: Option<u32>,
}

impl StateReplica {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> Option<&StationState> {
        self.state.as_ref()
    }

    pub fn rev(&self) -> u64 {
        self.state.as_ref().map(|s| s.rev).unwrap_or(0)
    }

    pub fn playback(&self) -> PlaybackState {
        self.state.as_ref().map(|s| s.playback).unwrap_or_default()
    }

    pub fn is_playing(&self) -> bool {
        self.playback().is_playing()
    }

    /// Daemon protocol version, if it differs from ours.
    pub fn protocol_mismatch(&self) -> Option<u32> {
        self.protocol_mismatch
    }

    /// Label text; "Fetching track..." until the first snapshot arrives and
    /// while the daemon has not finished its first fetch.
    pub fn track_display(&self) -> &str {
        match &self.state {
            Some(s) => s.track.display(),
            None => FETCHING_TRACK,
        }
    }

    pub fn apply(&mut self, broadcast: Broadcast) -> ReplicaUpdate {
        match broadcast {
            Broadcast::Hello {
                protocol_version,
                state,
                ..
            } => {
                self.protocol_mismatch =
                    (protocol_version != PROTOCOL_VERSION).then_some(protocol_version);
                // Hello is an authoritative resync, even if rev went backwards
                // (daemon restarted).
                let changed = self.state.as_ref() != Some(&state);
                self.state = Some(state);
                if changed {
                    ReplicaUpdate::Changed
                } else {
                    ReplicaUpdate::Unchanged
                }
            }
            Broadcast::State { data } => self.apply_snapshot(data),
            Broadcast::PlaybackChanged { is_playing, rev } => {
                let Some(state) = self.state.as_mut() else {
                    return ReplicaUpdate::Unchanged;
                };
                if rev < state.rev {
                    return ReplicaUpdate::Unchanged;
                }
                let playback = match (is_playing, state.playback) {
                    (true, _) => PlaybackState::Playing,
                    (false, PlaybackState::Playing) => PlaybackState::Paused,
                    (false, other) => other,
                };
                state.rev = rev;
                if playback == state.playback {
                    ReplicaUpdate::Unchanged
                } else {
                    state.playback = playback;
                    ReplicaUpdate::Changed
                }
            }
            Broadcast::Track { label } => self.apply_track(label),
            Broadcast::Notice { message } => ReplicaUpdate::Notice(message),
            Broadcast::Log { message } => ReplicaUpdate::Log(message),
        }
    }

    fn apply_snapshot(&mut self, data: StationState) -> ReplicaUpdate {
        if let Some(current) = &self.state {
            if data.rev < current.rev {
                return ReplicaUpdate::Unchanged;
            }
            if *current == data {
                return ReplicaUpdate::Unchanged;
            }
        }
        self.state = Some(data);
        ReplicaUpdate::Changed
    }

    fn apply_track(&mut self, label: TrackLabel) -> ReplicaUpdate {
        let track = TrackStatus::Fetched(label);
        match self.state.as_mut() {
            Some(state) if state.track != track => {
                state.track = track;
                ReplicaUpdate::Changed
            }
            _ => ReplicaUpdate::Unchanged,
        }
    }
}
