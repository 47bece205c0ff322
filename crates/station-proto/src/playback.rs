//! Playback state machine.
//!
//! ```text
//!            Play                 Pause / ForcePause
//!   Stopped ──────▶ Playing ◀────────────────────────▶ Paused
//!      ▲              │         Play / Resume            │
//!      └──── Stop ────┴──────────────── Stop ────────────┘
//! ```
//!
//! `apply` is the single source of truth for which requests change state.
//! A request that is not valid from the current state is a no-op and
//! returns `None`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum PlaybackState {
    #[default]
    Stopped,
    Playing,
    Paused,
}

impl PlaybackState {
    pub fn is_playing(self) -> bool {
        self == PlaybackState::Playing
    }

    /// Short label for status lines.
    pub fn label(self) -> &'static str {
        match self {
            PlaybackState::Stopped => "stopped",
            PlaybackState::Playing => "playing",
            PlaybackState::Paused => "paused",
        }
    }

    /// Glyph for the play/pause control: the action a press would take.
    pub fn button_glyph(self) -> char {
        if self.is_playing() {
            '⏸'
        } else {
            '▶'
        }
    }
}

/// A request to move the state machine.
///
/// `ForcePause` and `Resume` are never sent by clients; they are raised by
/// the daemon itself in response to audio-focus changes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Transition {
    Play,
    Pause,
    Stop,
    ForcePause,
    Resume,
}

impl Transition {
    /// Target state for this request from `current`, or `None` if the
    /// request is a no-op there.
    pub fn apply(self, current: PlaybackState) -> Option<PlaybackState> {
        use PlaybackState::*;
        match (self, current) {
            (Transition::Play, Stopped | Paused) => Some(Playing),
            (Transition::Pause | Transition::ForcePause, Playing) => Some(Paused),
            (Transition::Stop, Playing | Paused) => Some(Stopped),
            (Transition::Resume, Paused) => Some(Playing),
            _ => None,
        }
    }

    /// Resolve a play/pause toggle against the current state.
    pub fn toggle(current: PlaybackState) -> Self {
        if current.is_playing() {
            Transition::Pause
        } else {
            Transition::Play
        }
    }

    /// True for requests that need the engine to be producing audio.
    pub fn starts_audio(self) -> bool {
        matches!(self, Transition::Play | Transition::Resume)
    }
}

/// Run a sequence of requests from `Stopped`, returning the state after each.
pub fn replay(requests: &[Transition]) -> Vec<PlaybackState> {
    let mut state = PlaybackState::Stopped;
    requests
        .iter()
        .map(|t| {
            if let Some(next) = t.apply(state) {
                state = next;
            }
            state
        })
        .collect()
}
