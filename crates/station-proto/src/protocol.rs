use serde::{Deserialize, Serialize};

use crate::playback::PlaybackState;
use crate::track::{TrackLabel, TrackStatus};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 2;

/// Notice texts for a refused or failed transport request.  Clients waiting
/// on a request match against these.
pub const FOCUS_DENIED: &str = "Audio focus denied";
pub const LOAD_FAILED: &str = "Failed to load stream";
pub const PLAYBACK_ERROR: &str = "Playback error";

/// Messages sent from client to daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd")]
pub enum Command {
    Play,
    Pause,
    Stop,
    TogglePause,
    /// Re-scrape the station page for the current track.
    RefreshTrack,
    /// An audio-focus change reported by whoever arbitrates the output device.
    AudioFocus { change: FocusChange },
    GetState,
}

/// Messages sent from daemon to clients (broadcasts)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: daemon version + full state snapshot.
    Hello {
        protocol_version: u32,
        daemon_rev: u64,
        state: StationState,
    },
    State {
        data: StationState,
    },
    /// The one-bit signal: is audio playing right now.
    PlaybackChanged {
        is_playing: bool,
        rev: u64,
    },
    Track {
        label: TrackLabel,
    },
    /// Transient user-facing notice (stream failed to load, focus denied).
    Notice {
        message: String,
    },
    Log {
        message: String,
    },
}

/// Audio-focus change, as reported by the output arbiter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum FocusChange {
    Gain,
    /// Another player took the output for good.
    Loss,
    /// Another player took the output briefly (announcement, call).
    LossTransient,
    /// Another player wants the output but we may keep playing quietly.
    LossTransientCanDuck,
}

impl std::str::FromStr for FocusChange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "gain" => Ok(FocusChange::Gain),
            "loss" => Ok(FocusChange::Loss),
            "loss-transient" | "transient" => Ok(FocusChange::LossTransient),
            "loss-transient-can-duck" | "duck" => Ok(FocusChange::LossTransientCanDuck),
            other => Err(format!(
                "unknown focus change '{}' (expected gain, loss, loss-transient or duck)",
                other
            )),
        }
    }
}

/// Whether the daemon currently owns the audio output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum FocusState {
    /// Never requested, or abandoned after Stop.
    #[default]
    None,
    Held,
    Lost,
    LostTransient,
    Ducked,
}

/// Health of the playback engine as observed by the daemon.
///
/// Transitions:
///   Absent -> Preparing -> Ready -> (Stop) Absent
///   Preparing -> Failed(reason) -> Preparing ...
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub enum EngineHealth {
    /// Nothing loaded yet, or unloaded by Stop.
    #[default]
    Absent,
    /// Player spawning / stream loading.
    Preparing,
    /// Stream loaded; start() is meaningful.
    Ready,
    /// Last preparation or stream failed.
    Failed(String),
}

impl EngineHealth {
    /// Short label for badges / status line (≤5 chars).
    pub fn badge_label(&self) -> Option<&str> {
        match self {
            EngineHealth::Absent => None,
            EngineHealth::Preparing => Some("LOAD"),
            EngineHealth::Ready => None,
            EngineHealth::Failed(_) => Some("FAIL"),
        }
    }

    pub fn is_unhealthy(&self) -> bool {
        matches!(self, EngineHealth::Failed(_))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Station {
    pub name: String,
    pub stream_url: String,
    pub page_url: String,
}

/// Full state of the daemon.  `rev` is a monotonically increasing counter
/// incremented every time the state changes.  Clients use it to discard
/// stale snapshots and to detect missed updates.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct StationState {
    #[serde(default)]
    pub rev: u64,
    pub station: Station,
    pub playback: PlaybackState,
    #[serde(default)]
    pub track: TrackStatus,
    #[serde(default)]
    pub engine: EngineHealth,
    #[serde(default)]
    pub focus: FocusState,
    pub volume: f32,
}

impl StationState {
    pub fn is_playing(&self) -> bool {
        self.playback.is_playing()
    }
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        match Self::next_frame(data)? {
            Some(frame) => Ok(frame),
            None => anyhow::bail!("Insufficient data for message"),
        }
    }

    /// Decode the frame at the start of `data`.  `Ok(None)` means the frame
    /// is not complete yet; a malformed body reports how many bytes to skip.
    pub fn next_frame(data: &[u8]) -> Result<Option<(Self, usize)>, FrameError> {
        if data.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(FrameError::TooLarge(len));
        }
        if data.len() < 4 + len {
            return Ok(None);
        }
        match serde_json::from_slice(&data[4..4 + len]) {
            Ok(msg) => Ok(Some((msg, 4 + len))),
            Err(error) => Err(FrameError::Malformed {
                consumed: 4 + len,
                error,
            }),
        }
    }
}

/// Upper bound on a frame body.  A full state snapshot is a few hundred bytes.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The peer is not speaking this protocol; the stream cannot be resynced.
    #[error("frame of {0} bytes exceeds the size limit")]
    TooLarge(usize),

    /// Well-framed but undecodable; skip `consumed` bytes and carry on.
    #[error("malformed frame: {error}")]
    Malformed {
        consumed: usize,
        #[source]
        error: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_focus_command_encode_decode() {
        let msg = Message::Command(Command::AudioFocus {
            change: FocusChange::LossTransient,
        });
        let encoded = msg.encode().unwrap();
        let (decoded, len) = Message::decode(&encoded).unwrap();
        assert_eq!(len, encoded.len());
        match decoded {
            Message::Command(Command::AudioFocus { change }) => {
                assert_eq!(change, FocusChange::LossTransient)
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_next_frame_separates_incomplete_from_malformed() {
        let play = Message::Command(Command::Play).encode().unwrap();
        assert!(Message::next_frame(&play[..2]).unwrap().is_none());
        assert!(Message::next_frame(&play[..play.len() - 1]).unwrap().is_none());

        let body = br#"{"cmd":"Volume"}"#;
        let mut bad = (body.len() as u32).to_be_bytes().to_vec();
        bad.extend_from_slice(body);
        bad.extend_from_slice(&play);
        match Message::next_frame(&bad) {
            Err(FrameError::Malformed { consumed, .. }) => {
                assert_eq!(consumed, 4 + body.len());
                let (msg, _) = Message::next_frame(&bad[consumed..]).unwrap().unwrap();
                assert!(matches!(msg, Message::Command(Command::Play)));
            }
            other => panic!("expected malformed frame, got {:?}", other),
        }

        let huge = u32::MAX.to_be_bytes();
        assert!(matches!(
            Message::next_frame(&huge),
            Err(FrameError::TooLarge(_))
        ));
    }

    #[test]
    fn test_hello_encode_decode() {
        let state = StationState {
            rev: 42,
            playback: PlaybackState::Paused,
            track: TrackLabel::new(Some("Artist - Song".to_string())).into(),
            ..Default::default()
        };
        let msg = Message::Broadcast(Broadcast::Hello {
            protocol_version: PROTOCOL_VERSION,
            daemon_rev: 42,
            state,
        });
        let encoded = msg.encode().unwrap();
        let (decoded, _) = Message::decode(&encoded).unwrap();
        match decoded {
            Message::Broadcast(Broadcast::Hello {
                protocol_version,
                daemon_rev,
                state,
            }) => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(daemon_rev, 42);
                assert_eq!(state.playback, PlaybackState::Paused);
                assert_eq!(state.track.text(), Some("Artist - Song"));
            }
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_unit_command_is_not_mistaken_for_broadcast() {
        let encoded = Message::Command(Command::Stop).encode().unwrap();
        let (decoded, _) = Message::decode(&encoded).unwrap();
        assert!(matches!(decoded, Message::Command(Command::Stop)));
    }

    #[test]
    fn test_decode_partial_frame() {
        let encoded = Message::Command(Command::Play).encode().unwrap();
        assert!(Message::decode(&encoded[..2]).is_err());
        assert!(Message::decode(&encoded[..encoded.len() - 1]).is_err());
    }

    #[test]
    fn test_focus_change_from_str() {
        assert_eq!("gain".parse::<FocusChange>(), Ok(FocusChange::Gain));
        assert_eq!("duck".parse::<FocusChange>(), Ok(FocusChange::LossTransientCanDuck));
        assert!("sideways".parse::<FocusChange>().is_err());
    }

    #[test]
    fn test_focus_change_wire_name() {
        let json = serde_json::to_string(&FocusChange::LossTransientCanDuck).unwrap();
        assert_eq!(json, "\"loss-transient-can-duck\"");
    }
}
