//! Audio-focus bookkeeping.
//!
//! The daemon does not talk to a sound server directly; focus changes are
//! reported to it (socket, HTTP) by whatever arbitrates the output.  This
//! module turns those reports into playback transitions and volume changes.

use station_proto::playback::{PlaybackState, Transition};
use station_proto::protocol::{FocusChange, FocusState};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusRequest {
    Granted,
    Denied,
}

/// What the core must do in response to a focus change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FocusEffect {
    Transition(Transition),
    Duck,
    RestoreVolume,
}

#[derive(Debug, Default)]
pub struct FocusTracker {
    state: FocusState,
    /// Set when a transient loss paused us; cleared by any explicit request.
    resume_on_gain: bool,
}

impl FocusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> FocusState {
        self.state
    }

    /// Ask for the output before starting audio.
    ///
    /// Denied while another player holds it transiently (a call or an
    /// announcement); a permanent loss does not block an explicit Play.
    pub fn request(&mut self) -> FocusRequest {
        if self.state == FocusState::LostTransient {
            return FocusRequest::Denied;
        }
        self.state = FocusState::Held;
        self.resume_on_gain = false;
        FocusRequest::Granted
    }

    /// Give the output back (after Stop).
    pub fn abandon(&mut self) {
        self.state = FocusState::None;
        self.resume_on_gain = false;
    }

    /// A user-initiated pause means a later gain must not resume.
    pub fn forget_resume(&mut self) {
        self.resume_on_gain = false;
    }

    pub fn on_change(&mut self, change: FocusChange, playback: PlaybackState) -> Vec<FocusEffect> {
        if self.state == FocusState::None {
            debug!("focus: ignoring {:?}, focus not requested", change);
            return Vec::new();
        }

        let was_ducked = self.state == FocusState::Ducked;
        let mut effects = Vec::new();

        match change {
            FocusChange::Loss => {
                self.state = FocusState::Lost;
                self.resume_on_gain = false;
                if was_ducked {
                    effects.push(FocusEffect::RestoreVolume);
                }
                if playback.is_playing() {
                    effects.push(FocusEffect::Transition(Transition::ForcePause));
                }
            }
            FocusChange::LossTransient => {
                self.state = FocusState::LostTransient;
                if was_ducked {
                    effects.push(FocusEffect::RestoreVolume);
                }
                if playback.is_playing() {
                    self.resume_on_gain = true;
                    effects.push(FocusEffect::Transition(Transition::ForcePause));
                }
            }
            FocusChange::LossTransientCanDuck => {
                if !was_ducked {
                    self.state = FocusState::Ducked;
                    effects.push(FocusEffect::Duck);
                }
            }
            FocusChange::Gain => {
                self.state = FocusState::Held;
                if was_ducked {
                    effects.push(FocusEffect::RestoreVolume);
                }
                if self.resume_on_gain && playback == PlaybackState::Paused {
                    effects.push(FocusEffect::Transition(Transition::Resume));
                }
                self.resume_on_gain = false;
            }
        }

        effects
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use PlaybackState::*;

    fn held() -> FocusTracker {
        let mut focus = FocusTracker::new();
        assert_eq!(focus.request(), FocusRequest::Granted);
        focus
    }

    #[test]
    fn test_changes_ignored_before_request() {
        let mut focus = FocusTracker::new();
        assert!(focus.on_change(FocusChange::Loss, Playing).is_empty());
        assert_eq!(focus.state(), FocusState::None);
    }

    #[test]
    fn test_loss_forces_pause() {
        let mut focus = held();
        let effects = focus.on_change(FocusChange::Loss, Playing);
        assert_eq!(effects, vec![FocusEffect::Transition(Transition::ForcePause)]);
        assert_eq!(focus.state(), FocusState::Lost);
        // permanent loss never resumes
        assert!(focus.on_change(FocusChange::Gain, Paused).is_empty());
    }

    #[test]
    fn test_transient_loss_resumes_on_gain() {
        let mut focus = held();
        focus.on_change(FocusChange::LossTransient, Playing);
        assert_eq!(focus.state(), FocusState::LostTransient);
        let effects = focus.on_change(FocusChange::Gain, Paused);
        assert_eq!(effects, vec![FocusEffect::Transition(Transition::Resume)]);
        assert_eq!(focus.state(), FocusState::Held);
    }

    #[test]
    fn test_transient_loss_while_paused_does_not_resume() {
        let mut focus = held();
        assert!(focus.on_change(FocusChange::LossTransient, Paused).is_empty());
        assert!(focus.on_change(FocusChange::Gain, Paused).is_empty());
    }

    #[test]
    fn test_request_denied_during_transient_loss() {
        let mut focus = held();
        focus.on_change(FocusChange::LossTransient, Paused);
        assert_eq!(focus.request(), FocusRequest::Denied);
        focus.on_change(FocusChange::Gain, Paused);
        assert_eq!(focus.request(), FocusRequest::Granted);
    }

    #[test]
    fn test_request_after_permanent_loss_is_granted() {
        let mut focus = held();
        focus.on_change(FocusChange::Loss, Playing);
        assert_eq!(focus.request(), FocusRequest::Granted);
        assert_eq!(focus.state(), FocusState::Held);
    }

    #[test]
    fn test_duck_then_gain_restores_volume() {
        let mut focus = held();
        assert_eq!(
            focus.on_change(FocusChange::LossTransientCanDuck, Playing),
            vec![FocusEffect::Duck]
        );
        // repeated duck is idempotent
        assert!(focus
            .on_change(FocusChange::LossTransientCanDuck, Playing)
            .is_empty());
        assert_eq!(
            focus.on_change(FocusChange::Gain, Playing),
            vec![FocusEffect::RestoreVolume]
        );
    }

    #[test]
    fn test_loss_while_ducked_restores_then_pauses() {
        let mut focus = held();
        focus.on_change(FocusChange::LossTransientCanDuck, Playing);
        let effects = focus.on_change(FocusChange::Loss, Playing);
        assert_eq!(
            effects,
            vec![
                FocusEffect::RestoreVolume,
                FocusEffect::Transition(Transition::ForcePause)
            ]
        );
    }

    #[test]
    fn test_abandon_resets() {
        let mut focus = held();
        focus.on_change(FocusChange::LossTransient, Playing);
        focus.abandon();
        assert_eq!(focus.state(), FocusState::None);
        assert_eq!(focus.request(), FocusRequest::Granted);
    }
}
