//! Event-bus protocol shared by the sync controller and presentation layers.
//!
//! Presentation components send [`ControlMessage`]s and receive
//! [`PlayerEvent`]s over a single broadcast bus.

use crate::backends::RemoteError;
use crate::playback_state::{PlaybackState, RepeatMode, TrackDetails};

/// Top-level envelope for all bus traffic.
#[derive(Debug, Clone)]
pub enum Message {
    Player(PlayerEvent),
    Control(ControlMessage),
}

/// Commands a user can issue from buttons, sliders, or media keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserAction {
    Play,
    Pause,
    TogglePlayback,
    SkipNext,
    SkipPrevious,
    /// Absolute position in milliseconds.
    Seek(u64),
    SetShuffle(bool),
    ToggleShuffle,
    SetRepeat(RepeatMode),
    /// off, context, track, then off again.
    CycleRepeat,
    /// Raw slider value; anything outside 0..=100 is rejected.
    SetVolume(i32),
    OpenArtist,
    OpenAlbum,
    /// Reload everything from the remote player.
    Refresh,
}

/// Immediate result of [`crate::sync_controller::SyncController::on_user_action`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    /// The remote player accepted the change.
    Confirmed,
    /// Applied locally; the remote call runs in the background.
    Pending,
    /// Refused before any remote call was made.
    Rejected(String),
    Failed(RemoteError),
}

impl ActionOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Rejected(_) | Self::Failed(_))
    }
}

/// Notifications published by the sync controller.
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    StateChanged(PlaybackState),
    TrackChanged(TrackDetails),
    TrackFinished,
    Progress {
        elapsed_ms: u64,
        total_ms: u64,
        percent: f32,
    },
    ActionFailed {
        action: UserAction,
        reason: String,
    },
}

/// Commands addressed to the controller and its host process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Action(UserAction),
    Quit,
}
