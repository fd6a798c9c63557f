//! Playback state model owned by the sync controller.
//!
//! Every field the remote player may omit is carried as a [`FieldState`] so
//! that "no active device" never collapses into `false` or `off`.

use std::fmt;
use std::str::FromStr;

use crate::backends::RemoteError;

/// Title reported when the remote player has no track to describe.
pub const UNAVAILABLE_TITLE: &str = "Unknown";

/// Tri-state wrapper for remote-reported fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldState<T> {
    /// The remote player reported this value.
    Known(T),
    /// The value has not been observed yet, or the payload omitted it.
    Unknown,
    /// No playback session exists, so the field has no meaning.
    NotApplicable,
}

impl<T> Default for FieldState<T> {
    fn default() -> Self {
        Self::Unknown
    }
}

impl<T> FieldState<T> {
    pub fn known(&self) -> Option<&T> {
        match self {
            Self::Known(value) => Some(value),
            Self::Unknown | Self::NotApplicable => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Self::Known(_))
    }

    pub fn map<U, F>(self, f: F) -> FieldState<U>
    where
        F: FnOnce(T) -> U,
    {
        match self {
            Self::Known(value) => FieldState::Known(f(value)),
            Self::Unknown => FieldState::Unknown,
            Self::NotApplicable => FieldState::NotApplicable,
        }
    }

    pub fn from_option(value: Option<T>) -> Self {
        value.map_or(Self::Unknown, Self::Known)
    }
}

impl<T: Copy> FieldState<T> {
    pub fn known_copied(&self) -> Option<T> {
        self.known().copied()
    }
}

/// Remote repeat behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
    Off,
    Context,
    Track,
}

impl RepeatMode {
    pub fn as_api_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Context => "context",
            Self::Track => "track",
        }
    }

    /// Button cycle order: off, context, track, then back to off.
    pub fn next(self) -> Self {
        match self {
            Self::Off => Self::Context,
            Self::Context => Self::Track,
            Self::Track => Self::Off,
        }
    }
}

impl FromStr for RepeatMode {
    type Err = RemoteError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "off" => Ok(Self::Off),
            "context" => Ok(Self::Context),
            "track" => Ok(Self::Track),
            other => Err(RemoteError::InvalidInput(format!(
                "unrecognized repeat mode '{other}'"
            ))),
        }
    }
}

impl fmt::Display for RepeatMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_api_str())
    }
}

/// Minutes/seconds view of a millisecond value. Field order makes the derived
/// ordering lexicographic on (minutes, seconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct TimeMark {
    pub minutes: u64,
    pub seconds: u64,
}

impl TimeMark {
    pub fn from_ms(ms: u64) -> Self {
        let total_seconds = ms / 1000;
        Self {
            minutes: total_seconds / 60,
            seconds: total_seconds % 60,
        }
    }
}

impl fmt::Display for TimeMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:02}", self.minutes, self.seconds)
    }
}

/// Elapsed and total time of the current track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrackPosition {
    pub elapsed_ms: u64,
    pub total_ms: u64,
}

impl TrackPosition {
    /// Builds a position, clamping elapsed to total when the total is known.
    pub fn new(elapsed_ms: u64, total_ms: u64) -> Self {
        let elapsed_ms = if total_ms > 0 {
            elapsed_ms.min(total_ms)
        } else {
            elapsed_ms
        };
        Self {
            elapsed_ms,
            total_ms,
        }
    }

    pub fn elapsed_mark(&self) -> TimeMark {
        TimeMark::from_ms(self.elapsed_ms)
    }

    pub fn total_mark(&self) -> TimeMark {
        TimeMark::from_ms(self.total_ms)
    }

    /// Progress in percent; an unknown (zero) total reads as 0%.
    pub fn progress_percent(&self) -> f32 {
        if self.total_ms == 0 {
            return 0.0;
        }
        ((self.elapsed_ms as f64 / self.total_ms as f64) * 100.0).clamp(0.0, 100.0) as f32
    }

    pub fn remaining_ms(&self) -> u64 {
        self.total_ms.saturating_sub(self.elapsed_ms)
    }
}

/// Identity and display metadata of one remote track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackDetails {
    pub track_id: Option<String>,
    pub title: String,
    pub artist: String,
    pub album: String,
    pub cover_url: Option<String>,
    pub duration_ms: u64,
    pub artist_url: Option<String>,
    pub album_url: Option<String>,
}

impl TrackDetails {
    pub fn unavailable() -> Self {
        Self {
            track_id: None,
            title: UNAVAILABLE_TITLE.to_string(),
            artist: UNAVAILABLE_TITLE.to_string(),
            album: UNAVAILABLE_TITLE.to_string(),
            cover_url: None,
            duration_ms: 0,
            artist_url: None,
            album_url: None,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        self.track_id.is_none() && self.title == UNAVAILABLE_TITLE
    }

    /// Cheap identity check used by the track-change poll.
    pub fn title_prefix(title: &str, chars: usize) -> String {
        title.chars().take(chars).collect()
    }
}

impl Default for TrackDetails {
    fn default() -> Self {
        Self::unavailable()
    }
}

/// Locally mirrored remote playback state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlaybackState {
    pub is_playing: FieldState<bool>,
    pub shuffle: FieldState<bool>,
    pub repeat_mode: FieldState<RepeatMode>,
    pub volume_percent: FieldState<u8>,
    pub track: TrackDetails,
}

impl PlaybackState {
    pub fn is_playing_known_true(&self) -> bool {
        matches!(self.is_playing, FieldState::Known(true))
    }
}
