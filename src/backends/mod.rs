//! Remote player abstractions and concrete implementations.

use std::time::Duration;

use crate::playback_state::{FieldState, RepeatMode, TrackDetails};

pub mod spotify;

/// Failure taxonomy for remote player calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("remote rejected the access token")]
    Unauthorized,
    #[error("no active playback device")]
    NoActiveDevice,
    #[error("remote rate limit reached")]
    RateLimited { retry_after: Option<Duration> },
    #[error("network failure: {0}")]
    Network(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl RemoteError {
    /// Failures that the next poll cycle is expected to clear on its own.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_) | Self::RateLimited { .. })
    }
}

/// Playback device reported by the remote player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDevice {
    pub id: String,
    pub name: String,
    pub is_active: bool,
    pub volume_percent: Option<u8>,
}

/// Snapshot of an existing remote playback session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlaybackSnapshot {
    pub is_playing: FieldState<bool>,
    pub shuffle: FieldState<bool>,
    pub repeat_mode: FieldState<RepeatMode>,
    pub progress_ms: FieldState<u64>,
    pub device: Option<RemoteDevice>,
    pub track: Option<TrackDetails>,
}

impl PlaybackSnapshot {
    pub fn volume_percent(&self) -> FieldState<u8> {
        match &self.device {
            Some(device) => FieldState::from_option(device.volume_percent),
            None => FieldState::Unknown,
        }
    }
}

/// Result of a read that may legitimately find no session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemotePlayback {
    /// Empty body: nothing is playing anywhere on the account.
    NoSession,
    Active(PlaybackSnapshot),
}

impl RemotePlayback {
    pub fn snapshot(&self) -> Option<&PlaybackSnapshot> {
        match self {
            Self::NoSession => None,
            Self::Active(snapshot) => Some(snapshot),
        }
    }
}

/// Entry of the recently-played history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecentlyPlayedTrack {
    pub track: TrackDetails,
    pub played_at: String,
}

/// HTTP-level player operations. Every call carries the bearer token.
///
/// `device_id` targets a specific device when the caller already knows one;
/// `None` lets the remote player pick the active device.
pub trait PlayerApi: Send + Sync {
    fn playback_state(&self, token: &str) -> Result<RemotePlayback, RemoteError>;
    fn currently_playing(&self, token: &str) -> Result<RemotePlayback, RemoteError>;
    fn devices(&self, token: &str) -> Result<Vec<RemoteDevice>, RemoteError>;
    fn queue(&self, token: &str) -> Result<Vec<TrackDetails>, RemoteError>;
    fn recently_played(
        &self,
        token: &str,
        limit: u8,
    ) -> Result<Vec<RecentlyPlayedTrack>, RemoteError>;
    fn play(&self, token: &str, device_id: Option<&str>) -> Result<(), RemoteError>;
    fn pause(&self, token: &str, device_id: Option<&str>) -> Result<(), RemoteError>;
    fn skip_next(&self, token: &str, device_id: Option<&str>) -> Result<(), RemoteError>;
    fn skip_previous(&self, token: &str, device_id: Option<&str>) -> Result<(), RemoteError>;
    fn seek(
        &self,
        token: &str,
        position_ms: u64,
        device_id: Option<&str>,
    ) -> Result<(), RemoteError>;
    fn set_volume(
        &self,
        token: &str,
        volume_percent: u8,
        device_id: Option<&str>,
    ) -> Result<(), RemoteError>;
    fn set_shuffle(
        &self,
        token: &str,
        enabled: bool,
        device_id: Option<&str>,
    ) -> Result<(), RemoteError>;
    fn set_repeat(
        &self,
        token: &str,
        mode: RepeatMode,
        device_id: Option<&str>,
    ) -> Result<(), RemoteError>;
    fn transfer_playback(&self, token: &str, device_id: &str, play: bool)
        -> Result<(), RemoteError>;
}
