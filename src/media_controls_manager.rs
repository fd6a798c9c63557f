//! OS media controls bridge (MPRIS/SMTC/Now Playing).
//!
//! Media keys and the desktop "now playing" widget are turned into
//! [`ControlMessage`]s through `souvlaki`. Player events flow back out as a
//! [`NowPlaying`] view that is only pushed to the OS when it differs from the
//! last one the platform accepted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use souvlaki::{
    MediaControlEvent, MediaControls, MediaMetadata, MediaPlayback, PlatformConfig, SeekDirection,
};
use tokio::sync::broadcast::{error::RecvError, Receiver, Sender};

use crate::playback_state::{PlaybackState, TrackDetails};
use crate::protocol::{ControlMessage, Message, PlayerEvent, UserAction};

const MEDIA_CONTROLS_DISPLAY_NAME: &str = "Tunebar";
const MEDIA_CONTROLS_DBUS_NAME: &str = "tunebar";
const SEEK_STEP_MS: u64 = 10_000;

/// Last progress sample, read from the souvlaki callback thread.
#[derive(Debug, Default)]
struct SeekRange {
    elapsed_ms: AtomicU64,
    total_ms: AtomicU64,
}

impl SeekRange {
    fn store(&self, elapsed_ms: u64, total_ms: u64) {
        self.elapsed_ms.store(elapsed_ms, Ordering::Relaxed);
        self.total_ms.store(total_ms, Ordering::Relaxed);
    }

    /// Absolute seek target for an OS request, or `None` without a known length.
    fn target(&self, request: SeekRequest) -> Option<u64> {
        let total_ms = self.total_ms.load(Ordering::Relaxed);
        if total_ms == 0 {
            return None;
        }
        let elapsed_ms = self.elapsed_ms.load(Ordering::Relaxed);
        let target_ms = match request {
            SeekRequest::To(position_ms) => position_ms,
            SeekRequest::Forward(delta_ms) => elapsed_ms.saturating_add(delta_ms),
            SeekRequest::Backward(delta_ms) => elapsed_ms.saturating_sub(delta_ms),
        };
        Some(target_ms.min(total_ms))
    }
}

#[derive(Debug, Clone, Copy)]
enum SeekRequest {
    To(u64),
    Forward(u64),
    Backward(u64),
}

impl SeekRequest {
    fn relative(direction: SeekDirection, delta: Duration) -> Self {
        let delta_ms = delta.as_millis() as u64;
        match direction {
            SeekDirection::Forward => Self::Forward(delta_ms),
            SeekDirection::Backward => Self::Backward(delta_ms),
        }
    }
}

/// What the OS widget should currently show.
#[derive(Debug, Clone, Default, PartialEq)]
struct NowPlaying {
    track: Option<TrackDetails>,
    playing: bool,
}

impl NowPlaying {
    fn from_state(state: &PlaybackState) -> Self {
        Self {
            track: (!state.track.is_unavailable()).then(|| state.track.clone()),
            playing: state.is_playing_known_true(),
        }
    }

    fn status(&self) -> MediaPlayback {
        match (&self.track, self.playing) {
            (None, _) => MediaPlayback::Stopped,
            (Some(_), true) => MediaPlayback::Playing { progress: None },
            (Some(_), false) => MediaPlayback::Paused { progress: None },
        }
    }

    /// Has-track and playing flags, the only inputs to [`NowPlaying::status`].
    fn status_key(&self) -> (bool, bool) {
        (self.track.is_some(), self.track.is_some() && self.playing)
    }
}

/// Last status and metadata the platform accepted.
#[derive(Debug, Default)]
struct Published {
    status: Option<(bool, bool)>,
    track: Option<Option<TrackDetails>>,
}

/// Which halves of a [`NowPlaying`] view still have to reach the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingPublish {
    status: bool,
    metadata: bool,
}

fn pending_publish(published: &Published, wanted: &NowPlaying) -> PendingPublish {
    PendingPublish {
        status: published.status != Some(wanted.status_key()),
        metadata: published.track.as_ref() != Some(&wanted.track),
    }
}

fn map_control_event(event: MediaControlEvent, range: &SeekRange) -> Option<ControlMessage> {
    let action = match event {
        MediaControlEvent::Play => UserAction::Play,
        MediaControlEvent::Pause | MediaControlEvent::Stop => UserAction::Pause,
        MediaControlEvent::Toggle => UserAction::TogglePlayback,
        MediaControlEvent::Next => UserAction::SkipNext,
        MediaControlEvent::Previous => UserAction::SkipPrevious,
        MediaControlEvent::SetPosition(position) => {
            UserAction::Seek(range.target(SeekRequest::To(position.0.as_millis() as u64))?)
        }
        MediaControlEvent::SeekBy(direction, delta) => {
            UserAction::Seek(range.target(SeekRequest::relative(direction, delta))?)
        }
        MediaControlEvent::Seek(direction) => UserAction::Seek(range.target(
            SeekRequest::relative(direction, Duration::from_millis(SEEK_STEP_MS)),
        )?),
        MediaControlEvent::SetVolume(level) => {
            UserAction::SetVolume((level.clamp(0.0, 1.0) * 100.0).round() as i32)
        }
        MediaControlEvent::Quit => return Some(ControlMessage::Quit),
        MediaControlEvent::OpenUri(_) | MediaControlEvent::Raise => return None,
    };
    Some(ControlMessage::Action(action))
}

#[cfg(not(target_os = "windows"))]
fn attach_controls(bus_producer: Sender<Message>, range: Arc<SeekRange>) -> Option<MediaControls> {
    let config = PlatformConfig {
        display_name: MEDIA_CONTROLS_DISPLAY_NAME,
        dbus_name: MEDIA_CONTROLS_DBUS_NAME,
        hwnd: None,
    };
    let mut controls = MediaControls::new(config)
        .map_err(|err| warn!("MediaControlsManager: no media controls backend: {:?}", err))
        .ok()?;
    controls
        .attach(move |event| {
            if let Some(message) = map_control_event(event, &range) {
                let _ = bus_producer.send(Message::Control(message));
            }
        })
        .map_err(|err| warn!("MediaControlsManager: could not attach handler: {:?}", err))
        .ok()?;
    Some(controls)
}

#[cfg(target_os = "windows")]
fn attach_controls(_bus_producer: Sender<Message>, _range: Arc<SeekRange>) -> Option<MediaControls> {
    // Souvlaki needs an HWND on Windows and the headless runtime has none.
    warn!("MediaControlsManager: Windows media controls need a window handle; disabled");
    None
}

/// Bridges the bus and the platform media controls.
pub struct MediaControlsManager {
    bus_consumer: Receiver<Message>,
    range: Arc<SeekRange>,
    controls: Option<MediaControls>,
    wanted: NowPlaying,
    published: Published,
}

impl MediaControlsManager {
    pub fn new(bus_consumer: Receiver<Message>, bus_producer: Sender<Message>) -> Self {
        let range = Arc::new(SeekRange::default());
        let controls = attach_controls(bus_producer, Arc::clone(&range));
        Self {
            bus_consumer,
            range,
            controls,
            wanted: NowPlaying::default(),
            published: Published::default(),
        }
    }

    /// Pushes whatever part of `wanted` the OS has not accepted yet.
    fn sync_platform(&mut self) {
        let pending = pending_publish(&self.published, &self.wanted);
        let Some(controls) = self.controls.as_mut() else {
            return;
        };

        if pending.status {
            let status = self.wanted.status();
            debug!("MediaControlsManager: publishing {:?}", status);
            match controls.set_playback(status) {
                Ok(()) => self.published.status = Some(self.wanted.status_key()),
                Err(err) => warn!("MediaControlsManager: status rejected: {:?}", err),
            }
        }

        if pending.metadata {
            let result = match self.wanted.track.as_ref() {
                Some(track) => controls.set_metadata(MediaMetadata {
                    title: Some(&track.title),
                    artist: Some(&track.artist),
                    album: Some(&track.album),
                    cover_url: track.cover_url.as_deref(),
                    duration: (track.duration_ms > 0)
                        .then(|| Duration::from_millis(track.duration_ms)),
                }),
                None => controls.set_metadata(MediaMetadata::default()),
            };
            match result {
                Ok(()) => self.published.track = Some(self.wanted.track.clone()),
                Err(err) => warn!("MediaControlsManager: metadata rejected: {:?}", err),
            }
        }
    }

    /// Returns `false` once the manager should stop.
    fn handle_message(&mut self, message: Message) -> bool {
        match message {
            Message::Player(PlayerEvent::StateChanged(state)) => {
                self.wanted = NowPlaying::from_state(&state);
                if self.wanted.track.is_none() {
                    self.range.store(0, 0);
                }
            }
            Message::Player(PlayerEvent::TrackChanged(track)) => {
                self.wanted.track = (!track.is_unavailable()).then_some(track);
            }
            Message::Player(PlayerEvent::Progress {
                elapsed_ms,
                total_ms,
                ..
            }) => {
                self.range.store(elapsed_ms, total_ms);
                return true;
            }
            Message::Control(ControlMessage::Quit) => return false,
            _ => return true,
        }
        self.sync_platform();
        true
    }

    pub fn run(&mut self) {
        info!("MediaControlsManager: started");
        loop {
            match self.bus_consumer.blocking_recv() {
                Ok(message) => {
                    if !self.handle_message(message) {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("MediaControlsManager: bus lagged by {} messages", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
        info!("MediaControlsManager: stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::{map_control_event, pending_publish, NowPlaying, PendingPublish, Published, SeekRange};
    use crate::playback_state::{FieldState, PlaybackState, TrackDetails};
    use crate::protocol::{ControlMessage, UserAction};
    use souvlaki::{MediaControlEvent, MediaPosition, SeekDirection};
    use std::time::Duration;

    fn range(elapsed_ms: u64, total_ms: u64) -> SeekRange {
        let range = SeekRange::default();
        range.store(elapsed_ms, total_ms);
        range
    }

    fn action(message: Option<ControlMessage>) -> Option<UserAction> {
        match message {
            Some(ControlMessage::Action(action)) => Some(action),
            _ => None,
        }
    }

    fn playing(title: &str, is_playing: bool) -> NowPlaying {
        NowPlaying::from_state(&PlaybackState {
            is_playing: FieldState::Known(is_playing),
            track: TrackDetails {
                title: title.to_string(),
                duration_ms: 180_000,
                ..TrackDetails::unavailable()
            },
            ..PlaybackState::default()
        })
    }

    #[test]
    fn test_toggle_event_is_left_to_the_controller() {
        let message = map_control_event(MediaControlEvent::Toggle, &range(0, 0));
        assert_eq!(action(message), Some(UserAction::TogglePlayback));
    }

    #[test]
    fn test_set_position_event_maps_to_clamped_seek() {
        let message = map_control_event(
            MediaControlEvent::SetPosition(MediaPosition(Duration::from_millis(250_000))),
            &range(0, 200_000),
        );
        assert_eq!(action(message), Some(UserAction::Seek(200_000)));
    }

    #[test]
    fn test_seek_by_backward_saturates_at_zero() {
        let message = map_control_event(
            MediaControlEvent::SeekBy(SeekDirection::Backward, Duration::from_millis(20_000)),
            &range(5_000, 200_000),
        );
        assert_eq!(action(message), Some(UserAction::Seek(0)));
    }

    #[test]
    fn test_step_seek_uses_latest_progress_sample() {
        let samples = range(5_000, 200_000);
        samples.store(40_000, 200_000);
        let message = map_control_event(MediaControlEvent::Seek(SeekDirection::Forward), &samples);
        assert_eq!(action(message), Some(UserAction::Seek(50_000)));
    }

    #[test]
    fn test_seek_without_duration_is_ignored() {
        let message = map_control_event(
            MediaControlEvent::Seek(SeekDirection::Forward),
            &range(10_000, 0),
        );
        assert!(message.is_none());
    }

    #[test]
    fn test_volume_and_quit_events_are_forwarded() {
        let volume = map_control_event(MediaControlEvent::SetVolume(0.424), &range(0, 0));
        assert_eq!(action(volume), Some(UserAction::SetVolume(42)));

        let quit = map_control_event(MediaControlEvent::Quit, &range(0, 0));
        assert!(matches!(quit, Some(ControlMessage::Quit)));
    }

    #[test]
    fn test_nothing_published_yet_needs_both_halves() {
        let pending = pending_publish(&Published::default(), &NowPlaying::default());
        assert_eq!(
            pending,
            PendingPublish {
                status: true,
                metadata: true
            }
        );
    }

    #[test]
    fn test_play_pause_change_only_republishes_status() {
        let paused = playing("Song", false);
        let published = Published {
            status: Some(paused.status_key()),
            track: Some(paused.track.clone()),
        };

        assert_eq!(
            pending_publish(&published, &paused),
            PendingPublish {
                status: false,
                metadata: false
            }
        );
        assert_eq!(
            pending_publish(&published, &playing("Song", true)),
            PendingPublish {
                status: true,
                metadata: false
            }
        );
        assert_eq!(
            pending_publish(&published, &playing("Other", false)),
            PendingPublish {
                status: false,
                metadata: true
            }
        );
    }

    #[test]
    fn test_unavailable_track_reads_as_stopped_regardless_of_play_flag() {
        let idle = NowPlaying::from_state(&PlaybackState {
            is_playing: FieldState::Known(true),
            ..PlaybackState::default()
        });
        assert!(idle.track.is_none());
        assert_eq!(idle.status_key(), NowPlaying::default().status_key());
    }
}
