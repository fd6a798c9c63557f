//! Headless presenter: renders bus events as now-playing log lines.

use std::path::PathBuf;

use log::{debug, info, warn};
use tokio::sync::broadcast::{error::RecvError, Receiver};

use crate::cover_art::CoverArtCache;
use crate::display_text::{format_position, format_timestamp, truncate_title};
use crate::playback_state::{FieldState, PlaybackState, TrackPosition};
use crate::protocol::{ControlMessage, Message, PlayerEvent};

/// Renders one status line for the current state.
pub fn now_playing_line(
    state: &PlaybackState,
    position: &TrackPosition,
    title_max_chars: usize,
) -> String {
    let status = match state.is_playing {
        FieldState::Known(true) => "playing",
        FieldState::Known(false) => "paused",
        FieldState::Unknown => "unknown",
        FieldState::NotApplicable => "idle",
    };
    let remaining = if position.total_ms > 0 {
        format!(", -{}", format_timestamp(position.remaining_ms()))
    } else {
        String::new()
    };
    format!(
        "[{}] {} - {} ({}{})",
        status,
        truncate_title(&state.track.title, title_max_chars),
        state.track.artist,
        format_position(position),
        remaining
    )
}

/// Consumes player events until quit and logs what a mini-player would show.
pub struct NowPlayingPresenter {
    bus_consumer: Receiver<Message>,
    title_max_chars: usize,
    cover_art: Option<CoverArtCache>,
    state: PlaybackState,
    position: TrackPosition,
    last_line: Option<String>,
    last_cover: Option<PathBuf>,
}

impl NowPlayingPresenter {
    pub fn new(
        bus_consumer: Receiver<Message>,
        initial_state: PlaybackState,
        title_max_chars: usize,
        cover_art: Option<CoverArtCache>,
    ) -> Self {
        let position = TrackPosition::new(0, initial_state.track.duration_ms);
        Self {
            bus_consumer,
            title_max_chars,
            cover_art,
            state: initial_state,
            position,
            last_line: None,
            last_cover: None,
        }
    }

    pub fn last_line(&self) -> Option<&str> {
        self.last_line.as_deref()
    }

    pub fn last_cover(&self) -> Option<&PathBuf> {
        self.last_cover.as_ref()
    }

    /// Applies one event. Returns `false` once the process should exit.
    pub fn handle_message(&mut self, message: Message) -> bool {
        match message {
            Message::Control(ControlMessage::Quit) => return false,
            Message::Control(ControlMessage::Action(_)) => {}
            Message::Player(PlayerEvent::StateChanged(state)) => {
                if state.track.duration_ms != self.position.total_ms {
                    self.position =
                        TrackPosition::new(self.position.elapsed_ms, state.track.duration_ms);
                }
                self.state = state;
                self.render(true);
            }
            Message::Player(PlayerEvent::TrackChanged(track)) => {
                self.position = TrackPosition::new(0, track.duration_ms);
                self.refresh_cover(track.cover_url.as_deref());
                self.state.track = track;
                self.render(true);
            }
            Message::Player(PlayerEvent::Progress {
                elapsed_ms,
                total_ms,
                ..
            }) => {
                self.position = TrackPosition::new(elapsed_ms, total_ms);
                self.render(false);
            }
            Message::Player(PlayerEvent::TrackFinished) => {
                info!("NowPlaying: track finished");
            }
            Message::Player(PlayerEvent::ActionFailed { action, reason }) => {
                warn!("NowPlaying: {:?} failed: {}", action, reason);
            }
        }
        true
    }

    fn render(&mut self, significant: bool) {
        let line = now_playing_line(&self.state, &self.position, self.title_max_chars);
        if self.last_line.as_deref() == Some(line.as_str()) {
            return;
        }
        if significant {
            info!("NowPlaying: {}", line);
        } else {
            debug!("NowPlaying: {}", line);
        }
        self.last_line = Some(line);
    }

    fn refresh_cover(&mut self, cover_url: Option<&str>) {
        let (Some(cache), Some(url)) = (self.cover_art.as_ref(), cover_url) else {
            self.last_cover = None;
            return;
        };
        match cache.fetch(url) {
            Ok(path) => {
                debug!("NowPlaying: cover art at {}", path.display());
                self.last_cover = Some(path);
            }
            Err(err) => {
                warn!("NowPlaying: {}", err);
                self.last_cover = None;
            }
        }
    }

    pub fn run(&mut self) {
        self.render(true);
        loop {
            match self.bus_consumer.blocking_recv() {
                Ok(message) => {
                    if !self.handle_message(message) {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("NowPlaying: bus lagged by {} messages", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
        info!("NowPlaying: stopped");
    }
}
