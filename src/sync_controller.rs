//! Playback-state synchronization between the local model and the remote player.
//!
//! `SyncController` is the single owner of [`PlaybackState`]. User actions
//! mutate it optimistically or after remote confirmation, and two poll loops
//! reconcile it with remote truth once per second. Every change is published
//! on the event bus.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::sync::broadcast::{Receiver, Sender};

use crate::backends::{RemoteError, RemotePlayback};
use crate::config::Config;
use crate::playback_clock::{ClockState, ClockTiming, PlaybackClock};
use crate::playback_state::{FieldState, PlaybackState, RepeatMode, TrackDetails, TrackPosition};
use crate::protocol::{ActionOutcome, ControlMessage, Message, PlayerEvent, UserAction};
use crate::skip_coalescer::{FlushReport, SkipCoalescer};
use crate::transport_client::{position_from_snapshot, validate_volume, RemoteTransportClient};

/// Volume restored after session recovery when none was ever observed.
const FALLBACK_RESTORE_VOLUME: u8 = 50;
const TITLE_PREFIX_CHARS: usize = 10;
const FLUSH_RETRY_INTERVAL: Duration = Duration::from_millis(20);

/// Timing and policy knobs for the controller.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub poll_interval: Duration,
    pub skip_window: Duration,
    pub skip_call_delay: Duration,
    pub track_change_suppress: Duration,
    /// Above this elapsed time "previous" restarts the current track.
    pub restart_threshold_ms: u64,
    /// Pause between a remote "previous" and reloading the new track.
    pub previous_settle: Duration,
    pub recovery_volume_percent: u8,
    pub clock: ClockTiming,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(1000),
            skip_window: Duration::from_millis(1000),
            skip_call_delay: Duration::from_millis(100),
            track_change_suppress: Duration::from_secs(10),
            restart_threshold_ms: 5000,
            previous_settle: Duration::from_millis(1000),
            recovery_volume_percent: 5,
            clock: ClockTiming::default(),
        }
    }
}

impl SyncSettings {
    pub fn from_config(config: &Config) -> Self {
        let sync = &config.sync;
        Self {
            poll_interval: Duration::from_millis(sync.poll_interval_ms),
            skip_window: Duration::from_millis(sync.skip_window_ms),
            skip_call_delay: Duration::from_millis(sync.skip_call_delay_ms),
            track_change_suppress: Duration::from_millis(sync.track_change_suppress_ms),
            restart_threshold_ms: sync.restart_threshold_ms,
            previous_settle: Duration::from_millis(sync.previous_settle_ms),
            recovery_volume_percent: sync.recovery_volume_percent,
            clock: ClockTiming {
                resync_every_ticks: sync.resync_interval_secs,
                ..ClockTiming::default()
            },
        }
    }
}

#[derive(Debug, Default)]
struct ControllerState {
    playback: PlaybackState,
    last_known_volume: Option<u8>,
    suppress_track_change_until: Option<Instant>,
}

struct ControllerInner {
    transport: Arc<RemoteTransportClient>,
    settings: SyncSettings,
    state: Mutex<ControllerState>,
    clock: PlaybackClock,
    skips: SkipCoalescer,
    bus_producer: Sender<Message>,
    toggles_in_flight: AtomicUsize,
    toggle_epoch: AtomicU64,
    stopped: AtomicBool,
}

/// Cloneable handle to the shared controller.
#[derive(Clone)]
pub struct SyncController {
    inner: Arc<ControllerInner>,
}

/// Running poll loops; dropping the handle leaves them running.
pub struct PollHandle {
    stop: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl PollHandle {
    pub fn stop(self) {
        self.stop.store(true, Ordering::SeqCst);
        for thread in self.threads {
            if thread.join().is_err() {
                warn!("SyncController: poll thread panicked");
            }
        }
    }
}

impl SyncController {
    pub fn new(
        transport: Arc<RemoteTransportClient>,
        bus_producer: Sender<Message>,
        settings: SyncSettings,
    ) -> Self {
        let inner = Arc::new(ControllerInner {
            transport,
            clock: PlaybackClock::new(settings.clock),
            skips: SkipCoalescer::new(settings.skip_window, settings.skip_call_delay),
            settings,
            state: Mutex::new(ControllerState::default()),
            bus_producer,
            toggles_in_flight: AtomicUsize::new(0),
            toggle_epoch: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        });
        Self::attach_clock_callbacks(&inner);
        Self { inner }
    }

    fn attach_clock_callbacks(inner: &Arc<ControllerInner>) {
        let finished = Arc::downgrade(inner);
        inner.clock.set_finished_callback(move || {
            if let Some(controller) = Self::upgrade(&finished) {
                controller.handle_track_finished();
            }
        });

        let progress = Arc::downgrade(inner);
        inner.clock.set_progress_callback(move |sample| {
            if let Some(controller) = Self::upgrade(&progress) {
                controller.publish(PlayerEvent::Progress {
                    elapsed_ms: sample.position.elapsed_ms,
                    total_ms: sample.position.total_ms,
                    percent: sample.percent,
                });
            }
        });

        let resync = Arc::downgrade(inner);
        inner.clock.set_resync_callback(move || {
            let controller = Self::upgrade(&resync)?;
            match controller.inner.transport.playback_position() {
                Ok(position) => position,
                Err(err) => {
                    debug!("SyncController: resync skipped: {}", err);
                    None
                }
            }
        });
    }

    fn upgrade(inner: &Weak<ControllerInner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    fn lock_state(&self) -> MutexGuard<'_, ControllerState> {
        match self.inner.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn publish(&self, event: PlayerEvent) {
        let _ = self.inner.bus_producer.send(Message::Player(event));
    }

    fn publish_state(&self) {
        let snapshot = self.playback_state();
        self.publish(PlayerEvent::StateChanged(snapshot));
    }

    /// Receiver for player events and control messages.
    pub fn subscribe(&self) -> Receiver<Message> {
        self.inner.bus_producer.subscribe()
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.lock_state().playback.clone()
    }

    pub fn track_position(&self) -> TrackPosition {
        self.inner.clock.position()
    }

    pub fn clock_state(&self) -> ClockState {
        self.inner.clock.state()
    }

    pub fn volume_percent(&self) -> FieldState<u8> {
        self.lock_state().playback.volume_percent.clone()
    }

    pub fn pending_skips(&self) -> u32 {
        self.inner.skips.pending_count()
    }

    /// Loads the current track. A missing session triggers one recovery
    /// attempt before the retried load.
    pub fn load_current_track(&self) -> Result<PlaybackState, RemoteError> {
        self.load(true)
    }

    fn load(&self, allow_recovery: bool) -> Result<PlaybackState, RemoteError> {
        let playback = self.inner.transport.playback()?;
        let has_track = playback
            .snapshot()
            .is_some_and(|snapshot| snapshot.track.is_some());
        if !has_track && allow_recovery {
            info!("SyncController: no playback session; attempting recovery");
            self.recover_session();
            return self.load(false);
        }
        Ok(self.apply_playback(&playback))
    }

    /// Nudges the remote player into creating a session: quiet volume, play,
    /// pause, then restore the previous volume.
    fn recover_session(&self) {
        let restore_volume = self
            .lock_state()
            .last_known_volume
            .unwrap_or(FALLBACK_RESTORE_VOLUME);
        let transport = &self.inner.transport;
        if let Err(err) = transport.set_volume(i32::from(self.inner.settings.recovery_volume_percent)) {
            warn!("SyncController: recovery volume change failed: {}", err);
        }
        if let Err(err) = transport.play() {
            warn!("SyncController: recovery play failed: {}", err);
        }
        if let Err(err) = transport.pause() {
            warn!("SyncController: recovery pause failed: {}", err);
        }
        if let Err(err) = transport.set_volume(i32::from(restore_volume)) {
            warn!("SyncController: recovery volume restore failed: {}", err);
        }
    }

    fn apply_playback(&self, playback: &RemotePlayback) -> PlaybackState {
        let (next, position) = match playback {
            RemotePlayback::NoSession => (
                PlaybackState {
                    is_playing: FieldState::NotApplicable,
                    shuffle: FieldState::NotApplicable,
                    repeat_mode: FieldState::NotApplicable,
                    volume_percent: FieldState::NotApplicable,
                    track: TrackDetails::unavailable(),
                },
                None,
            ),
            RemotePlayback::Active(snapshot) => (
                PlaybackState {
                    is_playing: snapshot.is_playing.clone(),
                    shuffle: snapshot.shuffle.clone(),
                    repeat_mode: snapshot.repeat_mode.clone(),
                    volume_percent: snapshot.volume_percent(),
                    track: snapshot
                        .track
                        .clone()
                        .unwrap_or_else(TrackDetails::unavailable),
                },
                position_from_snapshot(snapshot),
            ),
        };

        let track_changed = {
            let mut state = self.lock_state();
            let changed = state.playback.track != next.track;
            if let Some(volume) = next.volume_percent.known_copied() {
                state.last_known_volume = Some(volume);
            }
            state.playback = next.clone();
            changed
        };

        match position {
            Some(position) if next.is_playing_known_true() => self.inner.clock.start_from(position),
            Some(position) => self.inner.clock.pause_at(position),
            None => {
                self.inner.clock.pause_at(TrackPosition::default());
                self.inner.clock.cancel();
            }
        }

        if track_changed {
            debug!("SyncController: now playing '{}'", next.track.title);
            self.publish(PlayerEvent::TrackChanged(next.track.clone()));
        }
        self.publish(PlayerEvent::StateChanged(next.clone()));
        next
    }

    fn suppress_track_change(&self) {
        let until = Instant::now() + self.inner.settings.track_change_suppress;
        self.lock_state().suppress_track_change_until = Some(until);
    }

    fn track_change_suppressed(&self, now: Instant) -> bool {
        if self.inner.skips.pending_count() > 0 {
            return true;
        }
        self.lock_state()
            .suppress_track_change_until
            .is_some_and(|until| now < until)
    }

    /// One track-change poll. Returns whether a reload happened.
    pub fn poll_track_change_once(&self) -> Result<bool, RemoteError> {
        if self.track_change_suppressed(Instant::now()) {
            return Ok(false);
        }
        let remote_title = self.inner.transport.track_title()?;
        let local_title = self.lock_state().playback.track.title.clone();
        if TrackDetails::title_prefix(&local_title, TITLE_PREFIX_CHARS)
            == TrackDetails::title_prefix(&remote_title, TITLE_PREFIX_CHARS)
        {
            return Ok(false);
        }

        info!(
            "SyncController: remote track changed from '{}' to '{}'",
            local_title, remote_title
        );
        self.load(false)?;
        Ok(true)
    }

    /// One pause-state poll. The remote player wins every disagreement.
    /// Returns whether the local play/pause flag was flipped.
    pub fn poll_pause_state_once(&self) -> Result<bool, RemoteError> {
        if self.inner.toggles_in_flight.load(Ordering::SeqCst) > 0 {
            return Ok(false);
        }
        let epoch = self.inner.toggle_epoch.load(Ordering::SeqCst);
        let playback = self.inner.transport.playback()?;
        if self.inner.toggles_in_flight.load(Ordering::SeqCst) > 0
            || self.inner.toggle_epoch.load(Ordering::SeqCst) != epoch
        {
            return Ok(false);
        }

        let Some(snapshot) = playback.snapshot() else {
            let lost_session = {
                let mut state = self.lock_state();
                let lost = state.playback.is_playing != FieldState::NotApplicable;
                if lost {
                    state.playback.is_playing = FieldState::NotApplicable;
                }
                lost
            };
            if lost_session {
                info!("SyncController: remote session ended");
                self.inner.clock.stop_timer();
                self.publish_state();
            }
            return Ok(lost_session);
        };

        let mut flipped_to = None;
        let mut changed = false;
        {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            let playback = &mut state.playback;
            if let FieldState::Known(remote_playing) = snapshot.is_playing {
                if playback.is_playing != FieldState::Known(remote_playing) {
                    playback.is_playing = FieldState::Known(remote_playing);
                    flipped_to = Some(remote_playing);
                }
            }
            if snapshot.shuffle.is_known() && playback.shuffle != snapshot.shuffle {
                playback.shuffle = snapshot.shuffle.clone();
                changed = true;
            }
            if snapshot.repeat_mode.is_known() && playback.repeat_mode != snapshot.repeat_mode {
                playback.repeat_mode = snapshot.repeat_mode.clone();
                changed = true;
            }
            let remote_volume = snapshot.volume_percent();
            if let Some(volume) = remote_volume.known_copied() {
                if playback.volume_percent != remote_volume {
                    playback.volume_percent = remote_volume;
                    changed = true;
                }
                state.last_known_volume = Some(volume);
            }
        }

        if let Some(playing) = flipped_to {
            info!(
                "SyncController: remote player is {}",
                if playing { "playing" } else { "paused" }
            );
            let position = position_from_snapshot(snapshot)
                .unwrap_or_else(|| self.inner.clock.position());
            if playing {
                self.inner.clock.start_from(position);
            } else {
                self.inner.clock.pause_at(position);
            }
        }
        if changed || flipped_to.is_some() {
            self.publish_state();
        }
        Ok(flipped_to.is_some())
    }

    /// Applies a user action and reports its immediate outcome.
    pub fn on_user_action(&self, action: UserAction) -> ActionOutcome {
        let outcome = self.apply_user_action(&action);
        match &outcome {
            ActionOutcome::Rejected(reason) => {
                warn!("SyncController: {:?} rejected: {}", action, reason);
                self.publish(PlayerEvent::ActionFailed {
                    action,
                    reason: reason.clone(),
                });
            }
            ActionOutcome::Failed(err) => {
                warn!("SyncController: {:?} failed: {}", action, err);
                self.publish(PlayerEvent::ActionFailed {
                    action,
                    reason: err.to_string(),
                });
            }
            ActionOutcome::Confirmed | ActionOutcome::Pending => {}
        }
        outcome
    }

    fn apply_user_action(&self, action: &UserAction) -> ActionOutcome {
        match action {
            UserAction::Play => self.set_playing_optimistically(true),
            UserAction::Pause => self.set_playing_optimistically(false),
            UserAction::TogglePlayback => {
                let playing = self.lock_state().playback.is_playing_known_true();
                self.set_playing_optimistically(!playing)
            }
            UserAction::SkipNext => self.register_skip(),
            UserAction::SkipPrevious => self.skip_previous(),
            UserAction::Seek(position_ms) => self.seek(*position_ms),
            UserAction::SetShuffle(enabled) => self.set_shuffle(*enabled),
            UserAction::ToggleShuffle => {
                let enabled = self
                    .lock_state()
                    .playback
                    .shuffle
                    .known_copied()
                    .unwrap_or(false);
                self.set_shuffle(!enabled)
            }
            UserAction::SetRepeat(mode) => self.set_repeat(*mode),
            UserAction::CycleRepeat => {
                let current = self
                    .lock_state()
                    .playback
                    .repeat_mode
                    .known_copied()
                    .unwrap_or(RepeatMode::Off);
                self.set_repeat(current.next())
            }
            UserAction::SetVolume(volume) => self.set_volume(*volume),
            UserAction::OpenArtist => {
                let url = self.lock_state().playback.track.artist_url.clone();
                open_link("artist", url)
            }
            UserAction::OpenAlbum => {
                let url = self.lock_state().playback.track.album_url.clone();
                open_link("album", url)
            }
            UserAction::Refresh => match self.load(true) {
                Ok(_) => ActionOutcome::Confirmed,
                Err(err) => ActionOutcome::Failed(err),
            },
        }
    }

    fn set_playing_optimistically(&self, playing: bool) -> ActionOutcome {
        self.lock_state().playback.is_playing = FieldState::Known(playing);
        if playing {
            self.inner.clock.resume();
        } else {
            self.inner.clock.stop_timer();
        }
        self.publish_state();

        let action = if playing {
            UserAction::Play
        } else {
            UserAction::Pause
        };
        self.dispatch_in_background(action, move |transport| {
            if playing {
                transport.play()
            } else {
                transport.pause()
            }
        });
        ActionOutcome::Pending
    }

    /// Runs a play/pause call off the caller's thread. Failures are reported
    /// but the optimistic local state is kept; the pause poll corrects it.
    fn dispatch_in_background<F>(&self, action: UserAction, call: F)
    where
        F: FnOnce(&RemoteTransportClient) -> Result<(), RemoteError> + Send + 'static,
    {
        self.inner.toggle_epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.toggles_in_flight.fetch_add(1, Ordering::SeqCst);
        let controller = self.clone();
        let spawned = thread::Builder::new()
            .name("sync-dispatch".to_string())
            .spawn(move || {
                if let Err(err) = call(&controller.inner.transport) {
                    warn!("SyncController: {:?} was not applied remotely: {}", action, err);
                    controller.publish(PlayerEvent::ActionFailed {
                        action,
                        reason: err.to_string(),
                    });
                }
                controller.inner.toggle_epoch.fetch_add(1, Ordering::SeqCst);
                controller.inner.toggles_in_flight.fetch_sub(1, Ordering::SeqCst);
            });
        if let Err(err) = spawned {
            error!("SyncController: failed to spawn dispatch thread: {}", err);
            self.inner.toggles_in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Blocks until background play/pause calls settle or `timeout` passes.
    pub fn wait_for_dispatches(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.inner.toggles_in_flight.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        true
    }

    fn register_skip(&self) -> ActionOutcome {
        let registration = self.inner.skips.register();
        self.lock_state().playback.is_playing = FieldState::Known(true);
        self.suppress_track_change();
        debug!(
            "SyncController: skip registered, {} pending",
            registration.pending_count
        );

        if let Some(due_at) = registration
            .flush_due_at
            .filter(|_| registration.starts_new_window)
        {
            let controller = self.clone();
            if let Err(err) = thread::Builder::new()
                .name("sync-skip-flush".to_string())
                .spawn(move || controller.run_skip_flush(due_at))
            {
                error!("SyncController: failed to spawn skip flush thread: {}", err);
            }
        }
        ActionOutcome::Pending
    }

    fn run_skip_flush(&self, due_at: Instant) {
        let now = Instant::now();
        if due_at > now {
            thread::sleep(due_at - now);
        }
        while !self.inner.stopped.load(Ordering::SeqCst) {
            if self.flush_pending_skips_at(Instant::now()).is_some()
                || !self.inner.skips.is_flushing()
            {
                return;
            }
            thread::sleep(FLUSH_RETRY_INTERVAL);
        }
    }

    /// Flushes a due skip batch, previewing the track the burst lands on.
    pub fn flush_pending_skips_at(&self, now: Instant) -> Option<FlushReport> {
        let transport = Arc::clone(&self.inner.transport);
        let report = self.inner.skips.flush_due(
            now,
            |count| self.preview_queued_track(count),
            || match transport.skip_next() {
                Ok(()) => true,
                Err(err) => {
                    warn!("SyncController: skip failed: {}", err);
                    false
                }
            },
        )?;

        self.suppress_track_change();
        if report.succeeded < report.requested {
            self.publish(PlayerEvent::ActionFailed {
                action: UserAction::SkipNext,
                reason: format!(
                    "{} of {} skips were accepted",
                    report.succeeded, report.requested
                ),
            });
        }
        Some(report)
    }

    /// Shows the `landing`-th queued track (1-based) and restarts the clock.
    fn preview_queued_track(&self, landing: u32) {
        let queued = match self.inner.transport.queue() {
            Ok(queue) => queue.into_iter().nth(landing.saturating_sub(1) as usize),
            Err(err) => {
                debug!("SyncController: queue preview unavailable: {}", err);
                None
            }
        };
        let Some(track) = queued else {
            self.inner.clock.reset_to(Some(0));
            return;
        };

        let duration_ms = track.duration_ms;
        self.lock_state().playback.track = track.clone();
        self.inner.clock.reset_to(Some(duration_ms));
        self.publish(PlayerEvent::TrackChanged(track));
        self.publish_state();
    }

    fn skip_previous(&self) -> ActionOutcome {
        let position = self.inner.clock.position();
        let clock_state = self.inner.clock.state();
        let playing = self.lock_state().playback.is_playing_known_true();

        if position.elapsed_ms > self.inner.settings.restart_threshold_ms {
            debug!("SyncController: previous restarts the current track");
            self.restart_clock_at_zero(position.total_ms, playing);
            return match self.inner.transport.seek(0) {
                Ok(()) => ActionOutcome::Confirmed,
                Err(err) => {
                    self.restore_clock(position, clock_state);
                    ActionOutcome::Failed(err)
                }
            };
        }

        self.restart_clock_at_zero(position.total_ms, playing);
        if let Err(err) = self.inner.transport.skip_previous() {
            self.restore_clock(position, clock_state);
            return ActionOutcome::Failed(err);
        }
        self.suppress_track_change();
        if !self.inner.settings.previous_settle.is_zero() {
            thread::sleep(self.inner.settings.previous_settle);
        }
        match self.load(false) {
            Ok(_) => ActionOutcome::Confirmed,
            Err(err) => {
                // The skip itself went through; the next poll picks up the track.
                debug!("SyncController: reload after previous failed: {}", err);
                ActionOutcome::Confirmed
            }
        }
    }

    /// Puts the clock back where it was before a rejected remote call.
    fn restore_clock(&self, position: TrackPosition, state: ClockState) {
        debug!(
            "SyncController: restoring clock to {}ms ({:?})",
            position.elapsed_ms, state
        );
        match state {
            ClockState::Running => self.inner.clock.start_from(position),
            ClockState::Idle => {
                self.inner.clock.pause_at(position);
                self.inner.clock.cancel();
            }
            ClockState::Paused | ClockState::EndReached => self.inner.clock.pause_at(position),
        }
    }

    fn restart_clock_at_zero(&self, total_ms: u64, playing: bool) {
        if playing {
            self.inner.clock.reset_to(Some(total_ms));
        } else {
            self.inner.clock.pause_at(TrackPosition::new(0, total_ms));
        }
    }

    fn seek(&self, position_ms: u64) -> ActionOutcome {
        let total_ms = self.inner.clock.position().total_ms;
        let target_ms = if total_ms > 0 {
            position_ms.min(total_ms)
        } else {
            position_ms
        };
        let prior_position = self.inner.clock.position();
        let prior_state = self.inner.clock.state();
        self.inner.clock.seek_to(target_ms);
        match self.inner.transport.seek(target_ms) {
            Ok(()) => ActionOutcome::Confirmed,
            Err(err) => {
                self.restore_clock(prior_position, prior_state);
                ActionOutcome::Failed(err)
            }
        }
    }

    fn set_shuffle(&self, enabled: bool) -> ActionOutcome {
        if let Err(err) = self.inner.transport.set_shuffle(enabled) {
            return ActionOutcome::Failed(err);
        }
        self.lock_state().playback.shuffle = FieldState::Known(enabled);
        self.publish_state();
        ActionOutcome::Confirmed
    }

    fn set_repeat(&self, mode: RepeatMode) -> ActionOutcome {
        if let Err(err) = self.inner.transport.set_repeat(mode) {
            return ActionOutcome::Failed(err);
        }
        self.lock_state().playback.repeat_mode = FieldState::Known(mode);
        self.publish_state();
        ActionOutcome::Confirmed
    }

    fn set_volume(&self, volume: i32) -> ActionOutcome {
        let volume = match validate_volume(volume) {
            Ok(volume) => volume,
            Err(err) => return ActionOutcome::Rejected(err.to_string()),
        };
        if let Err(err) = self.inner.transport.set_volume(i32::from(volume)) {
            return ActionOutcome::Failed(err);
        }
        {
            let mut state = self.lock_state();
            state.playback.volume_percent = FieldState::Known(volume);
            state.last_known_volume = Some(volume);
        }
        self.publish_state();
        ActionOutcome::Confirmed
    }

    /// Called by the clock one tick before the nominal end of the track.
    pub fn handle_track_finished(&self) {
        info!("SyncController: track finished");
        self.publish(PlayerEvent::TrackFinished);
        self.suppress_track_change();
        self.preview_queued_track(1);
    }

    /// Starts the track-change and pause-state poll loops.
    pub fn spawn_poll_loops(&self) -> PollHandle {
        let stop = Arc::new(AtomicBool::new(false));
        let mut threads = Vec::new();

        let track_poller = self.clone();
        if let Some(handle) = self.spawn_poll_loop("sync-track-poll", Arc::clone(&stop), move || {
            track_poller.poll_track_change_once().map(|_| ())
        }) {
            threads.push(handle);
        }
        let pause_poller = self.clone();
        if let Some(handle) = self.spawn_poll_loop("sync-pause-poll", Arc::clone(&stop), move || {
            pause_poller.poll_pause_state_once().map(|_| ())
        }) {
            threads.push(handle);
        }

        PollHandle { stop, threads }
    }

    fn spawn_poll_loop<F>(&self, name: &str, stop: Arc<AtomicBool>, poll: F) -> Option<JoinHandle<()>>
    where
        F: Fn() -> Result<(), RemoteError> + Send + 'static,
    {
        let interval = self.inner.settings.poll_interval;
        let controller = self.clone();
        let label = name.to_string();
        let spawned = thread::Builder::new().name(name.to_string()).spawn(move || {
            debug!("SyncController: {} started", label);
            while !stop.load(Ordering::SeqCst) && !controller.inner.stopped.load(Ordering::SeqCst) {
                if let Err(err) = poll() {
                    if err.is_transient() {
                        debug!("SyncController: {} failed: {}", label, err);
                    } else {
                        warn!("SyncController: {} failed: {}", label, err);
                    }
                }
                thread::sleep(interval);
            }
            debug!("SyncController: {} stopped", label);
        });
        match spawned {
            Ok(handle) => Some(handle),
            Err(err) => {
                error!("SyncController: failed to spawn {}: {}", name, err);
                None
            }
        }
    }

    /// Executes actions from the bus until quit or close.
    pub fn run(&self, mut bus_consumer: Receiver<Message>) {
        info!("SyncController: started");
        loop {
            match bus_consumer.blocking_recv() {
                Ok(Message::Control(ControlMessage::Action(action))) => {
                    let outcome = self.on_user_action(action.clone());
                    debug!("SyncController: {:?} -> {:?}", action, outcome);
                }
                Ok(Message::Control(ControlMessage::Quit)) => break,
                Ok(Message::Player(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("SyncController: bus lagged by {} messages", skipped);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
        self.shutdown();
        info!("SyncController: stopped");
    }

    /// Stops background work owned by the controller.
    pub fn shutdown(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.clock.cancel();
    }
}

fn open_link(kind: &str, url: Option<String>) -> ActionOutcome {
    let Some(url) = url.filter(|url| !url.trim().is_empty()) else {
        return ActionOutcome::Rejected(format!("current track has no {kind} link"));
    };
    match webbrowser::open(&url) {
        Ok(()) => ActionOutcome::Confirmed,
        Err(err) => ActionOutcome::Rejected(format!("failed to open {kind} link: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::{SyncController, SyncSettings};
    use crate::backends::{RemoteError, RemotePlayback};
    use crate::credentials::StaticCredentialSupplier;
    use crate::device_cache::DeviceCache;
    use crate::playback_clock::ClockState;
    use crate::playback_state::{FieldState, RepeatMode, UNAVAILABLE_TITLE};
    use crate::protocol::{ActionOutcome, Message, PlayerEvent, UserAction};
    use crate::transport_client::test_support::{active_snapshot, track, FakePlayerApi};
    use crate::transport_client::{RemoteTransportClient, TransportSettings};
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tokio::sync::broadcast;

    fn test_settings() -> SyncSettings {
        SyncSettings {
            skip_window: Duration::from_millis(50),
            skip_call_delay: Duration::ZERO,
            previous_settle: Duration::ZERO,
            ..SyncSettings::default()
        }
    }

    fn controller_with(api: Arc<FakePlayerApi>, settings: SyncSettings) -> SyncController {
        let transport = RemoteTransportClient::new(
            api,
            Arc::new(StaticCredentialSupplier::new("token")),
            DeviceCache::in_memory(),
            TransportSettings {
                requests_per_second: 1000,
                limiter_wait: Duration::from_millis(50),
            },
        );
        let (bus_producer, _) = broadcast::channel(256);
        SyncController::new(Arc::new(transport), bus_producer, settings)
    }

    fn playing(title: &str, progress_ms: u64, is_playing: bool) -> RemotePlayback {
        RemotePlayback::Active(active_snapshot(
            track(&title.to_lowercase().replace(' ', "-"), title, 180_000),
            progress_ms,
            is_playing,
        ))
    }

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    #[test]
    fn test_load_populates_state_and_announces_track() {
        let api = Arc::new(FakePlayerApi::with_playback(playing("Alpha Song", 30_000, false)));
        let controller = controller_with(Arc::clone(&api), test_settings());
        let mut observer = controller.subscribe();

        let state = controller.load_current_track().expect("load");
        assert_eq!(state.track.title, "Alpha Song");
        assert_eq!(state.is_playing, FieldState::Known(false));
        assert_eq!(state.volume_percent, FieldState::Known(50));
        assert_eq!(controller.track_position().elapsed_ms, 30_000);
        assert_eq!(controller.clock_state(), ClockState::Paused);

        assert!(matches!(
            observer.try_recv(),
            Ok(Message::Player(PlayerEvent::TrackChanged(track))) if track.title == "Alpha Song"
        ));
        assert!(matches!(
            observer.try_recv(),
            Ok(Message::Player(PlayerEvent::StateChanged(_)))
        ));
    }

    #[test]
    fn test_missing_session_recovers_once_then_reports_unavailable() {
        let api = Arc::new(FakePlayerApi::with_playback(RemotePlayback::NoSession));
        let controller = controller_with(Arc::clone(&api), test_settings());

        let state = controller.load_current_track().expect("load");
        assert_eq!(state.track.title, UNAVAILABLE_TITLE);
        assert_eq!(
            api.calls(),
            vec![
                "playback_state".to_string(),
                "set_volume:5".to_string(),
                "play:".to_string(),
                "pause:".to_string(),
                "set_volume:50".to_string(),
                "playback_state".to_string(),
            ]
        );
    }

    #[test]
    fn test_out_of_range_volume_is_rejected_without_network() {
        let api = Arc::new(FakePlayerApi::with_playback(playing("Alpha Song", 0, false)));
        let controller = controller_with(Arc::clone(&api), test_settings());
        controller.load_current_track().expect("load");
        let calls_before = api.calls().len();

        for volume in [-5, 101] {
            assert!(matches!(
                controller.on_user_action(UserAction::SetVolume(volume)),
                ActionOutcome::Rejected(_)
            ));
        }
        assert_eq!(api.calls().len(), calls_before);
        assert_eq!(controller.volume_percent(), FieldState::Known(50));
    }

    #[test]
    fn test_volume_converges_after_next_poll() {
        let api = Arc::new(FakePlayerApi::with_playback(playing("Alpha Song", 0, false)));
        let controller = controller_with(Arc::clone(&api), test_settings());
        controller.load_current_track().expect("load");

        for volume in [0, 37, 100] {
            assert_eq!(
                controller.on_user_action(UserAction::SetVolume(volume)),
                ActionOutcome::Confirmed
            );
            controller.poll_pause_state_once().expect("poll");
            assert_eq!(controller.volume_percent(), FieldState::Known(volume as u8));
        }
    }

    #[test]
    fn test_pause_twice_is_local_first_and_calls_remote_each_time() {
        let api = Arc::new(FakePlayerApi::with_playback(playing("Alpha Song", 0, true)));
        let controller = controller_with(Arc::clone(&api), test_settings());
        controller.load_current_track().expect("load");

        assert_eq!(controller.on_user_action(UserAction::Pause), ActionOutcome::Pending);
        assert_eq!(
            controller.playback_state().is_playing,
            FieldState::Known(false)
        );
        assert_eq!(controller.on_user_action(UserAction::Pause), ActionOutcome::Pending);
        assert!(controller.wait_for_dispatches(Duration::from_secs(2)));

        assert_eq!(
            controller.playback_state().is_playing,
            FieldState::Known(false)
        );
        assert_eq!(api.count("pause"), 2);
        controller.shutdown();
    }

    #[test]
    fn test_failed_pause_keeps_optimistic_state_until_poll() {
        let api = Arc::new(FakePlayerApi::with_playback(playing("Alpha Song", 0, true)));
        let controller = controller_with(Arc::clone(&api), test_settings());
        controller.load_current_track().expect("load");
        api.fail_next("pause", RemoteError::Network("timeout".to_string()));

        controller.on_user_action(UserAction::Pause);
        assert!(controller.wait_for_dispatches(Duration::from_secs(2)));
        assert_eq!(
            controller.playback_state().is_playing,
            FieldState::Known(false)
        );

        assert_eq!(controller.poll_pause_state_once(), Ok(true));
        assert_eq!(
            controller.playback_state().is_playing,
            FieldState::Known(true)
        );
        assert_eq!(controller.clock_state(), ClockState::Running);
        controller.shutdown();
    }

    #[test]
    fn test_remote_pause_is_mirrored_locally() {
        let api = Arc::new(FakePlayerApi::with_playback(playing("Alpha Song", 10_000, true)));
        let controller = controller_with(Arc::clone(&api), test_settings());
        controller.load_current_track().expect("load");

        api.set_playback(playing("Alpha Song", 12_000, false));
        assert_eq!(controller.poll_pause_state_once(), Ok(true));
        assert_eq!(
            controller.playback_state().is_playing,
            FieldState::Known(false)
        );
        assert_eq!(controller.clock_state(), ClockState::Paused);
        assert_eq!(controller.track_position().elapsed_ms, 12_000);
        assert_eq!(controller.poll_pause_state_once(), Ok(false));
    }

    #[test]
    fn test_previous_early_in_track_calls_remote_previous() {
        let api = Arc::new(FakePlayerApi::with_playback(playing("Alpha Song", 3_000, false)));
        let controller = controller_with(Arc::clone(&api), test_settings());
        controller.load_current_track().expect("load");

        assert_eq!(
            controller.on_user_action(UserAction::SkipPrevious),
            ActionOutcome::Confirmed
        );
        assert_eq!(api.count("skip_previous"), 1);
        assert_eq!(api.count("seek"), 0);
        assert_eq!(controller.track_position().elapsed_ms, 0);
    }

    #[test]
    fn test_previous_late_in_track_restarts_it() {
        let api = Arc::new(FakePlayerApi::with_playback(playing("Alpha Song", 9_000, false)));
        let controller = controller_with(Arc::clone(&api), test_settings());
        controller.load_current_track().expect("load");

        assert_eq!(
            controller.on_user_action(UserAction::SkipPrevious),
            ActionOutcome::Confirmed
        );
        assert_eq!(api.count("skip_previous"), 0);
        assert!(api.calls().contains(&"seek:0".to_string()));
        assert_eq!(controller.track_position().elapsed_ms, 0);
        assert_eq!(controller.clock_state(), ClockState::Paused);
    }

    #[test]
    fn test_previous_threshold_boundary() {
        for (elapsed_ms, expect_remote_previous) in [(5_000, true), (5_001, false)] {
            let api = Arc::new(FakePlayerApi::with_playback(playing(
                "Alpha Song",
                elapsed_ms,
                false,
            )));
            let controller = controller_with(Arc::clone(&api), test_settings());
            controller.load_current_track().expect("load");

            assert_eq!(
                controller.on_user_action(UserAction::SkipPrevious),
                ActionOutcome::Confirmed
            );
            assert_eq!(
                api.count("skip_previous"),
                usize::from(expect_remote_previous),
                "elapsed {elapsed_ms}ms"
            );
            assert_eq!(
                api.count("seek"),
                usize::from(!expect_remote_previous),
                "elapsed {elapsed_ms}ms"
            );
        }
    }

    #[test]
    fn test_failed_seek_leaves_clock_where_it_was() {
        let api = Arc::new(FakePlayerApi::with_playback(playing("Alpha Song", 30_000, false)));
        let controller = controller_with(Arc::clone(&api), test_settings());
        controller.load_current_track().expect("load");
        api.fail_next("seek", RemoteError::NoActiveDevice);
        api.fail_next("seek", RemoteError::NoActiveDevice);

        assert_eq!(
            controller.on_user_action(UserAction::Seek(90_000)),
            ActionOutcome::Failed(RemoteError::NoActiveDevice)
        );
        assert_eq!(api.count("transfer_playback"), 1);
        assert_eq!(controller.track_position().elapsed_ms, 30_000);
        assert_eq!(controller.clock_state(), ClockState::Paused);
    }

    #[test]
    fn test_failed_previous_leaves_clock_where_it_was() {
        let api = Arc::new(FakePlayerApi::with_playback(playing("Alpha Song", 3_000, false)));
        let controller = controller_with(Arc::clone(&api), test_settings());
        controller.load_current_track().expect("load");
        api.fail_next("skip_previous", RemoteError::NoActiveDevice);
        api.fail_next("skip_previous", RemoteError::NoActiveDevice);

        assert_eq!(
            controller.on_user_action(UserAction::SkipPrevious),
            ActionOutcome::Failed(RemoteError::NoActiveDevice)
        );
        assert_eq!(controller.track_position().elapsed_ms, 3_000);
        assert_eq!(controller.clock_state(), ClockState::Paused);
    }

    #[test]
    fn test_failed_restart_keeps_running_clock_near_prior_position() {
        let api = Arc::new(FakePlayerApi::with_playback(playing("Alpha Song", 60_000, true)));
        let controller = controller_with(Arc::clone(&api), test_settings());
        controller.load_current_track().expect("load");
        api.fail_next("seek", RemoteError::Network("timeout".to_string()));

        assert!(matches!(
            controller.on_user_action(UserAction::SkipPrevious),
            ActionOutcome::Failed(RemoteError::Network(_))
        ));
        assert_eq!(controller.clock_state(), ClockState::Running);
        assert!(controller.track_position().elapsed_ms >= 60_000);
        controller.shutdown();
    }

    #[test]
    fn test_remote_track_change_triggers_reload() {
        let api = Arc::new(FakePlayerApi::with_playback(playing("Alpha Song", 0, false)));
        let controller = controller_with(Arc::clone(&api), test_settings());
        controller.load_current_track().expect("load");
        let mut observer = controller.subscribe();

        assert_eq!(controller.poll_track_change_once(), Ok(false));
        api.set_playback(playing("Beta Song", 0, false));
        assert_eq!(controller.poll_track_change_once(), Ok(true));
        assert_eq!(controller.playback_state().track.title, "Beta Song");
        assert!(matches!(
            observer.try_recv(),
            Ok(Message::Player(PlayerEvent::TrackChanged(track))) if track.title == "Beta Song"
        ));
    }

    #[test]
    fn test_track_change_compares_title_prefix_only() {
        let api = Arc::new(FakePlayerApi::with_playback(playing(
            "Long Title Version A",
            0,
            false,
        )));
        let controller = controller_with(Arc::clone(&api), test_settings());
        controller.load_current_track().expect("load");

        api.set_playback(playing("Long Title Version B", 0, false));
        assert_eq!(controller.poll_track_change_once(), Ok(false));
    }

    #[test]
    fn test_skip_burst_flushes_once_and_previews_landing_track() {
        let api = Arc::new(FakePlayerApi::with_playback(playing("Alpha Song", 0, false)));
        api.set_queue(vec![
            track("q1", "Queued One", 100_000),
            track("q2", "Queued Two", 200_000),
            track("q3", "Queued Three", 300_000),
        ]);
        let controller = controller_with(Arc::clone(&api), test_settings());
        controller.load_current_track().expect("load");

        controller.on_user_action(UserAction::SkipNext);
        controller.on_user_action(UserAction::SkipNext);
        assert_eq!(controller.pending_skips(), 2);

        assert!(wait_until(|| api.count("skip_next") == 2));
        assert!(wait_until(|| controller.pending_skips() == 0));
        assert_eq!(api.count("queue"), 1);
        assert_eq!(controller.playback_state().track.title, "Queued Two");
        assert_eq!(controller.track_position().total_ms, 200_000);
        controller.shutdown();
    }

    #[test]
    fn test_track_change_poll_is_suppressed_after_skip() {
        let api = Arc::new(FakePlayerApi::with_playback(playing("Alpha Song", 0, false)));
        let controller = controller_with(Arc::clone(&api), test_settings());
        controller.load_current_track().expect("load");

        controller.on_user_action(UserAction::SkipNext);
        api.set_playback(playing("Beta Song", 0, true));
        assert_eq!(controller.poll_track_change_once(), Ok(false));
        assert!(wait_until(|| api.count("skip_next") == 1));
        assert_eq!(controller.poll_track_change_once(), Ok(false));
        assert_eq!(api.count("currently_playing"), 0);
        controller.shutdown();
    }

    #[test]
    fn test_failed_shuffle_leaves_state_untouched() {
        let api = Arc::new(FakePlayerApi::with_playback(playing("Alpha Song", 0, false)));
        let controller = controller_with(Arc::clone(&api), test_settings());
        controller.load_current_track().expect("load");
        let mut observer = controller.subscribe();
        api.fail_next("set_shuffle", RemoteError::Network("reset".to_string()));

        assert!(matches!(
            controller.on_user_action(UserAction::ToggleShuffle),
            ActionOutcome::Failed(RemoteError::Network(_))
        ));
        assert_eq!(controller.playback_state().shuffle, FieldState::Known(false));
        assert!(matches!(
            observer.try_recv(),
            Ok(Message::Player(PlayerEvent::ActionFailed {
                action: UserAction::ToggleShuffle,
                ..
            }))
        ));

        assert_eq!(
            controller.on_user_action(UserAction::ToggleShuffle),
            ActionOutcome::Confirmed
        );
        assert_eq!(controller.playback_state().shuffle, FieldState::Known(true));
    }

    #[test]
    fn test_cycle_repeat_walks_all_modes() {
        let api = Arc::new(FakePlayerApi::with_playback(playing("Alpha Song", 0, false)));
        let controller = controller_with(Arc::clone(&api), test_settings());
        controller.load_current_track().expect("load");

        for expected in [RepeatMode::Context, RepeatMode::Track, RepeatMode::Off] {
            assert_eq!(
                controller.on_user_action(UserAction::CycleRepeat),
                ActionOutcome::Confirmed
            );
            assert_eq!(
                controller.playback_state().repeat_mode,
                FieldState::Known(expected)
            );
        }
    }

    #[test]
    fn test_open_link_without_track_is_rejected() {
        let api = Arc::new(FakePlayerApi::with_playback(RemotePlayback::NoSession));
        let controller = controller_with(Arc::clone(&api), test_settings());

        assert!(matches!(
            controller.on_user_action(UserAction::OpenArtist),
            ActionOutcome::Rejected(_)
        ));
        assert!(api.calls().is_empty());
    }

    #[test]
    fn test_track_finished_previews_next_queued_track() {
        let api = Arc::new(FakePlayerApi::with_playback(playing("Alpha Song", 0, false)));
        api.set_queue(vec![track("q1", "Queued One", 120_000)]);
        let controller = controller_with(Arc::clone(&api), test_settings());
        controller.load_current_track().expect("load");
        let mut observer = controller.subscribe();

        controller.handle_track_finished();
        assert!(matches!(
            observer.try_recv(),
            Ok(Message::Player(PlayerEvent::TrackFinished))
        ));
        assert_eq!(controller.playback_state().track.title, "Queued One");
        assert_eq!(controller.track_position().total_ms, 120_000);
        assert_eq!(controller.poll_track_change_once(), Ok(false));
        controller.shutdown();
    }
}
