//! Local playback clock interpolating between remote polls.
//!
//! A tick thread advances elapsed time once per second, requests a remote
//! resync every few ticks, and reports the end of the track one tick early.
//! An animation thread republishes the 0-100 % position for smooth progress
//! bars. Both threads capture the clock generation when they are spawned and
//! exit as soon as it moves, so a reset never leaks a scheduled callback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use log::{debug, trace};

use crate::playback_state::TrackPosition;

/// Elapsed time added by one tick.
pub const TICK_STEP_MS: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockState {
    Idle,
    Running,
    Paused,
    EndReached,
}

/// Wall-clock pacing of the tick and animation threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockTiming {
    pub tick_interval: Duration,
    pub animation_interval: Duration,
    pub resync_every_ticks: u32,
}

impl Default for ClockTiming {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(TICK_STEP_MS),
            animation_interval: Duration::from_millis(TICK_STEP_MS),
            resync_every_ticks: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Advanced,
    ResyncDue,
    EndReached,
    /// The clock was not running.
    Ignored,
}

/// Progress sample handed to the progress callback.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockProgress {
    pub position: TrackPosition,
    pub percent: f32,
}

/// Pure tick arithmetic, independent of threads and wall time.
#[derive(Debug, Clone)]
pub struct ClockTimeline {
    position: TrackPosition,
    state: ClockState,
    ticks_since_resync: u32,
    resync_every_ticks: u32,
}

impl ClockTimeline {
    pub fn new(resync_every_ticks: u32) -> Self {
        Self {
            position: TrackPosition::default(),
            state: ClockState::Idle,
            ticks_since_resync: 0,
            resync_every_ticks,
        }
    }

    pub fn position(&self) -> TrackPosition {
        self.position
    }

    pub fn state(&self) -> ClockState {
        self.state
    }

    pub fn set_position(&mut self, position: TrackPosition) {
        self.position = TrackPosition::new(position.elapsed_ms, position.total_ms);
    }

    pub fn set_state(&mut self, state: ClockState) {
        if state == ClockState::Running && self.state != ClockState::Running {
            self.ticks_since_resync = 0;
        }
        self.state = state;
    }

    fn ends_within_one_tick(position: TrackPosition) -> bool {
        position.total_ms > 0 && position.elapsed_ms + TICK_STEP_MS >= position.total_ms
    }

    /// Advances one tick. The end is detected before advancing, so the clock
    /// stops one tick short of the nominal total.
    pub fn tick(&mut self) -> TickOutcome {
        if self.state != ClockState::Running {
            return TickOutcome::Ignored;
        }
        if Self::ends_within_one_tick(self.position) {
            self.state = ClockState::EndReached;
            return TickOutcome::EndReached;
        }

        // Round up to the next whole second so a mid-second seek realigns.
        self.position.elapsed_ms = (self.position.elapsed_ms / TICK_STEP_MS + 1) * TICK_STEP_MS;
        self.ticks_since_resync += 1;

        if self.resync_every_ticks > 0
            && self.ticks_since_resync >= self.resync_every_ticks
            && !Self::ends_within_one_tick(self.position)
        {
            self.ticks_since_resync = 0;
            return TickOutcome::ResyncDue;
        }
        TickOutcome::Advanced
    }
}

type FinishedCallback = Arc<dyn Fn() + Send + Sync>;
type ProgressCallback = Arc<dyn Fn(ClockProgress) + Send + Sync>;
type ResyncCallback = Arc<dyn Fn() -> Option<TrackPosition> + Send + Sync>;

#[derive(Default)]
struct ClockCallbacks {
    finished: Option<FinishedCallback>,
    progress: Option<ProgressCallback>,
    resync: Option<ResyncCallback>,
}

struct ClockShared {
    timeline: Mutex<ClockTimeline>,
    generation: AtomicU64,
    timing: ClockTiming,
    callbacks: Mutex<ClockCallbacks>,
}

impl ClockShared {
    fn lock_timeline(&self) -> MutexGuard<'_, ClockTimeline> {
        match self.timeline.lock() {
            Ok(timeline) => timeline,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_callbacks(&self) -> MutexGuard<'_, ClockCallbacks> {
        match self.callbacks.lock() {
            Ok(callbacks) => callbacks,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }
}

/// Thread-backed clock driving a [`ClockTimeline`].
#[derive(Clone)]
pub struct PlaybackClock {
    shared: Arc<ClockShared>,
}

impl PlaybackClock {
    pub fn new(timing: ClockTiming) -> Self {
        Self {
            shared: Arc::new(ClockShared {
                timeline: Mutex::new(ClockTimeline::new(timing.resync_every_ticks)),
                generation: AtomicU64::new(0),
                timing,
                callbacks: Mutex::new(ClockCallbacks::default()),
            }),
        }
    }

    /// Invoked once per track when the end is detected.
    pub fn set_finished_callback<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.lock_callbacks().finished = Some(Arc::new(callback));
    }

    pub fn set_progress_callback<F>(&self, callback: F)
    where
        F: Fn(ClockProgress) + Send + Sync + 'static,
    {
        self.shared.lock_callbacks().progress = Some(Arc::new(callback));
    }

    /// Supplies an authoritative position on resync; `None` keeps the local one.
    pub fn set_resync_callback<F>(&self, callback: F)
    where
        F: Fn() -> Option<TrackPosition> + Send + Sync + 'static,
    {
        self.shared.lock_callbacks().resync = Some(Arc::new(callback));
    }

    pub fn position(&self) -> TrackPosition {
        self.shared.lock_timeline().position()
    }

    pub fn state(&self) -> ClockState {
        self.shared.lock_timeline().state()
    }

    pub fn progress_percent(&self) -> f32 {
        self.position().progress_percent()
    }

    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    /// Moves the clock into `state` under a new generation. Must be called
    /// with the timeline lock held so no tick observes a half-applied change.
    fn advance_generation(&self, timeline: &mut ClockTimeline, state: ClockState) -> u64 {
        timeline.set_state(state);
        self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Starts ticking from the current position.
    pub fn start(&self) {
        let generation = {
            let mut timeline = self.shared.lock_timeline();
            self.advance_generation(&mut timeline, ClockState::Running)
        };
        self.spawn_loops(generation);
    }

    /// Seeds the position loaded from the remote player and starts ticking.
    pub fn start_from(&self, position: TrackPosition) {
        let generation = {
            let mut timeline = self.shared.lock_timeline();
            timeline.set_position(position);
            self.advance_generation(&mut timeline, ClockState::Running)
        };
        debug!(
            "PlaybackClock: running from {}ms of {}ms",
            position.elapsed_ms, position.total_ms
        );
        self.spawn_loops(generation);
    }

    /// Resumes ticking when paused; a running clock is left alone.
    pub fn resume(&self) {
        if self.state() != ClockState::Running {
            self.start();
        }
    }

    /// Cancels pending ticks without touching elapsed time.
    pub fn stop_timer(&self) {
        let mut timeline = self.shared.lock_timeline();
        let next_state = match timeline.state() {
            ClockState::Idle => ClockState::Idle,
            ClockState::EndReached => ClockState::EndReached,
            ClockState::Running | ClockState::Paused => ClockState::Paused,
        };
        self.advance_generation(&mut timeline, next_state);
    }

    /// Holds the clock at `position` without ticking.
    pub fn pause_at(&self, position: TrackPosition) {
        let mut timeline = self.shared.lock_timeline();
        timeline.set_position(position);
        self.advance_generation(&mut timeline, ClockState::Paused);
    }

    /// Zeroes elapsed time and immediately starts a fresh running cycle.
    pub fn reset(&self) {
        self.reset_to(None);
    }

    /// Like [`reset`](Self::reset), optionally replacing the total.
    pub fn reset_to(&self, total_ms: Option<u64>) {
        let generation = {
            let mut timeline = self.shared.lock_timeline();
            let total_ms = total_ms.unwrap_or(timeline.position().total_ms);
            timeline.set_position(TrackPosition::new(0, total_ms));
            self.advance_generation(&mut timeline, ClockState::Idle);
            self.advance_generation(&mut timeline, ClockState::Running)
        };
        self.spawn_loops(generation);
    }

    /// Moves elapsed time; a running clock restarts its tick schedule.
    pub fn seek_to(&self, elapsed_ms: u64) {
        let running_generation = {
            let mut timeline = self.shared.lock_timeline();
            let total_ms = timeline.position().total_ms;
            timeline.set_position(TrackPosition::new(elapsed_ms, total_ms));
            match timeline.state() {
                ClockState::Running | ClockState::EndReached => {
                    Some(self.advance_generation(&mut timeline, ClockState::Running))
                }
                ClockState::Idle | ClockState::Paused => None,
            }
        };
        if let Some(generation) = running_generation {
            self.spawn_loops(generation);
        }
    }

    pub fn set_total(&self, total_ms: u64) {
        let mut timeline = self.shared.lock_timeline();
        let elapsed_ms = timeline.position().elapsed_ms;
        timeline.set_position(TrackPosition::new(elapsed_ms, total_ms));
    }

    /// Stops every loop and returns to idle.
    pub fn cancel(&self) {
        let mut timeline = self.shared.lock_timeline();
        self.advance_generation(&mut timeline, ClockState::Idle);
    }

    fn spawn_loops(&self, generation: u64) {
        let tick_shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("playback-clock-tick".to_string())
            .spawn(move || run_tick_loop(tick_shared, generation));
        if let Err(err) = spawned {
            log::error!("PlaybackClock: failed to spawn tick thread: {}", err);
            return;
        }

        let animation_shared = Arc::clone(&self.shared);
        if let Err(err) = thread::Builder::new()
            .name("playback-clock-animation".to_string())
            .spawn(move || run_animation_loop(animation_shared, generation))
        {
            log::error!("PlaybackClock: failed to spawn animation thread: {}", err);
        }
    }
}

fn first_tick_delay(tick_interval: Duration, elapsed_ms: u64) -> Duration {
    let remainder = elapsed_ms % TICK_STEP_MS;
    if remainder == 0 {
        return tick_interval;
    }
    tick_interval.mul_f64((TICK_STEP_MS - remainder) as f64 / TICK_STEP_MS as f64)
}

fn run_tick_loop(shared: Arc<ClockShared>, generation: u64) {
    let timing = shared.timing;
    let mut delay = first_tick_delay(timing.tick_interval, shared.lock_timeline().position().elapsed_ms);

    loop {
        thread::sleep(delay);
        delay = timing.tick_interval;

        let outcome = {
            let mut timeline = shared.lock_timeline();
            if !shared.is_current(generation) {
                return;
            }
            let outcome = timeline.tick();
            if outcome == TickOutcome::EndReached {
                // Retires the animation loop of this cycle along with the ticks.
                shared.generation.fetch_add(1, Ordering::SeqCst);
            }
            outcome
        };

        match outcome {
            TickOutcome::Advanced => {}
            TickOutcome::Ignored => return,
            TickOutcome::EndReached => {
                debug!("PlaybackClock: end of track reached");
                let finished = shared.lock_callbacks().finished.clone();
                if let Some(finished) = finished {
                    finished();
                }
                return;
            }
            TickOutcome::ResyncDue => {
                let resync = shared.lock_callbacks().resync.clone();
                let Some(resync) = resync else {
                    continue;
                };
                trace!("PlaybackClock: resync requested");
                if let Some(remote) = resync() {
                    let mut timeline = shared.lock_timeline();
                    if !shared.is_current(generation) {
                        return;
                    }
                    timeline.set_position(remote);
                    delay = first_tick_delay(timing.tick_interval, remote.elapsed_ms);
                }
            }
        }
    }
}

fn run_animation_loop(shared: Arc<ClockShared>, generation: u64) {
    loop {
        let position = {
            let timeline = shared.lock_timeline();
            if !shared.is_current(generation) {
                return;
            }
            timeline.position()
        };

        let progress = shared.lock_callbacks().progress.clone();
        if let Some(progress) = progress {
            progress(ClockProgress {
                position,
                percent: position.progress_percent(),
            });
        }
        if position.total_ms > 0 && position.elapsed_ms >= position.total_ms {
            return;
        }
        thread::sleep(shared.timing.animation_interval);
    }
}
