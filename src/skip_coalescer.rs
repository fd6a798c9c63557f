//! Batches bursts of "skip next" clicks into one sequential remote flush.
//!
//! A window opens on the first click and stays open for a fixed duration
//! measured from that click. Every click inside the window adds one pending
//! skip. Once the window has elapsed the whole batch is flushed as N remote
//! skip calls issued back to back with a short delay between them.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use log::debug;

/// Outcome of registering one click.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SkipRegistration {
    /// Skips currently pending in the open window (or the running flush).
    pub pending_count: u32,
    pub starts_new_window: bool,
    /// The click landed while a flush was running and extends it.
    pub absorbed_into_flush: bool,
    /// Earliest instant at which the open window may be flushed.
    pub flush_due_at: Option<Instant>,
}

/// Result of one flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub requested: u32,
    pub succeeded: u32,
}

#[derive(Debug, Default)]
struct SkipBatch {
    pending_count: u32,
    window_started_at: Option<Instant>,
    /// Skips from windows that closed before a flush picked them up.
    closed_count: u32,
    flushing: bool,
    flush_target: u32,
}

pub struct SkipCoalescer {
    window: Duration,
    call_delay: Duration,
    batch: Mutex<SkipBatch>,
}

impl SkipCoalescer {
    pub fn new(window: Duration, call_delay: Duration) -> Self {
        Self {
            window,
            call_delay,
            batch: Mutex::new(SkipBatch::default()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    fn lock_batch(&self) -> std::sync::MutexGuard<'_, SkipBatch> {
        match self.batch.lock() {
            Ok(batch) => batch,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn register(&self) -> SkipRegistration {
        self.register_at(Instant::now())
    }

    pub fn register_at(&self, now: Instant) -> SkipRegistration {
        let mut batch = self.lock_batch();

        if batch.flushing {
            batch.flush_target += 1;
            return SkipRegistration {
                pending_count: batch.flush_target,
                starts_new_window: false,
                absorbed_into_flush: true,
                flush_due_at: None,
            };
        }

        let window_open = batch
            .window_started_at
            .is_some_and(|started| now.saturating_duration_since(started) < self.window);
        let starts_new_window = !window_open;
        if window_open {
            batch.pending_count += 1;
        } else {
            batch.closed_count += batch.pending_count;
            batch.pending_count = 1;
            batch.window_started_at = Some(now);
        }

        SkipRegistration {
            pending_count: batch.pending_count,
            starts_new_window,
            absorbed_into_flush: false,
            flush_due_at: batch.window_started_at.map(|started| started + self.window),
        }
    }

    /// Skips waiting in the open window, plus any running flush target.
    pub fn pending_count(&self) -> u32 {
        let batch = self.lock_batch();
        if batch.flushing {
            batch.flush_target
        } else {
            batch.closed_count + batch.pending_count
        }
    }

    pub fn is_flushing(&self) -> bool {
        self.lock_batch().flushing
    }

    fn take_due_batch(&self, now: Instant) -> Option<u32> {
        let mut batch = self.lock_batch();
        if batch.flushing {
            return None;
        }
        let window_elapsed = batch
            .window_started_at
            .map_or(true, |started| now.saturating_duration_since(started) >= self.window);

        let mut target = std::mem::take(&mut batch.closed_count);
        if window_elapsed {
            target += std::mem::take(&mut batch.pending_count);
            batch.window_started_at = None;
        }
        if target == 0 {
            return None;
        }
        batch.flushing = true;
        batch.flush_target = target;
        Some(target)
    }

    /// Flushes the batch when its window has elapsed.
    ///
    /// `on_start` receives the batch size before the first remote call.
    /// `skip` performs one remote skip and reports whether it was accepted.
    /// Clicks registered while this runs extend the same flush. Returns
    /// `None` when nothing was due or another flush is already running.
    pub fn flush_due<S, K>(&self, now: Instant, mut on_start: S, mut skip: K) -> Option<FlushReport>
    where
        S: FnMut(u32),
        K: FnMut() -> bool,
    {
        let initial = self.take_due_batch(now)?;
        debug!("SkipCoalescer: flushing {} skip(s)", initial);
        on_start(initial);

        let mut issued = 0;
        let mut succeeded = 0;
        loop {
            let target = self.lock_batch().flush_target;
            if issued >= target {
                break;
            }
            if issued > 0 && !self.call_delay.is_zero() {
                std::thread::sleep(self.call_delay);
            }
            if skip() {
                succeeded += 1;
            }
            issued += 1;
        }

        let mut batch = self.lock_batch();
        let requested = batch.flush_target.max(issued);
        batch.flushing = false;
        batch.flush_target = 0;
        debug!(
            "SkipCoalescer: flush finished, {}/{} skip(s) accepted",
            succeeded, requested
        );
        Some(FlushReport {
            requested,
            succeeded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::SkipCoalescer;
    use std::cell::Cell;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn coalescer() -> SkipCoalescer {
        SkipCoalescer::new(Duration::from_millis(1000), Duration::ZERO)
    }

    #[test]
    fn test_clicks_inside_window_coalesce_and_late_click_opens_new_window() {
        let coalescer = coalescer();
        let origin = Instant::now();

        let first = coalescer.register_at(origin);
        assert!(first.starts_new_window);
        assert_eq!(first.pending_count, 1);
        coalescer.register_at(origin + Duration::from_millis(200));
        let third = coalescer.register_at(origin + Duration::from_millis(400));
        assert_eq!(third.pending_count, 3);
        assert!(!third.starts_new_window);
        assert_eq!(third.flush_due_at, Some(origin + Duration::from_millis(1000)));

        let fourth = coalescer.register_at(origin + Duration::from_millis(1300));
        assert!(fourth.starts_new_window);
        assert_eq!(fourth.pending_count, 1);
    }

    #[test]
    fn test_closed_window_flushes_its_own_count_only() {
        let coalescer = coalescer();
        let origin = Instant::now();
        for offset in [0, 200, 400, 1300] {
            coalescer.register_at(origin + Duration::from_millis(offset));
        }

        let skips = Cell::new(0);
        let report = coalescer
            .flush_due(
                origin + Duration::from_millis(1350),
                |_| {},
                || {
                    skips.set(skips.get() + 1);
                    true
                },
            )
            .expect("closed window is due");
        assert_eq!(report.requested, 3);
        assert_eq!(skips.get(), 3);
        assert_eq!(coalescer.pending_count(), 1);

        let report = coalescer
            .flush_due(origin + Duration::from_millis(2300), |_| {}, || true)
            .expect("second window is due");
        assert_eq!(report.requested, 1);
        assert_eq!(coalescer.pending_count(), 0);
    }

    #[test]
    fn test_flush_waits_for_window_to_elapse() {
        let coalescer = coalescer();
        let origin = Instant::now();
        coalescer.register_at(origin);

        assert!(coalescer
            .flush_due(origin + Duration::from_millis(999), |_| {}, || true)
            .is_none());
        assert_eq!(coalescer.pending_count(), 1);
    }

    #[test]
    fn test_failed_skips_are_reported() {
        let coalescer = coalescer();
        let origin = Instant::now();
        coalescer.register_at(origin);
        coalescer.register_at(origin + Duration::from_millis(10));

        let attempt = Cell::new(0);
        let report = coalescer
            .flush_due(
                origin + Duration::from_secs(2),
                |count| assert_eq!(count, 2),
                || {
                    attempt.set(attempt.get() + 1);
                    attempt.get() == 1
                },
            )
            .expect("due");
        assert_eq!(report.requested, 2);
        assert_eq!(report.succeeded, 1);
    }

    #[test]
    fn test_clicks_during_flush_extend_the_running_flush() {
        let coalescer = Arc::new(SkipCoalescer::new(
            Duration::from_millis(1000),
            Duration::from_millis(30),
        ));
        let origin = Instant::now();
        coalescer.register_at(origin);

        let calls = Arc::new(AtomicU32::new(0));
        let worker = {
            let coalescer = Arc::clone(&coalescer);
            let calls = Arc::clone(&calls);
            std::thread::spawn(move || {
                coalescer.flush_due(
                    origin + Duration::from_secs(2),
                    |_| {},
                    || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(50));
                        true
                    },
                )
            })
        };

        let deadline = Instant::now() + Duration::from_secs(2);
        while !coalescer.is_flushing() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        let absorbed = coalescer.register_at(origin + Duration::from_secs(2));
        assert!(absorbed.absorbed_into_flush);
        assert_eq!(absorbed.pending_count, 2);
        assert!(coalescer
            .flush_due(origin + Duration::from_secs(5), |_| {}, || true)
            .is_none());

        let report = worker.join().expect("flush thread").expect("flushed");
        assert_eq!(report.requested, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!coalescer.is_flushing());
        assert_eq!(coalescer.pending_count(), 0);
    }
}
