//! Wall-clock frame limiter.
//!
//! The sleep is placed either before the present ("early", better latency)
//! or after it ("late", better power). The previous sleep's oversleep is
//! measured and subtracted from the next one, clamped to half a frame so a
//! scheduler hiccup cannot poison the compensation.

use std::sync::atomic::{AtomicBool, Ordering};

use metrics::clock;
use parking_lot::Mutex;

use super::QueueLimiter;

#[derive(Default)]
struct Inner {
    target_ns: i64,
    overhead_ns: i64,
    frame_start: i64,
    frame_end: i64,
}

pub struct FpsLimiter {
    inner: Mutex<Inner>,
    use_early: AtomicBool,
    active: AtomicBool,
    pub queue_limiter: QueueLimiter,
}

impl FpsLimiter {
    pub fn new(use_early: bool) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            use_early: AtomicBool::new(use_early),
            active: AtomicBool::new(false),
            queue_limiter: QueueLimiter::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    pub fn use_early(&self) -> bool {
        self.use_early.load(Ordering::Relaxed)
    }

    pub fn set_use_early(&self, early: bool) {
        self.use_early.store(early, Ordering::Relaxed);
    }

    pub fn target_ns(&self) -> i64 {
        self.inner.lock().target_ns
    }

    /// Update the target; 0 disables. While active the embedded queue
    /// limiter holds submissions to one frame in flight.
    pub fn set_fps_limit(&self, fps: u32) {
        let new_target = if fps == 0 {
            0
        } else {
            1_000_000_000 / fps as i64
        };
        let mut inner = self.inner.lock();
        if inner.target_ns == new_target {
            return;
        }
        inner.target_ns = new_target;
        let active = new_target > 0;
        self.active.store(active, Ordering::Relaxed);
        self.queue_limiter
            .set_max_in_flight(if active { 1 } else { 0 });
    }

    /// The per-frame sleep. Call twice per frame, once with
    /// `is_early = true` before the present and once with `false` after;
    /// only the call matching the configured placement does anything.
    pub fn limit(&self, is_early: bool) {
        if !self.is_active() || is_early != self.use_early() {
            return;
        }

        let mut inner = self.inner.lock();
        if inner.target_ns <= 0 {
            return;
        }

        inner.frame_start = clock::now_ns() as i64;
        let work = (inner.frame_start - inner.frame_end).max(0);
        let sleep = (inner.target_ns - work - inner.overhead_ns).max(0);

        if sleep > 0 {
            profiling::scope!("fps_limiter_sleep");
            let t0 = clock::now_ns() as i64;
            clock::sleep_ns(sleep as u64);
            let over = (clock::now_ns() as i64 - t0) - sleep;
            if (0..=inner.target_ns / 2).contains(&over) {
                inner.overhead_ns = over;
            }
        }

        inner.frame_end = clock::now_ns() as i64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activation_mirrors_the_target() {
        let limiter = FpsLimiter::new(false);
        assert!(!limiter.is_active());
        assert_eq!(limiter.queue_limiter.max_in_flight(), 0);

        limiter.set_fps_limit(60);
        assert!(limiter.is_active());
        assert_eq!(limiter.target_ns(), 16_666_666);
        assert_eq!(limiter.queue_limiter.max_in_flight(), 1);

        limiter.set_fps_limit(0);
        assert!(!limiter.is_active());
        assert_eq!(limiter.queue_limiter.max_in_flight(), 0);
    }

    #[test]
    fn inactive_limit_returns_immediately() {
        let limiter = FpsLimiter::new(true);
        let t0 = clock::now_ns();
        limiter.limit(true);
        limiter.limit(false);
        assert!(clock::now_ns() - t0 < 5_000_000);
    }

    #[test]
    fn mismatched_placement_is_a_no_op() {
        let limiter = FpsLimiter::new(true); // early placement
        limiter.set_fps_limit(30);
        let t0 = clock::now_ns();
        limiter.limit(false); // late call: must not sleep
        assert!(clock::now_ns() - t0 < 5_000_000);
    }

    #[test]
    fn limits_to_the_target_frame_time() {
        // 60 fps target, 5 ms of simulated work per frame. Ten frames
        // should take between 160 and 185 ms of wall time with the sleeps
        // compensating for the work.
        let limiter = FpsLimiter::new(true);
        limiter.set_fps_limit(60);

        let start = clock::now_ns();
        for _ in 0..10 {
            limiter.limit(true);
            clock::sleep_ns(5_000_000); // the frame's work
        }
        let elapsed_ms = (clock::now_ns() - start) as f64 / 1e6;
        assert!(elapsed_ms >= 160.0, "paced too fast: {elapsed_ms:.1}ms");
        assert!(elapsed_ms <= 200.0, "paced too slow: {elapsed_ms:.1}ms");
    }

    #[test]
    fn single_sleep_is_bounded() {
        // A sleep never exceeds target + target/2 even from a cold start.
        let limiter = FpsLimiter::new(true);
        limiter.set_fps_limit(100); // 10 ms target
        let t0 = clock::now_ns();
        limiter.limit(true);
        let elapsed = clock::now_ns() - t0;
        assert!(elapsed <= 15_000_000 + 5_000_000, "slept {elapsed}ns");
    }
}
