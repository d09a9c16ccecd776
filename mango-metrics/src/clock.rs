//! Monotonic nanosecond clock.
//!
//! Pacing, frame statistics and the logger all share this one source so
//! their timestamps can be compared directly.

/// Current `CLOCK_MONOTONIC` reading in nanoseconds.
#[cfg(unix)]
pub fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // clock_gettime only fails for invalid clock ids.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

#[cfg(not(unix))]
pub fn now_ns() -> u64 {
    use std::time::Instant;
    use once_cell::sync::Lazy;
    static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);
    EPOCH.elapsed().as_nanos() as u64
}

/// Sleep for `ns` nanoseconds.
pub fn sleep_ns(ns: u64) {
    std::thread::sleep(std::time::Duration::from_nanos(ns));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_monotonic() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
    }

    #[test]
    fn sleep_advances_clock() {
        let a = now_ns();
        sleep_ns(2_000_000);
        assert!(now_ns() - a >= 2_000_000);
    }
}
