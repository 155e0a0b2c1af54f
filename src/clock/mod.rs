//! Monotonic clock and hybrid sleep/spin wait
//!
//! All timestamps are [`Instant`]s: monotonic, comparable only within one
//! process run, unaffected by wall-clock adjustment.
//!
//! `wait_until` sleeps while plenty of time remains and spins for the final
//! few milliseconds. The spin phase makes no syscalls and does not allocate.

pub mod main_loop;

pub use main_loop::{LoopHandle, MainLoop};

use std::time::{Duration, Instant};

use crate::config::TimingConfig;

/// Clock carrying the wait thresholds. Cheap to copy into worker threads.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    spin_threshold: Duration,
    sleep_margin: Duration,
    min_prep_time: Duration,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new(&TimingConfig::default())
    }
}

impl Clock {
    pub fn new(config: &TimingConfig) -> Self {
        Self {
            spin_threshold: config.spin_threshold(),
            sleep_margin: config.sleep_margin(),
            min_prep_time: config.min_prep_time(),
        }
    }

    /// Current monotonic instant
    #[inline]
    pub fn now(&self) -> Instant {
        Instant::now()
    }

    /// `now() + prep_time`. Short lead times are allowed but flagged.
    pub fn target_after(&self, prep_time: Duration) -> Instant {
        self.warn_if_short(prep_time);
        self.now() + prep_time
    }

    /// Same as [`Clock::target_after`] but relative to an instant already read
    pub fn target_from(&self, base: Instant, prep_time: Duration) -> Instant {
        self.warn_if_short(prep_time);
        base + prep_time
    }

    fn warn_if_short(&self, prep_time: Duration) {
        if prep_time < self.min_prep_time {
            tracing::warn!(
                "prep_time={:.1}ms is below {:.1}ms, synchronization quality may be degraded",
                as_ms(prep_time),
                as_ms(self.min_prep_time)
            );
        }
    }

    /// Block the calling thread until `target` and return the instant observed on exit.
    ///
    /// Returns immediately when `target` has already passed. Not interruptible.
    pub fn wait_until(&self, target: Instant) -> Instant {
        let coarse_limit = self.spin_threshold + self.sleep_margin;

        loop {
            let now = Instant::now();
            if now >= target {
                return now;
            }
            let remaining = target - now;
            if remaining <= coarse_limit {
                break;
            }
            std::thread::sleep(remaining - self.spin_threshold);
        }

        loop {
            let now = Instant::now();
            if now >= target {
                return now;
            }
            std::hint::spin_loop();
        }
    }

    /// Time left until `target`, zero once it has passed
    pub fn remaining(&self, target: Instant) -> Duration {
        target.saturating_duration_since(self.now())
    }

    pub fn spin_threshold(&self) -> Duration {
        self.spin_threshold
    }

    /// Point before `target` after which no coarse sleep is taken
    pub fn coarse_limit(&self) -> Duration {
        self.spin_threshold + self.sleep_margin
    }
}

/// Current monotonic instant
#[inline]
pub fn now() -> Instant {
    Instant::now()
}

/// [`Clock::wait_until`] with default thresholds
pub fn wait_until(target: Instant) -> Instant {
    Clock::default().wait_until(target)
}

/// Signed difference `actual - target` in milliseconds
pub fn signed_ms(actual: Instant, target: Instant) -> f64 {
    if actual >= target {
        as_ms(actual - target)
    } else {
        -as_ms(target - actual)
    }
}

/// Duration in fractional milliseconds
#[inline]
pub fn as_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Raises the OS timer resolution to 1 ms while alive.
///
/// Coarse sleeps on Windows otherwise round up to the 15.6 ms tick. No-op elsewhere.
pub struct TimerResolutionGuard {
    #[cfg(target_os = "windows")]
    active: bool,
}

impl TimerResolutionGuard {
    pub fn new() -> Self {
        #[cfg(target_os = "windows")]
        {
            // SAFETY: timeBeginPeriod has no memory-safety preconditions.
            let result = unsafe { windows::Win32::Media::timeBeginPeriod(1) };
            Self { active: result == 0 }
        }
        #[cfg(not(target_os = "windows"))]
        {
            Self {}
        }
    }
}

impl Default for TimerResolutionGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerResolutionGuard {
    fn drop(&mut self) {
        #[cfg(target_os = "windows")]
        if self.active {
            // SAFETY: paired with the successful timeBeginPeriod(1) above.
            unsafe {
                windows::Win32::Media::timeEndPeriod(1);
            }
        }
    }
}
