//! # Clock
//!
//! One time source for the whole node. The clock captures the wall-clock
//! epoch once at construction and advances it with `Instant`, so every
//! `now_ms()` reading is epoch-shaped (comparable across nodes and
//! harness runs) but monotonic within the process — NTP slews cannot make
//! a peer's `last_seen_ms` jump backwards mid-experiment.
//!
//! Everything below the runtime takes `now_ms` as a plain argument, which
//! is what makes the liveness and eviction logic testable on a virtual
//! clock. The `Clock` itself only appears at the runtime boundary.

use std::time::Instant;

/// Monotonic millisecond clock anchored to the wall-clock epoch.
#[derive(Debug, Clone)]
pub struct Clock {
    /// Monotonic anchor captured at construction.
    start: Instant,
    /// Wall-clock epoch milliseconds at `start`.
    epoch_base_ms: u64,
}

impl Clock {
    /// Creates a clock anchored to the current wall-clock time.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            epoch_base_ms: chrono::Utc::now().timestamp_millis() as u64,
        }
    }

    /// Current time as epoch milliseconds. Monotonic: successive calls
    /// never decrease.
    pub fn now_ms(&self) -> u64 {
        self.epoch_base_ms + self.start.elapsed().as_millis() as u64
    }

    /// Milliseconds elapsed since the clock was created.
    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_ms_is_monotonic() {
        let clock = Clock::new();
        let a = clock.now_ms();
        let b = clock.now_ms();
        assert!(b >= a);
    }

    #[test]
    fn now_ms_is_epoch_shaped() {
        // Any reading taken after 2020 must be a 13-digit epoch value.
        let clock = Clock::new();
        assert!(clock.now_ms() > 1_577_836_800_000);
    }
}
