//! Scheduler clock.
//!
//! The core never reads hardware time. The embedder (timer IRQ path or
//! the test harness) advances a per-device monotonic counter and the
//! scheduler derives everything from it: ticks for deadlines and
//! timeouts, microseconds for the peak-rate estimator.

/// Ticks per second (1 tick = 1 ms).
pub const TICK_HZ: u64 = 1000;

/// Monotonic clock owned by one scheduler instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct Clock {
    now_us: u64,
}

impl Clock {
    pub const fn new() -> Self {
        Self { now_us: 0 }
    }

    /// Advance the clock. Called from the embedder's timer path.
    pub fn advance_us(&mut self, delta_us: u64) {
        self.now_us = self.now_us.saturating_add(delta_us);
    }

    /// Current time in microseconds.
    pub fn now_us(&self) -> u64 {
        self.now_us
    }

    /// Current time in ticks (milliseconds).
    pub fn now_ticks(&self) -> u64 {
        self.now_us / 1000
    }
}

/// Milliseconds to ticks.
pub const fn ms_to_ticks(ms: u64) -> u64 {
    ms * TICK_HZ / 1000
}

/// Ticks to milliseconds.
pub const fn ticks_to_ms(ticks: u64) -> u64 {
    ticks * 1000 / TICK_HZ
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advance() {
        let mut c = Clock::new();
        assert_eq!(c.now_ticks(), 0);
        c.advance_us(2500);
        assert_eq!(c.now_us(), 2500);
        assert_eq!(c.now_ticks(), 2);
    }

    #[test]
    fn test_tick_conversion() {
        assert_eq!(ms_to_ticks(8), 8);
        assert_eq!(ticks_to_ms(125), 125);
    }
}
