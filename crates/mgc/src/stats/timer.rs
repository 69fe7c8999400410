//! GC Timer - Phase Timing
//!
//! Nanosecond timer for the phases of a cycle. `split` returns the time
//! since the previous split, so one timer walks a whole cycle.

use std::time::{Duration, Instant};

/// GcTimer - timer for measuring a cycle and its phases
pub struct GcTimer {
    start: Instant,
    last: Instant,
}

impl GcTimer {
    /// Create new timer
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last: now,
        }
    }

    /// Time since the timer was created
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Get elapsed nanoseconds
    pub fn elapsed_ns(&self) -> u64 {
        self.elapsed().as_nanos() as u64
    }

    /// Get elapsed milliseconds
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed().as_secs_f64() * 1000.0
    }

    /// Nanoseconds since the previous split (or creation)
    pub fn split(&mut self) -> u64 {
        let now = Instant::now();
        let ns = now.duration_since(self.last).as_nanos() as u64;
        self.last = now;
        ns
    }
}

impl Default for GcTimer {
    fn default() -> Self {
        Self::new()
    }
}
