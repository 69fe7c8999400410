//! Backoff - escalating wait for idle workers
//!
//! Busy-spin first, then yield the OS thread, then sleep. Used by the work
//! pool's termination protocol and by the parallel partition while stealing.

use std::time::Duration;

/// Counters of how often each backoff stage was taken
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BackoffStats {
    pub nprocyield: u64,
    pub nosyield: u64,
    pub nsleep: u64,
}

impl BackoffStats {
    pub fn merge(&mut self, other: &BackoffStats) {
        self.nprocyield += other.nprocyield;
        self.nosyield += other.nosyield;
        self.nsleep += other.nsleep;
    }
}

/// Escalating backoff with configurable stage limits
pub struct Backoff {
    step: u32,
    spin_until: u32,
    yield_until: u32,
    spin_iters: u32,
    sleep: Duration,
}

impl Backoff {
    /// Spin for the first `spin_until` steps, yield until `yield_until`,
    /// sleep afterwards.
    pub fn new(spin_until: u32, yield_until: u32, sleep: Duration) -> Self {
        Self {
            step: 0,
            spin_until,
            yield_until,
            spin_iters: 20,
            sleep,
        }
    }

    /// Stages used when waiting for a full work buffer
    pub fn for_work_pool() -> Self {
        Self::new(10, 20, Duration::from_micros(100))
    }

    pub fn reset(&mut self) {
        self.step = 0;
    }

    pub fn step(&self) -> u32 {
        self.step
    }

    /// Wait once, escalating with each call
    pub fn snooze(&mut self, stats: &mut BackoffStats) {
        if self.step < self.spin_until {
            stats.nprocyield += 1;
            for _ in 0..self.spin_iters {
                std::hint::spin_loop();
            }
        } else if self.step < self.yield_until {
            stats.nosyield += 1;
            std::thread::yield_now();
        } else {
            stats.nsleep += 1;
            std::thread::sleep(self.sleep);
        }
        self.step = self.step.saturating_add(1);
    }
}
