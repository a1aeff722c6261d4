//! Idle strategies for duty-cycle loops.
//!
//! Nothing on the data path blocks: full rings, unfree partitions and
//! pending responses come back as immediate statuses. Callers decide how to
//! wait before retrying, and these strategies package the usual choices.
//!
//! `idle(work_count)` resets back-off whenever work was done.

use std::time::Duration;

/// Policy for waiting between attempts when no work was done.
pub trait IdleStrategy: Send {
    /// Idle based on how much work the last cycle did.
    fn idle(&mut self, work_count: usize) {
        if work_count > 0 {
            self.reset();
        } else {
            self.idle_once();
        }
    }

    /// Idle unconditionally for one step.
    fn idle_once(&mut self);

    /// Forget any accumulated back-off.
    fn reset(&mut self) {}
}

/// Never waits.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpIdle;

impl IdleStrategy for NoOpIdle {
    fn idle_once(&mut self) {}
}

/// Spin with a CPU hint.
#[derive(Debug, Default, Clone, Copy)]
pub struct BusySpinIdle;

impl IdleStrategy for BusySpinIdle {
    fn idle_once(&mut self) {
        std::hint::spin_loop();
    }
}

/// Yield the thread to the scheduler.
#[derive(Debug, Default, Clone, Copy)]
pub struct YieldingIdle;

impl IdleStrategy for YieldingIdle {
    fn idle_once(&mut self) {
        std::thread::yield_now();
    }
}

/// Sleep for a fixed period.
#[derive(Debug, Clone, Copy)]
pub struct SleepingIdle {
    period: Duration,
}

impl SleepingIdle {
    pub fn new(period: Duration) -> Self {
        Self { period }
    }
}

impl Default for SleepingIdle {
    fn default() -> Self {
        Self::new(Duration::from_millis(1))
    }
}

impl IdleStrategy for SleepingIdle {
    fn idle_once(&mut self) {
        std::thread::sleep(self.period);
    }
}

/// Spin, then yield, then park with an exponentially growing timeout.
#[derive(Debug, Clone)]
pub struct BackoffIdle {
    max_spins: u32,
    max_yields: u32,
    min_park: Duration,
    max_park: Duration,
    spins: u32,
    yields: u32,
    park: Duration,
}

impl BackoffIdle {
    pub fn new(max_spins: u32, max_yields: u32, min_park: Duration, max_park: Duration) -> Self {
        Self {
            max_spins,
            max_yields,
            min_park,
            max_park,
            spins: 0,
            yields: 0,
            park: min_park,
        }
    }
}

impl Default for BackoffIdle {
    fn default() -> Self {
        Self::new(10, 20, Duration::from_micros(1), Duration::from_millis(1))
    }
}

impl IdleStrategy for BackoffIdle {
    fn idle_once(&mut self) {
        if self.spins < self.max_spins {
            self.spins += 1;
            std::hint::spin_loop();
        } else if self.yields < self.max_yields {
            self.yields += 1;
            std::thread::yield_now();
        } else {
            std::thread::park_timeout(self.park);
            self.park = (self.park * 2).min(self.max_park);
        }
    }

    fn reset(&mut self) {
        self.spins = 0;
        self.yields = 0;
        self.park = self.min_park;
    }
}
