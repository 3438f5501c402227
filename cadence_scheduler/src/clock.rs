//! Injectable monotonic time.
//!
//! The scheduler never reads wall-clock time. Production code uses
//! [`MonotonicClock`]; tests drive a [`ManualClock`] by hand.

use std::cell::Cell;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Monotonic microsecond timestamps.
pub trait TimeSource {
    fn now_us(&self) -> u64;
}

/// Microseconds since construction, from `Instant`.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicClock {
    fn now_us(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_micros()).unwrap_or(u64::MAX)
    }
}

/// Hand-driven clock. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now_us: Rc<Cell<u64>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_us(&self, now_us: u64) {
        self.now_us.set(now_us);
    }

    pub fn advance(&self, by: Duration) {
        self.now_us
            .set(self.now_us.get().saturating_add(duration_to_us(by)));
    }
}

impl TimeSource for ManualClock {
    fn now_us(&self) -> u64 {
        self.now_us.get()
    }
}

pub(crate) fn duration_to_us(duration: Duration) -> u64 {
    u64::try_from(duration.as_micros()).unwrap_or(u64::MAX)
}

pub(crate) fn us_to_ms(us: u64) -> f64 {
    us as f64 / 1000.0
}
