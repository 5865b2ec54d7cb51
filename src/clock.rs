//! Monotonic nanosecond clock, relative to an arbitrary epoch fixed at
//! pool creation. Keeps every deadline comparison in the core a plain `u64`
//! rather than threading `Instant`s through atomics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Abstracts "current monotonic nanosecond time" so the pool's expiration
/// math can be driven by a deterministic clock in tests.
pub trait NowSource: Send + Sync {
    fn now_ns(&self) -> u64;
}

pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self { epoch: Instant::now() }
    }

    pub fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

impl NowSource for Clock {
    fn now_ns(&self) -> u64 {
        self.now_ns()
    }
}

/// Test clock with an explicitly advanceable logical time, so expiry tests
/// don't depend on wall-clock sleeps.
pub struct FakeClock {
    now_ns: AtomicU64,
}

impl FakeClock {
    pub fn new() -> Self {
        Self { now_ns: AtomicU64::new(0) }
    }

    pub fn now_ns(&self) -> u64 {
        self.now_ns.load(Ordering::Relaxed)
    }

    pub fn advance_ns(&self, delta: u64) {
        self.now_ns.fetch_add(delta, Ordering::Relaxed);
    }
}

impl NowSource for FakeClock {
    fn now_ns(&self) -> u64 {
        self.now_ns()
    }
}
