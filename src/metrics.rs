//! Stat board: read-only per-channel counters, aggregated per-pool on
//! detach. Plain atomics, no locking — this is an observability surface,
//! not a synchronization point.

use std::sync::atomic::{AtomicU64, Ordering};

#[repr(C)]
#[derive(Default)]
pub struct StatBoard {
    consumed: AtomicU64,
    io_on_track: AtomicU64,
    io_derailed: AtomicU64,
    softirq_count: AtomicU64,
    forcefully_unmapped: AtomicU64,
    num_shared_pages: AtomicU64,
    num_using_pages: AtomicU64,
    derailed_io_bytes: AtomicU64,
}

impl StatBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }
    pub fn io_on_track(&self) -> u64 {
        self.io_on_track.load(Ordering::Relaxed)
    }
    pub fn io_derailed(&self) -> u64 {
        self.io_derailed.load(Ordering::Relaxed)
    }
    pub fn softirq_count(&self) -> u64 {
        self.softirq_count.load(Ordering::Relaxed)
    }
    pub fn forcefully_unmapped(&self) -> u64 {
        self.forcefully_unmapped.load(Ordering::Relaxed)
    }
    pub fn num_shared_pages(&self) -> u64 {
        self.num_shared_pages.load(Ordering::Relaxed)
    }
    pub fn num_using_pages(&self) -> u64 {
        self.num_using_pages.load(Ordering::Relaxed)
    }
    pub fn derailed_io_bytes(&self) -> u64 {
        self.derailed_io_bytes.load(Ordering::Relaxed)
    }

    pub fn record_consumed(&self) {
        self.consumed.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_io_on_track(&self) {
        self.io_on_track.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_io_derailed(&self, bytes: u64) {
        self.io_derailed.fetch_add(1, Ordering::Relaxed);
        self.derailed_io_bytes.fetch_add(bytes, Ordering::Relaxed);
    }
    pub fn record_softirq(&self) {
        self.softirq_count.fetch_add(1, Ordering::Relaxed);
    }
    pub fn record_forceful_unmap(&self) {
        self.forcefully_unmapped.fetch_add(1, Ordering::Relaxed);
    }
    pub fn set_shared_pages(&self, n: u64) {
        self.num_shared_pages.store(n, Ordering::Relaxed);
    }
    pub fn set_using_pages(&self, n: u64) {
        self.num_using_pages.store(n, Ordering::Relaxed);
    }

    /// Plain-value copy for handing counters across the host boundary
    /// without exposing the atomics themselves.
    pub fn snapshot(&self) -> ChannelStatsSnapshot {
        ChannelStatsSnapshot {
            consumed: self.consumed(),
            io_on_track: self.io_on_track(),
            io_derailed: self.io_derailed(),
            softirq_count: self.softirq_count(),
            forcefully_unmapped: self.forcefully_unmapped(),
            num_shared_pages: self.num_shared_pages(),
            num_using_pages: self.num_using_pages(),
            derailed_io_bytes: self.derailed_io_bytes(),
        }
    }
}

/// Read-only copy of a channel's [`StatBoard`] for crossing the host
/// boundary (the live board stays behind the channel's atomics).
#[derive(Debug, Default, Clone, Copy)]
pub struct ChannelStatsSnapshot {
    pub consumed: u64,
    pub io_on_track: u64,
    pub io_derailed: u64,
    pub softirq_count: u64,
    pub forcefully_unmapped: u64,
    pub num_shared_pages: u64,
    pub num_using_pages: u64,
    pub derailed_io_bytes: u64,
}

/// Pool-wide aggregate, built by summing channel stat boards on detach.
#[derive(Debug, Default, Clone, Copy)]
pub struct PoolStatsSnapshot {
    pub total_consumed: u64,
    pub total_io_on_track: u64,
    pub total_io_derailed: u64,
    pub total_forcefully_unmapped: u64,
}

impl PoolStatsSnapshot {
    pub fn accumulate(&mut self, board: &StatBoard) {
        self.total_consumed += board.consumed();
        self.total_io_on_track += board.io_on_track();
        self.total_io_derailed += board.io_derailed();
        self.total_forcefully_unmapped += board.forcefully_unmapped();
    }
}
