//! The shared pool: SPCB array, chunk_id -> SPCB index, shared bitvector,
//! free-slot id-queue, file-set metadata, and the monotonic `head` counter.
//! Owns every SPCB for its lifetime; channels only ever hold `Arc<Spcb>`
//! references guarded by refcounting.

use crate::bitvector::SharedBitvector;
use crate::clock::NowSource;
use crate::config::PoolConfig;
use crate::error::{CoreError, Result};
use crate::fileset::FileSet;
use crate::mapper::HugePage;
use crate::spcb::Spcb;
use crate::switchboard::Switchboard;
use crossbeam::queue::ArrayQueue;
use dashmap::DashMap;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Returned by `allocate_head` when the caller has fallen too far behind
/// the pool's head and must derail.
pub struct Derailed;

/// Physical huge-page backing store, owned by the pool for its whole
/// lifetime (SPCBs only borrow a reference via `HugePage`). NVMe DMA setup
/// is out of scope; this is a plain aligned allocation standing in for a
/// hugetlbfs-backed page in the real backend.
struct OwnedHugePage {
    ptr: *mut u8,
    layout: Layout,
}

// SAFETY: ownership is exclusive to `SharedPool`; the raw pointer is only
// ever exposed read-only through `HugePage` handles.
unsafe impl Send for OwnedHugePage {}
unsafe impl Sync for OwnedHugePage {}

impl OwnedHugePage {
    fn alloc(len: usize, align: usize) -> Self {
        let layout = Layout::from_size_align(len, align).expect("valid huge page layout");
        // SAFETY: layout is non-zero sized and properly aligned.
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "huge page allocation failed");
        Self { ptr, layout }
    }

    fn handle(&self) -> HugePage {
        HugePage {
            ptr: self.ptr as *const u8,
            len: self.layout.size(),
        }
    }
}

impl Drop for OwnedHugePage {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`layout` match the allocation made in `alloc`.
        unsafe { dealloc(self.ptr, self.layout) };
    }
}

pub struct SharedPool {
    config: PoolConfig,
    clock: Arc<dyn NowSource>,
    fileset: FileSet,
    spcbs: Vec<Arc<Spcb>>,
    _backing_pages: Vec<OwnedHugePage>,
    chunk_hash: DashMap<u64, Arc<Spcb>>,
    free_slots: ArrayQueue<u32>,
    shared_bitvector: SharedBitvector,
    head: AtomicU64,
    pin: AtomicU64,
    cur_requested_chunk_count: AtomicU64,
    next_channel_id: AtomicU64,
    channel_boards: DashMap<u64, Arc<Switchboard>>,
}

impl SharedPool {
    pub fn create(fileset: FileSet, config: PoolConfig, clock: Arc<dyn NowSource>) -> Arc<Self> {
        let max_spcbs = config.max_spcbs;
        let chunk_bytes = fileset.chunk_bytes() as usize;
        let mut backing_pages = Vec::with_capacity(max_spcbs);
        let mut spcbs = Vec::with_capacity(max_spcbs);
        let free_slots = ArrayQueue::new(max_spcbs);
        for slot_idx in 0..max_spcbs {
            let page = OwnedHugePage::alloc(chunk_bytes, chunk_bytes);
            let handle = page.handle();
            backing_pages.push(page);
            spcbs.push(Arc::new(Spcb::new(slot_idx as u32, handle)));
            free_slots
                .push(slot_idx as u32)
                .expect("queue sized to max_spcbs");
        }
        let shared_bitvector = SharedBitvector::new(fileset.total_chunks());
        Arc::new(Self {
            config,
            clock,
            fileset,
            spcbs,
            _backing_pages: backing_pages,
            chunk_hash: DashMap::new(),
            free_slots,
            shared_bitvector,
            head: AtomicU64::new(0),
            pin: AtomicU64::new(1),
            cur_requested_chunk_count: AtomicU64::new(0),
            next_channel_id: AtomicU64::new(1),
            channel_boards: DashMap::new(),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn fileset(&self) -> &FileSet {
        &self.fileset
    }

    pub fn shared_bitvector(&self) -> &SharedBitvector {
        &self.shared_bitvector
    }

    pub fn total_chunks(&self) -> u64 {
        self.fileset.total_chunks()
    }

    pub fn head(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    /// Registers a channel's switchboard so the pool's average-consumption
    /// estimate can read its `avg_tsc_delta`, and bumps `pin`.
    pub fn attach(self: &Arc<Self>, board: Arc<Switchboard>) -> Result<u64> {
        let channel_id = self.next_channel_id.fetch_add(1, Ordering::AcqRel);
        self.channel_boards.insert(channel_id, board);
        self.pin.fetch_add(1, Ordering::AcqRel);
        debug!(channel_id, "attached to shared pool");
        Ok(channel_id)
    }

    /// Drops the channel's registered switchboard and decrements `pin`.
    /// Returns the new pin count; callers tear the pool down at zero.
    pub fn detach(&self, channel_id: u64) -> u64 {
        self.channel_boards.remove(&channel_id);
        let remaining = self.pin.fetch_sub(1, Ordering::AcqRel) - 1;
        debug!(channel_id, remaining, "detached from shared pool");
        remaining
    }

    pub fn pin_count(&self) -> u64 {
        self.pin.load(Ordering::Acquire)
    }

    /// Atomic fetch-add of `head`. Returns `Err(Derailed)` if the result
    /// would put the channel more than `T` chunks ahead of its own
    /// `start_chunk_id_no_mod`.
    pub fn allocate_head(
        &self,
        channel_id: u64,
        start_chunk_id_no_mod: u64,
    ) -> std::result::Result<u64, Derailed> {
        let new_head = self.head.fetch_add(1, Ordering::AcqRel);
        let total = self.fileset.total_chunks().max(1);
        if new_head > start_chunk_id_no_mod + total {
            warn!(channel_id, new_head, start_chunk_id_no_mod, "derailed: head outran channel");
            return Err(Derailed);
        }
        Ok(new_head)
    }

    /// RCU-style lookup: speculatively bumps `ref_count`, then verifies the
    /// SPCB still actually maps `chunk_id` before handing it back. Caller
    /// must `release` exactly once per successful lookup.
    pub fn lookup(&self, chunk_id: u64) -> Option<Arc<Spcb>> {
        let entry = self.chunk_hash.get(&chunk_id)?;
        let spcb = Arc::clone(entry.value());
        drop(entry);
        spcb.acquire_ref();
        if spcb.chunk_id() != chunk_id {
            spcb.release_ref();
            return None;
        }
        Some(spcb)
    }

    pub fn release(&self, spcb: &Arc<Spcb>) {
        spcb.release_ref();
    }

    /// Publishes a filled SPCB into the pool hash and marks it valid in the
    /// shared bitvector. Precondition: `spcb.chunk_size()` is already set.
    pub fn publish(&self, spcb: Arc<Spcb>) {
        debug_assert!(spcb.chunk_size() > 0, "publish requires a filled SPCB");
        let chunk_id = spcb.chunk_id();
        spcb.set_shared(true);
        spcb.set_used(true);
        self.chunk_hash.insert(chunk_id, spcb);
        self.shared_bitvector.publish(chunk_id);
        let now = self.clock.now_ns();
        let deadline = self.compute_expiration(now);
        if let Some(entry) = self.chunk_hash.get(&chunk_id) {
            entry.value().set_exp_deadline_ns(deadline);
        }
        trace!(chunk_id, deadline, "published SPCB to shared pool");
    }

    /// Dequeues a free huge-page slot, if any.
    pub fn acquire_free_slot(&self) -> Option<Arc<Spcb>> {
        let slot_idx = self.free_slots.pop()?;
        Some(Arc::clone(&self.spcbs[slot_idx as usize]))
    }

    pub fn return_free_slot(&self, slot_idx: u32) {
        let _ = self.free_slots.push(slot_idx);
    }

    /// Walks `contribute` front-to-back, reclaiming every SPCB that
    /// satisfies R3, stopping at the first one that doesn't (so the scan
    /// stays bounded and FIFO-fair across channels).
    pub fn reclaim_candidates(&self, contribute: &mut VecDeque<Arc<Spcb>>) -> usize {
        let now = self.clock.now_ns();
        let mut reclaimed = 0;
        while let Some(spcb) = contribute.front() {
            spcb.begin_reclaim_inspection(now);
            let reclaimable = spcb.is_reclaimable(now);
            if !reclaimable {
                spcb.end_reclaim_inspection();
                break;
            }
            let spcb = contribute.pop_front().unwrap();
            let chunk_id = spcb.chunk_id();
            self.chunk_hash.remove(&chunk_id);
            self.shared_bitvector.clear(chunk_id);
            let slot_idx = spcb.slot_idx;
            spcb.reset_after_reclaim();
            self.free_slots.push(slot_idx).ok();
            reclaimed += 1;
            trace!(chunk_id, slot_idx, "reclaimed SPCB");
        }
        if reclaimed > 0 {
            debug!(reclaimed, "reclaim sweep complete");
        }
        reclaimed
    }

    /// Exponential moving average per-chunk consumption time across every
    /// attached channel, converted to nanoseconds.
    pub fn average_consumption_ns(&self) -> u64 {
        if self.channel_boards.is_empty() {
            return self.config.jiffy_ns;
        }
        let mut total = 0u128;
        let mut count = 0u128;
        for entry in self.channel_boards.iter() {
            let tsc_delta = entry.value().avg_tsc_delta.load(Ordering::Relaxed);
            if tsc_delta > 0 {
                total += tsc_delta as u128;
                count += 1;
            }
        }
        if count == 0 {
            return self.config.jiffy_ns;
        }
        let avg_tsc = (total / count) as f64;
        ((avg_tsc * self.config.tsc_to_ns).round() as u64).max(1)
    }

    /// `L = max(1, jiffy_ns / ū)`: consumable chunks per jiffy at the
    /// pool-wide average consumption rate.
    pub fn consumable_chunks_per_jiffy(&self) -> u64 {
        let avg_ns = self.average_consumption_ns();
        (self.config.jiffy_ns / avg_ns).max(1)
    }

    /// `exp_deadline = now + max(4 jiffies, ceil(2u/jiffy_ns))`.
    fn compute_expiration(&self, now_ns: u64) -> u64 {
        let avg_ns = self.average_consumption_ns();
        let min_window = self.config.min_expiration_jiffies * self.config.jiffy_ns;
        let safety_window = (2 * avg_ns).div_ceil(self.config.jiffy_ns) * self.config.jiffy_ns;
        now_ns + min_window.max(safety_window)
    }

    /// Atomically admits `count` more outstanding I/O requests if doing so
    /// still keeps the channel under the watermark; rolls back and returns
    /// `false` otherwise. Prevents herd I/O across many channels chasing
    /// the same head.
    pub fn try_admit_io(&self, distance_from_head: u64, watermark: u64) -> bool {
        let reserved = self.cur_requested_chunk_count.fetch_add(1, Ordering::AcqRel) + 1;
        if distance_from_head + reserved < watermark {
            true
        } else {
            self.cur_requested_chunk_count.fetch_sub(1, Ordering::AcqRel);
            false
        }
    }

    pub fn release_io_admission(&self) {
        self.cur_requested_chunk_count.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn now_ns(&self) -> u64 {
        self.clock.now_ns()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;

    fn make_pool(total_bytes: u64) -> Arc<SharedPool> {
        let fileset = FileSet::new(&[(1, total_bytes)], 2 * 1024 * 1024);
        SharedPool::create(fileset, PoolConfig::default(), Arc::new(FakeClock::new()))
    }

    #[test]
    fn publish_then_lookup_round_trips() {
        let pool = make_pool(4 * 1024 * 1024);
        let spcb = pool.acquire_free_slot().unwrap();
        spcb.set_chunk_id(0);
        spcb.set_chunk_size(2 * 1024 * 1024);
        pool.publish(Arc::clone(&spcb));

        let found = pool.lookup(0).expect("published chunk should be found");
        assert_eq!(found.chunk_id(), 0);
        assert_eq!(found.ref_count(), 1);
        pool.release(&found);
        assert_eq!(found.ref_count(), 0);
    }

    #[test]
    fn lookup_miss_does_not_leak_refcount() {
        let pool = make_pool(4 * 1024 * 1024);
        assert!(pool.lookup(0).is_none());
    }

    #[test]
    fn reclaim_stops_at_first_unreclaimable() {
        let pool = make_pool(8 * 1024 * 1024);
        let mut contribute = VecDeque::new();

        let a = pool.acquire_free_slot().unwrap();
        a.set_chunk_id(0);
        a.set_chunk_size(2 * 1024 * 1024);
        pool.publish(Arc::clone(&a));
        a.set_exp_deadline_ns(0); // never expires in this test
        contribute.push_back(a);

        let reclaimed = pool.reclaim_candidates(&mut contribute);
        assert_eq!(reclaimed, 0);
        assert_eq!(contribute.len(), 1);
    }

    #[test]
    fn head_allocation_is_strictly_monotone() {
        let pool = make_pool(4 * 1024 * 1024);
        let h1 = pool.allocate_head(1, 0).unwrap();
        let h2 = pool.allocate_head(1, 0).unwrap();
        assert!(h2 > h1);
    }

    #[test]
    fn derails_when_head_outruns_channel() {
        let fileset = FileSet::new(&[(1, 4 * 2 * 1024 * 1024)], 2 * 1024 * 1024); // T=4
        let pool = SharedPool::create(fileset, PoolConfig::default(), Arc::new(FakeClock::new()));
        for _ in 0..6 {
            let _ = pool.allocate_head(1, 0);
        }
        assert!(pool.allocate_head(1, 0).is_err());
    }
}
