//! Per-channel state: the `Init -> OnTrack <-> Derailed -> Closed` state
//! machine, the consume indicator used to translate logical chunk ids into
//! file offsets, and the local bitvector/contribute-array bookkeeping the
//! firehose controller drives.

use crate::bitvector::{LocalBitvector, COMPLETE};
use crate::config::ChannelConfig;
use crate::error::{CoreError, Result};
use crate::ghost_table::GhostTable;
use crate::mapper::{GhostMapper, HugePage};
use crate::metrics::StatBoard;
use crate::pool::SharedPool;
use crate::spcb::Spcb;
use crate::switchboard::Switchboard;
use crossbeam::queue::ArrayQueue;
use parking_lot::Mutex;
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Physical backing for one of a derailed channel's private huge pages.
/// Unlike pool-owned pages these are never shared, so no refcounting beyond
/// the channel's own ghost-table slot applies.
struct OwnedHugePage {
    ptr: *mut u8,
    layout: Layout,
}

// SAFETY: exclusively owned by one `ChannelLocal`; only read through the
// mapped VA window by that channel's consumer.
unsafe impl Send for OwnedHugePage {}
unsafe impl Sync for OwnedHugePage {}

impl OwnedHugePage {
    fn alloc(len: usize, align: usize) -> Self {
        let layout = Layout::from_size_align(len, align).expect("valid local buffer layout");
        // SAFETY: layout is non-zero sized and properly aligned.
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "local huge page allocation failed");
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Init,
    OnTrack,
    Derailed,
    Closed,
}

/// Translates a logical chunk id into its covering file and offset, and
/// tracks the channel's high/low monotonic watermarks relative to the
/// pool's `T`-chunk wraparound.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsumeIndicator {
    pub start_chunk_id_no_mod: u64,
    pub current_chunk_id_mod: u64,
    pub chunk_id_high: u64,
    pub chunk_id_low: u64,
    pub current_file_idx: usize,
    pub current_metadata_idx: u64,
}

pub struct ChannelLocal {
    pub channel_id: u64,
    pool: Arc<SharedPool>,
    config: ChannelConfig,
    switchboard: Arc<Switchboard>,
    ghost_table: GhostTable,
    state: Mutex<ChannelState>,
    local_bitvector: LocalBitvector,
    consume_indicator: Mutex<ConsumeIndicator>,
    /// SPCBs this channel has published, in the order they were contributed;
    /// `SharedPool::reclaim_candidates` walks this front-to-back.
    contribute: Mutex<VecDeque<Arc<Spcb>>>,
    /// Largest monotonic id known forcefully-unmapped from this channel;
    /// never regresses (`Premapping from pool`'s `low` bound).
    forceful_unmap_watermark: AtomicU64,
    /// Highest monotonic id `premap_from_pool` has scanned down from so far;
    /// never regresses.
    premap_high_watermark: AtomicU64,
    pub stats: StatBoard,

    /// Private huge pages used once `Derailed`, never published to the pool.
    _local_backing: Vec<OwnedHugePage>,
    local_slots: Vec<Arc<Spcb>>,
    local_free: ArrayQueue<u32>,
}

impl ChannelLocal {
    pub fn new(
        channel_id: u64,
        pool: Arc<SharedPool>,
        config: ChannelConfig,
        mapper: Arc<dyn GhostMapper>,
        switchboard: Arc<Switchboard>,
        start_chunk_id_no_mod: u64,
    ) -> Self {
        let ghost_table = GhostTable::new(mapper, Arc::clone(&switchboard));
        let total_chunks = pool.total_chunks();

        let chunk_bytes = config.chunk_bytes as usize;
        let local_free = ArrayQueue::new(config.local_buffer_count);
        let mut local_backing = Vec::with_capacity(config.local_buffer_count);
        let mut local_slots = Vec::with_capacity(config.local_buffer_count);
        for slot_idx in 0..config.local_buffer_count {
            let page = OwnedHugePage::alloc(chunk_bytes, chunk_bytes);
            let handle = page.handle();
            local_backing.push(page);
            local_slots.push(Arc::new(Spcb::new(slot_idx as u32, handle)));
            local_free.push(slot_idx as u32).expect("queue sized to local_buffer_count");
        }

        Self {
            channel_id,
            pool,
            config,
            switchboard,
            ghost_table,
            state: Mutex::new(ChannelState::Init),
            local_bitvector: LocalBitvector::new(total_chunks),
            consume_indicator: Mutex::new(ConsumeIndicator {
                start_chunk_id_no_mod,
                ..Default::default()
            }),
            contribute: Mutex::new(VecDeque::with_capacity(config.premap_batch)),
            forceful_unmap_watermark: AtomicU64::new(0),
            premap_high_watermark: AtomicU64::new(0),
            stats: StatBoard::new(),
            _local_backing: local_backing,
            local_slots,
            local_free,
        }
    }

    /// Dequeues one of this channel's private huge-page slots for the
    /// derailed I/O path. `None` means all local buffers are in flight.
    pub fn acquire_local_slot(&self) -> Option<Arc<Spcb>> {
        let slot_idx = self.local_free.pop()?;
        Some(Arc::clone(&self.local_slots[slot_idx as usize]))
    }

    pub fn return_local_slot(&self, slot_idx: u32) {
        let _ = self.local_free.push(slot_idx);
    }

    /// Recycles private local buffers whose ghost-table mapping has already
    /// been unmapped and whose ref_count has dropped back to zero — the
    /// derailed-path analogue of `SharedPool::reclaim_candidates`, with no
    /// hash or shared-bitvector bookkeeping since these pages are never
    /// published.
    pub fn reclaim_local_slots(&self) -> usize {
        let mut reclaimed = 0;
        for spcb in &self.local_slots {
            if spcb.is_used() && spcb.ref_count() == 0 {
                spcb.reset_after_reclaim();
                self.return_local_slot(spcb.slot_idx);
                reclaimed += 1;
            }
        }
        reclaimed
    }

    pub fn switchboard(&self) -> &Arc<Switchboard> {
        &self.switchboard
    }

    pub fn ghost_table(&self) -> &GhostTable {
        &self.ghost_table
    }

    pub fn local_bitvector(&self) -> &LocalBitvector {
        &self.local_bitvector
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    pub fn forceful_unmap_watermark(&self) -> u64 {
        self.forceful_unmap_watermark.load(Ordering::Acquire)
    }

    pub fn raise_forceful_unmap_watermark(&self, candidate: u64) {
        self.forceful_unmap_watermark.fetch_max(candidate, Ordering::AcqRel);
    }

    pub fn premap_high_watermark(&self) -> u64 {
        self.premap_high_watermark.load(Ordering::Acquire)
    }

    pub fn raise_premap_high_watermark(&self, candidate: u64) {
        self.premap_high_watermark.fetch_max(candidate, Ordering::AcqRel);
    }

    pub fn consume_indicator(&self) -> ConsumeIndicator {
        *self.consume_indicator.lock()
    }

    pub fn update_consume_indicator(&self, f: impl FnOnce(&mut ConsumeIndicator)) {
        f(&mut self.consume_indicator.lock());
    }

    fn transition(&self, to: ChannelState) {
        let mut state = self.state.lock();
        if *state == to {
            return;
        }
        debug!(channel_id = self.channel_id, from = ?*state, to = ?to, "channel state transition");
        *state = to;
    }

    /// `Init -> OnTrack`: called after `attach` completes and the channel's
    /// first `allocate_head` succeeds. No-op once `Derailed`, preserving the
    /// one-way transition.
    pub fn mark_on_track(&self) {
        if self.is_derailed() {
            return;
        }
        self.transition(ChannelState::OnTrack);
    }

    /// `OnTrack -> Derailed`: triggered either by `SharedPool::allocate_head`
    /// returning `Derailed`, or by the forceful-unmap watermark overtaking
    /// the channel's premap low watermark. One-way: a derailed channel never
    /// returns to `OnTrack`.
    pub fn derail(&self) {
        self.transition(ChannelState::Derailed);
    }

    pub fn is_derailed(&self) -> bool {
        self.state() == ChannelState::Derailed
    }

    /// Checks whether the forceful-unmap watermark has overtaken this
    /// channel's own premap progress, the second derailment trigger in
    /// addition to the pool's head-distance check.
    pub fn check_falling_behind(&self, premap_low_watermark: u64) {
        if self.forceful_unmap_watermark() > premap_low_watermark && !self.is_derailed() {
            self.derail();
        }
    }

    pub fn push_contribution(&self, spcb: Arc<Spcb>) {
        self.contribute.lock().push_back(spcb);
    }

    pub fn reclaim_contributions(&self) -> usize {
        let mut contribute = self.contribute.lock();
        self.pool.reclaim_candidates(&mut contribute)
    }

    pub fn num_contributed(&self) -> usize {
        self.contribute.lock().len()
    }

    /// The next chunk this channel hasn't yet obtained, scanning its local
    /// bitvector starting at `start`. Used once derailed.
    pub fn next_unobtained_chunk(&self, start: u64) -> Option<u64> {
        match self.local_bitvector.find_first_unset_leaf(start) {
            COMPLETE => None,
            chunk_id => Some(chunk_id),
        }
    }

    /// `* -> Closed`: caller (`ChannelLifecycle::close`) is responsible for
    /// waiting out every contributed SPCB's ref_count before calling this.
    pub fn mark_closed(&self) {
        self.transition(ChannelState::Closed);
    }
}

/// open/attach/detach/close orchestration: the thin layer translating a
/// `FileSet` + `Config` into a live `ChannelLocal` wired up to a pool.
pub struct ChannelLifecycle;

impl ChannelLifecycle {
    /// Attaches a fresh channel to `pool`, returning it in `Init` state.
    /// Caller must follow with the first `allocate_head`/`do_work` to reach
    /// `OnTrack`.
    pub fn open(
        pool: Arc<SharedPool>,
        config: ChannelConfig,
        mapper: Arc<dyn GhostMapper>,
    ) -> Result<Arc<ChannelLocal>> {
        let switchboard = Arc::new(Switchboard::new(config.switchboard_entries));
        let channel_id = pool.attach(Arc::clone(&switchboard))?;
        let channel = Arc::new(ChannelLocal::new(
            channel_id,
            Arc::clone(&pool),
            config,
            mapper,
            switchboard,
            0,
        ));
        debug!(channel_id, "channel opened");
        Ok(channel)
    }

    /// Drains and closes `channel`: runs the reclaimer to completion, holding
    /// the caller until every contributed SPCB's ref_count has dropped to
    /// zero and been reclaimed (`num_shared_pages == 0 ∧ num_using_pages ==
    /// 0`), only then marking the channel `Closed`. A contribution still
    /// `INUSE` (consumer mid-read) cannot be forced; if the bounded sweep
    /// budget runs out first, returns `CoreError::Timeout` and leaves the
    /// channel open for the caller to retry. Idempotent once it does
    /// succeed: calling this on an already-`Closed` channel returns
    /// `NoChannel`.
    pub fn close(channel: &Arc<ChannelLocal>, pool: &Arc<SharedPool>) -> Result<()> {
        if channel.state() == ChannelState::Closed {
            return Err(CoreError::NoChannel(channel.channel_id));
        }
        const MAX_DRAIN_SWEEPS: usize = 10_000;
        for _ in 0..MAX_DRAIN_SWEEPS {
            channel.ghost_table().drain_done();
            channel.ghost_table().force_unmap_all();
            channel.reclaim_contributions();
            if channel.num_contributed() == 0 {
                channel.mark_closed();
                pool.detach(channel.channel_id);
                debug!(channel_id = channel.channel_id, "channel closed");
                return Ok(());
            }
        }
        warn!(
            channel_id = channel.channel_id,
            remaining = channel.num_contributed(),
            "close timed out waiting for outstanding SPCBs to drain"
        );
        Err(CoreError::Timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::fileset::FileSet;
    use crate::mapper::FakeGhostMapper;

    fn make_pool(total_bytes: u64) -> Arc<SharedPool> {
        let fileset = FileSet::new(&[(1, total_bytes)], 2 * 1024 * 1024);
        SharedPool::create(fileset, crate::config::PoolConfig::default(), Arc::new(FakeClock::new()))
    }

    #[test]
    fn open_attaches_and_close_detaches() {
        let pool = make_pool(4 * 1024 * 1024);
        let config = ChannelConfig::default();
        let mapper = Arc::new(FakeGhostMapper::new(config.ghost_table_slots));
        let channel = ChannelLifecycle::open(Arc::clone(&pool), config, mapper).unwrap();
        assert_eq!(channel.state(), ChannelState::Init);
        assert_eq!(pool.pin_count(), 2);

        ChannelLifecycle::close(&channel, &pool).unwrap();
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(pool.pin_count(), 1);
    }

    #[test]
    fn close_is_idempotent() {
        let pool = make_pool(4 * 1024 * 1024);
        let config = ChannelConfig::default();
        let mapper = Arc::new(FakeGhostMapper::new(config.ghost_table_slots));
        let channel = ChannelLifecycle::open(Arc::clone(&pool), config, mapper).unwrap();
        ChannelLifecycle::close(&channel, &pool).unwrap();
        assert!(matches!(
            ChannelLifecycle::close(&channel, &pool),
            Err(CoreError::NoChannel(_))
        ));
    }

    #[test]
    fn derail_is_one_way() {
        let pool = make_pool(4 * 1024 * 1024);
        let config = ChannelConfig::default();
        let mapper = Arc::new(FakeGhostMapper::new(config.ghost_table_slots));
        let channel = ChannelLifecycle::open(Arc::clone(&pool), config, mapper).unwrap();
        channel.mark_on_track();
        assert_eq!(channel.state(), ChannelState::OnTrack);
        channel.derail();
        assert!(channel.is_derailed());
        channel.mark_on_track();
        assert!(
            channel.is_derailed(),
            "mark_on_track must not be able to undo derailment in this test, \
             real callers never call it after derail"
        );
    }

    #[test]
    fn reclaim_local_slots_recycles_only_finished_buffers() {
        let pool = make_pool(4 * 1024 * 1024);
        let config = ChannelConfig {
            local_buffer_count: 2,
            ..ChannelConfig::default()
        };
        let mapper = Arc::new(FakeGhostMapper::new(config.ghost_table_slots));
        let channel = ChannelLifecycle::open(Arc::clone(&pool), config, mapper).unwrap();

        let a = channel.acquire_local_slot().unwrap();
        a.set_used(true);
        a.acquire_ref();
        let _b = channel.acquire_local_slot().unwrap();
        assert!(channel.acquire_local_slot().is_none());

        assert_eq!(channel.reclaim_local_slots(), 0, "still referenced, not reclaimable");
        a.release_ref();
        assert_eq!(channel.reclaim_local_slots(), 1);
        assert!(channel.acquire_local_slot().is_some());
    }
}
