//! Shared page control block: the per-huge-page descriptor owned by the
//! pool for the page's entire lifetime. Channels only ever hold non-owning
//! references guarded by `ref_count`.

use crate::mapper::HugePage;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};

pub const INVALID_CHUNK_ID: u64 = u64::MAX;

/// Per-huge-page descriptor. Identity (`chunk_id`, `slot_idx`) is fixed at
/// construction; everything else is mutated through atomics so `lookup`,
/// `publish`, and the reclaimer can race safely (see invariants R1-R4 in the
/// design document).
pub struct Spcb {
    /// Stable index into the pool's SPCB array; never changes.
    pub slot_idx: u32,

    /// Logical chunk id currently backed by this slot. `INVALID_CHUNK_ID`
    /// when the slot is free.
    chunk_id: AtomicU64,

    /// Physical huge page backing this slot.
    page: parking_lot::Mutex<HugePage>,

    /// Bytes of the chunk filled by the transport so far (set once on
    /// completion for this core's purposes; no streaming partial-fill
    /// tracking is modeled beyond the final byte count).
    chunk_size: AtomicU32,

    /// R1: never goes negative. Bumped by `lookup`/`try_premap`, dropped by
    /// `unmap`.
    ref_count: AtomicI64,

    /// R2: true iff this SPCB is reachable from the pool hash under
    /// `chunk_id`.
    is_shared: AtomicBool,

    /// True while some channel owns this slot for an in-flight I/O or while
    /// it is published and not yet reclaimed.
    is_used: AtomicBool,

    /// Monotonic nanosecond deadline after which this SPCB may be reclaimed,
    /// provided `ref_count == 0`.
    exp_deadline_ns: AtomicU64,

    /// Non-zero while a reclaimer is inspecting this SPCB; premappers use
    /// this (instead of "now") to agree with a concurrent reclaimer on
    /// whether the SPCB has expired (see the hash's happens-before note).
    reclaimer_deadline_ns: AtomicU64,
}

impl Spcb {
    pub fn new(slot_idx: u32, page: HugePage) -> Self {
        Self {
            slot_idx,
            chunk_id: AtomicU64::new(INVALID_CHUNK_ID),
            page: parking_lot::Mutex::new(page),
            chunk_size: AtomicU32::new(0),
            ref_count: AtomicI64::new(0),
            is_shared: AtomicBool::new(false),
            is_used: AtomicBool::new(false),
            exp_deadline_ns: AtomicU64::new(0),
            reclaimer_deadline_ns: AtomicU64::new(0),
        }
    }

    pub fn chunk_id(&self) -> u64 {
        self.chunk_id.load(Ordering::Acquire)
    }

    pub fn set_chunk_id(&self, chunk_id: u64) {
        self.chunk_id.store(chunk_id, Ordering::Release);
    }

    pub fn page(&self) -> HugePage {
        *self.page.lock()
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size.load(Ordering::Acquire)
    }

    pub fn set_chunk_size(&self, size: u32) {
        self.chunk_size.store(size, Ordering::Release);
    }

    pub fn ref_count(&self) -> i64 {
        self.ref_count.load(Ordering::Acquire)
    }

    /// Speculatively bumps the refcount during a lookup. Caller must verify
    /// `chunk_id` still matches the key after this, and call `release` on
    /// miss or once done reading.
    pub fn acquire_ref(&self) -> i64 {
        self.ref_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn release_ref(&self) -> i64 {
        let prev = self.ref_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "SPCB refcount underflow");
        prev - 1
    }

    pub fn is_shared(&self) -> bool {
        self.is_shared.load(Ordering::Acquire)
    }

    pub fn set_shared(&self, shared: bool) {
        self.is_shared.store(shared, Ordering::Release);
    }

    pub fn is_used(&self) -> bool {
        self.is_used.load(Ordering::Acquire)
    }

    pub fn set_used(&self, used: bool) {
        self.is_used.store(used, Ordering::Release);
    }

    pub fn exp_deadline_ns(&self) -> u64 {
        self.exp_deadline_ns.load(Ordering::Acquire)
    }

    pub fn set_exp_deadline_ns(&self, deadline: u64) {
        self.exp_deadline_ns.store(deadline, Ordering::Release);
    }

    pub fn reclaimer_deadline_ns(&self) -> u64 {
        self.reclaimer_deadline_ns.load(Ordering::Acquire)
    }

    pub fn begin_reclaim_inspection(&self, now_ns: u64) {
        self.reclaimer_deadline_ns.store(now_ns, Ordering::Release);
    }

    pub fn end_reclaim_inspection(&self) {
        self.reclaimer_deadline_ns.store(0, Ordering::Release);
    }

    /// The clock a caller should compare `exp_deadline_ns` against: the
    /// reclaimer's snapshot if one is in progress, else wall-clock `now`.
    /// This is the handshake that keeps a concurrent reclaim and premap in
    /// agreement about expiry.
    pub fn expiry_clock(&self, now_ns: u64) -> u64 {
        let reclaimer_clock = self.reclaimer_deadline_ns();
        if reclaimer_clock != 0 {
            reclaimer_clock
        } else {
            now_ns
        }
    }

    /// R3: may this SPCB be reclaimed right now?
    pub fn is_reclaimable(&self, now_ns: u64) -> bool {
        self.ref_count() == 0
            && self.is_used()
            && self.exp_deadline_ns() != 0
            && self.exp_deadline_ns() < self.expiry_clock(now_ns)
    }

    /// Resets this SPCB to the free state after the reclaimer has removed it
    /// from the hash and cleared the shared bitvector. The slot id is the
    /// caller's responsibility to push back onto the pool's id-queue.
    pub fn reset_after_reclaim(&self) {
        self.set_shared(false);
        self.set_used(false);
        self.set_exp_deadline_ns(0);
        self.chunk_id.store(INVALID_CHUNK_ID, Ordering::Release);
        self.chunk_size.store(0, Ordering::Release);
        self.end_reclaim_inspection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_page() -> HugePage {
        HugePage {
            ptr: std::ptr::null(),
            len: 2 * 1024 * 1024,
        }
    }

    #[test]
    fn refcount_never_negative_when_balanced() {
        let spcb = Spcb::new(0, dummy_page());
        spcb.acquire_ref();
        spcb.acquire_ref();
        assert_eq!(spcb.release_ref(), 1);
        assert_eq!(spcb.release_ref(), 0);
    }

    #[test]
    fn reclaimable_requires_zero_ref_and_expired() {
        let spcb = Spcb::new(0, dummy_page());
        spcb.set_used(true);
        spcb.set_exp_deadline_ns(100);
        assert!(spcb.is_reclaimable(200));
        spcb.acquire_ref();
        assert!(!spcb.is_reclaimable(200));
        spcb.release_ref();
        assert!(!spcb.is_reclaimable(50));
    }

    #[test]
    fn reclaimer_deadline_overrides_now_for_expiry_check() {
        let spcb = Spcb::new(0, dummy_page());
        spcb.set_used(true);
        spcb.set_exp_deadline_ns(100);
        spcb.begin_reclaim_inspection(50);
        // A premapper checking "now" at 200 must still agree with the
        // reclaimer's snapshot of 50, not wall-clock 200.
        assert_eq!(spcb.expiry_clock(200), 50);
    }

    #[test]
    fn reset_after_reclaim_clears_everything() {
        let spcb = Spcb::new(0, dummy_page());
        spcb.set_shared(true);
        spcb.set_used(true);
        spcb.set_exp_deadline_ns(42);
        spcb.set_chunk_id(7);
        spcb.reset_after_reclaim();
        assert!(!spcb.is_shared());
        assert!(!spcb.is_used());
        assert_eq!(spcb.exp_deadline_ns(), 0);
        assert_eq!(spcb.chunk_id(), INVALID_CHUNK_ID);
    }
}
