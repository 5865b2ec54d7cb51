//! Per-channel ghost mapping table: a ring of process-private mapping slots
//! installed and revoked over a channel's VA window, one-to-one with the
//! channel's switchboard entries. `premap_iter`/`unmap_iter` are the
//! producer/consumer cursors into that ring.

use crate::bitvector::LocalBitvector;
use crate::error::{CoreError, Result};
use crate::mapper::GhostMapper;
use crate::spcb::Spcb;
use crate::switchboard::{EntryStatus, Switchboard};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

/// Per-slot bookkeeping the core needs to unmap or forcefully revoke a
/// premapped chunk: which SPCB backs it and what the channel called it.
struct SlotTracking {
    spcb: Option<Arc<Spcb>>,
    chunk_id: u64,
    monotonic_id: u64,
    distance_from_head: u64,
}

impl SlotTracking {
    fn empty() -> Self {
        Self {
            spcb: None,
            chunk_id: 0,
            monotonic_id: 0,
            distance_from_head: 0,
        }
    }
}

pub struct GhostTable {
    mapper: Arc<dyn GhostMapper>,
    switchboard: Arc<Switchboard>,
    tracking: Vec<Mutex<SlotTracking>>,
    premap_iter: AtomicU64,
    unmap_iter: AtomicU64,
    num_slots: usize,
}

impl GhostTable {
    pub fn new(mapper: Arc<dyn GhostMapper>, switchboard: Arc<Switchboard>) -> Self {
        let num_slots = switchboard.len();
        let tracking = (0..num_slots).map(|_| Mutex::new(SlotTracking::empty())).collect();
        Self {
            mapper,
            switchboard,
            tracking,
            premap_iter: AtomicU64::new(0),
            unmap_iter: AtomicU64::new(0),
            num_slots,
        }
    }

    pub fn premap_iter(&self) -> u64 {
        self.premap_iter.load(Ordering::Acquire)
    }

    pub fn unmap_iter(&self) -> u64 {
        self.unmap_iter.load(Ordering::Acquire)
    }

    /// Installs `spcb` at the next slot in the premap ring, and publishes
    /// `READY` on the matching switchboard entry only once the mapping is
    /// durable. Returns `ContentionBackoff` if the target slot is not
    /// `EMPTY` yet (the consumer hasn't drained it).
    pub fn try_premap(
        &self,
        spcb: Arc<Spcb>,
        chunk_id: u64,
        monotonic_id: u64,
        distance_from_head: u64,
    ) -> Result<u32> {
        let iter = self.premap_iter.fetch_add(1, Ordering::AcqRel);
        let idx = (iter % self.num_slots as u64) as usize;
        let entry = &self.switchboard.entries[idx];
        if entry.status() != EntryStatus::Empty {
            self.premap_iter.fetch_sub(1, Ordering::AcqRel);
            return Err(CoreError::ContentionBackoff("ghost table slot not empty"));
        }

        let page = spcb.page();
        self.mapper.map(idx as u32, page)?;

        let filled_bytes = spcb.chunk_size();
        {
            let mut tracking = self.tracking[idx].lock();
            *tracking = SlotTracking {
                spcb: Some(spcb),
                chunk_id,
                monotonic_id,
                distance_from_head,
            };
        }
        entry
            .publish_ready(filled_bytes)
            .map_err(|_| CoreError::ContentionBackoff("switchboard publish race"))?;
        trace!(slot_idx = idx, chunk_id, "premapped chunk");
        Ok(idx as u32)
    }

    /// Revokes the mapping at `slot_idx`. Precondition: the switchboard
    /// entry is `DONE` (consumer finished, or forceful-unmap already CAS'd
    /// it). Decrements the tracked SPCB's ref_count and advances
    /// `unmap_iter`.
    pub fn unmap(&self, slot_idx: u32) -> Result<()> {
        let idx = slot_idx as usize;
        let entry = &self.switchboard.entries[idx];
        if entry.status() != EntryStatus::Done {
            return Err(CoreError::ContentionBackoff("unmap called on non-DONE slot"));
        }
        self.mapper.unmap(slot_idx)?;
        self.mapper.flush_tlb(slot_idx);

        let spcb = self.tracking[idx].lock().spcb.take();
        if let Some(spcb) = spcb {
            spcb.release_ref();
        }
        entry.release_to_empty();
        self.unmap_iter.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Scans every slot for entries the consumer has already marked `DONE`,
    /// unmapping them. This is the ordinary (non-forceful) half of the
    /// release flow: `consumer marks DONE -> GhostTable::unmap ->
    /// SPCB::release_ref -> slot recycled for the next premap`.
    pub fn drain_done(&self) -> usize {
        let mut drained = 0;
        for idx in 0..self.num_slots {
            if self.switchboard.entries[idx].status() != EntryStatus::Done {
                continue;
            }
            if self.unmap(idx as u32).is_ok() {
                drained += 1;
            }
        }
        drained
    }

    /// Forcefully revokes every `READY` slot regardless of expiry. Used on
    /// channel close, which cannot wait for the pool's ordinary expiration
    /// clock to unwind a consumer that has simply stopped reading. Never
    /// touches `INUSE`; the caller must wait out an in-progress read itself.
    pub fn force_unmap_all(&self) -> usize {
        let mut forced = 0;
        for idx in 0..self.num_slots {
            let entry = &self.switchboard.entries[idx];
            if entry.status() != EntryStatus::Ready {
                continue;
            }
            if !entry.forceful_cas_ready_to_done() {
                continue;
            }
            if self.unmap(idx as u32).is_ok() {
                forced += 1;
            }
        }
        forced
    }

    /// Scans forward from the slot after `user_buffer_idx`, revoking any
    /// `READY` slot whose backing SPCB has expired. Never touches `INUSE`.
    /// Clears the channel's local bitvector bit for each forced chunk so it
    /// is re-acquired later, and returns the forced chunk ids so the caller
    /// can advance its forceful-unmap watermark.
    pub fn forceful_unmap_scan(&self, local_bitvector: &LocalBitvector, now_ns: u64) -> Vec<u64> {
        let start = (self.switchboard.user_buffer_idx.load(Ordering::Acquire) as usize + 1)
            % self.num_slots;
        let mut forced = Vec::new();
        for offset in 0..self.num_slots {
            let idx = (start + offset) % self.num_slots;
            let entry = &self.switchboard.entries[idx];
            if entry.status() != EntryStatus::Ready {
                continue;
            }
            let (chunk_id, expired) = {
                let tracking = self.tracking[idx].lock();
                match &tracking.spcb {
                    Some(spcb) => {
                        let deadline = spcb.exp_deadline_ns();
                        (tracking.chunk_id, deadline != 0 && deadline < now_ns)
                    }
                    None => continue,
                }
            };
            if !expired {
                continue;
            }
            if !entry.forceful_cas_ready_to_done() {
                continue;
            }
            if self.unmap(idx as u32).is_err() {
                continue;
            }
            local_bitvector.test_and_clear_leaf(chunk_id);
            warn!(slot_idx = idx, chunk_id, "forceful unmap: channel falling behind");
            forced.push(chunk_id);
        }
        forced
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::{FakeGhostMapper, HugePage};

    fn dummy_page() -> HugePage {
        HugePage {
            ptr: std::ptr::null(),
            len: 2 * 1024 * 1024,
        }
    }

    fn make_table(num_slots: usize) -> (GhostTable, Arc<Switchboard>, Arc<FakeGhostMapper>) {
        let switchboard = Arc::new(Switchboard::new(num_slots));
        let mapper = Arc::new(FakeGhostMapper::new(num_slots));
        let table = GhostTable::new(mapper.clone(), switchboard.clone());
        (table, switchboard, mapper)
    }

    #[test]
    fn premap_installs_mapping_and_publishes_ready() {
        let (table, switchboard, mapper) = make_table(4);
        let spcb = Arc::new(Spcb::new(0, dummy_page()));
        spcb.set_chunk_id(5);
        spcb.set_chunk_size(1024);
        let slot = table.try_premap(Arc::clone(&spcb), 5, 5, 0).unwrap();
        assert_eq!(slot, 0);
        assert!(mapper.mapped(0).is_some());
        assert_eq!(switchboard.entries[0].status(), EntryStatus::Ready);
        assert_eq!(switchboard.entries[0].filled_bytes(), 1024);
    }

    #[test]
    fn premap_backoff_when_slot_not_empty() {
        let (table, switchboard, _mapper) = make_table(1);
        let spcb = Arc::new(Spcb::new(0, dummy_page()));
        spcb.set_chunk_size(100);
        table.try_premap(Arc::clone(&spcb), 0, 0, 0).unwrap();
        assert_eq!(switchboard.entries[0].status(), EntryStatus::Ready);

        let spcb2 = Arc::new(Spcb::new(1, dummy_page()));
        spcb2.set_chunk_size(100);
        let err = table.try_premap(spcb2, 1, 1, 0).unwrap_err();
        assert!(matches!(err, CoreError::ContentionBackoff(_)));
        assert_eq!(table.premap_iter(), 1);
    }

    #[test]
    fn unmap_requires_done_status() {
        let (table, switchboard, _mapper) = make_table(1);
        let spcb = Arc::new(Spcb::new(0, dummy_page()));
        spcb.set_chunk_size(64);
        table.try_premap(Arc::clone(&spcb), 0, 0, 0).unwrap();
        assert!(table.unmap(0).is_err());

        switchboard.entries[0].consumer_begin().unwrap();
        switchboard.entries[0].consumer_finish();
        spcb.acquire_ref();
        assert!(table.unmap(0).is_ok());
        assert_eq!(switchboard.entries[0].status(), EntryStatus::Empty);
        assert_eq!(table.unmap_iter(), 1);
    }

    #[test]
    fn forceful_unmap_scan_skips_inuse_and_clears_local_bit() {
        let (table, switchboard, _mapper) = make_table(2);
        let local = LocalBitvector::new(8);

        let spcb_a = Arc::new(Spcb::new(0, dummy_page()));
        spcb_a.set_chunk_size(64);
        spcb_a.set_exp_deadline_ns(10);
        spcb_a.acquire_ref(); // premap always holds a ref on the mapped SPCB
        table.try_premap(Arc::clone(&spcb_a), 2, 2, 0).unwrap();
        local.test_and_set_leaf(2);

        let spcb_b = Arc::new(Spcb::new(1, dummy_page()));
        spcb_b.set_chunk_size(64);
        spcb_b.set_exp_deadline_ns(10);
        spcb_b.acquire_ref();
        table.try_premap(Arc::clone(&spcb_b), 3, 3, 0).unwrap();
        local.test_and_set_leaf(3);
        switchboard.entries[1].consumer_begin().unwrap(); // now INUSE, must be skipped

        let forced = table.forceful_unmap_scan(&local, 1_000);
        assert_eq!(forced, vec![2]);
        assert_eq!(switchboard.entries[0].status(), EntryStatus::Empty);
        assert!(!local.is_set(2));
        assert_eq!(switchboard.entries[1].status(), EntryStatus::Inuse);
        assert!(local.is_set(3));
    }

    #[test]
    fn drain_done_unmaps_consumer_finished_slots_only() {
        let (table, switchboard, _mapper) = make_table(2);

        let spcb_a = Arc::new(Spcb::new(0, dummy_page()));
        spcb_a.set_chunk_size(64);
        spcb_a.acquire_ref();
        table.try_premap(Arc::clone(&spcb_a), 0, 0, 0).unwrap();
        switchboard.entries[0].consumer_begin().unwrap();
        switchboard.entries[0].consumer_finish();

        let spcb_b = Arc::new(Spcb::new(1, dummy_page()));
        spcb_b.set_chunk_size(64);
        spcb_b.acquire_ref();
        table.try_premap(Arc::clone(&spcb_b), 1, 1, 0).unwrap();

        let drained = table.drain_done();
        assert_eq!(drained, 1);
        assert_eq!(switchboard.entries[0].status(), EntryStatus::Empty);
        assert_eq!(switchboard.entries[1].status(), EntryStatus::Ready);
        assert_eq!(spcb_a.ref_count(), 0);
    }
}
