//! `GhostMapper`: the external collaborator owning the per-process reserved
//! VA range. Page-table manipulation and TLB shootdown IPIs are out of
//! scope; the core only needs `map`/`unmap`/`flush_tlb` over a slot index.

/// A physical huge page handed to the mapper. Opaque to the core beyond its
/// address and length; ownership stays with the `SharedPool` (see
/// [`crate::spcb`]).
#[derive(Debug, Clone, Copy)]
pub struct HugePage {
    pub ptr: *const u8,
    pub len: usize,
}

// SAFETY: the pointer is never dereferenced by anything other than the
// consumer thread reading through the mapped VA window; `HugePage` itself is
// just a handle passed between the pool and the mapper.
unsafe impl Send for HugePage {}
unsafe impl Sync for HugePage {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapperError {
    pub slot_idx: u32,
    pub reason: String,
}

pub trait GhostMapper: Send + Sync {
    /// Splice `page` into the process's VA window at `slot_idx * chunk_bytes`,
    /// read-only.
    fn map(&self, slot_idx: u32, page: HugePage) -> Result<(), MapperError>;

    /// Revoke the mapping installed at `slot_idx`. Idempotent: unmapping an
    /// already-empty slot is not an error.
    fn unmap(&self, slot_idx: u32) -> Result<(), MapperError>;

    /// Issue a (possibly cross-CPU, via IPI) TLB flush covering `slot_idx`'s
    /// virtual range. Must be called after `unmap` and before the backing
    /// page is considered free for reuse.
    fn flush_tlb(&self, slot_idx: u32);
}

/// In-process test double: a `Vec<Option<HugePage>>` standing in for the VA
/// window. `flush_tlb` is a no-op since there is no real TLB to invalidate.
pub struct FakeGhostMapper {
    slots: parking_lot::Mutex<Vec<Option<HugePage>>>,
}

impl FakeGhostMapper {
    pub fn new(num_slots: usize) -> Self {
        Self {
            slots: parking_lot::Mutex::new(vec![None; num_slots]),
        }
    }

    pub fn mapped(&self, slot_idx: u32) -> Option<HugePage> {
        self.slots.lock()[slot_idx as usize]
    }
}

impl GhostMapper for FakeGhostMapper {
    fn map(&self, slot_idx: u32, page: HugePage) -> Result<(), MapperError> {
        let mut slots = self.slots.lock();
        slots[slot_idx as usize] = Some(page);
        Ok(())
    }

    fn unmap(&self, slot_idx: u32) -> Result<(), MapperError> {
        let mut slots = self.slots.lock();
        slots[slot_idx as usize] = None;
        Ok(())
    }

    fn flush_tlb(&self, _slot_idx: u32) {}
}
