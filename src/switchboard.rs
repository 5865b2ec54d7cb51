//! The switchboard: the shared-memory contract between the core and the
//! consumer thread. Bit-exact layout matters here since real consumers read
//! this structure directly out of mapped memory.

use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU64, Ordering};

/// Low 2 bits of an entry's packed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum EntryStatus {
    Empty = 0,
    Ready = 1,
    Inuse = 2,
    Done = 3,
}

impl EntryStatus {
    fn from_bits(bits: i32) -> Self {
        match bits & 0b11 {
            0 => EntryStatus::Empty,
            1 => EntryStatus::Ready,
            2 => EntryStatus::Inuse,
            3 => EntryStatus::Done,
            _ => unreachable!("masked to 2 bits"),
        }
    }
}

const STATUS_BITS: i32 = 2;
const STATUS_MASK: i32 = 0b11;
const MAX_FILLED_BYTES: i32 = (1 << 30) - 1;

/// Packs `(status, filled_bytes)` into the wire representation: bits 0..1
/// are status, bits 2..31 are filled_bytes.
pub fn pack(status: EntryStatus, filled_bytes: u32) -> i32 {
    debug_assert!(filled_bytes as i32 <= MAX_FILLED_BYTES);
    (status as i32) | ((filled_bytes as i32) << STATUS_BITS)
}

pub fn read_status(value: i32) -> EntryStatus {
    EntryStatus::from_bits(value)
}

pub fn read_bytes(value: i32) -> u32 {
    ((value >> STATUS_BITS) & MAX_FILLED_BYTES) as u32
}

/// One ring slot. `repr(C, align(64))` keeps each entry on its own cache
/// line so consumer polling and producer publishing don't false-share.
#[repr(C, align(64))]
pub struct Entry {
    val: AtomicI32,
    _padding: [u8; 60],
}

impl Entry {
    fn new() -> Self {
        Self {
            val: AtomicI32::new(pack(EntryStatus::Empty, 0)),
            _padding: [0; 60],
        }
    }

    pub fn status(&self) -> EntryStatus {
        read_status(self.val.load(Ordering::Acquire))
    }

    pub fn filled_bytes(&self) -> u32 {
        read_bytes(self.val.load(Ordering::Acquire))
    }

    /// Core-side: EMPTY -> READY, publishing `filled_bytes`. Only valid
    /// after the mapping is durable (see `GhostTable::try_premap`).
    pub fn publish_ready(&self, filled_bytes: u32) -> Result<(), ()> {
        let empty = pack(EntryStatus::Empty, 0);
        let ready = pack(EntryStatus::Ready, filled_bytes);
        self.val
            .compare_exchange(empty, ready, Ordering::Release, Ordering::Relaxed)
            .map(|_| ())
            .map_err(|_| ())
    }

    /// Consumer-side: READY -> INUSE.
    pub fn consumer_begin(&self) -> Result<u32, ()> {
        let current = self.val.load(Ordering::Acquire);
        if read_status(current) != EntryStatus::Ready {
            return Err(());
        }
        let filled = read_bytes(current);
        let inuse = pack(EntryStatus::Inuse, filled);
        self.val
            .compare_exchange(current, inuse, Ordering::AcqRel, Ordering::Relaxed)
            .map(|_| filled)
            .map_err(|_| ())
    }

    /// Consumer-side: INUSE -> DONE.
    pub fn consumer_finish(&self) {
        let current = self.val.load(Ordering::Acquire);
        let filled = read_bytes(current);
        self.val
            .store(pack(EntryStatus::Done, filled), Ordering::Release);
    }

    /// Core-side forceful unmap: READY -> DONE. Never touches an INUSE slot.
    pub fn forceful_cas_ready_to_done(&self) -> bool {
        let current = self.val.load(Ordering::Acquire);
        if read_status(current) != EntryStatus::Ready {
            return false;
        }
        let filled = read_bytes(current);
        self.val
            .compare_exchange(
                current,
                pack(EntryStatus::Done, filled),
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Core-side: DONE -> EMPTY, after unmap and refcount decrement.
    pub fn release_to_empty(&self) {
        self.val.store(pack(EntryStatus::Empty, 0), Ordering::Release);
    }
}

/// Fixed-size shared-memory ring, one per channel, mapped into user VA.
#[repr(C)]
pub struct Switchboard {
    /// Consumer-owned: current slot index being read.
    pub user_buffer_idx: AtomicI32,
    /// Consumer monotonic chunk counter.
    pub consumed: AtomicU64,
    /// EMA of per-chunk consume time, tsc units.
    pub avg_tsc_delta: AtomicU64,
    /// Base address of the channel's VA window (set once at open).
    pub data_buffer: AtomicU64,
    pub entries: Vec<Entry>,
    pub nr_consumed_chunk: AtomicU64,
    /// Terminal error status, observed by the consumer as EOF-with-error.
    pub error_status: AtomicI64,
}

/// No error.
pub const ETC_OK: i64 = 0;
/// Mid-stream failure terminated the channel.
pub const ETC_ERROR: i64 = 1;

impl Switchboard {
    pub fn new(num_entries: usize) -> Self {
        Self {
            user_buffer_idx: AtomicI32::new(0),
            consumed: AtomicU64::new(0),
            avg_tsc_delta: AtomicU64::new(0),
            data_buffer: AtomicU64::new(0),
            entries: (0..num_entries).map(|_| Entry::new()).collect(),
            nr_consumed_chunk: AtomicU64::new(0),
            error_status: AtomicI64::new(ETC_OK),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// EMA step with weight 1/16: `ema' = (new<<7 + 1920*ema) >> 11`.
    pub fn record_consume_delta(&self, new_tsc_delta: u64) {
        let prev = self.avg_tsc_delta.load(Ordering::Acquire);
        let updated = ((new_tsc_delta << 7) + 1920 * prev) >> 11;
        self.avg_tsc_delta.store(updated, Ordering::Release);
    }

    pub fn set_error(&self) {
        self.error_status.store(ETC_ERROR, Ordering::Release);
    }

    pub fn has_error(&self) -> bool {
        self.error_status.load(Ordering::Acquire) == ETC_ERROR
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trip() {
        for status in [
            EntryStatus::Empty,
            EntryStatus::Ready,
            EntryStatus::Inuse,
            EntryStatus::Done,
        ] {
            for bytes in [0u32, 1, 12345, (1 << 29), MAX_FILLED_BYTES as u32] {
                let packed = pack(status, bytes);
                assert_eq!(read_status(packed), status);
                assert_eq!(read_bytes(packed), bytes);
            }
        }
    }

    #[test]
    fn full_status_cycle() {
        let entry = Entry::new();
        assert_eq!(entry.status(), EntryStatus::Empty);
        entry.publish_ready(4096).unwrap();
        assert_eq!(entry.status(), EntryStatus::Ready);
        assert_eq!(entry.filled_bytes(), 4096);
        let filled = entry.consumer_begin().unwrap();
        assert_eq!(filled, 4096);
        assert_eq!(entry.status(), EntryStatus::Inuse);
        entry.consumer_finish();
        assert_eq!(entry.status(), EntryStatus::Done);
        entry.release_to_empty();
        assert_eq!(entry.status(), EntryStatus::Empty);
    }

    #[test]
    fn forceful_unmap_never_touches_inuse() {
        let entry = Entry::new();
        entry.publish_ready(100).unwrap();
        entry.consumer_begin().unwrap();
        assert!(!entry.forceful_cas_ready_to_done());
        assert_eq!(entry.status(), EntryStatus::Inuse);
    }

    #[test]
    fn ema_converges_toward_new_value() {
        let sb = Switchboard::new(1);
        sb.avg_tsc_delta.store(1000, Ordering::Relaxed);
        for _ in 0..200 {
            sb.record_consume_delta(2000);
        }
        let v = sb.avg_tsc_delta.load(Ordering::Relaxed);
        assert!((v as i64 - 2000).abs() < 5, "ema should converge near 2000, got {v}");
    }
}
