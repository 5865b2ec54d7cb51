use std::sync::atomic::{AtomicU64, Ordering};

const CELL_BITS: u64 = 2;
const CELLS_PER_WORD: u64 = 64 / CELL_BITS;
const CELLS_PER_LEVEL1_GROUP: u64 = 256;
const WORDS_PER_LEVEL1_GROUP: u64 = CELLS_PER_LEVEL1_GROUP / CELLS_PER_WORD;

/// Bit within a leaf cell meaning the cache holds this chunk's bytes.
pub const VALID: u8 = 0b01;
/// Bit within a leaf cell meaning at least one channel premapped this chunk
/// in the current epoch.
pub const REFERENCED: u8 = 0b10;

/// Cache-wide chunk state: 2-bit `{VALID, REFERENCED}` leaf per chunk,
/// summarised by a level-1 "all valid" bit per 256 leaf cells.
pub struct SharedBitvector {
    leaves: Vec<AtomicU64>,
    level1_all_valid: Vec<AtomicU64>,
    num_chunks: u64,
}

impl SharedBitvector {
    pub fn new(num_chunks: u64) -> Self {
        let num_words = (num_chunks + CELLS_PER_WORD - 1) / CELLS_PER_WORD;
        let num_groups = (num_chunks + CELLS_PER_LEVEL1_GROUP - 1) / CELLS_PER_LEVEL1_GROUP;
        let num_level1_words = (num_groups + 63) / 64;
        Self {
            leaves: (0..num_words).map(|_| AtomicU64::new(0)).collect(),
            level1_all_valid: (0..num_level1_words.max(1)).map(|_| AtomicU64::new(0)).collect(),
            num_chunks,
        }
    }

    fn word_and_shift(chunk_id: u64) -> (usize, u32) {
        let word = (chunk_id / CELLS_PER_WORD) as usize;
        let shift = ((chunk_id % CELLS_PER_WORD) * CELL_BITS) as u32;
        (word, shift)
    }

    /// Reads the 2-bit cell for `chunk_id` (`VALID`/`REFERENCED` OR'd).
    pub fn read_cell(&self, chunk_id: u64) -> u8 {
        let (word, shift) = Self::word_and_shift(chunk_id);
        let bits = self.leaves[word].load(Ordering::Acquire);
        ((bits >> shift) & 0b11) as u8
    }

    /// Sets `VALID | REFERENCED` for `chunk_id`. Called by `SharedPool::publish`
    /// strictly after the chunk's bytes are durable.
    pub fn publish(&self, chunk_id: u64) {
        let (word, shift) = Self::word_and_shift(chunk_id);
        let mask = 0b11u64 << shift;
        self.leaves[word].fetch_or(mask, Ordering::Release);
        self.maybe_set_level1(chunk_id);
    }

    /// Marks `chunk_id` as referenced (premapped this epoch) without
    /// touching the valid bit.
    pub fn mark_referenced(&self, chunk_id: u64) {
        let (word, shift) = Self::word_and_shift(chunk_id);
        let mask = (REFERENCED as u64) << shift;
        self.leaves[word].fetch_or(mask, Ordering::Release);
    }

    /// Clears both bits for `chunk_id`. Called by the reclaimer once an
    /// SPCB is removed from the pool hash.
    pub fn clear(&self, chunk_id: u64) {
        let (word, shift) = Self::word_and_shift(chunk_id);
        let mask = !(0b11u64 << shift);
        self.leaves[word].fetch_and(mask, Ordering::AcqRel);
        self.clear_level1(chunk_id);
    }

    fn maybe_set_level1(&self, chunk_id: u64) {
        let group = chunk_id / CELLS_PER_LEVEL1_GROUP;
        let group_start = group * CELLS_PER_LEVEL1_GROUP;
        let group_end = (group_start + CELLS_PER_LEVEL1_GROUP).min(self.num_chunks);
        let start_word = (group_start / CELLS_PER_WORD) as usize;
        let end_word = ((group_end + CELLS_PER_WORD - 1) / CELLS_PER_WORD) as usize;
        let all_valid = self.leaves[start_word..end_word]
            .iter()
            .all(|w| {
                let bits = w.load(Ordering::Acquire);
                (0..CELLS_PER_WORD).all(|i| (bits >> (i * CELL_BITS)) & VALID as u64 != 0)
            });
        if all_valid {
            let l1_word = (group / 64) as usize;
            let l1_bit = group % 64;
            self.level1_all_valid[l1_word].fetch_or(1u64 << l1_bit, Ordering::Release);
        }
    }

    fn clear_level1(&self, chunk_id: u64) {
        let group = chunk_id / CELLS_PER_LEVEL1_GROUP;
        let l1_word = (group / 64) as usize;
        let l1_bit = group % 64;
        self.level1_all_valid[l1_word].fetch_and(!(1u64 << l1_bit), Ordering::AcqRel);
    }

    /// Whether every chunk in the 256-chunk group covering `chunk_id` is
    /// currently valid. Used for bulk admission checks, not on the hot path.
    pub fn group_fully_valid(&self, chunk_id: u64) -> bool {
        let group = chunk_id / CELLS_PER_LEVEL1_GROUP;
        let l1_word = (group / 64) as usize;
        let l1_bit = group % 64;
        (self.level1_all_valid[l1_word].load(Ordering::Acquire) >> l1_bit) & 1 != 0
    }

    pub fn num_chunks(&self) -> u64 {
        self.num_chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_sets_both_bits() {
        let bv = SharedBitvector::new(1024);
        assert_eq!(bv.read_cell(42), 0);
        bv.publish(42);
        assert_eq!(bv.read_cell(42), VALID | REFERENCED);
    }

    #[test]
    fn clear_resets_cell() {
        let bv = SharedBitvector::new(1024);
        bv.publish(7);
        bv.clear(7);
        assert_eq!(bv.read_cell(7), 0);
    }

    #[test]
    fn adjacent_cells_independent() {
        let bv = SharedBitvector::new(1024);
        bv.publish(0);
        assert_eq!(bv.read_cell(1), 0);
        assert_eq!(bv.read_cell(0), VALID | REFERENCED);
    }

    #[test]
    fn group_fully_valid_tracks_whole_group() {
        let bv = SharedBitvector::new(CELLS_PER_LEVEL1_GROUP * 2);
        for c in 0..CELLS_PER_LEVEL1_GROUP {
            assert!(!bv.group_fully_valid(0));
            bv.publish(c);
        }
        assert!(bv.group_fully_valid(0));
        assert!(!bv.group_fully_valid(CELLS_PER_LEVEL1_GROUP));
        bv.clear(3);
        assert!(!bv.group_fully_valid(0));
    }
}
