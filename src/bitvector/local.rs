use super::COMPLETE;
use std::sync::atomic::{AtomicU64, Ordering};

const BITS_PER_WORD: u64 = 64;
const CHUNKS_PER_GROUP: u64 = 512;
const WORDS_PER_GROUP: u64 = CHUNKS_PER_GROUP / BITS_PER_WORD;

/// Per-channel view of which chunks have been obtained (premapped or issued
/// I/O for). 1 bit per chunk, summarised 2-bits-per-512 at level 1: `premap`
/// (every chunk in the group has been obtained) and `forceful_unmap` (at
/// least one chunk in the group was revoked and needs re-acquisition).
pub struct LocalBitvector {
    leaves: Vec<AtomicU64>,
    level1_premap: Vec<AtomicU64>,
    level1_forceful_unmap: Vec<AtomicU64>,
    num_chunks: u64,
}

impl LocalBitvector {
    pub fn new(num_chunks: u64) -> Self {
        let num_words = (num_chunks + BITS_PER_WORD - 1) / BITS_PER_WORD;
        let num_groups = (num_chunks + CHUNKS_PER_GROUP - 1) / CHUNKS_PER_GROUP;
        let num_level1_words = (num_groups + 63) / 64;
        Self {
            leaves: (0..num_words).map(|_| AtomicU64::new(0)).collect(),
            level1_premap: (0..num_level1_words.max(1)).map(|_| AtomicU64::new(0)).collect(),
            level1_forceful_unmap: (0..num_level1_words.max(1))
                .map(|_| AtomicU64::new(0))
                .collect(),
            num_chunks,
        }
    }

    fn word_and_bit(chunk_id: u64) -> (usize, u32) {
        ((chunk_id / BITS_PER_WORD) as usize, (chunk_id % BITS_PER_WORD) as u32)
    }

    pub fn is_set(&self, chunk_id: u64) -> bool {
        let (word, bit) = Self::word_and_bit(chunk_id);
        (self.leaves[word].load(Ordering::Acquire) >> bit) & 1 != 0
    }

    /// Sets the leaf bit for `chunk_id`, returning whether it was already
    /// set. If this set completed the enclosing 512-chunk group, sets the
    /// group's `premap` summary bit.
    pub fn test_and_set_leaf(&self, chunk_id: u64) -> bool {
        let (word, bit) = Self::word_and_bit(chunk_id);
        let mask = 1u64 << bit;
        let prev = self.leaves[word].fetch_or(mask, Ordering::AcqRel);
        let was_set = prev & mask != 0;
        if !was_set {
            self.maybe_mark_group_premapped(chunk_id);
        }
        was_set
    }

    /// Clears the leaf bit for `chunk_id` (used on forceful unmap) and marks
    /// the enclosing group's `forceful_unmap` summary bit. Returns whether
    /// the bit had been set.
    pub fn test_and_clear_leaf(&self, chunk_id: u64) -> bool {
        let (word, bit) = Self::word_and_bit(chunk_id);
        let mask = 1u64 << bit;
        let prev = self.leaves[word].fetch_and(!mask, Ordering::AcqRel);
        let group = chunk_id / CHUNKS_PER_GROUP;
        let (l1_word, l1_bit) = ((group / 64) as usize, group % 64);
        self.level1_premap[l1_word].fetch_and(!(1u64 << l1_bit), Ordering::AcqRel);
        self.level1_forceful_unmap[l1_word].fetch_or(1u64 << l1_bit, Ordering::Release);
        prev & mask != 0
    }

    fn maybe_mark_group_premapped(&self, chunk_id: u64) {
        let group = chunk_id / CHUNKS_PER_GROUP;
        let group_start = group * CHUNKS_PER_GROUP;
        let group_end = (group_start + CHUNKS_PER_GROUP).min(self.num_chunks);
        let start_word = (group_start / BITS_PER_WORD) as usize;
        let end_word = ((group_end + BITS_PER_WORD - 1) / BITS_PER_WORD) as usize;
        let bits_in_group = group_end - group_start;
        let full_words = bits_in_group / BITS_PER_WORD;
        let tail_bits = bits_in_group % BITS_PER_WORD;

        let mut all_set = true;
        for (i, w) in self.leaves[start_word..end_word].iter().enumerate() {
            let bits = w.load(Ordering::Acquire);
            let expect = if (i as u64) < full_words {
                u64::MAX
            } else if tail_bits > 0 {
                (1u64 << tail_bits) - 1
            } else {
                u64::MAX
            };
            if bits & expect != expect {
                all_set = false;
                break;
            }
        }
        if all_set {
            let (l1_word, l1_bit) = ((group / 64) as usize, group % 64);
            self.level1_premap[l1_word].fetch_or(1u64 << l1_bit, Ordering::Release);
        }
    }

    /// Walks forward from `start` (inclusive) looking for the first chunk id
    /// whose leaf bit is unset, skipping whole groups whose `premap`
    /// summary bit says every chunk in them is already obtained. Returns
    /// `COMPLETE` if every chunk from `start` to `num_chunks` is set.
    pub fn find_first_unset_leaf(&self, start: u64) -> u64 {
        let mut chunk = start;
        while chunk < self.num_chunks {
            let group = chunk / CHUNKS_PER_GROUP;
            let (l1_word, l1_bit) = ((group / 64) as usize, group % 64);
            let group_fully_premapped =
                (self.level1_premap[l1_word].load(Ordering::Acquire) >> l1_bit) & 1 != 0;
            if group_fully_premapped {
                chunk = (group + 1) * CHUNKS_PER_GROUP;
                continue;
            }
            let (word, bit) = Self::word_and_bit(chunk);
            let bits = self.leaves[word].load(Ordering::Acquire);
            let remaining = !(bits >> bit);
            if remaining == 0 {
                chunk = (word as u64 + 1) * BITS_PER_WORD;
                continue;
            }
            let offset = remaining.trailing_zeros() as u64;
            let candidate = chunk + offset;
            if candidate >= self.num_chunks {
                return COMPLETE;
            }
            return candidate;
        }
        COMPLETE
    }

    /// Whether the group covering `chunk_id` has had a forceful unmap since
    /// it was last fully premapped.
    pub fn group_forceful_unmapped(&self, chunk_id: u64) -> bool {
        let group = chunk_id / CHUNKS_PER_GROUP;
        let (l1_word, l1_bit) = ((group / 64) as usize, group % 64);
        (self.level1_forceful_unmap[l1_word].load(Ordering::Acquire) >> l1_bit) & 1 != 0
    }

    pub fn num_chunks(&self) -> u64 {
        self.num_chunks
    }
}
