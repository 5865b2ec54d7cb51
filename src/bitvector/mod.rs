//! Two-level atomic bitsets.
//!
//! `SharedBitvector` tracks cache-wide chunk state with 2-bit leaves
//! (`VALID`, `REFERENCED`), summarised by a level-1 word per 256 leaf cells.
//! `LocalBitvector` tracks what a single channel has already obtained, 1 bit
//! per chunk, summarised by 2 bits per 512 leaf bits (`PREMAP`,
//! `FORCEFUL_UNMAP`). Both provide lock-free, wait-free single-bit
//! operations via `fetch_or`/`fetch_and` on 64-bit words; only the summary
//! update below a word boundary needs a short retry loop, matching the
//! teacher's `OptimisticLatch` CAS-retry idiom.

mod local;
mod shared;

pub use local::LocalBitvector;
pub use shared::{SharedBitvector, REFERENCED, VALID};

/// Sentinel returned by `find_first_unset_leaf` when every chunk in range
/// has been seen.
pub const COMPLETE: u64 = u64::MAX;
