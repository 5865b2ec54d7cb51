//! Configuration for every numeric constant the core otherwise hardcodes.
//!
//! The upstream implementation bakes these in as `#define`s; this crate
//! exposes them as a serde-serializable config tree so the two open
//! questions in the design notes (huge-page/SPCB caps, jiffy/tsc clocks) are
//! answered by configuration rather than by magic numbers scattered through
//! the code.

use serde::{Deserialize, Serialize};

pub const CHUNK_BYTES: u64 = 2 * 1024 * 1024;
pub const VA_WINDOW_BYTES: u64 = 1024 * 1024 * 1024;
pub const GHOST_TABLE_SLOTS: usize = 512;
pub const SWITCHBOARD_ENTRIES: usize = 512;
pub const HASH_BUCKETS: usize = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub pool: PoolConfig,
    pub channel: ChannelConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            channel: ChannelConfig::default(),
        }
    }
}

/// Pool-wide tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of SPCBs (shared huge-page slots) the pool will ever
    /// hold. The upstream source hardcodes 64; kept as the default here.
    pub max_spcbs: usize,

    /// Nanoseconds per scheduler jiffy. Default matches a 1000Hz tick.
    pub jiffy_ns: u64,

    /// Multiplier used to convert a switchboard `avg_tsc_delta` (tsc units)
    /// into nanoseconds. The real backend calibrates this against the CPU's
    /// invariant TSC frequency at boot; the default of 1 treats tsc units as
    /// nanoseconds directly, which is what the in-memory test backend does.
    pub tsc_to_ns: f64,

    /// Number of buckets in the chunk_id -> SPCB hash.
    pub hash_buckets: usize,

    /// Minimum expiration window granted to a freshly published SPCB,
    /// expressed in jiffies (see `SharedPool` expiration policy).
    pub min_expiration_jiffies: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_spcbs: 64,
            jiffy_ns: 1_000_000,
            tsc_to_ns: 1.0,
            hash_buckets: HASH_BUCKETS,
            min_expiration_jiffies: 4,
        }
    }
}

/// Per-channel tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Number of slots in the ghost mapping table.
    pub ghost_table_slots: usize,

    /// Number of entries in the switchboard ring.
    pub switchboard_entries: usize,

    /// Number of private huge-page buffers used once derailed. The upstream
    /// source hardcodes 8.
    pub local_buffer_count: usize,

    /// Size of the channel's reserved VA window, must stay aligned to
    /// `VA_WINDOW_BYTES`.
    pub va_window_bytes: u64,

    /// Chunk size in bytes (2 MiB huge pages).
    pub chunk_bytes: u64,

    /// Maximum number of chunks gathered in one `premap_from_pool` sweep.
    pub premap_batch: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            ghost_table_slots: GHOST_TABLE_SLOTS,
            switchboard_entries: SWITCHBOARD_ENTRIES,
            local_buffer_count: 8,
            va_window_bytes: VA_WINDOW_BYTES,
            chunk_bytes: CHUNK_BYTES,
            premap_batch: 64,
        }
    }
}
