//! Host-facing control plane: the small set of operations an external
//! process calls to stand up pools and channels. Mirrors the historical
//! `open_channel`/`close_channel`/`create_pool`/`destroy_pool`/
//! `wait_page_reclaim` surface, with `CoreError` replacing bare return
//! codes and [`CoreError::as_legacy_code`] bridging callers that still
//! want the numeric contract.

use crate::channel::{ChannelLifecycle, ChannelLocal};
use crate::clock::NowSource;
use crate::config::{ChannelConfig, Config};
use crate::error::{CoreError, Result};
use crate::fileset::FileSet;
use crate::firehose::FirehoseCtrl;
use crate::mapper::GhostMapper;
use crate::metrics::ChannelStatsSnapshot;
use crate::pool::SharedPool;
use crate::scheduler::Scheduler;
use crate::switchboard::Switchboard;
use crate::transport::BlockTransport;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

/// Everything the host receives back from a successful `open_channel`.
pub struct OpenChannelHandle {
    pub channel_id: u64,
    pub switchboard: Arc<Switchboard>,
    pub cpu: usize,
}

struct OpenChannel {
    channel: Arc<ChannelLocal>,
    firehose: Arc<FirehoseCtrl>,
    pool_key: u64,
}

/// Top-level runtime: owns every pool and channel for one process, and the
/// shared collaborators (`BlockTransport`, `Scheduler`, clock) injected at
/// construction. One instance per host process.
pub struct CoreRuntime {
    config: Config,
    clock: Arc<dyn NowSource>,
    scheduler: Arc<dyn Scheduler>,
    transport: Arc<dyn BlockTransport>,
    pools: DashMap<u64, Arc<SharedPool>>,
    channels: DashMap<u64, OpenChannel>,
    next_pool_key: AtomicU64,
    next_cpu: AtomicUsize,
}

impl CoreRuntime {
    pub fn new(
        config: Config,
        clock: Arc<dyn NowSource>,
        scheduler: Arc<dyn Scheduler>,
        transport: Arc<dyn BlockTransport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            clock,
            scheduler,
            transport,
            pools: DashMap::new(),
            channels: DashMap::new(),
            next_pool_key: AtomicU64::new(1),
            next_cpu: AtomicUsize::new(0),
        })
    }

    /// `create_pool`: builds concatenated file-set metadata for
    /// `shareable_files` and returns a `pool_key` the host passes to
    /// subsequent `open_channel` calls.
    pub fn create_pool(&self, shareable_files: &[(u32, u64)]) -> Result<u64> {
        if shareable_files.is_empty() {
            return Err(CoreError::OutOfCapacity("create_pool requires at least one file".into()));
        }
        let fileset = FileSet::new(shareable_files, self.config.channel.chunk_bytes);
        let pool = SharedPool::create(fileset, self.config.pool.clone(), Arc::clone(&self.clock));
        let pool_key = self.next_pool_key.fetch_add(1, Ordering::AcqRel);
        self.pools.insert(pool_key, pool);
        info!(pool_key, "pool created");
        Ok(pool_key)
    }

    /// `destroy_pool`: `pool_key == 0` tears down every pool still at
    /// `pin_count() <= 1` (only the pool's own self-pin remaining).
    pub fn destroy_pool(&self, pool_key: u64) -> Result<()> {
        if pool_key == 0 {
            let keys: Vec<u64> = self
                .pools
                .iter()
                .filter(|e| e.value().pin_count() <= 1)
                .map(|e| *e.key())
                .collect();
            for key in keys {
                self.pools.remove(&key);
            }
            info!("all idle pools destroyed");
            return Ok(());
        }
        let pin = self
            .pools
            .get(&pool_key)
            .ok_or(CoreError::NoPool(pool_key))?
            .pin_count();
        if pin > 1 {
            return Err(CoreError::OutOfCapacity(format!(
                "pool {pool_key} still has {} attached channels",
                pin - 1
            )));
        }
        self.pools.remove(&pool_key);
        info!(pool_key, "pool destroyed");
        Ok(())
    }

    /// `open_channel`: attaches a new channel to `pool_key`, pinning it to
    /// the next CPU in round-robin order, and wires it to a fresh
    /// `FirehoseCtrl`. Returns the handle the host maps into its own
    /// address space alongside the switchboard.
    pub fn open_channel(
        &self,
        pool_key: u64,
        mapper: Arc<dyn GhostMapper>,
        channel_config: Option<ChannelConfig>,
    ) -> Result<OpenChannelHandle> {
        let pool = self
            .pools
            .get(&pool_key)
            .ok_or(CoreError::NoPool(pool_key))?
            .clone();
        let config = channel_config.unwrap_or_else(|| self.config.channel.clone());
        let channel = ChannelLifecycle::open(Arc::clone(&pool), config, mapper)?;
        let cpu = self.next_cpu.fetch_add(1, Ordering::AcqRel) % num_cpus::get().max(1);
        let firehose = FirehoseCtrl::new(
            Arc::clone(&channel),
            Arc::clone(&pool),
            Arc::clone(&self.transport),
            Arc::clone(&self.scheduler),
            cpu,
        );
        let handle = OpenChannelHandle {
            channel_id: channel.channel_id,
            switchboard: Arc::clone(channel.switchboard()),
            cpu,
        };
        self.channels.insert(
            channel.channel_id,
            OpenChannel {
                channel,
                firehose,
                pool_key,
            },
        );
        Ok(handle)
    }

    /// `close_channel`: drains and detaches the channel. On
    /// `CoreError::Timeout` (outstanding SPCBs still `INUSE`) the channel
    /// stays registered so the caller can retry via `drive_channel`/
    /// `wait_page_reclaim` and call this again. Idempotent per
    /// `ChannelLifecycle::close`'s own `NoChannel` once it has succeeded.
    pub fn close_channel(&self, channel_id: u64) -> Result<()> {
        let entry = self.channels.get(&channel_id).ok_or(CoreError::NoChannel(channel_id))?;
        let pool = self
            .pools
            .get(&entry.pool_key)
            .ok_or(CoreError::NoPool(entry.pool_key))?
            .clone();
        let channel = Arc::clone(&entry.channel);
        drop(entry);
        ChannelLifecycle::close(&channel, &pool)?;
        self.channels.remove(&channel_id);
        Ok(())
    }

    /// `wait_page_reclaim`: runs the channel's reclaim sweep until every
    /// contributed SPCB has drained, for a host that wants a synchronous
    /// drain point rather than polling stats.
    pub fn wait_page_reclaim(&self, channel_id: u64) -> Result<()> {
        let entry = self.channels.get(&channel_id).ok_or(CoreError::NoChannel(channel_id))?;
        let channel = Arc::clone(&entry.channel);
        drop(entry);
        const MAX_SWEEPS: usize = 10_000;
        for _ in 0..MAX_SWEEPS {
            channel.reclaim_contributions();
            if channel.num_contributed() == 0 {
                return Ok(());
            }
        }
        Err(CoreError::Timeout)
    }

    /// Drives one channel's firehose controller once. Exposed for hosts
    /// that run their own scheduling loop instead of using [`Scheduler`]'s
    /// timer/softirq callbacks directly.
    pub fn drive_channel(&self, channel_id: u64, reason: crate::firehose::WorkReason) -> Result<()> {
        let entry = self.channels.get(&channel_id).ok_or(CoreError::NoChannel(channel_id))?;
        entry.firehose.do_work(reason)
    }

    pub fn stat_board(&self, channel_id: u64) -> Result<ChannelStatsSnapshot> {
        let entry = self.channels.get(&channel_id).ok_or(CoreError::NoChannel(channel_id))?;
        Ok(entry.channel.stats.snapshot())
    }
}
