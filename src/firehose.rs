//! `FirehoseCtrl`: the per-channel driver tying `SharedPool`, `ChannelLocal`,
//! `BlockTransport`, and `Scheduler` together. `do_work` is the single entry
//! point the scheduler calls, whether woken by a timer or by a completion.

use crate::channel::ChannelLocal;
use crate::error::{CoreError, Result};
use crate::pool::{Derailed, SharedPool};
use crate::scheduler::Scheduler;
use crate::spcb::Spcb;
use crate::transport::{BlockTransport, CompletionResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkReason {
    /// Woken by a completion or a reclaim that freed a slot.
    Completion,
    /// A previous attempt found the free-slot queue empty.
    NoLocalPage,
    /// A timer re-check after `IoNotNeeded`.
    Timer,
}

/// Where a submitted chunk's destination buffer came from, carried through
/// to the completion closure so it's released to the right free-list on
/// failure.
enum SlotOrigin {
    Pool,
    Local(u32),
}

pub struct FirehoseCtrl {
    channel: Arc<ChannelLocal>,
    pool: Arc<SharedPool>,
    transport: Arc<dyn BlockTransport>,
    scheduler: Arc<dyn Scheduler>,
    cpu: usize,
    /// Bounds retry attempts on a ghost-table contention backoff so a
    /// persistently stuck slot doesn't retry forever.
    premap_retry_budget: AtomicUsize,
}

const MAX_PREMAP_RETRIES: usize = 8;

impl FirehoseCtrl {
    pub fn new(
        channel: Arc<ChannelLocal>,
        pool: Arc<SharedPool>,
        transport: Arc<dyn BlockTransport>,
        scheduler: Arc<dyn Scheduler>,
        cpu: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel,
            pool,
            transport,
            scheduler,
            cpu,
            premap_retry_budget: AtomicUsize::new(MAX_PREMAP_RETRIES),
        })
    }

    pub fn channel(&self) -> &Arc<ChannelLocal> {
        &self.channel
    }

    /// The scheduler's single call-in point. Runs the forceful-unmap /
    /// premap / reclaim sweep, decides whether more I/O is needed, and
    /// either submits one more chunk or returns having scheduled a retry.
    pub fn do_work(self: &Arc<Self>, reason: WorkReason) -> Result<()> {
        trace!(channel_id = self.channel.channel_id, ?reason, "do_work");

        self.channel.ghost_table().drain_done();
        self.channel.reclaim_local_slots();

        let now = self.pool.now_ns();
        let forced = self
            .channel
            .ghost_table()
            .forceful_unmap_scan(self.channel.local_bitvector(), now);
        if let Some(&max_chunk) = forced.iter().max() {
            self.channel.stats.record_forceful_unmap();
            self.channel.raise_forceful_unmap_watermark(max_chunk);
        }

        let distance_from_head = self.premap_from_pool();

        let reclaimed = self.channel.reclaim_contributions();
        if reclaimed > 0 {
            debug!(channel_id = self.channel.channel_id, reclaimed, "reclaim sweep");
        }

        self.channel
            .check_falling_behind(self.channel.premap_high_watermark());

        let l = self.pool.consumable_chunks_per_jiffy();
        let watermark = 2 * l;
        if distance_from_head >= watermark {
            trace!(channel_id = self.channel.channel_id, distance_from_head, watermark, "io not needed");
            return Ok(());
        }
        if !self.pool.try_admit_io(distance_from_head, watermark) {
            trace!(channel_id = self.channel.channel_id, "io admission lost race, deferring");
            return Ok(());
        }

        if self.channel.is_derailed() {
            self.submit_derailed()
        } else {
            self.submit_on_track()
        }
    }

    /// Implements §4.8: installs ghost-table mappings for chunks already
    /// valid in the shared pool, without issuing new I/O. Returns
    /// `distance_from_head` for the caller's admission decision.
    fn premap_from_pool(self: &Arc<Self>) -> u64 {
        let head = self.pool.head();
        let consumed = self.channel.switchboard().consumed.load(Ordering::Acquire);
        let distance_from_head = head.saturating_sub(consumed);

        let total = self.pool.total_chunks().max(1);
        let start = self.channel.consume_indicator().start_chunk_id_no_mod;
        let low = self.channel.forceful_unmap_watermark().max(start);
        if head == 0 || head <= low + 1 {
            return distance_from_head;
        }

        let now = self.pool.now_ns();
        let jiffy_ns = self.pool.config().jiffy_ns;
        let batch = self.channel.config().premap_batch;
        let both_bits = crate::bitvector::VALID | crate::bitvector::REFERENCED;

        let mut prepared: Vec<(u64, u64, Arc<Spcb>)> = Vec::with_capacity(batch);
        let mut m = head - 1;
        loop {
            if prepared.len() >= batch {
                break;
            }
            let chunk_id = m % total;
            if !self.channel.local_bitvector().is_set(chunk_id) {
                let cell = self.pool.shared_bitvector().read_cell(chunk_id);
                if cell & both_bits == both_bits {
                    if let Some(spcb) = self.pool.lookup(chunk_id) {
                        if spcb.chunk_id() == chunk_id && spcb.exp_deadline_ns() > now + jiffy_ns {
                            self.channel.local_bitvector().test_and_set_leaf(chunk_id);
                            prepared.push((m, chunk_id, spcb));
                        } else {
                            self.pool.release(&spcb);
                        }
                    }
                }
            }
            if m == low + 1 {
                break;
            }
            m -= 1;
        }

        prepared.sort_by_key(|(m, _, _)| *m);
        for (m, chunk_id, spcb) in prepared {
            let distance = head.saturating_sub(m);
            match self.channel.ghost_table().try_premap(Arc::clone(&spcb), chunk_id, m, distance) {
                Ok(_) => self.channel.stats.record_io_on_track(),
                Err(e) => {
                    warn!(channel_id = self.channel.channel_id, chunk_id, error = %e, "premap-from-pool skipped");
                    self.pool.release(&spcb);
                }
            }
        }

        self.channel.raise_premap_high_watermark(head);
        distance_from_head
    }

    fn submit_on_track(self: &Arc<Self>) -> Result<()> {
        let start = self.channel.consume_indicator().start_chunk_id_no_mod;
        let monotonic_id = match self.pool.allocate_head(self.channel.channel_id, start) {
            Ok(h) => h,
            Err(Derailed) => {
                self.channel.derail();
                self.pool.release_io_admission();
                return Ok(());
            }
        };
        self.channel.mark_on_track();
        let chunk_id = monotonic_id % self.pool.total_chunks().max(1);

        let Some(spcb) = self.pool.acquire_free_slot() else {
            self.pool.release_io_admission();
            self.schedule_retry(WorkReason::NoLocalPage);
            return Ok(());
        };
        spcb.set_chunk_id(chunk_id);
        spcb.set_used(true);
        spcb.set_shared(false);
        spcb.acquire_ref();
        self.submit(spcb, chunk_id, monotonic_id, true, SlotOrigin::Pool)
    }

    fn submit_derailed(self: &Arc<Self>) -> Result<()> {
        let start = self.channel.consume_indicator().start_chunk_id_no_mod;
        let Some(chunk_id) = self.channel.next_unobtained_chunk(start) else {
            self.pool.release_io_admission();
            return Ok(());
        };
        let Some(spcb) = self.channel.acquire_local_slot() else {
            self.pool.release_io_admission();
            self.schedule_retry(WorkReason::NoLocalPage);
            return Ok(());
        };
        let slot_idx = spcb.slot_idx;
        spcb.set_chunk_id(chunk_id);
        spcb.set_used(true);
        spcb.acquire_ref();
        self.submit(spcb, chunk_id, chunk_id, false, SlotOrigin::Local(slot_idx))
    }

    fn submit(
        self: &Arc<Self>,
        spcb: Arc<Spcb>,
        chunk_id: u64,
        monotonic_id: u64,
        on_track: bool,
        origin: SlotOrigin,
    ) -> Result<()> {
        let Some((file_entry, chunk_in_file, chunk_size)) = self.pool.fileset().locate(chunk_id) else {
            self.release_slot(&spcb, &origin);
            self.pool.release_io_admission();
            return Err(CoreError::OutOfCapacity(format!("no file covers chunk {chunk_id}")));
        };
        let file_id = file_entry.file_id;
        let destination = spcb.page().ptr as *mut u8;
        let this = Arc::clone(self);
        let spcb_for_cb = Arc::clone(&spcb);
        debug!(channel_id = self.channel.channel_id, chunk_id, on_track, "submitting io");
        self.transport.submit(
            file_id,
            chunk_in_file,
            destination,
            chunk_size as usize,
            Box::new(move |result| {
                this.handle_completion(result, spcb_for_cb, chunk_id, monotonic_id, on_track, origin);
            }),
        );
        Ok(())
    }

    fn release_slot(&self, spcb: &Arc<Spcb>, origin: &SlotOrigin) {
        match origin {
            SlotOrigin::Pool => self.pool.return_free_slot(spcb.slot_idx),
            SlotOrigin::Local(idx) => self.channel.return_local_slot(*idx),
        }
    }

    fn handle_completion(
        self: &Arc<Self>,
        result: CompletionResult,
        spcb: Arc<Spcb>,
        chunk_id: u64,
        monotonic_id: u64,
        on_track: bool,
        origin: SlotOrigin,
    ) {
        self.pool.release_io_admission();
        match result {
            Ok(completion) => {
                spcb.set_chunk_size(completion.filled_bytes);
                self.channel.local_bitvector().test_and_set_leaf(chunk_id);
                if on_track {
                    self.pool.publish(Arc::clone(&spcb));
                    self.channel.push_contribution(Arc::clone(&spcb));
                } else {
                    // Private buffers never expire via the pool's policy;
                    // the channel itself owns their lifetime.
                    spcb.set_exp_deadline_ns(u64::MAX);
                }
                self.try_premap_with_retry(spcb, chunk_id, monotonic_id, on_track, origin);
                if on_track {
                    self.channel.stats.record_io_on_track();
                } else {
                    self.channel.stats.record_io_derailed(completion.filled_bytes as u64);
                }
            }
            Err(e) => {
                error!(channel_id = self.channel.channel_id, chunk_id, reason = %e.reason, "transport error");
                self.channel.switchboard().set_error();
                self.release_slot(&spcb, &origin);
            }
        }
    }

    fn try_premap_with_retry(
        self: &Arc<Self>,
        spcb: Arc<Spcb>,
        chunk_id: u64,
        monotonic_id: u64,
        on_track: bool,
        origin: SlotOrigin,
    ) {
        let distance_from_head = self.pool.head().saturating_sub(monotonic_id);
        match self.channel.ghost_table().try_premap(Arc::clone(&spcb), chunk_id, monotonic_id, distance_from_head) {
            Ok(_) => {}
            Err(CoreError::ContentionBackoff(_)) if self.premap_retry_budget.load(Ordering::Relaxed) > 0 => {
                self.premap_retry_budget.fetch_sub(1, Ordering::Relaxed);
                warn!(channel_id = self.channel.channel_id, chunk_id, "premap backoff, scheduling retry");
                let this = Arc::clone(self);
                self.scheduler.timer_after(
                    Duration::from_nanos(self.pool.config().jiffy_ns),
                    Box::new(move || {
                        this.try_premap_with_retry(spcb, chunk_id, monotonic_id, on_track, origin);
                    }),
                );
            }
            Err(e) => {
                warn!(channel_id = self.channel.channel_id, chunk_id, error = %e, "premap failed, giving up");
                self.release_slot(&spcb, &origin);
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, reason: WorkReason) {
        let this = Arc::clone(self);
        self.scheduler.timer_after(
            Duration::from_nanos(self.pool.config().jiffy_ns),
            Box::new(move || {
                let _ = this.do_work(reason);
            }),
        );
    }

    pub fn cpu(&self) -> usize {
        self.cpu
    }
}
