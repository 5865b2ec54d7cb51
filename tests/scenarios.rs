//! End-to-end scenarios driving `CoreRuntime` through the fake transport,
//! scheduler, and ghost mapper. Each test stands in for a slice of real
//! host/consumer behavior: a host thread calling `drive_channel` on
//! completions and timers, and a consumer thread polling the switchboard
//! ring. Scenario numbering (S1..S5) follows the design notes.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use zicio_core::clock::FakeClock;
use zicio_core::config::{ChannelConfig, Config, PoolConfig};
use zicio_core::firehose::WorkReason;
use zicio_core::mapper::FakeGhostMapper;
use zicio_core::scheduler::FakeScheduler;
use zicio_core::switchboard::{EntryStatus, Switchboard};
use zicio_core::transport::FakeBlockTransport;
use zicio_core::{CoreError, CoreRuntime};

const CHUNK_BYTES: u64 = 2 * 1024 * 1024;

/// Stands in for the external consumer thread: walks the ring strictly from
/// `user_buffer_idx` forward, draining every consecutive `READY` entry it
/// finds (mirroring the documented spin-loop contract), and advances the
/// consumer-owned counters a real consumer would own. Stops at the first
/// non-`READY` entry. Returns how many chunks it consumed this call.
fn drain_consumer(switchboard: &Switchboard) -> usize {
    let mut drained = 0;
    loop {
        let idx = switchboard.user_buffer_idx.load(Ordering::Acquire) as usize % switchboard.len();
        let entry = &switchboard.entries[idx];
        if entry.consumer_begin().is_err() {
            break;
        }
        entry.consumer_finish();
        switchboard.consumed.fetch_add(1, Ordering::AcqRel);
        switchboard.nr_consumed_chunk.fetch_add(1, Ordering::AcqRel);
        switchboard
            .user_buffer_idx
            .store(((idx + 1) % switchboard.len()) as i32, Ordering::Release);
        switchboard.record_consume_delta(1_000_000);
        drained += 1;
    }
    drained
}

/// S1: a single channel reading a single file start to finish, on-track the
/// whole way, with no forceful unmaps.
#[test]
fn single_channel_consumes_whole_file_on_track() {
    const FILE_ID: u32 = 1;
    const FILE_BYTES: u64 = 4 * CHUNK_BYTES; // 2 chunks

    let config = Config::default();
    let clock = Arc::new(FakeClock::new());
    let scheduler = FakeScheduler::new();
    let transport = Arc::new(FakeBlockTransport::new(true));
    transport.register_file(FILE_ID, vec![7u8; FILE_BYTES as usize]);

    let runtime = CoreRuntime::new(config.clone(), clock.clone(), scheduler.clone(), transport);
    let pool_key = runtime.create_pool(&[(FILE_ID, FILE_BYTES)]).unwrap();
    let mapper = Arc::new(FakeGhostMapper::new(config.channel.ghost_table_slots));
    let handle = runtime.open_channel(pool_key, mapper, None).unwrap();

    let total_chunks = FILE_BYTES.div_ceil(CHUNK_BYTES);
    for _ in 0..total_chunks * 2 {
        if handle.switchboard.nr_consumed_chunk.load(Ordering::Acquire) >= total_chunks {
            break;
        }
        runtime.drive_channel(handle.channel_id, WorkReason::Completion).unwrap();
        drain_consumer(&handle.switchboard);
        clock.advance_ns(config.pool.jiffy_ns);
        scheduler.advance(config.pool.jiffy_ns);
    }

    let stats = runtime.stat_board(handle.channel_id).unwrap();
    assert_eq!(
        handle.switchboard.nr_consumed_chunk.load(Ordering::Acquire),
        total_chunks,
        "whole file should have been consumed"
    );
    assert_eq!(stats.io_on_track, total_chunks);
    assert_eq!(stats.io_derailed, 0);
    assert_eq!(stats.forcefully_unmapped, 0);
}

/// S2: two channels sharing one pool, one draining every tick and one never
/// draining. The neglectful channel falls behind the pool's consumption-rate
/// estimate and gets forcefully unmapped; the attentive channel still reads
/// every chunk in the file.
#[test]
fn slow_channel_gets_forcefully_unmapped() {
    const FILE_ID: u32 = 1;
    const FILE_BYTES: u64 = 10 * CHUNK_BYTES;

    let config = Config::default();
    let clock = Arc::new(FakeClock::new());
    let scheduler = FakeScheduler::new();
    let transport = Arc::new(FakeBlockTransport::new(true));
    transport.register_file(FILE_ID, vec![9u8; FILE_BYTES as usize]);

    let runtime = CoreRuntime::new(config.clone(), clock.clone(), scheduler.clone(), transport);
    let pool_key = runtime.create_pool(&[(FILE_ID, FILE_BYTES)]).unwrap();

    let mapper_fast = Arc::new(FakeGhostMapper::new(config.channel.ghost_table_slots));
    let fast = runtime.open_channel(pool_key, mapper_fast, None).unwrap();
    let mapper_slow = Arc::new(FakeGhostMapper::new(config.channel.ghost_table_slots));
    let slow = runtime.open_channel(pool_key, mapper_slow, None).unwrap();

    let total_chunks = FILE_BYTES.div_ceil(CHUNK_BYTES);
    let mut rounds = 0;
    loop {
        rounds += 1;
        clock.advance_ns(config.pool.jiffy_ns);
        scheduler.advance(config.pool.jiffy_ns);

        runtime.drive_channel(fast.channel_id, WorkReason::Completion).unwrap();
        drain_consumer(&fast.switchboard);

        // The slow channel is driven (so it keeps premapping/participating)
        // but its consumer thread never shows up to drain the ring.
        runtime.drive_channel(slow.channel_id, WorkReason::Completion).unwrap();

        let slow_stats = runtime.stat_board(slow.channel_id).unwrap();
        let fast_done = fast.switchboard.nr_consumed_chunk.load(Ordering::Acquire) >= total_chunks;
        if (slow_stats.forcefully_unmapped > 0 && fast_done) || rounds > 500 {
            break;
        }
    }

    let fast_stats = runtime.stat_board(fast.channel_id).unwrap();
    let slow_stats = runtime.stat_board(slow.channel_id).unwrap();
    assert_eq!(
        fast.switchboard.nr_consumed_chunk.load(Ordering::Acquire),
        total_chunks,
        "attentive channel should still finish the file"
    );
    assert_eq!(fast_stats.forcefully_unmapped, 0);
    assert!(
        slow_stats.forcefully_unmapped > 0,
        "neglectful channel should have been forcefully unmapped at least once"
    );
}

/// S3: a channel whose first chunk request is already too far behind the
/// pool's head derails immediately, and finishes the file entirely through
/// its own private local-buffer I/O instead of the shared pool path.
#[test]
fn derailed_channel_reads_whole_file_through_private_buffers() {
    const FILE_ID: u32 = 1;
    const FILE_BYTES: u64 = 4 * CHUNK_BYTES; // T = 4

    let config = Config::default();
    let clock = Arc::new(FakeClock::new());
    let scheduler = FakeScheduler::new();
    let transport = Arc::new(FakeBlockTransport::new(true));
    transport.register_file(FILE_ID, vec![3u8; FILE_BYTES as usize]);

    let runtime = CoreRuntime::new(config.clone(), clock.clone(), scheduler.clone(), transport);
    let pool_key = runtime.create_pool(&[(FILE_ID, FILE_BYTES)]).unwrap();

    let mapper_fast = Arc::new(FakeGhostMapper::new(config.channel.ghost_table_slots));
    let fast = runtime.open_channel(pool_key, mapper_fast, None).unwrap();
    // Drive the fast channel far past the whole file's worth of chunks so the
    // pool's head runs well ahead before the slow channel ever shows up.
    for _ in 0..40 {
        runtime.drive_channel(fast.channel_id, WorkReason::Completion).unwrap();
        drain_consumer(&fast.switchboard);
        clock.advance_ns(config.pool.jiffy_ns);
        scheduler.advance(config.pool.jiffy_ns);
    }

    let mapper_slow = Arc::new(FakeGhostMapper::new(config.channel.ghost_table_slots));
    let slow = runtime.open_channel(pool_key, mapper_slow, None).unwrap();

    let total_chunks = FILE_BYTES.div_ceil(CHUNK_BYTES);
    for _ in 0..20 {
        if slow.switchboard.nr_consumed_chunk.load(Ordering::Acquire) >= total_chunks {
            break;
        }
        runtime.drive_channel(slow.channel_id, WorkReason::Completion).unwrap();
        drain_consumer(&slow.switchboard);
        clock.advance_ns(config.pool.jiffy_ns);
        scheduler.advance(config.pool.jiffy_ns);
    }

    let slow_stats = runtime.stat_board(slow.channel_id).unwrap();
    assert_eq!(
        slow.switchboard.nr_consumed_chunk.load(Ordering::Acquire),
        total_chunks,
        "derailed channel should still read the whole file"
    );
    assert!(
        slow_stats.io_derailed > 0,
        "the slow channel's reads should have gone through the derailed path"
    );
}

/// S4 (scaled down from 64/65 for test tractability): with the pool's shared
/// huge-page slot cap smaller than the number of distinct chunks a channel
/// needs, at least one acquisition attempt has to park on `NoLocalPage` and
/// get woken by a retry timer once reclaim frees a slot back up. No request
/// is ever lost.
#[test]
fn id_queue_exhaustion_parks_and_recovers_without_deadlock() {
    const FILE_ID: u32 = 1;
    const FILE_BYTES: u64 = 6 * CHUNK_BYTES; // 6 chunks, only 2 shared slots

    let config = Config {
        pool: PoolConfig {
            max_spcbs: 2,
            ..PoolConfig::default()
        },
        channel: ChannelConfig::default(),
    };
    let clock = Arc::new(FakeClock::new());
    let scheduler = FakeScheduler::new();
    let transport = Arc::new(FakeBlockTransport::new(true));
    transport.register_file(FILE_ID, vec![5u8; FILE_BYTES as usize]);

    let runtime = CoreRuntime::new(config.clone(), clock.clone(), scheduler.clone(), transport);
    let pool_key = runtime.create_pool(&[(FILE_ID, FILE_BYTES)]).unwrap();
    let mapper = Arc::new(FakeGhostMapper::new(config.channel.ghost_table_slots));
    let handle = runtime.open_channel(pool_key, mapper, None).unwrap();

    let total_chunks = FILE_BYTES.div_ceil(CHUNK_BYTES);
    for _ in 0..200 {
        if handle.switchboard.nr_consumed_chunk.load(Ordering::Acquire) >= total_chunks {
            break;
        }
        runtime.drive_channel(handle.channel_id, WorkReason::Completion).unwrap();
        drain_consumer(&handle.switchboard);
        clock.advance_ns(config.pool.jiffy_ns);
        scheduler.advance(config.pool.jiffy_ns);
    }

    assert_eq!(
        handle.switchboard.nr_consumed_chunk.load(Ordering::Acquire),
        total_chunks,
        "every chunk should eventually complete despite the tight shared-slot cap"
    );
}

/// S5: the consumer stops reading with chunks sitting `READY` in the ring.
/// Closing the channel must forcefully unmap them rather than leaving them
/// stuck, and must succeed even though nothing ever drained them.
#[test]
fn close_forcefully_reclaims_unconsumed_ready_slots() {
    const FILE_ID: u32 = 1;
    const FILE_BYTES: u64 = 2 * CHUNK_BYTES;

    let config = Config::default();
    let clock = Arc::new(FakeClock::new());
    let scheduler = FakeScheduler::new();
    let transport = Arc::new(FakeBlockTransport::new(true));
    transport.register_file(FILE_ID, vec![1u8; FILE_BYTES as usize]);

    let runtime = CoreRuntime::new(config.clone(), clock.clone(), scheduler.clone(), transport);
    let pool_key = runtime.create_pool(&[(FILE_ID, FILE_BYTES)]).unwrap();
    let mapper = Arc::new(FakeGhostMapper::new(config.channel.ghost_table_slots));
    let handle = runtime.open_channel(pool_key, mapper, None).unwrap();

    // Let both chunks land READY; the consumer never drains them.
    for _ in 0..4 {
        runtime.drive_channel(handle.channel_id, WorkReason::Completion).unwrap();
        clock.advance_ns(config.pool.jiffy_ns);
        scheduler.advance(config.pool.jiffy_ns);
    }
    assert_eq!(handle.switchboard.entries[0].status(), EntryStatus::Ready);
    assert_eq!(handle.switchboard.entries[1].status(), EntryStatus::Ready);

    runtime.close_channel(handle.channel_id).unwrap();

    assert_eq!(handle.switchboard.entries[0].status(), EntryStatus::Empty);
    assert_eq!(handle.switchboard.entries[1].status(), EntryStatus::Empty);
    assert!(runtime.stat_board(handle.channel_id).is_err(), "channel should be gone after close");
}

/// S5b: a slot the consumer has actually started reading (`INUSE`) can't be
/// forced. Closing while one is outstanding must not report success; it must
/// time out and leave the channel registered so the caller can retry once the
/// consumer finishes.
#[test]
fn close_times_out_on_inuse_slot_then_succeeds_once_consumer_finishes() {
    const FILE_ID: u32 = 1;
    const FILE_BYTES: u64 = CHUNK_BYTES;

    let config = Config::default();
    let clock = Arc::new(FakeClock::new());
    let scheduler = FakeScheduler::new();
    let transport = Arc::new(FakeBlockTransport::new(true));
    transport.register_file(FILE_ID, vec![2u8; FILE_BYTES as usize]);

    let runtime = CoreRuntime::new(config.clone(), clock.clone(), scheduler.clone(), transport);
    let pool_key = runtime.create_pool(&[(FILE_ID, FILE_BYTES)]).unwrap();
    let mapper = Arc::new(FakeGhostMapper::new(config.channel.ghost_table_slots));
    let handle = runtime.open_channel(pool_key, mapper, None).unwrap();

    runtime.drive_channel(handle.channel_id, WorkReason::Completion).unwrap();
    assert_eq!(handle.switchboard.entries[0].status(), EntryStatus::Ready);

    // Consumer starts reading but never finishes: READY -> INUSE.
    handle.switchboard.entries[0].consumer_begin().unwrap();
    assert_eq!(handle.switchboard.entries[0].status(), EntryStatus::Inuse);

    let result = runtime.close_channel(handle.channel_id);
    assert!(
        matches!(result, Err(CoreError::Timeout)),
        "close must not report success while a slot is still INUSE, got {result:?}"
    );
    assert_eq!(
        handle.switchboard.entries[0].status(),
        EntryStatus::Inuse,
        "an in-progress read must never be forced"
    );
    assert!(
        runtime.stat_board(handle.channel_id).is_ok(),
        "channel must stay registered after a close timeout so the caller can retry"
    );

    // Consumer finally finishes; advance time past the SPCB's expiry so the
    // reclaimer will actually pull it off the contribute queue, then retry.
    handle.switchboard.entries[0].consumer_finish();
    clock.advance_ns(5 * config.pool.jiffy_ns);
    runtime.close_channel(handle.channel_id).unwrap();
    assert!(runtime.stat_board(handle.channel_id).is_err(), "channel should be gone after close");
}
