//! Demo driver for the zicio core.
//!
//! Stands up one pool over an in-memory file, opens a single channel against
//! a `FakeBlockTransport`/`FakeScheduler`/`FakeGhostMapper` triple, and drives
//! `FirehoseCtrl::do_work` by hand until the file has been fully consumed.
//! There is no real NVMe device or VA window behind this binary; it exists to
//! exercise the whole pool/channel/firehose path end to end without a kernel
//! module.

use std::sync::Arc;
use tracing::info;
use zicio_core::clock::FakeClock;
use zicio_core::config::Config;
use zicio_core::firehose::WorkReason;
use zicio_core::mapper::FakeGhostMapper;
use zicio_core::scheduler::FakeScheduler;
use zicio_core::transport::FakeBlockTransport;
use zicio_core::CoreRuntime;

const FILE_ID: u32 = 1;
const FILE_BYTES: u64 = 8 * 1024 * 1024;

fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .init();

    print_banner();

    let config = Config::default();
    let clock = Arc::new(FakeClock::new());
    let scheduler = FakeScheduler::new();
    let transport = Arc::new(FakeBlockTransport::new(true));
    transport.register_file(FILE_ID, vec![0xab; FILE_BYTES as usize]);

    let runtime = CoreRuntime::new(config.clone(), clock.clone(), scheduler.clone(), transport);

    let pool_key = runtime
        .create_pool(&[(FILE_ID, FILE_BYTES)])
        .expect("create_pool");
    info!(pool_key, "pool ready");

    let mapper = Arc::new(FakeGhostMapper::new(config.channel.ghost_table_slots));
    let handle = runtime
        .open_channel(pool_key, mapper, None)
        .expect("open_channel");
    info!(channel_id = handle.channel_id, cpu = handle.cpu, "channel open");

    let total_chunks = FILE_BYTES.div_ceil(config.channel.chunk_bytes);
    for round in 0..total_chunks + 4 {
        runtime
            .drive_channel(handle.channel_id, WorkReason::Completion)
            .expect("drive_channel");
        scheduler.advance(config.pool.jiffy_ns);
        clock.advance_ns(config.pool.jiffy_ns);
        let stats = runtime.stat_board(handle.channel_id).expect("stat_board");
        info!(round, io_on_track = stats.io_on_track, io_derailed = stats.io_derailed, "tick");
    }

    let stats = runtime.stat_board(handle.channel_id).expect("stat_board");
    println!();
    println!("╭─────────────────────────────────────────────╮");
    println!("│ channel {:<3} final stats                    │", handle.channel_id);
    println!("├─────────────────────────────────────────────┤");
    println!("│ io_on_track          {:<22} │", stats.io_on_track);
    println!("│ io_derailed           {:<22} │", stats.io_derailed);
    println!("│ forcefully_unmapped   {:<22} │", stats.forcefully_unmapped);
    println!("╰─────────────────────────────────────────────╯");

    runtime.close_channel(handle.channel_id).expect("close_channel");
    runtime.destroy_pool(pool_key).expect("destroy_pool");
    info!("shutdown complete");
}

fn print_banner() {
    println!("╔═══════════════════════════════════════════════════╗");
    println!("║  zicio-coreutil - shared-pool / ghost-mapping demo ║");
    println!("╚═══════════════════════════════════════════════════╝");
    println!();
}
