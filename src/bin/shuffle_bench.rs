//! In-process shuffle soak driver.
//!
//! Spins up an N-rank world inside one process (threads + loopback
//! transport), pushes a configurable number of records per rank per epoch
//! through the selected backend, walks the epoch ladder and verifies mass
//! conservation at the end. Useful for exercising the full shuffle path
//! without MPI, and as a quick relative benchmark of the two backends.
//!
//! Usage:
//!   shuffle_bench --ranks 8 --records 100000 --epochs 3 --multihop

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;

use shufflefs::comm::{LocalCluster, ProcessGroup};
use shufflefs::config::ShuffleConfig;
use shufflefs::shuffler::ShuffleContext;
use shufflefs::sink::MemorySink;
use shufflefs::transport::LoopbackFabric;

#[derive(Parser, Debug)]
#[command(name = "shuffle_bench")]
#[command(about = "In-process particle shuffle soak driver")]
struct Args {
    /// Number of in-process ranks
    #[arg(long, default_value_t = 4)]
    ranks: usize,

    /// Records per rank per epoch
    #[arg(long, default_value_t = 100_000)]
    records: usize,

    /// Number of epochs
    #[arg(long, default_value_t = 3)]
    epochs: u32,

    /// Receiver radix (0..=8): bits cleared in the receiver mask
    #[arg(long, default_value_t = 0)]
    recv_radix: u32,

    /// Use the multi-hop XN backend instead of NN
    #[arg(long)]
    multihop: bool,

    /// Disable the local-bypass fast path
    #[arg(long)]
    force_rpc: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let args = Args::parse();
    shufflefs::logging::init_with_hostname(&args.log_level);

    tracing::info!(
        "shuffle_bench: {} ranks, {} records/rank/epoch, {} epochs, backend={}, radix={}",
        args.ranks,
        args.records,
        args.epochs,
        if args.multihop { "xn" } else { "nn" },
        args.recv_radix,
    );

    let groups = LocalCluster::new(args.ranks);
    let fabric = LoopbackFabric::new(args.ranks);
    let start = Instant::now();

    let handles: Vec<_> = groups
        .into_iter()
        .enumerate()
        .map(|(rank, group)| {
            let fabric = fabric.clone();
            let args = RankArgs::from(&args);
            std::thread::Builder::new()
                .name(format!("bench-rank-{}", rank))
                .spawn(move || run_rank(rank as i32, group, fabric, args))
                .expect("failed to spawn rank thread")
        })
        .collect();

    let results: Vec<RankResult> = handles
        .into_iter()
        .map(|h| h.join().expect("rank thread panicked"))
        .collect();

    let elapsed = start.elapsed();
    let submitted: u64 = results.iter().map(|r| r.submitted).sum();
    let delivered: u64 = results.iter().map(|r| r.delivered).sum();

    tracing::info!(
        "shuffle_bench done: {} submitted, {} delivered in {:.3}s ({:.0} records/s)",
        submitted,
        delivered,
        elapsed.as_secs_f64(),
        submitted as f64 / elapsed.as_secs_f64(),
    );

    if submitted != delivered {
        tracing::error!(
            "record conservation violated: {} submitted != {} delivered",
            submitted,
            delivered
        );
        std::process::exit(1);
    }
}

#[derive(Clone)]
struct RankArgs {
    records: usize,
    epochs: u32,
    recv_radix: u32,
    multihop: bool,
    force_rpc: bool,
}

impl From<&Args> for RankArgs {
    fn from(a: &Args) -> Self {
        Self {
            records: a.records,
            epochs: a.epochs,
            recv_radix: a.recv_radix,
            multihop: a.multihop,
            force_rpc: a.force_rpc,
        }
    }
}

struct RankResult {
    submitted: u64,
    delivered: u64,
}

fn run_rank(
    rank: i32,
    group: Arc<shufflefs::comm::local::LocalGroup>,
    fabric: Arc<LoopbackFabric>,
    args: RankArgs,
) -> RankResult {
    let mut cfg = ShuffleConfig::default().with_record_shape(16, 32, 0);
    cfg.recv_radix = args.recv_radix;
    cfg.use_multihop = args.multihop;
    cfg.force_rpc = args.force_rpc;
    cfg.subnet = "127.".to_string();

    let sink = Arc::new(MemorySink::new());
    let transport = Box::new(fabric.endpoint(rank));
    let group: Arc<dyn ProcessGroup> = group;

    let ctx = ShuffleContext::init(cfg, group, transport, sink.clone())
        .expect("shuffle init failed");

    let mut submitted = 0u64;
    let mut data = [0u8; 32];
    for epoch in 0..args.epochs {
        for i in 0..args.records {
            let seq = epoch as usize * args.records + i;
            let fname = format!("{:08}.{:07}", rank, seq % 10_000_000);
            data[..8].copy_from_slice(&(seq as u64).to_le_bytes());
            ctx.write(fname.as_bytes(), &data, epoch)
                .expect("shuffle write failed");
            submitted += 1;
        }

        if epoch + 1 < args.epochs {
            ctx.rotate_epoch();
            let snap = ctx.monitor_snapshot();
            tracing::debug!(
                "rank {} epoch {}: {} sends, {} recvs",
                rank,
                epoch,
                snap.total_sends(),
                snap.total_recvs(),
            );
        } else {
            ctx.epoch_end();
        }
    }

    ctx.finalize();

    RankResult {
        submitted,
        delivered: sink.len() as u64,
    }
}
