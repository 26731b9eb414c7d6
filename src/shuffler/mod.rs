//! Shuffle context and lifecycle.
//!
//! [`ShuffleContext`] is the handle the preload layer above us drives: one
//! per process, created collectively at startup and torn down collectively
//! at exit. It owns the selected backend and the placement engine, derives
//! the receiver subset, routes each submitted record (local bypass or RPC)
//! and walks the epoch ladder between simulation timesteps.
//!
//! Threading: one caller thread invokes `write` and the epoch transitions;
//! the backend runs its own progress thread which invokes the delivery
//! handler. Counters cross that boundary through atomics, everything else
//! stays on the caller thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use xxhash_rust::xxh32::xxh32;

use crate::backend::{Backend, BackendReport, DeliveryHandler, NnReport, XnReport};
use crate::comm::{ProcessGroup, Rank, ReduceOp};
use crate::config::ShuffleConfig;
use crate::error::ShuffleResult;
use crate::logging;
use crate::monitor::MonitorStats;
use crate::placement::{modulo_bypass, placement_key, PlacementEngine};
use crate::sink::ParticleSink;
use crate::stats::{pretty_num, pretty_size, CpuUsage, Histogram, TaggedUsage, PTILE_FRAC, PTILE_INT};
use crate::transport::{prepare_uri, Transport};
use crate::wire::FrameSpec;

mod trace;

pub use trace::TraceLog;

/// Process-wide shuffle handle.
pub struct ShuffleContext {
    cfg: ShuffleConfig,
    frame: FrameSpec,
    backend: Backend,
    placement: Option<PlacementEngine>,
    receiver_mask: u32,
    receiver_rate: u32,
    world: Arc<dyn ProcessGroup>,
    recv_comm: Option<Arc<dyn ProcessGroup>>,
    sink: Arc<dyn ParticleSink>,
    trace: Option<Arc<TraceLog>>,
    mon: Mutex<MonitorStats>,
    bypass_writes: AtomicU64,
    last_bypass_writes: AtomicU64,
    uri: String,
    rank: Rank,
    size: Rank,
    main_usage_start: CpuUsage,
}

impl ShuffleContext {
    /// Collective initialization; every rank of the group must call this
    /// with an identical configuration.
    pub fn init(
        cfg: ShuffleConfig,
        group: Arc<dyn ProcessGroup>,
        transport: Box<dyn Transport>,
        sink: Arc<dyn ParticleSink>,
    ) -> ShuffleResult<Self> {
        let frame = cfg.validate()?;
        let rank = group.rank();
        let size = group.size();
        assert_eq!(transport.rank(), rank, "transport rank disagrees with group");
        assert_eq!(transport.size(), size, "transport size disagrees with group");

        logging::set_log_rank(rank);

        if rank == 0 {
            if cfg.finalize_pause_secs > 0 {
                tracing::info!("shuffle finalize pause: {} secs", cfg.finalize_pause_secs);
            }
            if cfg.force_rpc {
                tracing::info!(
                    "shuffle force_rpc is ON\n>>> will always invoke shuffle even addr is local"
                );
            } else {
                tracing::warn!(
                    "shuffle force_rpc is OFF (will skip shuffle if addr is local)\n>>> \
                     main thread may be blocked on writing"
                );
            }
            if cfg.use_multihop {
                tracing::info!("using the scalable multi-hop shuffler");
            } else {
                tracing::warn!(
                    "using the default NN shuffler: code might not scale well\n>>> \
                     switch to the multi-hop shuffler for better scalability"
                );
            }
        }

        // endpoint probing happens before any backend state exists; probe
        // sockets are closed inside
        let uri = prepare_uri(&cfg, &group)?;

        let trace = match &cfg.test_log {
            Some(path) => Some(Arc::new(TraceLog::create(path)?)),
            None => None,
        };

        let delivery: Arc<dyn DeliveryHandler> = Arc::new(ShuffleDelivery {
            frame,
            sink: sink.clone(),
            trace: trace.clone(),
        });

        let backend = if cfg.use_multihop {
            // node layout for the overlay: the representative of each rank
            // is the lowest world rank on its node
            let local = group.split_node_local();
            let local_world = local.allgather_i32(rank);
            let my_rep = local_world[0];
            let reps = group.allgather_i32(my_rep);
            Backend::Xn(crate::backend::XnShuffler::new(
                transport,
                delivery,
                reps,
                cfg.queue_depth,
            ))
        } else {
            Backend::Nn(crate::backend::NnShuffler::new(
                transport,
                delivery,
                cfg.queue_depth,
                cfg.force_sync,
            ))
        };

        let placement = if cfg.bypass_placement {
            None
        } else {
            Some(PlacementEngine::new(
                cfg.placement_protocol,
                size,
                cfg.virtual_factor,
                0,
            ))
        };

        if rank == 0 {
            if placement.is_some() {
                tracing::info!(
                    "ch-placement group size: {} (vir-factor: {}, proto: {})\n>>> \
                     possible protocols are: static_modulo, hash_lookup3, xor, and ring",
                    pretty_num(size as f64),
                    pretty_num(cfg.virtual_factor as f64),
                    cfg.placement_protocol
                );
            } else {
                tracing::warn!("ch-placement bypassed");
            }
        }

        let receiver_mask = cfg.receiver_mask();
        let receiver_rate = cfg.receiver_rate();
        if rank == 0 {
            tracing::info!(
                "shuffle receiver mask = {} (32 - {})\n>>> {} senders per receiver",
                receiver_mask.count_ones(),
                32 - receiver_mask.count_ones(),
                receiver_rate
            );
        }

        // receivers get a dedicated communicator, everyone else holds the
        // null sentinel
        let is_receiver = (rank as u32 & receiver_mask) == rank as u32;
        let recv_comm = group.split(if is_receiver { Some(0) } else { None });
        debug_assert_eq!(is_receiver, recv_comm.is_some());

        Ok(Self {
            cfg,
            frame,
            backend,
            placement,
            receiver_mask,
            receiver_rate,
            world: group,
            recv_comm,
            sink,
            trace,
            mon: Mutex::new(MonitorStats::default()),
            bypass_writes: AtomicU64::new(0),
            last_bypass_writes: AtomicU64::new(0),
            uri,
            rank,
            size,
            main_usage_start: CpuUsage::now(),
        })
    }

    pub fn my_rank(&self) -> Rank {
        self.rank
    }

    pub fn world_size(&self) -> Rank {
        self.size
    }

    /// Endpoint URI resolved at init.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Whether this rank accepts shuffled records.
    pub fn is_receiver(&self) -> bool {
        (self.rank as u32 & self.receiver_mask) == self.rank as u32
    }

    /// Whether the receiver subset is the whole world.
    pub fn is_everyone_receiver(&self) -> bool {
        self.receiver_mask.count_ones() == 32
    }

    /// This rank's index within the receiver subset.
    pub fn receiver_rank(&self) -> Rank {
        self.rank >> (32 - self.receiver_mask.count_ones())
    }

    /// Senders per receiver, `2^radix`.
    pub fn receiver_rate(&self) -> u32 {
        self.receiver_rate
    }

    /// Destination rank for an identifier.
    ///
    /// Deterministic: every rank computes the same destination for the
    /// same identifier. The receiver mask is applied after placement, so
    /// non-receiver slots collapse onto their receiver.
    pub fn route(&self, fname: &[u8]) -> Rank {
        let raw = if self.size == 1 {
            self.rank
        } else if let Some(engine) = &self.placement {
            engine.closest(placement_key(fname))
        } else {
            modulo_bypass(fname, self.size)
        };
        (raw as u32 & self.receiver_mask) as Rank
    }

    /// Submit one particle record for the given epoch.
    ///
    /// Blocks when the backend queue is full. Identifier and payload must
    /// match the configured record shape exactly; a mismatch is fatal.
    /// Returns `Err` only when the local sink rejects a bypassed record;
    /// remote sink failures surface in the teardown statistics.
    pub fn write(&self, fname: &[u8], data: &[u8], epoch: u32) -> ShuffleResult<()> {
        assert_eq!(
            fname.len(),
            self.frame.fname_len as usize,
            "particle id length {} does not match configured fname_len {}",
            fname.len(),
            self.frame.fname_len
        );
        assert_eq!(
            data.len(),
            self.frame.data_len as usize,
            "particle data length {} does not match configured data_len {}",
            data.len(),
            self.frame.data_len
        );

        let dst = self.route(fname);

        if let Some(trace) = &self.trace {
            let hash = xxh32(data, 0);
            if dst != self.rank || self.cfg.force_rpc {
                trace.send(fname, data.len(), epoch, self.rank, dst, hash);
            } else {
                trace.local(fname, data.len(), epoch, hash);
            }
        }

        // bypass rpc if the target is local
        if dst == self.rank && !self.cfg.force_rpc {
            self.sink.native_write(fname, data, epoch)?;
            self.bypass_writes.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let frame = self.frame.encode(fname, data);
        self.backend.enqueue(frame.as_slice(), dst, self.rank, epoch);
        Ok(())
    }

    /// End an epoch: optional pre-flush barrier, drain every in-flight
    /// record of the epoch, optional end-of-epoch barrier.
    ///
    /// On return no record this rank submitted is in flight anywhere; with
    /// the end-of-epoch barrier enabled the same holds for every rank.
    pub fn epoch_end(&self) {
        if self.cfg.pre_flush_barrier {
            self.world.barrier();
        }
        self.backend.epoch_end();
        if self.cfg.epoch_barrier {
            self.world.barrier();
        }
    }

    /// Re-arm the backend before the new epoch admits records.
    pub fn epoch_pre_start(&self) {
        self.backend.epoch_pre_start();
    }

    /// Start an epoch: snapshot counter deltas into the monitor context,
    /// then the optional post-start barrier.
    ///
    /// Bypassed records never reach the backend, so their delta is folded
    /// into the local channel here: a bypass write is one local send, one
    /// local receive and one local delivery on this rank.
    pub fn epoch_start(&self) {
        let backend = self.backend.epoch_start();
        let bypass = self.bypass_writes.load(Ordering::Relaxed);
        let bypass_delta = bypass - self.last_bypass_writes.swap(bypass, Ordering::Relaxed);
        *self.mon.lock().unwrap() = MonitorStats::from_deltas(
            backend.local_sends + bypass_delta,
            backend.local_recvs + bypass_delta,
            backend.remote_sends,
            backend.remote_recvs,
        );
        if self.cfg.post_start_barrier {
            self.world.barrier();
        }
    }

    /// Full epoch transition ladder between epoch k and k+1.
    pub fn rotate_epoch(&self) {
        self.epoch_end();
        self.epoch_pre_start();
        self.epoch_start();
    }

    /// Monitor counters captured at the last epoch start.
    pub fn monitor_snapshot(&self) -> MonitorStats {
        *self.mon.lock().unwrap()
    }

    /// Park background progress while the caller runs CPU-bound work.
    /// Backend-optional; callers must not assume pause is honored.
    pub fn pause(&self) {
        self.backend.pause();
    }

    /// Undo [`ShuffleContext::pause`].
    pub fn resume(&self) {
        self.backend.resume();
    }

    /// Collective teardown: drain, join workers, reduce and report stats.
    ///
    /// Must be called on every rank, after the last epoch has ended.
    pub fn finalize(self) {
        // every rank must be past its last epoch before endpoints go away
        self.world.barrier();

        let main_usage = CpuUsage::now().since(&self.main_usage_start);
        let ShuffleContext {
            cfg,
            backend,
            world,
            recv_comm,
            rank,
            size,
            ..
        } = self;

        let report = backend.destroy();

        if cfg.finalize_pause_secs > 0 {
            std::thread::sleep(Duration::from_secs(cfg.finalize_pause_secs));
        }

        match report {
            BackendReport::Xn(r) => finalize_xn(&r, &world, rank, size),
            BackendReport::Nn(r) => {
                finalize_nn(&r, main_usage, &world, recv_comm.as_ref(), rank, size)
            }
        }
    }
}

/// XN teardown: reduce send totals with SUM/MIN/MAX over the world.
fn finalize_xn(report: &XnReport, world: &Arc<dyn ProcessGroup>, rank: Rank, size: Rank) {
    let rpcs = [report.local_sends, report.remote_sends];
    let sums = world.reduce_u64(ReduceOp::Sum, &rpcs);
    let mins = world.reduce_u64(ReduceOp::Min, &rpcs);
    let maxs = world.reduce_u64(ReduceOp::Max, &rpcs);

    if rank == 0 {
        let (sums, mins, maxs) = (sums.unwrap(), mins.unwrap(), maxs.unwrap());
        if sums[0] + sums[1] != 0 {
            tracing::info!(
                "[rpc] total sends: {} intra-node + {} inter-node = {} overall .....\n \
                 -> intra-node: {} per rank (min: {}, max: {})\n \
                 -> inter-node: {} per rank (min: {}, max: {})",
                pretty_num(sums[0] as f64),
                pretty_num(sums[1] as f64),
                pretty_num((sums[0] + sums[1]) as f64),
                pretty_num(sums[0] as f64 / size as f64),
                pretty_num(mins[0] as f64),
                pretty_num(maxs[0] as f64),
                pretty_num(sums[1] as f64 / size as f64),
                pretty_num(mins[1] as f64),
                pretty_num(maxs[1] as f64),
            );
        }
    }
}

/// NN teardown: system-wide send totals over the world, then receiver-side
/// reductions over the dedicated receiver communicator. Non-receivers hold
/// the null communicator and skip the receiver part.
fn finalize_nn(
    report: &NnReport,
    main_usage: CpuUsage,
    world: &Arc<dyn ProcessGroup>,
    recv_comm: Option<&Arc<dyn ProcessGroup>>,
    rank: Rank,
    size: Rank,
) {
    // every rank sends, so the system-wide total reduces over the world
    let world_sends = world.reduce_u64(ReduceOp::Sum, &[report.rpc_sends]);
    if rank == 0 {
        let world_sends = world_sends.unwrap();
        if world_sends[0] != 0 {
            tracing::info!(
                "[nn] total rpcs sent: {} ({} per rank)",
                pretty_num(world_sends[0] as f64),
                pretty_num(world_sends[0] as f64 / size as f64),
            );
        }
    }

    let recv_comm = match recv_comm {
        Some(comm) => comm,
        None => return,
    };
    let recv_sz = recv_comm.size() as f64;

    let usages = [
        TaggedUsage {
            tag: "main",
            usage: main_usage,
        },
        TaggedUsage {
            tag: "bg",
            usage: report.bg_usage,
        },
    ];

    if rank == 0 {
        tracing::info!("[nn] per-thread cpu usage ... (s)");
        tracing::info!(
            "                {:<16}{:<16}{:<16}",
            "USR_per_rank",
            "SYS_per_rank",
            "TOTAL_per_rank"
        );
    }
    for tagged in usages {
        let total = tagged.usage.reduce(recv_comm);
        if rank == 0 {
            let total = total.unwrap();
            tracing::info!(
                "  {:<8} CPU: {:<16.3}{:<16.3}{:<16.3}",
                tagged.tag,
                total.usr_micros as f64 / 1e6 / recv_sz,
                total.sys_micros as f64 / 1e6 / recv_sz,
                (total.usr_micros + total.sys_micros) as f64 / 1e6 / recv_sz,
            );
        }
    }

    let hg_intvl = report.hg_intvl.reduce(recv_comm);
    if rank == 0 {
        if let Some(h) = &hg_intvl {
            if h.count() >= 1 {
                tracing::info!("[nn] hg_progress interval ... (us)");
                log_histogram(h);
            }
        }
    }

    let iq_dep = report.iq_dep.reduce(recv_comm);
    let totals = recv_comm.reduce_u64(ReduceOp::Sum, &[report.total_writes, report.total_msgsz]);
    if rank == 0 {
        let totals = totals.unwrap();
        if let Some(h) = &iq_dep {
            if h.count() >= 1 {
                tracing::info!(
                    "[nn] avg rpc size: {} ({} writes per rpc, {} per write)",
                    pretty_size(totals[1] as f64 / h.sum() as f64),
                    pretty_num(totals[0] as f64 / h.sum() as f64),
                    pretty_size(totals[1] as f64 / totals[0].max(1) as f64),
                );
                tracing::info!("[nn] rpc incoming queue depth ...");
                log_histogram(h);
            }
        }
    }
}

/// Log one reduced histogram: summary line plus the percentile ladder.
fn log_histogram(h: &Histogram) {
    tracing::info!(
        "  {} samples, avg: {:.3} (min: {}, max: {})",
        pretty_num(h.count() as f64),
        h.mean(),
        h.min(),
        h.max(),
    );
    for (p, frac) in PTILE_INT.iter().zip(PTILE_FRAC.iter()) {
        tracing::info!(
            "    - {}% {:<12.2} {:.4}% {:.2}",
            p,
            h.percentile(*p as f64),
            frac,
            h.percentile(*frac),
        );
    }
}

/// Receiver-side delivery glue handed to the backend.
///
/// Runs on the backend progress thread. Validates the inbound frame
/// against the configured shape (fatal on mismatch), splits it and hands
/// the record to the sink's foreign-write entry.
struct ShuffleDelivery {
    frame: FrameSpec,
    sink: Arc<dyn ParticleSink>,
    trace: Option<Arc<TraceLog>>,
}

impl DeliveryHandler for ShuffleDelivery {
    fn deliver(&self, frame: &[u8], src: Rank, dst: Rank, epoch: u32) -> i32 {
        let (fname, data) = self.frame.decode(frame);

        let status = match self.sink.foreign_write(fname, data, epoch) {
            Ok(()) => 0,
            Err(e) => {
                tracing::error!("foreign write failed: {}", e);
                -1
            }
        };

        if let Some(trace) = &self.trace {
            trace.recv(fname, data.len(), epoch, dst, src, xxh32(data, 0));
        }

        status
    }
}
