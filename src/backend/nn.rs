//! NN backend: naive neighbor-to-neighbor shuffle.
//!
//! One RPC per record, sent straight to the destination rank. A single
//! background progress thread drains the outbound queue, advances the
//! transport, runs the delivery callback for inbound frames and accounts
//! acknowledgements. Quiescence is tracked end-to-end: a record is in
//! flight from `enqueue` until its delivery ack returns.
//!
//! The progress thread also samples two histograms: the interval between
//! progress iterations (microseconds) and the inbound queue depth drained
//! per iteration. Both are reduced over the receiver communicator at
//! teardown.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TryRecvError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{DeliveryHandler, FlightTracker};
use crate::comm::Rank;
use crate::monitor::MonitorStats;
use crate::stats::{CpuUsage, Histogram};
use crate::transport::{Inbound, Transport};
use crate::wire::{pack_message, unpack_message, MsgHeader, MSG_ACK, MSG_DATA};

/// How long the progress thread blocks on the transport per iteration
const PROGRESS_POLL: Duration = Duration::from_millis(1);

/// Max inbound messages drained per progress iteration
const INBOUND_BATCH: usize = 256;

struct OutboundRecord {
    dst: Rank,
    bytes: Vec<u8>,
}

struct NnShared {
    sends: AtomicU64,
    recvs: AtomicU64,
    total_writes: AtomicU64,
    total_msgsz: AtomicU64,
    remote_sink_errors: AtomicU64,
    last_sends: AtomicU64,
    last_recvs: AtomicU64,
    paused: Mutex<bool>,
    pause_cv: Condvar,
    shutdown: AtomicBool,
}

/// Direct-send shuffle backend.
pub struct NnShuffler {
    rank: Rank,
    size: Rank,
    sendq: SyncSender<OutboundRecord>,
    flight: Arc<FlightTracker>,
    shared: Arc<NnShared>,
    worker: Option<JoinHandle<NnWorkerReport>>,
}

struct NnWorkerReport {
    hg_intvl: Histogram,
    iq_dep: Histogram,
    bg_usage: CpuUsage,
}

/// Final NN counters and histograms, produced by `destroy`.
pub struct NnReport {
    pub hg_intvl: Histogram,
    pub iq_dep: Histogram,
    pub bg_usage: CpuUsage,
    pub total_writes: u64,
    pub total_msgsz: u64,
    pub rpc_sends: u64,
    pub rpc_recvs: u64,
    pub remote_sink_errors: u64,
}

impl NnShuffler {
    /// Construct the backend and start its progress thread.
    pub fn new(
        transport: Box<dyn Transport>,
        delivery: Arc<dyn DeliveryHandler>,
        queue_depth: usize,
        force_sync: bool,
    ) -> Self {
        let rank = transport.rank();
        let size = transport.size();

        let (sendq, recvq) = sync_channel(queue_depth.max(1));
        let flight = Arc::new(FlightTracker::new());
        let shared = Arc::new(NnShared {
            sends: AtomicU64::new(0),
            recvs: AtomicU64::new(0),
            total_writes: AtomicU64::new(0),
            total_msgsz: AtomicU64::new(0),
            remote_sink_errors: AtomicU64::new(0),
            last_sends: AtomicU64::new(0),
            last_recvs: AtomicU64::new(0),
            paused: Mutex::new(false),
            pause_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let worker = {
            let flight = flight.clone();
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("shuffle-nn-progress".to_string())
                .spawn(move || progress_loop(transport, delivery, recvq, flight, shared, force_sync))
                .expect("failed to spawn nn progress thread")
        };

        Self {
            rank,
            size,
            sendq,
            flight,
            shared,
            worker: Some(worker),
        }
    }

    pub fn my_rank(&self) -> Rank {
        self.rank
    }

    pub fn world_size(&self) -> Rank {
        self.size
    }

    /// Submit one frame. Blocks when the outbound queue is full.
    pub fn enqueue(&self, frame: &[u8], dst: Rank, src: Rank, epoch: u32) {
        let header = MsgHeader::data(epoch, src, dst, frame.len());
        let bytes = pack_message(&header, frame);
        self.flight.on_enqueue();
        self.sendq
            .send(OutboundRecord { dst, bytes })
            .expect("shuffle progress thread is gone");
    }

    /// Wait for the background thread to reach quiescence.
    pub fn epoch_pre_start(&self) {
        self.flight.wait_quiesced();
    }

    /// Snapshot RPC counter deltas since the previous epoch start.
    ///
    /// NN sends every record over the RPC path, so all traffic is
    /// accounted as remote; the local-bypass path never reaches the
    /// backend.
    pub fn epoch_start(&self) -> MonitorStats {
        let sends = self.shared.sends.load(Ordering::Relaxed);
        let recvs = self.shared.recvs.load(Ordering::Relaxed);
        let delta_sends = sends - self.shared.last_sends.swap(sends, Ordering::Relaxed);
        let delta_recvs = recvs - self.shared.last_recvs.swap(recvs, Ordering::Relaxed);
        MonitorStats::from_deltas(0, 0, delta_sends, delta_recvs)
    }

    /// Flush the outbound queue, then wait for every delivery ack.
    pub fn epoch_end(&self) {
        self.flight.wait_queue_empty();
        self.flight.wait_quiesced();
    }

    /// Park the progress thread after its current iteration.
    pub fn pause(&self) {
        *self.shared.paused.lock().unwrap() = true;
    }

    /// Wake a parked progress thread.
    pub fn resume(&self) {
        let mut paused = self.shared.paused.lock().unwrap();
        *paused = false;
        self.shared.pause_cv.notify_all();
    }

    /// Drain, stop and join the progress thread.
    pub fn destroy(mut self) -> NnReport {
        self.flight.wait_quiesced();
        self.shared.shutdown.store(true, Ordering::Release);
        self.resume();

        let report = self
            .worker
            .take()
            .expect("nn backend destroyed twice")
            .join()
            .expect("nn progress thread panicked");

        NnReport {
            hg_intvl: report.hg_intvl,
            iq_dep: report.iq_dep,
            bg_usage: report.bg_usage,
            total_writes: self.shared.total_writes.load(Ordering::Relaxed),
            total_msgsz: self.shared.total_msgsz.load(Ordering::Relaxed),
            rpc_sends: self.shared.sends.load(Ordering::Relaxed),
            rpc_recvs: self.shared.recvs.load(Ordering::Relaxed),
            remote_sink_errors: self.shared.remote_sink_errors.load(Ordering::Relaxed),
        }
    }
}

fn progress_loop(
    transport: Box<dyn Transport>,
    delivery: Arc<dyn DeliveryHandler>,
    recvq: Receiver<OutboundRecord>,
    flight: Arc<FlightTracker>,
    shared: Arc<NnShared>,
    force_sync: bool,
) -> NnWorkerReport {
    let rank = transport.rank();
    let usage_start = CpuUsage::now();
    let mut hg_intvl = Histogram::new();
    let mut iq_dep = Histogram::new();
    let mut last_tick = Instant::now();

    loop {
        // pause gate: hold here while the caller runs CPU-bound work
        {
            let mut paused = shared.paused.lock().unwrap();
            while *paused && !shared.shutdown.load(Ordering::Acquire) {
                paused = shared.pause_cv.wait(paused).unwrap();
            }
        }

        // outbound: push queued records onto the wire
        loop {
            match recvq.try_recv() {
                Ok(out) => {
                    if let Err(e) = transport.send(out.dst, out.bytes) {
                        tracing::error!("shuffle rpc send to rank {} failed: {}", out.dst, e);
                        std::process::abort();
                    }
                    shared.sends.fetch_add(1, Ordering::Relaxed);
                    flight.on_sent();

                    if force_sync {
                        // hold the next send until this record's reply lands
                        while flight.outstanding() > 0 {
                            if let Some(ib) = transport.recv_timeout(PROGRESS_POLL) {
                                handle_inbound(ib, rank, &*transport, &delivery, &shared, &flight);
                            }
                        }
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        // inbound: block briefly, then drain a batch
        let mut drained = 0usize;
        if let Some(ib) = transport.recv_timeout(PROGRESS_POLL) {
            handle_inbound(ib, rank, &*transport, &delivery, &shared, &flight);
            drained += 1;
            while drained < INBOUND_BATCH {
                match transport.recv_timeout(Duration::ZERO) {
                    Some(ib) => {
                        handle_inbound(ib, rank, &*transport, &delivery, &shared, &flight);
                        drained += 1;
                    }
                    None => break,
                }
            }
        }
        if drained > 0 {
            iq_dep.observe(drained as u64);
        }

        hg_intvl.observe(last_tick.elapsed().as_micros() as u64);
        last_tick = Instant::now();

        if shared.shutdown.load(Ordering::Acquire) && flight.is_quiesced() {
            break;
        }
    }

    NnWorkerReport {
        hg_intvl,
        iq_dep,
        bg_usage: CpuUsage::now().since(&usage_start),
    }
}

fn handle_inbound(
    ib: Inbound,
    rank: Rank,
    transport: &dyn Transport,
    delivery: &Arc<dyn DeliveryHandler>,
    shared: &NnShared,
    flight: &FlightTracker,
) {
    let (header, frame) = unpack_message(&ib.bytes);
    match header.kind {
        MSG_DATA => {
            assert_eq!(
                header.dst, rank,
                "misrouted shuffle frame for rank {} arrived at rank {}",
                header.dst, rank
            );
            let status = delivery.deliver(frame, header.src, header.dst, header.epoch);
            shared.recvs.fetch_add(1, Ordering::Relaxed);
            shared.total_writes.fetch_add(1, Ordering::Relaxed);
            shared
                .total_msgsz
                .fetch_add(frame.len() as u64, Ordering::Relaxed);

            let ack = MsgHeader::ack(&header, status);
            if let Err(e) = transport.send(header.src, pack_message(&ack, &[])) {
                tracing::error!("shuffle ack send to rank {} failed: {}", header.src, e);
                std::process::abort();
            }
        }
        MSG_ACK => {
            if header.status < 0 {
                shared.remote_sink_errors.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    "rank {} rejected shuffled record (epoch {})",
                    header.dst,
                    header.epoch
                );
            }
            flight.on_acked();
        }
        other => panic!("unknown shuffle message kind {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackFabric;

    struct CountingDelivery {
        delivered: AtomicU64,
    }

    impl DeliveryHandler for CountingDelivery {
        fn deliver(&self, _frame: &[u8], _src: Rank, _dst: Rank, _epoch: u32) -> i32 {
            self.delivered.fetch_add(1, Ordering::Relaxed);
            0
        }
    }

    #[test]
    fn test_single_rank_self_send_and_destroy() {
        let fabric = LoopbackFabric::new(1);
        let delivery = Arc::new(CountingDelivery {
            delivered: AtomicU64::new(0),
        });
        let nn = NnShuffler::new(Box::new(fabric.endpoint(0)), delivery.clone(), 16, false);

        let frame = [1u8, 2, 3];
        for _ in 0..10 {
            nn.enqueue(&frame, 0, 0, 0);
        }
        nn.epoch_end();
        assert_eq!(delivery.delivered.load(Ordering::Relaxed), 10);

        let snap = nn.epoch_start();
        assert_eq!(snap.remote_sends, 10);
        assert_eq!(snap.remote_recvs, 10);

        let report = nn.destroy();
        assert_eq!(report.rpc_sends, 10);
        assert_eq!(report.rpc_recvs, 10);
        assert_eq!(report.total_writes, 10);
        assert_eq!(report.total_msgsz, 30);
        assert_eq!(report.remote_sink_errors, 0);
        assert!(report.iq_dep.count() > 0);
    }

    #[test]
    fn test_force_sync_mode_drains() {
        let fabric = LoopbackFabric::new(1);
        let delivery = Arc::new(CountingDelivery {
            delivered: AtomicU64::new(0),
        });
        let nn = NnShuffler::new(Box::new(fabric.endpoint(0)), delivery.clone(), 4, true);

        for _ in 0..8 {
            nn.enqueue(&[9u8; 4], 0, 0, 1);
        }
        nn.epoch_end();
        assert_eq!(delivery.delivered.load(Ordering::Relaxed), 8);
        nn.destroy();
    }

    #[test]
    fn test_pause_holds_progress() {
        let fabric = LoopbackFabric::new(1);
        let delivery = Arc::new(CountingDelivery {
            delivered: AtomicU64::new(0),
        });
        let nn = NnShuffler::new(Box::new(fabric.endpoint(0)), delivery.clone(), 16, false);

        // let the progress thread reach the pause gate
        nn.pause();
        std::thread::sleep(Duration::from_millis(30));

        nn.enqueue(&[5u8; 2], 0, 0, 0);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(delivery.delivered.load(Ordering::Relaxed), 0);

        nn.resume();
        nn.epoch_end();
        assert_eq!(delivery.delivered.load(Ordering::Relaxed), 1);
        nn.destroy();
    }
}
