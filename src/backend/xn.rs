//! XN backend: scalable multi-hop shuffle.
//!
//! A record destined for a remote node makes up to three hops: intra-node
//! to the origin's node representative, inter-node between representatives,
//! and intra-node again to the destination rank. Records for a rank on the
//! same node go direct. The overlay concentrates inter-node traffic on one
//! endpoint pair per node pair, which is what lets this backend scale where
//! the direct one cannot.
//!
//! The node layout (every rank's representative) is computed once at init
//! from the node-local communicator split and passed in, so the backend
//! itself never touches the process group. Delivery acks travel
//! point-to-point from the final destination back to the origin; quiescence
//! at the origin is therefore end-to-end. Local and remote hops are
//! counted separately and published as per-epoch deltas at each epoch
//! start. pause/resume are intentionally not implemented here.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use super::{DeliveryHandler, FlightTracker};
use crate::comm::Rank;
use crate::monitor::MonitorStats;
use crate::transport::{Inbound, Transport};
use crate::wire::{pack_message, unpack_message, MsgHeader, MSG_ACK, MSG_DATA};

const PROGRESS_POLL: Duration = Duration::from_millis(1);

struct OutboundRecord {
    bytes: Vec<u8>,
}

struct XnShared {
    local_sends: AtomicU64,
    local_recvs: AtomicU64,
    remote_sends: AtomicU64,
    remote_recvs: AtomicU64,
    remote_sink_errors: AtomicU64,
    /// previous epoch-start snapshot: [ls, lr, rs, rr]
    last: Mutex<[u64; 4]>,
    shutdown: AtomicBool,
}

/// Multi-hop shuffle backend.
pub struct XnShuffler {
    rank: Rank,
    size: Rank,
    sendq: SyncSender<OutboundRecord>,
    flight: Arc<FlightTracker>,
    shared: Arc<XnShared>,
    worker: Option<JoinHandle<()>>,
}

/// Final XN counters, produced by `destroy`.
pub struct XnReport {
    pub local_sends: u64,
    pub local_recvs: u64,
    pub remote_sends: u64,
    pub remote_recvs: u64,
    pub remote_sink_errors: u64,
}

impl XnShuffler {
    /// Construct the backend and start its progress thread.
    ///
    /// `reps[r]` must hold the node-representative rank of world rank `r`,
    /// identical on every rank.
    pub fn new(
        transport: Box<dyn Transport>,
        delivery: Arc<dyn DeliveryHandler>,
        reps: Vec<Rank>,
        queue_depth: usize,
    ) -> Self {
        let rank = transport.rank();
        let size = transport.size();
        assert_eq!(reps.len(), size as usize, "node map does not cover the world");
        let my_rep = reps[rank as usize];

        let (sendq, recvq) = sync_channel(queue_depth.max(1));
        let flight = Arc::new(FlightTracker::new());
        let shared = Arc::new(XnShared {
            local_sends: AtomicU64::new(0),
            local_recvs: AtomicU64::new(0),
            remote_sends: AtomicU64::new(0),
            remote_recvs: AtomicU64::new(0),
            remote_sink_errors: AtomicU64::new(0),
            last: Mutex::new([0; 4]),
            shutdown: AtomicBool::new(false),
        });

        let worker = {
            let flight = flight.clone();
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("shuffle-xn-progress".to_string())
                .spawn(move || {
                    progress_loop(transport, delivery, recvq, flight, shared, reps, my_rep)
                })
                .expect("failed to spawn xn progress thread")
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
            .send(OutboundRecord { bytes })
            .expect("shuffle progress thread is gone");
    }

    /// Re-arm for the next epoch: make sure this rank's own traffic from
    /// the previous epoch is fully acknowledged.
    pub fn epoch_pre_start(&self) {
        self.flight.wait_quiesced();
    }

    /// Snapshot per-channel deltas since the previous epoch start.
    pub fn epoch_start(&self) -> MonitorStats {
        let now = [
            self.shared.local_sends.load(Ordering::Relaxed),
            self.shared.local_recvs.load(Ordering::Relaxed),
            self.shared.remote_sends.load(Ordering::Relaxed),
            self.shared.remote_recvs.load(Ordering::Relaxed),
        ];
        let mut last = self.shared.last.lock().unwrap();
        let deltas = [
            now[0] - last[0],
            now[1] - last[1],
            now[2] - last[2],
            now[3] - last[3],
        ];
        *last = now;
        MonitorStats::from_deltas(deltas[0], deltas[1], deltas[2], deltas[3])
    }

    /// Drain this rank's in-flight records of the ending epoch.
    pub fn epoch_end(&self) {
        self.flight.wait_queue_empty();
        self.flight.wait_quiesced();
    }

    /// Drain, stop and join the progress thread.
    pub fn destroy(mut self) -> XnReport {
        self.flight.wait_quiesced();
        self.shared.shutdown.store(true, Ordering::Release);

        self.worker
            .take()
            .expect("xn backend destroyed twice")
            .join()
            .expect("xn progress thread panicked");

        XnReport {
            local_sends: self.shared.local_sends.load(Ordering::Relaxed),
            local_recvs: self.shared.local_recvs.load(Ordering::Relaxed),
            remote_sends: self.shared.remote_sends.load(Ordering::Relaxed),
            remote_recvs: self.shared.remote_recvs.load(Ordering::Relaxed),
            remote_sink_errors: self.shared.remote_sink_errors.load(Ordering::Relaxed),
        }
    }
}

/// Next hop of the overlay route toward `dst`.
fn next_hop(reps: &[Rank], rank: Rank, my_rep: Rank, dst: Rank) -> Rank {
    if reps[dst as usize] == my_rep {
        dst
    } else if rank == my_rep {
        reps[dst as usize]
    } else {
        my_rep
    }
}

fn progress_loop(
    transport: Box<dyn Transport>,
    delivery: Arc<dyn DeliveryHandler>,
    recvq: Receiver<OutboundRecord>,
    flight: Arc<FlightTracker>,
    shared: Arc<XnShared>,
    reps: Vec<Rank>,
    my_rep: Rank,
) {
    let rank = transport.rank();
    let is_local_peer = |peer: Rank| reps[peer as usize] == my_rep;

    let count_send = |peer: Rank| {
        if is_local_peer(peer) {
            shared.local_sends.fetch_add(1, Ordering::Relaxed);
        } else {
            shared.remote_sends.fetch_add(1, Ordering::Relaxed);
        }
    };

    let forward = |bytes: Vec<u8>, hop: Rank| {
        if let Err(e) = transport.send(hop, bytes) {
            tracing::error!("shuffle hop send to rank {} failed: {}", hop, e);
            std::process::abort();
        }
    };

    loop {
        // outbound: first hop of records this rank originated
        loop {
            match recvq.try_recv() {
                Ok(out) => {
                    let (header, _) = unpack_message(&out.bytes);
                    let hop = next_hop(&reps, rank, my_rep, header.dst);
                    count_send(hop);
                    forward(out.bytes, hop);
                    flight.on_sent();
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        // inbound: deliver, relay, or account an ack
        if let Some(ib) = transport.recv_timeout(PROGRESS_POLL) {
            handle_inbound(
                ib, rank, my_rep, &reps, &*transport, &delivery, &shared, &flight,
            );
        }

        if shared.shutdown.load(Ordering::Acquire) && flight.is_quiesced() {
            break;
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn handle_inbound(
    ib: Inbound,
    rank: Rank,
    my_rep: Rank,
    reps: &[Rank],
    transport: &dyn Transport,
    delivery: &Arc<dyn DeliveryHandler>,
    shared: &XnShared,
    flight: &FlightTracker,
) {
    let (header, frame) = unpack_message(&ib.bytes);
    match header.kind {
        MSG_DATA => {
            // hop accounting by the immediate sender's node
            if reps[ib.src as usize] == my_rep {
                shared.local_recvs.fetch_add(1, Ordering::Relaxed);
            } else {
                shared.remote_recvs.fetch_add(1, Ordering::Relaxed);
            }

            if header.dst == rank {
                let status = delivery.deliver(frame, header.src, header.dst, header.epoch);
                // ack straight back to the origin
                let ack = MsgHeader::ack(&header, status);
                if let Err(e) = transport.send(header.src, pack_message(&ack, &[])) {
                    tracing::error!("shuffle ack send to rank {} failed: {}", header.src, e);
                    std::process::abort();
                }
            } else {
                let hop = next_hop(reps, rank, my_rep, header.dst);
                if reps[hop as usize] == my_rep {
                    shared.local_sends.fetch_add(1, Ordering::Relaxed);
                } else {
                    shared.remote_sends.fetch_add(1, Ordering::Relaxed);
                }
                if let Err(e) = transport.send(hop, ib.bytes) {
                    tracing::error!("shuffle hop send to rank {} failed: {}", hop, e);
                    std::process::abort();
                }
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
    fn test_next_hop_routing() {
        // two nodes: ranks {0,1} rep 0, ranks {2,3} rep 2
        let reps = vec![0, 0, 2, 2];

        // same node goes direct
        assert_eq!(next_hop(&reps, 1, 0, 0), 0);
        // non-representative hands off to its representative
        assert_eq!(next_hop(&reps, 1, 0, 3), 0);
        // representative crosses to the peer representative
        assert_eq!(next_hop(&reps, 0, 0, 3), 2);
        // peer representative fans in to the destination
        assert_eq!(next_hop(&reps, 2, 2, 3), 3);
    }

    /// Drive a 4-rank world on the loopback mesh and push one record
    /// across the two simulated nodes.
    #[test]
    fn test_multi_hop_delivery() {
        let reps = vec![0, 0, 2, 2];
        let fabric = LoopbackFabric::new(4);
        let delivery: Vec<_> = (0..4)
            .map(|_| {
                Arc::new(CountingDelivery {
                    delivered: AtomicU64::new(0),
                })
            })
            .collect();
        let backends: Vec<_> = (0..4)
            .map(|r| {
                XnShuffler::new(
                    Box::new(fabric.endpoint(r)),
                    delivery[r as usize].clone(),
                    reps.clone(),
                    64,
                )
            })
            .collect();

        // rank 1 -> rank 3 crosses both hops of the overlay
        backends[1].enqueue(&[42u8; 8], 3, 1, 0);
        backends[1].epoch_end();

        assert_eq!(delivery[3].delivered.load(Ordering::Relaxed), 1);
        assert_eq!(delivery[0].delivered.load(Ordering::Relaxed), 0);

        let reports: Vec<_> = backends.into_iter().map(|b| b.destroy()).collect();

        // origin hop was intra-node, the relay crossed nodes
        assert_eq!(reports[1].local_sends, 1);
        assert_eq!(reports[0].local_recvs, 1);
        assert_eq!(reports[0].remote_sends, 1);
        assert_eq!(reports[2].remote_recvs, 1);
        assert_eq!(reports[2].local_sends, 1);
        assert_eq!(reports[3].local_recvs, 1);

        // mass conservation over all hops
        let sends: u64 = reports.iter().map(|r| r.local_sends + r.remote_sends).sum();
        let recvs: u64 = reports.iter().map(|r| r.local_recvs + r.remote_recvs).sum();
        assert_eq!(sends, recvs);
        assert_eq!(sends, 3);
    }

    #[test]
    fn test_epoch_start_snapshots_deltas() {
        let reps = vec![0];
        let fabric = LoopbackFabric::new(1);
        let delivery = Arc::new(CountingDelivery {
            delivered: AtomicU64::new(0),
        });
        let xn = XnShuffler::new(Box::new(fabric.endpoint(0)), delivery.clone(), reps, 16);

        for _ in 0..5 {
            xn.enqueue(&[7u8; 4], 0, 0, 0);
        }
        xn.epoch_end();

        let first = xn.epoch_start();
        assert_eq!(first.local_sends, 5);
        assert_eq!(first.local_recvs, 5);
        assert_eq!(first.local_delivered, 5);
        assert_eq!(first.remote_sends, 0);

        // no traffic since the snapshot: deltas collapse to zero
        let second = xn.epoch_start();
        assert_eq!(second.local_sends, 0);
        assert_eq!(second.local_recvs, 0);

        xn.destroy();
    }
}
