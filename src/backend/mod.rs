//! Shuffle backend dispatch.
//!
//! Two interchangeable backends move record frames between ranks: the
//! direct NN backend (one RPC per record, straight to the destination) and
//! the multi-hop XN backend (records transit node representatives). Both
//! satisfy one contract - enqueue, epoch hooks, pause/resume, destroy -
//! and the router never learns which one is active. Dispatch is a tagged
//! variant; there is no trait object on the record path.

use std::sync::{Condvar, Mutex};

use crate::comm::Rank;
use crate::monitor::MonitorStats;

pub mod nn;
pub mod xn;

pub use nn::{NnReport, NnShuffler};
pub use xn::{XnReport, XnShuffler};

/// Inbound dispatch seam: backends hand every received frame to this.
///
/// Entry is serialized: each backend runs a single progress thread, so
/// implementations may assume single-threaded calls.
pub trait DeliveryHandler: Send + Sync + 'static {
    /// Deliver one inbound frame. Returns 0 on success, -1 when the sink
    /// rejected the record. Panics on a malformed frame.
    fn deliver(&self, frame: &[u8], src: Rank, dst: Rank, epoch: u32) -> i32;
}

/// The selected backend instance.
pub enum Backend {
    Nn(NnShuffler),
    Xn(XnShuffler),
}

impl Backend {
    pub fn my_rank(&self) -> Rank {
        match self {
            Backend::Nn(b) => b.my_rank(),
            Backend::Xn(b) => b.my_rank(),
        }
    }

    pub fn world_size(&self) -> Rank {
        match self {
            Backend::Nn(b) => b.world_size(),
            Backend::Xn(b) => b.world_size(),
        }
    }

    /// Submit a frame for transmission. May block when the outbound queue
    /// is full; never drops.
    pub fn enqueue(&self, frame: &[u8], dst: Rank, src: Rank, epoch: u32) {
        match self {
            Backend::Nn(b) => b.enqueue(frame, dst, src, epoch),
            Backend::Xn(b) => b.enqueue(frame, dst, src, epoch),
        }
    }

    /// Re-arm before a new epoch admits records.
    pub fn epoch_pre_start(&self) {
        match self {
            Backend::Nn(b) => b.epoch_pre_start(),
            Backend::Xn(b) => b.epoch_pre_start(),
        }
    }

    /// Snapshot per-epoch counter deltas.
    pub fn epoch_start(&self) -> MonitorStats {
        match self {
            Backend::Nn(b) => b.epoch_start(),
            Backend::Xn(b) => b.epoch_start(),
        }
    }

    /// Drain every in-flight frame of the ending epoch.
    pub fn epoch_end(&self) {
        match self {
            Backend::Nn(b) => b.epoch_end(),
            Backend::Xn(b) => b.epoch_end(),
        }
    }

    /// Park background progress during caller CPU-bound phases.
    /// Backend-optional: XN ignores this.
    pub fn pause(&self) {
        if let Backend::Nn(b) = self {
            b.pause()
        }
    }

    /// Undo [`Backend::pause`]. Backend-optional: XN ignores this.
    pub fn resume(&self) {
        if let Backend::Nn(b) = self {
            b.resume()
        }
    }

    /// Drain, join workers, close endpoints. The world must be globally
    /// quiescent (last epoch ended on every rank) before any rank calls
    /// this.
    pub fn destroy(self) -> BackendReport {
        match self {
            Backend::Nn(b) => BackendReport::Nn(b.destroy()),
            Backend::Xn(b) => BackendReport::Xn(b.destroy()),
        }
    }
}

/// Final counters handed back by a destroyed backend.
pub enum BackendReport {
    Nn(NnReport),
    Xn(XnReport),
}

/// Tracks records between submission and acknowledged delivery.
///
/// `queued` counts records accepted but not yet on the wire, `outstanding`
/// counts records on the wire without a delivery ack. Epoch quiescence is
/// both reaching zero.
pub(crate) struct FlightTracker {
    state: Mutex<Flight>,
    cv: Condvar,
}

#[derive(Default)]
struct Flight {
    queued: u64,
    outstanding: u64,
}

impl FlightTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Flight::default()),
            cv: Condvar::new(),
        }
    }

    pub fn on_enqueue(&self) {
        self.state.lock().unwrap().queued += 1;
    }

    pub fn on_sent(&self) {
        let mut st = self.state.lock().unwrap();
        st.queued -= 1;
        st.outstanding += 1;
        self.cv.notify_all();
    }

    pub fn on_acked(&self) {
        let mut st = self.state.lock().unwrap();
        st.outstanding -= 1;
        self.cv.notify_all();
    }

    pub fn outstanding(&self) -> u64 {
        self.state.lock().unwrap().outstanding
    }

    pub fn is_quiesced(&self) -> bool {
        let st = self.state.lock().unwrap();
        st.queued == 0 && st.outstanding == 0
    }

    /// Block until the outbound queue is empty (records may still await
    /// their acks).
    pub fn wait_queue_empty(&self) {
        let mut st = self.state.lock().unwrap();
        while st.queued > 0 {
            st = self.cv.wait(st).unwrap();
        }
    }

    /// Block until every submitted record has been acknowledged.
    pub fn wait_quiesced(&self) {
        let mut st = self.state.lock().unwrap();
        while st.queued > 0 || st.outstanding > 0 {
            st = self.cv.wait(st).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_flight_tracker_lifecycle() {
        let t = FlightTracker::new();
        assert!(t.is_quiesced());

        t.on_enqueue();
        assert!(!t.is_quiesced());

        t.on_sent();
        assert_eq!(t.outstanding(), 1);
        t.wait_queue_empty();

        t.on_acked();
        assert!(t.is_quiesced());
        t.wait_quiesced();
    }

    #[test]
    fn test_wait_quiesced_blocks_until_acked() {
        let t = Arc::new(FlightTracker::new());
        t.on_enqueue();
        t.on_sent();

        let waiter = {
            let t = t.clone();
            thread::spawn(move || t.wait_quiesced())
        };
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        t.on_acked();
        waiter.join().unwrap();
    }
}
