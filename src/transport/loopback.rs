//! In-process loopback transport.
//!
//! A full mesh of channels between the ranks of one process. The fabric
//! buffers accepted messages itself, the way an asynchronous message layer
//! does; sender-side back-pressure belongs to the backend's bounded
//! outbound queue, not here. A progress thread must therefore never block
//! in `send`, which also rules out self-send and ack-exchange deadlocks.
//!
//! Message order is preserved per (sender, receiver) pair but interleaving
//! across senders is arbitrary, so receivers cannot assume more than the
//! epoch contract.

use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{Inbound, Transport, TransportError};
use crate::comm::Rank;

/// Shared mesh for one in-process world.
pub struct LoopbackFabric {
    inboxes: Vec<Sender<Inbound>>,
    receivers: Vec<Mutex<Option<Receiver<Inbound>>>>,
}

impl LoopbackFabric {
    /// Build a mesh for `size` ranks.
    pub fn new(size: usize) -> Arc<Self> {
        assert!(size > 0, "fabric size must be positive");
        let mut inboxes = Vec::with_capacity(size);
        let mut receivers = Vec::with_capacity(size);
        for _ in 0..size {
            let (tx, rx) = channel();
            inboxes.push(tx);
            receivers.push(Mutex::new(Some(rx)));
        }
        Arc::new(Self { inboxes, receivers })
    }

    /// Claim the endpoint for one rank. Panics if claimed twice.
    pub fn endpoint(&self, rank: Rank) -> LoopbackTransport {
        let rx = self.receivers[rank as usize]
            .lock()
            .unwrap()
            .take()
            .expect("loopback endpoint already claimed");
        LoopbackTransport {
            rank,
            uri: format!("loop://{}:{}", std::process::id(), rank),
            inboxes: self.inboxes.clone(),
            rx,
        }
    }
}

/// One rank's endpoint on the loopback mesh.
pub struct LoopbackTransport {
    rank: Rank,
    uri: String,
    inboxes: Vec<Sender<Inbound>>,
    rx: Receiver<Inbound>,
}

impl Transport for LoopbackTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> Rank {
        self.inboxes.len() as Rank
    }

    fn send(&self, dst: Rank, bytes: Vec<u8>) -> Result<(), TransportError> {
        let inbox = self
            .inboxes
            .get(dst as usize)
            .ok_or(TransportError::Unreachable(dst))?;
        inbox
            .send(Inbound {
                src: self.rank,
                bytes,
            })
            .map_err(|_| TransportError::Closed)
    }

    fn recv_timeout(&self, timeout: Duration) -> Option<Inbound> {
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => Some(msg),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    fn uri(&self) -> &str {
        &self.uri
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_recv_pair() {
        let fabric = LoopbackFabric::new(2);
        let a = fabric.endpoint(0);
        let b = fabric.endpoint(1);

        a.send(1, vec![1, 2, 3]).unwrap();
        let msg = b.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(msg.src, 0);
        assert_eq!(msg.bytes, vec![1, 2, 3]);

        assert!(a.recv_timeout(Duration::from_millis(10)).is_none());
    }

    #[test]
    fn test_unknown_peer_rejected() {
        let fabric = LoopbackFabric::new(1);
        let t = fabric.endpoint(0);
        assert!(matches!(
            t.send(5, vec![0]),
            Err(TransportError::Unreachable(5))
        ));
    }

    #[test]
    fn test_self_send_never_blocks() {
        let fabric = LoopbackFabric::new(1);
        let t = fabric.endpoint(0);

        for i in 0..10_000u32 {
            t.send(0, i.to_le_bytes().to_vec()).unwrap();
        }
        for i in 0..10_000u32 {
            let msg = t.recv_timeout(Duration::from_secs(1)).unwrap();
            assert_eq!(msg.bytes, i.to_le_bytes().to_vec());
        }
    }

    #[test]
    fn test_per_pair_ordering() {
        let fabric = LoopbackFabric::new(2);
        let a = fabric.endpoint(0);
        let b = fabric.endpoint(1);

        for i in 0..32u8 {
            a.send(1, vec![i]).unwrap();
        }
        for i in 0..32u8 {
            let msg = b.recv_timeout(Duration::from_secs(1)).unwrap();
            assert_eq!(msg.bytes, vec![i]);
        }
    }

}
