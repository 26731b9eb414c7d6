//! Point-to-point transport seam.
//!
//! The shuffle backends need very little from the fabric underneath them:
//! fire a message at a rank, poll for inbound messages, and push back on
//! the sender when buffers are full. Real fabrics (Mercury, UCX, ...) live
//! outside this crate behind this trait; the in-process loopback
//! implementation here backs tests, single-node runs and the bench driver.

use std::time::Duration;

use super::comm::Rank;

pub mod loopback;
pub mod uri;

pub use loopback::{LoopbackFabric, LoopbackTransport};
pub use uri::prepare_uri;

/// A message received from a peer.
///
/// `src` is the immediate sender hop, not necessarily the originating rank;
/// multi-hop backends read the origin from the message header instead.
#[derive(Debug)]
pub struct Inbound {
    pub src: Rank,
    pub bytes: Vec<u8>,
}

/// Transport failure surfaced to the backend.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("peer rank {0} unreachable")]
    Unreachable(Rank),

    #[error("transport closed")]
    Closed,
}

/// Asynchronous point-to-point message layer, one endpoint per rank.
///
/// An endpoint is owned and driven by a single backend progress thread.
/// `send` may block when the destination's inbound buffer is full; it never
/// drops a message it accepted.
pub trait Transport: Send {
    fn rank(&self) -> Rank;

    fn size(&self) -> Rank;

    /// Queue a message for `dst`, blocking on back-pressure.
    fn send(&self, dst: Rank, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Wait up to `timeout` for one inbound message.
    fn recv_timeout(&self, timeout: Duration) -> Option<Inbound>;

    /// Endpoint address, for diagnostics.
    fn uri(&self) -> &str;
}
