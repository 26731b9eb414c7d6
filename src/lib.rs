//! ShuffleFS - Particle Shuffle Layer for Indexed Log Directories
//!
//! ShuffleFS is the record shuffling layer of an I/O preload stack for
//! large-scale particle simulations. The preload layer intercepts
//! per-particle writes and hands them here; ShuffleFS routes each record,
//! based on a hash of the particle identifier, to the rank owning the
//! matching shard of an indexed log directory. It features:
//!
//! - **Deterministic placement**: consistent hashing (ring, xor, HRW, or
//!   plain modulo) over xxHash64 of the identifier, identical on every rank
//! - **Receiver subsets**: a power-of-two fraction of ranks can act as
//!   storage endpoints, with non-receiver slots collapsed onto their
//!   receiver by a bitmask
//! - **Two RPC backends**: direct neighbor-to-neighbor (NN) and a scalable
//!   multi-hop overlay (XN) that concentrates inter-node traffic on node
//!   representatives
//! - **Epoch quiescence**: records are labeled with the caller's epoch and
//!   fully drained at each epoch boundary, with configurable barriers
//! - **Local bypass**: records routed to the originating rank skip the RPC
//!   path entirely unless force-rpc diagnostics are on
//!
//! # Architecture
//!
//! ShuffleFS consists of several key components:
//!
//! - **Shuffle Context** ([`shuffler`]): lifecycle, routing, the epoch
//!   ladder and teardown statistics
//! - **Backends** ([`backend`]): the NN and XN transports behind one
//!   enqueue/epoch/destroy contract
//! - **Placement** ([`placement`]): the destination-rank engines
//! - **Process Group** ([`comm`]): rank identity, barriers, splits and
//!   reductions; in-process for tests, MPI behind the `mpi` feature
//! - **Transport** ([`transport`]): the point-to-point message seam and
//!   endpoint URI resolution
//! - **Wire** ([`wire`]): the fixed-length record frame
//! - **Sink** ([`sink`]): the delivery seam to the local indexed directory
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use shufflefs::comm::{LocalCluster, ProcessGroup};
//! use shufflefs::config::ShuffleConfig;
//! use shufflefs::shuffler::ShuffleContext;
//! use shufflefs::sink::MemorySink;
//! use shufflefs::transport::LoopbackFabric;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cfg = ShuffleConfig::from_env()?.with_record_shape(8, 16, 0);
//! let group: Arc<dyn ProcessGroup> = LocalCluster::new(1).remove(0);
//! let fabric = LoopbackFabric::new(1);
//! let sink = Arc::new(MemorySink::new());
//!
//! let ctx = ShuffleContext::init(cfg, group, Box::new(fabric.endpoint(0)), sink)?;
//! ctx.write(b"particle", b"0123456789abcdef", 0)?;
//! ctx.epoch_end();
//! ctx.finalize();
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod comm;
pub mod config;
pub mod constants;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod placement;
pub mod shuffler;
pub mod sink;
pub mod stats;
pub mod transport;
pub mod wire;

pub use config::ShuffleConfig;
pub use error::{ShuffleError, ShuffleResult};
pub use shuffler::ShuffleContext;
