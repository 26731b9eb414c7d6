//! MPI-backed process group (requires the `mpi` cargo feature).
//!
//! Thin wrapper mapping the [`ProcessGroup`] contract onto rsmpi. The
//! caller owns the MPI universe; ranks, barriers, splits and reductions all
//! delegate to the wrapped communicator.

use std::sync::Arc;

use mpi::collective::SystemOperation;
use mpi::topology::{Color, SimpleCommunicator};
use mpi::traits::*;

use super::{ProcessGroup, Rank, ReduceOp};

/// A process group backed by an MPI communicator.
pub struct MpiComm {
    comm: SimpleCommunicator,
}

impl MpiComm {
    /// Wrap an existing communicator (usually the world communicator of an
    /// initialized universe).
    pub fn new(comm: SimpleCommunicator) -> Self {
        Self { comm }
    }
}

impl ProcessGroup for MpiComm {
    fn rank(&self) -> Rank {
        self.comm.rank()
    }

    fn size(&self) -> Rank {
        self.comm.size()
    }

    fn barrier(&self) {
        self.comm.barrier();
    }

    fn split(&self, color: Option<i32>) -> Option<Arc<dyn ProcessGroup>> {
        let mpi_color = match color {
            Some(c) => Color::with_value(c),
            None => Color::undefined(),
        };
        self.comm
            .split_by_color(mpi_color)
            .map(|comm| Arc::new(MpiComm { comm }) as Arc<dyn ProcessGroup>)
    }

    fn split_node_local(&self) -> Arc<dyn ProcessGroup> {
        let comm = self.comm.split_shared(self.comm.rank());
        Arc::new(MpiComm { comm })
    }

    fn reduce_u64(&self, op: ReduceOp, vals: &[u64]) -> Option<Vec<u64>> {
        let op = match op {
            ReduceOp::Sum => SystemOperation::sum(),
            ReduceOp::Min => SystemOperation::min(),
            ReduceOp::Max => SystemOperation::max(),
        };
        let root = self.comm.process_at_rank(0);
        if self.comm.rank() == 0 {
            let mut out = vec![0u64; vals.len()];
            root.reduce_into_root(vals, &mut out[..], op);
            Some(out)
        } else {
            root.reduce_into(vals, op);
            None
        }
    }

    fn allgather_i32(&self, value: i32) -> Vec<i32> {
        let mut all = vec![0i32; self.comm.size() as usize];
        self.comm.all_gather_into(&value, &mut all[..]);
        all
    }
}
