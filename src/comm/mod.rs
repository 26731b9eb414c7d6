//! Process group seam.
//!
//! The shuffler needs a handful of collectives from its surrounding runtime:
//! rank identity, barriers, communicator splits (receiver subset, node-local
//! subgroup) and unsigned reductions for the teardown statistics. The trait
//! here is that contract; the MPI implementation lives behind the `mpi`
//! cargo feature so the default build needs no MPI toolchain, and an
//! in-process implementation backs tests and the bench driver.

use std::sync::Arc;

pub mod local;
#[cfg(feature = "mpi")]
pub mod mpi;

pub use local::{LocalCluster, LocalGroup};

/// Rank index within a process group
pub type Rank = i32;

/// Reduction operator for 64-bit unsigned counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Min,
    Max,
}

/// Collective communicator contract.
///
/// All methods marked collective must be invoked by every member of the
/// group, from the caller thread that drives the shuffle.
pub trait ProcessGroup {
    fn rank(&self) -> Rank;

    fn size(&self) -> Rank;

    /// Collective barrier over the group.
    fn barrier(&self);

    /// Collective split by color. Ranks passing `None` participate but end
    /// up in no subgroup and receive `None` (the null communicator).
    /// Subgroup ranks are assigned in ascending order of the parent rank.
    fn split(&self, color: Option<i32>) -> Option<Arc<dyn ProcessGroup>>;

    /// Collective split into node-local subgroups (ranks sharing a node).
    fn split_node_local(&self) -> Arc<dyn ProcessGroup>;

    /// Collective element-wise reduction to rank 0 of the group.
    /// Returns `Some` at the root, `None` elsewhere.
    fn reduce_u64(&self, op: ReduceOp, vals: &[u64]) -> Option<Vec<u64>>;

    /// Collective allgather of one i32 per rank, indexed by rank.
    fn allgather_i32(&self, value: i32) -> Vec<i32>;
}

/// Fold two reduction operands element-wise.
pub(crate) fn fold_u64(op: ReduceOp, acc: &mut [u64], vals: &[u64]) {
    debug_assert_eq!(acc.len(), vals.len());
    for (a, v) in acc.iter_mut().zip(vals) {
        *a = match op {
            ReduceOp::Sum => *a + *v,
            ReduceOp::Min => (*a).min(*v),
            ReduceOp::Max => (*a).max(*v),
        };
    }
}
