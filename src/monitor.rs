//! Per-epoch shuffle counters for the external monitor.
//!
//! At each epoch start the active backend publishes the delta of its
//! cumulative counters since the previous snapshot. Local means
//! node-local traffic, remote means inter-node; delivered equals sends
//! because delivery is acknowledged inband. The min/max fields start out
//! equal to the value and become meaningful after a cross-rank reduction.

/// Snapshot of one epoch's shuffle activity on this rank.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MonitorStats {
    pub local_sends: u64,
    pub local_recvs: u64,
    pub local_delivered: u64,
    pub remote_sends: u64,
    pub remote_recvs: u64,
    pub remote_delivered: u64,

    pub min_local_sends: u64,
    pub max_local_sends: u64,
    pub min_local_recvs: u64,
    pub max_local_recvs: u64,
    pub min_remote_sends: u64,
    pub max_remote_sends: u64,
    pub min_remote_recvs: u64,
    pub max_remote_recvs: u64,
}

impl MonitorStats {
    /// Build a snapshot from per-channel deltas, seeding min == max == value.
    pub fn from_deltas(
        local_sends: u64,
        local_recvs: u64,
        remote_sends: u64,
        remote_recvs: u64,
    ) -> Self {
        Self {
            local_sends,
            local_recvs,
            local_delivered: local_sends,
            remote_sends,
            remote_recvs,
            remote_delivered: remote_sends,
            min_local_sends: local_sends,
            max_local_sends: local_sends,
            min_local_recvs: local_recvs,
            max_local_recvs: local_recvs,
            min_remote_sends: remote_sends,
            max_remote_sends: remote_sends,
            min_remote_recvs: remote_recvs,
            max_remote_recvs: remote_recvs,
        }
    }

    /// Total records this rank pushed into the shuffle during the epoch.
    pub fn total_sends(&self) -> u64 {
        self.local_sends + self.remote_sends
    }

    /// Total records this rank received during the epoch.
    pub fn total_recvs(&self) -> u64 {
        self.local_recvs + self.remote_recvs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delta_snapshot_seeds_min_max() {
        let s = MonitorStats::from_deltas(3, 5, 7, 9);
        assert_eq!(s.local_delivered, 3);
        assert_eq!(s.remote_delivered, 7);
        assert_eq!(s.min_local_recvs, 5);
        assert_eq!(s.max_remote_recvs, 9);
        assert_eq!(s.total_sends(), 10);
        assert_eq!(s.total_recvs(), 14);
    }
}
