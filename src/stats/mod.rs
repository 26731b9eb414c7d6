//! Teardown statistics: histograms, CPU usage, reductions, formatting.
//!
//! Backends accumulate histograms (progress-loop interval, inbound queue
//! depth) and per-thread CPU usage while running; at teardown the shuffler
//! reduces them across the relevant communicator and reports mean, min,
//! max and a percentile ladder on rank 0.
//!
//! Values are kept as u64 (microseconds, counts) so the cross-rank
//! reduction is exact; percentiles are estimated from power-of-two buckets,
//! which is plenty for the tail-latency ladder reported at shutdown.

use std::sync::Arc;

use crate::comm::{ProcessGroup, ReduceOp};

// bucket 0 holds zero, bucket i holds [2^(i-1), 2^i); bucket 64 covers the
// top half-range where no 2^i upper bound exists in u64
const NUM_BUCKETS: usize = 65;

/// Integer percentiles of the report ladder
pub const PTILE_INT: [u32; 10] = [10, 30, 50, 70, 90, 95, 96, 97, 98, 99];

/// Fractional tail percentiles of the report ladder
pub const PTILE_FRAC: [f64; 10] = [
    99.5, 99.7, 99.9, 99.95, 99.97, 99.99, 99.995, 99.997, 99.999, 99.9999,
];

/// Power-of-two bucket histogram over u64 samples.
#[derive(Debug, Clone)]
pub struct Histogram {
    count: u64,
    sum: u64,
    min: u64,
    max: u64,
    buckets: [u64; NUM_BUCKETS],
}

impl Default for Histogram {
    fn default() -> Self {
        Self {
            count: 0,
            sum: 0,
            min: u64::MAX,
            max: 0,
            buckets: [0; NUM_BUCKETS],
        }
    }
}

impl Histogram {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn bucket_index(value: u64) -> usize {
        (64 - value.leading_zeros()) as usize
    }

    pub fn observe(&mut self, value: u64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.buckets[Self::bucket_index(value)] += 1;
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn min(&self) -> u64 {
        if self.count == 0 { 0 } else { self.min }
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn sum(&self) -> u64 {
        self.sum
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }

    /// Estimate the p-th percentile (0 < p <= 100) from the buckets.
    pub fn percentile(&self, p: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let target = (p / 100.0 * self.count as f64).ceil() as u64;
        let mut cumulative = 0u64;
        for (i, n) in self.buckets.iter().enumerate() {
            cumulative += n;
            if cumulative >= target.max(1) {
                // report the bucket's upper edge, clamped into the
                // observed range
                let edge = match i {
                    0 => 0u64,
                    1..=63 => (1u64 << i) - 1,
                    _ => u64::MAX,
                };
                return (edge.clamp(self.min, self.max)) as f64;
            }
        }
        self.max as f64
    }

    pub fn merge(&mut self, other: &Histogram) {
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        for (a, b) in self.buckets.iter_mut().zip(&other.buckets) {
            *a += b;
        }
    }

    /// Collective reduction over a communicator; the merged histogram
    /// lands on rank 0.
    pub fn reduce(&self, group: &Arc<dyn ProcessGroup>) -> Option<Histogram> {
        let mut words = Vec::with_capacity(2 + NUM_BUCKETS);
        words.push(self.count);
        words.push(self.sum);
        words.extend_from_slice(&self.buckets);

        let sums = group.reduce_u64(ReduceOp::Sum, &words);
        let mins = group.reduce_u64(ReduceOp::Min, &[self.min]);
        let maxs = group.reduce_u64(ReduceOp::Max, &[self.max]);

        let (sums, mins, maxs) = match (sums, mins, maxs) {
            (Some(s), Some(mn), Some(mx)) => (s, mn, mx),
            _ => return None,
        };

        let mut merged = Histogram {
            count: sums[0],
            sum: sums[1],
            min: mins[0],
            max: maxs[0],
            buckets: [0; NUM_BUCKETS],
        };
        merged.buckets.copy_from_slice(&sums[2..]);
        Some(merged)
    }
}

/// CPU time consumed by one thread, in microseconds.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CpuUsage {
    pub usr_micros: u64,
    pub sys_micros: u64,
}

impl CpuUsage {
    /// Usage of the calling thread so far.
    pub fn now() -> Self {
        let mut ru: libc::rusage = unsafe { std::mem::zeroed() };
        #[cfg(target_os = "linux")]
        let who = libc::RUSAGE_THREAD;
        #[cfg(not(target_os = "linux"))]
        let who = libc::RUSAGE_SELF;
        // SAFETY: ru is a valid zeroed rusage the kernel fills in
        unsafe {
            libc::getrusage(who, &mut ru);
        }
        Self {
            usr_micros: ru.ru_utime.tv_sec as u64 * 1_000_000 + ru.ru_utime.tv_usec as u64,
            sys_micros: ru.ru_stime.tv_sec as u64 * 1_000_000 + ru.ru_stime.tv_usec as u64,
        }
    }

    /// Usage accumulated since an earlier snapshot of the same thread.
    pub fn since(&self, earlier: &CpuUsage) -> CpuUsage {
        CpuUsage {
            usr_micros: self.usr_micros.saturating_sub(earlier.usr_micros),
            sys_micros: self.sys_micros.saturating_sub(earlier.sys_micros),
        }
    }

    /// Collective sum over a communicator, landing on rank 0.
    pub fn reduce(&self, group: &Arc<dyn ProcessGroup>) -> Option<CpuUsage> {
        group
            .reduce_u64(ReduceOp::Sum, &[self.usr_micros, self.sys_micros])
            .map(|v| CpuUsage {
                usr_micros: v[0],
                sys_micros: v[1],
            })
    }
}

/// CPU usage attributed to one shuffle phase ("main", "bg", ...).
#[derive(Debug, Clone, Copy)]
pub struct TaggedUsage {
    pub tag: &'static str,
    pub usage: CpuUsage,
}

/// Format a count with a metric suffix ("12.3K", "4.5M").
pub fn pretty_num(value: f64) -> String {
    if value >= 1e9 {
        format!("{:.3}B", value / 1e9)
    } else if value >= 1e6 {
        format!("{:.3}M", value / 1e6)
    } else if value >= 1e3 {
        format!("{:.3}K", value / 1e3)
    } else {
        format!("{:.0}", value)
    }
}

/// Format a byte count with a binary suffix ("1.5 MiB").
pub fn pretty_size(bytes: f64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = 1024.0 * 1024.0;
    const GIB: f64 = 1024.0 * 1024.0 * 1024.0;
    if bytes >= GIB {
        format!("{:.1} GiB", bytes / GIB)
    } else if bytes >= MIB {
        format!("{:.1} MiB", bytes / MIB)
    } else if bytes >= KIB {
        format!("{:.1} KiB", bytes / KIB)
    } else {
        format!("{:.0} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalCluster;
    use std::thread;

    #[test]
    fn test_histogram_basic_stats() {
        let mut h = Histogram::new();
        for v in [1u64, 2, 3, 4, 100] {
            h.observe(v);
        }
        assert_eq!(h.count(), 5);
        assert_eq!(h.min(), 1);
        assert_eq!(h.max(), 100);
        assert_eq!(h.sum(), 110);
        assert!((h.mean() - 22.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_histogram() {
        let h = Histogram::new();
        assert_eq!(h.count(), 0);
        assert_eq!(h.min(), 0);
        assert_eq!(h.max(), 0);
        assert_eq!(h.mean(), 0.0);
        assert_eq!(h.percentile(99.0), 0.0);
    }

    #[test]
    fn test_top_half_range_values() {
        // values at and above 2^63 land in the last bucket, not past it
        let mut h = Histogram::new();
        h.observe(u64::MAX);
        h.observe(1u64 << 63);
        h.observe(7);

        assert_eq!(h.count(), 3);
        assert_eq!(h.min(), 7);
        assert_eq!(h.max(), u64::MAX);
        assert_eq!(h.percentile(99.0), u64::MAX as f64);

        let mut other = Histogram::new();
        other.observe(u64::MAX);
        h.merge(&other);
        assert_eq!(h.count(), 4);
        assert_eq!(h.max(), u64::MAX);
    }

    #[test]
    fn test_percentile_monotone() {
        let mut h = Histogram::new();
        for v in 0..1000u64 {
            h.observe(v);
        }
        let p50 = h.percentile(50.0);
        let p90 = h.percentile(90.0);
        let p999 = h.percentile(99.9);
        assert!(p50 <= p90);
        assert!(p90 <= p999);
        assert!(p999 <= h.max() as f64);
    }

    #[test]
    fn test_histogram_merge_matches_combined() {
        let mut a = Histogram::new();
        let mut b = Histogram::new();
        let mut c = Histogram::new();
        for v in 0..100u64 {
            a.observe(v);
            c.observe(v);
        }
        for v in 100..200u64 {
            b.observe(v);
            c.observe(v);
        }
        a.merge(&b);
        assert_eq!(a.count(), c.count());
        assert_eq!(a.sum(), c.sum());
        assert_eq!(a.min(), c.min());
        assert_eq!(a.max(), c.max());
    }

    #[test]
    fn test_histogram_reduce_across_ranks() {
        let groups = LocalCluster::new(3);
        let handles: Vec<_> = groups
            .into_iter()
            .map(|g| {
                thread::spawn(move || {
                    let group: Arc<dyn crate::comm::ProcessGroup> = g;
                    let mut h = Histogram::new();
                    for v in 0..10u64 {
                        h.observe(v + group.rank() as u64 * 100);
                    }
                    (group.rank(), h.reduce(&group))
                })
            })
            .collect();
        for handle in handles {
            let (rank, reduced) = handle.join().unwrap();
            if rank == 0 {
                let merged = reduced.unwrap();
                assert_eq!(merged.count(), 30);
                assert_eq!(merged.min(), 0);
                assert_eq!(merged.max(), 209);
            } else {
                assert!(reduced.is_none());
            }
        }
    }

    #[test]
    fn test_cpu_usage_delta() {
        let a = CpuUsage {
            usr_micros: 10,
            sys_micros: 20,
        };
        let b = CpuUsage {
            usr_micros: 15,
            sys_micros: 22,
        };
        assert_eq!(
            b.since(&a),
            CpuUsage {
                usr_micros: 5,
                sys_micros: 2
            }
        );
    }

    #[test]
    fn test_pretty_formats() {
        assert_eq!(pretty_num(999.0), "999");
        assert_eq!(pretty_num(1500.0), "1.500K");
        assert_eq!(pretty_num(2_500_000.0), "2.500M");
        assert_eq!(pretty_size(512.0), "512 B");
        assert_eq!(pretty_size(2048.0), "2.0 KiB");
        assert_eq!(pretty_size(3.0 * 1024.0 * 1024.0), "3.0 MiB");
    }
}
