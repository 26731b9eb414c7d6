//! In-process process group.
//!
//! One `LocalCluster` plays the role of an N-rank world inside a single
//! process, with every rank driven by its own thread. Collectives are
//! implemented over a generation-counted rendezvous board protected by a
//! mutex and condvar. This is what integration tests and the bench driver
//! run the shuffler on; it is also the reference semantics for the MPI
//! implementation behind the `mpi` feature.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use super::{fold_u64, ProcessGroup, Rank, ReduceOp};

/// Factory for the rank handles of one in-process world.
pub struct LocalCluster;

impl LocalCluster {
    /// Create an N-rank world and return one handle per rank.
    ///
    /// Each handle is meant to move into the thread driving that rank.
    pub fn new(size: usize) -> Vec<Arc<LocalGroup>> {
        assert!(size > 0, "cluster size must be positive");
        let core = Arc::new(GroupCore::new(size));
        (0..size)
            .map(|rank| {
                Arc::new(LocalGroup {
                    rank: rank as Rank,
                    core: core.clone(),
                })
            })
            .collect()
    }
}

/// One rank's handle onto an in-process group.
pub struct LocalGroup {
    rank: Rank,
    core: Arc<GroupCore>,
}

struct GroupCore {
    size: usize,
    board: Mutex<Board>,
    cv: Condvar,
    /// Subgroup cores created by `split`, keyed by (round, color) so every
    /// member of one split call lands on the same core.
    children: Mutex<HashMap<(u64, i32), Arc<GroupCore>>>,
}

/// Rendezvous board: one collective round in flight at a time.
///
/// 全ランクが値を書き込むと結果が確定し、全ランクが読み終わると
/// 次のラウンドへ進む。
struct Board {
    round: u64,
    contributions: Vec<Option<Vec<u64>>>,
    filled: usize,
    result: Option<Vec<Vec<u64>>>,
    exited: usize,
}

impl GroupCore {
    fn new(size: usize) -> Self {
        Self {
            size,
            board: Mutex::new(Board {
                round: 0,
                contributions: vec![None; size],
                filled: 0,
                result: None,
                exited: 0,
            }),
            cv: Condvar::new(),
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Contribute one value and receive every rank's contribution.
    ///
    /// Returns the round number (used to key subgroup creation) and the
    /// board indexed by group rank.
    fn exchange(&self, rank: usize, value: Vec<u64>) -> (u64, Vec<Vec<u64>>) {
        let mut board = self.board.lock().unwrap();

        // wait for the previous round to fully drain
        while board.result.is_some() {
            board = self.cv.wait(board).unwrap();
        }

        let round = board.round;
        debug_assert!(board.contributions[rank].is_none(), "rank re-entered round");
        board.contributions[rank] = Some(value);
        board.filled += 1;
        if board.filled == self.size {
            let all: Vec<Vec<u64>> = board
                .contributions
                .iter_mut()
                .map(|c| c.take().unwrap())
                .collect();
            board.result = Some(all);
            self.cv.notify_all();
        }

        loop {
            if board.round == round {
                if let Some(result) = &board.result {
                    let out = result.clone();
                    board.exited += 1;
                    if board.exited == self.size {
                        board.result = None;
                        board.exited = 0;
                        board.filled = 0;
                        board.round += 1;
                        self.cv.notify_all();
                    }
                    return (round, out);
                }
            }
            board = self.cv.wait(board).unwrap();
        }
    }
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> Rank {
        self.core.size as Rank
    }

    fn barrier(&self) {
        self.core.exchange(self.rank as usize, Vec::new());
    }

    fn split(&self, color: Option<i32>) -> Option<Arc<dyn ProcessGroup>> {
        // encode (membership, color) so uncolored ranks can participate
        let encoded = match color {
            Some(c) => vec![1, c as u32 as u64],
            None => vec![0, 0],
        };
        let (round, board) = self.core.exchange(self.rank as usize, encoded);

        let my_color = color?;
        let members: Vec<usize> = board
            .iter()
            .enumerate()
            .filter(|(_, v)| v[0] == 1 && v[1] == my_color as u32 as u64)
            .map(|(rank, _)| rank)
            .collect();
        let sub_rank = members
            .iter()
            .position(|&r| r == self.rank as usize)
            .expect("splitting rank missing from its own color group");

        let mut children = self.core.children.lock().unwrap();
        let child = children
            .entry((round, my_color))
            .or_insert_with(|| Arc::new(GroupCore::new(members.len())))
            .clone();
        drop(children);

        Some(Arc::new(LocalGroup {
            rank: sub_rank as Rank,
            core: child,
        }))
    }

    fn split_node_local(&self) -> Arc<dyn ProcessGroup> {
        // every in-process rank shares one node, the subgroup is the world
        Arc::new(LocalGroup {
            rank: self.rank,
            core: self.core.clone(),
        })
    }

    fn reduce_u64(&self, op: ReduceOp, vals: &[u64]) -> Option<Vec<u64>> {
        let (_, board) = self.core.exchange(self.rank as usize, vals.to_vec());
        if self.rank != 0 {
            return None;
        }
        let mut acc = board[0].clone();
        for contribution in &board[1..] {
            fold_u64(op, &mut acc, contribution);
        }
        Some(acc)
    }

    fn allgather_i32(&self, value: i32) -> Vec<i32> {
        let (_, board) = self
            .core
            .exchange(self.rank as usize, vec![value as u32 as u64]);
        board.iter().map(|v| v[0] as u32 as i32).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_world<F, T>(size: usize, f: F) -> Vec<T>
    where
        F: Fn(Arc<LocalGroup>) -> T + Send + Sync + Clone + 'static,
        T: Send + 'static,
    {
        let groups = LocalCluster::new(size);
        let handles: Vec<_> = groups
            .into_iter()
            .map(|g| {
                let f = f.clone();
                thread::spawn(move || f(g))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_rank_and_size() {
        let results = run_world(4, |g| (g.rank(), g.size()));
        let mut ranks: Vec<_> = results.iter().map(|(r, _)| *r).collect();
        ranks.sort();
        assert_eq!(ranks, vec![0, 1, 2, 3]);
        assert!(results.iter().all(|(_, s)| *s == 4));
    }

    #[test]
    fn test_reduce_sum_min_max() {
        let results = run_world(4, |g| {
            let rank = g.rank() as u64;
            let sum = g.reduce_u64(ReduceOp::Sum, &[rank, 10]);
            let min = g.reduce_u64(ReduceOp::Min, &[rank + 1]);
            let max = g.reduce_u64(ReduceOp::Max, &[rank]);
            (g.rank(), sum, min, max)
        });
        for (rank, sum, min, max) in results {
            if rank == 0 {
                assert_eq!(sum, Some(vec![6, 40]));
                assert_eq!(min, Some(vec![1]));
                assert_eq!(max, Some(vec![3]));
            } else {
                assert!(sum.is_none() && min.is_none() && max.is_none());
            }
        }
    }

    #[test]
    fn test_allgather() {
        let results = run_world(3, |g| g.allgather_i32(g.rank() * 10));
        for board in results {
            assert_eq!(board, vec![0, 10, 20]);
        }
    }

    #[test]
    fn test_split_even_odd() {
        let results = run_world(4, |g| {
            let sub = g.split(Some(g.rank() % 2)).unwrap();
            (g.rank(), sub.rank(), sub.size())
        });
        for (rank, sub_rank, sub_size) in results {
            assert_eq!(sub_size, 2);
            assert_eq!(sub_rank, rank / 2);
        }
    }

    #[test]
    fn test_split_with_null_members() {
        let results = run_world(4, |g| {
            let color = if g.rank() == 0 { Some(7) } else { None };
            let sub = g.split(color);
            (g.rank(), sub.map(|s| (s.rank(), s.size())))
        });
        for (rank, sub) in results {
            if rank == 0 {
                assert_eq!(sub, Some((0, 1)));
            } else {
                assert!(sub.is_none());
            }
        }
    }

    #[test]
    fn test_subgroup_collectives_are_independent() {
        let results = run_world(4, |g| {
            let sub = g.split(Some(g.rank() % 2)).unwrap();
            // both halves reduce concurrently
            let total = sub.reduce_u64(ReduceOp::Sum, &[g.rank() as u64]);
            sub.barrier();
            (g.rank(), total)
        });
        for (rank, total) in results {
            match rank {
                0 => assert_eq!(total, Some(vec![2])),
                1 => assert_eq!(total, Some(vec![4])),
                _ => assert!(total.is_none()),
            }
        }
    }

    #[test]
    fn test_repeated_barriers() {
        let results = run_world(3, |g| {
            for _ in 0..100 {
                g.barrier();
            }
            g.rank()
        });
        assert_eq!(results.len(), 3);
    }
}
