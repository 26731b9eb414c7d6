//! 配置エンジン (placement engine)
//!
//! 粒子IDのハッシュ値から担当ランクを決定する。全ランクが同じ
//! (プロトコル, ワールドサイズ, 仮想ノード係数, シード) で初期化する限り、
//! どのランクで計算しても同じ宛先になる。
//!
//! Four protocols share one `closest(key)` contract:
//! - `static_modulo`: plain modulo over the world size
//! - `ring`: consistent-hash ring with virtual nodes
//! - `xor`: nearest rank by xor distance in hash space
//! - `hash_lookup3`: highest-random-weight hashing (the name is kept for
//!   config compatibility with the classic placement library)
//!
//! A separate xxh32-modulo bypass exists for diagnostic runs that skip the
//! engine entirely.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh32::xxh32;
use xxhash_rust::xxh64::xxh64;

/// Placement protocol selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlacementProtocol {
    StaticModulo,
    HashLookup3,
    Xor,
    Ring,
}

impl FromStr for PlacementProtocol {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "static_modulo" => Ok(Self::StaticModulo),
            "hash_lookup3" => Ok(Self::HashLookup3),
            "xor" => Ok(Self::Xor),
            "ring" => Ok(Self::Ring),
            _ => Err(()),
        }
    }
}

impl fmt::Display for PlacementProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::StaticModulo => "static_modulo",
            Self::HashLookup3 => "hash_lookup3",
            Self::Xor => "xor",
            Self::Ring => "ring",
        };
        f.write_str(name)
    }
}

/// Deterministic mapping from a 64-bit key to a destination rank
pub enum PlacementEngine {
    Modulo {
        world: u64,
    },
    Ring {
        /// リング上の位置 -> ランク のマッピング
        ring: BTreeMap<u64, i32>,
        world: i32,
    },
    Xor {
        /// ランクごとの事前計算済みハッシュ
        anchors: Vec<u64>,
    },
    Hrw {
        world: i32,
        seed: u64,
    },
}

impl PlacementEngine {
    /// Initialize the engine for a fixed world.
    ///
    /// # Arguments
    /// * `protocol` - placement protocol
    /// * `world_size` - number of ranks, > 0
    /// * `virtual_factor` - virtual nodes per rank (ring only)
    /// * `seed` - hash seed; every rank must pass the same value
    pub fn new(
        protocol: PlacementProtocol,
        world_size: i32,
        virtual_factor: usize,
        seed: u64,
    ) -> Self {
        assert!(world_size > 0, "placement world size must be positive");

        match protocol {
            PlacementProtocol::StaticModulo => Self::Modulo {
                world: world_size as u64,
            },
            PlacementProtocol::Ring => {
                let mut ring = BTreeMap::new();
                for rank in 0..world_size {
                    for v in 0..virtual_factor.max(1) {
                        let vnode = format!("{}:{}", rank, v);
                        let position = xxh64(vnode.as_bytes(), seed);
                        ring.insert(position, rank);
                    }
                }
                Self::Ring {
                    ring,
                    world: world_size,
                }
            }
            PlacementProtocol::Xor => {
                let anchors = (0..world_size)
                    .map(|rank| xxh64(&rank.to_le_bytes(), seed))
                    .collect();
                Self::Xor { anchors }
            }
            PlacementProtocol::HashLookup3 => Self::Hrw {
                world: world_size,
                seed,
            },
        }
    }

    /// Return the single closest destination rank for a key.
    pub fn closest(&self, key: u64) -> i32 {
        match self {
            Self::Modulo { world } => (key % world) as i32,
            Self::Ring { ring, .. } => {
                // key以上の最小の位置を探し、無ければリングの先頭に戻る
                if let Some((_pos, rank)) = ring.range(key..).next() {
                    *rank
                } else {
                    *ring.iter().next().expect("placement ring is empty").1
                }
            }
            Self::Xor { anchors } => {
                let mut best = 0i32;
                let mut best_score = u64::MAX;
                for (rank, anchor) in anchors.iter().enumerate() {
                    let score = anchor ^ key;
                    if score < best_score {
                        best_score = score;
                        best = rank as i32;
                    }
                }
                best
            }
            Self::Hrw { world, seed } => {
                let mut best = 0i32;
                let mut best_weight = 0u64;
                let mut buf = [0u8; 12];
                buf[..8].copy_from_slice(&key.to_le_bytes());
                for rank in 0..*world {
                    buf[8..].copy_from_slice(&rank.to_le_bytes());
                    let weight = xxh64(&buf, *seed);
                    if rank == 0 || weight > best_weight {
                        best_weight = weight;
                        best = rank;
                    }
                }
                best
            }
        }
    }

    /// Number of ranks this engine places across.
    pub fn world_size(&self) -> i32 {
        match self {
            Self::Modulo { world } => *world as i32,
            Self::Ring { world, .. } => *world,
            Self::Xor { anchors } => anchors.len() as i32,
            Self::Hrw { world, .. } => *world,
        }
    }
}

/// Hash an identifier for placement lookup (seed 0, same on every rank).
#[inline]
pub fn placement_key(fname: &[u8]) -> u64 {
    xxh64(fname, 0)
}

/// Diagnostic bypass: modulo over a 32-bit hash, no placement engine.
#[inline]
pub fn modulo_bypass(fname: &[u8], world_size: i32) -> i32 {
    (xxh32(fname, 0) % world_size as u32) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROTOCOLS: [PlacementProtocol; 4] = [
        PlacementProtocol::StaticModulo,
        PlacementProtocol::HashLookup3,
        PlacementProtocol::Xor,
        PlacementProtocol::Ring,
    ];

    #[test]
    fn test_protocol_parsing() {
        for proto in PROTOCOLS {
            assert_eq!(
                PlacementProtocol::from_str(&proto.to_string()),
                Ok(proto)
            );
        }
        assert!(PlacementProtocol::from_str("random").is_err());
    }

    #[test]
    fn test_every_protocol_stays_in_range() {
        for proto in PROTOCOLS {
            let engine = PlacementEngine::new(proto, 7, 16, 0);
            for i in 0..10_000u64 {
                let dst = engine.closest(xxh64(&i.to_le_bytes(), 0));
                assert!((0..7).contains(&dst), "{} out of range for {}", dst, proto);
            }
        }
    }

    #[test]
    fn test_independent_engines_agree() {
        // 別々に構築したエンジンが同じ宛先表を出すこと
        for proto in PROTOCOLS {
            let a = PlacementEngine::new(proto, 16, 32, 0);
            let b = PlacementEngine::new(proto, 16, 32, 0);
            for i in 0..10_000u64 {
                let key = xxh64(&i.to_le_bytes(), 0);
                assert_eq!(a.closest(key), b.closest(key), "protocol {}", proto);
            }
        }
    }

    #[test]
    fn test_seed_changes_ring_layout() {
        let a = PlacementEngine::new(PlacementProtocol::Ring, 16, 32, 0);
        let b = PlacementEngine::new(PlacementProtocol::Ring, 16, 32, 1);
        let differs = (0..1_000u64).any(|i| {
            let key = xxh64(&i.to_le_bytes(), 0);
            a.closest(key) != b.closest(key)
        });
        assert!(differs);
    }

    #[test]
    fn test_ring_distribution() {
        let engine = PlacementEngine::new(PlacementProtocol::Ring, 4, 64, 0);
        let mut counts = [0usize; 4];
        for i in 0..8_000u64 {
            let key = xxh64(&i.to_le_bytes(), 0);
            counts[engine.closest(key) as usize] += 1;
        }
        // 完全に均等ではないが、どのランクも合理的な量を担当する
        for (rank, count) in counts.iter().enumerate() {
            assert!(
                *count > 800,
                "rank {} has only {} keys (expected > 800)",
                rank,
                count
            );
        }
    }

    #[test]
    fn test_modulo_bypass_range() {
        for i in 0..1_000u32 {
            let fname = format!("particle{}", i);
            let dst = modulo_bypass(fname.as_bytes(), 5);
            assert!((0..5).contains(&dst));
        }
    }

    #[test]
    fn test_single_rank_world() {
        for proto in PROTOCOLS {
            let engine = PlacementEngine::new(proto, 1, 8, 0);
            assert_eq!(engine.closest(0xdeadbeef), 0);
        }
    }
}
