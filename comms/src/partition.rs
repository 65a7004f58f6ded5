use std::ops::Range;

use crate::{Key, PsError, Result, node::NodeId, specs::cluster::PartitionSpec};

/// Deterministic mapping from keys to the server ranks owning them.
///
/// Every node builds its own `Partitioner` from the same cluster spec, so the
/// mapping must only depend on the spec and the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Partitioner {
    scheme: PartitionSpec,
    key_space: u64,
    servers: usize,
}

impl Partitioner {
    /// Creates a new `Partitioner`.
    ///
    /// # Arguments
    /// * `scheme` - The partitioning rule.
    /// * `key_space` - The size of the declared key universe `[0, key_space)`.
    /// * `servers` - The amount of servers, must be greater than zero.
    pub fn new(scheme: PartitionSpec, key_space: u64, servers: usize) -> Self {
        Self {
            scheme,
            key_space,
            servers: servers.max(1),
        }
    }

    pub fn key_space(&self) -> u64 {
        self.key_space
    }

    pub fn servers(&self) -> usize {
        self.servers
    }

    /// The rank of the server owning `key`.
    ///
    /// # Returns
    /// `PsError::UnknownKey` if `key` lies outside the key space.
    pub fn owner_rank(&self, key: Key) -> Result<usize> {
        if key >= self.key_space {
            return Err(PsError::UnknownKey {
                key,
                detail: format!("outside of the key space [0, {})", self.key_space),
            });
        }

        let servers = self.servers as u64;

        let rank = match self.scheme {
            PartitionSpec::Range => {
                let (base, extra) = (self.key_space / servers, self.key_space % servers);
                let wide = extra * (base + 1);

                if key < wide {
                    key / (base + 1)
                } else {
                    extra + (key - wide) / base
                }
            }
            PartitionSpec::Hash => mix(key) % servers,
        };

        Ok(rank as usize)
    }

    /// The node id of the server owning `key`.
    pub fn owner_of(&self, key: Key) -> Result<NodeId> {
        self.owner_rank(key).map(|rank| 1 + rank as NodeId)
    }

    /// Whether the server of rank `rank` owns `key`.
    pub fn owns(&self, rank: usize, key: Key) -> bool {
        self.owner_rank(key).is_ok_and(|owner| owner == rank)
    }

    /// The contiguous key range owned by `rank`.
    ///
    /// # Returns
    /// `None` for hash partitioning or an out of bounds rank.
    pub fn range_of(&self, rank: usize) -> Option<Range<Key>> {
        if self.scheme != PartitionSpec::Range || rank >= self.servers {
            return None;
        }

        let servers = self.servers as u64;
        let (base, extra) = (self.key_space / servers, self.key_space % servers);
        let rank = rank as u64;

        let start = rank * base + rank.min(extra);
        let len = base + u64::from(rank < extra);
        Some(start..start + len)
    }

    /// Groups the positions of `keys` by owning server rank.
    ///
    /// Positions inside each group keep the order they had in `keys`, and the
    /// groups are sorted by rank.
    ///
    /// # Returns
    /// The groups or the first key outside the key space.
    pub fn slice(&self, keys: &[Key]) -> Result<Vec<(usize, Vec<usize>)>> {
        let mut groups: Vec<Vec<usize>> = vec![Vec::new(); self.servers];

        for (i, &key) in keys.iter().enumerate() {
            groups[self.owner_rank(key)?].push(i);
        }

        let sliced = groups
            .into_iter()
            .enumerate()
            .filter(|(_, positions)| !positions.is_empty())
            .collect();

        Ok(sliced)
    }
}

/// Fixed 64-bit finaliser, spreads consecutive keys over all servers.
fn mix(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^ (x >> 33)
}
