//! Counter-based IPv4 subnet allocation for session networks
//!
//! Each configured pool is a contiguous IPv4 range carved into fixed-size
//! subnets. Allocation is a dense counter walk: the k-th allocation from a
//! pool is computed from the pool base and `k`, so a subnet is never derived
//! from engine state. Released subnets leave the live set but the counter is
//! never rewound, which keeps every handed-out subnet unique for the life of
//! the process.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;

/// One configured subnet pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubnetPoolConfig {
    /// Pool name for stats and logging
    pub name: String,

    /// Base address of the pool range
    pub base_octets: [u8; 4],

    /// Host bits per carved subnet (4 -> /28, 8 -> /24)
    pub host_bits: u8,

    /// Number of subnets this pool can hand out
    pub capacity: u32,
}

impl SubnetPoolConfig {
    /// The pools the platform ships with: a /16 carved into /28s and a
    /// /12 carved into /24s, 4096 subnets each.
    pub fn default_pools() -> Vec<SubnetPoolConfig> {
        vec![
            SubnetPoolConfig {
                name: "primary".to_string(),
                base_octets: [10, 100, 0, 0],
                host_bits: 4,
                capacity: 4096,
            },
            SubnetPoolConfig {
                name: "secondary".to_string(),
                base_octets: [172, 16, 0, 0],
                host_bits: 8,
                capacity: 4096,
            },
        ]
    }

    /// CIDR string of the k-th subnet in this pool
    fn subnet_at(&self, k: u32) -> String {
        let base = u32::from(Ipv4Addr::from(self.base_octets));
        let addr = base.wrapping_add(k << self.host_bits);
        format!("{}/{}", Ipv4Addr::from(addr), 32 - self.host_bits)
    }
}

/// A live allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatedSubnet {
    /// Name of the pool it came from
    pub pool: String,
    /// CIDR notation, e.g. `10.100.0.16/28`
    pub subnet: String,
}

/// Allocator over an ordered list of pools
///
/// Not internally synchronized; the network manager wraps it in a lock so
/// all writers are serialized.
#[derive(Debug)]
pub struct SubnetAllocator {
    pools: Vec<SubnetPoolConfig>,
    /// Monotone per-pool counters, indexed like `pools`
    counters: Vec<u32>,
    /// Subnet string -> pool index, for every live allocation
    live: HashMap<String, usize>,
}

impl SubnetAllocator {
    /// Create an allocator over the given pools, tried in order
    pub fn new(pools: Vec<SubnetPoolConfig>) -> Self {
        let counters = vec![0; pools.len()];
        Self {
            pools,
            counters,
            live: HashMap::new(),
        }
    }

    /// Allocate the next subnet, spilling to later pools as earlier ones
    /// run out. Fails with `SubnetExhausted` when every pool has burned
    /// through its capacity.
    pub fn allocate(&mut self) -> Result<AllocatedSubnet> {
        for (idx, pool) in self.pools.iter().enumerate() {
            if self.counters[idx] >= pool.capacity {
                continue;
            }
            let k = self.counters[idx];
            self.counters[idx] += 1;

            let subnet = pool.subnet_at(k);
            self.live.insert(subnet.clone(), idx);
            return Ok(AllocatedSubnet {
                pool: pool.name.clone(),
                subnet,
            });
        }

        Err(Error::SubnetExhausted(format!(
            "all {} pools at capacity ({} live allocations)",
            self.pools.len(),
            self.live.len()
        )))
    }

    /// Remove a subnet from the live set. Returns false if it was not live
    /// (release is idempotent).
    pub fn release(&mut self, subnet: &str) -> bool {
        self.live.remove(subnet).is_some()
    }

    /// Whether a subnet is currently handed out
    pub fn is_live(&self, subnet: &str) -> bool {
        self.live.contains_key(subnet)
    }

    /// Number of live allocations
    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    /// Per-pool and aggregate allocation stats
    pub fn stats(&self) -> SubnetStats {
        let pools = self
            .pools
            .iter()
            .enumerate()
            .map(|(idx, pool)| {
                let live = self.live.values().filter(|&&i| i == idx).count();
                SubnetPoolStats {
                    name: pool.name.clone(),
                    allocated: self.counters[idx],
                    live,
                    capacity: pool.capacity,
                }
            })
            .collect::<Vec<_>>();

        SubnetStats {
            total_live: self.live.len(),
            total_capacity: self.pools.iter().map(|p| p.capacity as u64).sum(),
            pools,
        }
    }
}

/// Stats for one pool
#[derive(Debug, Clone, Serialize)]
pub struct SubnetPoolStats {
    /// Pool name
    pub name: String,
    /// Counter value: how many subnets this pool has ever handed out
    pub allocated: u32,
    /// How many of those are still live
    pub live: usize,
    /// Configured capacity
    pub capacity: u32,
}

/// Aggregate allocator stats
#[derive(Debug, Clone, Serialize)]
pub struct SubnetStats {
    /// Live allocations across all pools
    pub total_live: usize,
    /// Sum of pool capacities
    pub total_capacity: u64,
    /// Per-pool breakdown
    pub pools: Vec<SubnetPoolStats>,
}
