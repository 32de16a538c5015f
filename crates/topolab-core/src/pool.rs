//! IPv4 address block allocation for environment networks.
//!
//! The pool carves fixed-size blocks out of one or more address spaces and
//! hands them to networks as they are built. Blocks already routed on the
//! host are reserved at startup so that an environment never shadows a
//! real network.
//!
//! Allocations may carry an owner, the id of the environment holding the
//! block. Owned blocks can only be released by their owner, which keeps a
//! stale copy of an environment from freeing a block another live
//! environment still uses.
//!
//! # Example
//!
//! ```ignore
//! use topolab_core::{AddressPool, PoolConfig};
//!
//! let mut pool = AddressPool::new(&PoolConfig::default());
//! pool.reserve("10.0.0.0/24".parse()?);
//!
//! let block = pool.get()?; // 10.0.1.0/24
//! pool.put(block)?;
//! ```

use crate::error::{CoreError, Result};
use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;

// ============================================================================
// Configuration
// ============================================================================

/// Address space blocks are carved from by default.
pub const DEFAULT_POOL_NETWORK: Ipv4Net = Ipv4Net::new_assert(Ipv4Addr::new(10, 0, 0, 0), 16);

/// Prefix length of every allocated block by default.
pub const DEFAULT_PREFIX_LEN: u8 = 24;

/// Keywords `ip route` may print before a route's destination.
const ROUTE_TYPES: &[&str] = &[
    "unicast",
    "local",
    "broadcast",
    "multicast",
    "throw",
    "unreachable",
    "prohibit",
    "blackhole",
    "nat",
    "anycast",
];

/// Configuration for the address pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Address spaces to allocate from, in preference order.
    ///
    /// Default: `[10.0.0.0/16]`
    pub networks: Vec<Ipv4Net>,

    /// Prefix length of allocated blocks.
    ///
    /// Default: 24
    pub prefix_len: u8,

    /// Blocks that must never be handed out, in addition to host routes.
    pub reserved: Vec<Ipv4Net>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            networks: vec![DEFAULT_POOL_NETWORK],
            prefix_len: DEFAULT_PREFIX_LEN,
            reserved: Vec::new(),
        }
    }
}

impl PoolConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.networks.is_empty() {
            return Err(CoreError::Config("pool needs at least one network".into()));
        }
        if self.prefix_len > 32 {
            return Err(CoreError::Config(format!(
                "pool prefix length {} is not a valid IPv4 prefix",
                self.prefix_len
            )));
        }
        if let Some(net) = self
            .networks
            .iter()
            .find(|net| net.prefix_len() > self.prefix_len)
        {
            return Err(CoreError::Config(format!(
                "pool network {} is smaller than a /{} block",
                net, self.prefix_len
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Number of reserved blocks.
    pub reserved: usize,
    /// Number of blocks handed out and not yet returned.
    pub allocated: usize,
    /// Number of blocks `get` could still return.
    pub available: usize,
}

// ============================================================================
// Pool Implementation
// ============================================================================

/// Tracks reserved and allocated IPv4 blocks.
///
/// Candidates are enumerated in a fixed order (configured networks first to
/// last, each split into blocks in ascending address order), so `get`
/// always returns the lowest free block. A candidate is free when it
/// intersects no reserved block and no allocated block.
///
/// # Thread Safety
///
/// `AddressPool` has no interior locking. The controller keeps it behind an
/// async mutex.
#[derive(Debug, Clone)]
pub struct AddressPool {
    networks: Vec<Ipv4Net>,
    prefix_len: u8,
    reserved: BTreeSet<Ipv4Net>,
    /// Allocated block -> owning environment, if any.
    allocated: BTreeMap<Ipv4Net, Option<String>>,
}

impl AddressPool {
    /// Create a pool from `config`, reserving its `reserved` blocks.
    pub fn new(config: &PoolConfig) -> Self {
        let mut pool = Self {
            networks: config.networks.clone(),
            prefix_len: config.prefix_len,
            reserved: BTreeSet::new(),
            allocated: BTreeMap::new(),
        };
        for block in &config.reserved {
            pool.reserve(*block);
        }
        pool
    }

    /// Mark `block` as unavailable.
    ///
    /// Reserving never fails, and may overlap blocks already allocated; it
    /// only constrains future calls to [`get`](Self::get).
    pub fn reserve(&mut self, block: Ipv4Net) {
        let block = block.trunc();
        if self.reserved.insert(block) {
            tracing::debug!(block = %block, "Reserved address block");
        }
    }

    /// Allocate the lowest free block.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PoolExhausted`] when every candidate overlaps a
    /// reserved or allocated block.
    pub fn get(&mut self) -> Result<Ipv4Net> {
        self.allocate(None)
    }

    /// Allocate the lowest free block on behalf of `owner`.
    ///
    /// Only [`release`](Self::release) with the same owner, or
    /// [`put`](Self::put), frees it again.
    pub fn get_for(&mut self, owner: &str) -> Result<Ipv4Net> {
        self.allocate(Some(owner))
    }

    fn allocate(&mut self, owner: Option<&str>) -> Result<Ipv4Net> {
        let block = self
            .candidates()
            .find(|candidate| self.is_free(candidate))
            .ok_or(CoreError::PoolExhausted)?;
        self.allocated.insert(block, owner.map(str::to_string));
        tracing::debug!(
            block = %block,
            owner = owner.unwrap_or_default(),
            allocated = self.allocated.len(),
            "Allocated address block"
        );
        Ok(block)
    }

    /// Return an allocated block to the pool.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotAllocated`] if the block was not handed out
    /// by this pool, or has already been returned.
    pub fn put(&mut self, block: Ipv4Net) -> Result<()> {
        let block = block.trunc();
        if self.allocated.remove(&block).is_none() {
            return Err(CoreError::NotAllocated(block));
        }
        tracing::debug!(block = %block, allocated = self.allocated.len(), "Released address block");
        Ok(())
    }

    /// Return a block held by `owner`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotAllocated`] if the block is not handed out,
    /// and [`CoreError::NotOwned`] if it is held by anyone else. In both
    /// cases the pool is left unchanged.
    pub fn release(&mut self, block: Ipv4Net, owner: &str) -> Result<()> {
        let block = block.trunc();
        let held = match self.allocated.get(&block) {
            Some(holder) => holder.as_deref() == Some(owner),
            None => return Err(CoreError::NotAllocated(block)),
        };
        if !held {
            return Err(CoreError::NotOwned {
                block,
                owner: owner.to_string(),
            });
        }
        self.put(block)
    }

    /// Record a block `owner` obtained before this pool existed, e.g. in
    /// an earlier run.
    ///
    /// Adopting a block `owner` already holds is a no-op that succeeds.
    /// Returns `false`, leaving the pool unchanged, if the block overlaps
    /// any other allocated block. Overlap with reserved blocks is accepted:
    /// a live network usually shows up in the host routes itself.
    pub fn adopt(&mut self, block: Ipv4Net, owner: &str) -> bool {
        let block = block.trunc();
        if self.owner(&block) == Some(owner) {
            return true;
        }
        if self.allocated.keys().any(|taken| overlaps(&block, taken)) {
            return false;
        }
        self.allocated.insert(block, Some(owner.to_string()));
        tracing::debug!(block = %block, owner, "Adopted address block");
        true
    }

    /// Whether `block` is currently handed out.
    pub fn is_allocated(&self, block: &Ipv4Net) -> bool {
        self.allocated.contains_key(&block.trunc())
    }

    /// The environment holding `block`, if it was allocated to one.
    pub fn owner(&self, block: &Ipv4Net) -> Option<&str> {
        self.allocated.get(&block.trunc())?.as_deref()
    }

    /// Reserved blocks in ascending order.
    pub fn reserved(&self) -> impl Iterator<Item = &Ipv4Net> {
        self.reserved.iter()
    }

    /// Allocated blocks in ascending order.
    pub fn allocated(&self) -> impl Iterator<Item = &Ipv4Net> {
        self.allocated.keys()
    }

    /// Current occupancy.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            reserved: self.reserved.len(),
            allocated: self.allocated.len(),
            available: self
                .candidates()
                .filter(|candidate| self.is_free(candidate))
                .count(),
        }
    }

    fn candidates(&self) -> impl Iterator<Item = Ipv4Net> + '_ {
        self.networks
            .iter()
            .filter_map(|net| net.subnets(self.prefix_len).ok())
            .flatten()
    }

    fn is_free(&self, candidate: &Ipv4Net) -> bool {
        !self
            .reserved
            .iter()
            .chain(self.allocated.keys())
            .any(|taken| overlaps(candidate, taken))
    }
}

/// Whether two blocks share at least one address.
pub fn overlaps(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    a.network() <= b.broadcast() && b.network() <= a.broadcast()
}

// ============================================================================
// Host Routes
// ============================================================================

/// Extract route destinations from `ip route` output.
///
/// Default routes are skipped. A bare address is read as a /32 host route.
/// Lines whose destination is not an IPv4 network are logged and ignored.
pub fn parse_routes(output: &str) -> Vec<Ipv4Net> {
    let mut routes = Vec::new();
    for line in output.lines() {
        let mut words = line.split_whitespace();
        let Some(mut dest) = words.next() else {
            continue;
        };
        if ROUTE_TYPES.contains(&dest) {
            match words.next() {
                Some(next) => dest = next,
                None => continue,
            }
        }
        if dest == "default" {
            continue;
        }
        match parse_destination(dest) {
            Some(net) => routes.push(net),
            None => tracing::debug!(line, "Skipping route without IPv4 destination"),
        }
    }
    routes
}

fn parse_destination(dest: &str) -> Option<Ipv4Net> {
    dest.parse::<Ipv4Net>()
        .ok()
        .or_else(|| dest.parse::<Ipv4Addr>().ok().map(Ipv4Net::from))
        .map(|net| net.trunc())
}

/// Supplies the routes already in use on the host.
#[async_trait]
pub trait RouteSource: Send + Sync {
    /// Destinations to reserve, default routes excluded.
    async fn routes(&self) -> Result<Vec<Ipv4Net>>;
}

/// Reads routes from the `ip route` command.
#[derive(Debug, Default, Clone, Copy)]
pub struct IpRoute;

#[async_trait]
impl RouteSource for IpRoute {
    async fn routes(&self) -> Result<Vec<Ipv4Net>> {
        host_routes().await
    }
}

/// Read the host's routing table with `ip route`.
pub async fn host_routes() -> Result<Vec<Ipv4Net>> {
    tracing::debug!("Scanning for ip networks that are already taken");
    let output = tokio::process::Command::new("ip")
        .arg("route")
        .output()
        .await
        .map_err(|e| CoreError::HostRoutes(format!("failed to run `ip route`: {}", e)))?;

    if !output.status.success() {
        return Err(CoreError::HostRoutes(format!(
            "`ip route` exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let routes = parse_routes(&String::from_utf8_lossy(&output.stdout));
    tracing::debug!(count = routes.len(), "Finished scanning host routes");
    Ok(routes)
}

// ============================================================================
// Tests
// ============================================================================
