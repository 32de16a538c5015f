//! The backend driver contract.

use crate::error::Result;
use crate::topology::{Disk, Network, Node};
use async_trait::async_trait;

/// Pluggable backend that realizes topology resources.
///
/// Each hypervisor integration implements this trait. The controller holds
/// a driver behind an `Arc` and calls it one resource at a time, in the
/// order resources appear in an environment.
///
/// Only creation and deletion are mandatory. The start/stop hooks default
/// to no-ops for backends where a created resource is already running.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Short name used in log output.
    fn name(&self) -> &str {
        "driver"
    }

    /// Create the backend resource for a network.
    async fn create_network(&self, network: &Network) -> Result<()>;

    /// Delete the backend resource for a network.
    async fn delete_network(&self, network: &Network) -> Result<()>;

    /// Create the backend resource for a node.
    ///
    /// Disks are materialized and passed to [`create_disk`](Self::create_disk)
    /// before this is called.
    async fn create_node(&self, node: &Node) -> Result<()>;

    /// Delete the backend resource for a node.
    async fn delete_node(&self, node: &Node) -> Result<()>;

    /// Initialize a disk image at `disk.path`.
    async fn create_disk(&self, disk: &Disk) -> Result<()>;

    /// Bring a created network up.
    async fn start_network(&self, _network: &Network) -> Result<()> {
        Ok(())
    }

    /// Take a network down.
    async fn stop_network(&self, _network: &Network) -> Result<()> {
        Ok(())
    }

    /// Boot a created node.
    async fn start_node(&self, _node: &Node) -> Result<()> {
        Ok(())
    }

    /// Shut a node down.
    async fn stop_node(&self, _node: &Node) -> Result<()> {
        Ok(())
    }
}
