//! In-memory driver for tests and dry runs.

use crate::driver::Driver;
use crate::error::{DriverError, Result};
use crate::topology::{Disk, Network, Node};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// A driver operation, used to target failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    CreateNetwork,
    DeleteNetwork,
    StartNetwork,
    StopNetwork,
    CreateNode,
    DeleteNode,
    StartNode,
    StopNode,
    CreateDisk,
}

/// A call observed by [`SimulatedDriver`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    CreateNetwork(String),
    DeleteNetwork(String),
    StartNetwork(String),
    StopNetwork(String),
    CreateNode(String),
    DeleteNode(String),
    StartNode(String),
    StopNode(String),
    CreateDisk(PathBuf),
}

impl DriverCall {
    /// The operation this call performed.
    pub fn operation(&self) -> Operation {
        match self {
            Self::CreateNetwork(_) => Operation::CreateNetwork,
            Self::DeleteNetwork(_) => Operation::DeleteNetwork,
            Self::StartNetwork(_) => Operation::StartNetwork,
            Self::StopNetwork(_) => Operation::StopNetwork,
            Self::CreateNode(_) => Operation::CreateNode,
            Self::DeleteNode(_) => Operation::DeleteNode,
            Self::StartNode(_) => Operation::StartNode,
            Self::StopNode(_) => Operation::StopNode,
            Self::CreateDisk(_) => Operation::CreateDisk,
        }
    }

    /// Short description of the resource the call targets.
    pub fn resource(&self) -> String {
        match self {
            Self::CreateNetwork(name)
            | Self::DeleteNetwork(name)
            | Self::StartNetwork(name)
            | Self::StopNetwork(name) => format!("network {}", name),
            Self::CreateNode(name)
            | Self::DeleteNode(name)
            | Self::StartNode(name)
            | Self::StopNode(name) => format!("node {}", name),
            Self::CreateDisk(path) => format!("disk {}", path.display()),
        }
    }

    /// The error a backend would report if this call failed.
    fn failure(&self) -> DriverError {
        const REASON: &str = "injected failure";
        let resource = self.resource();
        match self.operation() {
            Operation::CreateNetwork | Operation::CreateNode | Operation::CreateDisk => {
                DriverError::create(resource, REASON)
            }
            Operation::DeleteNetwork | Operation::DeleteNode => {
                DriverError::delete(resource, REASON)
            }
            Operation::StartNetwork | Operation::StartNode => DriverError::Start(resource),
            Operation::StopNetwork | Operation::StopNode => DriverError::Stop(resource),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    calls: Vec<DriverCall>,
    networks: BTreeSet<String>,
    nodes: BTreeSet<String>,
    failures: HashSet<Operation>,
}

/// Simulated backend that keeps resources in memory.
///
/// Every call is recorded in order, including calls that fail. Live
/// networks and nodes are tracked by name so that double creation and
/// deletion of unknown resources are reported the way a real hypervisor
/// would report them.
#[derive(Debug, Default)]
pub struct SimulatedDriver {
    state: Mutex<State>,
}

impl SimulatedDriver {
    /// Create an empty simulated backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call to `op` fail.
    pub fn fail_on(&self, op: Operation) {
        self.state().failures.insert(op);
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// Calls observed so far, oldest first.
    pub fn calls(&self) -> Vec<DriverCall> {
        self.state().calls.clone()
    }

    /// Names of networks currently created.
    pub fn live_networks(&self) -> Vec<String> {
        self.state().networks.iter().cloned().collect()
    }

    /// Names of nodes currently created.
    pub fn live_nodes(&self) -> Vec<String> {
        self.state().nodes.iter().cloned().collect()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `call`, then report an injected failure if one is armed.
    ///
    /// On success the state lock is handed back so the caller can update
    /// live resources under the same guard.
    fn record(&self, call: DriverCall) -> Result<MutexGuard<'_, State>> {
        let mut state = self.state();
        tracing::trace!(?call, "Simulated driver call");
        if state.failures.contains(&call.operation()) {
            let err = call.failure();
            state.calls.push(call);
            return Err(err);
        }
        state.calls.push(call);
        Ok(state)
    }

    /// Record a call that changes no live resource.
    fn observe(&self, call: DriverCall) -> Result<()> {
        self.record(call).map(drop)
    }
}

#[async_trait]
impl Driver for SimulatedDriver {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn create_network(&self, network: &Network) -> Result<()> {
        let mut state = self.record(DriverCall::CreateNetwork(network.name.clone()))?;
        if !state.networks.insert(network.name.clone()) {
            return Err(DriverError::create(
                format!("network {}", network.name),
                "already exists",
            ));
        }
        Ok(())
    }

    async fn delete_network(&self, network: &Network) -> Result<()> {
        let mut state = self.record(DriverCall::DeleteNetwork(network.name.clone()))?;
        if !state.networks.remove(&network.name) {
            return Err(DriverError::NotFound(format!("network {}", network.name)));
        }
        Ok(())
    }

    async fn create_node(&self, node: &Node) -> Result<()> {
        let mut state = self.record(DriverCall::CreateNode(node.name.clone()))?;
        if !state.nodes.insert(node.name.clone()) {
            return Err(DriverError::create(
                format!("node {}", node.name),
                "already exists",
            ));
        }
        Ok(())
    }

    async fn delete_node(&self, node: &Node) -> Result<()> {
        let mut state = self.record(DriverCall::DeleteNode(node.name.clone()))?;
        if !state.nodes.remove(&node.name) {
            return Err(DriverError::NotFound(format!("node {}", node.name)));
        }
        Ok(())
    }

    async fn create_disk(&self, disk: &Disk) -> Result<()> {
        let path = disk
            .path
            .clone()
            .ok_or_else(|| DriverError::Config("disk has no path".into()))?;
        self.observe(DriverCall::CreateDisk(path))
    }

    async fn start_network(&self, network: &Network) -> Result<()> {
        let state = self.record(DriverCall::StartNetwork(network.name.clone()))?;
        if !state.networks.contains(&network.name) {
            return Err(DriverError::Start(format!("network {}", network.name)));
        }
        Ok(())
    }

    async fn stop_network(&self, network: &Network) -> Result<()> {
        self.observe(DriverCall::StopNetwork(network.name.clone()))
    }

    async fn start_node(&self, node: &Node) -> Result<()> {
        let state = self.record(DriverCall::StartNode(node.name.clone()))?;
        if !state.nodes.contains(&node.name) {
            return Err(DriverError::Start(format!("node {}", node.name)));
        }
        Ok(())
    }

    async fn stop_node(&self, node: &Node) -> Result<()> {
        self.observe(DriverCall::StopNode(node.name.clone()))
    }
}
