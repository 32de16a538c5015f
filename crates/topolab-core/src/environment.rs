//! Environment type - a named collection of networks and nodes.

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use topolab_driver::{DriverHandle, Network, Node};

/// Length of the random part of a generated environment id.
pub const ID_SUFFIX_LEN: usize = 8;

/// Unique identifier for an environment.
///
/// Ids have the form `<name>-<suffix>` and double as the name of the
/// environment's work directory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvironmentId(String);

impl EnvironmentId {
    /// Generate an id for an environment called `name`.
    pub fn generate(name: &str, ids: &dyn IdGenerator) -> Self {
        Self(format!("{}-{}", name, ids.suffix()))
    }

    /// Get the inner string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EnvironmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for EnvironmentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EnvironmentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Source of environment id suffixes.
pub trait IdGenerator: Send + Sync {
    /// Produce the next suffix.
    fn suffix(&self) -> String;
}

/// Random alphanumeric suffixes of [`ID_SUFFIX_LEN`] characters.
///
/// Uniqueness is probabilistic; two environments with the same name may
/// collide, in which case creating the work directory fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomSuffix;

impl IdGenerator for RandomSuffix {
    fn suffix(&self) -> String {
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(ID_SUFFIX_LEN)
            .map(char::from)
            .collect()
    }
}

/// A test environment: networks and nodes managed as one lifecycle unit.
///
/// `networks` and `nodes` are kept in creation order; teardown walks them
/// in the same order. The driver handle is runtime-only and is never
/// serialized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    /// Assigned on first build.
    #[serde(default)]
    pub id: Option<EnvironmentId>,
    /// Human-readable name, used as the id prefix.
    pub name: String,
    /// Directory holding saved state and disk files while built.
    #[serde(default)]
    pub work_dir: Option<PathBuf>,
    /// True once every network and node has been created.
    #[serde(default)]
    pub built: bool,
    /// Networks in creation order.
    #[serde(default)]
    pub networks: Vec<Network>,
    /// Nodes in creation order.
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(skip)]
    driver: Option<DriverHandle>,
}

impl Environment {
    /// Create an empty, unbuilt environment.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            work_dir: None,
            built: false,
            networks: Vec::new(),
            nodes: Vec::new(),
            driver: None,
        }
    }

    /// Append a network.
    pub fn with_network(mut self, network: Network) -> Self {
        self.networks.push(network);
        self
    }

    /// Append a node.
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Id if assigned, otherwise the name. Used for log fields.
    pub fn label(&self) -> &str {
        self.id.as_ref().map_or(self.name.as_str(), EnvironmentId::as_str)
    }

    /// Attach a driver to the environment only.
    pub fn attach_driver(&mut self, handle: DriverHandle) {
        self.driver = Some(handle);
    }

    /// Drop the environment's own driver reference.
    pub fn detach_driver(&mut self) -> Option<DriverHandle> {
        self.driver.take()
    }

    /// Attach a driver to the environment and every network and node.
    pub fn attach_all(&mut self, handle: DriverHandle) {
        for network in &mut self.networks {
            network.attach_driver(handle.clone());
        }
        for node in &mut self.nodes {
            node.attach_driver(handle.clone());
        }
        self.driver = Some(handle);
    }

    /// Drop every driver reference held by the environment.
    pub fn detach_all(&mut self) {
        for network in &mut self.networks {
            network.detach_driver();
        }
        for node in &mut self.nodes {
            node.detach_driver();
        }
        self.driver = None;
    }

    /// Whether the environment has a driver attached.
    pub fn is_attached(&self) -> bool {
        self.driver.is_some()
    }

    /// The environment's driver, if attached.
    pub fn driver(&self) -> Option<&DriverHandle> {
        self.driver.as_ref()
    }
}
