//! Topology records handed to drivers.
//!
//! Each record carries its persisted fields plus an optional
//! [`DriverHandle`]. The handle exists only while the resource is live on a
//! backend; it is skipped by serde, so a loaded record is always detached
//! until someone attaches a driver again.

use crate::driver::Driver;
use crate::error::{DriverError, Result};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Runtime reference to the backend a resource lives on.
#[derive(Clone)]
pub struct DriverHandle(Arc<dyn Driver>);

impl DriverHandle {
    /// Wrap a shared driver.
    pub fn new(driver: Arc<dyn Driver>) -> Self {
        Self(driver)
    }

    /// Borrow the underlying driver.
    pub fn driver(&self) -> &dyn Driver {
        self.0.as_ref()
    }

    /// Whether both handles point at the same driver instance.
    pub fn same_as(&self, other: &DriverHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl From<Arc<dyn Driver>> for DriverHandle {
    fn from(driver: Arc<dyn Driver>) -> Self {
        Self(driver)
    }
}

impl fmt::Debug for DriverHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DriverHandle").field(&self.0.name()).finish()
    }
}

/// A virtual network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Network {
    /// Network name, unique within an environment.
    pub name: String,
    /// Address block assigned while the network is live.
    #[serde(default)]
    pub ip_addresses: Option<Ipv4Net>,
    #[serde(skip)]
    driver: Option<DriverHandle>,
}

impl Network {
    /// Create a network record with no address block.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ip_addresses: None,
            driver: None,
        }
    }

    /// Attach the backend this network lives on.
    pub fn attach_driver(&mut self, handle: DriverHandle) {
        self.driver = Some(handle);
    }

    /// Drop the backend reference, returning it if one was attached.
    pub fn detach_driver(&mut self) -> Option<DriverHandle> {
        self.driver.take()
    }

    /// Whether a backend is attached.
    pub fn is_attached(&self) -> bool {
        self.driver.is_some()
    }

    /// The attached backend.
    pub fn driver(&self) -> Result<&DriverHandle> {
        self.driver
            .as_ref()
            .ok_or_else(|| DriverError::Detached(format!("network {}", self.name)))
    }

    /// Bring the network up through its attached driver.
    pub async fn start(&self) -> Result<()> {
        self.driver()?.driver().start_network(self).await
    }

    /// Take the network down through its attached driver.
    pub async fn stop(&self) -> Result<()> {
        self.driver()?.driver().stop_network(self).await
    }
}

/// A virtual machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Node name, unique within an environment.
    pub name: String,
    /// Disks in attachment order.
    #[serde(default)]
    pub disks: Vec<Disk>,
    /// Optional optical image.
    #[serde(default)]
    pub cdrom: Option<Cdrom>,
    #[serde(skip)]
    driver: Option<DriverHandle>,
}

impl Node {
    /// Create a node with no disks and no cdrom.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            disks: Vec::new(),
            cdrom: None,
            driver: None,
        }
    }

    /// Append a disk.
    pub fn with_disk(mut self, disk: Disk) -> Self {
        self.disks.push(disk);
        self
    }

    /// Set the optical image.
    pub fn with_cdrom(mut self, cdrom: Cdrom) -> Self {
        self.cdrom = Some(cdrom);
        self
    }

    /// Attach the backend this node lives on.
    pub fn attach_driver(&mut self, handle: DriverHandle) {
        self.driver = Some(handle);
    }

    /// Drop the backend reference, returning it if one was attached.
    pub fn detach_driver(&mut self) -> Option<DriverHandle> {
        self.driver.take()
    }

    /// Whether a backend is attached.
    pub fn is_attached(&self) -> bool {
        self.driver.is_some()
    }

    /// The attached backend.
    pub fn driver(&self) -> Result<&DriverHandle> {
        self.driver
            .as_ref()
            .ok_or_else(|| DriverError::Detached(format!("node {}", self.name)))
    }

    /// Boot the node through its attached driver.
    pub async fn start(&self) -> Result<()> {
        self.driver()?.driver().start_node(self).await
    }

    /// Shut the node down through its attached driver.
    pub async fn stop(&self) -> Result<()> {
        self.driver()?.driver().stop_node(self).await
    }
}

/// A disk image attached to a node.
///
/// A disk without a `path` is materialized when its node is built. A disk
/// that already has a path refers to an externally provided image and is
/// never re-created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    /// Image location on the host, once known.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Image format, also used as the file extension (e.g. `qcow2`).
    pub format: String,
}

impl Disk {
    /// A disk to be created at build time.
    pub fn new(format: impl Into<String>) -> Self {
        Self {
            path: None,
            format: format.into(),
        }
    }

    /// A disk backed by an existing image.
    pub fn existing(path: impl Into<PathBuf>, format: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            format: format.into(),
        }
    }
}

/// An optical image attached to a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cdrom {
    /// Local path or remote URL of the image.
    pub isopath: String,
}

impl Cdrom {
    /// Create a cdrom referencing `isopath`.
    pub fn new(isopath: impl Into<String>) -> Self {
        Self {
            isopath: isopath.into(),
        }
    }

    /// Whether the image lives behind a URL scheme rather than on disk.
    pub fn is_remote(&self) -> bool {
        self.isopath.contains("://")
    }
}
