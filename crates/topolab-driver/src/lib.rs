//! # topolab-driver
//!
//! Backend boundary for topolab environments.
//!
//! This crate defines the topology records a backend receives (networks,
//! nodes, disks, optical images) and the [`Driver`] trait a hypervisor
//! integration implements. The orchestration layer in `topolab-core` only
//! ever talks to a backend through this trait.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use topolab_driver::{Disk, Driver, DriverHandle, Network, Node, SimulatedDriver};
//!
//! # async fn example() -> topolab_driver::Result<()> {
//! let driver: Arc<dyn Driver> = Arc::new(SimulatedDriver::new());
//!
//! let mut network = Network::new("net0");
//! driver.create_network(&network).await?;
//! network.attach_driver(DriverHandle::new(driver.clone()));
//! network.start().await?;
//!
//! let node = Node::new("web").with_disk(Disk::existing("/srv/base.qcow2", "qcow2"));
//! driver.create_node(&node).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Driver Contract**: Five mandatory operations plus optional start/stop hooks
//! - **Transient Handles**: Driver references never reach serialized state
//! - **Simulated Backend**: Recording in-memory driver with failure injection

mod driver;
mod error;
mod simulated;
mod topology;

pub use driver::Driver;
pub use error::{DriverError, Result};
pub use simulated::{DriverCall, Operation, SimulatedDriver};
pub use topology::{Cdrom, Disk, DriverHandle, Network, Node};
