//! # topolab-core
//!
//! Lifecycle controller for topolab virtual test environments.
//!
//! This crate creates, persists, loads and tears down environments made of
//! networks and nodes, driving a pluggable backend through the
//! [`topolab_driver::Driver`] trait.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      topolab-core                        │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │   Controller    │────▶│  AddressPool             │   │
//! │  │   - build()     │     │  reserved / allocated    │   │
//! │  │   - destroy()   │     └──────────────────────────┘   │
//! │  │   - save()      │     ┌──────────────────────────┐   │
//! │  │   - load()      │────▶│  ResourceCache           │   │
//! │  └─────────────────┘     │  <home>/cache/entries    │   │
//! │           │              └──────────────────────────┘   │
//! │           │              ┌──────────────────────────┐   │
//! │           ├─────────────▶│  EnvironmentStore        │   │
//! │           │              │  <home>/environments/<id>│   │
//! │           │              └──────────────────────────┘   │
//! └───────────┼──────────────────────────────────────────────┘
//!             ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │              dyn Driver (topolab-driver)                 │
//! │   create/delete network · create/delete node · disks     │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use topolab_core::{Controller, ControllerConfig, Environment};
//! use topolab_driver::{Disk, Network, Node, SimulatedDriver};
//!
//! # async fn example() -> topolab_core::Result<()> {
//! let controller = Controller::new(
//!     ControllerConfig::from_env()?,
//!     Arc::new(SimulatedDriver::new()),
//! )
//! .await?;
//!
//! let mut env = Environment::new("lab")
//!     .with_network(Network::new("net0"))
//!     .with_node(Node::new("web").with_disk(Disk::new("qcow2")));
//!
//! controller.build(&mut env).await?;
//! controller.save(&env).await?;
//!
//! // Later, possibly from another process
//! let mut env = controller.load(env.id.as_ref().unwrap().as_str()).await?;
//! controller.attach(&mut env).await;
//! let report = controller.destroy(&mut env).await?;
//! assert!(report.is_clean());
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Ordered Lifecycle**: Networks then nodes, one at a time, in list order
//! - **Address Pool**: Non-overlapping IPv4 blocks that avoid host routes
//! - **Download Cache**: Remote cdrom images fetched once and reused
//! - **Persistence**: Built environments saved and reloaded as JSON

mod cache;
mod config;
mod controller;
mod environment;
mod error;
mod pool;
mod store;

pub use cache::{Fetcher, ResourceCache, UrlFetcher, INDEX_FILE};
pub use config::{
    ControllerConfig, ControllerConfigBuilder, DEFAULT_DISK_MODE, DEFAULT_WORK_DIR_MODE,
    HOME_DIR_NAME, HOME_ENV_VAR,
};
pub use controller::{Controller, DestroyReport, TeardownWarning};
pub use environment::{Environment, EnvironmentId, IdGenerator, RandomSuffix, ID_SUFFIX_LEN};
pub use error::{CoreError, Result};
pub use pool::{
    host_routes, overlaps, parse_routes, AddressPool, IpRoute, PoolConfig, PoolStats,
    RouteSource, DEFAULT_POOL_NETWORK, DEFAULT_PREFIX_LEN,
};
pub use store::{EnvironmentStore, CONFIG_FILE};
