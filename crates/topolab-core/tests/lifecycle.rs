//! End-to-end lifecycle tests for topolab-core.
//!
//! Every test runs against a fresh temporary home directory and the
//! in-memory simulated driver. Host routes are not scanned; tests that
//! need them supply a fixed routing table.

use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use topolab_core::{
    overlaps, parse_routes, Controller, ControllerConfig, CoreError, Environment, IdGenerator,
    RouteSource, CONFIG_FILE,
};
use topolab_driver::{Cdrom, Disk, DriverCall, Network, Node, Operation, SimulatedDriver};
use url::Url;

/// Deterministic suffixes: 00000001, 00000002, ...
#[derive(Default)]
struct Sequence(AtomicUsize);

impl IdGenerator for Sequence {
    fn suffix(&self) -> String {
        format!("{:08}", self.0.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// Routing table given as `ip route` output.
struct RouteTable(&'static str);

#[async_trait]
impl RouteSource for RouteTable {
    async fn routes(&self) -> topolab_core::Result<Vec<Ipv4Net>> {
        Ok(parse_routes(self.0))
    }
}

fn net(s: &str) -> Ipv4Net {
    s.parse().unwrap()
}

async fn setup(home: &Path, driver: Arc<SimulatedDriver>) -> Controller {
    let config = ControllerConfig::builder(home)
        .reserve_host_routes(false)
        .reserve(net("10.0.0.0/24"))
        .build()
        .unwrap();
    Controller::new(config, driver)
        .await
        .unwrap()
        .with_id_generator(Sequence::default())
}

fn two_disk_env(name: &str) -> Environment {
    Environment::new(name)
        .with_network(Network::new("net0"))
        .with_node(
            Node::new("node0")
                .with_disk(Disk::new("qcow2"))
                .with_disk(Disk::new("qcow2")),
        )
}

#[tokio::test]
async fn test_build_environment() {
    let home = tempfile::tempdir().unwrap();
    let driver = Arc::new(SimulatedDriver::new());
    let controller = setup(home.path(), driver.clone()).await;

    let mut env = two_disk_env("lab");
    controller.build(&mut env).await.expect("build should succeed");

    assert!(env.built);
    assert_eq!(env.id.as_ref().unwrap().as_str(), "lab-00000001");
    let work_dir = env.work_dir.clone().unwrap();
    assert_eq!(work_dir, home.path().join("environments").join("lab-00000001"));
    assert!(work_dir.is_dir());

    let disks = &env.nodes[0].disks;
    let first = disks[0].path.clone().unwrap();
    let second = disks[1].path.clone().unwrap();
    assert_ne!(first, second);
    for path in [&first, &second] {
        assert!(path.is_file());
        assert_eq!(path.parent().unwrap(), work_dir);
        let name = path.file_name().unwrap().to_string_lossy();
        assert!(name.starts_with("disk"));
        assert!(name.ends_with(".qcow2"));
    }

    let block = env.networks[0].ip_addresses.unwrap();
    assert_eq!(block, net("10.0.1.0/24"));
    assert!(!overlaps(&block, &net("10.0.0.0/24")));

    assert!(env.is_attached());
    assert!(env.networks[0].is_attached());
    assert!(env.nodes[0].is_attached());

    assert_eq!(
        driver.calls(),
        vec![
            DriverCall::CreateNetwork("net0".into()),
            DriverCall::StartNetwork("net0".into()),
            DriverCall::CreateDisk(first),
            DriverCall::CreateDisk(second),
            DriverCall::CreateNode("node0".into()),
        ]
    );
}

#[tokio::test]
async fn test_destroy_environment() {
    let home = tempfile::tempdir().unwrap();
    let driver = Arc::new(SimulatedDriver::new());
    let controller = setup(home.path(), driver.clone()).await;

    let mut env = two_disk_env("lab");
    controller.build(&mut env).await.unwrap();
    let work_dir = env.work_dir.clone().unwrap();
    let block = env.networks[0].ip_addresses.unwrap();

    let report = controller.destroy(&mut env).await.expect("destroy should succeed");

    assert!(report.is_clean());
    assert!(!work_dir.exists());
    assert!(!env.built);
    assert!(env.work_dir.is_none());
    assert!(!env.is_attached());
    assert!(!env.networks[0].is_attached());
    assert!(!env.nodes[0].is_attached());
    assert!(env.networks[0].ip_addresses.is_none());
    assert!(driver.live_networks().is_empty());
    assert!(driver.live_nodes().is_empty());

    let teardown: Vec<DriverCall> = driver.calls().into_iter().skip(5).collect();
    assert_eq!(
        teardown,
        vec![
            DriverCall::StopNode("node0".into()),
            DriverCall::DeleteNode("node0".into()),
            DriverCall::StopNetwork("net0".into()),
            DriverCall::DeleteNetwork("net0".into()),
        ]
    );

    // The returned block is handed to the next environment.
    let mut next = two_disk_env("lab");
    controller.build(&mut next).await.unwrap();
    assert_eq!(next.networks[0].ip_addresses, Some(block));
}

#[tokio::test]
async fn test_networks_get_disjoint_blocks() {
    let home = tempfile::tempdir().unwrap();
    let controller = setup(home.path(), Arc::new(SimulatedDriver::new())).await;

    let mut env = Environment::new("wide")
        .with_network(Network::new("public"))
        .with_network(Network::new("private"))
        .with_network(Network::new("storage"));
    controller.build(&mut env).await.unwrap();

    let blocks: Vec<Ipv4Net> = env
        .networks
        .iter()
        .map(|n| n.ip_addresses.unwrap())
        .collect();
    assert_eq!(
        blocks,
        vec![net("10.0.1.0/24"), net("10.0.2.0/24"), net("10.0.3.0/24")]
    );
    assert_eq!(controller.pool_stats().await.allocated, 3);
}

#[tokio::test]
async fn test_build_twice_rejected() {
    let home = tempfile::tempdir().unwrap();
    let controller = setup(home.path(), Arc::new(SimulatedDriver::new())).await;

    let mut env = two_disk_env("lab");
    controller.build(&mut env).await.unwrap();
    let result = controller.build(&mut env).await;
    assert!(matches!(result, Err(CoreError::InvalidState { .. })));
}

#[tokio::test]
async fn test_existing_id_and_disk_path_are_kept() {
    let home = tempfile::tempdir().unwrap();
    let driver = Arc::new(SimulatedDriver::new());
    let controller = setup(home.path(), driver.clone()).await;

    let base = home.path().join("base.raw");
    std::fs::write(&base, b"").unwrap();

    let mut env = Environment::new("lab").with_node(
        Node::new("db")
            .with_disk(Disk::existing(&base, "raw"))
            .with_disk(Disk::new("raw")),
    );
    env.id = Some("lab-pinned".into());
    controller.build(&mut env).await.unwrap();

    assert_eq!(env.id.as_ref().unwrap().as_str(), "lab-pinned");
    assert_eq!(env.nodes[0].disks[0].path.as_deref(), Some(base.as_path()));
    let created = env.nodes[0].disks[1].path.clone().unwrap();
    assert!(created.to_string_lossy().ends_with(".raw"));
    assert_eq!(
        driver.calls(),
        vec![
            DriverCall::CreateDisk(created),
            DriverCall::CreateNode("db".into()),
        ]
    );
}

#[tokio::test]
async fn test_remote_cdrom_is_cached() {
    let home = tempfile::tempdir().unwrap();
    let controller = setup(home.path(), Arc::new(SimulatedDriver::new())).await;

    let iso = home.path().join("installer.iso");
    std::fs::write(&iso, b"bootable").unwrap();
    let url = Url::from_file_path(&iso).unwrap().to_string();
    let local = "/srv/images/local.iso";

    let mut env = Environment::new("lab")
        .with_node(Node::new("remote").with_cdrom(Cdrom::new(url.clone())))
        .with_node(Node::new("local").with_cdrom(Cdrom::new(local)));
    controller.build(&mut env).await.unwrap();

    let cached = env.nodes[0].cdrom.as_ref().unwrap().isopath.clone();
    assert_ne!(cached, url);
    assert!(Path::new(&cached).starts_with(home.path().join("cache")));
    assert_eq!(std::fs::read(&cached).unwrap(), b"bootable");
    assert_eq!(env.nodes[1].cdrom.as_ref().unwrap().isopath, local);

    // A second environment reuses the cached copy.
    let mut other = Environment::new("lab")
        .with_node(Node::new("remote").with_cdrom(Cdrom::new(url.clone())));
    controller.build(&mut other).await.unwrap();
    assert_eq!(other.nodes[0].cdrom.as_ref().unwrap().isopath, cached);
    assert_eq!(controller.cache().entries().await.unwrap().len(), 1);
    assert!(home.path().join("cache").join("entries").is_file());
}

#[tokio::test]
async fn test_driver_failure_stops_build() {
    let home = tempfile::tempdir().unwrap();
    let driver = Arc::new(SimulatedDriver::new());
    driver.fail_on(Operation::CreateNode);
    let controller = setup(home.path(), driver.clone()).await;

    let mut env = two_disk_env("lab");
    let result = controller.build(&mut env).await;

    assert!(matches!(result, Err(CoreError::Backend(_))));
    assert!(!env.built);
    // Nothing is rolled back.
    assert!(env.work_dir.as_ref().unwrap().is_dir());
    assert_eq!(driver.live_networks(), vec!["net0".to_string()]);
    assert_eq!(controller.pool_stats().await.allocated, 1);
    assert!(controller.save(&env).await.is_err());
}

#[tokio::test]
async fn test_save_and_load_round_trip() {
    let home = tempfile::tempdir().unwrap();
    let controller = setup(home.path(), Arc::new(SimulatedDriver::new())).await;

    let mut env = two_disk_env("lab");
    controller.build(&mut env).await.unwrap();
    controller.save(&env).await.unwrap();

    let id = env.id.as_ref().unwrap().as_str().to_string();
    assert!(env.work_dir.as_ref().unwrap().join(CONFIG_FILE).is_file());

    let loaded = controller.load(&id).await.unwrap();
    assert_eq!(
        serde_json::to_value(&loaded).unwrap(),
        serde_json::to_value(&env).unwrap()
    );
    assert!(loaded.built);
    assert_eq!(loaded.networks[0].ip_addresses, env.networks[0].ip_addresses);
    assert_eq!(loaded.nodes[0].disks, env.nodes[0].disks);
    assert!(!loaded.is_attached());
    assert!(!loaded.networks[0].is_attached());
    assert!(!loaded.nodes[0].is_attached());
}

#[tokio::test]
async fn test_save_unbuilt_writes_nothing() {
    let home = tempfile::tempdir().unwrap();
    let controller = setup(home.path(), Arc::new(SimulatedDriver::new())).await;

    let env = two_disk_env("lab");
    let result = controller.save(&env).await;

    assert!(matches!(result, Err(CoreError::PreconditionFailed(_))));
    let entries = std::fs::read_dir(home.path().join("environments")).unwrap();
    assert_eq!(entries.count(), 0);
}

#[tokio::test]
async fn test_load_unknown_environment() {
    let home = tempfile::tempdir().unwrap();
    let controller = setup(home.path(), Arc::new(SimulatedDriver::new())).await;

    let result = controller.load("lab-missing").await;
    assert!(matches!(result, Err(ref e) if e.is_not_found()));
}

#[tokio::test]
async fn test_saved_environments() {
    let home = tempfile::tempdir().unwrap();
    let controller = setup(home.path(), Arc::new(SimulatedDriver::new())).await;

    let mut a = Environment::new("a");
    let mut b = Environment::new("b");
    let mut c = Environment::new("c");
    for env in [&mut a, &mut b, &mut c] {
        controller.build(env).await.unwrap();
    }
    controller.save(&a).await.unwrap();
    controller.save(&c).await.unwrap();

    assert_eq!(
        controller.saved_environments().await.unwrap(),
        vec!["a-00000001", "c-00000003"]
    );

    controller.destroy(&mut a).await.unwrap();
    assert_eq!(
        controller.saved_environments().await.unwrap(),
        vec!["c-00000003"]
    );
}

#[tokio::test]
async fn test_destroy_loaded_environment_after_restart() {
    let home = tempfile::tempdir().unwrap();
    let driver = Arc::new(SimulatedDriver::new());

    let id = {
        let controller = setup(home.path(), driver.clone()).await;
        let mut env = two_disk_env("lab");
        controller.build(&mut env).await.unwrap();
        controller.save(&env).await.unwrap();
        env.id.unwrap().to_string()
    };

    let controller = setup(home.path(), driver.clone()).await;
    let mut env = controller.load(&id).await.unwrap();

    let result = controller.destroy(&mut env).await;
    assert!(matches!(result, Err(CoreError::InvalidState { .. })));

    controller.attach(&mut env).await;
    assert_eq!(controller.pool_stats().await.allocated, 1);

    let report = controller.destroy(&mut env).await.unwrap();
    assert!(report.is_clean());
    assert_eq!(controller.pool_stats().await.allocated, 0);
    assert!(driver.live_nodes().is_empty());
    assert!(controller.saved_environments().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_address_return_is_reported() {
    let home = tempfile::tempdir().unwrap();
    let controller = setup(home.path(), Arc::new(SimulatedDriver::new())).await;

    let mut env = two_disk_env("lab").with_network(Network::new("net1"));
    controller.build(&mut env).await.unwrap();
    let work_dir = env.work_dir.clone().unwrap();

    // net0 claims a block the pool never issued; net1 lost its block.
    env.networks[0].ip_addresses = Some(net("10.0.200.0/24"));
    env.networks[1].ip_addresses = None;

    let report = controller.destroy(&mut env).await.unwrap();

    assert!(!report.is_clean());
    assert_eq!(report.warnings.len(), 2);
    assert_eq!(report.warnings[0].network, "net0");
    assert!(matches!(
        report.warnings[0].error,
        CoreError::NotAllocated(b) if b == net("10.0.200.0/24")
    ));
    assert_eq!(report.warnings[1].network, "net1");
    assert!(matches!(report.warnings[1].error, CoreError::InvalidState { .. }));
    // Teardown still ran to completion.
    assert!(!work_dir.exists());
}

#[tokio::test]
async fn test_restart_keeps_saved_blocks_allocated() {
    let home = tempfile::tempdir().unwrap();
    let driver = Arc::new(SimulatedDriver::new());

    let (a_id, a_block) = {
        let controller = setup(home.path(), driver.clone()).await;
        let mut a = two_disk_env("a");
        controller.build(&mut a).await.unwrap();
        controller.save(&a).await.unwrap();
        (a.id.unwrap().to_string(), a.networks[0].ip_addresses.unwrap())
    };

    let controller = setup(home.path(), driver.clone()).await;
    assert_eq!(controller.pool_stats().await.allocated, 1);

    let mut b = Environment::new("b").with_network(Network::new("net1"));
    controller.build(&mut b).await.unwrap();
    let b_block = b.networks[0].ip_addresses.unwrap();
    assert!(!overlaps(&a_block, &b_block));

    let mut a = controller.load(&a_id).await.unwrap();
    controller.attach(&mut a).await;
    let report = controller.destroy(&mut a).await.unwrap();
    assert!(report.is_clean());

    let mut d = Environment::new("d").with_network(Network::new("net2"));
    controller.build(&mut d).await.unwrap();
    assert_ne!(d.networks[0].ip_addresses, Some(b_block));
    assert_eq!(d.networks[0].ip_addresses, Some(a_block));
}

#[tokio::test]
async fn test_stale_copy_cannot_free_another_environments_block() {
    let home = tempfile::tempdir().unwrap();
    let controller = setup(home.path(), Arc::new(SimulatedDriver::new())).await;

    let mut a = two_disk_env("a");
    controller.build(&mut a).await.unwrap();
    controller.save(&a).await.unwrap();
    let mut b = Environment::new("b").with_network(Network::new("net1"));
    controller.build(&mut b).await.unwrap();
    let b_block = b.networks[0].ip_addresses.unwrap();

    // A saved copy of `a` that claims the block `b` holds.
    let mut stale = controller.load(a.id.as_ref().unwrap().as_str()).await.unwrap();
    stale.networks[0].ip_addresses = Some(b_block);
    controller.attach(&mut stale).await;

    let report = controller.destroy(&mut stale).await.unwrap();
    assert_eq!(report.warnings.len(), 1);
    assert!(matches!(
        report.warnings[0].error,
        CoreError::NotOwned { block, .. } if block == b_block
    ));

    let mut d = Environment::new("d").with_network(Network::new("net2"));
    controller.build(&mut d).await.unwrap();
    assert_ne!(d.networks[0].ip_addresses, Some(b_block));

    // The rightful holder still returns it cleanly.
    assert!(controller.destroy(&mut b).await.unwrap().is_clean());
}

#[tokio::test]
async fn test_build_skips_host_routes() {
    let home = tempfile::tempdir().unwrap();
    let routes = RouteTable(
        "default via 192.168.1.1 dev eth0 proto dhcp\n\
         10.0.0.0/23 dev br0 proto kernel scope link src 10.0.0.1\n\
         blackhole 10.0.2.0/24 proto static\n",
    );
    let controller = Controller::with_routes(
        ControllerConfig::new(home.path()),
        Arc::new(SimulatedDriver::new()),
        &routes,
    )
    .await
    .unwrap();
    assert_eq!(controller.pool_stats().await.reserved, 2);

    let mut env = Environment::new("lab").with_network(Network::new("net0"));
    controller.build(&mut env).await.unwrap();
    assert_eq!(env.networks[0].ip_addresses, Some(net("10.0.3.0/24")));
}
