//! Environment controller for lifecycle management of test environments.

use crate::cache::{Fetcher, ResourceCache};
use crate::config::ControllerConfig;
use crate::environment::{Environment, EnvironmentId, IdGenerator, RandomSuffix};
use crate::error::{CoreError, Result};
use crate::pool::{AddressPool, IpRoute, PoolStats, RouteSource};
use crate::store::EnvironmentStore;
use std::fs::Permissions;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use topolab_driver::{Driver, DriverHandle, Node};

/// Mode of the environments root when the controller creates it.
const ENVIRONMENTS_DIR_MODE: u32 = 0o755;

/// A non-fatal problem met while tearing an environment down.
#[derive(Debug)]
pub struct TeardownWarning {
    /// Network whose teardown produced the warning.
    pub network: String,
    /// What went wrong.
    pub error: CoreError,
}

/// Outcome of [`Controller::destroy`].
#[derive(Debug, Default)]
pub struct DestroyReport {
    /// Problems that did not stop teardown.
    pub warnings: Vec<TeardownWarning>,
}

impl DestroyReport {
    /// Whether teardown finished without warnings.
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Builds, tears down, saves and loads environments.
///
/// The controller owns the address pool and the download cache and drives
/// a single backend. Networks and nodes are processed one at a time in
/// list order; the first failure aborts the operation and leaves whatever
/// was already created in place.
///
/// # Thread Safety
///
/// Pool and cache state sit behind async mutexes, so a controller can be
/// shared across tasks. Several processes sharing one home directory are
/// not coordinated.
pub struct Controller {
    config: ControllerConfig,
    driver: Arc<dyn Driver>,
    pool: Mutex<AddressPool>,
    cache: ResourceCache,
    store: EnvironmentStore,
    ids: Box<dyn IdGenerator>,
}

impl Controller {
    /// Create a controller that reads host routes with `ip route`.
    ///
    /// See [`with_routes`](Self::with_routes).
    pub async fn new(config: ControllerConfig, driver: Arc<dyn Driver>) -> Result<Self> {
        Self::with_routes(config, driver, &IpRoute).await
    }

    /// Create a controller with a custom source of host routes.
    ///
    /// This will:
    /// 1. Validate the configuration
    /// 2. Create `<home>/environments` if it does not exist
    /// 3. Reserve the configured blocks and, if enabled, every host route
    /// 4. Register the blocks of every saved environment as allocated to it
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::HostRoutes`] if host routes are enabled and
    /// cannot be read.
    pub async fn with_routes(
        config: ControllerConfig,
        driver: Arc<dyn Driver>,
        routes: &dyn RouteSource,
    ) -> Result<Self> {
        config.validate()?;
        tracing::info!(
            home = %config.home_dir.display(),
            driver = driver.name(),
            "Creating controller"
        );

        let store = EnvironmentStore::new(config.environments_dir());
        tokio::fs::DirBuilder::new()
            .recursive(true)
            .mode(ENVIRONMENTS_DIR_MODE)
            .create(store.root())
            .await?;

        let mut pool = AddressPool::new(&config.pool);
        if config.reserve_host_routes {
            for route in routes.routes().await? {
                pool.reserve(route);
            }
        }
        adopt_saved(&store, &mut pool).await?;

        Ok(Self {
            cache: ResourceCache::new(config.cache_dir()),
            store,
            pool: Mutex::new(pool),
            driver,
            ids: Box::new(RandomSuffix),
            config,
        })
    }

    /// Replace the source of environment id suffixes.
    pub fn with_id_generator(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.ids = Box::new(ids);
        self
    }

    /// Replace the download backend of the resource cache.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.cache = ResourceCache::with_fetcher(self.config.cache_dir(), fetcher);
        self
    }

    /// Get the controller configuration.
    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Root directory for environments and cache.
    pub fn home_dir(&self) -> &Path {
        &self.config.home_dir
    }

    /// The download cache.
    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    /// Current address pool occupancy.
    pub async fn pool_stats(&self) -> PoolStats {
        self.pool.lock().await.stats()
    }

    /// Realize every network and node of `env` on the backend.
    ///
    /// This will:
    /// 1. Assign an id if the environment has none
    /// 2. Create the work directory
    /// 3. Replace remote cdrom images with cached local copies
    /// 4. Allocate a block, create and start each network
    /// 5. Create missing disk files, the disks, then each node
    ///
    /// `built` is set only when every step succeeded.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidState`] if the environment is already
    /// built. Any other failure is returned as soon as it happens, without
    /// undoing earlier steps.
    pub async fn build(&self, env: &mut Environment) -> Result<()> {
        if env.built {
            return Err(CoreError::InvalidState {
                expected: "unbuilt".into(),
                actual: "built".into(),
            });
        }

        let start = Instant::now();
        tracing::info!(name = %env.name, "Building environment");

        let id = env
            .id
            .get_or_insert_with(|| EnvironmentId::generate(&env.name, self.ids.as_ref()))
            .clone();

        let work_dir = self.store.work_dir(&id);
        tracing::debug!(env_id = %id, path = %work_dir.display(), "Creating environment working directory");
        tokio::fs::DirBuilder::new()
            .mode(self.config.work_dir_mode)
            .create(&work_dir)
            .await?;
        env.work_dir = Some(work_dir.clone());

        let handle = DriverHandle::new(Arc::clone(&self.driver));
        env.attach_driver(handle.clone());

        for node in &mut env.nodes {
            let Some(cdrom) = node.cdrom.as_mut().filter(|c| c.is_remote()) else {
                continue;
            };
            tracing::debug!(env_id = %id, node = %node.name, url = %cdrom.isopath, "Caching iso file");
            let cached = self.cache.resolve(&cdrom.isopath).await?;
            cdrom.isopath = cached.to_string_lossy().into_owned();
        }

        for network in &mut env.networks {
            tracing::info!(env_id = %id, network = %network.name, "Building network");
            let block = self.pool.lock().await.get_for(id.as_str())?;
            network.ip_addresses = Some(block);
            self.driver.create_network(network).await?;
            network.attach_driver(handle.clone());
            network.start().await?;
            tracing::debug!(env_id = %id, network = %network.name, block = %block, "Network started");
        }

        for node in &mut env.nodes {
            tracing::info!(env_id = %id, node = %node.name, "Building node");
            self.build_node(&work_dir, node).await?;
            node.attach_driver(handle.clone());
        }

        env.built = true;
        tracing::info!(
            env_id = %id,
            networks = env.networks.len(),
            nodes = env.nodes.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Finished building environment"
        );
        Ok(())
    }

    /// Tear down every node and network of `env` and remove its files.
    ///
    /// Nodes go first, then networks, each in list order. Each network's
    /// block is returned to the pool on behalf of the environment. A block
    /// the environment does not hold is left allocated; that, like any
    /// other failed return, is logged and reported in the
    /// [`DestroyReport`] instead of aborting teardown.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidState`] if no driver is attached (see
    /// [`attach`](Self::attach)). Driver and filesystem failures stop
    /// teardown where they happen.
    pub async fn destroy(&self, env: &mut Environment) -> Result<DestroyReport> {
        if !env.is_attached() {
            return Err(CoreError::InvalidState {
                expected: "attached".into(),
                actual: "detached".into(),
            });
        }

        let start = Instant::now();
        let label = env.label().to_string();
        tracing::info!(env_id = %label, "Destroying environment");
        let mut report = DestroyReport::default();

        for node in &mut env.nodes {
            tracing::info!(env_id = %label, node = %node.name, "Destroying node");
            node.stop().await?;
            self.driver.delete_node(node).await?;
            node.detach_driver();
        }

        for network in &mut env.networks {
            tracing::info!(env_id = %label, network = %network.name, "Destroying network");
            network.stop().await?;
            self.driver.delete_network(network).await?;
            network.detach_driver();

            let returned = match network.ip_addresses.take() {
                Some(block) => self.pool.lock().await.release(block, &label),
                None => Err(CoreError::InvalidState {
                    expected: "address block assigned".into(),
                    actual: format!("network {} holds none", network.name),
                }),
            };
            if let Err(error) = returned {
                tracing::warn!(
                    env_id = %label,
                    network = %network.name,
                    error = %error,
                    "Failed to return address block to pool"
                );
                report.warnings.push(TeardownWarning {
                    network: network.name.clone(),
                    error,
                });
            }
        }

        env.detach_driver();

        if let Some(work_dir) = &env.work_dir {
            tracing::info!(env_id = %label, path = %work_dir.display(), "Removing environment files");
            tokio::fs::remove_dir_all(work_dir).await?;
        }
        env.work_dir = None;
        env.built = false;

        tracing::info!(
            env_id = %label,
            warnings = report.warnings.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Finished destroying environment"
        );
        Ok(report)
    }

    /// Attach this controller's driver to `env` and all its resources.
    ///
    /// Loaded environments come back detached; attach them before
    /// destroying. Address blocks held by the environment's networks are
    /// registered as allocated to it so they are not handed out again.
    ///
    /// A block that overlaps one held by another environment is not
    /// taken over: it is logged here, and [`destroy`](Self::destroy)
    /// reports it instead of freeing it.
    pub async fn attach(&self, env: &mut Environment) {
        env.attach_all(DriverHandle::new(Arc::clone(&self.driver)));

        let mut pool = self.pool.lock().await;
        adopt_blocks(&mut pool, env);
    }

    /// Persist `env` into its work directory.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::PreconditionFailed`] if the environment has not
    /// been built.
    pub async fn save(&self, env: &Environment) -> Result<()> {
        self.store.save(env).await?;
        tracing::info!(env_id = %env.label(), "Environment saved");
        Ok(())
    }

    /// Load the environment saved under `id`. It comes back detached.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] if nothing was saved under `id`.
    pub async fn load(&self, id: &str) -> Result<Environment> {
        self.store.load(id).await
    }

    /// Ids of all saved environments, sorted.
    pub async fn saved_environments(&self) -> Result<Vec<String>> {
        self.store.list().await
    }

    async fn build_node(&self, work_dir: &Path, node: &mut Node) -> Result<()> {
        for disk in node.disks.iter_mut().filter(|d| d.path.is_none()) {
            tracing::debug!(node = %node.name, format = %disk.format, "Creating disk file");
            let path = create_disk_file(work_dir, &disk.format, self.config.disk_mode).await?;
            disk.path = Some(path);
            self.driver.create_disk(disk).await?;
        }

        tracing::debug!(node = %node.name, "Creating node");
        self.driver.create_node(node).await?;
        Ok(())
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("config", &self.config)
            .field("driver", &self.driver.name())
            .field("cache", &self.cache)
            .finish_non_exhaustive()
    }
}

/// Register the blocks of every environment saved under `store`.
///
/// Unreadable environments are skipped with a warning.
async fn adopt_saved(store: &EnvironmentStore, pool: &mut AddressPool) -> Result<()> {
    for id in store.list().await? {
        match store.load(&id).await {
            Ok(env) => adopt_blocks(pool, &env),
            Err(e) => {
                tracing::warn!(env_id = %id, error = %e, "Skipping unreadable saved environment");
            }
        }
    }
    Ok(())
}

fn adopt_blocks(pool: &mut AddressPool, env: &Environment) {
    for network in &env.networks {
        let Some(block) = network.ip_addresses else {
            continue;
        };
        if !pool.adopt(block, env.label()) {
            tracing::warn!(
                env_id = %env.label(),
                network = %network.name,
                block = %block,
                holder = pool.owner(&block).unwrap_or_default(),
                "Address block overlaps one held by another environment"
            );
        }
    }
}

/// Create an empty `disk*.<format>` file with a unique name in `dir`.
async fn create_disk_file(dir: &Path, format: &str, mode: u32) -> Result<PathBuf> {
    let dir = dir.to_path_buf();
    let suffix = format!(".{}", format);
    let path = tokio::task::spawn_blocking(move || -> std::io::Result<PathBuf> {
        let file = tempfile::Builder::new()
            .prefix("disk")
            .suffix(&suffix)
            .tempfile_in(&dir)?;
        let (_, path) = file.keep().map_err(|e| e.error)?;
        std::fs::set_permissions(&path, Permissions::from_mode(mode))?;
        Ok(path)
    })
    .await
    .map_err(std::io::Error::other)??;
    Ok(path)
}
