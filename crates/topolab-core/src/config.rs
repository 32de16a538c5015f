//! Controller configuration.
//!
//! The controller never reads process-wide state on its own: everything it
//! needs is carried by a [`ControllerConfig`]. [`ControllerConfig::from_env`]
//! is a convenience for binaries that want the conventional environment
//! variables.

use crate::error::{CoreError, Result};
use crate::pool::PoolConfig;
use ipnet::Ipv4Net;
use std::path::{Path, PathBuf};

/// Environment variable overriding the home directory.
pub const HOME_ENV_VAR: &str = "TOPOLAB_HOME";

/// Directory created under the user's home when no override is set.
pub const HOME_DIR_NAME: &str = ".topolab";

/// Mode of environment work directories.
///
/// This is the historical world-writable default. Callers that do not need
/// other users' backends to reach the directory should tighten it.
pub const DEFAULT_WORK_DIR_MODE: u32 = 0o777;

/// Mode of materialized disk files.
pub const DEFAULT_DISK_MODE: u32 = 0o664;

/// Configuration for [`Controller`](crate::Controller).
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Root for saved environments and the download cache.
    pub home_dir: PathBuf,
    /// Address pool settings.
    pub pool: PoolConfig,
    /// Reserve every route found in `ip route` at startup (default: true).
    pub reserve_host_routes: bool,
    /// Permission bits for new work directories (default: 0o777).
    pub work_dir_mode: u32,
    /// Permission bits for new disk files (default: 0o664).
    pub disk_mode: u32,
}

impl ControllerConfig {
    /// Create a configuration rooted at `home_dir` with default settings.
    pub fn new(home_dir: impl Into<PathBuf>) -> Self {
        Self {
            home_dir: home_dir.into(),
            pool: PoolConfig::default(),
            reserve_host_routes: true,
            work_dir_mode: DEFAULT_WORK_DIR_MODE,
            disk_mode: DEFAULT_DISK_MODE,
        }
    }

    /// Create a new config builder.
    pub fn builder(home_dir: impl Into<PathBuf>) -> ControllerConfigBuilder {
        ControllerConfigBuilder {
            config: Self::new(home_dir),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `TOPOLAB_HOME` | `$HOME/.topolab` |
    /// | `TOPOLAB_POOL_NETWORKS` | `10.0.0.0/16` (comma separated) |
    /// | `TOPOLAB_POOL_PREFIX` | `24` |
    /// | `TOPOLAB_RESERVE_HOST_ROUTES` | `true` |
    pub fn from_env() -> Result<Self> {
        let home_dir = resolve_home(
            std::env::var(HOME_ENV_VAR).ok(),
            std::env::var("HOME").ok(),
        )?;
        let mut config = Self::new(home_dir);

        if let Ok(networks) = std::env::var("TOPOLAB_POOL_NETWORKS") {
            config.pool.networks = parse_networks(&networks)?;
        }
        config.pool.prefix_len = std::env::var("TOPOLAB_POOL_PREFIX")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(config.pool.prefix_len);
        config.reserve_host_routes = std::env::var("TOPOLAB_RESERVE_HOST_ROUTES")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(config.reserve_host_routes);

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.home_dir.as_os_str().is_empty() {
            return Err(CoreError::Config("home_dir is required".into()));
        }
        if !self.home_dir.is_absolute() {
            return Err(CoreError::Config(format!(
                "home_dir must be absolute: {}",
                self.home_dir.display()
            )));
        }
        if self.work_dir_mode > 0o7777 || self.disk_mode > 0o7777 {
            return Err(CoreError::Config("file modes must fit in 0o7777".into()));
        }
        self.pool.validate()
    }

    /// Directory holding one subdirectory per saved environment.
    pub fn environments_dir(&self) -> PathBuf {
        self.home_dir.join("environments")
    }

    /// Directory holding downloaded resources and their index.
    pub fn cache_dir(&self) -> PathBuf {
        self.home_dir.join("cache")
    }
}

/// Builder for ControllerConfig.
#[derive(Debug)]
pub struct ControllerConfigBuilder {
    config: ControllerConfig,
}

impl ControllerConfigBuilder {
    /// Set the address spaces to allocate from.
    pub fn pool_networks(mut self, networks: impl IntoIterator<Item = Ipv4Net>) -> Self {
        self.config.pool.networks = networks.into_iter().collect();
        self
    }

    /// Set the prefix length of allocated blocks.
    pub fn prefix_len(mut self, prefix_len: u8) -> Self {
        self.config.pool.prefix_len = prefix_len;
        self
    }

    /// Reserve an extra block.
    pub fn reserve(mut self, block: Ipv4Net) -> Self {
        self.config.pool.reserved.push(block);
        self
    }

    /// Enable or disable reservation of host routes.
    pub fn reserve_host_routes(mut self, enabled: bool) -> Self {
        self.config.reserve_host_routes = enabled;
        self
    }

    /// Set work directory permission bits.
    pub fn work_dir_mode(mut self, mode: u32) -> Self {
        self.config.work_dir_mode = mode;
        self
    }

    /// Set disk file permission bits.
    pub fn disk_mode(mut self, mode: u32) -> Self {
        self.config.disk_mode = mode;
        self
    }

    /// Build the configuration, validating all fields.
    pub fn build(self) -> Result<ControllerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Pick the home directory from an explicit override or the user's home.
fn resolve_home(override_dir: Option<String>, user_home: Option<String>) -> Result<PathBuf> {
    if let Some(dir) = override_dir.filter(|d| !d.is_empty()) {
        return Ok(PathBuf::from(dir));
    }
    user_home
        .filter(|h| !h.is_empty())
        .map(|h| Path::new(&h).join(HOME_DIR_NAME))
        .ok_or_else(|| {
            CoreError::Config(format!("neither {} nor HOME is set", HOME_ENV_VAR))
        })
}

fn parse_networks(value: &str) -> Result<Vec<Ipv4Net>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<Ipv4Net>()
                .map_err(|e| CoreError::Config(format!("invalid pool network {:?}: {}", s, e)))
        })
        .collect()
}
