//! Runtime configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use skiff_common::{SkiffError, SkiffPaths, SkiffResult};
use skiff_network::Subnet;

use crate::namespace::NamespaceConfig;

/// Default bridge device.
pub const DEFAULT_BRIDGE: &str = "skiff0";
/// Default grace period between SIGTERM and SIGKILL.
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 10;

/// Runtime configuration options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// cgroup v2 hierarchy root.
    pub cgroup_root: PathBuf,
    /// Host bridge containers attach to.
    pub bridge: String,
    /// Subnet addresses are drawn from; the gateway is its first host.
    pub subnet: Subnet,
    /// Default stop timeout (seconds).
    pub stop_timeout_secs: u64,
    /// Namespaces each container gets.
    pub namespaces: NamespaceConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cgroup_root: SkiffPaths::new().cgroup_root,
            bridge: DEFAULT_BRIDGE.to_string(),
            subnet: Subnet::default(),
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
            namespaces: NamespaceConfig::all(),
        }
    }
}

impl RuntimeConfig {
    /// Read a TOML configuration file. Missing keys take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Config`] if the file cannot be read, parsed or
    /// validated.
    pub fn load(path: &Path) -> SkiffResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| SkiffError::Config {
            message: format!("{}: {e}", path.display()),
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| SkiffError::Config {
            message: format!("{}: {e}", path.display()),
        })?;
        config.validate()?;

        tracing::debug!(path = %path.display(), "Loaded runtime configuration");
        Ok(config)
    }

    /// Load `path` if given, else the per-user file if it exists, else the
    /// defaults.
    ///
    /// # Errors
    ///
    /// See [`RuntimeConfig::load`].
    pub fn discover(path: Option<&Path>) -> SkiffResult<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        match SkiffPaths::user_config_file() {
            Some(file) if file.is_file() => Self::load(&file),
            _ => Ok(Self::default()),
        }
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Config`] on an empty bridge name or a namespace
    /// set without the mount or PID namespace.
    pub fn validate(&self) -> SkiffResult<()> {
        if self.bridge.is_empty() || self.bridge.len() > skiff_network::veth::MAX_IFNAME_LEN {
            return Err(SkiffError::Config {
                message: format!("invalid bridge name '{}'", self.bridge),
            });
        }
        self.namespaces.validate()
    }

    /// Standard paths derived from this configuration.
    #[must_use]
    pub fn paths(&self) -> SkiffPaths {
        SkiffPaths::new().with_cgroup_root(&self.cgroup_root)
    }

    /// Default stop timeout.
    #[must_use]
    pub const fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// Set the cgroup root.
    #[must_use]
    pub fn with_cgroup_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cgroup_root = root.into();
        self
    }

    /// Set the bridge name.
    #[must_use]
    pub fn with_bridge(mut self, bridge: impl Into<String>) -> Self {
        self.bridge = bridge.into();
        self
    }

    /// Set the subnet.
    #[must_use]
    pub const fn with_subnet(mut self, subnet: Subnet) -> Self {
        self.subnet = subnet;
        self
    }

    /// Set the default stop timeout.
    #[must_use]
    pub const fn with_stop_timeout(mut self, timeout: Duration) -> Self {
        self.stop_timeout_secs = timeout.as_secs();
        self
    }

    /// Set the namespaces.
    #[must_use]
    pub fn with_namespaces(mut self, namespaces: NamespaceConfig) -> Self {
        self.namespaces = namespaces;
        self
    }
}
