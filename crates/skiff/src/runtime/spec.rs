//! Container specification submitted by callers.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use skiff_common::{SkiffError, SkiffResult};

use crate::filesystem;

/// Lowest accepted `cpu.weight`.
pub const CPU_WEIGHT_MIN: u64 = 1;
/// Highest accepted `cpu.weight`.
pub const CPU_WEIGHT_MAX: u64 = 10_000;
/// Kernel limit on hostname length.
pub const HOSTNAME_MAX: usize = 64;

/// Resource ceilings for a container. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Hard memory ceiling in bytes (`memory.max`).
    pub memory_bytes: Option<u64>,
    /// Relative CPU share, 1-10000 (`cpu.weight`).
    pub cpu_weight: Option<u64>,
    /// CPU bandwidth in millicores (`cpu.max`); 1000 = one full CPU.
    pub cpu_quota: Option<u64>,
    /// Maximum number of tasks (`pids.max`).
    pub pids_max: Option<u64>,
}

impl ResourceLimits {
    /// True when no limit is set.
    #[must_use]
    pub const fn is_unlimited(&self) -> bool {
        self.memory_bytes.is_none()
            && self.cpu_weight.is_none()
            && self.cpu_quota.is_none()
            && self.pids_max.is_none()
    }

    fn validate(&self) -> SkiffResult<()> {
        if let Some(w) = self.cpu_weight {
            if !(CPU_WEIGHT_MIN..=CPU_WEIGHT_MAX).contains(&w) {
                return Err(SkiffError::invalid_spec(format!(
                    "cpu weight {w} outside {CPU_WEIGHT_MIN}..={CPU_WEIGHT_MAX}"
                )));
            }
        }
        if self.pids_max == Some(0) {
            return Err(SkiffError::invalid_spec("pids limit must be at least 1"));
        }
        if self.memory_bytes == Some(0) {
            return Err(SkiffError::invalid_spec("memory limit must be at least 1 byte"));
        }
        if self.cpu_quota == Some(0) {
            return Err(SkiffError::invalid_spec("cpu quota must be positive"));
        }
        Ok(())
    }
}

/// Whether and how a container gets a network device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum NetworkRequest {
    /// Loopback only.
    #[default]
    Disabled,
    /// A veth on the host bridge.
    Enabled {
        /// Fixed address, or `None` for the lowest free one.
        address: Option<Ipv4Addr>,
    },
}

impl NetworkRequest {
    /// True unless disabled.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        matches!(self, Self::Enabled { .. })
    }
}

/// A host path bound into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRequest {
    /// Host-side path.
    pub source: PathBuf,
    /// Container-side path.
    pub target: PathBuf,
    /// Enforce read-only access.
    #[serde(default)]
    pub readonly: bool,
}

impl MountRequest {
    /// Read-write bind of `source` at `target`.
    pub fn bind(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            readonly: false,
        }
    }

    /// Make this bind read-only.
    #[must_use]
    pub const fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }
}

/// Parses `SRC:DST[:ro|rw]`.
impl FromStr for MountRequest {
    type Err = SkiffError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || SkiffError::invalid_spec(format!("volume '{s}' is not SRC:DST[:ro|rw]"));
        let parts: Vec<&str> = s.split(':').collect();

        let (source, target, readonly) = match parts.as_slice() {
            [src, dst] => (*src, *dst, false),
            [src, dst, "ro"] => (*src, *dst, true),
            [src, dst, "rw"] => (*src, *dst, false),
            _ => return Err(bad()),
        };
        if source.is_empty() || target.is_empty() {
            return Err(bad());
        }

        let mount = Self::bind(source, target);
        Ok(if readonly { mount.readonly() } else { mount })
    }
}

/// Everything needed to run one container. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Human-readable name; also the default hostname.
    #[serde(default)]
    pub name: Option<String>,
    /// UTS hostname inside the container.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Entry command and arguments.
    pub command: Vec<String>,
    /// Extracted root filesystem on the host.
    pub rootfs: PathBuf,
    /// Container-side working directory (default `/`).
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Resource ceilings.
    #[serde(default)]
    pub limits: ResourceLimits,
    /// Network attachment.
    #[serde(default)]
    pub network: NetworkRequest,
    /// Environment for the entry process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Bind mounts, applied in order.
    #[serde(default)]
    pub mounts: Vec<MountRequest>,
}

impl ContainerSpec {
    /// Spec running `command` from `rootfs` with no limits and no network.
    pub fn new<I, S>(rootfs: impl Into<PathBuf>, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: None,
            hostname: None,
            command: command.into_iter().map(Into::into).collect(),
            rootfs: rootfs.into(),
            working_dir: None,
            limits: ResourceLimits::default(),
            network: NetworkRequest::Disabled,
            env: BTreeMap::new(),
            mounts: Vec::new(),
        }
    }

    /// Set the container name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the hostname.
    #[must_use]
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Replace all limits.
    #[must_use]
    pub const fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Set the memory ceiling.
    #[must_use]
    pub const fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.limits.memory_bytes = Some(bytes);
        self
    }

    /// Attach to the bridge with an automatic address.
    #[must_use]
    pub const fn with_network(mut self) -> Self {
        self.network = NetworkRequest::Enabled { address: None };
        self
    }

    /// Attach to the bridge with a fixed address.
    #[must_use]
    pub const fn with_address(mut self, address: Ipv4Addr) -> Self {
        self.network = NetworkRequest::Enabled {
            address: Some(address),
        };
        self
    }

    /// Add an environment variable.
    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Append a bind mount.
    #[must_use]
    pub fn with_mount(mut self, mount: MountRequest) -> Self {
        self.mounts.push(mount);
        self
    }

    /// Container-side working directory.
    #[must_use]
    pub fn working_dir(&self) -> &Path {
        self.working_dir.as_deref().unwrap_or_else(|| Path::new("/"))
    }

    /// Check the spec against the host without acquiring anything.
    ///
    /// # Errors
    ///
    /// [`SkiffError::InvalidSpec`] for malformed fields and
    /// [`SkiffError::PathEscape`] for mount targets or a working directory
    /// that leave the rootfs.
    pub fn validate(&self) -> SkiffResult<()> {
        if !self.rootfs.is_dir() {
            return Err(SkiffError::invalid_spec(format!(
                "rootfs {} is not a directory",
                self.rootfs.display()
            )));
        }

        match self.command.first() {
            None => return Err(SkiffError::invalid_spec("command is empty")),
            Some(program) if program.is_empty() => {
                return Err(SkiffError::invalid_spec("command program is empty"));
            }
            Some(_) => {}
        }
        if self.command.iter().any(|a| a.contains('\0')) {
            return Err(SkiffError::invalid_spec("command contains a NUL byte"));
        }

        for (key, value) in &self.env {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(SkiffError::invalid_spec(format!(
                    "invalid environment variable name '{key}'"
                )));
            }
            if value.contains('\0') {
                return Err(SkiffError::invalid_spec(format!(
                    "environment variable {key} contains a NUL byte"
                )));
            }
        }

        for (field, value) in [("name", &self.name), ("hostname", &self.hostname)] {
            if let Some(v) = value {
                if v.is_empty() || v.len() > HOSTNAME_MAX || v.contains('\0') {
                    return Err(SkiffError::invalid_spec(format!(
                        "{field} must be 1-{HOSTNAME_MAX} bytes without NUL"
                    )));
                }
            }
        }

        self.limits.validate()?;

        let workdir = self.working_dir();
        if !workdir.is_absolute() {
            return Err(SkiffError::invalid_spec(format!(
                "working directory {} must be absolute",
                workdir.display()
            )));
        }
        filesystem::normalize_target(workdir)?;

        filesystem::resolve_mounts(&self.rootfs, &self.mounts)?;
        Ok(())
    }
}
