//! Standard filesystem paths for Skiff.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default cgroup v2 mount point.
pub static SKIFF_CGROUP_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("SKIFF_CGROUP_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/sys/fs/cgroup"))
});

/// Name of the parent cgroup holding every container group.
pub const CGROUP_PARENT: &str = "skiff";

/// Standard paths used by the engine.
#[derive(Debug, Clone)]
pub struct SkiffPaths {
    /// cgroup v2 hierarchy root (default: /sys/fs/cgroup).
    pub cgroup_root: PathBuf,
}

impl SkiffPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the cgroup root.
    #[must_use]
    pub fn with_cgroup_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cgroup_root = root.into();
        self
    }

    /// Parent cgroup for all containers.
    #[must_use]
    pub fn cgroup_parent(&self) -> PathBuf {
        self.cgroup_root.join(CGROUP_PARENT)
    }

    /// cgroup directory for one container.
    #[must_use]
    pub fn cgroup(&self, id: &str) -> PathBuf {
        self.cgroup_parent().join(id)
    }

    /// Per-user configuration file (`~/.config/skiff/config.toml`).
    #[must_use]
    pub fn user_config_file() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("skiff").join("config.toml"))
    }
}

impl Default for SkiffPaths {
    fn default() -> Self {
        Self {
            cgroup_root: SKIFF_CGROUP_ROOT.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cgroup_paths() {
        let paths = SkiffPaths::new().with_cgroup_root("/tmp/cg");
        assert_eq!(paths.cgroup_parent(), PathBuf::from("/tmp/cg/skiff"));
        assert_eq!(paths.cgroup("c3"), PathBuf::from("/tmp/cg/skiff/c3"));
    }

    #[test]
    fn user_config_under_skiff_dir() {
        if let Some(path) = SkiffPaths::user_config_file() {
            assert!(path.ends_with("skiff/config.toml"));
        }
    }
}
