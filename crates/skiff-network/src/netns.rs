//! Network namespace references.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// A container's network namespace, as seen from the host.
///
/// `pid` is a process living in the namespace (the container init) and is
/// what `ip link set ... netns` takes. `handle` is a path that keeps the
/// namespace addressable for `nsenter`, normally an open descriptor under
/// `/proc/<engine pid>/fd/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetnsRef {
    /// A process inside the namespace.
    pub pid: u32,
    /// Namespace handle path.
    pub handle: PathBuf,
}

impl NetnsRef {
    /// Reference a namespace through an explicit handle.
    #[must_use]
    pub fn new(pid: u32, handle: impl Into<PathBuf>) -> Self {
        Self {
            pid,
            handle: handle.into(),
        }
    }

    /// Reference the namespace of `pid` through procfs.
    #[must_use]
    pub fn for_pid(pid: u32) -> Self {
        Self::new(pid, format!("/proc/{pid}/ns/net"))
    }

    /// The handle path.
    #[must_use]
    pub fn handle(&self) -> &Path {
        &self.handle
    }

    /// `nsenter` argument selecting this namespace.
    #[must_use]
    pub fn nsenter_arg(&self) -> String {
        format!("--net={}", self.handle.display())
    }
}
