//! Linux namespace management.
//!
//! A container gets a fresh set of namespaces from a paused init process:
//! - PID namespace (CLONE_NEWPID)
//! - Mount namespace (CLONE_NEWNS)
//! - UTS namespace (CLONE_NEWUTS)
//! - IPC namespace (CLONE_NEWIPC)
//! - Network namespace (CLONE_NEWNET)
//!
//! The set keeps an open descriptor per namespace so mounts can still be
//! torn down after the entry process has exited.

mod linux;

use std::fmt;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use skiff_common::{SkiffError, SkiffResult};
use skiff_network::NetnsRef;

use crate::exec::{InitProcess, LaunchSpec};

pub use linux::LinuxNamespaceIsolator;

/// One isolation axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NamespaceKind {
    /// Process IDs.
    Pid,
    /// Mount table.
    Mount,
    /// Hostname and domain name.
    Uts,
    /// System V IPC and POSIX message queues.
    Ipc,
    /// Network stack.
    Net,
}

impl NamespaceKind {
    /// Every supported kind, in setup order.
    pub const ALL: [Self; 5] = [Self::Pid, Self::Mount, Self::Uts, Self::Ipc, Self::Net];

    /// Entry name under `/proc/<pid>/ns/`.
    #[must_use]
    pub const fn proc_name(self) -> &'static str {
        match self {
            Self::Pid => "pid",
            Self::Mount => "mnt",
            Self::Uts => "uts",
            Self::Ipc => "ipc",
            Self::Net => "net",
        }
    }

    /// `clone(2)` flag creating this namespace.
    #[must_use]
    pub const fn clone_flag(self) -> libc::c_int {
        match self {
            Self::Pid => libc::CLONE_NEWPID,
            Self::Mount => libc::CLONE_NEWNS,
            Self::Uts => libc::CLONE_NEWUTS,
            Self::Ipc => libc::CLONE_NEWIPC,
            Self::Net => libc::CLONE_NEWNET,
        }
    }

    /// `nsenter` option selecting this namespace.
    #[must_use]
    pub const fn nsenter_option(self) -> &'static str {
        match self {
            Self::Pid => "--pid",
            Self::Mount => "--mount",
            Self::Uts => "--uts",
            Self::Ipc => "--ipc",
            Self::Net => "--net",
        }
    }

    /// Whether the running kernel offers this namespace.
    #[must_use]
    pub fn is_supported(self) -> bool {
        Path::new("/proc/self/ns").join(self.proc_name()).exists()
    }
}

impl fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.proc_name())
    }
}

/// Which namespaces a container gets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<NamespaceKind>", into = "Vec<NamespaceKind>")]
pub struct NamespaceConfig {
    kinds: Vec<NamespaceKind>,
}

impl NamespaceConfig {
    /// Every supported namespace.
    #[must_use]
    pub fn all() -> Self {
        Self {
            kinds: NamespaceKind::ALL.to_vec(),
        }
    }

    /// An explicit selection; duplicates are dropped.
    pub fn new(kinds: impl IntoIterator<Item = NamespaceKind>) -> Self {
        let mut kinds: Vec<_> = kinds.into_iter().collect();
        kinds.sort_unstable();
        kinds.dedup();
        Self { kinds }
    }

    /// Selected kinds.
    #[must_use]
    pub fn kinds(&self) -> &[NamespaceKind] {
        &self.kinds
    }

    /// Whether `kind` is selected.
    #[must_use]
    pub fn contains(&self, kind: NamespaceKind) -> bool {
        self.kinds.contains(&kind)
    }

    /// Combined clone flags.
    #[must_use]
    pub fn clone_flags(&self) -> libc::c_int {
        self.kinds.iter().fold(0, |acc, k| acc | k.clone_flag())
    }

    /// The mount and PID namespaces are mandatory. Without a mount namespace
    /// rootfs mounts would land in the host's mount table; without a PID
    /// namespace reaping the entry process leaves its descendants running
    /// in the resource group.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Config`] naming the first missing namespace.
    pub fn validate(&self) -> SkiffResult<()> {
        match [NamespaceKind::Mount, NamespaceKind::Pid]
            .into_iter()
            .find(|kind| !self.contains(*kind))
        {
            Some(kind) => Err(SkiffError::Config {
                message: format!("the {kind} namespace cannot be disabled"),
            }),
            None => Ok(()),
        }
    }
}

impl From<Vec<NamespaceKind>> for NamespaceConfig {
    fn from(kinds: Vec<NamespaceKind>) -> Self {
        Self::new(kinds)
    }
}

impl From<NamespaceConfig> for Vec<NamespaceKind> {
    fn from(config: NamespaceConfig) -> Self {
        config.kinds
    }
}

impl Default for NamespaceConfig {
    fn default() -> Self {
        Self::all()
    }
}

/// An open reference to one namespace of a container.
#[derive(Debug)]
pub struct NamespaceHandle {
    kind: NamespaceKind,
    path: PathBuf,
    fd: Option<OwnedFd>,
}

impl NamespaceHandle {
    /// Wrap an open namespace descriptor. The handle path goes through this
    /// process's fd table so it stays valid after the namespace's last
    /// process exits.
    #[must_use]
    pub fn owned(kind: NamespaceKind, fd: OwnedFd) -> Self {
        use std::os::fd::AsRawFd;

        let path = PathBuf::from(format!("/proc/{}/fd/{}", std::process::id(), fd.as_raw_fd()));
        Self {
            kind,
            path,
            fd: Some(fd),
        }
    }

    /// A handle that names a path without owning a descriptor.
    #[must_use]
    pub fn detached(kind: NamespaceKind, path: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            path: path.into(),
            fd: None,
        }
    }

    /// Namespace kind.
    #[must_use]
    pub const fn kind(&self) -> NamespaceKind {
        self.kind
    }

    /// Path usable with `nsenter` or `setns`.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether this handle keeps a descriptor open.
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    fn close(&mut self) {
        self.fd = None;
    }
}

/// Inspectable description of a held namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceRecord {
    /// Namespace kind.
    pub kind: NamespaceKind,
    /// Handle path.
    pub handle: PathBuf,
}

/// The namespaces created for one container plus the paused process that
/// lives in them.
pub struct NamespaceSet {
    pid: u32,
    handles: Vec<NamespaceHandle>,
    init: Option<Box<dyn InitProcess>>,
}

impl fmt::Debug for NamespaceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NamespaceSet")
            .field("pid", &self.pid)
            .field("handles", &self.handles)
            .field("init_pending", &self.init.is_some())
            .finish()
    }
}

impl NamespaceSet {
    /// Assemble a set around a paused init.
    #[must_use]
    pub fn new(init: Box<dyn InitProcess>, handles: Vec<NamespaceHandle>) -> Self {
        Self {
            pid: init.pid(),
            handles,
            init: Some(init),
        }
    }

    /// Host PID of the container init.
    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    /// Handle for `kind`, if that namespace was created.
    #[must_use]
    pub fn handle(&self, kind: NamespaceKind) -> Option<&Path> {
        self.handles
            .iter()
            .find(|h| h.kind == kind)
            .map(NamespaceHandle::path)
    }

    /// All handles.
    #[must_use]
    pub fn handles(&self) -> &[NamespaceHandle] {
        &self.handles
    }

    /// `nsenter` arguments entering the given namespaces of this set.
    #[must_use]
    pub fn nsenter_args(&self, kinds: &[NamespaceKind]) -> Vec<String> {
        kinds
            .iter()
            .filter_map(|k| {
                self.handle(*k)
                    .map(|p| format!("{}={}", k.nsenter_option(), p.display()))
            })
            .collect()
    }

    /// Network namespace reference for the bridge.
    #[must_use]
    pub fn netns(&self) -> Option<NetnsRef> {
        self.handle(NamespaceKind::Net)
            .map(|p| NetnsRef::new(self.pid, p))
    }

    /// Records for the container snapshot.
    #[must_use]
    pub fn records(&self) -> Vec<NamespaceRecord> {
        self.handles
            .iter()
            .map(|h| NamespaceRecord {
                kind: h.kind,
                handle: h.path.clone(),
            })
            .collect()
    }

    /// Take the paused init to launch the entry command. Returns `None`
    /// once taken.
    pub fn take_init(&mut self) -> Option<Box<dyn InitProcess>> {
        self.init.take()
    }

    /// Kill and reap the init if it was never launched.
    pub fn abort_init(&mut self) {
        if let Some(init) = self.init.take() {
            tracing::debug!(pid = self.pid, "Aborting paused init");
            init.abort();
        }
    }

    /// Close every handle.
    pub fn close_handles(&mut self) {
        for handle in &mut self.handles {
            handle.close();
        }
    }
}

/// Creates and releases namespace sets.
#[async_trait]
pub trait NamespaceIsolator: Send + Sync {
    /// Create the namespaces in `config` around a paused init prepared to
    /// run `launch`. No user code runs until the init is launched.
    async fn create(&self, config: &NamespaceConfig, launch: &LaunchSpec)
    -> SkiffResult<NamespaceSet>;

    /// Drop the handles and, if it never launched, kill and reap the init.
    async fn release(&self, set: NamespaceSet) -> SkiffResult<()>;
}

/// Check every axis in `config` against `/proc/self/ns`.
///
/// # Errors
///
/// Returns [`SkiffError::UnsupportedIsolation`] for the first missing axis.
pub fn check_support(config: &NamespaceConfig) -> SkiffResult<()> {
    match config.kinds().iter().find(|k| !k.is_supported()) {
        Some(kind) => Err(SkiffError::UnsupportedIsolation {
            axis: kind.to_string(),
        }),
        None => Ok(()),
    }
}
