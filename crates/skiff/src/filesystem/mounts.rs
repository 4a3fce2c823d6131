//! Mount operations.
//!
//! Mounts are applied inside the container's mount namespace by entering it
//! through the held namespace handle, so the host mount table is never
//! touched and teardown still works after every container process is gone.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use skiff_common::{SkiffError, SkiffResult};

use crate::namespace::{NamespaceKind, NamespaceSet};

/// Mount options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountOptions {
    /// Read-only mount.
    pub readonly: bool,
    /// No exec.
    pub noexec: bool,
    /// No suid.
    pub nosuid: bool,
    /// No dev.
    pub nodev: bool,
    /// Extra filesystem data (`mode=755`, `size=...`).
    pub data: Vec<String>,
}

impl MountOptions {
    /// Create options for /proc mount.
    #[must_use]
    pub fn proc() -> Self {
        Self {
            readonly: false,
            noexec: true,
            nosuid: true,
            nodev: true,
            data: Vec::new(),
        }
    }

    /// Create options for /sys mount.
    #[must_use]
    pub fn sysfs() -> Self {
        Self {
            readonly: true,
            noexec: true,
            nosuid: true,
            nodev: true,
            data: Vec::new(),
        }
    }

    /// Create options for the /dev tmpfs.
    #[must_use]
    pub fn dev_tmpfs() -> Self {
        Self {
            readonly: false,
            noexec: false,
            nosuid: true,
            nodev: false,
            data: vec!["mode=755".to_string(), "size=65536k".to_string()],
        }
    }

    /// Comma-separated `-o` value.
    #[must_use]
    pub fn to_option_string(&self) -> String {
        let mut parts: Vec<&str> = Vec::new();
        if self.readonly {
            parts.push("ro");
        }
        if self.nosuid {
            parts.push("nosuid");
        }
        if self.nodev {
            parts.push("nodev");
        }
        if self.noexec {
            parts.push("noexec");
        }
        parts.extend(self.data.iter().map(String::as_str));
        parts.join(",")
    }
}

/// Character devices populated in the container's `/dev`.
pub const DEVICE_NODES: [(&str, u32, u32); 6] = [
    ("null", 1, 3),
    ("zero", 1, 5),
    ("full", 1, 7),
    ("random", 1, 8),
    ("urandom", 1, 9),
    ("tty", 5, 0),
];

/// One step of rootfs preparation or teardown. Paths are host-side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountOp {
    /// Stop mount events propagating back to the host.
    MakePrivate,
    /// Bind `source` onto `target`.
    Bind {
        /// Host source.
        source: PathBuf,
        /// Host-side target.
        target: PathBuf,
    },
    /// Turn an existing bind read-only.
    RemountReadonly {
        /// Host-side target.
        target: PathBuf,
    },
    /// Mount a kernel filesystem.
    Filesystem {
        /// `proc`, `sysfs` or `tmpfs`.
        fstype: &'static str,
        /// Host-side target.
        target: PathBuf,
        /// Mount options.
        options: MountOptions,
    },
    /// Create a character device node.
    DeviceNode {
        /// Host-side node path.
        path: PathBuf,
        /// Major number.
        major: u32,
        /// Minor number.
        minor: u32,
    },
    /// Lazily detach a mount.
    Unmount {
        /// Host-side target.
        target: PathBuf,
    },
}

impl MountOp {
    /// Command line performing this step.
    #[must_use]
    pub fn argv(&self) -> Vec<String> {
        let path = |p: &Path| p.display().to_string();
        match self {
            Self::MakePrivate => vec!["mount".into(), "--make-rprivate".into(), "/".into()],
            Self::Bind { source, target } => {
                vec!["mount".into(), "--bind".into(), path(source), path(target)]
            }
            Self::RemountReadonly { target } => vec![
                "mount".into(),
                "-o".into(),
                "remount,bind,ro".into(),
                path(target),
            ],
            Self::Filesystem {
                fstype,
                target,
                options,
            } => vec![
                "mount".into(),
                "-t".into(),
                (*fstype).to_string(),
                "-o".into(),
                options.to_option_string(),
                (*fstype).to_string(),
                path(target),
            ],
            Self::DeviceNode { path: node, major, minor } => vec![
                "mknod".into(),
                "-m".into(),
                "666".into(),
                path(node),
                "c".into(),
                major.to_string(),
                minor.to_string(),
            ],
            Self::Unmount { target } => vec!["umount".into(), "-l".into(), path(target)],
        }
    }

    /// Namespaces the step must run in.
    #[must_use]
    pub fn namespaces(&self) -> &'static [NamespaceKind] {
        match self {
            Self::Filesystem { fstype: "proc", .. } => &[NamespaceKind::Mount, NamespaceKind::Pid],
            Self::Filesystem { fstype: "sysfs", .. } => &[NamespaceKind::Mount, NamespaceKind::Net],
            _ => &[NamespaceKind::Mount],
        }
    }

    /// Host-side path this step mounts on, if it creates a mount.
    #[must_use]
    pub fn mount_target(&self) -> Option<&Path> {
        match self {
            Self::Bind { target, .. } | Self::Filesystem { target, .. } => Some(target),
            _ => None,
        }
    }
}

/// Applies mount steps inside a namespace set.
#[async_trait]
pub trait MountExecutor: Send + Sync {
    /// Apply `op` inside `ns`.
    async fn apply(&self, ns: &NamespaceSet, op: &MountOp) -> SkiffResult<()>;
}

/// Runs each step through `nsenter`.
#[derive(Debug, Clone, Default)]
pub struct NsenterExecutor {
    program: String,
}

impl NsenterExecutor {
    /// Executor using `nsenter` from `PATH`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            program: "nsenter".to_string(),
        }
    }

    fn classify(op: &MountOp, stderr: &str) -> SkiffResult<()> {
        let lower = stderr.to_lowercase();
        if matches!(op, MountOp::Unmount { .. }) && lower.contains("not mounted") {
            return Ok(());
        }
        if lower.contains("permission denied") || lower.contains("must be superuser") {
            return Err(SkiffError::PermissionDenied {
                operation: op.argv().join(" "),
            });
        }
        Err(SkiffError::Io(std::io::Error::other(format!(
            "{}: {}",
            op.argv().join(" "),
            stderr.trim()
        ))))
    }
}

#[async_trait]
impl MountExecutor for NsenterExecutor {
    async fn apply(&self, ns: &NamespaceSet, op: &MountOp) -> SkiffResult<()> {
        let mut args = ns.nsenter_args(op.namespaces());
        if args.is_empty() {
            return Err(SkiffError::internal("mount namespace handle is missing"));
        }
        args.push("--".to_string());
        args.extend(op.argv());

        tracing::debug!(pid = ns.pid(), ?op, "Applying mount step");
        let output = tokio::process::Command::new(&self.program)
            .args(&args)
            .output()
            .await
            .map_err(|e| SkiffError::Io(std::io::Error::new(e.kind(), format!("{}: {e}", self.program))))?;

        if output.status.success() {
            Ok(())
        } else {
            Self::classify(op, &String::from_utf8_lossy(&output.stderr))
        }
    }
}
