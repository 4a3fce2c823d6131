//! Root filesystem setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use skiff_common::{SkiffError, SkiffResult};

use super::mounts::{DEVICE_NODES, MountExecutor, MountOp, MountOptions};
use super::path::{STANDARD_TARGETS, host_path, resolve_mounts};
use crate::namespace::NamespaceSet;
use crate::runtime::MountRequest;

/// Mounts established for one container, in the order they were made.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountedRoot {
    /// Canonical rootfs.
    pub rootfs: PathBuf,
    /// Host-side mount targets, oldest first.
    pub mounts: Vec<PathBuf>,
    /// Mount points created on the host, oldest first.
    pub created: Vec<PathBuf>,
}

impl MountedRoot {
    /// True once every mount is gone and every created point removed.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.mounts.is_empty() && self.created.is_empty()
    }
}

/// Prepares and tears down a container's root filesystem.
#[derive(Clone)]
pub struct RootfsMounter {
    executor: Arc<dyn MountExecutor>,
}

impl std::fmt::Debug for RootfsMounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootfsMounter").finish_non_exhaustive()
    }
}

/// Create `path` (and any missing parents), recording each new entry.
fn create_mount_point(path: &Path, is_dir: bool, created: &mut Vec<PathBuf>) -> SkiffResult<()> {
    if path.symlink_metadata().is_ok() {
        return Ok(());
    }

    let parent = path.parent().unwrap_or(path);
    let mut missing: Vec<&Path> = parent
        .ancestors()
        .take_while(|p| p.symlink_metadata().is_err())
        .collect();
    missing.reverse();
    for dir in missing {
        std::fs::create_dir(dir)?;
        created.push(dir.to_path_buf());
    }

    if is_dir {
        std::fs::create_dir(path)?;
    } else {
        std::fs::File::create(path)?;
    }
    created.push(path.to_path_buf());
    Ok(())
}

fn remove_mount_point(path: &Path) -> std::io::Result<()> {
    match path.symlink_metadata() {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir(path),
        Ok(_) => std::fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

impl RootfsMounter {
    /// Mounter applying steps through `executor`.
    #[must_use]
    pub fn new(executor: Arc<dyn MountExecutor>) -> Self {
        Self { executor }
    }

    /// Prepare `rootfs` inside the mount namespace of `ns`.
    ///
    /// Sets up a private bind of the rootfs, `/proc`, `/sys`, a tmpfs `/dev`
    /// with the standard device nodes, then each bind mount in order. Every
    /// target is validated before the first mount is made. On failure the
    /// partial setup is torn down before the error is returned.
    ///
    /// # Errors
    ///
    /// [`SkiffError::PathEscape`] or [`SkiffError::InvalidSpec`] from
    /// validation, otherwise the failing mount step's error.
    pub async fn prepare(
        &self,
        rootfs: &Path,
        requests: &[MountRequest],
        ns: &NamespaceSet,
    ) -> SkiffResult<MountedRoot> {
        let binds = resolve_mounts(rootfs, requests)?;
        let rootfs = rootfs.canonicalize()?;

        let mut mounted = MountedRoot {
            rootfs: rootfs.clone(),
            ..MountedRoot::default()
        };

        let mut steps = vec![
            MountOp::MakePrivate,
            MountOp::Bind {
                source: rootfs.clone(),
                target: rootfs.clone(),
            },
        ];
        for (target, fstype, options) in [
            ("/proc", "proc", MountOptions::proc()),
            ("/sys", "sysfs", MountOptions::sysfs()),
            ("/dev", "tmpfs", MountOptions::dev_tmpfs()),
        ] {
            steps.push(MountOp::Filesystem {
                fstype,
                target: host_path(&rootfs, Path::new(target)),
                options,
            });
        }
        for (name, major, minor) in DEVICE_NODES {
            steps.push(MountOp::DeviceNode {
                path: rootfs.join("dev").join(name),
                major,
                minor,
            });
        }
        for bind in &binds {
            steps.push(MountOp::Bind {
                source: bind.source.clone(),
                target: bind.host_target.clone(),
            });
            if bind.readonly {
                steps.push(MountOp::RemountReadonly {
                    target: bind.host_target.clone(),
                });
            }
        }

        let points = STANDARD_TARGETS
            .iter()
            .map(|t| (host_path(&rootfs, Path::new(t)), true))
            .chain(binds.iter().map(|b| (b.host_target.clone(), b.is_dir)));
        for (point, is_dir) in points {
            if let Err(err) = create_mount_point(&point, is_dir, &mut mounted.created) {
                tracing::warn!(path = %point.display(), error = %err, "Failed to create mount point");
                if let Err(cleanup) = self.teardown(&mut mounted, ns).await {
                    tracing::warn!(error = %cleanup, "Rootfs rollback left residue");
                }
                return Err(err);
            }
        }

        for step in steps {
            if let Err(err) = self.executor.apply(ns, &step).await {
                tracing::warn!(?step, error = %err, "Mount step failed, rolling back");
                if let Err(cleanup) = self.teardown(&mut mounted, ns).await {
                    tracing::warn!(error = %cleanup, "Rootfs rollback left residue");
                }
                return Err(err);
            }
            if let Some(target) = step.mount_target() {
                mounted.mounts.push(target.to_path_buf());
            }
        }

        tracing::info!(
            rootfs = %rootfs.display(),
            mounts = mounted.mounts.len(),
            "Rootfs prepared"
        );
        Ok(mounted)
    }

    /// Undo everything [`prepare`](Self::prepare) recorded, newest first.
    ///
    /// Each successfully removed mount is dropped from `mounted`, so a failed
    /// teardown can be retried. Created mount points are only removed once
    /// every mount is gone.
    ///
    /// # Errors
    ///
    /// Returns the first failure; later steps are still attempted.
    pub async fn teardown(&self, mounted: &mut MountedRoot, ns: &NamespaceSet) -> SkiffResult<()> {
        let mut first_error: Option<SkiffError> = None;

        let mut remaining = Vec::new();
        while let Some(target) = mounted.mounts.pop() {
            let step = MountOp::Unmount {
                target: target.clone(),
            };
            if let Err(err) = self.executor.apply(ns, &step).await {
                tracing::warn!(target = %target.display(), error = %err, "Failed to unmount");
                remaining.push(target);
                first_error.get_or_insert(err);
            }
        }
        remaining.reverse();
        mounted.mounts = remaining;

        if mounted.mounts.is_empty() {
            while let Some(point) = mounted.created.pop() {
                if let Err(err) = remove_mount_point(&point) {
                    tracing::warn!(path = %point.display(), error = %err, "Failed to remove mount point");
                    mounted.created.push(point);
                    first_error.get_or_insert(SkiffError::Io(err));
                    break;
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => {
                tracing::debug!(rootfs = %mounted.rootfs.display(), "Rootfs torn down");
                Ok(())
            }
        }
    }
}
