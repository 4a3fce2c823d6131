//! Containment checks for container-side paths.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use skiff_common::{SkiffError, SkiffResult};

use crate::runtime::MountRequest;

/// Targets the mounter always populates itself.
pub const STANDARD_TARGETS: [&str; 3] = ["/proc", "/sys", "/dev"];

/// A validated bind mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedMount {
    /// Canonical host source.
    pub source: PathBuf,
    /// Normalized container-side target (absolute).
    pub target: PathBuf,
    /// Target as seen from the host, under the rootfs.
    pub host_target: PathBuf,
    /// Whether the source is a directory.
    pub is_dir: bool,
    /// Read-only bind.
    pub readonly: bool,
}

/// Normalize a container-side path lexically.
///
/// Relative paths are taken from `/`. `.` is dropped and `..` removes the
/// previous component.
///
/// # Errors
///
/// Returns [`SkiffError::PathEscape`] when `..` would climb above `/`.
pub fn normalize_target(target: &Path) -> SkiffResult<PathBuf> {
    let mut parts = Vec::new();
    for component in target.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(SkiffError::PathEscape {
                        target: target.to_path_buf(),
                    });
                }
            }
            Component::Normal(part) => parts.push(part),
            Component::Prefix(_) => {
                return Err(SkiffError::PathEscape {
                    target: target.to_path_buf(),
                });
            }
        }
    }
    Ok(parts
        .into_iter()
        .fold(PathBuf::from("/"), |acc, part| acc.join(part)))
}

/// Host-side location of a normalized container path.
#[must_use]
pub fn host_path(rootfs: &Path, normalized: &Path) -> PathBuf {
    rootfs.join(normalized.strip_prefix("/").unwrap_or(normalized))
}

/// Canonicalize the deepest existing ancestor of `host` and check it stays
/// under `rootfs`. Catches symlinks that point out of the container.
fn check_symlinks(rootfs: &Path, host: &Path, target: &Path) -> SkiffResult<()> {
    let mut existing = host.to_path_buf();
    while existing.symlink_metadata().is_err() {
        if !existing.pop() {
            break;
        }
    }

    let resolved = existing.canonicalize().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            SkiffError::invalid_spec(format!(
                "mount target {} crosses a dangling symlink",
                target.display()
            ))
        } else {
            SkiffError::Io(e)
        }
    })?;

    if resolved.starts_with(rootfs) {
        Ok(())
    } else {
        tracing::debug!(
            target = %target.display(),
            resolved = %resolved.display(),
            "Mount target resolves outside rootfs"
        );
        Err(SkiffError::PathEscape {
            target: target.to_path_buf(),
        })
    }
}

/// Resolve one container-side path to its host location inside `rootfs`
/// (which must already be canonical).
///
/// # Errors
///
/// [`SkiffError::PathEscape`] for lexical or symlink escapes.
pub fn resolve_target(rootfs: &Path, target: &Path) -> SkiffResult<(PathBuf, PathBuf)> {
    let normalized = normalize_target(target)?;
    let host = host_path(rootfs, &normalized);
    check_symlinks(rootfs, &host, target)?;
    Ok((normalized, host))
}

/// Validate every bind request against `rootfs` before anything is mounted.
///
/// # Errors
///
/// - [`SkiffError::PathEscape`] for a target leaving the rootfs
/// - [`SkiffError::InvalidSpec`] for a missing source, a target of `/`, a
///   target inside `/proc`, `/sys` or `/dev`, or a duplicate target
pub fn resolve_mounts(rootfs: &Path, requests: &[MountRequest]) -> SkiffResult<Vec<ResolvedMount>> {
    let rootfs = rootfs.canonicalize().map_err(|e| {
        SkiffError::invalid_spec(format!("rootfs {}: {e}", rootfs.display()))
    })?;

    let mut seen: HashSet<PathBuf> = HashSet::new();
    for standard in STANDARD_TARGETS {
        resolve_target(&rootfs, Path::new(standard))?;
        seen.insert(PathBuf::from(standard));
    }

    let mut resolved = Vec::with_capacity(requests.len());
    for request in requests {
        let (target, host_target) = resolve_target(&rootfs, &request.target)?;

        if target == Path::new("/") {
            return Err(SkiffError::invalid_spec("cannot bind mount over /"));
        }
        if STANDARD_TARGETS
            .iter()
            .any(|s| target != Path::new(s) && target.starts_with(s))
        {
            return Err(SkiffError::invalid_spec(format!(
                "mount target {} is inside a reserved filesystem",
                target.display()
            )));
        }
        if !seen.insert(target.clone()) {
            return Err(SkiffError::invalid_spec(format!(
                "duplicate mount target {}",
                target.display()
            )));
        }

        let source = request.source.canonicalize().map_err(|e| {
            SkiffError::invalid_spec(format!(
                "mount source {}: {e}",
                request.source.display()
            ))
        })?;
        let is_dir = source.is_dir();

        resolved.push(ResolvedMount {
            source,
            target,
            host_target,
            is_dir,
            readonly: request.readonly,
        });
    }
    Ok(resolved)
}
