//! Filesystem operations for containers.
//!
//! This module handles:
//! - Mount target containment checks
//! - Root filesystem setup and teardown
//! - Mount operations inside the container's mount namespace

mod mounts;
mod path;
mod rootfs;

pub use mounts::{DEVICE_NODES, MountExecutor, MountOp, MountOptions, NsenterExecutor};
pub use path::{ResolvedMount, STANDARD_TARGETS, normalize_target, resolve_mounts};
pub use rootfs::{MountedRoot, RootfsMounter};
