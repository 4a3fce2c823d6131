//! Start phases.

use skiff_common::SkiffError;

/// Container start phases, in acquisition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    /// Setting up namespaces.
    Namespaces,
    /// Setting up root filesystem.
    Rootfs,
    /// Setting up the resource group.
    ResourceGroup,
    /// Setting up networking.
    Network,
    /// Executing the entry process.
    Exec,
}

impl LifecyclePhase {
    /// Wrap a leaf error in the variant reporting this phase.
    ///
    /// Exec failures already carry their command and are passed through.
    /// Anything else in the exec phase comes from handing off to the paused
    /// init and is reported as a namespace failure.
    #[must_use]
    pub fn wrap(self, err: SkiffError) -> SkiffError {
        if self == Self::Exec && matches!(err, SkiffError::ExecFailure { .. }) {
            return err;
        }
        let source = Box::new(err);
        match self {
            Self::Namespaces | Self::Exec => SkiffError::NamespaceFailure { source },
            Self::Rootfs => SkiffError::MountFailure { source },
            Self::ResourceGroup => SkiffError::ResourceLimitFailure { source },
            Self::Network => SkiffError::NetworkFailure { source },
        }
    }
}

impl std::fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Namespaces => write!(f, "namespaces"),
            Self::Rootfs => write!(f, "rootfs"),
            Self::ResourceGroup => write!(f, "resource group"),
            Self::Network => write!(f, "network"),
            Self::Exec => write!(f, "exec"),
        }
    }
}
