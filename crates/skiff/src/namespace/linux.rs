//! Namespace creation on Linux.

use async_trait::async_trait;
use rustix::fs::{Mode, OFlags};
use skiff_common::{SkiffError, SkiffResult};

use super::{NamespaceConfig, NamespaceHandle, NamespaceIsolator, NamespaceKind, NamespaceSet, check_support};
use crate::exec::{self, InitProcess, LaunchSpec};

/// Creates namespaces by cloning a paused init.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxNamespaceIsolator;

impl LinuxNamespaceIsolator {
    /// Create the isolator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

fn open_handles(pid: u32, config: &NamespaceConfig) -> SkiffResult<Vec<NamespaceHandle>> {
    config
        .kinds()
        .iter()
        .map(|kind| {
            let path = format!("/proc/{pid}/ns/{}", kind.proc_name());
            let fd = rustix::fs::open(&path, OFlags::RDONLY | OFlags::CLOEXEC, Mode::empty())
                .map_err(|e| SkiffError::Internal {
                    message: format!("Failed to open {path}: {e}"),
                })?;
            tracing::debug!(pid, namespace = %kind, "Opened namespace handle");
            Ok(NamespaceHandle::owned(*kind, fd))
        })
        .collect()
}

#[async_trait]
impl NamespaceIsolator for LinuxNamespaceIsolator {
    async fn create(
        &self,
        config: &NamespaceConfig,
        launch: &LaunchSpec,
    ) -> SkiffResult<NamespaceSet> {
        check_support(config)?;

        let set_hostname = config.contains(NamespaceKind::Uts);
        let init = exec::spawn_paused(config.clone_flags(), launch, set_hostname)?;
        let pid = init.pid();

        // dropping `init` on error kills and reaps it
        let handles = open_handles(pid, config)?;

        tracing::debug!(
            pid,
            namespaces = ?config.kinds(),
            "Namespaces created"
        );
        Ok(NamespaceSet::new(Box::new(init), handles))
    }

    async fn release(&self, mut set: NamespaceSet) -> SkiffResult<()> {
        let pid = set.pid();
        if let Some(init) = set.take_init() {
            tokio::task::spawn_blocking(move || init.abort())
                .await
                .map_err(|e| SkiffError::Internal {
                    message: format!("Task join error: {e}"),
                })?;
        }
        set.close_handles();
        tracing::debug!(pid, "Namespace handles released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ContainerSpec;
    use skiff_common::ContainerId;

    #[tokio::test]
    #[ignore = "requires root to create namespaces"]
    async fn create_and_release() {
        let spec = ContainerSpec::new("/", ["/bin/true"]);
        let launch = LaunchSpec::for_container(&ContainerId::from_sequence(1), &spec);

        let isolator = LinuxNamespaceIsolator::new();
        let set = isolator
            .create(&NamespaceConfig::all(), &launch)
            .await
            .unwrap();

        assert_eq!(set.handles().len(), 5);
        assert!(set.handles().iter().all(NamespaceHandle::is_open));
        assert!(set.netns().is_some());

        isolator.release(set).await.unwrap();
    }
}
