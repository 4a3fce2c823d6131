//! The OS-facing services a supervisor works through.

use std::sync::Arc;

use skiff_network::{AddressPool, BridgeNetwork, NetworkBridge};

use super::RuntimeConfig;
use crate::cgroup::{CgroupManager, ResourceController};
use crate::filesystem::{NsenterExecutor, RootfsMounter};
use crate::namespace::{LinuxNamespaceIsolator, NamespaceIsolator};

/// One implementation per leaf component, shared by every container.
#[derive(Clone)]
pub struct HostServices {
    /// Namespace creation.
    pub isolator: Arc<dyn NamespaceIsolator>,
    /// Rootfs preparation.
    pub mounter: RootfsMounter,
    /// Resource groups.
    pub resources: Arc<dyn ResourceController>,
    /// Network attachment.
    pub network: Arc<dyn NetworkBridge>,
}

impl std::fmt::Debug for HostServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostServices").finish_non_exhaustive()
    }
}

impl HostServices {
    /// The Linux implementations configured from `config`.
    ///
    /// Nothing on the host is touched until a container starts.
    #[must_use]
    pub fn linux(config: &RuntimeConfig) -> Self {
        let pool = Arc::new(AddressPool::new(config.subnet));
        Self {
            isolator: Arc::new(LinuxNamespaceIsolator::new()),
            mounter: RootfsMounter::new(Arc::new(NsenterExecutor::new())),
            resources: Arc::new(CgroupManager::new(config.paths())),
            network: Arc::new(BridgeNetwork::new(config.bridge.clone(), pool)),
        }
    }
}
