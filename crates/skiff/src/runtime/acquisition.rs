//! Ordered record of what a container holds, and the one routine that
//! releases it.

use skiff_common::{SkiffError, SkiffResult};
use skiff_network::NetworkBinding;

use super::HostServices;
use super::state::Container;
use crate::cgroup::ResourceGroup;
use crate::filesystem::MountedRoot;
use crate::namespace::NamespaceSet;

/// One acquired resource.
#[derive(Debug)]
pub enum Acquired {
    /// Namespace set and, until launch, the paused init.
    Namespaces(NamespaceSet),
    /// Prepared rootfs.
    Rootfs(MountedRoot),
    /// Resource group holding the init.
    ResourceGroup(ResourceGroup),
    /// Network device and address.
    Network(NetworkBinding),
}

impl Acquired {
    const fn label(&self) -> &'static str {
        match self {
            Self::Namespaces(_) => "namespaces",
            Self::Rootfs(_) => "rootfs",
            Self::ResourceGroup(_) => "resource group",
            Self::Network(_) => "network",
        }
    }
}

/// Resources in acquisition order.
#[derive(Debug, Default)]
pub struct AcquisitionLog {
    entries: Vec<Acquired>,
}

impl AcquisitionLog {
    /// Empty log.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Record a successful acquisition.
    pub fn push(&mut self, acquired: Acquired) {
        tracing::debug!(resource = acquired.label(), "Acquired");
        self.entries.push(acquired);
    }

    /// True when nothing is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of held resources.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// The namespace set, if held.
    #[must_use]
    pub fn namespaces(&self) -> Option<&NamespaceSet> {
        self.entries.iter().find_map(|e| match e {
            Acquired::Namespaces(set) => Some(set),
            _ => None,
        })
    }

    /// Mutable access to the namespace set, if held.
    pub fn namespaces_mut(&mut self) -> Option<&mut NamespaceSet> {
        self.entries.iter_mut().find_map(|e| match e {
            Acquired::Namespaces(set) => Some(set),
            _ => None,
        })
    }

    /// The resource group, if held.
    #[must_use]
    pub fn resource_group(&self) -> Option<&ResourceGroup> {
        self.entries.iter().find_map(|e| match e {
            Acquired::ResourceGroup(group) => Some(group),
            _ => None,
        })
    }

    /// Mirror what is held into the inspectable record.
    pub fn describe(&self, record: &mut Container) {
        record.clear_resources();
        for entry in &self.entries {
            match entry {
                Acquired::Namespaces(set) => record.namespaces = set.records(),
                Acquired::Rootfs(root) => record.mounts.clone_from(&root.mounts),
                Acquired::ResourceGroup(group) => record.resource_group = Some(group.path.clone()),
                Acquired::Network(binding) => record.network = Some(binding.clone()),
            }
        }
    }

    /// Release everything, newest first.
    ///
    /// Each failure is logged and returned; the resource that failed stays
    /// in the log so a later call can retry it. The namespace set is only
    /// released once everything acquired after it is gone, since rootfs
    /// teardown runs inside it.
    pub async fn unwind(&mut self, host: &HostServices) -> Vec<SkiffError> {
        let mut errors = Vec::new();
        let mut leftovers = Vec::new();

        while let Some(entry) = self.entries.pop() {
            let label = entry.label();
            let result = match entry {
                Acquired::Network(binding) => host
                    .network
                    .detach(&binding)
                    .await
                    .map_err(|e| (e, Acquired::Network(binding))),
                Acquired::ResourceGroup(group) => host
                    .resources
                    .destroy(&group)
                    .await
                    .map_err(|e| (e, Acquired::ResourceGroup(group))),
                Acquired::Rootfs(mut root) => {
                    let outcome: SkiffResult<()> = match self.namespaces() {
                        Some(ns) => host.mounter.teardown(&mut root, ns).await,
                        None => Err(SkiffError::internal("rootfs held without a namespace set")),
                    };
                    outcome.map_err(|e| (e, Acquired::Rootfs(root)))
                }
                Acquired::Namespaces(set) if !leftovers.is_empty() => {
                    tracing::debug!(pid = set.pid(), "Keeping namespaces for a later teardown");
                    leftovers.push(Acquired::Namespaces(set));
                    continue;
                }
                Acquired::Namespaces(set) => {
                    // the set is consumed either way; nothing left to retry
                    if let Err(e) = host.isolator.release(set).await {
                        tracing::warn!(error = %e, "Failed to release namespaces");
                        errors.push(e);
                    }
                    Ok(())
                }
            };

            if let Err((err, entry)) = result {
                tracing::warn!(resource = label, error = %err, "Release failed");
                errors.push(err);
                leftovers.push(entry);
            } else {
                tracing::debug!(resource = label, "Released");
            }
        }

        leftovers.reverse();
        self.entries = leftovers;
        errors
    }
}
