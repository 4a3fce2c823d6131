//! Container status and the inspectable container record.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skiff_common::{ContainerId, ExitStatus};
use skiff_network::NetworkBinding;

use super::ContainerSpec;
use crate::namespace::NamespaceRecord;

/// Lifecycle status of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Validated, nothing acquired.
    Created,
    /// Acquiring resources.
    Starting,
    /// Entry process running.
    Running,
    /// Stop requested, waiting for the entry process.
    Stopping,
    /// Entry process reaped.
    Stopped,
    /// Start failed; resources rolled back.
    Failed,
    /// Every resource released.
    Destroyed,
}

impl ContainerStatus {
    /// Whether `start` is legal.
    #[must_use]
    pub const fn can_start(self) -> bool {
        matches!(self, Self::Created)
    }

    /// Whether `stop` has a process to act on.
    #[must_use]
    pub const fn can_stop(self) -> bool {
        matches!(self, Self::Running)
    }

    /// Whether `destroy` may release resources.
    #[must_use]
    pub const fn can_destroy(self) -> bool {
        matches!(self, Self::Created | Self::Stopped | Self::Failed)
    }

    /// Whether the entry process may still be alive.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }
}

impl fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Snapshot of one container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    /// Engine-assigned ID.
    pub id: ContainerId,
    /// Human name from the spec.
    pub name: Option<String>,
    /// Lifecycle status.
    pub status: ContainerStatus,
    /// Host PID of the entry process once launched.
    pub pid: Option<u32>,
    /// cgroup directory once allocated.
    pub resource_group: Option<PathBuf>,
    /// Held namespaces.
    pub namespaces: Vec<NamespaceRecord>,
    /// Network attachment.
    pub network: Option<NetworkBinding>,
    /// Host-side mount targets currently applied.
    pub mounts: Vec<PathBuf>,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Launch time.
    pub started_at: Option<DateTime<Utc>>,
    /// Time the entry process was reaped.
    pub finished_at: Option<DateTime<Utc>>,
    /// Terminal status once reaped.
    pub exit: Option<ExitStatus>,
    /// The submitted spec.
    pub spec: ContainerSpec,
}

impl Container {
    /// Fresh record in `Created`.
    #[must_use]
    pub fn new(id: ContainerId, spec: ContainerSpec) -> Self {
        Self {
            id,
            name: spec.name.clone(),
            status: ContainerStatus::Created,
            pid: None,
            resource_group: None,
            namespaces: Vec::new(),
            network: None,
            mounts: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            exit: None,
            spec,
        }
    }

    /// Drop every resource reference after a full release.
    pub fn clear_resources(&mut self) {
        self.resource_group = None;
        self.namespaces.clear();
        self.network = None;
        self.mounts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_guards() {
        assert!(ContainerStatus::Created.can_start());
        assert!(!ContainerStatus::Stopped.can_start());
        assert!(ContainerStatus::Running.can_stop());
        assert!(!ContainerStatus::Stopping.can_stop());
        for s in [ContainerStatus::Created, ContainerStatus::Stopped, ContainerStatus::Failed] {
            assert!(s.can_destroy(), "{s}");
        }
        assert!(!ContainerStatus::Running.can_destroy());
    }

    #[test]
    fn record_serializes() {
        let spec = ContainerSpec::new("/tmp/root", ["/bin/true"]).with_name("web");
        let record = Container::new(ContainerId::from_sequence(1), spec);
        assert_eq!(record.name.as_deref(), Some("web"));

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["status"], "created");
        assert_eq!(json["id"], "c1");
    }
}
