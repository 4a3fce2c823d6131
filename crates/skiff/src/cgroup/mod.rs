//! Cgroup v2 management.
//!
//! Every container gets its own group under `<cgroup root>/skiff/<id>`
//! carrying the limits from its spec.

mod manager;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use skiff_common::{ContainerId, SkiffResult};

use crate::runtime::ResourceLimits;

pub use manager::CgroupManager;

/// A created resource group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceGroup {
    /// Owning container.
    pub id: ContainerId,
    /// Group directory.
    pub path: PathBuf,
}

/// Counters of limit enforcement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimitEvents {
    /// `oom_kill` from `memory.events`.
    pub oom_kill: u64,
    /// `max` from `pids.events`.
    pub pids_max: u64,
}

/// Creates, populates and removes resource groups.
#[async_trait]
pub trait ResourceController: Send + Sync {
    /// Create a group for `id` enforcing `limits`.
    async fn create(&self, id: &ContainerId, limits: &ResourceLimits) -> SkiffResult<ResourceGroup>;

    /// Move `pid` into `group`.
    async fn attach(&self, group: &ResourceGroup, pid: u32) -> SkiffResult<()>;

    /// Remove `group`. Fails with `GroupBusy` while it has members.
    async fn destroy(&self, group: &ResourceGroup) -> SkiffResult<()>;

    /// Limit enforcement counters for `group`.
    async fn limit_events(&self, group: &ResourceGroup) -> SkiffResult<LimitEvents>;
}
