//! Cgroup manager implementation.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use skiff_common::{ContainerId, SkiffError, SkiffPaths, SkiffResult, resource};

use super::{LimitEvents, ResourceController, ResourceGroup};
use crate::runtime::ResourceLimits;

/// Controllers enabled for container groups.
const CONTROLLERS: [&str; 3] = ["memory", "cpu", "pids"];

/// How long destroy waits for a group to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);
const DRAIN_POLL: Duration = Duration::from_millis(20);

/// Manages container cgroups under one hierarchy root.
#[derive(Debug)]
pub struct CgroupManager {
    paths: SkiffPaths,
    drain_timeout: Duration,
    /// Serializes parent setup and group creation.
    create_lock: Mutex<()>,
}

/// Write to an existing control file. Never creates the file.
fn write_control(path: &Path, value: &str) -> std::io::Result<()> {
    let mut file = std::fs::OpenOptions::new().write(true).open(path)?;
    file.write_all(value.as_bytes())
}

fn permission_or_io(operation: &str, err: std::io::Error) -> SkiffError {
    if err.kind() == std::io::ErrorKind::PermissionDenied {
        SkiffError::PermissionDenied {
            operation: operation.to_string(),
        }
    } else {
        SkiffError::Io(err)
    }
}

/// Value of `key` in a flat-keyed cgroup file such as `memory.events`.
fn read_counter(path: &Path, key: &str) -> u64 {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|content| {
            content.lines().find_map(|line| {
                let mut parts = line.split_whitespace();
                (parts.next() == Some(key))
                    .then(|| parts.next().and_then(|v| v.parse().ok()))
                    .flatten()
            })
        })
        .unwrap_or(0)
}

fn member_count(group: &Path) -> usize {
    std::fs::read_to_string(group.join("cgroup.procs"))
        .map(|content| content.lines().filter(|l| !l.trim().is_empty()).count())
        .unwrap_or(0)
}

impl CgroupManager {
    /// Manager for the hierarchy in `paths`.
    #[must_use]
    pub fn new(paths: SkiffPaths) -> Self {
        Self {
            paths,
            drain_timeout: DRAIN_TIMEOUT,
            create_lock: Mutex::new(()),
        }
    }

    /// Override how long destroy waits for members to exit.
    #[must_use]
    pub const fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Controllers the hierarchy root offers.
    #[must_use]
    pub fn available_controllers(&self) -> Vec<String> {
        std::fs::read_to_string(self.paths.cgroup_root.join("cgroup.controllers"))
            .map(|c| c.split_whitespace().map(String::from).collect())
            .unwrap_or_default()
    }

    /// Enable the container controllers for children of `dir`. Each
    /// controller is enabled separately so one missing controller does not
    /// block the others.
    fn enable_controllers(dir: &Path) {
        let control = dir.join("cgroup.subtree_control");
        for controller in CONTROLLERS {
            if let Err(e) = write_control(&control, &format!("+{controller}")) {
                tracing::debug!(
                    path = %control.display(),
                    controller,
                    error = %e,
                    "Could not enable controller"
                );
            }
        }
    }

    fn ensure_parent(&self) -> SkiffResult<PathBuf> {
        let parent = self.paths.cgroup_parent();
        Self::enable_controllers(&self.paths.cgroup_root);
        match std::fs::create_dir(&parent) {
            Ok(()) => {
                tracing::debug!(path = %parent.display(), "Created parent cgroup");
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(permission_or_io("create parent cgroup", e)),
        }
        Self::enable_controllers(&parent);
        Ok(parent)
    }

    fn apply_limits(path: &Path, limits: &ResourceLimits) -> SkiffResult<()> {
        let mut writes: Vec<(&str, String)> = Vec::new();
        if let Some(max) = limits.memory_bytes {
            writes.push(("memory.max", max.to_string()));
        }
        if let Some(weight) = limits.cpu_weight {
            writes.push(("cpu.weight", weight.to_string()));
        }
        if limits.cpu_quota.is_some() {
            writes.push(("cpu.max", resource::cpu_max_line(limits.cpu_quota)));
        }
        if let Some(max) = limits.pids_max {
            writes.push(("pids.max", max.to_string()));
        }

        for (file, value) in writes {
            let control = path.join(file);
            write_control(&control, &value).map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => SkiffError::LimitUnsupported {
                    limit: file.to_string(),
                    path: control.clone(),
                },
                _ => permission_or_io(&format!("write {file}"), e),
            })?;
            tracing::debug!(file, value, "Set cgroup limit");
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceController for CgroupManager {
    async fn create(&self, id: &ContainerId, limits: &ResourceLimits) -> SkiffResult<ResourceGroup> {
        let path = self.paths.cgroup(id.as_str());

        let created = {
            let _guard = self.create_lock.lock();
            self.ensure_parent()?;
            match std::fs::create_dir(&path) {
                Ok(()) => true,
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let pids = member_count(&path);
                    if pids > 0 {
                        return Err(SkiffError::GroupBusy { path, pids });
                    }
                    tracing::warn!(path = %path.display(), "Reusing empty stale cgroup");
                    false
                }
                Err(e) => return Err(permission_or_io("create cgroup", e)),
            }
        };

        if let Err(err) = Self::apply_limits(&path, limits) {
            if created {
                if let Err(e) = std::fs::remove_dir(&path) {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove partial cgroup");
                }
            }
            return Err(err);
        }

        tracing::debug!(
            container_id = %id,
            path = %path.display(),
            "Created cgroup"
        );
        Ok(ResourceGroup {
            id: id.clone(),
            path,
        })
    }

    async fn attach(&self, group: &ResourceGroup, pid: u32) -> SkiffResult<()> {
        write_control(&group.path.join("cgroup.procs"), &pid.to_string()).map_err(|source| {
            SkiffError::AttachFailure {
                pid,
                path: group.path.clone(),
                source,
            }
        })?;

        tracing::debug!(
            container_id = %group.id,
            pid = pid,
            "Added process to cgroup"
        );
        Ok(())
    }

    async fn destroy(&self, group: &ResourceGroup) -> SkiffResult<()> {
        if !group.path.exists() {
            return Ok(());
        }

        let deadline = tokio::time::Instant::now() + self.drain_timeout;
        let mut pids = member_count(&group.path);
        while pids > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(DRAIN_POLL).await;
            pids = member_count(&group.path);
        }
        if pids > 0 {
            return Err(SkiffError::GroupBusy {
                path: group.path.clone(),
                pids,
            });
        }

        match std::fs::remove_dir(&group.path) {
            Ok(()) => {
                tracing::debug!(
                    container_id = %group.id,
                    path = %group.path.display(),
                    "Deleted cgroup"
                );
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => Err(SkiffError::GroupBusy {
                path: group.path.clone(),
                pids: member_count(&group.path),
            }),
            Err(e) => Err(permission_or_io("remove cgroup", e)),
        }
    }

    async fn limit_events(&self, group: &ResourceGroup) -> SkiffResult<LimitEvents> {
        Ok(LimitEvents {
            oom_kill: read_counter(&group.path.join("memory.events"), "oom_kill"),
            pids_max: read_counter(&group.path.join("pids.events"), "max"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_common::ErrorKind;

    fn manager(root: &Path) -> CgroupManager {
        CgroupManager::new(SkiffPaths::new().with_cgroup_root(root))
            .with_drain_timeout(Duration::from_millis(50))
    }

    /// Lay out the control files a real cgroupfs would show for `id`.
    fn fake_group(root: &Path, id: &str) -> PathBuf {
        let dir = root.join("skiff").join(id);
        std::fs::create_dir_all(&dir).unwrap();
        for file in ["memory.max", "cpu.weight", "cpu.max", "pids.max", "cgroup.procs"] {
            std::fs::write(dir.join(file), "").unwrap();
        }
        dir
    }

    #[tokio::test]
    async fn writes_limits_to_control_files() {
        let root = tempfile::tempdir().unwrap();
        let dir = fake_group(root.path(), "c1");
        let limits = ResourceLimits {
            memory_bytes: Some(64 * 1024 * 1024),
            cpu_weight: Some(200),
            cpu_quota: Some(500),
            pids_max: Some(32),
        };

        let group = manager(root.path())
            .create(&ContainerId::from_sequence(1), &limits)
            .await
            .unwrap();
        assert_eq!(group.path, dir);

        let read = |f: &str| std::fs::read_to_string(dir.join(f)).unwrap();
        assert_eq!(read("memory.max"), "67108864");
        assert_eq!(read("cpu.weight"), "200");
        assert_eq!(read("cpu.max"), "50000 100000");
        assert_eq!(read("pids.max"), "32");
    }

    #[tokio::test]
    async fn missing_controller_is_unsupported_and_cleaned_up() {
        let root = tempfile::tempdir().unwrap();
        let limits = ResourceLimits {
            pids_max: Some(10),
            ..ResourceLimits::default()
        };

        let err = manager(root.path())
            .create(&ContainerId::from_sequence(2), &limits)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LimitUnsupported);
        assert!(!root.path().join("skiff/c2").exists());
    }

    #[tokio::test]
    async fn unlimited_group_round_trip() {
        let root = tempfile::tempdir().unwrap();
        let m = manager(root.path());
        let group = m
            .create(&ContainerId::from_sequence(3), &ResourceLimits::default())
            .await
            .unwrap();
        assert!(group.path.is_dir());

        m.destroy(&group).await.unwrap();
        assert!(!group.path.exists());
        // already gone
        m.destroy(&group).await.unwrap();
    }

    #[tokio::test]
    async fn populated_group_is_busy() {
        let root = tempfile::tempdir().unwrap();
        let dir = fake_group(root.path(), "c4");
        let m = manager(root.path());
        let group = m
            .create(&ContainerId::from_sequence(4), &ResourceLimits::default())
            .await
            .unwrap();

        m.attach(&group, 4242).await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.join("cgroup.procs")).unwrap(), "4242");

        let err = m.destroy(&group).await.unwrap_err();
        assert!(matches!(err, SkiffError::GroupBusy { pids: 1, .. }));
    }

    #[tokio::test]
    async fn populated_stale_group_is_refused() {
        let root = tempfile::tempdir().unwrap();
        let dir = fake_group(root.path(), "c7");
        std::fs::write(dir.join("cgroup.procs"), "31337\n").unwrap();

        let err = manager(root.path())
            .create(&ContainerId::from_sequence(7), &ResourceLimits::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SkiffError::GroupBusy { pids: 1, .. }));
        // left for whoever owns it
        assert!(dir.is_dir());
        assert_eq!(std::fs::read_to_string(dir.join("cgroup.procs")).unwrap(), "31337\n");
    }

    #[tokio::test]
    async fn failed_limits_keep_preexisting_group() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("skiff/c8");
        std::fs::create_dir_all(&dir).unwrap();
        let limits = ResourceLimits {
            pids_max: Some(10),
            ..ResourceLimits::default()
        };

        let err = manager(root.path())
            .create(&ContainerId::from_sequence(8), &limits)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LimitUnsupported);
        assert!(dir.is_dir());
    }

    #[tokio::test]
    async fn attach_without_group_fails() {
        let root = tempfile::tempdir().unwrap();
        let group = ResourceGroup {
            id: ContainerId::from_sequence(5),
            path: root.path().join("skiff/c5"),
        };
        let err = manager(root.path()).attach(&group, 1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AttachFailure);
    }

    #[tokio::test]
    async fn reads_limit_events() {
        let root = tempfile::tempdir().unwrap();
        let dir = fake_group(root.path(), "c6");
        std::fs::write(
            dir.join("memory.events"),
            "low 0\nhigh 0\nmax 3\noom 1\noom_kill 1\n",
        )
        .unwrap();
        std::fs::write(dir.join("pids.events"), "max 7\n").unwrap();

        let group = ResourceGroup {
            id: ContainerId::from_sequence(6),
            path: dir,
        };
        let events = manager(root.path()).limit_events(&group).await.unwrap();
        assert_eq!(events, LimitEvents { oom_kill: 1, pids_max: 7 });
    }
}
