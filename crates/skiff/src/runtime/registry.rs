//! Process-wide container table.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use skiff_common::{ContainerId, ExitStatus, SkiffError, SkiffResult};
use tokio::sync::{OwnedMutexGuard, broadcast};

use super::events::{EventBus, RuntimeEvent};
use super::state::{Container, ContainerStatus};
use super::{ContainerSpec, ContainerSupervisor, HostServices, RuntimeConfig};

#[derive(Clone)]
struct Entry {
    seq: u64,
    supervisor: ContainerSupervisor,
    guard: Arc<tokio::sync::Mutex<()>>,
}

/// Every container known to this process, keyed by ID.
pub struct ContainerRegistry {
    host: HostServices,
    config: Arc<RuntimeConfig>,
    events: EventBus,
    containers: DashMap<ContainerId, Entry>,
    next_seq: AtomicU64,
}

impl std::fmt::Debug for ContainerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerRegistry")
            .field("containers", &self.containers.len())
            .finish_non_exhaustive()
    }
}

impl ContainerRegistry {
    /// Registry creating containers through `host`.
    #[must_use]
    pub fn new(host: HostServices, config: RuntimeConfig) -> Self {
        Self {
            host,
            config: Arc::new(config),
            events: EventBus::new(),
            containers: DashMap::new(),
            next_seq: AtomicU64::new(1),
        }
    }

    /// The configuration containers are created with.
    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Lifecycle events of every container.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }

    /// Validate `spec` and register a new container in `Created`.
    ///
    /// The ID is only allocated once validation passes.
    ///
    /// # Errors
    ///
    /// [`SkiffError::InvalidSpec`] or [`SkiffError::PathEscape`].
    pub fn submit(&self, spec: ContainerSpec) -> SkiffResult<ContainerId> {
        ContainerSupervisor::validate(&spec, &self.config)?;

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let id = ContainerId::from_sequence(seq);
        let supervisor = ContainerSupervisor::create(
            id.clone(),
            spec,
            self.host.clone(),
            Arc::clone(&self.config),
            self.events.clone(),
        )?;

        self.containers.insert(
            id.clone(),
            Entry {
                seq,
                supervisor,
                guard: Arc::new(tokio::sync::Mutex::new(())),
            },
        );
        Ok(id)
    }

    fn entry(&self, id: &ContainerId) -> SkiffResult<Entry> {
        self.containers
            .get(id)
            .map(|e| e.value().clone())
            .ok_or_else(|| SkiffError::NotFound { id: id.to_string() })
    }

    /// Look up `id` and take its operation guard without waiting.
    fn exclusive(&self, id: &ContainerId) -> SkiffResult<(ContainerSupervisor, OwnedMutexGuard<()>)> {
        let entry = self.entry(id)?;
        let guard = Arc::clone(&entry.guard)
            .try_lock_owned()
            .map_err(|_| SkiffError::OperationInProgress { id: id.to_string() })?;
        Ok((entry.supervisor, guard))
    }

    /// Snapshot of one container.
    ///
    /// # Errors
    ///
    /// [`SkiffError::NotFound`] for an unknown ID.
    pub fn get(&self, id: &ContainerId) -> SkiffResult<Container> {
        Ok(self.entry(id)?.supervisor.snapshot())
    }

    /// Snapshots of every container in submission order.
    #[must_use]
    pub fn list(&self) -> Vec<Container> {
        let mut entries: Vec<Entry> = self.containers.iter().map(|e| e.value().clone()).collect();
        entries.sort_by_key(|e| e.seq);
        entries.iter().map(|e| e.supervisor.snapshot()).collect()
    }

    /// Start a container.
    ///
    /// # Errors
    ///
    /// [`SkiffError::NotFound`], [`SkiffError::OperationInProgress`], or
    /// anything [`ContainerSupervisor::start`] returns.
    pub async fn start(&self, id: &ContainerId) -> SkiffResult<()> {
        let (supervisor, _guard) = self.exclusive(id)?;
        supervisor.start().await
    }

    /// Wait for a container's entry process. Not serialized with other
    /// operations.
    ///
    /// # Errors
    ///
    /// [`SkiffError::NotFound`] or [`SkiffError::NotRunning`].
    pub async fn wait(&self, id: &ContainerId) -> SkiffResult<ExitStatus> {
        let supervisor = self.entry(id)?.supervisor;
        supervisor.wait().await
    }

    /// Stop a container, using the configured timeout when `timeout` is
    /// `None`.
    ///
    /// # Errors
    ///
    /// [`SkiffError::NotFound`], [`SkiffError::OperationInProgress`] or
    /// [`SkiffError::AlreadyStopped`].
    pub async fn stop(&self, id: &ContainerId, timeout: Option<Duration>) -> SkiffResult<ExitStatus> {
        let (supervisor, _guard) = self.exclusive(id)?;
        supervisor
            .stop(timeout.unwrap_or_else(|| self.config.stop_timeout()))
            .await
    }

    /// Release a container's resources.
    ///
    /// # Errors
    ///
    /// [`SkiffError::NotFound`], [`SkiffError::OperationInProgress`],
    /// [`SkiffError::NotStopped`] or a release failure.
    pub async fn destroy(&self, id: &ContainerId) -> SkiffResult<()> {
        let (supervisor, _guard) = self.exclusive(id)?;
        supervisor.destroy().await
    }

    /// Drop a destroyed container from the table.
    ///
    /// # Errors
    ///
    /// [`SkiffError::NotFound`], [`SkiffError::OperationInProgress`] or
    /// [`SkiffError::NotDestroyed`].
    pub fn remove(&self, id: &ContainerId) -> SkiffResult<()> {
        let (supervisor, _guard) = self.exclusive(id)?;
        let status = supervisor.status();
        if status != ContainerStatus::Destroyed {
            return Err(SkiffError::NotDestroyed {
                id: id.to_string(),
                status: status.to_string(),
            });
        }

        self.containers.remove(id);
        self.events.publish(RuntimeEvent::Removed {
            id: id.clone(),
            timestamp: Utc::now(),
        });
        tracing::debug!(container_id = %id, "Container removed");
        Ok(())
    }
}
