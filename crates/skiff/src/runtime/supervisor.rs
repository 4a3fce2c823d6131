//! Per-container lifecycle.
//!
//! A supervisor owns one container from submission to teardown. Start walks
//! the acquisition order (namespaces, rootfs, resource group, network) and
//! records every success in an [`AcquisitionLog`]; a failure at any step
//! aborts the paused init and unwinds the log. Once the entry process runs, a
//! monitor task reaps it and publishes the exit status to every waiter.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use skiff_common::exit::SIGKILL;
use skiff_common::{ContainerId, ExitStatus, SkiffError, SkiffResult};
use tokio::sync::watch;

use super::acquisition::{Acquired, AcquisitionLog};
use super::events::{EventBus, RuntimeEvent};
use super::lifecycle::LifecyclePhase;
use super::state::{Container, ContainerStatus};
use super::{ContainerSpec, HostServices, NetworkRequest, RuntimeConfig};
use crate::cgroup::ResourceGroup;
use crate::exec::{EntryProcess, LaunchSpec, RawExit};
use crate::namespace::NamespaceKind;

/// Record plus the stop bookkeeping the monitor needs to classify an exit.
#[derive(Debug)]
struct Shared {
    record: Container,
    stop_requested: bool,
    stop_forced: bool,
}

/// State only touched while holding the lifecycle lock.
#[derive(Default)]
struct Lifecycle {
    log: AcquisitionLog,
    entry: Option<Arc<dyn EntryProcess>>,
}

struct Inner {
    id: ContainerId,
    spec: ContainerSpec,
    host: HostServices,
    config: Arc<RuntimeConfig>,
    events: EventBus,
    shared: Mutex<Shared>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
    exit_tx: watch::Sender<Option<ExitStatus>>,
}

/// Drives one container through its lifecycle.
#[derive(Clone)]
pub struct ContainerSupervisor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ContainerSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerSupervisor")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

fn join_error(err: tokio::task::JoinError) -> SkiffError {
    SkiffError::internal(format!("Task join error: {err}"))
}

impl ContainerSupervisor {
    /// Check `spec` against the host and `config` without acquiring anything.
    ///
    /// # Errors
    ///
    /// [`SkiffError::InvalidSpec`] or [`SkiffError::PathEscape`].
    pub fn validate(spec: &ContainerSpec, config: &RuntimeConfig) -> SkiffResult<()> {
        spec.validate()?;
        if spec.network.is_enabled() && !config.namespaces.contains(NamespaceKind::Net) {
            return Err(SkiffError::invalid_spec(
                "networking requires the network namespace",
            ));
        }
        Ok(())
    }

    /// Validate `spec` and create a supervisor in `Created`.
    ///
    /// # Errors
    ///
    /// See [`ContainerSupervisor::validate`].
    pub fn create(
        id: ContainerId,
        spec: ContainerSpec,
        host: HostServices,
        config: Arc<RuntimeConfig>,
        events: EventBus,
    ) -> SkiffResult<Self> {
        Self::validate(&spec, &config)?;

        let record = Container::new(id.clone(), spec.clone());
        let (exit_tx, _) = watch::channel(None);
        events.publish(RuntimeEvent::Created {
            id: id.clone(),
            timestamp: record.created_at,
        });
        tracing::info!(container_id = %id, rootfs = %spec.rootfs.display(), "Container created");

        Ok(Self {
            inner: Arc::new(Inner {
                id,
                spec,
                host,
                config,
                events,
                shared: Mutex::new(Shared {
                    record,
                    stop_requested: false,
                    stop_forced: false,
                }),
                lifecycle: tokio::sync::Mutex::new(Lifecycle::default()),
                exit_tx,
            }),
        })
    }

    /// Container ID.
    #[must_use]
    pub fn id(&self) -> &ContainerId {
        &self.inner.id
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> ContainerStatus {
        self.inner.shared.lock().record.status
    }

    /// Copy of the container record.
    #[must_use]
    pub fn snapshot(&self) -> Container {
        self.inner.shared.lock().record.clone()
    }

    fn set_status(&self, status: ContainerStatus) {
        self.inner.shared.lock().record.status = status;
    }

    fn describe(&self, log: &AcquisitionLog) {
        log.describe(&mut self.inner.shared.lock().record);
    }

    /// Acquire every resource and launch the entry command.
    ///
    /// # Errors
    ///
    /// - [`SkiffError::AlreadyStarted`] unless the container is `Created`
    /// - a phase error (`NamespaceFailure`, `MountFailure`,
    ///   `ResourceLimitFailure`, `NetworkFailure`) wrapping the leaf cause
    /// - [`SkiffError::ExecFailure`] if the entry command cannot be executed
    ///
    /// On error everything acquired by this call has been released (or is
    /// kept for `destroy` if its release failed) and the status is `Failed`.
    pub async fn start(&self) -> SkiffResult<()> {
        let inner = &self.inner;
        let mut lifecycle = inner.lifecycle.lock().await;
        {
            let mut shared = inner.shared.lock();
            let status = shared.record.status;
            if !status.can_start() {
                return Err(SkiffError::AlreadyStarted {
                    id: inner.id.to_string(),
                    status: status.to_string(),
                });
            }
            shared.record.status = ContainerStatus::Starting;
        }
        tracing::info!(container_id = %inner.id, "Starting container");

        match self.acquire(&mut lifecycle).await {
            Ok(entry) => {
                let pid = entry.pid();
                lifecycle.entry = Some(Arc::clone(&entry));
                {
                    let mut shared = inner.shared.lock();
                    lifecycle.log.describe(&mut shared.record);
                    shared.record.status = ContainerStatus::Running;
                    shared.record.pid = Some(pid);
                    shared.record.started_at = Some(Utc::now());
                }
                tokio::spawn(monitor(Arc::clone(inner), entry));

                inner.events.publish(RuntimeEvent::Started {
                    id: inner.id.clone(),
                    pid,
                    timestamp: Utc::now(),
                });
                tracing::info!(container_id = %inner.id, pid, "Container running");
                Ok(())
            }
            Err((phase, err)) => {
                tracing::warn!(
                    container_id = %inner.id,
                    %phase,
                    error = %err,
                    "Start failed, rolling back"
                );
                self.rollback(&mut lifecycle).await;

                let err = phase.wrap(err);
                inner.shared.lock().record.status = ContainerStatus::Failed;
                inner.events.publish(RuntimeEvent::Failed {
                    id: inner.id.clone(),
                    reason: err.to_string(),
                    timestamp: Utc::now(),
                });
                Err(err)
            }
        }
    }

    async fn acquire(
        &self,
        lifecycle: &mut Lifecycle,
    ) -> Result<Arc<dyn EntryProcess>, (LifecyclePhase, SkiffError)> {
        let inner = &self.inner;
        let host = &inner.host;
        let log = &mut lifecycle.log;

        let launch = LaunchSpec::for_container(&inner.id, &inner.spec);
        let set = host
            .isolator
            .create(&inner.config.namespaces, &launch)
            .await
            .map_err(|e| (LifecyclePhase::Namespaces, e))?;
        let pid = set.pid();
        log.push(Acquired::Namespaces(set));
        self.describe(log);

        let phase = LifecyclePhase::Rootfs;
        let ns = log
            .namespaces()
            .ok_or_else(|| (phase, SkiffError::internal("namespace set missing")))?;
        let root = host
            .mounter
            .prepare(&inner.spec.rootfs, &inner.spec.mounts, ns)
            .await
            .map_err(|e| (phase, e))?;
        log.push(Acquired::Rootfs(root));
        self.describe(log);

        let phase = LifecyclePhase::ResourceGroup;
        let group = host
            .resources
            .create(&inner.id, &inner.spec.limits)
            .await
            .map_err(|e| (phase, e))?;
        log.push(Acquired::ResourceGroup(group.clone()));
        self.describe(log);
        host.resources
            .attach(&group, pid)
            .await
            .map_err(|e| (phase, e))?;

        if let NetworkRequest::Enabled { address } = inner.spec.network {
            let phase = LifecyclePhase::Network;
            let netns = log
                .namespaces()
                .and_then(|ns| ns.netns())
                .ok_or_else(|| (phase, SkiffError::internal("network namespace missing")))?;
            let binding = host
                .network
                .attach(&inner.id, &netns, address)
                .await
                .map_err(|e| (phase, e))?;
            log.push(Acquired::Network(binding));
            self.describe(log);
        }

        let phase = LifecyclePhase::Exec;
        let init = log
            .namespaces_mut()
            .and_then(|ns| ns.take_init())
            .ok_or_else(|| (phase, SkiffError::internal("container init already taken")))?;
        tokio::task::spawn_blocking(move || init.launch())
            .await
            .map_err(|e| (phase, join_error(e)))?
            .map_err(|e| (phase, e))
    }

    /// Kill the paused init, then release everything in reverse.
    async fn rollback(&self, lifecycle: &mut Lifecycle) {
        if let Some(init) = lifecycle.log.namespaces_mut().and_then(|ns| ns.take_init()) {
            if let Err(e) = tokio::task::spawn_blocking(move || init.abort()).await {
                tracing::warn!(error = %e, "Failed to abort container init");
            }
        }

        let errors = lifecycle.log.unwind(&self.inner.host).await;
        if !errors.is_empty() {
            tracing::warn!(
                container_id = %self.inner.id,
                failures = errors.len(),
                remaining = lifecycle.log.len(),
                "Rollback left resources for destroy"
            );
        }
        self.describe(&lifecycle.log);
    }

    /// Wait for the entry process to terminate.
    ///
    /// Every waiter observes the same status; waiting after termination
    /// returns it immediately.
    ///
    /// # Errors
    ///
    /// [`SkiffError::NotRunning`] if the entry process never launched.
    pub async fn wait(&self) -> SkiffResult<ExitStatus> {
        let mut rx = self.inner.exit_tx.subscribe();
        {
            let shared = self.inner.shared.lock();
            if let Some(exit) = shared.record.exit {
                return Ok(exit);
            }
            let status = shared.record.status;
            if !matches!(status, ContainerStatus::Running | ContainerStatus::Stopping) {
                return Err(SkiffError::NotRunning {
                    id: self.inner.id.to_string(),
                    status: status.to_string(),
                });
            }
        }

        let exit = rx
            .wait_for(Option::is_some)
            .await
            .map(|status| *status)
            .map_err(|e| SkiffError::internal(format!("exit channel closed: {e}")))?;
        exit.ok_or_else(|| SkiffError::internal("exit status missing"))
    }

    /// Stop the entry process: SIGTERM, then SIGKILL once `timeout` passes.
    ///
    /// # Errors
    ///
    /// [`SkiffError::AlreadyStopped`] unless the container is `Running`,
    /// carrying the terminal status when there is one.
    ///
    /// The container reaches `Stopped` when the entry process is reaped,
    /// whether or not this future is still polled.
    pub async fn stop(&self, timeout: Duration) -> SkiffResult<ExitStatus> {
        let inner = &self.inner;
        let lifecycle = inner.lifecycle.lock().await;
        {
            let mut shared = inner.shared.lock();
            if !shared.record.status.can_stop() {
                return Err(SkiffError::AlreadyStopped {
                    id: inner.id.to_string(),
                    exit: shared.record.exit,
                });
            }
            shared.record.status = ContainerStatus::Stopping;
            shared.stop_requested = true;
        }

        let entry = lifecycle
            .entry
            .clone()
            .ok_or_else(|| SkiffError::internal("running container has no entry process"))?;
        let mut rx = inner.exit_tx.subscribe();

        tracing::info!(
            container_id = %inner.id,
            timeout_secs = timeout.as_secs_f64(),
            "Stopping container"
        );
        if let Err(e) = entry.signal(libc::SIGTERM) {
            tracing::warn!(container_id = %inner.id, error = %e, "Failed to send SIGTERM");
        }

        let graceful = tokio::time::timeout(timeout, async {
            rx.wait_for(Option::is_some).await.map(|s| *s)
        })
        .await;

        let exit = match graceful {
            Ok(result) => result,
            Err(_) => {
                tracing::info!(container_id = %inner.id, "Stop timeout elapsed, sending SIGKILL");
                inner.shared.lock().stop_forced = true;
                entry.signal(SIGKILL)?;
                rx.wait_for(Option::is_some).await.map(|s| *s)
            }
        }
        .map_err(|e| SkiffError::internal(format!("exit channel closed: {e}")))?
        .ok_or_else(|| SkiffError::internal("exit status missing"))?;

        tracing::info!(container_id = %inner.id, %exit, "Container stopped");
        Ok(exit)
    }

    /// Release every resource the container holds.
    ///
    /// Legal from `Created`, `Stopped` and `Failed`; destroying a destroyed
    /// container is a no-op.
    ///
    /// # Errors
    ///
    /// - [`SkiffError::NotStopped`] while the entry process may be alive
    /// - the first release failure; what failed stays held and a later
    ///   destroy retries it
    pub async fn destroy(&self) -> SkiffResult<()> {
        let inner = &self.inner;
        let mut lifecycle = inner.lifecycle.lock().await;

        let status = self.status();
        if status == ContainerStatus::Destroyed {
            return Ok(());
        }
        if !status.can_destroy() {
            return Err(SkiffError::NotStopped {
                id: inner.id.to_string(),
                status: status.to_string(),
            });
        }

        tracing::debug!(container_id = %inner.id, held = lifecycle.log.len(), "Destroying container");
        let errors = lifecycle.log.unwind(&inner.host).await;
        self.describe(&lifecycle.log);

        if let Some(err) = errors.into_iter().next() {
            tracing::warn!(container_id = %inner.id, error = %err, "Destroy incomplete");
            return Err(err);
        }

        lifecycle.entry = None;
        self.set_status(ContainerStatus::Destroyed);
        inner.events.publish(RuntimeEvent::Destroyed {
            id: inner.id.clone(),
            timestamp: Utc::now(),
        });
        tracing::info!(container_id = %inner.id, "Container destroyed");
        Ok(())
    }
}

/// Reap the entry process and publish how it ended.
async fn monitor(inner: Arc<Inner>, entry: Arc<dyn EntryProcess>) {
    let pid = entry.pid();
    let raw = match tokio::task::spawn_blocking(move || entry.wait()).await {
        Ok(Ok(raw)) => raw,
        Ok(Err(e)) => {
            tracing::warn!(container_id = %inner.id, pid, error = %e, "Failed to reap entry process");
            RawExit::Exited(255)
        }
        Err(e) => {
            tracing::warn!(container_id = %inner.id, pid, error = %e, "Monitor task failed");
            RawExit::Exited(255)
        }
    };

    let group = inner
        .shared
        .lock()
        .record
        .resource_group
        .clone()
        .map(|path| ResourceGroup {
            id: inner.id.clone(),
            path,
        });
    let oom_killed = match (&group, raw) {
        (Some(group), RawExit::Signaled(SIGKILL)) => inner
            .host
            .resources
            .limit_events(group)
            .await
            .map(|events| events.oom_kill > 0)
            .unwrap_or(false),
        _ => false,
    };

    // The monitor owns the transition to Stopped: a stop that never returns
    // must not strand the container in Stopping.
    let (exit, was_stopping) = {
        let mut shared = inner.shared.lock();
        let exit = classify(raw, shared.stop_requested, shared.stop_forced, oom_killed);
        shared.record.exit = Some(exit);
        shared.record.finished_at = Some(Utc::now());
        let was_stopping = shared.record.status == ContainerStatus::Stopping;
        if matches!(
            shared.record.status,
            ContainerStatus::Running | ContainerStatus::Stopping
        ) {
            shared.record.status = ContainerStatus::Stopped;
        }
        (exit, was_stopping)
    };

    inner.exit_tx.send_replace(Some(exit));
    inner.events.publish(RuntimeEvent::Exited {
        id: inner.id.clone(),
        status: exit,
        timestamp: Utc::now(),
    });
    if was_stopping {
        inner.events.publish(RuntimeEvent::Stopped {
            id: inner.id.clone(),
            status: exit,
            timestamp: Utc::now(),
        });
    }
    tracing::info!(container_id = %inner.id, pid, %exit, "Entry process exited");
}

/// Turn a raw wait status into the recorded termination.
///
/// A signal death during a requested stop is a stop, forced when it was the
/// escalation SIGKILL. Otherwise a SIGKILL while the group recorded an OOM
/// kill is a resource limit termination.
fn classify(raw: RawExit, stop_requested: bool, stop_forced: bool, oom_killed: bool) -> ExitStatus {
    match raw {
        RawExit::Exited(code) => ExitStatus::exited(code),
        RawExit::Signaled(signal) if stop_requested => {
            ExitStatus::stopped(signal, stop_forced && signal == SIGKILL)
        }
        RawExit::Signaled(SIGKILL) if oom_killed => ExitStatus::resource_limit(SIGKILL),
        RawExit::Signaled(signal) => ExitStatus::signaled(signal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_common::Termination;

    #[test]
    fn classifies_terminations() {
        assert_eq!(classify(RawExit::Exited(0), false, false, false), ExitStatus::exited(0));
        assert_eq!(classify(RawExit::Exited(0), true, false, false), ExitStatus::exited(0));
        assert_eq!(
            classify(RawExit::Signaled(15), true, false, false).termination,
            Termination::Stopped { signal: 15, forced: false }
        );
        assert_eq!(
            classify(RawExit::Signaled(SIGKILL), true, true, true).termination,
            Termination::Stopped { signal: SIGKILL, forced: true }
        );
        assert_eq!(
            classify(RawExit::Signaled(SIGKILL), false, false, true),
            ExitStatus::resource_limit(SIGKILL)
        );
        assert_eq!(classify(RawExit::Signaled(SIGKILL), false, false, false), ExitStatus::signaled(SIGKILL));
    }
}
