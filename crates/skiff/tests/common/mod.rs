//! In-process fakes for the host services.
//!
//! Each fake counts what it hands out so tests can assert that every
//! acquisition is matched by exactly one release, and can be told to fail at
//! a chosen step.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Condvar, Mutex};
use skiff::cgroup::{LimitEvents, ResourceController, ResourceGroup};
use skiff::exec::{EntryProcess, InitProcess, LaunchSpec, RawExit};
use skiff::filesystem::{MountExecutor, MountOp, RootfsMounter};
use skiff::namespace::{NamespaceConfig, NamespaceHandle, NamespaceIsolator, NamespaceSet};
use skiff::runtime::{ContainerRegistry, HostServices, RuntimeConfig};
use skiff_common::{ContainerId, SkiffError, SkiffResult};
use skiff_network::{AddressPool, NetnsRef, NetworkBinding, NetworkBridge, Subnet, VethPair};

const SIGKILL: i32 = libc::SIGKILL;
const SIGTERM: i32 = libc::SIGTERM;

/// How a fake entry process behaves once launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Exit right away with a code.
    ExitImmediately(i32),
    /// Run until signalled. SIGKILL always ends it; SIGTERM only if honored.
    RunUntilSignaled { honors_term: bool },
    /// Get killed by the kernel for exceeding a limit.
    KilledByLimit,
}

/// A fake entry process blocking `wait` on a condition variable.
pub struct FakeEntry {
    pid: u32,
    behavior: Behavior,
    exit: Mutex<Option<RawExit>>,
    exited: Condvar,
    signals: Mutex<Vec<i32>>,
}

impl FakeEntry {
    fn new(pid: u32, behavior: Behavior) -> Self {
        let exit = match behavior {
            Behavior::ExitImmediately(code) => Some(RawExit::Exited(code)),
            Behavior::KilledByLimit => Some(RawExit::Signaled(SIGKILL)),
            Behavior::RunUntilSignaled { .. } => None,
        };
        Self {
            pid,
            behavior,
            exit: Mutex::new(exit),
            exited: Condvar::new(),
            signals: Mutex::new(Vec::new()),
        }
    }

    /// Let a running process exit on its own.
    pub fn finish(&self, code: i32) {
        let mut exit = self.exit.lock();
        if exit.is_none() {
            *exit = Some(RawExit::Exited(code));
            self.exited.notify_all();
        }
    }

    /// Signals delivered so far.
    pub fn signals(&self) -> Vec<i32> {
        self.signals.lock().clone()
    }
}

impl EntryProcess for FakeEntry {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn signal(&self, signal: i32) -> SkiffResult<()> {
        self.signals.lock().push(signal);
        let mut exit = self.exit.lock();
        if exit.is_some() {
            return Ok(());
        }
        let dies = match self.behavior {
            Behavior::RunUntilSignaled { honors_term } => {
                signal == SIGKILL || (signal == SIGTERM && honors_term)
            }
            _ => true,
        };
        if dies {
            *exit = Some(RawExit::Signaled(signal));
            self.exited.notify_all();
        }
        Ok(())
    }

    fn wait(&self) -> SkiffResult<RawExit> {
        let mut exit = self.exit.lock();
        loop {
            if let Some(raw) = *exit {
                return Ok(raw);
            }
            self.exited.wait(&mut exit);
        }
    }
}

struct FakeInit {
    pid: u32,
    isolator: Arc<IsolatorState>,
    command: String,
}

impl InitProcess for FakeInit {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn launch(self: Box<Self>) -> SkiffResult<Arc<dyn EntryProcess>> {
        self.isolator.paused.fetch_sub(1, Ordering::SeqCst);
        if let Some(errno) = *self.isolator.exec_errno.lock() {
            return Err(SkiffError::ExecFailure {
                command: self.command.clone(),
                source: std::io::Error::from_raw_os_error(errno),
            });
        }
        let entry = Arc::new(FakeEntry::new(self.pid, self.isolator.behavior()));
        self.isolator.entries.lock().push(Arc::clone(&entry));
        Ok(entry)
    }

    fn abort(self: Box<Self>) {
        self.isolator.paused.fetch_sub(1, Ordering::SeqCst);
        self.isolator.aborted.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct IsolatorState {
    live: AtomicUsize,
    paused: AtomicUsize,
    aborted: AtomicUsize,
    fail: AtomicBool,
    next_pid: AtomicU32,
    behavior: Mutex<Option<Behavior>>,
    exec_errno: Mutex<Option<i32>>,
    entries: Mutex<Vec<Arc<FakeEntry>>>,
    launches: Mutex<Vec<LaunchSpec>>,
}

impl IsolatorState {
    fn behavior(&self) -> Behavior {
        self.behavior.lock().unwrap_or(Behavior::ExitImmediately(0))
    }
}

/// Fake namespace isolator handing out detached handles.
#[derive(Clone, Default)]
pub struct FakeIsolator {
    state: Arc<IsolatorState>,
}

impl FakeIsolator {
    pub fn set_behavior(&self, behavior: Behavior) {
        *self.state.behavior.lock() = Some(behavior);
    }

    pub fn fail_create(&self) {
        self.state.fail.store(true, Ordering::SeqCst);
    }

    pub fn fail_exec(&self, errno: i32) {
        *self.state.exec_errno.lock() = Some(errno);
    }

    /// Namespace sets not yet released.
    pub fn live(&self) -> usize {
        self.state.live.load(Ordering::SeqCst)
    }

    /// Inits neither launched nor aborted.
    pub fn paused(&self) -> usize {
        self.state.paused.load(Ordering::SeqCst)
    }

    pub fn aborted(&self) -> usize {
        self.state.aborted.load(Ordering::SeqCst)
    }

    /// Most recently launched entry process.
    pub fn last_entry(&self) -> Option<Arc<FakeEntry>> {
        self.state.entries.lock().last().cloned()
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.state.launches.lock().clone()
    }
}

#[async_trait]
impl NamespaceIsolator for FakeIsolator {
    async fn create(&self, config: &NamespaceConfig, launch: &LaunchSpec) -> SkiffResult<NamespaceSet> {
        if self.state.fail.load(Ordering::SeqCst) {
            return Err(SkiffError::PermissionDenied {
                operation: "clone".into(),
            });
        }
        let pid = 1000 + self.state.next_pid.fetch_add(1, Ordering::SeqCst);
        let handles = config
            .kinds()
            .iter()
            .map(|k| NamespaceHandle::detached(*k, format!("/proc/{pid}/ns/{}", k.proc_name())))
            .collect();

        self.state.live.fetch_add(1, Ordering::SeqCst);
        self.state.paused.fetch_add(1, Ordering::SeqCst);
        self.state.launches.lock().push(launch.clone());

        let init = FakeInit {
            pid,
            isolator: Arc::clone(&self.state),
            command: launch.program().to_string(),
        };
        Ok(NamespaceSet::new(Box::new(init), handles))
    }

    async fn release(&self, mut set: NamespaceSet) -> SkiffResult<()> {
        set.abort_init();
        set.close_handles();
        self.state.live.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Fake mount executor tracking the mount table in memory.
#[derive(Default)]
pub struct FakeMounts {
    live: Mutex<BTreeSet<PathBuf>>,
    ops: Mutex<Vec<MountOp>>,
    fail_on: Mutex<Option<PathBuf>>,
    fail_unmount: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl FakeMounts {
    /// Fail the mount whose host-side target ends with `suffix`.
    pub fn fail_on(&self, suffix: impl Into<PathBuf>) {
        *self.fail_on.lock() = Some(suffix.into());
    }

    pub fn fail_unmount(&self, fail: bool) {
        self.fail_unmount.store(fail, Ordering::SeqCst);
    }

    /// Slow every mount step down.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn live(&self) -> usize {
        self.live.lock().len()
    }

    pub fn is_mounted(&self, target: &Path) -> bool {
        self.live.lock().contains(target)
    }

    pub fn ops(&self) -> Vec<MountOp> {
        self.ops.lock().clone()
    }
}

#[async_trait]
impl MountExecutor for FakeMounts {
    async fn apply(&self, _ns: &NamespaceSet, op: &MountOp) -> SkiffResult<()> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.ops.lock().push(op.clone());

        if let MountOp::Unmount { target } = op {
            if self.fail_unmount.load(Ordering::SeqCst) {
                return Err(SkiffError::Io(std::io::Error::other("umount: target is busy")));
            }
            self.live.lock().remove(target);
            return Ok(());
        }

        if let Some(target) = op.mount_target() {
            let fail = self.fail_on.lock().clone();
            if fail.is_some_and(|suffix| target.ends_with(suffix)) {
                return Err(SkiffError::PermissionDenied {
                    operation: op.argv().join(" "),
                });
            }
            self.live.lock().insert(target.to_path_buf());
        }
        Ok(())
    }
}

/// Fake resource controller.
#[derive(Default)]
pub struct FakeResources {
    groups: Mutex<HashSet<ContainerId>>,
    attached: Mutex<Vec<(ContainerId, u32)>>,
    fail_create: AtomicBool,
    fail_attach: AtomicBool,
    fail_destroy: AtomicBool,
    oom: AtomicBool,
}

impl FakeResources {
    pub fn fail_create(&self) {
        self.fail_create.store(true, Ordering::SeqCst);
    }

    pub fn fail_attach(&self) {
        self.fail_attach.store(true, Ordering::SeqCst);
    }

    pub fn fail_destroy(&self, fail: bool) {
        self.fail_destroy.store(fail, Ordering::SeqCst);
    }

    /// Report an OOM kill for every group.
    pub fn report_oom(&self) {
        self.oom.store(true, Ordering::SeqCst);
    }

    pub fn live(&self) -> usize {
        self.groups.lock().len()
    }

    pub fn attached(&self) -> Vec<(ContainerId, u32)> {
        self.attached.lock().clone()
    }
}

#[async_trait]
impl ResourceController for FakeResources {
    async fn create(
        &self,
        id: &ContainerId,
        _limits: &skiff::runtime::ResourceLimits,
    ) -> SkiffResult<ResourceGroup> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(SkiffError::LimitUnsupported {
                limit: "memory.max".into(),
                path: PathBuf::from("/fake/cgroup/memory.max"),
            });
        }
        self.groups.lock().insert(id.clone());
        Ok(ResourceGroup {
            id: id.clone(),
            path: PathBuf::from("/fake/cgroup/skiff").join(id.as_str()),
        })
    }

    async fn attach(&self, group: &ResourceGroup, pid: u32) -> SkiffResult<()> {
        if self.fail_attach.load(Ordering::SeqCst) {
            return Err(SkiffError::AttachFailure {
                pid,
                path: group.path.clone(),
                source: std::io::Error::from_raw_os_error(libc::EACCES),
            });
        }
        self.attached.lock().push((group.id.clone(), pid));
        Ok(())
    }

    async fn destroy(&self, group: &ResourceGroup) -> SkiffResult<()> {
        if self.fail_destroy.load(Ordering::SeqCst) {
            return Err(SkiffError::GroupBusy {
                path: group.path.clone(),
                pids: 1,
            });
        }
        self.groups.lock().remove(&group.id);
        Ok(())
    }

    async fn limit_events(&self, _group: &ResourceGroup) -> SkiffResult<LimitEvents> {
        Ok(LimitEvents {
            oom_kill: u64::from(self.oom.load(Ordering::SeqCst)),
            pids_max: 0,
        })
    }
}

/// Fake bridge using a real address pool.
pub struct FakeNetwork {
    pool: Arc<AddressPool>,
    devices: AtomicUsize,
    fail: AtomicBool,
}

impl Default for FakeNetwork {
    fn default() -> Self {
        Self {
            pool: Arc::new(AddressPool::new(Subnet::default())),
            devices: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
        }
    }
}

impl FakeNetwork {
    pub fn fail_devices(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn devices(&self) -> usize {
        self.devices.load(Ordering::SeqCst)
    }

    pub fn addresses_in_use(&self) -> usize {
        self.pool.in_use()
    }
}

#[async_trait]
impl NetworkBridge for FakeNetwork {
    async fn attach(
        &self,
        id: &ContainerId,
        _netns: &NetnsRef,
        requested: Option<Ipv4Addr>,
    ) -> SkiffResult<NetworkBinding> {
        let address = self.pool.reserve(requested)?;
        let veth = VethPair::for_container(id.as_str());
        if self.fail.load(Ordering::SeqCst) {
            self.pool.release(address);
            return Err(SkiffError::DeviceCreateFailure {
                device: veth.host,
                reason: "Operation not permitted".into(),
            });
        }
        // yield so concurrent attaches interleave
        tokio::task::yield_now().await;
        self.devices.fetch_add(1, Ordering::SeqCst);

        let subnet = self.pool.subnet();
        Ok(NetworkBinding {
            host_device: veth.host,
            peer_device: veth.peer,
            container_device: "eth0".into(),
            address,
            prefix: subnet.prefix(),
            gateway: subnet.gateway(),
        })
    }

    async fn detach(&self, binding: &NetworkBinding) -> SkiffResult<()> {
        self.devices.fetch_sub(1, Ordering::SeqCst);
        self.pool.release(binding.address);
        Ok(())
    }
}

/// All fakes wired into one set of host services.
#[derive(Clone, Default)]
pub struct Harness {
    pub isolator: FakeIsolator,
    pub mounts: Arc<FakeMounts>,
    pub resources: Arc<FakeResources>,
    pub network: Arc<FakeNetwork>,
}

impl Harness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn host(&self) -> HostServices {
        HostServices {
            isolator: Arc::new(self.isolator.clone()),
            mounter: RootfsMounter::new(Arc::clone(&self.mounts) as Arc<dyn MountExecutor>),
            resources: Arc::clone(&self.resources) as Arc<dyn ResourceController>,
            network: Arc::clone(&self.network) as Arc<dyn NetworkBridge>,
        }
    }

    pub fn registry(&self) -> ContainerRegistry {
        ContainerRegistry::new(self.host(), RuntimeConfig::default())
    }

    /// Nothing acquired through this harness is still held.
    pub fn assert_clean(&self) {
        assert_eq!(self.isolator.live(), 0, "namespace sets leaked");
        assert_eq!(self.isolator.paused(), 0, "paused inits leaked");
        assert_eq!(self.mounts.live(), 0, "mounts leaked");
        assert_eq!(self.resources.live(), 0, "resource groups leaked");
        assert_eq!(self.network.devices(), 0, "network devices leaked");
        assert_eq!(self.network.addresses_in_use(), 0, "addresses leaked");
    }
}

/// Names in `dir`, sorted.
pub fn listing(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}
