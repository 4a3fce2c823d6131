//! Entry process launch and control.
//!
//! The container's entry command is started in two steps. The namespace
//! isolator clones an init that blocks before running any user code; once
//! every resource is in place the init is released and `execve`s the entry
//! command, becoming the sole initial process of the container.

mod init;
mod process;

use std::path::PathBuf;
use std::sync::Arc;

use skiff_common::{ContainerId, SkiffResult};

use crate::runtime::ContainerSpec;

pub use init::{LinuxInit, spawn_paused};
pub use process::LinuxEntryProcess;

/// `PATH` given to the entry process when the spec sets none.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Everything the paused init needs to become the entry process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Command and arguments.
    pub argv: Vec<String>,
    /// `KEY=VALUE` environment entries.
    pub env: Vec<String>,
    /// Hostname set inside a new UTS namespace.
    pub hostname: String,
    /// Host path the init chroots into.
    pub rootfs: PathBuf,
    /// Container-side working directory.
    pub working_dir: PathBuf,
}

impl LaunchSpec {
    /// Derive the launch parameters for container `id`.
    ///
    /// The hostname falls back to the container name, then to the ID.
    #[must_use]
    pub fn for_container(id: &ContainerId, spec: &ContainerSpec) -> Self {
        let mut env = spec.env.clone();
        env.entry("PATH".to_string())
            .or_insert_with(|| DEFAULT_PATH.to_string());

        let hostname = spec
            .hostname
            .clone()
            .or_else(|| spec.name.clone())
            .unwrap_or_else(|| id.to_string());

        Self {
            argv: spec.command.clone(),
            env: env.into_iter().map(|(k, v)| format!("{k}={v}")).collect(),
            hostname,
            rootfs: spec.rootfs.clone(),
            working_dir: spec.working_dir().to_path_buf(),
        }
    }

    /// The program name as given.
    #[must_use]
    pub fn program(&self) -> &str {
        self.argv.first().map_or("", String::as_str)
    }

    /// Value of `PATH` in the launch environment.
    #[must_use]
    pub fn search_path(&self) -> &str {
        self.env
            .iter()
            .find_map(|e| e.strip_prefix("PATH="))
            .unwrap_or(DEFAULT_PATH)
    }

    /// Paths `execve` should try, in order. A program containing `/` is
    /// used as is; anything else is looked up in `PATH`.
    #[must_use]
    pub fn exec_candidates(&self) -> Vec<String> {
        let program = self.program();
        if program.contains('/') {
            return vec![program.to_string()];
        }
        self.search_path()
            .split(':')
            .map(|dir| if dir.is_empty() { "." } else { dir })
            .map(|dir| format!("{}/{program}", dir.trim_end_matches('/')))
            .collect()
    }
}

/// How a reaped process ended, straight from `waitpid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawExit {
    /// Normal exit with a code.
    Exited(i32),
    /// Killed by a signal.
    Signaled(i32),
}

/// A paused container init.
pub trait InitProcess: Send + Sync {
    /// Host PID.
    fn pid(&self) -> u32;

    /// Let the init `execve` the entry command.
    ///
    /// Blocks until the exec has either succeeded or failed.
    ///
    /// # Errors
    ///
    /// Returns [`skiff_common::SkiffError::ExecFailure`] carrying the OS
    /// error the init hit; the init has been reaped by then.
    fn launch(self: Box<Self>) -> SkiffResult<Arc<dyn EntryProcess>>;

    /// Kill and reap the init without running anything.
    fn abort(self: Box<Self>);
}

/// A running entry process.
pub trait EntryProcess: Send + Sync {
    /// Host PID.
    fn pid(&self) -> u32;

    /// Deliver `signal`. Signalling an already reaped process is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel refuses the signal.
    fn signal(&self, signal: i32) -> SkiffResult<()>;

    /// Block until the process terminates and reap it.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be waited for.
    fn wait(&self) -> SkiffResult<RawExit>;
}
