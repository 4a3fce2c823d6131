//! Paused container init.
//!
//! The init is created with a raw `clone(2)` so it can enter new PID, mount,
//! UTS, IPC and network namespaces in one step. It then blocks on a pipe.
//! Writing one byte releases it: it sets the hostname, chroots into the
//! rootfs and `execve`s the entry command. An exec error travels back over a
//! close-on-exec status pipe; EOF on that pipe means the exec succeeded.
//!
//! The child of `clone` runs in a copy of a multi-threaded process, so it
//! only makes raw syscalls on data prepared before the clone.

#![allow(unsafe_code)]

use std::ffi::CString;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::sync::Arc;

use rustix::io::Errno;
use rustix::pipe::{PipeFlags, pipe_with};
use skiff_common::{SkiffError, SkiffResult};

use super::process::{self, LinuxEntryProcess};
use super::{EntryProcess, InitProcess, LaunchSpec};

/// Exit code of an init whose exec failed.
const EXEC_FAILED: libc::c_int = 127;

/// A cloned init waiting to be launched.
#[derive(Debug)]
pub struct LinuxInit {
    pid: i32,
    go: Option<OwnedFd>,
    status: OwnedFd,
    command: String,
    finished: bool,
}

/// Byte strings for the child, built before `clone`.
struct ExecImage {
    candidates: Vec<CString>,
    argv: Vec<CString>,
    envp: Vec<CString>,
    hostname: Option<CString>,
    rootfs: CString,
    workdir: CString,
}

impl ExecImage {
    fn prepare(launch: &LaunchSpec, set_hostname: bool) -> SkiffResult<Self> {
        let cstring = |bytes: &[u8]| {
            CString::new(bytes).map_err(|_| SkiffError::invalid_spec("argument contains a NUL byte"))
        };
        let all = |items: &[String]| -> SkiffResult<Vec<CString>> {
            items.iter().map(|s| cstring(s.as_bytes())).collect()
        };

        Ok(Self {
            candidates: all(&launch.exec_candidates())?,
            argv: all(&launch.argv)?,
            envp: all(&launch.env)?,
            hostname: if set_hostname {
                Some(cstring(launch.hostname.as_bytes())?)
            } else {
                None
            },
            rootfs: cstring(launch.rootfs.as_os_str().as_bytes())?,
            workdir: cstring(launch.working_dir.as_os_str().as_bytes())?,
        })
    }
}

fn null_terminated(items: &[CString]) -> Vec<*const libc::c_char> {
    items
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// Highest descriptor the child may have inherited, with headroom for
/// descriptors other threads open while we clone.
fn highest_open_fd() -> RawFd {
    std::fs::read_dir("/proc/self/fd")
        .ok()
        .and_then(|dir| {
            dir.filter_map(|e| e.ok()?.file_name().to_str()?.parse::<RawFd>().ok())
                .max()
        })
        .map_or(1024, |max| max + 64)
}

fn io_failure(context: &str, err: impl Into<std::io::Error>) -> SkiffError {
    let err = err.into();
    SkiffError::Internal {
        message: format!("{context}: {err}"),
    }
}

/// Clone a paused init inside new namespaces selected by `flags`.
///
/// `set_hostname` must only be true when `flags` includes a new UTS
/// namespace.
///
/// # Errors
///
/// - [`SkiffError::PermissionDenied`] without the privilege to create namespaces
/// - [`SkiffError::UnsupportedIsolation`] when the kernel rejects the flags
pub fn spawn_paused(
    flags: libc::c_int,
    launch: &LaunchSpec,
    set_hostname: bool,
) -> SkiffResult<LinuxInit> {
    let image = ExecImage::prepare(launch, set_hostname)?;
    let candidates = null_terminated(&image.candidates);
    let argv = null_terminated(&image.argv);
    let envp = null_terminated(&image.envp);

    let (go_read, go_write) =
        pipe_with(PipeFlags::CLOEXEC).map_err(|e| io_failure("Failed to create pipe", e))?;
    let (status_read, status_write) =
        pipe_with(PipeFlags::CLOEXEC).map_err(|e| io_failure("Failed to create pipe", e))?;
    let max_fd = highest_open_fd();

    let child_fds = ChildFds {
        go_read: go_read.as_raw_fd(),
        go_write: go_write.as_raw_fd(),
        status_read: status_read.as_raw_fd(),
        status_write: status_write.as_raw_fd(),
        max_fd,
    };

    #[allow(clippy::cast_sign_loss)]
    let clone_flags = (flags | libc::SIGCHLD) as libc::c_ulong;
    let ret = unsafe {
        libc::syscall(
            libc::SYS_clone,
            clone_flags,
            0usize,
            0usize,
            0usize,
            0usize,
        )
    };

    if ret == 0 {
        // child: never returns
        unsafe {
            child_main(
                &child_fds,
                &image,
                candidates.len() - 1,
                candidates.as_ptr(),
                argv.as_ptr(),
                envp.as_ptr(),
            )
        }
    }

    if ret < 0 {
        let err = std::io::Error::last_os_error();
        return Err(match err.raw_os_error() {
            Some(libc::EPERM) => SkiffError::PermissionDenied {
                operation: "create namespaces".to_string(),
            },
            Some(libc::EINVAL) => SkiffError::UnsupportedIsolation {
                axis: format!("clone flags {flags:#x}"),
            },
            _ => io_failure("clone failed", err),
        });
    }

    let pid = i32::try_from(ret).map_err(|_| SkiffError::internal("clone returned an invalid pid"))?;
    drop(go_read);
    drop(status_write);

    tracing::debug!(pid, flags = format_args!("{flags:#x}"), "Cloned paused init");
    Ok(LinuxInit {
        pid,
        go: Some(go_write),
        status: status_read,
        command: launch.program().to_string(),
        finished: false,
    })
}

struct ChildFds {
    go_read: RawFd,
    go_write: RawFd,
    status_read: RawFd,
    status_write: RawFd,
    max_fd: RawFd,
}

fn last_errno() -> libc::c_int {
    std::io::Error::last_os_error()
        .raw_os_error()
        .unwrap_or(libc::EIO)
}

unsafe fn report_and_exit(fd: RawFd, errno: libc::c_int) -> ! {
    let bytes = errno.to_ne_bytes();
    unsafe {
        libc::write(fd, bytes.as_ptr().cast(), bytes.len());
        libc::_exit(EXEC_FAILED)
    }
}

unsafe fn child_main(
    fds: &ChildFds,
    image: &ExecImage,
    candidate_count: usize,
    candidates: *const *const libc::c_char,
    argv: *const *const libc::c_char,
    envp: *const *const libc::c_char,
) -> ! {
    unsafe {
        libc::close(fds.go_write);
        libc::close(fds.status_read);
        for fd in 3..=fds.max_fd {
            if fd != fds.go_read && fd != fds.status_write {
                libc::close(fd);
            }
        }

        let mut byte = 0u8;
        loop {
            let n = libc::read(fds.go_read, (&raw mut byte).cast(), 1);
            if n == 1 {
                break;
            }
            if n < 0 && last_errno() == libc::EINTR {
                continue;
            }
            // engine went away before launching us
            libc::_exit(0);
        }
        libc::close(fds.go_read);

        if let Some(hostname) = &image.hostname {
            if libc::sethostname(hostname.as_ptr(), hostname.as_bytes().len()) != 0 {
                report_and_exit(fds.status_write, last_errno());
            }
        }

        if libc::chdir(image.rootfs.as_ptr()) != 0
            || libc::chroot(c".".as_ptr()) != 0
            || libc::chdir(image.workdir.as_ptr()) != 0
        {
            report_and_exit(fds.status_write, last_errno());
        }

        let mut empty: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut empty);
        libc::sigprocmask(libc::SIG_SETMASK, &empty, std::ptr::null_mut());
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);

        let mut failure = libc::ENOENT;
        for i in 0..candidate_count {
            libc::execve(*candidates.add(i), argv, envp);
            match last_errno() {
                libc::ENOENT | libc::ENOTDIR => {}
                libc::EACCES => failure = libc::EACCES,
                other => {
                    failure = other;
                    break;
                }
            }
        }
        report_and_exit(fds.status_write, failure)
    }
}

impl LinuxInit {
    fn kill_and_reap(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.go = None;
        unsafe {
            libc::kill(self.pid, libc::SIGKILL);
        }
        if let Err(e) = process::wait_for(self.pid) {
            tracing::warn!(pid = self.pid, error = %e, "Failed to reap aborted init");
        }
    }

    fn read_exec_status(&self) -> SkiffResult<Option<libc::c_int>> {
        let mut buf = [0u8; 4];
        let mut filled = 0;
        while filled < buf.len() {
            match rustix::io::read(&self.status, &mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(Errno::INTR) => {}
                Err(e) => return Err(io_failure("Failed to read exec status", e)),
            }
        }
        match filled {
            0 => Ok(None),
            4 => Ok(Some(libc::c_int::from_ne_bytes(buf))),
            _ => Err(SkiffError::internal("truncated exec status from init")),
        }
    }
}

impl InitProcess for LinuxInit {
    fn pid(&self) -> u32 {
        self.pid.unsigned_abs()
    }

    fn launch(mut self: Box<Self>) -> SkiffResult<Arc<dyn EntryProcess>> {
        let go = self
            .go
            .take()
            .ok_or_else(|| SkiffError::internal("init already released"))?;

        // opened while the init is paused, so it cannot refer to anything else
        let entry = match LinuxEntryProcess::new(self.pid) {
            Ok(entry) => entry,
            Err(e) => {
                self.kill_and_reap();
                return Err(e);
            }
        };

        if let Err(e) = rustix::io::write(&go, &[1]) {
            self.kill_and_reap();
            return Err(io_failure("Failed to release init", e));
        }
        drop(go);

        let status = self.read_exec_status();
        match status {
            Ok(None) => {
                self.finished = true;
                tracing::debug!(pid = self.pid, command = %self.command, "Entry command executing");
                Ok(Arc::new(entry))
            }
            Ok(Some(errno)) => {
                self.finished = true;
                if let Err(e) = process::wait_for(self.pid) {
                    tracing::warn!(pid = self.pid, error = %e, "Failed to reap init after exec failure");
                }
                Err(SkiffError::ExecFailure {
                    command: self.command.clone(),
                    source: std::io::Error::from_raw_os_error(errno),
                })
            }
            Err(e) => {
                self.kill_and_reap();
                Err(e)
            }
        }
    }

    fn abort(mut self: Box<Self>) {
        self.kill_and_reap();
    }
}

impl Drop for LinuxInit {
    fn drop(&mut self) {
        self.kill_and_reap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::ContainerSpec;
    use skiff_common::{ContainerId, ErrorKind};

    fn launch_spec(command: &[&str]) -> LaunchSpec {
        let spec = ContainerSpec::new("/", command.iter().copied());
        LaunchSpec::for_container(&ContainerId::from_sequence(1), &spec)
    }

    #[test]
    fn image_rejects_nul_bytes() {
        let mut launch = launch_spec(&["/bin/true"]);
        launch.argv.push("bad\0arg".to_string());
        assert!(ExecImage::prepare(&launch, false).is_err());
    }

    #[test]
    #[ignore = "requires root to chroot"]
    fn launches_without_new_namespaces() {
        let init = spawn_paused(0, &launch_spec(&["/bin/sh", "-c", "exit 4"]), false).unwrap();
        let entry = Box::new(init).launch().unwrap();
        assert_eq!(entry.wait().unwrap(), crate::exec::RawExit::Exited(4));
    }

    #[test]
    #[ignore = "requires root to chroot"]
    fn reports_missing_program() {
        let init = spawn_paused(0, &launch_spec(&["/no/such/binary"]), false).unwrap();
        let err = Box::new(init).launch().err().unwrap();
        assert_eq!(err.kind(), ErrorKind::ExecFailure);
    }

    #[test]
    fn abort_reaps_paused_child() {
        let init = spawn_paused(0, &launch_spec(&["/bin/true"]), false).unwrap();
        let pid = init.pid();
        Box::new(init).abort();
        // reaped: the pid is no longer our child
        let rc = unsafe { libc::waitpid(i32::try_from(pid).unwrap(), std::ptr::null_mut(), libc::WNOHANG) };
        assert_eq!(rc, -1);
    }
}
