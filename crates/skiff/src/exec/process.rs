//! Control of a launched entry process.

#![allow(unsafe_code)]

use std::os::fd::OwnedFd;

use rustix::io::Errno;
use rustix::process::{Pid, PidfdFlags, Signal, pidfd_open, pidfd_send_signal};
use skiff_common::{SkiffError, SkiffResult};

use super::{EntryProcess, RawExit};

/// An entry process that is a direct child of this process.
///
/// Signals go through a pidfd, so once the child is reaped they can never
/// reach a process that reused its pid.
#[derive(Debug)]
pub struct LinuxEntryProcess {
    pid: i32,
    pidfd: OwnedFd,
}

impl LinuxEntryProcess {
    /// Track child `pid`. The child must not have been reaped yet.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::Internal`] if no pidfd can be opened for `pid`.
    pub fn new(pid: i32) -> SkiffResult<Self> {
        let raw = Pid::from_raw(pid).ok_or_else(|| SkiffError::internal(format!("invalid pid {pid}")))?;
        let pidfd = pidfd_open(raw, PidfdFlags::empty()).map_err(|e| SkiffError::Internal {
            message: format!("pidfd_open({pid}) failed: {e}"),
        })?;
        Ok(Self { pid, pidfd })
    }
}

/// Block in `waitpid` for `pid`, retrying on EINTR.
pub(super) fn wait_for(pid: i32) -> std::io::Result<RawExit> {
    let mut status: libc::c_int = 0;
    loop {
        let result = unsafe { libc::waitpid(pid, &mut status, 0) };
        if result == -1 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        break;
    }
    Ok(decode_status(status))
}

/// Translate a raw wait status.
pub(super) fn decode_status(status: libc::c_int) -> RawExit {
    if libc::WIFEXITED(status) {
        RawExit::Exited(libc::WEXITSTATUS(status))
    } else if libc::WIFSIGNALED(status) {
        RawExit::Signaled(libc::WTERMSIG(status))
    } else {
        RawExit::Exited(1)
    }
}

impl EntryProcess for LinuxEntryProcess {
    fn pid(&self) -> u32 {
        self.pid.unsigned_abs()
    }

    fn signal(&self, signal: i32) -> SkiffResult<()> {
        let sig = Signal::from_named_raw(signal)
            .ok_or_else(|| SkiffError::internal(format!("unknown signal {signal}")))?;

        tracing::debug!(pid = self.pid, signal, "Signalling entry process");
        match pidfd_send_signal(&self.pidfd, sig) {
            // already exited
            Ok(()) | Err(Errno::SRCH) => Ok(()),
            Err(err) => Err(SkiffError::Internal {
                message: format!("Failed to send signal {signal} to {}: {err}", self.pid),
            }),
        }
    }

    fn wait(&self) -> SkiffResult<RawExit> {
        let exit = wait_for(self.pid).map_err(|e| SkiffError::Internal {
            message: format!("waitpid({}) failed: {e}", self.pid),
        })?;
        tracing::debug!(pid = self.pid, ?exit, "Entry process reaped");
        Ok(exit)
    }
}
