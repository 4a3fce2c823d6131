//! Terminal status of a container's entry process.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Signal number used for forced termination (SIGKILL).
pub const SIGKILL: i32 = 9;

/// How the entry process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Termination {
    /// The process called `exit` (or returned from `main`).
    Exited {
        /// Exit code, 0-255.
        code: i32,
    },
    /// The process died from a signal nobody on the host asked for.
    Signaled {
        /// Signal number.
        signal: i32,
    },
    /// The kernel killed the process for exceeding a resource limit.
    ResourceLimit {
        /// Signal number (SIGKILL for the OOM killer).
        signal: i32,
    },
    /// The process was ended by a `stop` request.
    Stopped {
        /// The signal that finally ended it.
        signal: i32,
        /// Whether the stop escalated to SIGKILL.
        forced: bool,
    },
}

/// Final status recorded for a container once its entry process is reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExitStatus {
    /// Classified termination.
    pub termination: Termination,
}

impl ExitStatus {
    /// Normal exit with `code`.
    #[must_use]
    pub const fn exited(code: i32) -> Self {
        Self {
            termination: Termination::Exited { code },
        }
    }

    /// Death by `signal`.
    #[must_use]
    pub const fn signaled(signal: i32) -> Self {
        Self {
            termination: Termination::Signaled { signal },
        }
    }

    /// Killed by the kernel for exceeding a limit.
    #[must_use]
    pub const fn resource_limit(signal: i32) -> Self {
        Self {
            termination: Termination::ResourceLimit { signal },
        }
    }

    /// Ended by a stop request.
    #[must_use]
    pub const fn stopped(signal: i32, forced: bool) -> Self {
        Self {
            termination: Termination::Stopped { signal, forced },
        }
    }

    /// Shell-style exit code: the exit code itself, or `128 + signal`.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self.termination {
            Termination::Exited { code } => code,
            Termination::Signaled { signal }
            | Termination::ResourceLimit { signal }
            | Termination::Stopped { signal, .. } => 128 + signal,
        }
    }

    /// True for a normal exit with code 0.
    #[must_use]
    pub const fn success(&self) -> bool {
        matches!(self.termination, Termination::Exited { code: 0 })
    }

    /// The terminating signal, if any.
    #[must_use]
    pub const fn signal(&self) -> Option<i32> {
        match self.termination {
            Termination::Exited { .. } => None,
            Termination::Signaled { signal }
            | Termination::ResourceLimit { signal }
            | Termination::Stopped { signal, .. } => Some(signal),
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.termination {
            Termination::Exited { code } => write!(f, "exited with code {code}"),
            Termination::Signaled { signal } => write!(f, "killed by signal {signal}"),
            Termination::ResourceLimit { signal } => {
                write!(f, "killed by resource limit (signal {signal})")
            }
            Termination::Stopped { signal, forced: true } => {
                write!(f, "stopped (forced, signal {signal})")
            }
            Termination::Stopped { signal, forced: false } => {
                write!(f, "stopped (signal {signal})")
            }
        }
    }
}
