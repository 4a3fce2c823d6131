//! Error taxonomy for the Skiff engine.
//!
//! Acquisition failures during `start` wrap the leaf error that triggered them,
//! so callers see both the stage that failed and the underlying cause.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::exit::ExitStatus;

/// Result type alias using [`SkiffError`].
pub type SkiffResult<T> = Result<T, SkiffError>;

/// Errors surfaced by the engine core and its leaf components.
#[derive(Error, Diagnostic, Debug)]
pub enum SkiffError {
    /// The submitted container spec is malformed.
    #[error("Invalid container spec: {reason}")]
    #[diagnostic(code(skiff::spec::invalid))]
    InvalidSpec {
        /// What is wrong with the spec.
        reason: String,
    },

    /// A container-side mount target resolves outside the rootfs.
    #[error("Mount target escapes the container root: {target}")]
    #[diagnostic(
        code(skiff::spec::path_escape),
        help("Mount targets are container paths; they may not climb above '/' or cross a symlink leaving the rootfs")
    )]
    PathEscape {
        /// The offending container-side target.
        target: PathBuf,
    },

    /// Namespace creation failed during start.
    #[error("Namespace setup failed: {source}")]
    #[diagnostic(code(skiff::start::namespace))]
    NamespaceFailure {
        /// The leaf error.
        source: Box<SkiffError>,
    },

    /// Rootfs preparation failed during start.
    #[error("Rootfs mount failed: {source}")]
    #[diagnostic(code(skiff::start::mount))]
    MountFailure {
        /// The leaf error.
        source: Box<SkiffError>,
    },

    /// Resource group setup failed during start.
    #[error("Resource limit setup failed: {source}")]
    #[diagnostic(code(skiff::start::resources))]
    ResourceLimitFailure {
        /// The leaf error.
        source: Box<SkiffError>,
    },

    /// Network attachment failed during start.
    #[error("Network setup failed: {source}")]
    #[diagnostic(code(skiff::start::network))]
    NetworkFailure {
        /// The leaf error.
        source: Box<SkiffError>,
    },

    /// The entry command could not be executed.
    #[error("Failed to execute '{command}': {source}")]
    #[diagnostic(
        code(skiff::start::exec),
        help("The command is resolved inside the container rootfs")
    )]
    ExecFailure {
        /// The entry command.
        command: String,
        /// The OS error reported by the container init.
        source: std::io::Error,
    },

    /// Another lifecycle operation holds this container.
    #[error("Operation already in progress on container {id}")]
    #[diagnostic(code(skiff::busy), help("Retry once the running operation completes"))]
    OperationInProgress {
        /// The container ID.
        id: String,
    },

    /// Container not found.
    #[error("Container not found: {id}")]
    #[diagnostic(code(skiff::container::not_found))]
    NotFound {
        /// The container ID that was not found.
        id: String,
    },

    /// The container has no running entry process to stop.
    #[error("Container {id} is already stopped")]
    #[diagnostic(code(skiff::container::already_stopped))]
    AlreadyStopped {
        /// The container ID.
        id: String,
        /// Terminal status, when the entry process ever ran.
        exit: Option<ExitStatus>,
    },

    /// Start was requested on a container that already left `created`.
    #[error("Container {id} cannot be started from status {status}")]
    #[diagnostic(code(skiff::container::already_started))]
    AlreadyStarted {
        /// The container ID.
        id: String,
        /// Current lifecycle status.
        status: String,
    },

    /// Destroy was requested while the container may still own live processes.
    #[error("Container {id} is {status}; stop it before destroying")]
    #[diagnostic(code(skiff::container::not_stopped))]
    NotStopped {
        /// The container ID.
        id: String,
        /// Current lifecycle status.
        status: String,
    },

    /// Remove was requested before teardown completed.
    #[error("Container {id} is {status}; destroy it before removing")]
    #[diagnostic(code(skiff::container::not_destroyed))]
    NotDestroyed {
        /// The container ID.
        id: String,
        /// Current lifecycle status.
        status: String,
    },

    /// Wait was requested on a container whose entry process never launched.
    #[error("Container {id} has no entry process (status: {status})")]
    #[diagnostic(code(skiff::container::not_running))]
    NotRunning {
        /// The container ID.
        id: String,
        /// Current lifecycle status.
        status: String,
    },

    /// A cgroup still has member processes.
    #[error("Resource group {path} still has {pids} attached process(es)")]
    #[diagnostic(code(skiff::cgroup::busy))]
    GroupBusy {
        /// The cgroup directory.
        path: PathBuf,
        /// Number of attached processes.
        pids: usize,
    },

    /// The host kernel lacks a requested namespace.
    #[error("Isolation axis not supported by this kernel: {axis}")]
    #[diagnostic(
        code(skiff::namespace::unsupported),
        help("Check that the kernel was built with the corresponding CONFIG_*_NS option")
    )]
    UnsupportedIsolation {
        /// The namespace kind.
        axis: String,
    },

    /// Permission denied.
    #[error("Permission denied: {operation}")]
    #[diagnostic(
        code(skiff::permission_denied),
        help("Try running with elevated privileges (sudo)")
    )]
    PermissionDenied {
        /// The operation that was denied.
        operation: String,
    },

    /// A requested limit has no controller on this host.
    #[error("Limit '{limit}' unsupported: {path} does not exist")]
    #[diagnostic(
        code(skiff::cgroup::unsupported),
        help("Enable the controller in the parent's cgroup.subtree_control")
    )]
    LimitUnsupported {
        /// The limit name (e.g. `memory.max`).
        limit: String,
        /// The missing control file.
        path: PathBuf,
    },

    /// A process could not be moved into a cgroup.
    #[error("Failed to attach pid {pid} to {path}: {source}")]
    #[diagnostic(code(skiff::cgroup::attach))]
    AttachFailure {
        /// The process ID.
        pid: u32,
        /// The cgroup directory.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The requested address is held by another container or reserved.
    #[error("Address {address} is already in use")]
    #[diagnostic(code(skiff::network::address_in_use))]
    AddressInUse {
        /// The requested address.
        address: Ipv4Addr,
    },

    /// The requested address lies outside the bridge subnet.
    #[error("Address {address} is outside subnet {subnet}")]
    #[diagnostic(code(skiff::network::address_out_of_range))]
    AddressOutOfRange {
        /// The requested address.
        address: Ipv4Addr,
        /// The configured subnet.
        subnet: String,
    },

    /// No free addresses remain.
    #[error("No free addresses left in subnet {subnet}")]
    #[diagnostic(code(skiff::network::exhausted))]
    AddressExhausted {
        /// The configured subnet.
        subnet: String,
    },

    /// A network device could not be created or configured.
    #[error("Failed to configure device {device}: {reason}")]
    #[diagnostic(code(skiff::network::device))]
    DeviceCreateFailure {
        /// The device name.
        device: String,
        /// Why it failed.
        reason: String,
    },

    /// Invalid container ID format.
    #[error("Invalid container ID: {id}")]
    #[diagnostic(
        code(skiff::container::invalid_id),
        help("Container IDs must be alphanumeric with hyphens and underscores, 1-64 characters")
    )]
    InvalidContainerId {
        /// The invalid container ID.
        id: String,
    },

    /// Invalid resource quantity format.
    #[error("Invalid resource quantity: {value}")]
    #[diagnostic(
        code(skiff::resource::invalid_quantity),
        help("Use formats like '512Mi', '1G', '1048576' for memory and '0.5', '2', '1500m' for CPUs")
    )]
    InvalidResourceQuantity {
        /// The invalid value.
        value: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(skiff::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(skiff::serialization))]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(skiff::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(code(skiff::internal))]
    Internal {
        /// The error message.
        message: String,
    },
}

/// Flat classification of [`SkiffError`], one per exit code.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInput,
    InvalidSpec,
    PathEscape,
    NamespaceFailure,
    MountFailure,
    ResourceLimitFailure,
    NetworkFailure,
    ExecFailure,
    OperationInProgress,
    NotFound,
    AlreadyStopped,
    NotStopped,
    GroupBusy,
    NotDestroyed,
    NotRunning,
    UnsupportedIsolation,
    PermissionDenied,
    LimitUnsupported,
    AttachFailure,
    AddressInUse,
    AddressOutOfRange,
    AddressExhausted,
    DeviceCreateFailure,
    Config,
    Io,
    Internal,
    AlreadyStarted,
}

impl ErrorKind {
    /// Process exit code used by the CLI for this kind.
    ///
    /// Codes start at 100 so they stay clear of the usual shell codes.
    #[must_use]
    pub const fn exit_code(self) -> i32 {
        match self {
            Self::InvalidInput => 100,
            Self::InvalidSpec => 101,
            Self::PathEscape => 102,
            Self::NamespaceFailure => 103,
            Self::MountFailure => 104,
            Self::ResourceLimitFailure => 105,
            Self::NetworkFailure => 106,
            Self::ExecFailure => 107,
            Self::OperationInProgress => 108,
            Self::NotFound => 109,
            Self::AlreadyStopped => 110,
            Self::NotStopped => 111,
            Self::GroupBusy => 112,
            Self::NotDestroyed => 113,
            Self::NotRunning => 114,
            Self::UnsupportedIsolation => 115,
            Self::PermissionDenied => 116,
            Self::LimitUnsupported => 117,
            Self::AttachFailure => 118,
            Self::AddressInUse => 119,
            Self::AddressOutOfRange => 120,
            Self::AddressExhausted => 121,
            Self::DeviceCreateFailure => 122,
            Self::Config => 123,
            Self::Io => 124,
            Self::Internal => 125,
            Self::AlreadyStarted => 126,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

impl SkiffError {
    /// Classify this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidSpec { .. } => ErrorKind::InvalidSpec,
            Self::PathEscape { .. } => ErrorKind::PathEscape,
            Self::NamespaceFailure { .. } => ErrorKind::NamespaceFailure,
            Self::MountFailure { .. } => ErrorKind::MountFailure,
            Self::ResourceLimitFailure { .. } => ErrorKind::ResourceLimitFailure,
            Self::NetworkFailure { .. } => ErrorKind::NetworkFailure,
            Self::ExecFailure { .. } => ErrorKind::ExecFailure,
            Self::OperationInProgress { .. } => ErrorKind::OperationInProgress,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyStopped { .. } => ErrorKind::AlreadyStopped,
            Self::AlreadyStarted { .. } => ErrorKind::AlreadyStarted,
            Self::NotStopped { .. } => ErrorKind::NotStopped,
            Self::NotDestroyed { .. } => ErrorKind::NotDestroyed,
            Self::NotRunning { .. } => ErrorKind::NotRunning,
            Self::GroupBusy { .. } => ErrorKind::GroupBusy,
            Self::UnsupportedIsolation { .. } => ErrorKind::UnsupportedIsolation,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::LimitUnsupported { .. } => ErrorKind::LimitUnsupported,
            Self::AttachFailure { .. } => ErrorKind::AttachFailure,
            Self::AddressInUse { .. } => ErrorKind::AddressInUse,
            Self::AddressOutOfRange { .. } => ErrorKind::AddressOutOfRange,
            Self::AddressExhausted { .. } => ErrorKind::AddressExhausted,
            Self::DeviceCreateFailure { .. } => ErrorKind::DeviceCreateFailure,
            Self::InvalidContainerId { .. }
            | Self::InvalidResourceQuantity { .. }
            | Self::Serialization(_) => ErrorKind::InvalidInput,
            Self::Io(_) => ErrorKind::Io,
            Self::Config { .. } => ErrorKind::Config,
            Self::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Process exit code for this error.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        self.kind().exit_code()
    }

    /// The leaf error behind an acquisition-stage wrapper, or `self`.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::NamespaceFailure { source }
            | Self::MountFailure { source }
            | Self::ResourceLimitFailure { source }
            | Self::NetworkFailure { source } => source.root_cause(),
            other => other,
        }
    }

    /// Shorthand for [`SkiffError::InvalidSpec`].
    pub fn invalid_spec(reason: impl Into<String>) -> Self {
        Self::InvalidSpec {
            reason: reason.into(),
        }
    }

    /// Shorthand for [`SkiffError::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for SkiffError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn error_display() {
        let err = SkiffError::NotFound {
            id: "c7".to_string(),
        };
        assert_eq!(err.to_string(), "Container not found: c7");
    }

    #[test]
    fn error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: SkiffError = io_err.into();
        assert!(matches!(err, SkiffError::Io(_)));
        assert_eq!(err.kind(), ErrorKind::Io);
    }

    #[test]
    fn wrapped_errors_keep_their_cause() {
        let err = SkiffError::NetworkFailure {
            source: Box::new(SkiffError::AddressInUse {
                address: Ipv4Addr::new(10, 88, 0, 2),
            }),
        };
        assert_eq!(err.kind(), ErrorKind::NetworkFailure);
        assert_eq!(err.root_cause().kind(), ErrorKind::AddressInUse);
        assert!(err.to_string().contains("10.88.0.2"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn exit_codes_are_distinct() {
        let kinds = [
            ErrorKind::InvalidInput,
            ErrorKind::InvalidSpec,
            ErrorKind::PathEscape,
            ErrorKind::NamespaceFailure,
            ErrorKind::MountFailure,
            ErrorKind::ResourceLimitFailure,
            ErrorKind::NetworkFailure,
            ErrorKind::ExecFailure,
            ErrorKind::OperationInProgress,
            ErrorKind::NotFound,
            ErrorKind::AlreadyStopped,
            ErrorKind::NotStopped,
            ErrorKind::GroupBusy,
            ErrorKind::NotDestroyed,
            ErrorKind::NotRunning,
            ErrorKind::UnsupportedIsolation,
            ErrorKind::PermissionDenied,
            ErrorKind::LimitUnsupported,
            ErrorKind::AttachFailure,
            ErrorKind::AddressInUse,
            ErrorKind::AddressOutOfRange,
            ErrorKind::AddressExhausted,
            ErrorKind::DeviceCreateFailure,
            ErrorKind::Config,
            ErrorKind::Io,
            ErrorKind::Internal,
            ErrorKind::AlreadyStarted,
        ];
        let codes: HashSet<i32> = kinds.iter().map(|k| k.exit_code()).collect();
        assert_eq!(codes.len(), kinds.len());
        assert!(codes.iter().all(|c| *c != 0));
    }
}
