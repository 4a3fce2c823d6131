//! Container runtime core.
//!
//! This module provides the container spec, the per-container supervisor and
//! the registry that owns every supervisor in the process.

mod acquisition;
mod config;
pub mod events;
mod host;
mod lifecycle;
mod registry;
mod spec;
mod state;
mod supervisor;

pub use acquisition::{Acquired, AcquisitionLog};
pub use config::{DEFAULT_BRIDGE, DEFAULT_STOP_TIMEOUT_SECS, RuntimeConfig};
pub use events::{EventBus, RuntimeEvent};
pub use host::HostServices;
pub use lifecycle::LifecyclePhase;
pub use registry::ContainerRegistry;
pub use spec::{
    CPU_WEIGHT_MAX, CPU_WEIGHT_MIN, ContainerSpec, HOSTNAME_MAX, MountRequest, NetworkRequest,
    ResourceLimits,
};
pub use state::{Container, ContainerStatus};
pub use supervisor::ContainerSupervisor;
