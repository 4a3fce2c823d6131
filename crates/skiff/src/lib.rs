//! # Skiff Container Engine
//!
//! Skiff runs a command from an extracted root filesystem inside fresh
//! namespaces, under a cgroup v2 resource group, optionally wired to a host
//! bridge, and tears everything down again.
//!
//! ## Components
//!
//! - **Namespaces**: PID, mount, UTS, IPC and network isolation for the entry process
//! - **Rootfs**: private mount tree with `/proc`, `/sys`, `/dev` and bind mounts
//! - **Cgroups**: memory, CPU weight, CPU quota and PID ceilings
//! - **Supervisor**: ordered acquisition with rollback, monitoring, stop and destroy
//! - **Registry**: process-wide table of containers with per-container exclusion
//!
//! ## Usage
//!
//! ```no_run
//! use skiff::runtime::{ContainerRegistry, ContainerSpec, HostServices, RuntimeConfig};
//!
//! # async fn example() -> skiff_common::SkiffResult<()> {
//! let config = RuntimeConfig::default();
//! let registry = ContainerRegistry::new(HostServices::linux(&config), config);
//!
//! let id = registry.submit(ContainerSpec::new("/tmp/root", ["/bin/true"]))?;
//! registry.start(&id).await?;
//! let status = registry.wait(&id).await?;
//! assert!(status.success());
//!
//! registry.destroy(&id).await?;
//! registry.remove(&id)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cgroup;
pub mod cli;
pub mod exec;
pub mod filesystem;
pub mod namespace;
pub mod runtime;

pub use runtime::{ContainerRegistry, ContainerSpec, ContainerSupervisor};
