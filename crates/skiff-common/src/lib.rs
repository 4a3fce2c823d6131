//! # skiff-common
//!
//! Shared types for the Skiff container engine.
//!
//! This crate provides functionality used by every Skiff crate:
//! - The error taxonomy surfaced to callers and its exit-code mapping
//! - Container ID validation and sequential allocation
//! - Termination status of a container's entry process
//! - Resource quantity parsing (memory sizes, CPU counts)
//! - Standard host paths

#![warn(missing_docs)]

pub mod error;
pub mod exit;
pub mod id;
pub mod paths;
pub mod resource;

pub use error::{ErrorKind, SkiffError, SkiffResult};
pub use exit::{ExitStatus, Termination};
pub use id::ContainerId;
pub use paths::SkiffPaths;
