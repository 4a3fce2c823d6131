//! # skiff-network
//!
//! Networking for Skiff containers.
//!
//! Containers join a host bridge through a veth pair. Addresses come from
//! one [`AddressPool`] shared by every container in the process.

#![warn(missing_docs)]

mod cmd;

pub mod bridge;
pub mod driver;
pub mod ipam;
pub mod netns;
pub mod veth;

pub use bridge::Bridge;
pub use driver::{BridgeNetwork, NetworkBinding, NetworkBridge};
pub use ipam::{AddressPool, Subnet};
pub use netns::NetnsRef;
pub use veth::VethPair;
