//! Virtual ethernet pair management.

use std::net::Ipv4Addr;

use skiff_common::{SkiffError, SkiffResult};

use crate::cmd::{self, is_missing_device};
use crate::netns::NetnsRef;

/// Kernel limit on interface name length (IFNAMSIZ - 1).
pub const MAX_IFNAME_LEN: usize = 15;

/// Interface name of the peer once inside the container.
pub const CONTAINER_IFNAME: &str = "eth0";

/// A veth pair linking the host bridge to one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethPair {
    /// Host-side interface name.
    pub host: String,
    /// Peer name while it still lives on the host.
    pub peer: String,
}

impl VethPair {
    /// Derive interface names for a container.
    ///
    /// Names are `skh<id>` and `skp<id>`, with the ID cut to fit the
    /// kernel's name length.
    #[must_use]
    pub fn for_container(id: &str) -> Self {
        let room = MAX_IFNAME_LEN - 3;
        let tail = if id.len() > room {
            &id[id.len() - room..]
        } else {
            id
        };
        Self {
            host: format!("skh{tail}"),
            peer: format!("skp{tail}"),
        }
    }

    fn failure(device: &str, reason: String) -> SkiffError {
        SkiffError::DeviceCreateFailure {
            device: device.to_string(),
            reason,
        }
    }

    /// Create the pair on the host and bring the host end up.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::DeviceCreateFailure`]. A pair that was created
    /// but could not be brought up is deleted again.
    pub async fn create(&self) -> SkiffResult<()> {
        tracing::debug!(host = %self.host, peer = %self.peer, "Creating veth pair");

        cmd::ip(&[
            "link", "add", &self.host, "type", "veth", "peer", "name", &self.peer,
        ])
        .await
        .map_err(|e| Self::failure(&self.host, e))?;

        if let Err(e) = cmd::ip(&["link", "set", &self.host, "up"]).await {
            if let Err(cleanup) = self.delete().await {
                tracing::warn!(device = %self.host, error = %cleanup, "Failed to delete half-created veth pair");
            }
            return Err(Self::failure(&self.host, e));
        }
        Ok(())
    }

    /// Move the peer into `netns`.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::DeviceCreateFailure`] naming the peer.
    pub async fn move_peer(&self, netns: &NetnsRef) -> SkiffResult<()> {
        tracing::debug!(interface = %self.peer, pid = netns.pid, "Moving to netns");
        cmd::ip(&["link", "set", &self.peer, "netns", &netns.pid.to_string()])
            .await
            .map_err(|e| Self::failure(&self.peer, e))
    }

    /// Configure the moved peer from inside `netns`: rename it to `eth0`,
    /// assign `cidr`, bring `lo` and `eth0` up, route through `gateway`.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::DeviceCreateFailure`] naming the step's device.
    pub async fn configure_peer(
        &self,
        netns: &NetnsRef,
        cidr: &str,
        gateway: Ipv4Addr,
    ) -> SkiffResult<()> {
        let gateway = gateway.to_string();
        let steps: [(&str, Vec<&str>); 5] = [
            (
                self.peer.as_str(),
                vec!["link", "set", &self.peer, "name", CONTAINER_IFNAME],
            ),
            (
                CONTAINER_IFNAME,
                vec!["addr", "add", cidr, "dev", CONTAINER_IFNAME],
            ),
            ("lo", vec!["link", "set", "lo", "up"]),
            (CONTAINER_IFNAME, vec!["link", "set", CONTAINER_IFNAME, "up"]),
            (
                CONTAINER_IFNAME,
                vec!["route", "add", "default", "via", &gateway],
            ),
        ];

        for (device, args) in steps {
            cmd::ip_in(netns, &args)
                .await
                .map_err(|e| Self::failure(device, e))?;
        }
        tracing::debug!(pid = netns.pid, %cidr, "Container interface configured");
        Ok(())
    }

    /// Delete the pair through its host end.
    ///
    /// A device that no longer exists counts as deleted.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::DeviceCreateFailure`] for any other failure.
    pub async fn delete(&self) -> SkiffResult<()> {
        tracing::debug!(host = %self.host, "Deleting veth pair");
        match cmd::ip(&["link", "delete", &self.host]).await {
            Ok(()) => Ok(()),
            Err(e) if is_missing_device(&e) => {
                tracing::debug!(host = %self.host, "veth already gone");
                Ok(())
            }
            Err(e) => Err(Self::failure(&self.host, e)),
        }
    }
}
