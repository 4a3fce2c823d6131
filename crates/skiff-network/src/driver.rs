//! Container network attachment.

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use skiff_common::{ContainerId, SkiffResult};

use crate::bridge::Bridge;
use crate::ipam::AddressPool;
use crate::netns::NetnsRef;
use crate::veth::{CONTAINER_IFNAME, VethPair};

/// Devices and address held by one attached container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkBinding {
    /// Host-side veth name.
    pub host_device: String,
    /// Peer name before it was moved and renamed.
    pub peer_device: String,
    /// Interface name inside the container.
    pub container_device: String,
    /// Assigned address.
    pub address: Ipv4Addr,
    /// Prefix length of the subnet.
    pub prefix: u8,
    /// Default gateway.
    pub gateway: Ipv4Addr,
}

impl NetworkBinding {
    fn veth(&self) -> VethPair {
        VethPair {
            host: self.host_device.clone(),
            peer: self.peer_device.clone(),
        }
    }
}

/// Connects containers to the host network.
#[async_trait]
pub trait NetworkBridge: Send + Sync {
    /// Give the container in `netns` a device and an address.
    ///
    /// Either the returned binding holds everything acquired, or nothing
    /// was left behind.
    async fn attach(
        &self,
        id: &ContainerId,
        netns: &NetnsRef,
        requested: Option<Ipv4Addr>,
    ) -> SkiffResult<NetworkBinding>;

    /// Remove the container's devices and free its address.
    async fn detach(&self, binding: &NetworkBinding) -> SkiffResult<()>;
}

/// Bridge + veth implementation backed by the `ip` tool.
#[derive(Debug, Clone)]
pub struct BridgeNetwork {
    bridge: Bridge,
    pool: Arc<AddressPool>,
}

impl BridgeNetwork {
    /// Attach containers to bridge `name`, drawing addresses from `pool`.
    #[must_use]
    pub fn new(name: impl Into<String>, pool: Arc<AddressPool>) -> Self {
        Self {
            bridge: Bridge::new(name),
            pool,
        }
    }

    /// The shared address pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<AddressPool> {
        &self.pool
    }

    async fn plumb(
        &self,
        veth: &VethPair,
        netns: &NetnsRef,
        address: Ipv4Addr,
    ) -> SkiffResult<()> {
        let subnet = self.pool.subnet();
        self.bridge.ensure(&subnet).await?;
        veth.create().await?;

        let wired = async {
            self.bridge.add_interface(&veth.host).await?;
            veth.move_peer(netns).await?;
            veth.configure_peer(netns, &subnet.cidr_for(address), subnet.gateway())
                .await
        }
        .await;

        if let Err(e) = wired {
            if let Err(cleanup) = veth.delete().await {
                tracing::warn!(host = %veth.host, error = %cleanup, "Failed to remove veth after error");
            }
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl NetworkBridge for BridgeNetwork {
    async fn attach(
        &self,
        id: &ContainerId,
        netns: &NetnsRef,
        requested: Option<Ipv4Addr>,
    ) -> SkiffResult<NetworkBinding> {
        let address = self.pool.reserve(requested)?;
        let veth = VethPair::for_container(id.as_str());

        if let Err(e) = self.plumb(&veth, netns, address).await {
            self.pool.release(address);
            return Err(e);
        }

        let subnet = self.pool.subnet();
        tracing::info!(container_id = %id, %address, host = %veth.host, "Network attached");
        Ok(NetworkBinding {
            host_device: veth.host,
            peer_device: veth.peer,
            container_device: CONTAINER_IFNAME.to_string(),
            address,
            prefix: subnet.prefix(),
            gateway: subnet.gateway(),
        })
    }

    async fn detach(&self, binding: &NetworkBinding) -> SkiffResult<()> {
        binding.veth().delete().await?;
        self.pool.release(binding.address);
        tracing::debug!(host = %binding.host_device, address = %binding.address, "Network detached");
        Ok(())
    }
}
