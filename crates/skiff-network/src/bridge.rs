//! Host bridge management.

use skiff_common::{SkiffError, SkiffResult};

use crate::cmd::{self, is_already_exists};
use crate::ipam::Subnet;

/// A Linux bridge on the host acting as the containers' gateway.
#[derive(Debug, Clone)]
pub struct Bridge {
    name: String,
}

impl Bridge {
    /// Reference a bridge by name without touching the host.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Bridge device name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn failure(&self, reason: String) -> SkiffError {
        SkiffError::DeviceCreateFailure {
            device: self.name.clone(),
            reason,
        }
    }

    /// Whether the bridge exists on the host.
    pub async fn exists(&self) -> bool {
        cmd::ip(&["link", "show", &self.name]).await.is_ok()
    }

    /// Create the bridge if missing, give it the gateway address and bring it up.
    ///
    /// Safe to call for every container; existing state is left as is.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::DeviceCreateFailure`] if the bridge cannot be
    /// created or configured.
    pub async fn ensure(&self, subnet: &Subnet) -> SkiffResult<()> {
        if !self.exists().await {
            tracing::debug!(bridge = %self.name, "Creating bridge");
            if let Err(e) = cmd::ip(&["link", "add", "name", &self.name, "type", "bridge"]).await
            {
                // another engine instance may have won the race
                if !is_already_exists(&e) {
                    return Err(self.failure(e));
                }
            }
        }

        let gateway = subnet.cidr_for(subnet.gateway());
        if let Err(e) = cmd::ip(&["addr", "add", &gateway, "dev", &self.name]).await {
            if !is_already_exists(&e) {
                return Err(self.failure(e));
            }
        }

        cmd::ip(&["link", "set", &self.name, "up"])
            .await
            .map_err(|e| self.failure(e))
    }

    /// Enslave `interface` to the bridge.
    ///
    /// # Errors
    ///
    /// Returns [`SkiffError::DeviceCreateFailure`] naming the interface.
    pub async fn add_interface(&self, interface: &str) -> SkiffResult<()> {
        tracing::debug!(bridge = %self.name, interface, "Adding interface to bridge");
        cmd::ip(&["link", "set", interface, "master", &self.name])
            .await
            .map_err(|reason| SkiffError::DeviceCreateFailure {
                device: interface.to_string(),
                reason,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn nonexistent_bridge() {
        assert!(!Bridge::new("skiff-none-42").exists().await);
    }
}
