//! The per-VM aggregate owning guest state for the agent's lifetime.

use crate::config::AgentConfig;
use crate::error::Result;
use crate::network::netlink::{Netlink, RtNetlink};
use crate::network::Network;
use std::sync::Arc;
use tracing::info;

/// Guest-side sandbox.
///
/// Device handlers receive it by reference but never mutate it; the network
/// reconciler is the only writer of its state.
pub struct Sandbox {
    network: Network,
}

impl Sandbox {
    /// Build a sandbox over an existing kernel handle.
    pub fn new(netlink: Arc<dyn Netlink>, config: &AgentConfig) -> Self {
        Self {
            network: Network::new(netlink, config.paths.resolv_conf.clone()),
        }
    }

    /// Build a sandbox backed by rtnetlink. Must run inside a tokio runtime.
    pub fn connect(config: &AgentConfig) -> Result<Self> {
        let netlink = RtNetlink::connect()?;
        info!("sandbox created");
        Ok(Self::new(Arc::new(netlink), config))
    }

    pub fn network(&self) -> &Network {
        &self.network
    }
}
