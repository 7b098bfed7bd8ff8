//! Declarative network reconciliation.
//!
//! [`Network`] drives the guest's interfaces and routes towards the state
//! the host declares. Interfaces are identified by MAC address since names
//! change across hotplug and rename; routes are identified by device name.
//!
//! Two locks partition the state: one for interfaces, one for routes. Every
//! mutator holds its lock for the whole operation. Nothing is rolled back on
//! failure; instead the reconciling calls return a [`ReconcileError`]
//! carrying the kernel state re-read after the failure.

pub mod netlink;

use crate::error::{finish_with_cleanup, AgentError, ReconcileError, Result};
use ipnetwork::IpNetwork;
use netlink::{KernelRoute, Link, NewLink, Netlink};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Address family of an [`IpAddress`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpFamily {
    #[default]
    V4,
    V6,
}

/// An address assigned to an interface. `mask` is the prefix length.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpAddress {
    #[serde(default)]
    pub family: IpFamily,
    pub address: String,
    pub mask: String,
}

impl IpAddress {
    fn to_network(&self) -> Result<IpNetwork> {
        let cidr = format!("{}/{}", self.address, self.mask);
        cidr.parse()
            .map_err(|e| AgentError::invalid(format!("could not parse {cidr:?}: {e}")))
    }
}

/// Interface descriptor exchanged with the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interface {
    /// Device name as known to the host.
    #[serde(default)]
    pub device: String,
    pub name: String,
    #[serde(default)]
    pub ip_addresses: Vec<IpAddress>,
    #[serde(default)]
    pub mtu: u32,
    #[serde(default)]
    pub hw_addr: String,
}

/// Route descriptor exchanged with the host.
///
/// `dest` is a CIDR, or `"default"`/empty for the default route.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    #[serde(default)]
    pub dest: String,
    #[serde(default)]
    pub gateway: String,
    pub device: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub scope: u32,
}

/// Links whose routes survive a table reconciliation.
const LOOPBACK_NAMES: [&str; 2] = ["lo", "::1"];

/// Sandbox network state and its reconciler.
pub struct Network {
    netlink: Arc<dyn Netlink>,
    ifaces: Mutex<HashMap<String, Interface>>,
    routes: Mutex<Vec<Route>>,
    dns: Mutex<Vec<String>>,
    resolv_conf: PathBuf,
}

impl Network {
    pub fn new(netlink: Arc<dyn Netlink>, resolv_conf: impl Into<PathBuf>) -> Self {
        Self {
            netlink,
            ifaces: Mutex::new(HashMap::new()),
            routes: Mutex::new(Vec::new()),
            dns: Mutex::new(Vec::new()),
            resolv_conf: resolv_conf.into(),
        }
    }

    // ---------------------------------------------------------------------
    // Interfaces
    // ---------------------------------------------------------------------

    /// Create a virtual link, bring it up and track it by name.
    ///
    /// If bringing the link up fails the link stays in the kernel but is not
    /// tracked.
    pub async fn add_interface(&self, iface: Option<&Interface>) -> Result<Interface> {
        let mut ifaces = self.ifaces.lock().await;

        let iface = iface.ok_or_else(|| AgentError::invalid("provided interface is nil"))?;
        let hw_addr = netlink::parse_hw_addr(&iface.hw_addr)?;

        info!(name = %iface.name, mac_address = %iface.hw_addr, mtu = iface.mtu, "adding interface");
        self.netlink
            .link_add(&NewLink {
                name: iface.name.clone(),
                mtu: iface.mtu,
                hw_addr,
            })
            .await?;

        let link = self.netlink.link_by_name(&iface.name).await?;
        self.netlink.link_set_up(link.index).await?;

        ifaces.insert(iface.name.clone(), iface.clone());
        Ok(iface.clone())
    }

    /// Bring down and delete the link with `iface.hw_addr`, then forget it.
    pub async fn remove_interface(&self, iface: Option<&Interface>) -> Result<()> {
        let mut ifaces = self.ifaces.lock().await;
        let iface = iface.ok_or_else(|| AgentError::invalid("provided interface is nil"))?;
        self.remove_interface_locked(&mut ifaces, iface).await
    }

    async fn remove_interface_locked(
        &self,
        ifaces: &mut HashMap<String, Interface>,
        iface: &Interface,
    ) -> Result<()> {
        info!(name = %iface.name, mac_address = %iface.hw_addr, "removing interface");
        let link = self.netlink.link_by_hw_addr(&iface.hw_addr).await?;

        self.netlink.link_set_down(link.index).await?;
        self.netlink.link_del(link.index).await?;

        ifaces.remove(&iface.name);
        ifaces.retain(|_, tracked| !tracked.hw_addr.eq_ignore_ascii_case(&iface.hw_addr));
        Ok(())
    }

    /// Reconfigure the link with `iface.hw_addr` to match `iface`.
    ///
    /// The link is taken down for the update and brought back up afterwards
    /// whatever the outcome. On failure the error carries the link's state
    /// as re-read from the kernel.
    pub async fn update_interface(
        &self,
        iface: Option<&Interface>,
    ) -> std::result::Result<Interface, ReconcileError<Interface>> {
        let mut ifaces = self.ifaces.lock().await;

        let iface = iface.ok_or_else(|| AgentError::invalid("provided interface is nil"))?;
        if iface.hw_addr.is_empty() {
            return Err(AgentError::invalid(format!(
                "interface {:?} has no hardware address",
                iface.device
            ))
            .into());
        }

        info!(
            mac_address = %iface.hw_addr,
            interface_name = %iface.device,
            "getting interface from MAC address"
        );
        let link = self.netlink.link_by_hw_addr(&iface.hw_addr).await?;
        debug!(?link, "link found");

        let updated = self.apply_interface(&link, iface).await;
        let restored = self.netlink.link_set_up(link.index).await;

        match finish_with_cleanup(updated, restored) {
            Ok(()) => {
                ifaces.retain(|_, tracked| !tracked.hw_addr.eq_ignore_ascii_case(&iface.hw_addr));
                ifaces.insert(iface.name.clone(), iface.clone());
                Ok(iface.clone())
            }
            Err(e) => {
                error!(mac_address = %iface.hw_addr, error = %e, "update interface failed");
                let current = self.interface_state(link.index).await.ok();
                Err(ReconcileError::with_current(e, current))
            }
        }
    }

    async fn apply_interface(&self, link: &Link, iface: &Interface) -> Result<()> {
        if link.up {
            self.netlink.link_set_down(link.index).await?;
        }
        self.update_link(link.index, iface).await
    }

    /// Replace the link's IPv4 addresses, then set its name and MTU.
    ///
    /// Stops at the first failing step.
    async fn update_link(&self, index: u32, iface: &Interface) -> Result<()> {
        for addr in self.netlink.addr_list(index).await? {
            debug!(link = index, %addr, "deleting address");
            self.netlink.addr_del(index, addr).await?;
        }

        for addr in &iface.ip_addresses {
            let network = addr.to_network()?;
            debug!(link = index, addr = %network, "adding address");
            self.netlink.addr_add(index, network).await?;
        }

        self.netlink.link_set_name(index, &iface.name).await?;
        self.netlink.link_set_mtu(index, iface.mtu).await
    }

    /// Descriptor of the live link at `index`.
    pub async fn interface_state(&self, index: u32) -> Result<Interface> {
        let link = self.netlink.link_by_index(index).await?;
        self.describe(link).await
    }

    async fn describe(&self, link: Link) -> Result<Interface> {
        let ip_addresses = self
            .netlink
            .addr_list(link.index)
            .await?
            .into_iter()
            .map(|net| IpAddress {
                family: if net.is_ipv6() {
                    IpFamily::V6
                } else {
                    IpFamily::V4
                },
                address: net.ip().to_string(),
                mask: net.prefix().to_string(),
            })
            .collect();

        Ok(Interface {
            device: link.name.clone(),
            name: link.name,
            ip_addresses,
            mtu: link.mtu,
            hw_addr: link.hw_addr,
        })
    }

    /// Descriptors of every live link.
    pub async fn list_interfaces(&self) -> Result<Vec<Interface>> {
        let mut interfaces = Vec::new();
        for link in self.netlink.link_list().await? {
            interfaces.push(self.describe(link).await?);
        }
        Ok(interfaces)
    }

    /// Interfaces added or updated through this sandbox, sorted by name.
    pub async fn tracked_interfaces(&self) -> Vec<Interface> {
        let mut tracked: Vec<Interface> = self.ifaces.lock().await.values().cloned().collect();
        tracked.sort_by(|a, b| a.name.cmp(&b.name));
        tracked
    }

    // ---------------------------------------------------------------------
    // Routes
    // ---------------------------------------------------------------------

    /// Make the main routing table match `requested`.
    ///
    /// Every route not on the loopback link is deleted, then routes without
    /// a gateway are added, then routes with one. On failure the error
    /// carries the routing table as it stands afterwards.
    pub async fn update_routes(
        &self,
        requested: &[Route],
    ) -> std::result::Result<Vec<Route>, ReconcileError<Vec<Route>>> {
        let mut routes = self.routes.lock().await;

        match self.update_routes_locked(&mut routes, requested).await {
            Ok(()) => Ok(requested.to_vec()),
            Err(e) => {
                error!(error = %e, "update routes failed");
                let current = self.current_routes().await.ok();
                Err(ReconcileError::with_current(e, current))
            }
        }
    }

    async fn update_routes_locked(&self, tracked: &mut Vec<Route>, requested: &[Route]) -> Result<()> {
        let links = self.netlink.link_list().await?;
        let name_of = |index: u32| {
            links
                .iter()
                .find(|l| l.index == index)
                .map(|l| l.name.as_str())
        };

        let index_of = |name: &str| links.iter().find(|l| l.name == name).map(|l| l.index);
        // Tracked entry that describes the kernel route, matched on device and destination
        let describes = |tracked: &Route, kernel: &KernelRoute| {
            index_of(&tracked.device) == Some(kernel.link_index)
                && to_kernel_route(tracked, kernel.link_index)
                    .is_ok_and(|r| r.destination == kernel.destination)
        };

        let mut loopback = Vec::new();
        for route in self.netlink.route_list().await? {
            if name_of(route.link_index).is_some_and(|name| LOOPBACK_NAMES.contains(&name)) {
                loopback.push(route);
                continue;
            }
            debug!(?route, "deleting route");
            self.netlink.route_del(&route).await?;
            tracked.retain(|r| !describes(r, &route));
        }
        tracked.retain(|r| LOOPBACK_NAMES.contains(&r.device.as_str()));

        let (direct, via_gateway): (Vec<&Route>, Vec<&Route>) =
            requested.iter().partition(|r| r.gateway.is_empty());
        for route in direct.into_iter().chain(via_gateway) {
            if let Some(index) = index_of(&route.device)
                .filter(|_| LOOPBACK_NAMES.contains(&route.device.as_str()))
            {
                let wanted = to_kernel_route(route, index)?;
                let present = loopback.iter().any(|k| {
                    k.link_index == index
                        && k.destination == wanted.destination
                        && k.gateway == wanted.gateway
                });
                if present {
                    debug!(dest = %route.dest, device = %route.device, "loopback route already present");
                    if !tracked.contains(route) {
                        tracked.push(route.clone());
                    }
                    continue;
                }
            }
            self.update_route_locked(tracked, route, true).await?;
        }

        info!(count = requested.len(), "routes updated");
        Ok(())
    }

    /// Add or remove a single route and keep the tracked list in step.
    pub async fn update_route(&self, route: Option<&Route>, add: bool) -> Result<()> {
        let mut routes = self.routes.lock().await;
        let route = route.ok_or_else(|| AgentError::invalid("provided route is nil"))?;
        self.update_route_locked(&mut routes, route, add).await
    }

    async fn update_route_locked(&self, tracked: &mut Vec<Route>, route: &Route, add: bool) -> Result<()> {
        let link = self.netlink.link_by_name(&route.device).await?;
        let kernel_route = to_kernel_route(route, link.index)?;

        if add {
            self.netlink.route_add(&kernel_route).await.map_err(|e| {
                AgentError::internal(format!(
                    "could not add route dest({})/gw({})/dev({}): {e}",
                    route.dest, route.gateway, route.device
                ))
            })?;
            tracked.push(route.clone());
        } else {
            self.netlink.route_del(&kernel_route).await.map_err(|e| {
                AgentError::internal(format!(
                    "could not remove route dest({})/gw({})/dev({}): {e}",
                    route.dest, route.gateway, route.device
                ))
            })?;
            if let Some(position) = tracked.iter().position(|r| r == route) {
                tracked.remove(position);
            }
        }
        Ok(())
    }

    /// The main routing table as route descriptors.
    pub async fn current_routes(&self) -> Result<Vec<Route>> {
        let links = self.netlink.link_list().await?;
        let routes = self
            .netlink
            .route_list()
            .await?
            .into_iter()
            .map(|route| Route {
                dest: route.destination.map(|d| d.to_string()).unwrap_or_default(),
                gateway: route.gateway.map(|g| g.to_string()).unwrap_or_default(),
                device: links
                    .iter()
                    .find(|l| l.index == route.link_index)
                    .map(|l| l.name.clone())
                    .unwrap_or_default(),
                source: route.source.map(|s| s.to_string()).unwrap_or_default(),
                scope: u32::from(route.scope),
            })
            .collect();
        Ok(routes)
    }

    /// Routes added through this sandbox that are still tracked.
    pub async fn tracked_routes(&self) -> Vec<Route> {
        self.routes.lock().await.clone()
    }

    // ---------------------------------------------------------------------
    // DNS
    // ---------------------------------------------------------------------

    /// Record `servers` and rewrite resolv.conf with one nameserver each.
    pub async fn update_dns(&self, servers: &[String]) -> Result<()> {
        let mut dns = self.dns.lock().await;

        for server in servers {
            server
                .parse::<IpAddr>()
                .map_err(|_| AgentError::invalid(format!("invalid DNS server {server:?}")))?;
        }

        let contents: String = servers
            .iter()
            .map(|server| format!("nameserver {server}\n"))
            .collect();
        tokio::fs::write(&self.resolv_conf, contents).await?;

        info!(servers = ?servers, path = %self.resolv_conf.display(), "DNS updated");
        *dns = servers.to_vec();
        Ok(())
    }

    pub async fn dns(&self) -> Vec<String> {
        self.dns.lock().await.clone()
    }

    // ---------------------------------------------------------------------
    // Global
    // ---------------------------------------------------------------------

    /// Remove every tracked interface, stopping at the first failure.
    pub async fn remove_network(&self) -> Result<()> {
        let mut ifaces = self.ifaces.lock().await;
        let tracked: Vec<Interface> = ifaces.values().cloned().collect();

        for iface in &tracked {
            if let Err(e) = self.remove_interface_locked(&mut ifaces, iface).await {
                warn!(name = %iface.name, error = %e, "network teardown stopped");
                return Err(AgentError::internal(format!(
                    "could not remove network interface {}: {e}",
                    iface.name
                )));
            }
        }
        Ok(())
    }
}

fn parse_optional_ip(field: &str, value: &str) -> Result<Option<IpAddr>> {
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse()
        .map(Some)
        .map_err(|_| AgentError::invalid(format!("could not parse route {field} {value:?}")))
}

fn to_kernel_route(route: &Route, link_index: u32) -> Result<KernelRoute> {
    let destination = match route.dest.as_str() {
        "" | "default" => None,
        dest => {
            let net: IpNetwork = dest.parse().map_err(|e| {
                AgentError::invalid(format!("could not parse route destination {dest}: {e}"))
            })?;
            Some(
                IpNetwork::new(net.network(), net.prefix())
                    .map_err(|e| AgentError::invalid(format!("route destination {dest}: {e}")))?,
            )
        }
    };

    let scope = u8::try_from(route.scope)
        .map_err(|_| AgentError::invalid(format!("route scope {} out of range", route.scope)))?;

    Ok(KernelRoute {
        destination,
        gateway: parse_optional_ip("gateway", &route.gateway)?,
        source: parse_optional_ip("source", &route.source)?,
        scope,
        link_index,
    })
}
